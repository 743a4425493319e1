//! 测试用的宿主替身与数据构造

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};
use tempfile::{tempdir, TempDir};

use super::{ContentSource, EmbeddingStore, Embedder};
use crate::config::StoreConfig;
use crate::db::{
    get_definition_by_id, get_strategy_by_id, init_pool, insert_definition, insert_strategy, DbPool,
    DistanceFunction, EmbeddingDefinition, EntityClass, NewDefinition, Strategy, StrategyParams,
};
use crate::error::{StoreError, StoreResult};
use crate::utils::normalize;

pub(crate) async fn test_pool() -> (TempDir, DbPool) {
    let dir = tempdir().unwrap();
    let pool = init_pool(dir.path().join("vectorvault.sqlite")).await.unwrap();
    (dir, pool)
}

pub(crate) async fn test_store() -> (TempDir, EmbeddingStore) {
    let (dir, pool) = test_pool().await;
    let store = EmbeddingStore::new(pool, StoreConfig::default());
    (dir, store)
}

pub(crate) async fn seed_definition(
    pool: &DbPool,
    dimensions: i64,
    distance_function: DistanceFunction,
) -> EmbeddingDefinition {
    let id = insert_definition(
        pool,
        &NewDefinition {
            display_name: "test-model",
            provider: "hugging_face",
            url: None,
            version: 1,
            dimensions,
            max_sequence_length: 512,
            distance_function,
            tokenizer_ref: "bert",
            embed_prompt: "",
            search_prompt: "query: ",
            matryoshka_capable: false,
            seeded: false,
        },
    )
    .await
    .unwrap();
    get_definition_by_id(pool, id).await.unwrap().unwrap()
}

pub(crate) async fn seed_strategy(pool: &DbPool, name: &str) -> Strategy {
    let id = insert_strategy(
        pool,
        name,
        StrategyParams {
            max_chars: 2000,
            chunk_size: 400,
            chunk_overlap: 40,
        },
    )
    .await
    .unwrap();
    get_strategy_by_id(pool, id).await.unwrap().unwrap()
}

fn random_direction(rng: &mut StdRng, dims: usize) -> Vec<f32> {
    let mut vector: Vec<f32> = (0..dims).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
    normalize(&mut vector);
    vector
}

pub(crate) fn random_unit_vectors(seed: u64, count: usize, dims: usize) -> Vec<Vec<f32>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count).map(|_| random_direction(&mut rng, dims)).collect()
}

/// 以若干随机中心为主题、加噪声生成的单位向量；返回 (向量, 所属簇)
///
/// `spread` 是噪声相对中心的模长，簇内余弦约为 1 / (1 + spread²)。
pub(crate) fn clustered_unit_vectors(
    seed: u64,
    clusters: usize,
    per_cluster: usize,
    dims: usize,
    spread: f32,
) -> Vec<(Vec<f32>, usize)> {
    let mut rng = StdRng::seed_from_u64(seed);
    let centers: Vec<Vec<f32>> = (0..clusters).map(|_| random_direction(&mut rng, dims)).collect();
    let mut out = Vec::with_capacity(clusters * per_cluster);
    for (cluster, center) in centers.iter().enumerate() {
        for _ in 0..per_cluster {
            out.push((jitter(&mut rng, center, spread), cluster));
        }
    }
    out
}

pub(crate) fn jitter(rng: &mut StdRng, center: &[f32], spread: f32) -> Vec<f32> {
    let noise = random_direction(rng, center.len());
    let mut vector: Vec<f32> = center
        .iter()
        .zip(noise.iter())
        .map(|(c, n)| c + spread * n)
        .collect();
    normalize(&mut vector);
    vector
}

/// 内存里的实体文本
#[derive(Default)]
pub(crate) struct MapContent {
    texts: Mutex<HashMap<(EntityClass, i64), String>>,
}

impl MapContent {
    pub fn set(&self, class: EntityClass, entity_id: i64, text: &str) {
        self.texts
            .lock()
            .unwrap()
            .insert((class, entity_id), text.to_string());
    }

    pub fn remove(&self, class: EntityClass, entity_id: i64) {
        self.texts.lock().unwrap().remove(&(class, entity_id));
    }
}

impl ContentSource for MapContent {
    async fn entity_text(&self, class: EntityClass, entity_id: i64) -> StoreResult<Option<String>> {
        Ok(self.texts.lock().unwrap().get(&(class, entity_id)).cloned())
    }
}

/// 由文本哈希确定性生成向量；`output_dims` 可以故意和定义不一致
pub(crate) struct FakeEmbedder {
    output_dims: Option<usize>,
    calls: AtomicUsize,
    fail: bool,
}

impl FakeEmbedder {
    pub fn new() -> Self {
        Self {
            output_dims: None,
            calls: AtomicUsize::new(0),
            fail: false,
        }
    }

    pub fn with_output_dims(dims: usize) -> Self {
        Self {
            output_dims: Some(dims),
            ..Self::new()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn vector_for(text: &str, dims: usize) -> Vec<f32> {
        let seed = Sha256::digest(text.as_bytes());
        let mut seed_bytes = [0u8; 8];
        seed_bytes.copy_from_slice(&seed[..8]);
        let mut rng = StdRng::seed_from_u64(u64::from_le_bytes(seed_bytes));
        random_direction(&mut rng, dims)
    }
}

impl Embedder for FakeEmbedder {
    async fn embed(&self, text: &str, definition: &EmbeddingDefinition) -> StoreResult<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(StoreError::Provider("provider unavailable".into()));
        }
        let dims = self.output_dims.unwrap_or(definition.dims());
        Ok(Self::vector_for(text, dims))
    }
}

/// 精确的暴力近邻（升序距离，同距按 id）
pub(crate) fn brute_force(
    distance: DistanceFunction,
    rows: &[(i64, Vec<f32>)],
    query: &[f32],
    k: usize,
) -> Vec<i64> {
    let mut scored: Vec<(f32, i64)> = rows
        .iter()
        .map(|(id, vector)| (distance.distance(query, vector), *id))
        .collect();
    scored.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
    scored.into_iter().take(k).map(|(_, id)| id).collect()
}
