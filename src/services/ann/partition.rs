use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::quantize::{hamming, BinaryQuantizer};

/// 已发布的分区快照，发布后只读；更新总是生成新快照再整体替换
#[derive(Debug)]
pub struct Partition {
    generation: Uuid,
    quantizer: BinaryQuantizer,
    ids: Vec<i64>,
    codes: Vec<u64>,
    built_at: DateTime<Utc>,
}

impl Partition {
    pub(crate) fn new(quantizer: BinaryQuantizer, ids: Vec<i64>, codes: Vec<u64>) -> Self {
        debug_assert_eq!(ids.len() * quantizer.words(), codes.len());
        Self {
            generation: Uuid::new_v4(),
            quantizer,
            ids,
            codes,
            built_at: Utc::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn dims(&self) -> usize {
        self.quantizer.dims()
    }

    pub fn generation(&self) -> Uuid {
        self.generation
    }

    pub fn built_at(&self) -> DateTime<Utc> {
        self.built_at
    }

    pub fn contains(&self, entity_id: i64) -> bool {
        self.ids.contains(&entity_id)
    }

    /// 汉明距离最小的 n 个 (entity_id, hamming)，距离相同按 id 排
    pub fn nearest(&self, query: &[f32], n: usize) -> Vec<(i64, u32)> {
        if self.is_empty() || n == 0 {
            return Vec::new();
        }
        let query_code = self.quantizer.encode(query);
        let words = self.quantizer.words();

        let mut scored: Vec<(u32, i64)> = self
            .ids
            .iter()
            .zip(self.codes.chunks_exact(words.max(1)))
            .map(|(id, code)| (hamming(&query_code, code), *id))
            .collect();

        if n < scored.len() {
            scored.select_nth_unstable(n - 1);
            scored.truncate(n);
        }
        scored.sort_unstable();
        scored.into_iter().map(|(distance, id)| (id, distance)).collect()
    }

    /// 沿用当前阈值，去掉 `changed` 中的旧编码并追加 `fresh` 的新编码
    pub(crate) fn with_changes(&self, changed: &HashSet<i64>, fresh: &[(i64, Vec<f32>)]) -> Self {
        let words = self.quantizer.words();
        let mut ids = Vec::with_capacity(self.ids.len() + fresh.len());
        let mut codes = Vec::with_capacity((self.ids.len() + fresh.len()) * words);

        for (id, code) in self.ids.iter().zip(self.codes.chunks_exact(words.max(1))) {
            if !changed.contains(id) {
                ids.push(*id);
                codes.extend_from_slice(code);
            }
        }
        for (id, vector) in fresh {
            ids.push(*id);
            self.quantizer.encode_into(vector, &mut codes);
        }

        Self::new(self.quantizer.clone(), ids, codes)
    }
}

/// 分区概况，供宿主展示
#[derive(Debug, Clone, Serialize)]
pub struct PartitionStats {
    pub generation: Uuid,
    pub rows: usize,
    pub dimensions: usize,
    pub built_at: DateTime<Utc>,
    /// 发布后又有变动、尚未并入编码的实体数
    pub pending: usize,
}
