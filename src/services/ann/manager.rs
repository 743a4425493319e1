//! 分区管理：构建、增量刷新、候选检索
//!
//! 分区只存在内存里，随时可以从向量表重建。发布通过替换 `Arc<Partition>` 完成，
//! 查询要么看到旧分区，要么看到新分区。

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::RwLock;

use super::partition::{Partition, PartitionStats};
use super::quantize::MeanAccumulator;
use super::PartitionKey;
use crate::config::AnnConfig;
use crate::db::{get_embeddings, scan_embeddings, DbPool, EmbeddingRecord};
use crate::error::{StoreError, StoreResult};
use crate::services::locks::{lock_unpoisoned, KeyedLocks};

/// 增量刷新的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// 没有待并入的变动
    Unchanged,
    /// 只重新编码了这么多个实体
    Incremental(usize),
    /// 变动过多或尚未构建，做了全量重建
    Rebuilt,
    /// 被取消，什么都没发布
    Cancelled,
}

pub struct IndexManager {
    pool: DbPool,
    config: AnnConfig,
    partitions: RwLock<HashMap<PartitionKey, Arc<Partition>>>,
    /// 只为已发布或正在构建的分区记录脏实体；没有条目的分区不跟踪写入
    dirty: Mutex<HashMap<PartitionKey, HashSet<i64>>>,
    builds: KeyedLocks<PartitionKey>,
}

impl IndexManager {
    pub fn new(pool: DbPool, config: AnnConfig) -> Self {
        Self {
            pool,
            config,
            partitions: RwLock::new(HashMap::new()),
            dirty: Mutex::new(HashMap::new()),
            builds: KeyedLocks::new(),
        }
    }

    pub fn config(&self) -> &AnnConfig {
        &self.config
    }

    /// 全量重建；取消时返回 `Ok(false)` 且保留旧分区
    pub async fn build_partition(&self, key: PartitionKey, cancel: &AtomicBool) -> StoreResult<bool> {
        let _build = self.builds.lock(key).await;
        let started = Instant::now();
        // 从这里开始的写入会留在脏集合里，发布后仍作为候选
        let drained = self.take_dirty(&key);

        match self.scan_and_encode(key, cancel).await {
            Ok(Some(partition)) => {
                let rows = partition.len();
                let generation = partition.generation();
                self.partitions.write().await.insert(key, Arc::new(partition));
                lock_unpoisoned(&self.dirty).entry(key).or_default();
                tracing::info!(
                    partition = %key,
                    rows,
                    %generation,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Partition published"
                );
                Ok(true)
            }
            Ok(None) => {
                self.abandon_build(&key, drained).await;
                tracing::info!(partition = %key, "Partition build cancelled");
                Ok(false)
            }
            Err(err) => {
                self.abandon_build(&key, drained).await;
                tracing::warn!(partition = %key, error = %err, "Partition build failed");
                Err(err)
            }
        }
    }

    /// 把脏实体并入当前分区；脏行比例超过 drift_ratio 时改为全量重建
    pub async fn refresh_partition(
        &self,
        key: PartitionKey,
        cancel: &AtomicBool,
    ) -> StoreResult<RefreshOutcome> {
        let Some(current) = self.published(&key).await else {
            return self.rebuild_outcome(key, cancel).await;
        };
        let pending = self.pending(&key);
        if pending == 0 {
            return Ok(RefreshOutcome::Unchanged);
        }
        if pending as f64 > self.config.drift_ratio * current.len().max(1) as f64 {
            tracing::debug!(partition = %key, pending, rows = current.len(), "Drift exceeded, rebuilding");
            return self.rebuild_outcome(key, cancel).await;
        }

        let _build = self.builds.lock(key).await;
        // 拿锁期间可能有重建发布了新分区
        let Some(current) = self.published(&key).await else {
            return Ok(RefreshOutcome::Unchanged);
        };
        let changed = self.take_dirty(&key);
        if changed.is_empty() {
            return Ok(RefreshOutcome::Unchanged);
        }
        if cancel.load(Ordering::Relaxed) {
            self.restore_dirty(&key, changed);
            return Ok(RefreshOutcome::Cancelled);
        }

        let ids: Vec<i64> = changed.iter().copied().collect();
        let records = match get_embeddings(&self.pool, key.class, key.model_id, key.strategy_id, &ids).await {
            Ok(records) => records,
            Err(err) => {
                self.restore_dirty(&key, changed);
                return Err(err.into());
            }
        };

        let mut fresh = Vec::with_capacity(records.len());
        for record in &records {
            if let Some(vector) = usable_vector(&key, record, current.dims()) {
                fresh.push((record.entity_id, vector));
            }
        }
        let next = current.with_changes(&changed, &fresh);
        let generation = next.generation();
        self.partitions.write().await.insert(key, Arc::new(next));
        tracing::debug!(
            partition = %key,
            changed = changed.len(),
            reencoded = fresh.len(),
            %generation,
            "Partition refreshed"
        );
        Ok(RefreshOutcome::Incremental(changed.len()))
    }

    /// 粗筛候选：汉明距离最近的 max(k·c, min_candidates) 个，再加上所有脏实体。
    /// 分区未发布时返回 `IndexUnavailable`，调用方退化为线性扫描。
    pub async fn candidates(
        &self,
        key: PartitionKey,
        query: &[f32],
        k: usize,
    ) -> StoreResult<Vec<(i64, u32)>> {
        let partition = self
            .published(&key)
            .await
            .ok_or_else(|| StoreError::IndexUnavailable(format!("分区 {} 尚未构建", key)))?;
        if !partition.is_empty() && partition.dims() != query.len() {
            return Err(StoreError::IndexUnavailable(format!(
                "分区 {} 维度 {} 与查询维度 {} 不一致",
                key,
                partition.dims(),
                query.len()
            )));
        }

        let wanted = k
            .saturating_mul(self.config.overfetch_factor)
            .max(self.config.min_candidates);
        let mut candidates = partition.nearest(query, wanted);

        let seen: HashSet<i64> = candidates.iter().map(|(id, _)| *id).collect();
        let mut extra: Vec<i64> = {
            let dirty = lock_unpoisoned(&self.dirty);
            dirty
                .get(&key)
                .map(|ids| ids.iter().copied().filter(|id| !seen.contains(id)).collect())
                .unwrap_or_default()
        };
        extra.sort_unstable();
        candidates.extend(extra.into_iter().map(|id| (id, u32::MAX)));
        Ok(candidates)
    }

    /// 分区未发布且没有在构建时忽略：之后的构建会直接读到这一行
    pub fn mark_dirty(&self, key: PartitionKey, entity_id: i64) {
        if let Some(ids) = lock_unpoisoned(&self.dirty).get_mut(&key) {
            ids.insert(entity_id);
        }
    }

    pub fn pending(&self, key: &PartitionKey) -> usize {
        lock_unpoisoned(&self.dirty).get(key).map_or(0, HashSet::len)
    }

    pub async fn is_published(&self, key: &PartitionKey) -> bool {
        self.partitions.read().await.contains_key(key)
    }

    pub async fn published(&self, key: &PartitionKey) -> Option<Arc<Partition>> {
        self.partitions.read().await.get(key).cloned()
    }

    pub async fn partition_stats(&self, key: &PartitionKey) -> Option<PartitionStats> {
        let partition = self.published(key).await?;
        Some(PartitionStats {
            generation: partition.generation(),
            rows: partition.len(),
            dimensions: partition.dims(),
            built_at: partition.built_at(),
            pending: self.pending(key),
        })
    }

    /// 已发布且有待并入的变动
    pub async fn needs_refresh(&self, key: &PartitionKey) -> bool {
        self.pending(key) > 0 && self.is_published(key).await
    }

    pub async fn drop_partition(&self, key: &PartitionKey) {
        self.partitions.write().await.remove(key);
        lock_unpoisoned(&self.dirty).remove(key);
    }

    /// 丢弃某模型的全部分区，返回丢弃的分区数
    pub async fn drop_model(&self, model_id: i64) -> usize {
        let dropped = {
            let mut partitions = self.partitions.write().await;
            let before = partitions.len();
            partitions.retain(|key, _| key.model_id != model_id);
            before - partitions.len()
        };
        lock_unpoisoned(&self.dirty).retain(|key, _| key.model_id != model_id);
        tracing::debug!(model_id, dropped, "Model partitions dropped");
        dropped
    }

    async fn rebuild_outcome(&self, key: PartitionKey, cancel: &AtomicBool) -> StoreResult<RefreshOutcome> {
        Ok(if self.build_partition(key, cancel).await? {
            RefreshOutcome::Rebuilt
        } else {
            RefreshOutcome::Cancelled
        })
    }

    /// 两遍游标扫描：第一遍求均值阈值，第二遍编码。每页之间检查取消标记。
    async fn scan_and_encode(
        &self,
        key: PartitionKey,
        cancel: &AtomicBool,
    ) -> StoreResult<Option<Partition>> {
        let page = self.config.scan_batch_size;

        let mut dims = None;
        let mut accumulator: Option<MeanAccumulator> = None;
        let mut cursor = 0;
        loop {
            if cancel.load(Ordering::Relaxed) {
                return Ok(None);
            }
            let records =
                scan_embeddings(&self.pool, key.class, key.model_id, key.strategy_id, cursor, page).await?;
            let Some(last) = records.last() else { break };
            cursor = last.entity_id;

            for record in &records {
                let expected = *dims.get_or_insert(record.dimensions as usize);
                if let Some(vector) = usable_vector(&key, record, expected) {
                    accumulator
                        .get_or_insert_with(|| MeanAccumulator::new(expected))
                        .add(&vector);
                }
            }
        }

        let Some(dims) = dims else {
            return Ok(Some(Partition::new(MeanAccumulator::new(0).finish(), Vec::new(), Vec::new())));
        };
        let quantizer = accumulator
            .map(MeanAccumulator::finish)
            .unwrap_or_else(|| MeanAccumulator::new(dims).finish());

        let mut ids = Vec::new();
        let mut codes = Vec::new();
        let mut cursor = 0;
        loop {
            if cancel.load(Ordering::Relaxed) {
                return Ok(None);
            }
            let records =
                scan_embeddings(&self.pool, key.class, key.model_id, key.strategy_id, cursor, page).await?;
            let Some(last) = records.last() else { break };
            cursor = last.entity_id;

            for record in &records {
                if let Some(vector) = usable_vector(&key, record, dims) {
                    ids.push(record.entity_id);
                    quantizer.encode_into(&vector, &mut codes);
                }
            }
        }

        Ok(Some(Partition::new(quantizer, ids, codes)))
    }

    /// 取走已有的脏实体，并从此刻起继续跟踪该分区的写入
    fn take_dirty(&self, key: &PartitionKey) -> HashSet<i64> {
        lock_unpoisoned(&self.dirty)
            .insert(*key, HashSet::new())
            .unwrap_or_default()
    }

    /// 构建没有发布：旧分区还在就放回脏实体，否则停止跟踪
    async fn abandon_build(&self, key: &PartitionKey, drained: HashSet<i64>) {
        if self.is_published(key).await {
            self.restore_dirty(key, drained);
        } else {
            lock_unpoisoned(&self.dirty).remove(key);
        }
    }

    fn restore_dirty(&self, key: &PartitionKey, ids: HashSet<i64>) {
        if ids.is_empty() {
            return;
        }
        lock_unpoisoned(&self.dirty).entry(*key).or_default().extend(ids);
    }
}

/// 解码失败或维度与分区不符的行不进索引（仍可被线性扫描看到）
fn usable_vector(key: &PartitionKey, record: &EmbeddingRecord, dims: usize) -> Option<Vec<f32>> {
    match record.vector() {
        Ok(vector) if vector.len() == dims => Some(vector),
        Ok(vector) => {
            tracing::warn!(
                partition = %key,
                entity_id = record.entity_id,
                expected = dims,
                actual = vector.len(),
                "Skipping row with unexpected dimensions"
            );
            None
        }
        Err(err) => {
            tracing::warn!(partition = %key, entity_id = record.entity_id, error = %err, "Skipping undecodable row");
            None
        }
    }
}
