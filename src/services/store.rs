//! 宿主入口
//!
//! `EmbeddingStore` 把注册表、向量表、索引、查询、回填和维护队列串起来。
//! 模型和策略一律以 id 显式传入，没有进程级的“当前模型”。

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use serde::Serialize;

use super::ann::{IndexManager, PartitionKey, PartitionStats};
use super::backfill::{run_backfill_indexed, BackfillOptions, BackfillReport, LegacySource};
use super::digest::{digest_entity, normalize_text};
use super::embedding_table::{conform_vector, EmbeddingTable};
use super::fragments::FragmentStore;
use super::locks::KeyedLocks;
use super::maintenance::{MaintenanceJob, MaintenanceQueue};
use super::registry::{DefinitionRegistry, RetireOutcome};
use super::search::{Neighbor, SimilarityQuery, SimilarityService};
use super::{ContentSource, Embedder};
use crate::config::StoreConfig;
use crate::db::{
    clear_flag, delete_flags_for_entity, init_pool_with, upsert_flag, DbPool, EmbeddingDefinition,
    EmbeddingRecord, EntityClass, Strategy,
};
use crate::error::{StoreError, StoreResult};

/// ensure_embedded 的结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EnsureOutcome {
    /// 已有向量且摘要一致，没有调用提供方
    Fresh,
    /// 新生成并写入
    Embedded,
    /// 内容不可用，已记录标记
    Skipped { reason: String },
}

type EntityKey = (EntityClass, i64, i64, i64);

pub struct EmbeddingStore {
    pool: DbPool,
    config: StoreConfig,
    registry: DefinitionRegistry,
    index: Arc<IndexManager>,
    search: SimilarityService,
    fragments: FragmentStore,
    maintenance: MaintenanceQueue,
    locks: KeyedLocks<EntityKey>,
}

impl EmbeddingStore {
    /// 按配置打开数据库并启动维护队列
    pub async fn open(mut config: StoreConfig) -> StoreResult<Self> {
        config.apply_defaults()?;
        config.validate()?;
        let path = Path::new(&config.database_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let pool = init_pool_with(
            path,
            config.max_connections,
            Duration::from_secs(config.busy_timeout_secs),
        )
        .await?;
        tracing::info!(path = %path.display(), "Embedding store opened");
        Ok(Self::new(pool, config))
    }

    /// 需要在 tokio 运行时内调用（会启动维护任务）
    pub fn new(pool: DbPool, config: StoreConfig) -> Self {
        let registry = DefinitionRegistry::new(pool.clone());
        let index = Arc::new(IndexManager::new(pool.clone(), config.ann.clone()));
        let search = SimilarityService::new(pool.clone(), index.clone());
        let fragments = FragmentStore::new(pool.clone());
        let maintenance = MaintenanceQueue::spawn(
            index.clone(),
            registry.clone(),
            config.maintenance_buffer,
            config.backfill.batch_size,
        );
        Self {
            pool,
            config,
            registry,
            index,
            search,
            fragments,
            maintenance,
            locks: KeyedLocks::new(),
        }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn registry(&self) -> &DefinitionRegistry {
        &self.registry
    }

    pub fn index(&self) -> &IndexManager {
        &self.index
    }

    pub fn fragments(&self) -> &FragmentStore {
        &self.fragments
    }

    pub fn maintenance(&self) -> &MaintenanceQueue {
        &self.maintenance
    }

    /// 直接写这张表不会标记脏实体，宿主写入走 `upsert`
    pub(crate) fn table(&self, class: EntityClass) -> EmbeddingTable {
        EmbeddingTable::new(self.pool.clone(), class)
    }

    /// 当前内容在该策略下的摘要
    pub async fn digest<C: ContentSource>(
        &self,
        source: &C,
        class: EntityClass,
        entity_id: i64,
        strategy_id: i64,
    ) -> StoreResult<String> {
        let strategy = self.registry.get_strategy(strategy_id).await?;
        let (_, digest) = digest_entity(source, class, entity_id, &strategy).await?;
        Ok(digest)
    }

    /// 向量缺失或过期时调用提供方重新生成；摘要一致时什么都不做。
    /// 同一个 (类别, 实体, 模型, 策略) 同时只有一个调用在执行。
    pub async fn ensure_embedded<C: ContentSource, E: Embedder>(
        &self,
        source: &C,
        embedder: &E,
        class: EntityClass,
        entity_id: i64,
        model_id: i64,
        strategy_id: i64,
    ) -> StoreResult<EnsureOutcome> {
        let definition = self.registry.get(model_id).await?;
        let strategy = self.registry.get_strategy(strategy_id).await?;
        let _guard = self.locks.lock((class, entity_id, model_id, strategy_id)).await;

        let (text, digest) = match digest_entity(source, class, entity_id, &strategy).await {
            Ok(prepared) => prepared,
            Err(StoreError::DigestComputation(reason)) => {
                upsert_flag(&self.pool, class, entity_id, model_id, strategy_id, &reason).await?;
                tracing::warn!(
                    entity_class = %class,
                    entity_id,
                    model_id,
                    strategy_id,
                    %reason,
                    "Entity skipped and flagged"
                );
                return Ok(EnsureOutcome::Skipped { reason });
            }
            Err(err) => return Err(err),
        };

        let table = self.table(class);
        if let Some(existing) = table.get(entity_id, model_id, strategy_id).await? {
            if is_current(&existing, &definition, &strategy, &digest) {
                return Ok(EnsureOutcome::Fresh);
            }
        }

        let input = format!("{}{}", definition.embed_prompt, text);
        let vector = embedder.embed(&input, &definition).await?;
        let vector = conform_vector(&definition, vector)?;
        table
            .upsert(&definition, &strategy, entity_id, &digest, &vector)
            .await?;
        clear_flag(&self.pool, class, entity_id, model_id, strategy_id).await?;
        self.touch(PartitionKey::new(class, model_id, strategy_id), entity_id)
            .await;
        Ok(EnsureOutcome::Embedded)
    }

    /// 并发处理多个实体，并发度由 `embed_concurrency` 限制；结果按 entity_id 排序
    pub async fn ensure_embedded_batch<C: ContentSource, E: Embedder>(
        &self,
        source: &C,
        embedder: &E,
        class: EntityClass,
        entity_ids: &[i64],
        model_id: i64,
        strategy_id: i64,
    ) -> Vec<(i64, StoreResult<EnsureOutcome>)> {
        let mut results: Vec<_> = stream::iter(entity_ids.iter().copied())
            .map(|entity_id| async move {
                let outcome = self
                    .ensure_embedded(source, embedder, class, entity_id, model_id, strategy_id)
                    .await;
                (entity_id, outcome)
            })
            .buffer_unordered(self.config.embed_concurrency.max(1))
            .collect()
            .await;
        results.sort_by_key(|(entity_id, _)| *entity_id);

        let failed = results.iter().filter(|(_, outcome)| outcome.is_err()).count();
        tracing::info!(
            entity_class = %class,
            model_id,
            strategy_id,
            total = results.len(),
            failed,
            "Embedding batch finished"
        );
        results
    }

    /// 宿主自己算好向量时直接写入
    pub async fn upsert(
        &self,
        class: EntityClass,
        entity_id: i64,
        model_id: i64,
        strategy_id: i64,
        digest: &str,
        vector: &[f32],
    ) -> StoreResult<bool> {
        let definition = self.registry.get(model_id).await?;
        let strategy = self.registry.get_strategy(strategy_id).await?;
        let wrote = self
            .table(class)
            .upsert(&definition, &strategy, entity_id, digest, vector)
            .await?;
        if wrote {
            self.touch(PartitionKey::new(class, model_id, strategy_id), entity_id)
                .await;
        }
        Ok(wrote)
    }

    pub async fn get(
        &self,
        class: EntityClass,
        entity_id: i64,
        model_id: i64,
        strategy_id: i64,
    ) -> StoreResult<Option<EmbeddingRecord>> {
        self.table(class).get(entity_id, model_id, strategy_id).await
    }

    /// 没有向量、摘要不同、或模型版本已变化，都算过期
    pub async fn is_stale<C: ContentSource>(
        &self,
        source: &C,
        class: EntityClass,
        entity_id: i64,
        model_id: i64,
        strategy_id: i64,
    ) -> StoreResult<bool> {
        let definition = self.registry.get(model_id).await?;
        let strategy = self.registry.get_strategy(strategy_id).await?;
        let (_, digest) = digest_entity(source, class, entity_id, &strategy).await?;
        let table = self.table(class);
        if table.is_stale(entity_id, model_id, strategy_id, &digest).await? {
            return Ok(true);
        }
        // 摘要一致但模型已升级
        Ok(table
            .get(entity_id, model_id, strategy_id)
            .await?
            .map_or(true, |existing| existing.model_version != definition.version))
    }

    /// 分区尚未发布时安排构建，本次查询走线性扫描
    pub async fn nearest(
        &self,
        class: EntityClass,
        model_id: i64,
        strategy_id: i64,
        query: SimilarityQuery<'_>,
        k: usize,
        exclude: &[i64],
    ) -> StoreResult<Vec<Neighbor>> {
        let definition = self.registry.get(model_id).await?;
        self.registry.get_strategy(strategy_id).await?;

        let key = PartitionKey::new(class, model_id, strategy_id);
        if !self.index.is_published(&key).await {
            self.schedule(MaintenanceJob::RebuildPartition(key)).await;
        }
        self.search
            .nearest(class, &definition, strategy_id, query, k, exclude)
            .await
    }

    /// 文本查询：加上模型的 search_prompt 后嵌入，再按向量查询
    pub async fn nearest_to_text<E: Embedder>(
        &self,
        embedder: &E,
        class: EntityClass,
        model_id: i64,
        strategy_id: i64,
        query_text: &str,
        k: usize,
    ) -> StoreResult<Vec<Neighbor>> {
        let definition = self.registry.get(model_id).await?;
        let text = normalize_text(query_text);
        if text.is_empty() {
            return Err(StoreError::Validation("查询文本为空".into()));
        }
        let input = format!("{}{}", definition.search_prompt, text);
        let vector = embedder.embed(&input, &definition).await?;
        let vector = conform_vector(&definition, vector)?;
        self.nearest(
            class,
            model_id,
            strategy_id,
            SimilarityQuery::Vector(&vector),
            k,
            &[],
        )
        .await
    }

    /// 宿主删除实体后调用：删除该实体在所有模型与策略下的向量和标记，
    /// 返回删除的向量行数。
    pub async fn on_entity_deleted(&self, class: EntityClass, entity_id: i64) -> StoreResult<usize> {
        let removed = self.table(class).delete_for_entity(entity_id).await?;
        for (model_id, strategy_id) in &removed {
            self.touch(PartitionKey::new(class, *model_id, *strategy_id), entity_id)
                .await;
        }
        delete_flags_for_entity(&self.pool, class, entity_id).await?;
        tracing::debug!(entity_class = %class, entity_id, rows = removed.len(), "Entity embeddings deleted");
        Ok(removed.len())
    }

    /// 重新切分文档；旧片段的向量先按实体删除，确保分区能看到这些变动
    pub async fn replace_document(
        &self,
        target_type: &str,
        target_id: i64,
        text: &str,
        strategy_id: i64,
    ) -> StoreResult<(Vec<i64>, Vec<i64>)> {
        let strategy = self.registry.get_strategy(strategy_id).await?;
        self.forget_fragments(target_type, target_id).await?;
        self.fragments
            .replace_document(target_type, target_id, text, &strategy)
            .await
    }

    pub async fn delete_document(&self, target_type: &str, target_id: i64) -> StoreResult<Vec<i64>> {
        self.forget_fragments(target_type, target_id).await?;
        self.fragments.delete_document(target_type, target_id).await
    }

    /// 从旧表回填。复制的行立即进入已发布分区的脏集合；
    /// 只要有新行（不论本次是否跑完），就为对应策略安排分区重建
    pub async fn backfill(
        &self,
        source: &LegacySource,
        target: EntityClass,
        options: Option<BackfillOptions>,
    ) -> StoreResult<BackfillReport> {
        let options =
            options.unwrap_or_else(|| BackfillOptions::with_batch_size(self.config.backfill.batch_size));
        let report = run_backfill_indexed(&self.pool, source, target, &options, &self.index).await?;
        for strategy_id in &report.strategies {
            let key = PartitionKey::new(target, source.model_id, *strategy_id);
            self.schedule(MaintenanceJob::RebuildPartition(key)).await;
        }
        Ok(report)
    }

    /// 为模型在每个类别、每个策略下安排分区重建，返回安排的数量
    pub async fn activate_definition(&self, model_id: i64) -> StoreResult<usize> {
        let definition = self.registry.get(model_id).await?;
        let strategies = self.registry.list_strategies().await?;
        let mut scheduled = 0;
        for class in EntityClass::ALL {
            for strategy in &strategies {
                let key = PartitionKey::new(class, definition.id, strategy.id);
                if self
                    .maintenance
                    .enqueue(MaintenanceJob::RebuildPartition(key))
                    .await?
                {
                    scheduled += 1;
                }
            }
        }
        tracing::info!(model_id, scheduled, "Definition activated");
        Ok(scheduled)
    }

    /// 退役模型；有向量引用且 `cascade` 时在后台分批清理
    pub async fn retire_definition(&self, model_id: i64, cascade: bool) -> StoreResult<RetireOutcome> {
        let outcome = self.registry.retire(model_id, cascade).await?;
        self.index.drop_model(model_id).await;
        if let RetireOutcome::Purging { .. } = outcome {
            self.maintenance
                .enqueue(MaintenanceJob::PurgeDefinition(model_id))
                .await?;
        }
        Ok(outcome)
    }

    pub async fn partition_stats(
        &self,
        class: EntityClass,
        model_id: i64,
        strategy_id: i64,
    ) -> Option<PartitionStats> {
        self.index
            .partition_stats(&PartitionKey::new(class, model_id, strategy_id))
            .await
    }

    /// 等待已入队的维护任务执行完
    pub async fn flush_maintenance(&self) -> StoreResult<()> {
        self.maintenance.flush().await
    }

    pub fn shutdown(&self) {
        self.maintenance.shutdown();
    }

    async fn forget_fragments(&self, target_type: &str, target_id: i64) -> StoreResult<()> {
        for fragment_id in self.fragments.fragment_ids(target_type, target_id).await? {
            self.on_entity_deleted(EntityClass::DocumentFragment, fragment_id)
                .await?;
        }
        Ok(())
    }

    /// 标记脏实体，分区已发布时安排增量刷新
    async fn touch(&self, key: PartitionKey, entity_id: i64) {
        self.index.mark_dirty(key, entity_id);
        if self.index.needs_refresh(&key).await {
            self.schedule(MaintenanceJob::RefreshPartition(key)).await;
        }
    }

    /// 入队失败只记日志
    async fn schedule(&self, job: MaintenanceJob) {
        if let Err(err) = self.maintenance.enqueue(job).await {
            tracing::warn!(?job, error = %err, "Failed to schedule maintenance job");
        }
    }
}

fn is_current(
    existing: &EmbeddingRecord,
    definition: &EmbeddingDefinition,
    strategy: &Strategy,
    digest: &str,
) -> bool {
    existing.digest == digest
        && existing.model_version == definition.version
        && existing.strategy_version == strategy.version
}
