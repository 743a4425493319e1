//! 旧表回填
//!
//! 把上一代按模型分表的向量复制进统一表。每批：
//! 1. 按 rowid 游标选出目标表中还不存在的键（NOT EXISTS 反连接）
//! 2. 在一个只覆盖本批的事务里插入，已存在的键保持不动
//!
//! 没有跨批事务，中途失败或取消后再次运行会从头扫描，已复制的键被反连接跳过。

use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;

use super::ann::{IndexManager, PartitionKey};
use crate::db::{
    get_definition_by_id, insert_backfilled_row, legacy_table_exists, list_strategy_ids,
    select_missing_legacy_rows, DbPool, EmbeddingDefinition, EntityClass, LegacyRow,
};
use crate::error::{StoreError, StoreResult};
use crate::utils::validate_table_name;

/// 旧表及其隐含的模型
#[derive(Debug, Clone)]
pub struct LegacySource {
    pub table: String,
    pub model_id: i64,
}

impl LegacySource {
    pub fn new(table: impl Into<String>, model_id: i64) -> Self {
        Self {
            table: table.into(),
            model_id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackfillOptions {
    pub batch_size: i64,
    /// 本次最多跑几批；None 表示直到完成
    pub max_batches: Option<usize>,
    pub cancel: Option<Arc<AtomicBool>>,
}

impl BackfillOptions {
    pub fn with_batch_size(batch_size: i64) -> Self {
        Self {
            batch_size,
            max_batches: None,
            cancel: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BackfillReport {
    /// 最后一批没有选出任何行
    pub completed: bool,
    pub batches: usize,
    pub copied: u64,
    /// 维度不符或策略未知而跳过的行
    pub skipped: u64,
    /// 导致本次提前停止的批次错误
    pub failure: Option<String>,
    /// 有新行写入的策略，回填后需要重建这些分区
    pub strategies: BTreeSet<i64>,
}

pub async fn run_backfill(
    pool: &DbPool,
    source: &LegacySource,
    target: EntityClass,
    options: &BackfillOptions,
) -> StoreResult<BackfillReport> {
    copy_legacy_rows(pool, source, target, options, None).await
}

/// 每批提交后把复制的实体标记到已发布的分区上，查询不必等重建就能看到
pub async fn run_backfill_indexed(
    pool: &DbPool,
    source: &LegacySource,
    target: EntityClass,
    options: &BackfillOptions,
    index: &IndexManager,
) -> StoreResult<BackfillReport> {
    copy_legacy_rows(pool, source, target, options, Some(index)).await
}

async fn copy_legacy_rows(
    pool: &DbPool,
    source: &LegacySource,
    target: EntityClass,
    options: &BackfillOptions,
    index: Option<&IndexManager>,
) -> StoreResult<BackfillReport> {
    let table = validate_table_name(&source.table)?;
    if options.batch_size <= 0 {
        return Err(StoreError::Validation(format!(
            "batch_size 必须大于 0: {}",
            options.batch_size
        )));
    }
    if !legacy_table_exists(pool, table).await? {
        return Err(StoreError::Validation(format!("旧表不存在: {}", table)));
    }
    let definition = get_definition_by_id(pool, source.model_id)
        .await?
        .filter(|d| !d.is_retired())
        .ok_or(StoreError::DefinitionNotFound {
            kind: "model",
            id: source.model_id,
        })?;
    let known_strategies: HashSet<i64> = list_strategy_ids(pool).await?.into_iter().collect();

    let mut report = BackfillReport::default();
    let mut cursor = 0;
    loop {
        if options
            .cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
        {
            tracing::info!(table, batches = report.batches, "Backfill cancelled");
            break;
        }
        if options.max_batches.is_some_and(|max| report.batches >= max) {
            break;
        }

        let rows = match select_missing_legacy_rows(
            pool,
            table,
            target,
            definition.id,
            cursor,
            options.batch_size,
        )
        .await
        {
            Ok(rows) => rows,
            Err(err) => {
                record_failure(&mut report, table, cursor, err);
                break;
            }
        };
        let Some(last) = rows.last() else {
            report.completed = true;
            break;
        };
        let next_cursor = last.source_rowid;

        match copy_batch(pool, target, &definition, &known_strategies, &rows).await {
            Ok(batch) => {
                if let Some(index) = index {
                    for (strategy_id, entity_id) in &batch.copied_keys {
                        let key = PartitionKey::new(target, definition.id, *strategy_id);
                        index.mark_dirty(key, *entity_id);
                    }
                }
                report.batches += 1;
                report.copied += batch.copied;
                report.skipped += batch.skipped;
                report.strategies.extend(batch.strategies);
                cursor = next_cursor;
                tracing::debug!(
                    table,
                    entity_class = %target,
                    cursor,
                    copied = batch.copied,
                    skipped = batch.skipped,
                    "Backfill batch committed"
                );
            }
            Err(err) => {
                record_failure(&mut report, table, cursor, err);
                break;
            }
        }
    }

    tracing::info!(
        table,
        entity_class = %target,
        model_id = definition.id,
        completed = report.completed,
        batches = report.batches,
        copied = report.copied,
        skipped = report.skipped,
        "Backfill finished"
    );
    Ok(report)
}

#[derive(Default)]
struct BatchOutcome {
    copied: u64,
    skipped: u64,
    strategies: BTreeSet<i64>,
    /// (strategy_id, entity_id)
    copied_keys: Vec<(i64, i64)>,
}

async fn copy_batch(
    pool: &DbPool,
    target: EntityClass,
    definition: &EmbeddingDefinition,
    known_strategies: &HashSet<i64>,
    rows: &[LegacyRow],
) -> Result<BatchOutcome, sqlx::Error> {
    let expected_bytes = definition.dims() * std::mem::size_of::<f32>();
    let mut outcome = BatchOutcome::default();

    let mut tx = pool.begin().await?;
    for row in rows {
        if !known_strategies.contains(&row.strategy_id) || row.embeddings.len() != expected_bytes {
            tracing::warn!(
                entity_id = row.entity_id,
                strategy_id = row.strategy_id,
                bytes = row.embeddings.len(),
                expected_bytes,
                "Skipping legacy row"
            );
            outcome.skipped += 1;
            continue;
        }
        if insert_backfilled_row(&mut *tx, target, definition.id, row, definition.dimensions).await? {
            outcome.copied += 1;
            outcome.strategies.insert(row.strategy_id);
            outcome.copied_keys.push((row.strategy_id, row.entity_id));
        }
    }
    tx.commit().await?;
    Ok(outcome)
}

fn record_failure(report: &mut BackfillReport, table: &str, cursor: i64, err: sqlx::Error) {
    let failure = StoreError::BackfillBatch(format!("{} (cursor={}): {}", table, cursor, err));
    tracing::warn!(table, cursor, error = %failure, "Backfill batch failed, will resume on next run");
    report.failure = Some(failure.to_string());
}
