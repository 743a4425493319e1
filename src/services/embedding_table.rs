//! 单个实体类别的向量表
//!
//! 维度在这里按模型定义校验，存储层只管字节。

use crate::db::{
    count_embeddings, delete_embeddings_for_entity, delete_embeddings_for_model_batch,
    get_digest, get_embedding, get_embeddings, scan_embeddings, upsert_embedding, DbPool,
    EmbeddingDefinition, EmbeddingRecord, EntityClass, NewEmbedding, Strategy,
};
use crate::error::{StoreError, StoreResult};
use crate::utils::{normalize, validate_finite};

/// 批量写入的一行：(entity_id, digest, vector)
pub type EmbeddingInput = (i64, String, Vec<f32>);

#[derive(Clone)]
pub struct EmbeddingTable {
    pool: DbPool,
    class: EntityClass,
}

impl EmbeddingTable {
    pub fn new(pool: DbPool, class: EntityClass) -> Self {
        Self { pool, class }
    }

    pub fn class(&self) -> EntityClass {
        self.class
    }

    pub async fn upsert(
        &self,
        definition: &EmbeddingDefinition,
        strategy: &Strategy,
        entity_id: i64,
        digest: &str,
        vector: &[f32],
    ) -> StoreResult<bool> {
        check_vector(definition, vector)?;
        let wrote = upsert_embedding(
            &self.pool,
            self.class,
            &new_embedding(definition, strategy, entity_id, digest, vector),
        )
        .await?;
        tracing::debug!(
            entity_class = %self.class,
            entity_id,
            model_id = definition.id,
            strategy_id = strategy.id,
            wrote,
            "Embedding upserted"
        );
        Ok(wrote)
    }

    /// 一个事务内写入多行；任何一行校验失败则整体不写
    pub async fn upsert_batch(
        &self,
        definition: &EmbeddingDefinition,
        strategy: &Strategy,
        rows: &[EmbeddingInput],
    ) -> StoreResult<usize> {
        for (_, _, vector) in rows {
            check_vector(definition, vector)?;
        }

        let mut tx = self.pool.begin().await?;
        let mut written = 0;
        for (entity_id, digest, vector) in rows {
            let params = new_embedding(definition, strategy, *entity_id, digest, vector);
            if upsert_embedding(&mut *tx, self.class, &params).await? {
                written += 1;
            }
        }
        tx.commit().await?;

        tracing::debug!(
            entity_class = %self.class,
            model_id = definition.id,
            strategy_id = strategy.id,
            rows = rows.len(),
            written,
            "Embedding batch upserted"
        );
        Ok(written)
    }

    pub async fn get(
        &self,
        entity_id: i64,
        model_id: i64,
        strategy_id: i64,
    ) -> StoreResult<Option<EmbeddingRecord>> {
        Ok(get_embedding(&self.pool, self.class, entity_id, model_id, strategy_id).await?)
    }

    pub async fn get_many(
        &self,
        model_id: i64,
        strategy_id: i64,
        entity_ids: &[i64],
    ) -> StoreResult<Vec<EmbeddingRecord>> {
        Ok(get_embeddings(&self.pool, self.class, model_id, strategy_id, entity_ids).await?)
    }

    /// 没有向量，或摘要与当前内容不一致，都算过期
    pub async fn is_stale(
        &self,
        entity_id: i64,
        model_id: i64,
        strategy_id: i64,
        current_digest: &str,
    ) -> StoreResult<bool> {
        let stored = get_digest(&self.pool, self.class, entity_id, model_id, strategy_id).await?;
        Ok(stored.as_deref() != Some(current_digest))
    }

    /// 返回被删除行的 (model_id, strategy_id)
    pub async fn delete_for_entity(&self, entity_id: i64) -> StoreResult<Vec<(i64, i64)>> {
        Ok(delete_embeddings_for_entity(&self.pool, self.class, entity_id).await?)
    }

    /// 分批删除某模型的全部向量，返回删除总数
    pub async fn delete_for_model(&self, model_id: i64, batch_size: i64) -> StoreResult<u64> {
        let mut total = 0;
        loop {
            let deleted =
                delete_embeddings_for_model_batch(&self.pool, self.class, model_id, batch_size)
                    .await?;
            if deleted == 0 {
                break;
            }
            total += deleted;
        }
        Ok(total)
    }

    pub async fn bulk_scan(
        &self,
        model_id: i64,
        strategy_id: i64,
        after_entity_id: i64,
        limit: i64,
    ) -> StoreResult<Vec<EmbeddingRecord>> {
        Ok(scan_embeddings(
            &self.pool,
            self.class,
            model_id,
            strategy_id,
            after_entity_id,
            limit,
        )
        .await?)
    }

    pub async fn count(&self, model_id: i64, strategy_id: i64) -> StoreResult<i64> {
        Ok(count_embeddings(&self.pool, self.class, model_id, strategy_id).await?)
    }
}

fn new_embedding<'a>(
    definition: &EmbeddingDefinition,
    strategy: &Strategy,
    entity_id: i64,
    digest: &'a str,
    vector: &'a [f32],
) -> NewEmbedding<'a> {
    NewEmbedding {
        entity_id,
        model_id: definition.id,
        model_version: definition.version,
        strategy_id: strategy.id,
        strategy_version: strategy.version,
        digest,
        vector,
    }
}

/// 长度必须与定义一致，且全部为有限值
pub fn check_vector(definition: &EmbeddingDefinition, vector: &[f32]) -> StoreResult<()> {
    if vector.len() != definition.dims() {
        return Err(StoreError::VectorDimensionMismatch {
            model_id: definition.id,
            expected: definition.dims(),
            actual: vector.len(),
        });
    }
    validate_finite(vector)
}

/// 提供方返回的向量对齐到定义维度。
///
/// 只有声明支持 Matryoshka 的模型允许截断更长的输出（截断后重新归一化），
/// 其余情况长度不符一律报错。
pub fn conform_vector(
    definition: &EmbeddingDefinition,
    mut vector: Vec<f32>,
) -> StoreResult<Vec<f32>> {
    let expected = definition.dims();
    if vector.len() > expected && definition.matryoshka_capable {
        vector.truncate(expected);
        normalize(&mut vector);
    }
    check_vector(definition, &vector)?;
    Ok(vector)
}
