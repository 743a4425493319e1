//! 统一向量表操作
//!
//! 每个实体类别一张表，表名取自 `EntityClass::table_name()` 的固定集合；
//! 所有值都通过参数绑定传入。

use sqlx::SqliteExecutor;

use super::{DbPool, EmbeddingRecord, EntityClass, NewEmbedding};
use crate::utils::encode_vector;

const EMBEDDING_FIELDS: &str = "entity_id, model_id, model_version, strategy_id, strategy_version, \
    digest, dimensions, embedding, created_at, updated_at";

/// SQLite 默认变量上限之内的 IN 列表长度
const MAX_IN_LIST: usize = 500;

/// 插入或更新一行；内容完全相同时不写入，返回是否发生写入
pub async fn upsert_embedding<'e, E>(
    executor: E,
    class: EntityClass,
    params: &NewEmbedding<'_>,
) -> Result<bool, sqlx::Error>
where
    E: SqliteExecutor<'e>,
{
    let table = class.table_name();
    let sql = format!(
        "INSERT INTO {table} (entity_id, model_id, model_version, strategy_id, strategy_version, digest, dimensions, embedding) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(model_id, strategy_id, entity_id) DO UPDATE SET \
            model_version = excluded.model_version, \
            strategy_version = excluded.strategy_version, \
            digest = excluded.digest, \
            dimensions = excluded.dimensions, \
            embedding = excluded.embedding, \
            updated_at = CURRENT_TIMESTAMP \
         WHERE {table}.digest != excluded.digest \
            OR {table}.embedding != excluded.embedding \
            OR {table}.model_version != excluded.model_version \
            OR {table}.strategy_version != excluded.strategy_version"
    );

    let result = sqlx::query(&sql)
        .bind(params.entity_id)
        .bind(params.model_id)
        .bind(params.model_version)
        .bind(params.strategy_id)
        .bind(params.strategy_version)
        .bind(params.digest)
        .bind(params.vector.len() as i64)
        .bind(encode_vector(params.vector))
        .execute(executor)
        .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn get_embedding(
    pool: &DbPool,
    class: EntityClass,
    entity_id: i64,
    model_id: i64,
    strategy_id: i64,
) -> Result<Option<EmbeddingRecord>, sqlx::Error> {
    let sql = format!(
        "SELECT {} FROM {} WHERE model_id = ? AND strategy_id = ? AND entity_id = ?",
        EMBEDDING_FIELDS,
        class.table_name()
    );
    sqlx::query_as::<_, EmbeddingRecord>(&sql)
        .bind(model_id)
        .bind(strategy_id)
        .bind(entity_id)
        .fetch_optional(pool)
        .await
}

pub async fn get_digest(
    pool: &DbPool,
    class: EntityClass,
    entity_id: i64,
    model_id: i64,
    strategy_id: i64,
) -> Result<Option<String>, sqlx::Error> {
    let sql = format!(
        "SELECT digest FROM {} WHERE model_id = ? AND strategy_id = ? AND entity_id = ?",
        class.table_name()
    );
    sqlx::query_scalar(&sql)
        .bind(model_id)
        .bind(strategy_id)
        .bind(entity_id)
        .fetch_optional(pool)
        .await
}

/// 按 entity_id 批量读取（重排序用），不存在的 id 直接忽略
pub async fn get_embeddings(
    pool: &DbPool,
    class: EntityClass,
    model_id: i64,
    strategy_id: i64,
    entity_ids: &[i64],
) -> Result<Vec<EmbeddingRecord>, sqlx::Error> {
    let mut records = Vec::with_capacity(entity_ids.len());
    for chunk in entity_ids.chunks(MAX_IN_LIST) {
        let placeholders = vec!["?"; chunk.len()].join(", ");
        let sql = format!(
            "SELECT {} FROM {} WHERE model_id = ? AND strategy_id = ? AND entity_id IN ({})",
            EMBEDDING_FIELDS,
            class.table_name(),
            placeholders
        );
        let mut query = sqlx::query_as::<_, EmbeddingRecord>(&sql)
            .bind(model_id)
            .bind(strategy_id);
        for entity_id in chunk {
            query = query.bind(*entity_id);
        }
        records.extend(query.fetch_all(pool).await?);
    }
    Ok(records)
}

/// 按 entity_id 游标分页；并发写入不会打乱已经走过的页
pub async fn scan_embeddings(
    pool: &DbPool,
    class: EntityClass,
    model_id: i64,
    strategy_id: i64,
    after_entity_id: i64,
    limit: i64,
) -> Result<Vec<EmbeddingRecord>, sqlx::Error> {
    let sql = format!(
        "SELECT {} FROM {} \
         WHERE model_id = ? AND strategy_id = ? AND entity_id > ? \
         ORDER BY entity_id \
         LIMIT ?",
        EMBEDDING_FIELDS,
        class.table_name()
    );
    sqlx::query_as::<_, EmbeddingRecord>(&sql)
        .bind(model_id)
        .bind(strategy_id)
        .bind(after_entity_id)
        .bind(limit)
        .fetch_all(pool)
        .await
}

pub async fn count_embeddings(
    pool: &DbPool,
    class: EntityClass,
    model_id: i64,
    strategy_id: i64,
) -> Result<i64, sqlx::Error> {
    let sql = format!(
        "SELECT COUNT(*) FROM {} WHERE model_id = ? AND strategy_id = ?",
        class.table_name()
    );
    sqlx::query_scalar(&sql)
        .bind(model_id)
        .bind(strategy_id)
        .fetch_one(pool)
        .await
}

pub async fn count_embeddings_for_model(
    pool: &DbPool,
    class: EntityClass,
    model_id: i64,
) -> Result<i64, sqlx::Error> {
    let sql = format!("SELECT COUNT(*) FROM {} WHERE model_id = ?", class.table_name());
    sqlx::query_scalar(&sql)
        .bind(model_id)
        .fetch_one(pool)
        .await
}

/// 删除实体在所有 (model, strategy) 下的向量，返回 (model_id, strategy_id) 列表
pub async fn delete_embeddings_for_entity(
    pool: &DbPool,
    class: EntityClass,
    entity_id: i64,
) -> Result<Vec<(i64, i64)>, sqlx::Error> {
    let sql = format!(
        "DELETE FROM {} WHERE entity_id = ? RETURNING model_id, strategy_id",
        class.table_name()
    );
    let keys: Vec<(i64, i64)> = sqlx::query_as(&sql)
        .bind(entity_id)
        .fetch_all(pool)
        .await?;
    tracing::debug!(
        entity_class = %class,
        entity_id,
        removed = keys.len(),
        "Embeddings deleted for entity"
    );
    Ok(keys)
}

/// 分批删除某模型的向量，避免长事务；返回本批删除的行数
pub async fn delete_embeddings_for_model_batch(
    pool: &DbPool,
    class: EntityClass,
    model_id: i64,
    limit: i64,
) -> Result<u64, sqlx::Error> {
    let table = class.table_name();
    let sql = format!(
        "DELETE FROM {table} WHERE rowid IN (SELECT rowid FROM {table} WHERE model_id = ? LIMIT ?)"
    );
    let result = sqlx::query(&sql)
        .bind(model_id)
        .bind(limit)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}
