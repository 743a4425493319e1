//! 上一代按模型分表的向量表
//!
//! 旧表每个模型一张（模型由表名隐含），列为
//! `entity_id, model_version, strategy_id, strategy_version, digest, embeddings, created_at, updated_at`。
//! 旧表名无法参数绑定，调用前必须经过 `validate_table_name`。

use sqlx::{FromRow, SqliteExecutor};

use super::{DbPool, EntityClass};

/// 旧表中的一行，附带 rowid 作为回填游标
#[derive(Debug, Clone, FromRow)]
pub struct LegacyRow {
    pub source_rowid: i64,
    pub entity_id: i64,
    pub model_version: i64,
    pub strategy_id: i64,
    pub strategy_version: i64,
    pub digest: Option<String>,
    pub embeddings: Vec<u8>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

pub async fn legacy_table_exists(pool: &DbPool, table: &str) -> Result<bool, sqlx::Error> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(table)
            .fetch_one(pool)
            .await?;
    Ok(count > 0)
}

pub async fn create_legacy_table(pool: &DbPool, table: &str) -> Result<(), sqlx::Error> {
    let sql = format!(
        "CREATE TABLE IF NOT EXISTS {table} (\
            entity_id        INTEGER NOT NULL, \
            model_version    INTEGER NOT NULL, \
            strategy_id      INTEGER NOT NULL, \
            strategy_version INTEGER NOT NULL, \
            digest           TEXT, \
            embeddings       BLOB    NOT NULL, \
            created_at       TEXT, \
            updated_at       TEXT, \
            PRIMARY KEY (strategy_id, entity_id)\
        )"
    );
    sqlx::query(&sql).execute(pool).await?;
    Ok(())
}

/// 游标之后、目标表中尚不存在的旧行（按 rowid 升序）
///
/// 片段类别额外要求片段本身仍然存在，孤儿行不会被选中。
pub async fn select_missing_legacy_rows(
    pool: &DbPool,
    table: &str,
    target: EntityClass,
    model_id: i64,
    after_rowid: i64,
    limit: i64,
) -> Result<Vec<LegacyRow>, sqlx::Error> {
    let owner_filter = match target {
        EntityClass::DocumentFragment => {
            "AND EXISTS (SELECT 1 FROM document_fragments f WHERE f.id = s.entity_id)"
        }
        _ => "",
    };
    let sql = format!(
        "SELECT s.rowid AS source_rowid, s.entity_id, s.model_version, s.strategy_id, \
                s.strategy_version, s.digest, s.embeddings, s.created_at, s.updated_at \
         FROM {table} s \
         WHERE s.rowid > ? \
           AND NOT EXISTS (\
               SELECT 1 FROM {target_table} t \
               WHERE t.model_id = ? AND t.strategy_id = s.strategy_id AND t.entity_id = s.entity_id\
           ) \
           {owner_filter} \
         ORDER BY s.rowid \
         LIMIT ?",
        target_table = target.table_name(),
    );
    sqlx::query_as::<_, LegacyRow>(&sql)
        .bind(after_rowid)
        .bind(model_id)
        .bind(limit)
        .fetch_all(pool)
        .await
}

/// 复制一行到统一表；目标已有同键行时保持不动，返回是否写入
pub async fn insert_backfilled_row<'e, E>(
    executor: E,
    target: EntityClass,
    model_id: i64,
    row: &LegacyRow,
    dimensions: i64,
) -> Result<bool, sqlx::Error>
where
    E: SqliteExecutor<'e>,
{
    let sql = format!(
        "INSERT INTO {} (entity_id, model_id, model_version, strategy_id, strategy_version, \
            digest, dimensions, embedding, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, COALESCE(?, ''), ?, ?, \
            COALESCE(?, CURRENT_TIMESTAMP), COALESCE(?, CURRENT_TIMESTAMP)) \
         ON CONFLICT(model_id, strategy_id, entity_id) DO NOTHING",
        target.table_name()
    );
    let result = sqlx::query(&sql)
        .bind(row.entity_id)
        .bind(model_id)
        .bind(row.model_version)
        .bind(row.strategy_id)
        .bind(row.strategy_version)
        .bind(row.digest.as_deref())
        .bind(dimensions)
        .bind(&row.embeddings)
        .bind(row.created_at.as_deref())
        .bind(row.updated_at.as_deref())
        .execute(executor)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// 测试里用来构造旧表数据
#[cfg(test)]
pub(crate) async fn insert_legacy_row(
    pool: &DbPool,
    table: &str,
    entity_id: i64,
    strategy_id: i64,
    digest: &str,
    vector: &[f32],
) -> Result<(), sqlx::Error> {
    let sql = format!(
        "INSERT INTO {table} (entity_id, model_version, strategy_id, strategy_version, digest, \
            embeddings, created_at, updated_at) \
         VALUES (?, 1, ?, 1, ?, ?, '2023-01-01 00:00:00', '2023-01-01 00:00:00')"
    );
    sqlx::query(&sql)
        .bind(entity_id)
        .bind(strategy_id)
        .bind(digest)
        .bind(crate::utils::encode_vector(vector))
        .execute(pool)
        .await?;
    Ok(())
}
