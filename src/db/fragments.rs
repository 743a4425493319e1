use sqlx::SqliteExecutor;

use super::{DbPool, DocumentFragment, NewFragment};

const FRAGMENT_FIELDS: &str = "id, fragment_number, target_id, target_type, fragment, created_at";

pub async fn insert_fragment<'e, E>(executor: E, params: &NewFragment<'_>) -> Result<i64, sqlx::Error>
where
    E: SqliteExecutor<'e>,
{
    let result = sqlx::query(
        "INSERT INTO document_fragments (fragment_number, target_id, target_type, fragment) \
         VALUES (?, ?, ?, ?)",
    )
    .bind(params.fragment_number)
    .bind(params.target_id)
    .bind(params.target_type)
    .bind(params.fragment)
    .execute(executor)
    .await?;
    Ok(result.last_insert_rowid())
}

pub async fn get_fragment_by_id(
    pool: &DbPool,
    id: i64,
) -> Result<Option<DocumentFragment>, sqlx::Error> {
    let sql = format!("SELECT {} FROM document_fragments WHERE id = ?", FRAGMENT_FIELDS);
    sqlx::query_as::<_, DocumentFragment>(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub async fn list_fragments_for_target(
    pool: &DbPool,
    target_type: &str,
    target_id: i64,
) -> Result<Vec<DocumentFragment>, sqlx::Error> {
    let sql = format!(
        "SELECT {} FROM document_fragments WHERE target_type = ? AND target_id = ? \
         ORDER BY fragment_number",
        FRAGMENT_FIELDS
    );
    sqlx::query_as::<_, DocumentFragment>(&sql)
        .bind(target_type)
        .bind(target_id)
        .fetch_all(pool)
        .await
}

/// 删除目标的全部片段；向量行由外键级联删除。返回被删除的片段 id
pub async fn delete_fragments_for_target<'e, E>(
    executor: E,
    target_type: &str,
    target_id: i64,
) -> Result<Vec<i64>, sqlx::Error>
where
    E: SqliteExecutor<'e>,
{
    sqlx::query_scalar(
        "DELETE FROM document_fragments WHERE target_type = ? AND target_id = ? RETURNING id",
    )
    .bind(target_type)
    .bind(target_id)
    .fetch_all(executor)
    .await
}
