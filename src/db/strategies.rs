use super::{DbPool, Strategy, StrategyParams};

const STRATEGY_FIELDS: &str =
    "id, name, version, max_chars, chunk_size, chunk_overlap, created_at, updated_at";

pub async fn insert_strategy(
    pool: &DbPool,
    name: &str,
    params: StrategyParams,
) -> Result<i64, sqlx::Error> {
    let result = sqlx::query(
        "INSERT INTO embedding_strategies (name, version, max_chars, chunk_size, chunk_overlap) \
         VALUES (?, 1, ?, ?, ?)",
    )
    .bind(name)
    .bind(params.max_chars)
    .bind(params.chunk_size)
    .bind(params.chunk_overlap)
    .execute(pool)
    .await?;

    let id = result.last_insert_rowid();
    tracing::debug!(strategy_id = id, name = %name, "Strategy created");
    Ok(id)
}

pub async fn get_strategy_by_id(pool: &DbPool, id: i64) -> Result<Option<Strategy>, sqlx::Error> {
    let sql = format!("SELECT {} FROM embedding_strategies WHERE id = ?", STRATEGY_FIELDS);
    sqlx::query_as::<_, Strategy>(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub async fn get_strategy_by_name(
    pool: &DbPool,
    name: &str,
) -> Result<Option<Strategy>, sqlx::Error> {
    let sql = format!("SELECT {} FROM embedding_strategies WHERE name = ?", STRATEGY_FIELDS);
    sqlx::query_as::<_, Strategy>(&sql)
        .bind(name)
        .fetch_optional(pool)
        .await
}

pub async fn list_strategies(pool: &DbPool) -> Result<Vec<Strategy>, sqlx::Error> {
    let sql = format!("SELECT {} FROM embedding_strategies ORDER BY id", STRATEGY_FIELDS);
    sqlx::query_as::<_, Strategy>(&sql).fetch_all(pool).await
}

pub async fn list_strategy_ids(pool: &DbPool) -> Result<Vec<i64>, sqlx::Error> {
    sqlx::query_scalar("SELECT id FROM embedding_strategies")
        .fetch_all(pool)
        .await
}

/// 参数变化时版本号 +1；参数相同则不动
pub async fn revise_strategy(
    pool: &DbPool,
    id: i64,
    params: StrategyParams,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE embedding_strategies SET \
            version = version + 1, max_chars = ?, chunk_size = ?, chunk_overlap = ?, \
            updated_at = CURRENT_TIMESTAMP \
         WHERE id = ? AND (max_chars != ? OR chunk_size != ? OR chunk_overlap != ?)",
    )
    .bind(params.max_chars)
    .bind(params.chunk_size)
    .bind(params.chunk_overlap)
    .bind(id)
    .bind(params.max_chars)
    .bind(params.chunk_size)
    .bind(params.chunk_overlap)
    .execute(pool)
    .await?;
    tracing::debug!(strategy_id = id, params = ?params, "Strategy revised");
    Ok(())
}
