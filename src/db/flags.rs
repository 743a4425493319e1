//! 跳过实体的运维标记

use super::{DbPool, EmbeddingFlag, EntityClass};

pub async fn upsert_flag(
    pool: &DbPool,
    class: EntityClass,
    entity_id: i64,
    model_id: i64,
    strategy_id: i64,
    reason: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO embedding_flags (entity_class, entity_id, model_id, strategy_id, reason) \
         VALUES (?, ?, ?, ?, ?) \
         ON CONFLICT(entity_class, model_id, strategy_id, entity_id) DO UPDATE SET \
            reason = excluded.reason, flagged_at = CURRENT_TIMESTAMP",
    )
    .bind(class)
    .bind(entity_id)
    .bind(model_id)
    .bind(strategy_id)
    .bind(reason)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn clear_flag(
    pool: &DbPool,
    class: EntityClass,
    entity_id: i64,
    model_id: i64,
    strategy_id: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "DELETE FROM embedding_flags \
         WHERE entity_class = ? AND entity_id = ? AND model_id = ? AND strategy_id = ?",
    )
    .bind(class)
    .bind(entity_id)
    .bind(model_id)
    .bind(strategy_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn list_flags(
    pool: &DbPool,
    class: Option<EntityClass>,
) -> Result<Vec<EmbeddingFlag>, sqlx::Error> {
    sqlx::query_as::<_, EmbeddingFlag>(
        "SELECT entity_class, entity_id, model_id, strategy_id, reason, flagged_at \
         FROM embedding_flags \
         WHERE (? IS NULL OR entity_class = ?) \
         ORDER BY flagged_at DESC, entity_id",
    )
    .bind(class)
    .bind(class)
    .fetch_all(pool)
    .await
}

pub async fn delete_flags_for_entity(
    pool: &DbPool,
    class: EntityClass,
    entity_id: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM embedding_flags WHERE entity_class = ? AND entity_id = ?")
        .bind(class)
        .bind(entity_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn delete_flags_for_model(pool: &DbPool, model_id: i64) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM embedding_flags WHERE model_id = ?")
        .bind(model_id)
        .execute(pool)
        .await?;
    Ok(())
}
