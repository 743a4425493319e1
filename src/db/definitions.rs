//! 模型定义表操作

use super::{DbPool, DefinitionPatch, EmbeddingDefinition, NewDefinition};

const DEFINITION_FIELDS: &str = "id, display_name, provider, url, version, dimensions, max_sequence_length, \
    distance_function, tokenizer_ref, embed_prompt, search_prompt, matryoshka_capable, seeded, retired_at, \
    created_at, updated_at";

pub async fn insert_definition(
    pool: &DbPool,
    params: &NewDefinition<'_>,
) -> Result<i64, sqlx::Error> {
    let result = sqlx::query(
        "INSERT INTO embedding_definitions (\
            display_name, provider, url, version, dimensions, max_sequence_length, distance_function, \
            tokenizer_ref, embed_prompt, search_prompt, matryoshka_capable, seeded\
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(params.display_name)
    .bind(params.provider)
    .bind(params.url)
    .bind(params.version)
    .bind(params.dimensions)
    .bind(params.max_sequence_length)
    .bind(params.distance_function)
    .bind(params.tokenizer_ref)
    .bind(params.embed_prompt)
    .bind(params.search_prompt)
    .bind(params.matryoshka_capable)
    .bind(params.seeded)
    .execute(pool)
    .await?;

    let id = result.last_insert_rowid();
    tracing::debug!(
        model_id = id,
        provider = %params.provider,
        dimensions = params.dimensions,
        distance = params.distance_function.as_str(),
        "Embedding definition created"
    );
    Ok(id)
}

/// 包含已退役的定义
pub async fn get_definition_by_id(
    pool: &DbPool,
    id: i64,
) -> Result<Option<EmbeddingDefinition>, sqlx::Error> {
    let sql = format!("SELECT {} FROM embedding_definitions WHERE id = ?", DEFINITION_FIELDS);
    sqlx::query_as::<_, EmbeddingDefinition>(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub async fn get_seeded_definition_by_name(
    pool: &DbPool,
    display_name: &str,
) -> Result<Option<EmbeddingDefinition>, sqlx::Error> {
    let sql = format!(
        "SELECT {} FROM embedding_definitions WHERE seeded = 1 AND display_name = ?",
        DEFINITION_FIELDS
    );
    sqlx::query_as::<_, EmbeddingDefinition>(&sql)
        .bind(display_name)
        .fetch_optional(pool)
        .await
}

/// 只列出未退役的定义
pub async fn list_definitions(
    pool: &DbPool,
    provider: Option<&str>,
) -> Result<Vec<EmbeddingDefinition>, sqlx::Error> {
    let sql = format!(
        "SELECT {} FROM embedding_definitions \
         WHERE retired_at IS NULL AND (? IS NULL OR provider = ?) \
         ORDER BY id",
        DEFINITION_FIELDS
    );
    sqlx::query_as::<_, EmbeddingDefinition>(&sql)
        .bind(provider)
        .bind(provider)
        .fetch_all(pool)
        .await
}

pub async fn update_definition(
    pool: &DbPool,
    id: i64,
    patch: &DefinitionPatch<'_>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE embedding_definitions SET \
            display_name = COALESCE(?, display_name), \
            url = COALESCE(?, url), \
            embed_prompt = COALESCE(?, embed_prompt), \
            search_prompt = COALESCE(?, search_prompt), \
            dimensions = COALESCE(?, dimensions), \
            max_sequence_length = COALESCE(?, max_sequence_length), \
            distance_function = COALESCE(?, distance_function), \
            tokenizer_ref = COALESCE(?, tokenizer_ref), \
            updated_at = CURRENT_TIMESTAMP \
         WHERE id = ?",
    )
    .bind(patch.display_name)
    .bind(patch.url)
    .bind(patch.embed_prompt)
    .bind(patch.search_prompt)
    .bind(patch.dimensions)
    .bind(patch.max_sequence_length)
    .bind(patch.distance_function)
    .bind(patch.tokenizer_ref)
    .bind(id)
    .execute(pool)
    .await?;
    tracing::debug!(model_id = id, geometry = patch.touches_geometry(), "Embedding definition updated");
    Ok(())
}

pub async fn mark_definition_retired(pool: &DbPool, id: i64) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE embedding_definitions SET retired_at = COALESCE(retired_at, CURRENT_TIMESTAMP), \
         updated_at = CURRENT_TIMESTAMP WHERE id = ?",
    )
    .bind(id)
    .execute(pool)
    .await?;
    tracing::debug!(model_id = id, "Embedding definition retired");
    Ok(())
}

pub async fn delete_definition(pool: &DbPool, id: i64) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM embedding_definitions WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    tracing::debug!(model_id = id, "Embedding definition deleted");
    Ok(())
}
