//! 模型定义与文本策略注册表
//!
//! 几何字段（维度、距离函数、最大序列长度、分词器）一旦有向量引用就不可再改；
//! 退役时若仍有引用，必须显式要求级联删除。

use serde::Serialize;

use crate::db::{
    count_embeddings_for_model, delete_definition, delete_flags_for_model, get_definition_by_id,
    get_seeded_definition_by_name, get_strategy_by_id, get_strategy_by_name, insert_definition,
    insert_strategy, list_definitions, list_strategies, mark_definition_retired, revise_strategy,
    update_definition, DbPool, DefinitionPatch, DistanceFunction, EmbeddingDefinition, EntityClass,
    NewDefinition, Strategy, StrategyParams,
};
use crate::error::{StoreError, StoreResult};
use crate::services::EmbeddingTable;
use crate::utils::{validate_dimensions, validate_id, validate_not_empty};

/// 提供方的上限
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderLimits {
    pub max_sequence_length: i64,
    pub max_dimensions: i64,
}

/// 已知提供方；未知提供方拒绝注册
pub fn provider_limits(provider: &str) -> Option<ProviderLimits> {
    let (max_sequence_length, max_dimensions) = match provider {
        "open_ai" => (8191, 3072),
        "hugging_face" => (32768, 8192),
        "cloudflare" => (512, 1024),
        "gemini" => (2048, 3072),
        "mistral" => (8192, 1024),
        "self_hosted" => (32768, 8192),
        _ => return None,
    };
    Some(ProviderLimits {
        max_sequence_length,
        max_dimensions,
    })
}

/// 退役结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetireOutcome {
    /// 没有引用，已直接删除
    Deleted,
    /// 已标记退役，需要后台清理这么多行
    Purging { rows: i64 },
}

struct Preset {
    display_name: &'static str,
    provider: &'static str,
    dimensions: i64,
    max_sequence_length: i64,
    distance_function: DistanceFunction,
    tokenizer_ref: &'static str,
    embed_prompt: &'static str,
    search_prompt: &'static str,
    matryoshka_capable: bool,
}

const PRESETS: &[Preset] = &[
    Preset {
        display_name: "bge-large-en",
        provider: "hugging_face",
        dimensions: 1024,
        max_sequence_length: 512,
        distance_function: DistanceFunction::Cosine,
        tokenizer_ref: "bge_large_en",
        embed_prompt: "",
        search_prompt: "Represent this sentence for searching relevant passages: ",
        matryoshka_capable: false,
    },
    Preset {
        display_name: "bge-m3",
        provider: "hugging_face",
        dimensions: 1024,
        max_sequence_length: 8192,
        distance_function: DistanceFunction::Cosine,
        tokenizer_ref: "bge_m3",
        embed_prompt: "",
        search_prompt: "",
        matryoshka_capable: false,
    },
    Preset {
        display_name: "multilingual-e5-large",
        provider: "hugging_face",
        dimensions: 1024,
        max_sequence_length: 512,
        distance_function: DistanceFunction::Cosine,
        tokenizer_ref: "multilingual_e5_large",
        embed_prompt: "passage: ",
        search_prompt: "query: ",
        matryoshka_capable: false,
    },
    Preset {
        display_name: "text-embedding-3-small",
        provider: "open_ai",
        dimensions: 1536,
        max_sequence_length: 8191,
        distance_function: DistanceFunction::Cosine,
        tokenizer_ref: "cl100k_base",
        embed_prompt: "",
        search_prompt: "",
        matryoshka_capable: true,
    },
    Preset {
        display_name: "text-embedding-3-large",
        provider: "open_ai",
        dimensions: 2000,
        max_sequence_length: 8191,
        distance_function: DistanceFunction::Cosine,
        tokenizer_ref: "cl100k_base",
        embed_prompt: "",
        search_prompt: "",
        matryoshka_capable: true,
    },
    Preset {
        display_name: "gemini-embedding",
        provider: "gemini",
        dimensions: 768,
        max_sequence_length: 2048,
        distance_function: DistanceFunction::Cosine,
        tokenizer_ref: "gemini",
        embed_prompt: "",
        search_prompt: "",
        matryoshka_capable: true,
    },
];

#[derive(Clone)]
pub struct DefinitionRegistry {
    pool: DbPool,
}

impl DefinitionRegistry {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn register(&self, definition: &NewDefinition<'_>) -> StoreResult<i64> {
        validate_new_definition(definition)?;
        let id = insert_definition(&self.pool, definition).await?;
        tracing::info!(
            model_id = id,
            display_name = %definition.display_name,
            provider = %definition.provider,
            dimensions = definition.dimensions,
            "Embedding definition registered"
        );
        Ok(id)
    }

    /// 只返回未退役的定义
    pub async fn get(&self, id: i64) -> StoreResult<EmbeddingDefinition> {
        match get_definition_by_id(&self.pool, id).await? {
            Some(definition) if !definition.is_retired() => Ok(definition),
            _ => Err(StoreError::DefinitionNotFound { kind: "model", id }),
        }
    }

    pub async fn list(&self, provider: Option<&str>) -> StoreResult<Vec<EmbeddingDefinition>> {
        Ok(list_definitions(&self.pool, provider).await?)
    }

    /// 所有实体类别中引用该模型的向量行数
    pub async fn reference_count(&self, id: i64) -> StoreResult<i64> {
        let mut rows = 0;
        for class in EntityClass::ALL {
            rows += count_embeddings_for_model(&self.pool, class, id).await?;
        }
        Ok(rows)
    }

    pub async fn update(
        &self,
        id: i64,
        patch: &DefinitionPatch<'_>,
    ) -> StoreResult<EmbeddingDefinition> {
        let current = self.get(id).await?;
        if let Some(name) = patch.display_name {
            validate_not_empty(name, "display_name")?;
        }

        if patch.touches_geometry() {
            if current.seeded {
                return Err(StoreError::Validation(format!(
                    "预置模型 {} 的几何参数不可修改",
                    current.display_name
                )));
            }
            let rows = self.reference_count(id).await?;
            if rows > 0 {
                return Err(StoreError::DefinitionInUse { model_id: id, rows });
            }
            if let Some(tokenizer_ref) = patch.tokenizer_ref {
                validate_not_empty(tokenizer_ref, "tokenizer_ref")?;
            }
            check_limits(
                &current.provider,
                patch.dimensions.unwrap_or(current.dimensions),
                patch.max_sequence_length.unwrap_or(current.max_sequence_length),
            )?;
        }

        update_definition(&self.pool, id, patch).await?;
        self.get(id).await
    }

    /// 没有引用时直接删除；有引用且 `cascade` 时先标记退役，由调用方安排清理
    pub async fn retire(&self, id: i64, cascade: bool) -> StoreResult<RetireOutcome> {
        let definition = self.get(id).await?;
        if definition.seeded {
            return Err(StoreError::Validation(format!(
                "预置模型 {} 不可退役",
                definition.display_name
            )));
        }

        let rows = self.reference_count(id).await?;
        if rows == 0 {
            delete_flags_for_model(&self.pool, id).await?;
            delete_definition(&self.pool, id).await?;
            tracing::info!(model_id = id, "Embedding definition deleted");
            return Ok(RetireOutcome::Deleted);
        }
        if !cascade {
            return Err(StoreError::DefinitionInUse { model_id: id, rows });
        }

        mark_definition_retired(&self.pool, id).await?;
        tracing::info!(model_id = id, rows, "Embedding definition retired, purge pending");
        Ok(RetireOutcome::Purging { rows })
    }

    /// 分批删除已退役模型的全部向量，最后删除定义本身；返回删除的向量行数
    pub async fn purge(&self, id: i64, batch_size: i64) -> StoreResult<u64> {
        let Some(definition) = get_definition_by_id(&self.pool, id).await? else {
            return Ok(0);
        };
        if !definition.is_retired() {
            return Err(StoreError::Validation(format!("模型 {} 未退役，拒绝清理", id)));
        }

        let mut removed = 0;
        for class in EntityClass::ALL {
            removed += EmbeddingTable::new(self.pool.clone(), class)
                .delete_for_model(id, batch_size)
                .await?;
        }
        delete_flags_for_model(&self.pool, id).await?;
        delete_definition(&self.pool, id).await?;
        tracing::info!(model_id = id, removed, "Retired embedding definition purged");
        Ok(removed)
    }

    /// 幂等地安装预置模型，返回它们的 id
    pub async fn seed_presets(&self) -> StoreResult<Vec<i64>> {
        let mut ids = Vec::with_capacity(PRESETS.len());
        for preset in PRESETS {
            if let Some(existing) = get_seeded_definition_by_name(&self.pool, preset.display_name).await? {
                ids.push(existing.id);
                continue;
            }
            let id = self
                .register(&NewDefinition {
                    display_name: preset.display_name,
                    provider: preset.provider,
                    url: None,
                    version: 1,
                    dimensions: preset.dimensions,
                    max_sequence_length: preset.max_sequence_length,
                    distance_function: preset.distance_function,
                    tokenizer_ref: preset.tokenizer_ref,
                    embed_prompt: preset.embed_prompt,
                    search_prompt: preset.search_prompt,
                    matryoshka_capable: preset.matryoshka_capable,
                    seeded: true,
                })
                .await?;
            ids.push(id);
        }
        Ok(ids)
    }

    // ========== 策略 ==========

    pub async fn register_strategy(&self, name: &str, params: StrategyParams) -> StoreResult<i64> {
        let name = validate_not_empty(name, "strategy name")?;
        validate_strategy_params(&params)?;
        if get_strategy_by_name(&self.pool, name).await?.is_some() {
            return Err(StoreError::Validation(format!("策略已存在: {}", name)));
        }
        Ok(insert_strategy(&self.pool, name, params).await?)
    }

    pub async fn get_strategy(&self, id: i64) -> StoreResult<Strategy> {
        get_strategy_by_id(&self.pool, id)
            .await?
            .ok_or(StoreError::DefinitionNotFound { kind: "strategy", id })
    }

    pub async fn get_strategy_by_name(&self, name: &str) -> StoreResult<Option<Strategy>> {
        Ok(get_strategy_by_name(&self.pool, name).await?)
    }

    pub async fn list_strategies(&self) -> StoreResult<Vec<Strategy>> {
        Ok(list_strategies(&self.pool).await?)
    }

    /// 参数变化时版本 +1；旧版本的向量保留，但会被判定为过期
    pub async fn revise_strategy(&self, id: i64, params: StrategyParams) -> StoreResult<Strategy> {
        self.get_strategy(id).await?;
        validate_strategy_params(&params)?;
        revise_strategy(&self.pool, id, params).await?;
        self.get_strategy(id).await
    }
}

fn validate_new_definition(definition: &NewDefinition<'_>) -> StoreResult<()> {
    validate_not_empty(definition.display_name, "display_name")?;
    validate_not_empty(definition.tokenizer_ref, "tokenizer_ref")?;
    validate_id(definition.version, "version")?;
    check_limits(
        definition.provider,
        definition.dimensions,
        definition.max_sequence_length,
    )
}

fn check_limits(provider: &str, dimensions: i64, max_sequence_length: i64) -> StoreResult<()> {
    validate_dimensions(dimensions)?;
    if max_sequence_length <= 0 {
        return Err(StoreError::Validation(format!(
            "max_sequence_length 必须大于 0: {}",
            max_sequence_length
        )));
    }
    let limits = provider_limits(provider)
        .ok_or_else(|| StoreError::Validation(format!("未知的提供方: {}", provider)))?;
    if dimensions > limits.max_dimensions {
        return Err(StoreError::Validation(format!(
            "{} 最多支持 {} 维，收到 {}",
            provider, limits.max_dimensions, dimensions
        )));
    }
    if max_sequence_length > limits.max_sequence_length {
        return Err(StoreError::Validation(format!(
            "{} 最大序列长度为 {}，收到 {}",
            provider, limits.max_sequence_length, max_sequence_length
        )));
    }
    Ok(())
}

fn validate_strategy_params(params: &StrategyParams) -> StoreResult<()> {
    if params.max_chars <= 0 || params.chunk_size <= 0 {
        return Err(StoreError::Validation("max_chars 与 chunk_size 必须大于 0".into()));
    }
    if params.chunk_overlap < 0 || params.chunk_overlap >= params.chunk_size {
        return Err(StoreError::Validation(format!(
            "chunk_overlap 必须在 [0, chunk_size) 之间: {}",
            params.chunk_overlap
        )));
    }
    Ok(())
}
