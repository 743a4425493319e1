//! 数据库记录类型定义（FromRow）

use serde::Serialize;
use sqlx::FromRow;

use super::enums::*;
use crate::error::{StoreError, StoreResult};
use crate::utils::decode_vector;

/// 向量模型定义
#[derive(Debug, Clone, FromRow, PartialEq, Serialize)]
pub struct EmbeddingDefinition {
    pub id: i64,
    pub display_name: String,
    pub provider: String,
    pub url: Option<String>,
    pub version: i64,
    pub dimensions: i64,
    pub max_sequence_length: i64,
    pub distance_function: DistanceFunction,
    pub tokenizer_ref: String,
    pub embed_prompt: String,
    pub search_prompt: String,
    pub matryoshka_capable: bool,
    pub seeded: bool,
    pub retired_at: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

impl EmbeddingDefinition {
    pub fn dims(&self) -> usize {
        self.dimensions as usize
    }

    pub fn is_retired(&self) -> bool {
        self.retired_at.is_some()
    }
}

/// 文本策略：实体内容如何变成待嵌入文本
#[derive(Debug, Clone, FromRow, PartialEq, Eq, Serialize)]
pub struct Strategy {
    pub id: i64,
    pub name: String,
    pub version: i64,
    pub max_chars: i64,
    pub chunk_size: i64,
    pub chunk_overlap: i64,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

/// 向量表中的一行
#[derive(Debug, Clone, FromRow, PartialEq)]
pub struct EmbeddingRecord {
    pub entity_id: i64,
    pub model_id: i64,
    pub model_version: i64,
    pub strategy_id: i64,
    pub strategy_version: i64,
    pub digest: String,
    pub dimensions: i64,
    pub embedding: Vec<u8>,
    pub created_at: String,
    pub updated_at: String,
}

impl EmbeddingRecord {
    /// 解码向量并校验长度与记录的维度一致
    pub fn vector(&self) -> StoreResult<Vec<f32>> {
        let vector = decode_vector(&self.embedding)?;
        if vector.len() != self.dimensions as usize {
            return Err(StoreError::VectorDimensionMismatch {
                model_id: self.model_id,
                expected: self.dimensions as usize,
                actual: vector.len(),
            });
        }
        Ok(vector)
    }
}

/// 文档片段（RAG 上传文件切块）
#[derive(Debug, Clone, FromRow, PartialEq, Eq, Serialize)]
pub struct DocumentFragment {
    pub id: i64,
    pub fragment_number: i64,
    pub target_id: i64,
    pub target_type: String,
    pub fragment: String,
    pub created_at: Option<String>,
}

/// 被跳过的实体标记
#[derive(Debug, Clone, FromRow, PartialEq, Eq, Serialize)]
pub struct EmbeddingFlag {
    pub entity_class: EntityClass,
    pub entity_id: i64,
    pub model_id: i64,
    pub strategy_id: i64,
    pub reason: String,
    pub flagged_at: String,
}
