//! 宿主应用提供的能力
//!
//! 存储本身不认识论坛实体，也不发 HTTP 请求：
//! 文本由 `ContentSource` 提供，向量由 `Embedder` 生成。

use std::future::Future;

use crate::db::{EmbeddingDefinition, EntityClass};
use crate::error::StoreResult;

/// 实体文本访问器；实体不存在时返回 `Ok(None)`
pub trait ContentSource: Send + Sync {
    fn entity_text(
        &self,
        class: EntityClass,
        entity_id: i64,
    ) -> impl Future<Output = StoreResult<Option<String>>> + Send;
}

/// 向量提供方；实现方负责调用具体模型服务
pub trait Embedder: Send + Sync {
    fn embed(
        &self,
        text: &str,
        definition: &EmbeddingDefinition,
    ) -> impl Future<Output = StoreResult<Vec<f32>>> + Send;
}
