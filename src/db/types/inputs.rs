//! 数据库输入类型定义（用于插入/创建）

use super::enums::*;

/// 新建模型定义输入
#[derive(Debug, Clone)]
pub struct NewDefinition<'a> {
    pub display_name: &'a str,
    pub provider: &'a str,
    pub url: Option<&'a str>,
    pub version: i64,
    pub dimensions: i64,
    pub max_sequence_length: i64,
    pub distance_function: DistanceFunction,
    pub tokenizer_ref: &'a str,
    pub embed_prompt: &'a str,
    pub search_prompt: &'a str,
    pub matryoshka_capable: bool,
    pub seeded: bool,
}

/// 修改模型定义；几何字段只能在没有向量引用时修改
#[derive(Debug, Clone, Default)]
pub struct DefinitionPatch<'a> {
    pub display_name: Option<&'a str>,
    pub url: Option<&'a str>,
    pub embed_prompt: Option<&'a str>,
    pub search_prompt: Option<&'a str>,
    pub dimensions: Option<i64>,
    pub max_sequence_length: Option<i64>,
    pub distance_function: Option<DistanceFunction>,
    pub tokenizer_ref: Option<&'a str>,
}

impl DefinitionPatch<'_> {
    pub fn touches_geometry(&self) -> bool {
        self.dimensions.is_some()
            || self.max_sequence_length.is_some()
            || self.distance_function.is_some()
            || self.tokenizer_ref.is_some()
    }
}

/// 策略参数（参与摘要计算）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrategyParams {
    pub max_chars: i64,
    pub chunk_size: i64,
    pub chunk_overlap: i64,
}

/// 新建向量行输入
pub struct NewEmbedding<'a> {
    pub entity_id: i64,
    pub model_id: i64,
    pub model_version: i64,
    pub strategy_id: i64,
    pub strategy_version: i64,
    pub digest: &'a str,
    pub vector: &'a [f32],
}

/// 新建文档片段输入
pub struct NewFragment<'a> {
    pub fragment_number: i64,
    pub target_id: i64,
    pub target_type: &'a str,
    pub fragment: &'a str,
}
