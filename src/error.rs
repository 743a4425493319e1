//! 统一错误类型定义
//!
//! 使用 `thiserror` 简化错误类型定义，
//! 提供 `StoreError` 枚举和 `StoreResult` 类型别名。

use serde::Serialize;
use thiserror::Error;

use crate::db::EntityClass;

/// 向量存储统一错误类型
#[derive(Debug, Error)]
pub enum StoreError {
    /// 数据库错误
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    /// 迁移错误
    #[error("迁移错误: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// 文件操作错误
    #[error("文件操作错误: {0}")]
    Io(#[from] std::io::Error),

    /// JSON 解析错误
    #[error("JSON 错误: {0}")]
    Json(#[from] serde_json::Error),

    /// 验证错误（输入参数不合法）
    #[error("验证失败: {0}")]
    Validation(String),

    /// 未知的模型或策略
    #[error("定义不存在: {kind} (id={id})")]
    DefinitionNotFound { kind: &'static str, id: i64 },

    /// 仍有向量引用该模型，拒绝退役
    #[error("模型仍被 {rows} 条向量引用 (id={model_id})")]
    DefinitionInUse { model_id: i64, rows: i64 },

    /// 提供方返回的向量维度与定义不符
    #[error("向量维度不匹配: model={model_id}, 期望 {expected}, 实际 {actual}")]
    VectorDimensionMismatch {
        model_id: i64,
        expected: usize,
        actual: usize,
    },

    /// 查询实体尚未生成向量
    #[error("向量不存在: {entity_class}#{entity_id} (model={model_id}, strategy={strategy_id})")]
    EmbeddingNotFound {
        entity_class: EntityClass,
        entity_id: i64,
        model_id: i64,
        strategy_id: i64,
    },

    /// 内容为空或无法计算摘要
    #[error("无法计算摘要: {0}")]
    DigestComputation(String),

    /// 回填批次失败（下次运行会自动续传）
    #[error("回填批次失败: {0}")]
    BackfillBatch(String),

    /// ANN 分区不可用，调用方应退化为线性扫描
    #[error("索引分区不可用: {0}")]
    IndexUnavailable(String),

    /// 配置错误
    #[error("配置错误: {0}")]
    Config(String),

    /// 向量提供方错误
    #[error("向量服务错误: {0}")]
    Provider(String),
}

impl StoreError {
    /// 可恢复错误：调用方应降级处理而不是直接失败
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            StoreError::BackfillBatch(_)
                | StoreError::IndexUnavailable(_)
                | StoreError::DigestComputation(_)
        )
    }

    fn kind(&self) -> &'static str {
        match self {
            StoreError::Database(_) => "database",
            StoreError::Migrate(_) => "migrate",
            StoreError::Io(_) => "io",
            StoreError::Json(_) => "json",
            StoreError::Validation(_) => "validation",
            StoreError::DefinitionNotFound { .. } => "definition_not_found",
            StoreError::DefinitionInUse { .. } => "definition_in_use",
            StoreError::VectorDimensionMismatch { .. } => "vector_dimension_mismatch",
            StoreError::EmbeddingNotFound { .. } => "embedding_not_found",
            StoreError::DigestComputation(_) => "digest_computation",
            StoreError::BackfillBatch(_) => "backfill_batch",
            StoreError::IndexUnavailable(_) => "index_unavailable",
            StoreError::Config(_) => "config",
            StoreError::Provider(_) => "provider",
        }
    }
}

impl From<String> for StoreError {
    fn from(s: String) -> Self {
        StoreError::Validation(s)
    }
}

impl From<&str> for StoreError {
    fn from(s: &str) -> Self {
        StoreError::Validation(s.to_string())
    }
}

// ========== Serialize 实现：宿主需要把错误交给前端 ==========

impl Serialize for StoreError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;

        let mut state = serializer.serialize_struct("StoreError", 2)?;
        state.serialize_field("type", self.kind())?;
        state.serialize_field("message", &self.to_string())?;
        state.end()
    }
}

/// 存储层 Result 类型别名
pub type StoreResult<T> = Result<T, StoreError>;

// ========== 扩展 trait：为 Result 添加上下文方法 ==========

/// 为 Result 类型添加错误上下文转换方法
pub trait ResultExt<T> {
    /// 将错误转换为验证错误
    fn validation_err(self, msg: &str) -> StoreResult<T>;

    /// 将错误转换为配置错误
    fn config_err(self, msg: &str) -> StoreResult<T>;

    /// 将错误转换为向量服务错误
    fn provider_err(self, msg: &str) -> StoreResult<T>;
}

impl<T, E: std::fmt::Display> ResultExt<T> for Result<T, E> {
    fn validation_err(self, msg: &str) -> StoreResult<T> {
        self.map_err(|e| StoreError::Validation(format!("{}: {}", msg, e)))
    }

    fn config_err(self, msg: &str) -> StoreResult<T> {
        self.map_err(|e| StoreError::Config(format!("{}: {}", msg, e)))
    }

    fn provider_err(self, msg: &str) -> StoreResult<T> {
        self.map_err(|e| StoreError::Provider(format!("{}: {}", msg, e)))
    }
}
