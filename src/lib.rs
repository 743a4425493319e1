//! 多模型向量存储
//!
//! 每个实体类别一张向量表，按 (模型, 策略) 分区；摘要判断过期，
//! 二值量化索引粗筛后全精度重排序。

pub mod config;
pub mod db;
pub mod error;
pub mod services;
pub mod utils;

pub use config::StoreConfig;
pub use error::{StoreError, StoreResult};
pub use services::{
    ContentSource, EmbeddingStore, Embedder, EnsureOutcome, Neighbor, SimilarityQuery,
};
