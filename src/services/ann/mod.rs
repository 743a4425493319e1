//! 量化近邻索引
//!
//! - `quantize`: 二值量化与汉明距离
//! - `partition`: 单个分区的只读快照
//! - `manager`: 分区的构建、刷新与候选检索

mod manager;
mod partition;
mod quantize;

use std::fmt;

use serde::Serialize;

use crate::db::EntityClass;

pub use manager::{IndexManager, RefreshOutcome};
pub use partition::{Partition, PartitionStats};
pub use quantize::{hamming, BinaryQuantizer, MeanAccumulator};

/// 分区键：每个实体类别各有一张表，所以类别也是键的一部分
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PartitionKey {
    pub class: EntityClass,
    pub model_id: i64,
    pub strategy_id: i64,
}

impl PartitionKey {
    pub fn new(class: EntityClass, model_id: i64, strategy_id: i64) -> Self {
        Self {
            class,
            model_id,
            strategy_id,
        }
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/m{}/s{}", self.class, self.model_id, self.strategy_id)
    }
}

#[cfg(test)]
mod tests;
