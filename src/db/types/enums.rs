//! 数据库枚举类型定义

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sqlx::Type;

/// 实体类别，每个类别对应一张统一向量表
#[derive(Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Clone, Copy, Type, Serialize, Deserialize)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EntityClass {
    Topic,
    Post,
    DocumentFragment,
}

impl EntityClass {
    pub const ALL: [EntityClass; 3] = [
        EntityClass::Topic,
        EntityClass::Post,
        EntityClass::DocumentFragment,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityClass::Topic => "topic",
            EntityClass::Post => "post",
            EntityClass::DocumentFragment => "document_fragment",
        }
    }

    /// 表名只来自这里的固定集合，SQL 中的值一律走参数绑定
    pub fn table_name(&self) -> &'static str {
        match self {
            EntityClass::Topic => "topic_embeddings",
            EntityClass::Post => "post_embeddings",
            EntityClass::DocumentFragment => "document_fragment_embeddings",
        }
    }
}

impl fmt::Display for EntityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityClass {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "topic" => Ok(EntityClass::Topic),
            "post" => Ok(EntityClass::Post),
            "document_fragment" => Ok(EntityClass::DocumentFragment),
            _ => Err(format!("未知的实体类别: {}", raw)),
        }
    }
}

/// 向量距离函数
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, Type, Serialize, Deserialize)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DistanceFunction {
    /// 负内积（越小越近）
    Dot,
    /// 1 - 余弦相似度
    Cosine,
    /// 欧氏距离
    L2,
}

impl DistanceFunction {
    pub fn as_str(&self) -> &'static str {
        match self {
            DistanceFunction::Dot => "dot",
            DistanceFunction::Cosine => "cosine",
            DistanceFunction::L2 => "l2",
        }
    }
}

impl FromStr for DistanceFunction {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "dot" | "negative_inner_product" => Ok(DistanceFunction::Dot),
            "cosine" | "cosine_distance" => Ok(DistanceFunction::Cosine),
            "l2" | "euclidean" => Ok(DistanceFunction::L2),
            other => Err(format!("不支持的距离函数: {}", other)),
        }
    }
}
