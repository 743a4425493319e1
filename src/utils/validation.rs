//! 通用验证函数
//!
//! 提供集中的验证逻辑，避免在各服务里重复验证代码

use crate::error::{StoreError, StoreResult};

/// 验证字符串非空（通用）
///
/// 返回 trim 后的字符串引用
pub fn validate_not_empty<'a>(value: &'a str, field_name: &str) -> StoreResult<&'a str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(StoreError::Validation(format!("{} 不能为空", field_name)));
    }
    Ok(trimmed)
}

/// 验证 id 为正数
pub fn validate_id(id: i64, field_name: &str) -> StoreResult<i64> {
    if id <= 0 {
        return Err(StoreError::Validation(format!("无效的 {}: {}", field_name, id)));
    }
    Ok(id)
}

/// 验证向量维度
pub fn validate_dimensions(dimensions: i64) -> StoreResult<i64> {
    if dimensions <= 0 {
        return Err(StoreError::Validation(format!(
            "向量维度必须大于 0: {}",
            dimensions
        )));
    }
    Ok(dimensions)
}

/// 验证向量元素全部为有限值
pub fn validate_finite(vector: &[f32]) -> StoreResult<()> {
    if let Some(pos) = vector.iter().position(|v| !v.is_finite()) {
        return Err(StoreError::Validation(format!(
            "向量第 {} 维不是有限值",
            pos
        )));
    }
    Ok(())
}

/// 验证 SQL 标识符（旧表名等无法参数绑定的部分）
pub fn validate_table_name(name: &str) -> StoreResult<&str> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_lowercase() || c == '_')
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if !valid {
        return Err(StoreError::Validation(format!("非法的表名: {}", name)));
    }
    Ok(name)
}
