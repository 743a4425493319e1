//! 向量编码与距离计算
//!
//! 向量以小端 f32 BLOB 存储，长度由定义的维度在应用层校验。

use crate::db::DistanceFunction;
use crate::error::{StoreError, StoreResult};

const F32_BYTES: usize = std::mem::size_of::<f32>();

pub fn encode_vector(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * F32_BYTES);
    for value in vector {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

pub fn decode_vector(bytes: &[u8]) -> StoreResult<Vec<f32>> {
    if bytes.len() % F32_BYTES != 0 {
        return Err(StoreError::Validation(format!(
            "向量 BLOB 长度不是 4 的倍数: {}",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(F32_BYTES)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

pub fn l2_norm(a: &[f32]) -> f32 {
    dot(a, a).sqrt()
}

/// 原地归一化；零向量保持不变
pub fn normalize(vector: &mut [f32]) {
    let norm = l2_norm(vector);
    if norm > 0.0 {
        for value in vector.iter_mut() {
            *value /= norm;
        }
    }
}

impl DistanceFunction {
    /// 距离越小越相近
    pub fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            DistanceFunction::Dot => -dot(a, b),
            DistanceFunction::Cosine => {
                let denom = l2_norm(a) * l2_norm(b);
                if denom == 0.0 {
                    1.0
                } else {
                    1.0 - dot(a, b) / denom
                }
            }
            DistanceFunction::L2 => a
                .iter()
                .zip(b.iter())
                .map(|(x, y)| (x - y) * (x - y))
                .sum::<f32>()
                .sqrt(),
        }
    }
}
