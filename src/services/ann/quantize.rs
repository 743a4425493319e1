//! 二值量化：每维 1 bit，按分区均值作阈值，打包进 u64

/// 每维一个阈值；大于阈值记 1
#[derive(Debug, Clone, PartialEq)]
pub struct BinaryQuantizer {
    thresholds: Vec<f32>,
}

impl BinaryQuantizer {
    /// 阈值全为 0，即按符号量化
    pub fn sign(dims: usize) -> Self {
        Self {
            thresholds: vec![0.0; dims],
        }
    }

    pub fn from_thresholds(thresholds: Vec<f32>) -> Self {
        Self { thresholds }
    }

    pub fn dims(&self) -> usize {
        self.thresholds.len()
    }

    /// 每个编码占用的 u64 个数
    pub fn words(&self) -> usize {
        self.dims().div_ceil(64)
    }

    pub fn encode(&self, vector: &[f32]) -> Vec<u64> {
        let mut code = Vec::with_capacity(self.words());
        self.encode_into(vector, &mut code);
        code
    }

    /// 追加到 `out` 末尾，分区用一块连续内存存放所有编码
    pub fn encode_into(&self, vector: &[f32], out: &mut Vec<u64>) {
        let start = out.len();
        out.resize(start + self.words(), 0);
        for (i, (value, threshold)) in vector.iter().zip(self.thresholds.iter()).enumerate() {
            if value > threshold {
                out[start + i / 64] |= 1u64 << (i % 64);
            }
        }
    }
}

/// 逐行累加求每维均值，重建时边翻页边喂数据
#[derive(Debug)]
pub struct MeanAccumulator {
    sums: Vec<f64>,
    count: usize,
}

impl MeanAccumulator {
    pub fn new(dims: usize) -> Self {
        Self {
            sums: vec![0.0; dims],
            count: 0,
        }
    }

    pub fn add(&mut self, vector: &[f32]) {
        for (sum, value) in self.sums.iter_mut().zip(vector.iter()) {
            *sum += f64::from(*value);
        }
        self.count += 1;
    }

    pub fn finish(self) -> BinaryQuantizer {
        if self.count == 0 {
            return BinaryQuantizer::sign(self.sums.len());
        }
        let n = self.count as f64;
        BinaryQuantizer::from_thresholds(self.sums.iter().map(|s| (s / n) as f32).collect())
    }
}

pub fn hamming(a: &[u64], b: &[u64]) -> u32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x ^ y).count_ones()).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_quantization_packs_bits() {
        let quantizer = BinaryQuantizer::sign(70);
        let mut vector = vec![-1.0; 70];
        vector[0] = 1.0;
        vector[65] = 0.5;
        let code = quantizer.encode(&vector);
        assert_eq!(code.len(), 2);
        assert_eq!(code[0], 1);
        assert_eq!(code[1], 1 << 1);
    }

    #[test]
    fn mean_threshold_centers_each_dimension() {
        let mut acc = MeanAccumulator::new(2);
        acc.add(&[1.0, 10.0]);
        acc.add(&[3.0, 20.0]);
        let quantizer = acc.finish();
        // 均值 (2, 15)
        assert_eq!(quantizer.encode(&[2.5, 14.0]), vec![0b01]);
        assert_eq!(quantizer.encode(&[1.5, 16.0]), vec![0b10]);
    }

    #[test]
    fn hamming_counts_differing_bits() {
        assert_eq!(hamming(&[0b1011, 0], &[0b0001, 1]), 3);
        assert_eq!(hamming(&[u64::MAX], &[u64::MAX]), 0);
    }
}
