use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

const PRECISION: u8 = 10;

/// HyperLogLog distinct-count sketch over resolved values. Sketches from
/// different blocks merge by taking the register-wise maximum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HyperLogLog {
    p: u8,
    registers: Vec<u8>,
}

impl Default for HyperLogLog {
    fn default() -> Self {
        Self::with_precision(PRECISION)
    }
}

impl HyperLogLog {
    pub fn with_precision(p: u8) -> Self {
        let p = p.clamp(4, 16);
        Self {
            p,
            registers: vec![0u8; 1 << p],
        }
    }

    pub fn insert_hash(&mut self, hash: u64) {
        let idx = (hash >> (64 - self.p)) as usize;
        let w = hash << self.p;
        let rank = (w.leading_zeros() + 1) as u8;
        self.registers[idx] = self.registers[idx].max(rank);
    }

    pub fn insert_int(&mut self, value: i64) {
        self.insert_hash(xxh3_64(&value.to_le_bytes()));
    }

    pub fn insert_str(&mut self, value: &str) {
        self.insert_hash(xxh3_64(value.as_bytes()));
    }

    /// Register-wise maximum. Sketches of different precision never meet:
    /// every sketch in a query is built with the same one.
    pub fn merge(&mut self, other: &HyperLogLog) {
        if self.p != other.p {
            return;
        }
        for (mine, theirs) in self.registers.iter_mut().zip(&other.registers) {
            *mine = (*mine).max(*theirs);
        }
    }

    pub fn estimate(&self) -> u64 {
        let m = self.registers.len() as f64;
        let alpha = match self.registers.len() {
            16 => 0.673,
            32 => 0.697,
            64 => 0.709,
            _ => 0.7213 / (1.0 + 1.079 / m),
        };

        let mut inv_sum = 0.0;
        let mut zeros = 0u32;
        for &r in &self.registers {
            inv_sum += 2f64.powi(-(r as i32));
            if r == 0 {
                zeros += 1;
            }
        }

        let raw = alpha * m * m / inv_sum;

        // Small range correction.
        if raw <= 2.5 * m && zeros > 0 {
            let z = zeros as f64;
            return (m * (m / z).ln()).round().max(0.0) as u64;
        }

        raw.round().max(0.0) as u64
    }
}
