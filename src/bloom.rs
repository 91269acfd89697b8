//! Immutable bloom filter over series IDs. Built once when a fileset volume
//! is opened and shared by reference between the original seeker and all of
//! its concurrent clones; reads require no synchronization.

use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;

/// Target false positive rate used when sizing from an expected entry count.
pub const BLOOM_FP_RATE: f64 = 0.01;

/// A fixed-size bloom filter using double hashing (two independent 64-bit
/// hashes combined as `h1 + i*h2`). Construction is single-threaded; once
/// built the filter is immutable and safe to share across readers.
#[derive(Debug, Clone)]
pub struct BloomFilter {
    bits: Vec<u64>,
    num_bits: u64,
    num_hashes: u32,
}

impl BloomFilter {
    /// Sizes the filter for `expected_entries` at [`BLOOM_FP_RATE`].
    pub fn with_expected_entries(expected_entries: usize) -> Self {
        let n = expected_entries.max(1) as f64;
        let ln2 = std::f64::consts::LN_2;
        let num_bits = (-(n * BLOOM_FP_RATE.ln()) / (ln2 * ln2)).ceil() as u64;
        let num_hashes = ((num_bits as f64 / n) * ln2).ceil().max(1.0) as u32;
        Self::with_bits(num_bits.max(64), num_hashes)
    }

    pub fn with_bits(num_bits: u64, num_hashes: u32) -> Self {
        let words = num_bits.div_ceil(64) as usize;
        Self {
            bits: vec![0; words.max(1)],
            num_bits: num_bits.max(1),
            num_hashes: num_hashes.max(1),
        }
    }

    pub fn insert(&mut self, key: &[u8]) {
        let (h1, h2) = hash_pair(key);
        for i in 0..self.num_hashes {
            let bit = (h1.wrapping_add((i as u64).wrapping_mul(h2))) % self.num_bits;
            self.bits[(bit / 64) as usize] |= 1 << (bit % 64);
        }
    }

    /// May return false positives, never false negatives.
    pub fn contains(&self, key: &[u8]) -> bool {
        let (h1, h2) = hash_pair(key);
        for i in 0..self.num_hashes {
            let bit = (h1.wrapping_add((i as u64).wrapping_mul(h2))) % self.num_bits;
            if self.bits[(bit / 64) as usize] & (1 << (bit % 64)) == 0 {
                return false;
            }
        }
        true
    }
}

fn hash_pair(key: &[u8]) -> (u64, u64) {
    let mut h1 = DefaultHasher::new();
    h1.write(key);
    let first = h1.finish();

    let mut h2 = DefaultHasher::new();
    h2.write_u64(first);
    h2.write(key);
    // An even second hash would cycle over a subset of bits; force odd.
    (first, h2.finish() | 1)
}
