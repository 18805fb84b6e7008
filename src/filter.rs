use std::sync::Arc;

use crate::util::hash::hash;

/// Summarizes a set of keys into a compact probe structure.
///
/// False positives are permitted; false negatives never.
pub trait FilterPolicy: Send + Sync {
    /// Stored in the table's meta-index; readers use it to find the filter
    /// written by a matching policy.
    fn name(&self) -> &str;

    /// Appends a filter summarizing `keys` and returns it.
    fn create_filter(&self, keys: &[Vec<u8>]) -> Vec<u8>;

    /// Whether `key` may be in the set `filter` was built from.
    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool;
}

/// Bloom filter with `k` probes simulated by double hashing.
///
/// Layout: bit array (at least 64 bits, rounded up to whole bytes)
/// followed by a single byte recording `k`.
pub struct BloomFilterPolicy {
    bits_per_key: usize,
    k: u8,
}

impl BloomFilterPolicy {
    pub fn new(bits_per_key: usize) -> Self {
        // k = bits_per_key * ln(2), clamped to a sane probe count.
        let k = ((bits_per_key as f64 * 0.69) as usize).clamp(1, 30) as u8;
        Self { bits_per_key, k }
    }

    fn bloom_hash(key: &[u8]) -> u32 {
        hash(key, 0xbc9f1d34)
    }
}

impl FilterPolicy for BloomFilterPolicy {
    fn name(&self) -> &str {
        "sediment.BuiltinBloomFilter"
    }

    fn create_filter(&self, keys: &[Vec<u8>]) -> Vec<u8> {
        // Short filters have a high false-positive rate; 64 bits minimum.
        let bits = (keys.len() * self.bits_per_key).max(64);
        let bytes = (bits + 7) / 8;
        let bits = bytes * 8;

        let mut filter = vec![0u8; bytes + 1];
        filter[bytes] = self.k;

        for key in keys {
            let mut h = Self::bloom_hash(key);
            let delta = (h >> 17) | (h << 15);
            for _ in 0..self.k {
                let bit = h % bits as u32;
                filter[bit as usize / 8] |= 1 << (bit % 8);
                h = h.wrapping_add(delta);
            }
        }

        filter
    }

    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool {
        if filter.len() < 2 {
            return false;
        }

        let k = filter[filter.len() - 1];
        if k > 30 {
            // Reserved for future encodings; treat as a match.
            return true;
        }

        let bits = (filter.len() - 1) * 8;
        let mut h = Self::bloom_hash(key);
        let delta = (h >> 17) | (h << 15);
        for _ in 0..k {
            let bit = h % bits as u32;
            if filter[bit as usize / 8] & (1 << (bit % 8)) == 0 {
                return false;
            }
            h = h.wrapping_add(delta);
        }
        true
    }
}

/// A process-lifetime bloom policy with the default 10 bits per key.
pub fn bloom_filter() -> Arc<dyn FilterPolicy> {
    static ONCE: std::sync::OnceLock<Arc<BloomFilterPolicy>> = std::sync::OnceLock::new();
    ONCE.get_or_init(|| Arc::new(BloomFilterPolicy::new(10)))
        .clone()
}
