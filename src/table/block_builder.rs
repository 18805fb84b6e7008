use std::sync::Arc;

use bytes::BufMut;

use crate::{config::Config, util::coding::put_varint32};

use super::SIZE_U32;

/// Builds the prefix-compressed entry stream of a single block.
///
/// Entry format:
///
/// ```text
///     +--------+------------+-----------+----------------+-------+
///     | shared | non_shared | value_len | key[shared..]  | value |
///     +--------+------------+-----------+----------------+-------+
/// ```
///
/// followed after `finish` by the restart array (`fixed32` offsets plus a
/// `fixed32` count). Keys at restart points store their full bytes
/// (`shared == 0`), which is what makes the restart array binary-searchable.
pub struct BlockBuilder {
    buf: Vec<u8>,
    restarts: Vec<u32>,
    restart_interval: u32,

    counter: u32,
    last_key: Vec<u8>,
    finished: bool,

    config: Arc<Config>,
}

impl BlockBuilder {
    pub fn new(config: Arc<Config>) -> Self {
        let interval = config.block_restart_interval;
        Self::with_restart_interval(config, interval)
    }

    /// The index block uses an interval of 1 so every key is intrinsic.
    pub fn with_restart_interval(config: Arc<Config>, restart_interval: u32) -> Self {
        assert!(restart_interval > 0, "required restart_interval > 0");
        Self {
            buf: Vec::new(),
            restarts: vec![0], // first restart point is at offset 0
            restart_interval,
            counter: 0,
            last_key: Vec::new(),
            finished: false,
            config,
        }
    }

    /// Appends an entry. Keys must arrive in ascending order.
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        assert!(!self.finished, "add after finish");
        assert!(self.counter <= self.restart_interval);
        assert!(
            self.buf.is_empty() || self.config.comparator.compare(key, &self.last_key).is_gt(),
            "keys out of order: {:?} after {:?}",
            key,
            self.last_key,
        );

        let mut shared = 0;
        if self.counter < self.restart_interval {
            let min_len = self.last_key.len().min(key.len());
            while shared < min_len && self.last_key[shared] == key[shared] {
                shared += 1;
            }
        } else {
            self.restarts.push(self.buf.len() as u32);
            self.counter = 0;
        }
        let non_shared = key.len() - shared;

        put_varint32(&mut self.buf, shared as u32);
        put_varint32(&mut self.buf, non_shared as u32);
        put_varint32(&mut self.buf, value.len() as u32);
        self.buf.put(&key[shared..]);
        self.buf.put(value);

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.counter += 1;
    }

    /// Appends the restart array and returns the finished block.
    pub fn finish(&mut self) -> &[u8] {
        assert!(!self.finished);
        for &offset in &self.restarts {
            self.buf.put_u32_le(offset);
        }
        self.buf.put_u32_le(self.restarts.len() as u32);
        self.finished = true;
        &self.buf
    }

    pub fn reset(&mut self) {
        self.buf.clear();
        self.restarts.clear();
        self.restarts.push(0);
        self.counter = 0;
        self.last_key.clear();
        self.finished = false;
    }

    pub fn current_size_estimate(&self) -> usize {
        self.buf.len() + self.restarts.len() * SIZE_U32 + SIZE_U32
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}
