use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes};

use crate::filter::FilterPolicy;

/// Every 2 KiB of data-block offset space maps to one filter group.
const FILTER_BASE_LG: u8 = 11;
const FILTER_BASE: u64 = 1 << FILTER_BASE_LG;

/// Builds the filter block for a whole table.
///
/// Layout after `finish`:
///
/// ```text
///     +-------------+------------------------+---------------------+---------+
///     | filters ... | fixed32 group offsets  | fixed32 array start | base_lg |
///     +-------------+------------------------+---------------------+---------+
/// ```
pub struct FilterBlockBuilder {
    policy: Arc<dyn FilterPolicy>,
    keys: Vec<Vec<u8>>,
    filter_offsets: Vec<u32>,
    buf: Vec<u8>,
}

impl FilterBlockBuilder {
    pub fn new(policy: Arc<dyn FilterPolicy>) -> Self {
        Self {
            policy,
            keys: Vec::new(),
            filter_offsets: Vec::new(),
            buf: Vec::new(),
        }
    }

    /// Called when the table starts a data block at `block_offset`. Groups
    /// the keys seen so far into filters for every base-sized span passed.
    pub fn start_block(&mut self, block_offset: u64) {
        let filter_index = block_offset / FILTER_BASE;
        assert!(filter_index >= self.filter_offsets.len() as u64);
        while filter_index > self.filter_offsets.len() as u64 {
            self.generate_filter();
        }
    }

    pub fn add_key(&mut self, key: &[u8]) {
        self.keys.push(key.to_vec());
    }

    pub fn finish(&mut self) -> &[u8] {
        if !self.keys.is_empty() {
            self.generate_filter();
        }

        let array_start = self.buf.len() as u32;
        for &offset in &self.filter_offsets {
            self.buf.put_u32_le(offset);
        }
        self.buf.put_u32_le(array_start);
        self.buf.put_u8(FILTER_BASE_LG);
        &self.buf
    }

    fn generate_filter(&mut self) {
        self.filter_offsets.push(self.buf.len() as u32);
        if self.keys.is_empty() {
            // Span with no keys: the offset alone records an empty filter.
            return;
        }
        let filter = self.policy.create_filter(&self.keys);
        self.buf.extend_from_slice(&filter);
        self.keys.clear();
    }
}

pub struct FilterBlockReader {
    policy: Arc<dyn FilterPolicy>,
    data: Bytes,
    base_lg: u8,
    /// Byte offset of the group offset array.
    array_start: usize,
    groups: usize,
}

impl FilterBlockReader {
    pub fn new(policy: Arc<dyn FilterPolicy>, data: Bytes) -> Self {
        let mut this = Self {
            policy,
            data,
            base_lg: 0,
            array_start: 0,
            groups: 0,
        };
        if this.data.len() < 5 {
            return this;
        }

        this.base_lg = this.data[this.data.len() - 1];
        let array_start = (&this.data[this.data.len() - 5..]).get_u32_le() as usize;
        if array_start + 5 > this.data.len() {
            return this;
        }
        this.array_start = array_start;
        this.groups = (this.data.len() - 5 - array_start) / 4;
        this
    }

    pub fn key_may_match(&self, block_offset: u64, key: &[u8]) -> bool {
        let index = (block_offset >> self.base_lg) as usize;
        if index < self.groups {
            let start =
                (&self.data[self.array_start + index * 4..]).get_u32_le() as usize;
            let limit =
                (&self.data[self.array_start + (index + 1) * 4..]).get_u32_le() as usize;
            if start == limit {
                // An empty filter covers no keys at all.
                return false;
            }
            if start < limit && limit <= self.array_start {
                return self.policy.key_may_match(key, &self.data[start..limit]);
            }
        }
        // Out of range or malformed offsets: a miss here would be a false
        // negative, so claim a match.
        true
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::{Buf, BufMut, Bytes};

    use crate::{filter::FilterPolicy, util::hash::hash};

    use super::{FilterBlockBuilder, FilterBlockReader, FILTER_BASE_LG};

    /// Stores raw hashes so tests can reason about exact membership.
    struct TestHashFilter;

    impl FilterPolicy for TestHashFilter {
        fn name(&self) -> &str {
            "TestHashFilter"
        }

        fn create_filter(&self, keys: &[Vec<u8>]) -> Vec<u8> {
            let mut filter = Vec::with_capacity(keys.len() * 4);
            for key in keys {
                filter.put_u32_le(hash(key, 1));
            }
            filter
        }

        fn key_may_match(&self, key: &[u8], mut filter: &[u8]) -> bool {
            let h = hash(key, 1);
            while filter.len() >= 4 {
                if filter.get_u32_le() == h {
                    return true;
                }
            }
            false
        }
    }

    fn reader_over(block: &[u8]) -> FilterBlockReader {
        FilterBlockReader::new(Arc::new(TestHashFilter), Bytes::copy_from_slice(block))
    }

    #[test]
    fn empty_builder() {
        let mut builder = FilterBlockBuilder::new(Arc::new(TestHashFilter));
        let block = builder.finish();
        assert_eq!(block, &[0, 0, 0, 0, FILTER_BASE_LG]);

        let reader = reader_over(block);
        assert!(reader.key_may_match(0, b"foo"));
        assert!(reader.key_may_match(100000, b"foo"));
    }

    #[test]
    fn single_group() {
        let mut builder = FilterBlockBuilder::new(Arc::new(TestHashFilter));
        builder.start_block(100);
        builder.add_key(b"foo");
        builder.add_key(b"bar");
        builder.add_key(b"box");
        builder.start_block(200);
        builder.add_key(b"box");
        builder.start_block(300);
        builder.add_key(b"hello");
        let block = builder.finish().to_vec();

        let reader = reader_over(&block);
        assert!(reader.key_may_match(100, b"foo"));
        assert!(reader.key_may_match(100, b"bar"));
        assert!(reader.key_may_match(100, b"box"));
        assert!(reader.key_may_match(100, b"hello"));
        assert!(!reader.key_may_match(100, b"missing"));
        assert!(!reader.key_may_match(100, b"other"));
    }

    #[test]
    fn multiple_groups() {
        let mut builder = FilterBlockBuilder::new(Arc::new(TestHashFilter));

        // First group.
        builder.start_block(0);
        builder.add_key(b"foo");
        builder.start_block(2000);
        builder.add_key(b"bar");

        // Second group.
        builder.start_block(3100);
        builder.add_key(b"box");

        // Third group is empty.

        // Last group.
        builder.start_block(9000);
        builder.add_key(b"box");
        builder.add_key(b"hello");

        let block = builder.finish().to_vec();
        let reader = reader_over(&block);

        assert!(reader.key_may_match(0, b"foo"));
        assert!(reader.key_may_match(2000, b"bar"));
        assert!(!reader.key_may_match(0, b"box"));
        assert!(!reader.key_may_match(0, b"hello"));

        assert!(reader.key_may_match(3100, b"box"));
        assert!(!reader.key_may_match(3100, b"foo"));
        assert!(!reader.key_may_match(3100, b"bar"));
        assert!(!reader.key_may_match(3100, b"hello"));

        // The empty group matches nothing.
        assert!(!reader.key_may_match(4100, b"box"));
        assert!(!reader.key_may_match(4100, b"foo"));

        assert!(reader.key_may_match(9000, b"box"));
        assert!(reader.key_may_match(9000, b"hello"));
        assert!(!reader.key_may_match(9000, b"foo"));
        assert!(!reader.key_may_match(9000, b"bar"));
    }

    // Out-of-range groups must err on the side of a match.
    #[test]
    fn out_of_range_group_matches() {
        let mut builder = FilterBlockBuilder::new(Arc::new(TestHashFilter));
        builder.start_block(0);
        builder.add_key(b"foo");
        let block = builder.finish().to_vec();

        let reader = reader_over(&block);
        assert!(reader.key_may_match(1 << 30, b"anything"));
    }

    #[test]
    fn truncated_block_matches_conservatively() {
        let reader = reader_over(&[1, 2, 3]);
        assert!(reader.key_may_match(0, b"anything"));
    }
}
