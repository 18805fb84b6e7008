use std::{cmp::Ordering, sync::Arc};

use bytes::{Buf, Bytes};

use crate::{
    comparator::Comparator,
    error::{Error, Result},
    iterator::Iterator,
    util::coding::get_varint32,
};

use super::SIZE_U32;

/// A decoded block: entry bytes plus the trailing restart array.
pub struct Block {
    data: Bytes,
    restart_offset: u32,
    restart_count: u32,
}

impl Block {
    pub fn new(data: Bytes) -> Result<Self> {
        if data.len() < SIZE_U32 {
            return Err(Error::corruption("block too short for restart count"));
        }

        let restart_count = (&data[data.len() - SIZE_U32..]).get_u32_le();
        let max_restarts_allowed = (data.len() - SIZE_U32) / SIZE_U32;
        if restart_count as usize > max_restarts_allowed {
            return Err(Error::corruption("restart count overruns block"));
        }

        let restart_offset = (data.len() - (1 + restart_count as usize) * SIZE_U32) as u32;
        Ok(Self {
            data,
            restart_offset,
            restart_count,
        })
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn iter(&self, comparator: Arc<dyn Comparator>) -> BlockIter {
        BlockIter::new(
            self.data.clone(),
            self.restart_offset,
            self.restart_count,
            comparator,
        )
    }
}

/// Restart-aware cursor over one block. Owns a cheap clone of the block
/// bytes, so it may outlive the [`Block`] it came from.
pub struct BlockIter {
    comparator: Arc<dyn Comparator>,
    data: Bytes,

    restart_offset: u32,
    restart_count: u32,

    // Offset of the current entry, or `restart_offset` when exhausted.
    current: u32,
    // Index of the restart block the current entry falls in.
    restart_index: u32,

    key: Vec<u8>,
    shared_len: u32,
    non_shared_len: u32,
    key_offset: u32,
    value_len: u32,

    status: Option<Error>,
}

impl BlockIter {
    fn new(
        data: Bytes,
        restart_offset: u32,
        restart_count: u32,
        comparator: Arc<dyn Comparator>,
    ) -> Self {
        Self {
            comparator,
            data,
            restart_offset,
            restart_count,
            current: restart_offset,
            restart_index: restart_count,
            key: Vec::new(),
            shared_len: 0,
            non_shared_len: 0,
            key_offset: 0,
            value_len: 0,
            status: None,
        }
    }

    fn next_entry_offset(&self) -> u32 {
        self.key_offset + self.non_shared_len + self.value_len
    }

    fn restart_point(&self, index: u32) -> u32 {
        assert!(index < self.restart_count);
        (&self.data[self.restart_offset as usize + index as usize * SIZE_U32..]).get_u32_le()
    }

    fn seek_to_restart_point(&mut self, index: u32) {
        self.key.clear();
        self.restart_index = index;
        self.current = self.restart_point(index);
        // Make next_entry_offset() land on the restart point itself.
        self.key_offset = self.current;
        self.shared_len = 0;
        self.non_shared_len = 0;
        self.value_len = 0;
    }

    /// Decodes the `(shared, non_shared, value_len)` triple at `offset`.
    fn decode_entry_header(&self, offset: usize) -> Option<(u32, u32, u32, usize)> {
        let limit = self.restart_offset as usize;
        if offset >= limit {
            return None;
        }
        let (shared, n1) = get_varint32(&self.data[offset..limit])?;
        let (non_shared, n2) = get_varint32(&self.data[offset + n1..limit])?;
        let (value_len, n3) = get_varint32(&self.data[offset + n1 + n2..limit])?;
        Some((shared, non_shared, value_len, n1 + n2 + n3))
    }

    /// Parses the entry at `next_entry_offset()`. Returns false at the end
    /// of the entry region or on corruption.
    fn parse_next_entry(&mut self) -> bool {
        self.current = self.next_entry_offset();
        if self.current >= self.restart_offset {
            // Reached the restart array: no more entries.
            self.current = self.restart_offset;
            self.restart_index = self.restart_count;
            return false;
        }

        let Some((shared, non_shared, value_len, header_len)) =
            self.decode_entry_header(self.current as usize)
        else {
            self.corruption();
            return false;
        };
        let key_offset = self.current as usize + header_len;
        if key_offset as u64 + non_shared as u64 + value_len as u64 > self.restart_offset as u64
            || (shared as usize) > self.key.len()
        {
            self.corruption();
            return false;
        }

        self.key_offset = key_offset as u32;
        self.shared_len = shared;
        self.non_shared_len = non_shared;
        self.value_len = value_len;

        self.key.truncate(shared as usize);
        self.key
            .extend_from_slice(&self.data[key_offset..key_offset + non_shared as usize]);

        while self.restart_index + 1 < self.restart_count
            && self.restart_point(self.restart_index + 1) < self.current
        {
            self.restart_index += 1;
        }
        true
    }

    fn corruption(&mut self) {
        self.current = self.restart_offset;
        self.restart_index = self.restart_count;
        self.key.clear();
        self.status = Some(Error::corruption("bad entry in block"));
    }
}

impl Iterator for BlockIter {
    fn is_valid(&self) -> bool {
        self.status.is_none() && self.current < self.restart_offset
    }

    fn seek_to_first(&mut self) {
        if self.restart_count == 0 {
            return;
        }
        self.seek_to_restart_point(0);
        self.parse_next_entry();
    }

    fn seek_to_last(&mut self) {
        if self.restart_count == 0 {
            return;
        }
        self.seek_to_restart_point(self.restart_count - 1);
        // Parse forward until the next entry would cross into the
        // restart array.
        while self.parse_next_entry() && self.next_entry_offset() < self.restart_offset {}
    }

    fn seek(&mut self, target: &[u8]) {
        if self.restart_count == 0 {
            return;
        }

        // Binary-search the restart array for the last restart whose key is
        // before the target; restart keys are stored whole.
        let mut left = 0u32;
        let mut right = self.restart_count - 1;
        while left < right {
            let mid = (left + right + 1) / 2;
            let region_offset = self.restart_point(mid);
            let Some((shared, non_shared, _value_len, header_len)) =
                self.decode_entry_header(region_offset as usize)
            else {
                self.corruption();
                return;
            };
            if shared != 0 {
                // Restart keys are stored whole by construction.
                self.corruption();
                return;
            }
            let key_offset = region_offset as usize + header_len;
            if key_offset + non_shared as usize > self.restart_offset as usize {
                self.corruption();
                return;
            }
            let mid_key = &self.data[key_offset..key_offset + non_shared as usize];
            match self.comparator.compare(mid_key, target) {
                Ordering::Less => left = mid,
                _ => right = mid - 1,
            }
        }

        // Linear scan forward to the first key >= target.
        self.seek_to_restart_point(left);
        loop {
            if !self.parse_next_entry() {
                return;
            }
            if self.comparator.compare(&self.key, target) != Ordering::Less {
                return;
            }
        }
    }

    fn next(&mut self) {
        assert!(self.is_valid());
        self.parse_next_entry();
    }

    fn prev(&mut self) {
        assert!(self.is_valid());

        // Back up to a restart point strictly before the current entry,
        // then parse forward to the entry just in front of it.
        let original = self.current;
        while self.restart_point(self.restart_index) >= original {
            if self.restart_index == 0 {
                // Already at the first entry.
                self.current = self.restart_offset;
                self.restart_index = self.restart_count;
                return;
            }
            self.restart_index -= 1;
        }

        self.seek_to_restart_point(self.restart_index);
        while self.parse_next_entry() && self.next_entry_offset() < original {}
    }

    fn key(&self) -> &[u8] {
        assert!(self.is_valid());
        &self.key
    }

    fn value(&self) -> &[u8] {
        assert!(self.is_valid());
        let start = (self.key_offset + self.non_shared_len) as usize;
        &self.data[start..start + self.value_len as usize]
    }

    fn status(&mut self) -> Result<()> {
        match self.status.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use crate::{
        comparator::bytewise,
        config::ConfigBuilder,
        iterator::Iterator,
        table::block_builder::BlockBuilder,
    };

    use super::Block;

    fn build_block(restart_interval: u32, entries: &[(&str, &str)]) -> Block {
        let config = ConfigBuilder::default()
            .block_restart_interval(restart_interval)
            .build();
        let mut builder = BlockBuilder::new(config);
        for (k, v) in entries {
            builder.add(k.as_bytes(), v.as_bytes());
        }
        Block::new(Bytes::copy_from_slice(builder.finish())).unwrap()
    }

    fn collect(block: &Block) -> Vec<(String, String)> {
        let mut iter = block.iter(bytewise());
        iter.seek_to_first();
        let mut out = Vec::new();
        while iter.is_valid() {
            out.push((
                String::from_utf8(iter.key().to_vec()).unwrap(),
                String::from_utf8(iter.value().to_vec()).unwrap(),
            ));
            iter.next();
        }
        iter.status().unwrap();
        out
    }

    #[test]
    fn empty_block() {
        let block = build_block(16, &[]);
        assert!(collect(&block).is_empty());

        let mut iter = block.iter(bytewise());
        iter.seek_to_last();
        assert!(!iter.is_valid());
        iter.seek(b"anything");
        assert!(!iter.is_valid());
    }

    #[test]
    fn malformed_block_is_rejected() {
        assert!(Block::new(Bytes::from_static(&[1, 2])).is_err());
        // Restart count far beyond the block's bytes.
        assert!(Block::new(Bytes::from_static(&[0xff, 0xff, 0xff, 0x7f])).is_err());
    }

    // S5: restart_interval=1 makes every key binary-searchable.
    #[test]
    fn restart_seek() {
        let block = build_block(1, &[("apple", "1"), ("banana", "2"), ("cherry", "3")]);
        let mut iter = block.iter(bytewise());

        iter.seek(b"b");
        assert!(iter.is_valid());
        assert_eq!(iter.key(), b"banana");

        iter.prev();
        assert!(iter.is_valid());
        assert_eq!(iter.key(), b"apple");

        iter.next();
        assert_eq!(iter.key(), b"banana");
    }

    // S6: prefix compression with a restart every 3 entries.
    #[test]
    fn shared_prefix_iteration() {
        let entries = [("abcd", "x"), ("abce", "y"), ("abcf", "z"), ("abdd", "w")];
        let block = build_block(3, &entries);

        let got = collect(&block);
        assert_eq!(
            got,
            entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<Vec<_>>()
        );

        let mut iter = block.iter(bytewise());
        iter.seek(b"abce");
        assert!(iter.is_valid());
        assert_eq!(iter.key(), b"abce");
        assert_eq!(iter.value(), b"y");
    }

    #[test]
    fn seek_edges() {
        let block = build_block(2, &[("b", "1"), ("d", "2"), ("f", "3")]);
        let mut iter = block.iter(bytewise());

        iter.seek(b"a");
        assert_eq!(iter.key(), b"b");
        iter.seek(b"d");
        assert_eq!(iter.key(), b"d");
        iter.seek(b"e");
        assert_eq!(iter.key(), b"f");
        iter.seek(b"g");
        assert!(!iter.is_valid());
    }

    // Property 10 edges: prev from the first entry and next from the last
    // both invalidate.
    #[test]
    fn iteration_edges() {
        let block = build_block(16, &[("a", "1"), ("b", "2")]);
        let mut iter = block.iter(bytewise());

        iter.seek_to_first();
        iter.prev();
        assert!(!iter.is_valid());

        iter.seek_to_last();
        assert_eq!(iter.key(), b"b");
        iter.next();
        assert!(!iter.is_valid());
    }

    #[test]
    fn backward_iteration() {
        let entries = [("a", "1"), ("ab", "2"), ("abc", "3"), ("b", "4"), ("bc", "5")];
        let block = build_block(2, &entries);
        let mut iter = block.iter(bytewise());

        iter.seek_to_last();
        let mut got = Vec::new();
        while iter.is_valid() {
            got.push(String::from_utf8(iter.key().to_vec()).unwrap());
            iter.prev();
        }
        let mut expected: Vec<String> = entries.iter().map(|(k, _)| k.to_string()).collect();
        expected.reverse();
        assert_eq!(got, expected);
    }

    #[test]
    fn large_values_round_trip() {
        let big = "v".repeat(100_000);
        let entries: Vec<(String, String)> = (0..50)
            .map(|i| (format!("key-{i:04}"), format!("{big}-{i}")))
            .collect();
        let config = ConfigBuilder::default().build();
        let mut builder = BlockBuilder::new(config);
        for (k, v) in &entries {
            builder.add(k.as_bytes(), v.as_bytes());
        }
        let block = Block::new(Bytes::copy_from_slice(builder.finish())).unwrap();

        let got = collect(&block);
        assert_eq!(got.len(), entries.len());
        for ((gk, gv), (k, v)) in got.iter().zip(&entries) {
            assert_eq!(gk, k);
            assert_eq!(gv, v);
        }
    }

    #[test]
    fn truncated_entry_sets_corruption_status() {
        // A block whose entry promises more bytes than exist.
        let mut raw = Vec::new();
        raw.extend_from_slice(&[0, 5, 5]); // shared=0, non_shared=5, value=5
        raw.extend_from_slice(b"ab"); // but only 2 bytes of payload
        raw.extend_from_slice(&0u32.to_le_bytes()); // restart 0
        raw.extend_from_slice(&1u32.to_le_bytes()); // count 1
        let block = Block::new(Bytes::from(raw)).unwrap();

        let mut iter = block.iter(bytewise());
        iter.seek_to_first();
        assert!(!iter.is_valid());
        assert!(iter.status().is_err());
    }
}
