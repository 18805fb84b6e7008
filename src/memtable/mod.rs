//! In-memory write buffer: an arena plus an ordered index over encoded
//! entries.
//!
//! Entry format, allocated contiguously in the arena:
//!
//! ```text
//!     +-----------------------+--------------+--------------------+-------+
//!     | varint32 key_len + 8  | internal key | varint32 value_len | value |
//!     +-----------------------+--------------+--------------------+-------+
//! ```

pub mod skiplist;

use std::{cmp::Ordering, sync::Arc};

use bytes::{BufMut, Bytes};

use crate::{
    comparator::Comparator,
    error::{Error, Result},
    format::{
        pack_sequence_and_type, InternalKeyComparator, LookupKey, SequenceNumber, ValueType,
        INTERNAL_KEY_TRAILER_SIZE,
    },
    util::{
        arena::Arena,
        coding::{
            decode_fixed64, get_length_prefixed_slice, get_varint32, put_fixed64, put_varint32,
            varint_length,
        },
    },
};

use skiplist::SkipList;

/// Orders encoded memtable entries by their embedded internal key.
#[derive(Clone)]
struct MemtableKeyComparator {
    internal: Arc<InternalKeyComparator>,
}

impl MemtableKeyComparator {
    fn entry_internal_key<'a>(entry: &'a [u8]) -> &'a [u8] {
        get_length_prefixed_slice(entry)
            .expect("malformed memtable entry")
            .0
    }
}

impl Comparator for MemtableKeyComparator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        self.internal
            .compare(Self::entry_internal_key(a), Self::entry_internal_key(b))
    }

    fn name(&self) -> &str {
        self.internal.name()
    }

    fn find_shortest_separator(&self, _start: &[u8], _limit: &[u8]) -> Vec<u8> {
        unreachable!("memtable keys are never shortened")
    }

    fn find_short_successor(&self, _key: &[u8]) -> Vec<u8> {
        unreachable!("memtable keys are never shortened")
    }
}

/// Single logical writer, any number of concurrent readers. Shared
/// ownership (and therefore lifetime) is handled by wrapping the table in
/// an `Arc`.
pub struct MemTable {
    comparator: Arc<InternalKeyComparator>,
    arena: Arc<Arena>,
    table: SkipList<MemtableKeyComparator>,
}

impl MemTable {
    pub fn new(comparator: Arc<InternalKeyComparator>) -> Self {
        let arena = Arc::new(Arena::new());
        let table = SkipList::new(
            MemtableKeyComparator {
                internal: comparator.clone(),
            },
            arena.clone(),
        );
        Self {
            comparator,
            arena,
            table,
        }
    }

    /// Bytes held by the arena on behalf of this table.
    pub fn approximate_memory_usage(&self) -> usize {
        self.arena.memory_usage()
    }

    /// Inserts an entry. Typically `value` is empty when `ty` is
    /// [`ValueType::Deletion`].
    pub fn add(&self, seq: SequenceNumber, ty: ValueType, key: &[u8], value: &[u8]) {
        let internal_key_size = key.len() + INTERNAL_KEY_TRAILER_SIZE;
        let encoded_len = varint_length(internal_key_size as u64)
            + internal_key_size
            + varint_length(value.len() as u64)
            + value.len();

        let ptr = self.arena.allocate(encoded_len);
        let mut buf = unsafe { std::slice::from_raw_parts_mut(ptr, encoded_len) };
        put_varint32(&mut buf, internal_key_size as u32);
        buf.put_slice(key);
        put_fixed64(&mut buf, pack_sequence_and_type(seq, ty));
        put_varint32(&mut buf, value.len() as u32);
        buf.put_slice(value);
        debug_assert!(buf.is_empty());

        self.table
            .insert(unsafe { std::slice::from_raw_parts(ptr, encoded_len) });
    }

    /// Newest entry for the probed key with sequence <= the probe's.
    ///
    /// - `Some(Ok(value))`: a live value.
    /// - `Some(Err(NotFound))`: a tombstone shadows the key.
    /// - `None`: the table holds nothing for this key.
    pub fn get(&self, key: &LookupKey) -> Option<Result<Bytes>> {
        let mut iter = self.table.iter();
        iter.seek(key.memtable_key());
        if !iter.is_valid() {
            return None;
        }

        let entry = iter.key();
        let (internal_key, consumed) =
            get_length_prefixed_slice(entry).expect("malformed memtable entry");
        let user_key = &internal_key[..internal_key.len() - INTERNAL_KEY_TRAILER_SIZE];
        if self
            .comparator
            .user_comparator()
            .compare(user_key, key.user_key())
            != Ordering::Equal
        {
            return None;
        }

        let tag = decode_fixed64(&internal_key[internal_key.len() - INTERNAL_KEY_TRAILER_SIZE..]);
        match ValueType::try_from((tag & 0xff) as u8).expect("malformed memtable entry") {
            ValueType::Value => {
                let (value, _) = get_length_prefixed_slice(&entry[consumed..])
                    .expect("malformed memtable entry");
                Some(Ok(Bytes::copy_from_slice(value)))
            }
            ValueType::Deletion => Some(Err(Error::NotFound("deleted".into()))),
        }
    }

    /// Iterates encoded internal keys in table order. `seek` targets are
    /// internal keys.
    pub fn iter(&self) -> MemTableIterator<'_> {
        MemTableIterator {
            iter: self.table.iter(),
            tmp: Vec::new(),
        }
    }
}

pub struct MemTableIterator<'a> {
    iter: skiplist::Iter<'a, MemtableKeyComparator>,
    tmp: Vec<u8>,
}

impl MemTableIterator<'_> {
    fn entry(&self) -> &[u8] {
        self.iter.key()
    }
}

impl crate::iterator::Iterator for MemTableIterator<'_> {
    fn is_valid(&self) -> bool {
        self.iter.is_valid()
    }

    fn seek_to_first(&mut self) {
        self.iter.seek_to_first();
    }

    fn seek_to_last(&mut self) {
        self.iter.seek_to_last();
    }

    fn seek(&mut self, target: &[u8]) {
        // Wrap the internal key in the entry framing the index stores.
        self.tmp.clear();
        put_varint32(&mut self.tmp, target.len() as u32);
        self.tmp.extend_from_slice(target);
        self.iter.seek(&self.tmp);
    }

    fn next(&mut self) {
        self.iter.next();
    }

    fn prev(&mut self) {
        self.iter.prev();
    }

    fn key(&self) -> &[u8] {
        get_length_prefixed_slice(self.entry())
            .expect("malformed memtable entry")
            .0
    }

    fn value(&self) -> &[u8] {
        let entry = self.entry();
        let (key_len, consumed) = get_varint32(entry).expect("malformed memtable entry");
        get_length_prefixed_slice(&entry[consumed + key_len as usize..])
            .expect("malformed memtable entry")
            .0
    }

    fn status(&mut self) -> Result<()> {
        Ok(())
    }
}
