pub mod internal_key;
pub mod lookup_key;

use std::{cmp::Ordering, sync::Arc};

use crate::{
    comparator::Comparator,
    error::{Error, Result},
    filter::FilterPolicy,
    util::coding::decode_fixed64,
};

pub use internal_key::{
    append_internal_key, extract_user_key, parse_internal_key, InternalKey, ParsedInternalKey,
    INTERNAL_KEY_TRAILER_SIZE,
};
pub use lookup_key::LookupKey;

/// 56-bit logical timestamp. The upper 8 bits of the packed trailer hold it.
pub type SequenceNumber = u64;

pub const MAX_SEQUENCE: SequenceNumber = (1 << 56) - 1;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    /// Tombstone. The value is unused (zero length).
    Deletion = 0,

    /// A live key/value pair.
    Value = 1,
}

/// Seek probes use the largest tag so a single seek positions at the newest
/// entry with sequence <= the probed one.
pub const VALUE_TYPE_FOR_SEEK: ValueType = ValueType::Value;

impl TryFrom<u8> for ValueType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(ValueType::Deletion),
            1 => Ok(ValueType::Value),
            _ => Err(Error::corruption(format!("bad value type tag: {value}"))),
        }
    }
}

#[inline]
pub(crate) fn pack_sequence_and_type(seq: SequenceNumber, ty: ValueType) -> u64 {
    debug_assert!(seq <= MAX_SEQUENCE);
    (seq << 8) | ty as u64
}

#[inline]
pub(crate) fn unpack_sequence_and_type(tag: u64) -> (SequenceNumber, u8) {
    (tag >> 8, (tag & 0xff) as u8)
}

/// Orders internal keys: user key ascending per the wrapped comparator,
/// then the 8-byte trailer descending, so newer versions of a key sort
/// first.
pub struct InternalKeyComparator {
    user_comparator: Arc<dyn Comparator>,
}

impl InternalKeyComparator {
    pub fn new(user_comparator: Arc<dyn Comparator>) -> Self {
        Self { user_comparator }
    }

    pub fn user_comparator(&self) -> &Arc<dyn Comparator> {
        &self.user_comparator
    }
}

impl Comparator for InternalKeyComparator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        match self
            .user_comparator
            .compare(extract_user_key(a), extract_user_key(b))
        {
            Ordering::Equal => {
                let atag = decode_fixed64(&a[a.len() - INTERNAL_KEY_TRAILER_SIZE..]);
                let btag = decode_fixed64(&b[b.len() - INTERNAL_KEY_TRAILER_SIZE..]);
                btag.cmp(&atag)
            }
            ord => ord,
        }
    }

    fn name(&self) -> &str {
        "sediment.InternalKeyComparator"
    }

    fn find_shortest_separator(&self, start: &[u8], limit: &[u8]) -> Vec<u8> {
        let user_start = extract_user_key(start);
        let user_limit = extract_user_key(limit);
        let tmp = self
            .user_comparator
            .find_shortest_separator(user_start, user_limit);
        if tmp.len() < user_start.len()
            && self.user_comparator.compare(user_start, &tmp) == Ordering::Less
        {
            // The user key shrank and grew logically; restore a trailer that
            // sorts before every real entry for that user key.
            let mut sep = tmp;
            crate::util::coding::put_fixed64(
                &mut sep,
                pack_sequence_and_type(MAX_SEQUENCE, VALUE_TYPE_FOR_SEEK),
            );
            debug_assert_eq!(self.compare(start, &sep), Ordering::Less);
            debug_assert_eq!(self.compare(&sep, limit), Ordering::Less);
            return sep;
        }
        start.to_vec()
    }

    fn find_short_successor(&self, key: &[u8]) -> Vec<u8> {
        let user_key = extract_user_key(key);
        let tmp = self.user_comparator.find_short_successor(user_key);
        if tmp.len() < user_key.len()
            && self.user_comparator.compare(user_key, &tmp) == Ordering::Less
        {
            let mut succ = tmp;
            crate::util::coding::put_fixed64(
                &mut succ,
                pack_sequence_and_type(MAX_SEQUENCE, VALUE_TYPE_FOR_SEEK),
            );
            debug_assert_eq!(self.compare(key, &succ), Ordering::Less);
            return succ;
        }
        key.to_vec()
    }
}

/// Presents a user filter policy as one over internal keys: filters are
/// built from the embedded user keys, so probes with any sequence number
/// hit the same filter bits.
pub struct InternalFilterPolicy {
    user_policy: Arc<dyn FilterPolicy>,
}

impl InternalFilterPolicy {
    pub fn new(user_policy: Arc<dyn FilterPolicy>) -> Self {
        Self { user_policy }
    }
}

impl FilterPolicy for InternalFilterPolicy {
    fn name(&self) -> &str {
        self.user_policy.name()
    }

    fn create_filter(&self, keys: &[Vec<u8>]) -> Vec<u8> {
        let user_keys: Vec<Vec<u8>> = keys
            .iter()
            .map(|k| extract_user_key(k).to_vec())
            .collect();
        self.user_policy.create_filter(&user_keys)
    }

    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool {
        self.user_policy.key_may_match(extract_user_key(key), filter)
    }
}

#[cfg(test)]
mod tests {
    use std::cmp::Ordering;

    use itertools::Itertools;

    use crate::comparator::{bytewise, Comparator};

    use super::{
        append_internal_key, parse_internal_key, InternalKeyComparator, LookupKey,
        ParsedInternalKey, SequenceNumber, ValueType, MAX_SEQUENCE,
    };

    fn ikey(user_key: &[u8], seq: SequenceNumber, ty: ValueType) -> Vec<u8> {
        let mut buf = Vec::new();
        append_internal_key(
            &mut buf,
            &ParsedInternalKey::new(bytes::Bytes::copy_from_slice(user_key), seq, ty),
        );
        buf
    }

    #[test]
    fn owned_internal_key() {
        let key = super::InternalKey::new(b"hello", 42, ValueType::Value);
        assert_eq!(key.as_slice(), &ikey(b"hello", 42, ValueType::Value)[..]);
        assert_eq!(key.user_key(), b"hello");

        let decoded = super::InternalKey::decode_from(key.as_slice()).unwrap();
        assert_eq!(decoded.as_slice(), key.as_slice());
        assert!(super::InternalKey::decode_from(b"short").is_err());
    }

    #[test]
    fn internal_key_round_trip() {
        let keys: &[&[u8]] = &[b"", b"k", b"hello", b"longggggggggggggggggggggg"];
        let seqs = [
            0u64,
            1,
            100,
            u32::MAX as u64,
            (1 << 56) - 2,
            MAX_SEQUENCE,
        ];
        for (&key, &seq) in keys.iter().cartesian_product(&seqs) {
            for ty in [ValueType::Value, ValueType::Deletion] {
                let encoded = ikey(key, seq, ty);
                let parsed = parse_internal_key(&encoded).unwrap();
                assert_eq!(parsed.user_key(), key);
                assert_eq!(parsed.sequence(), seq);
                assert_eq!(parsed.value_type(), ty);
            }
        }
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse_internal_key(b"").is_err());
        assert!(parse_internal_key(b"short").is_err());
        let mut bad = ikey(b"k", 7, ValueType::Value);
        let n = bad.len();
        bad[n - 8] = 99; // type tag
        assert!(parse_internal_key(&bad).is_err());
    }

    #[test]
    fn ordering_is_seq_descending_within_a_key() {
        let cmp = InternalKeyComparator::new(bytewise());
        // Same user key: larger sequence sorts first.
        assert_eq!(
            cmp.compare(
                &ikey(b"k", 2, ValueType::Value),
                &ikey(b"k", 1, ValueType::Value)
            ),
            Ordering::Less
        );
        // Same sequence: Value (1) sorts before Deletion (0).
        assert_eq!(
            cmp.compare(
                &ikey(b"k", 5, ValueType::Value),
                &ikey(b"k", 5, ValueType::Deletion)
            ),
            Ordering::Less
        );
        // User key still dominates.
        assert_eq!(
            cmp.compare(
                &ikey(b"a", 1, ValueType::Value),
                &ikey(b"b", 100, ValueType::Value)
            ),
            Ordering::Less
        );
    }

    #[test]
    fn internal_separator_appends_max_trailer() {
        let cmp = InternalKeyComparator::new(bytewise());

        // Shortened: separator carries the seek trailer.
        let start = ikey(b"foo", 100, ValueType::Value);
        let limit = ikey(b"hello", 200, ValueType::Value);
        let sep = cmp.find_shortest_separator(&start, &limit);
        assert_eq!(sep, ikey(b"g", MAX_SEQUENCE, ValueType::Value));

        // Prefix user keys: unchanged.
        let start = ikey(b"foo", 100, ValueType::Value);
        let limit = ikey(b"foobar", 200, ValueType::Value);
        assert_eq!(cmp.find_shortest_separator(&start, &limit), start);
    }

    #[test]
    fn internal_successor() {
        let cmp = InternalKeyComparator::new(bytewise());
        let key = ikey(b"foo", 100, ValueType::Value);
        assert_eq!(
            cmp.find_short_successor(&key),
            ikey(b"g", MAX_SEQUENCE, ValueType::Value)
        );

        let key = ikey(b"\xff\xff", 100, ValueType::Value);
        assert_eq!(cmp.find_short_successor(&key), key);
    }

    #[test]
    fn lookup_key_slices() {
        let lk = LookupKey::new(b"hello", 42);
        assert_eq!(lk.user_key(), b"hello");
        assert_eq!(lk.internal_key(), &ikey(b"hello", 42, ValueType::Value)[..]);
        // The memtable probe is the varint length prefix plus the internal key.
        let mk = lk.memtable_key();
        assert_eq!(mk[0], (5 + 8) as u8);
        assert_eq!(&mk[1..], lk.internal_key());
    }
}
