use bytes::{BufMut, BytesMut};

use crate::util::coding::{put_fixed64, put_varint32, varint_length};

use super::{
    internal_key::INTERNAL_KEY_TRAILER_SIZE, pack_sequence_and_type, SequenceNumber,
    VALUE_TYPE_FOR_SEEK,
};

/// A prepared lookup probe.
///
/// ```text
///     +------------------------+----------+-----------------------------+
///     | varint32 (user_key+8)  | user key | fixed64_le(seq<<8|seek type) |
///     +------------------------+----------+-----------------------------+
/// ```
///
/// The whole buffer is the memtable probe; the suffix past the length
/// prefix is the internal key; the middle is the user key. One seek in an
/// ordered structure lands on the first entry for `user_key` with
/// sequence <= `seq`.
pub struct LookupKey {
    bytes: BytesMut,
    key_start: usize,
}

impl LookupKey {
    pub fn new(user_key: &[u8], seq: SequenceNumber) -> Self {
        let internal_len = user_key.len() + INTERNAL_KEY_TRAILER_SIZE;
        let mut bytes = BytesMut::with_capacity(varint_length(internal_len as u64) + internal_len);
        put_varint32(&mut bytes, internal_len as u32);
        let key_start = bytes.len();
        bytes.put(user_key);
        put_fixed64(&mut bytes, pack_sequence_and_type(seq, VALUE_TYPE_FOR_SEEK));

        Self { bytes, key_start }
    }

    /// The probe for a memtable seek (length-prefixed internal key).
    pub fn memtable_key(&self) -> &[u8] {
        &self.bytes
    }

    /// The probe for an SST seek.
    pub fn internal_key(&self) -> &[u8] {
        &self.bytes[self.key_start..]
    }

    pub fn user_key(&self) -> &[u8] {
        &self.bytes[self.key_start..self.bytes.len() - INTERNAL_KEY_TRAILER_SIZE]
    }
}
