use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    error::{Error, Result},
    util::coding::{decode_fixed64, put_fixed64},
};

use super::{pack_sequence_and_type, SequenceNumber, ValueType};

pub const INTERNAL_KEY_TRAILER_SIZE: usize = 8;

/// An internal key decomposed into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedInternalKey {
    user_key: Bytes,
    sequence: SequenceNumber,
    value_type: ValueType,
}

impl ParsedInternalKey {
    pub fn new(user_key: impl Into<Bytes>, sequence: SequenceNumber, value_type: ValueType) -> Self {
        Self {
            user_key: user_key.into(),
            sequence,
            value_type,
        }
    }

    pub fn user_key(&self) -> &[u8] {
        &self.user_key
    }

    pub fn sequence(&self) -> SequenceNumber {
        self.sequence
    }

    pub fn value_type(&self) -> ValueType {
        self.value_type
    }
}

/// Appends `user_key || fixed64_le(seq << 8 | type)` to `buf`.
pub fn append_internal_key(buf: &mut impl BufMut, key: &ParsedInternalKey) {
    buf.put(key.user_key());
    put_fixed64(buf, pack_sequence_and_type(key.sequence, key.value_type));
}

/// Splits an encoded internal key back into its components.
pub fn parse_internal_key(encoded: &[u8]) -> Result<ParsedInternalKey> {
    if encoded.len() < INTERNAL_KEY_TRAILER_SIZE {
        return Err(Error::corruption("internal key too short"));
    }
    let tag = decode_fixed64(&encoded[encoded.len() - INTERNAL_KEY_TRAILER_SIZE..]);
    let (sequence, ty) = super::unpack_sequence_and_type(tag);
    let value_type = ValueType::try_from(ty)?;
    Ok(ParsedInternalKey {
        user_key: Bytes::copy_from_slice(&encoded[..encoded.len() - INTERNAL_KEY_TRAILER_SIZE]),
        sequence,
        value_type,
    })
}

/// The user-key portion of an encoded internal key.
#[inline]
pub fn extract_user_key(internal_key: &[u8]) -> &[u8] {
    assert!(internal_key.len() >= INTERNAL_KEY_TRAILER_SIZE);
    &internal_key[..internal_key.len() - INTERNAL_KEY_TRAILER_SIZE]
}

/// An owned encoded internal key.
///
/// ```text
///     +----------+----------------------------------+
///     | user key | fixed64_le(seq << 8 | value type) |
///     +----------+----------------------------------+
/// ```
#[derive(Debug, Clone)]
pub struct InternalKey {
    bytes: Bytes,
}

impl InternalKey {
    pub fn new(user_key: &[u8], sequence: SequenceNumber, value_type: ValueType) -> Self {
        let mut buf = BytesMut::with_capacity(user_key.len() + INTERNAL_KEY_TRAILER_SIZE);
        append_internal_key(
            &mut buf,
            &ParsedInternalKey::new(Bytes::copy_from_slice(user_key), sequence, value_type),
        );
        Self { bytes: buf.freeze() }
    }

    pub fn decode_from(encoded: &[u8]) -> Result<Self> {
        parse_internal_key(encoded)?;
        Ok(Self {
            bytes: Bytes::copy_from_slice(encoded),
        })
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn user_key(&self) -> &[u8] {
        extract_user_key(&self.bytes)
    }
}
