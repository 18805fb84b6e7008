use bytes::BufMut;

use crate::{
    env::RandomAccessFile,
    error::{Error, Result},
    options::{CompressionType, ReadOptions},
    util::{
        coding::{decode_fixed32, decode_fixed64, get_varint64, put_varint64},
        crc,
    },
};

/// Maximum encoded length of a handle: two full varint64s.
pub const MAX_ENCODED_LENGTH: usize = 10 + 10;

/// Footer: two padded handles plus the magic number.
pub const FOOTER_ENCODED_LENGTH: usize = 2 * MAX_ENCODED_LENGTH + 8;

pub const TABLE_MAGIC_NUMBER: u64 = 0xdb4775248b80fb57;

/// 1 type byte + 4 byte masked crc32c, appended after every stored block.
pub const BLOCK_TRAILER_SIZE: usize = 5;

/// Locates a block within a table file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHandle {
    offset: u64,
    size: u64,
}

impl BlockHandle {
    pub fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn set_offset(&mut self, offset: u64) {
        self.offset = offset;
    }

    pub fn set_size(&mut self, size: u64) {
        self.size = size;
    }

    pub fn encode_to(&self, buf: &mut impl BufMut) {
        put_varint64(buf, self.offset);
        put_varint64(buf, self.size);
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(MAX_ENCODED_LENGTH);
        self.encode_to(&mut buf);
        buf
    }

    /// Decodes a handle from the front of `input`, returning it and the
    /// bytes consumed.
    pub fn decode_from(input: &[u8]) -> Result<(Self, usize)> {
        let (offset, n1) =
            get_varint64(input).ok_or_else(|| Error::corruption("bad block handle"))?;
        let (size, n2) =
            get_varint64(&input[n1..]).ok_or_else(|| Error::corruption("bad block handle"))?;
        Ok((Self { offset, size }, n1 + n2))
    }
}

/// The fixed 48 bytes at the tail of every table file.
pub struct Footer {
    metaindex_handle: BlockHandle,
    index_handle: BlockHandle,
}

impl Footer {
    pub fn new(metaindex_handle: BlockHandle, index_handle: BlockHandle) -> Self {
        Self {
            metaindex_handle,
            index_handle,
        }
    }

    pub fn metaindex_handle(&self) -> BlockHandle {
        self.metaindex_handle
    }

    pub fn index_handle(&self) -> BlockHandle {
        self.index_handle
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FOOTER_ENCODED_LENGTH);
        self.metaindex_handle.encode_to(&mut buf);
        self.index_handle.encode_to(&mut buf);
        buf.resize(2 * MAX_ENCODED_LENGTH, 0); // pad the handles
        buf.put_u64_le(TABLE_MAGIC_NUMBER);
        assert_eq!(buf.len(), FOOTER_ENCODED_LENGTH);
        buf
    }

    pub fn decode_from(input: &[u8]) -> Result<Self> {
        if input.len() < FOOTER_ENCODED_LENGTH {
            return Err(Error::corruption("footer too short"));
        }
        let magic = decode_fixed64(&input[FOOTER_ENCODED_LENGTH - 8..]);
        if magic != TABLE_MAGIC_NUMBER {
            return Err(Error::InvalidArgument(
                "not an sstable (bad magic number)".into(),
            ));
        }

        let (metaindex_handle, n) = BlockHandle::decode_from(input)?;
        let (index_handle, _) = BlockHandle::decode_from(&input[n..])?;
        Ok(Self {
            metaindex_handle,
            index_handle,
        })
    }
}

/// Reads, checks and decompresses the block `handle` points at.
pub fn read_block(
    file: &dyn RandomAccessFile,
    options: &ReadOptions,
    handle: BlockHandle,
) -> Result<Vec<u8>> {
    let n = handle.size() as usize;
    let mut buf = vec![0u8; n + BLOCK_TRAILER_SIZE];
    file.read_at(handle.offset(), &mut buf)?;

    let ty = buf[n];
    if options.verify_checksums {
        let expected = crc::unmask(decode_fixed32(&buf[n + 1..]));
        let actual = crc::value(&buf[..n + 1]);
        if actual != expected {
            return Err(Error::corruption("block checksum mismatch"));
        }
    }

    match CompressionType::try_from(ty)? {
        CompressionType::None => {
            buf.truncate(n);
            Ok(buf)
        }
        CompressionType::Snappy => snap::raw::Decoder::new()
            .decompress_vec(&buf[..n])
            .map_err(|_| Error::corruption("corrupted compressed block contents")),
    }
}
