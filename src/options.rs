use crate::error::{Error, Result};

/// On-disk block compression. The tag is written into every block trailer.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionType {
    None = 0,
    Snappy = 1,
}

impl TryFrom<u8> for CompressionType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(CompressionType::None),
            1 => Ok(CompressionType::Snappy),
            _ => Err(Error::corruption(format!(
                "bad compression type tag: {value}"
            ))),
        }
    }
}

/// Per-read knobs.
pub struct ReadOptions {
    /// Verify block trailer checksums on every read.
    pub verify_checksums: bool,

    /// Insert blocks read for this operation into the block cache.
    pub fill_cache: bool,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            verify_checksums: false,
            fill_cache: true,
        }
    }
}
