use bytes::BufMut;

use crate::{
    env::WritableFile,
    error::Result,
    util::{coding::put_fixed32, crc},
    wal::{RecordType, BLOCK_SIZE, HEADER_SIZE},
};

const ZEROES: [u8; HEADER_SIZE] = [0; HEADER_SIZE];

pub struct LogWriter {
    dest: Box<dyn WritableFile>,

    // Offset within the current block, in [0, BLOCK_SIZE).
    block_offset: usize,
}

impl LogWriter {
    pub fn new(dest: Box<dyn WritableFile>) -> Self {
        Self {
            dest,
            block_offset: 0,
        }
    }

    /// Resumes an existing log; `dest_length` is the current size of the
    /// file being appended to.
    pub fn new_at(dest: Box<dyn WritableFile>, dest_length: u64) -> Self {
        Self {
            dest,
            block_offset: (dest_length % BLOCK_SIZE as u64) as usize,
        }
    }

    /// Appends one logical record, fragmenting it across blocks as needed.
    /// The bytes reach the OS before this returns; durability needs an
    /// explicit `sync` on the underlying file.
    pub fn append(&mut self, record: &[u8]) -> Result<()> {
        let mut left = record;
        let mut begin = true;

        loop {
            let leftover = BLOCK_SIZE - self.block_offset;
            if leftover < HEADER_SIZE {
                // No room for a header; fill the trailer with zeros.
                if leftover > 0 {
                    self.dest.append(&ZEROES[..leftover])?;
                }
                self.block_offset = 0;
            }

            let avail = BLOCK_SIZE - self.block_offset - HEADER_SIZE;
            let fragment_length = left.len().min(avail);
            let end = fragment_length == left.len();

            let ty = if begin && end {
                RecordType::Full
            } else if begin {
                RecordType::First
            } else if end {
                RecordType::Last
            } else {
                RecordType::Middle
            };

            self.emit_physical_record(ty, &left[..fragment_length])?;
            left = &left[fragment_length..];
            begin = false;

            // An empty record still emits a single zero-length Full.
            if left.is_empty() {
                break;
            }
        }

        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.dest.sync()
    }

    fn emit_physical_record(&mut self, ty: RecordType, data: &[u8]) -> Result<()> {
        assert!(data.len() <= 0xffff);
        assert!(self.block_offset + HEADER_SIZE + data.len() <= BLOCK_SIZE);

        let mut header = Vec::with_capacity(HEADER_SIZE);
        put_fixed32(&mut header, crc::mask(crc::extend(&[ty as u8], data)));
        header.put_u16_le(data.len() as u16);
        header.put_u8(ty as u8);

        self.dest.append(&header)?;
        self.dest.append(data)?;
        self.dest.flush()?;

        self.block_offset += HEADER_SIZE + data.len();
        Ok(())
    }
}
