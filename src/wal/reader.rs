use crate::{
    env::SequentialFile,
    error::Error,
    util::{coding::decode_fixed32, crc},
    wal::{RecordType, BLOCK_SIZE, HEADER_SIZE},
};

/// Receives corruption notifications so higher layers can audit how many
/// bytes were lost.
pub trait Reporter {
    fn corruption(&mut self, bytes: usize, reason: &Error);
}

/// Outcome of parsing one physical record. The two pseudo-types extend the
/// on-disk type space.
enum Physical {
    /// `(type byte, offset into the backing store, length)`.
    Record(u8, usize, usize),
    Eof,
    Bad,
}

pub struct LogReader {
    file: Box<dyn SequentialFile>,
    reporter: Option<Box<dyn Reporter>>,
    checksum: bool,

    backing_store: Vec<u8>,
    // Live region of backing_store.
    buffer_start: usize,
    buffer_end: usize,
    // Last read returned fewer than BLOCK_SIZE bytes.
    eof: bool,

    // Offset of the first location past the end of buffer.
    end_of_buffer_offset: u64,
    // Start offset of the last logical record returned.
    last_record_offset: u64,

    initial_offset: u64,
    // Dropping fragments until the next First or Full record.
    resyncing: bool,
}

impl LogReader {
    /// A reader over `file`. Records whose start lies before
    /// `initial_offset` are skipped; when `initial_offset` falls inside a
    /// record, the reader resynchronizes at the next logical record.
    pub fn new(
        file: Box<dyn SequentialFile>,
        reporter: Option<Box<dyn Reporter>>,
        checksum: bool,
        initial_offset: u64,
    ) -> Self {
        Self {
            file,
            reporter,
            checksum,
            backing_store: vec![0; BLOCK_SIZE],
            buffer_start: 0,
            buffer_end: 0,
            eof: false,
            end_of_buffer_offset: 0,
            last_record_offset: 0,
            initial_offset,
            resyncing: initial_offset > 0,
        }
    }

    /// Start offset of the most recently returned logical record.
    pub fn last_record_offset(&self) -> u64 {
        self.last_record_offset
    }

    /// Reads the next logical record, reassembling fragments. `None` is a
    /// clean end of stream; corrupted regions are reported and skipped.
    pub fn read_record(&mut self) -> Option<Vec<u8>> {
        if self.last_record_offset < self.initial_offset && !self.skip_to_initial_block() {
            return None;
        }

        let mut scratch: Vec<u8> = Vec::new();
        let mut in_fragmented_record = false;
        // Offset of the logical record being assembled.
        let mut prospective_record_offset = 0;

        loop {
            let physical = self.read_physical_record();

            let (ty, start, len) = match physical {
                Physical::Record(ty, start, len) => (ty, start, len),
                Physical::Eof => {
                    if in_fragmented_record {
                        // The writer died mid-record; not a corruption.
                        scratch.clear();
                    }
                    return None;
                }
                Physical::Bad => {
                    if in_fragmented_record {
                        self.report_corruption(scratch.len() as u64, "error in middle of record");
                        in_fragmented_record = false;
                        scratch.clear();
                    }
                    continue;
                }
            };

            // The fragment's own start offset, now that its bytes left the
            // buffer.
            let physical_record_offset = self.end_of_buffer_offset
                - self.buffer_len() as u64
                - HEADER_SIZE as u64
                - len as u64;

            if self.resyncing {
                if ty == RecordType::Middle as u8 {
                    continue;
                }
                if ty == RecordType::Last as u8 {
                    self.resyncing = false;
                    continue;
                }
                self.resyncing = false;
            }

            if ty == RecordType::Full as u8 {
                if in_fragmented_record && !scratch.is_empty() {
                    // A tail-of-block empty First followed by a Full is a
                    // known artifact of older writers; an actual partial
                    // body is worth reporting.
                    self.report_corruption(scratch.len() as u64, "partial record without end(1)");
                }
                self.last_record_offset = physical_record_offset;
                return Some(self.fragment(start, len).to_vec());
            } else if ty == RecordType::First as u8 {
                if in_fragmented_record && !scratch.is_empty() {
                    self.report_corruption(scratch.len() as u64, "partial record without end(2)");
                }
                prospective_record_offset = physical_record_offset;
                scratch.clear();
                scratch.extend_from_slice(self.fragment(start, len));
                in_fragmented_record = true;
            } else if ty == RecordType::Middle as u8 {
                if !in_fragmented_record {
                    self.report_corruption(len as u64, "missing start of fragmented record(1)");
                } else {
                    scratch.extend_from_slice(self.fragment(start, len));
                }
            } else if ty == RecordType::Last as u8 {
                if !in_fragmented_record {
                    self.report_corruption(len as u64, "missing start of fragmented record(2)");
                } else {
                    scratch.extend_from_slice(self.fragment(start, len));
                    self.last_record_offset = prospective_record_offset;
                    return Some(scratch);
                }
            } else {
                let dropped = len + if in_fragmented_record { scratch.len() } else { 0 };
                self.report_corruption(dropped as u64, &format!("unknown record type {ty}"));
                in_fragmented_record = false;
                scratch.clear();
            }
        }
    }

    fn fragment(&self, start: usize, len: usize) -> &[u8] {
        &self.backing_store[start..start + len]
    }

    fn buffer_len(&self) -> usize {
        self.buffer_end - self.buffer_start
    }

    /// Positions the underlying file at the first block that can contain a
    /// record starting at or after `initial_offset`.
    fn skip_to_initial_block(&mut self) -> bool {
        let offset_in_block = self.initial_offset % BLOCK_SIZE as u64;
        let mut block_start_location = self.initial_offset - offset_in_block;

        // A start inside the zero-padded trailer belongs to the next block.
        if offset_in_block > (BLOCK_SIZE - 6) as u64 {
            block_start_location += BLOCK_SIZE as u64;
        }

        self.end_of_buffer_offset = block_start_location;

        if block_start_location > 0 {
            if let Err(e) = self.file.skip(block_start_location) {
                self.report_drop(block_start_location, &e);
                return false;
            }
        }
        true
    }

    fn read_physical_record(&mut self) -> Physical {
        loop {
            if self.buffer_len() < HEADER_SIZE {
                if !self.eof {
                    // The previous read was a full block, so whatever is
                    // left is a zero-padded trailer. Refill.
                    self.buffer_start = 0;
                    self.buffer_end = 0;
                    match self.file.read(&mut self.backing_store) {
                        Ok(n) => {
                            self.buffer_end = n;
                            self.end_of_buffer_offset += n as u64;
                            if n < BLOCK_SIZE {
                                self.eof = true;
                            }
                        }
                        Err(e) => {
                            self.report_drop(BLOCK_SIZE as u64, &e);
                            self.eof = true;
                            return Physical::Eof;
                        }
                    }
                    continue;
                }
                // A non-empty remainder here is a header torn by a crash
                // mid-write; treat it as a clean end of stream.
                self.buffer_start = self.buffer_end;
                return Physical::Eof;
            }

            let header = &self.backing_store[self.buffer_start..self.buffer_start + HEADER_SIZE];
            let length = header[4] as usize | ((header[5] as usize) << 8);
            let ty = header[6];

            if HEADER_SIZE + length > self.buffer_len() {
                let drop_size = self.buffer_len();
                self.buffer_start = self.buffer_end;
                if !self.eof {
                    self.report_corruption(drop_size as u64, "bad record length");
                    return Physical::Bad;
                }
                // The file ended before the promised payload; the writer
                // died mid-record. Not a corruption.
                return Physical::Eof;
            }

            if ty == RecordType::Zero as u8 && length == 0 {
                // Preallocation fill. Skip the rest of the buffer without
                // reporting a drop.
                self.buffer_start = self.buffer_end;
                return Physical::Bad;
            }

            if self.checksum {
                let expected_crc = crc::unmask(decode_fixed32(header));
                let actual_crc = crc::value(
                    &self.backing_store
                        [self.buffer_start + 6..self.buffer_start + HEADER_SIZE + length],
                );
                if actual_crc != expected_crc {
                    // The length field itself may be corrupt; trusting it
                    // could resynchronize onto bytes that merely look like
                    // a record. Drop the rest of the buffer.
                    let drop_size = self.buffer_len();
                    self.buffer_start = self.buffer_end;
                    self.report_corruption(drop_size as u64, "checksum mismatch");
                    return Physical::Bad;
                }
            }

            let fragment_start = self.buffer_start + HEADER_SIZE;
            self.buffer_start += HEADER_SIZE + length;

            // Physical records that started before initial_offset are not
            // surfaced.
            if (self.end_of_buffer_offset
                - self.buffer_len() as u64
                - HEADER_SIZE as u64
                - length as u64)
                < self.initial_offset
            {
                return Physical::Bad;
            }

            return Physical::Record(ty, fragment_start, length);
        }
    }

    fn report_corruption(&mut self, bytes: u64, reason: &str) {
        self.report_drop(bytes, &Error::corruption(reason));
    }

    fn report_drop(&mut self, bytes: u64, reason: &Error) {
        let drop_start = self
            .end_of_buffer_offset
            .wrapping_sub(self.buffer_len() as u64)
            .wrapping_sub(bytes);
        let initial_offset = self.initial_offset;
        if let Some(reporter) = &mut self.reporter {
            // Only bytes at or past initial_offset count as lost data.
            if drop_start >= initial_offset {
                reporter.corruption(bytes as usize, reason);
            }
        }
    }
}
