use std::sync::Arc;

use crate::{
    config::Config,
    env::WritableFile,
    error::Result,
    options::CompressionType,
    util::{coding::put_fixed32, crc},
};

use super::{
    block_builder::BlockBuilder,
    block_handle::{BlockHandle, Footer},
    filter_block::FilterBlockBuilder,
};

/// Assembles a table file in one forward pass: data blocks as they fill,
/// then the filter block, the meta-index, the index and the footer.
pub struct TableBuilder {
    config: Arc<Config>,
    file: Box<dyn WritableFile>,
    offset: u64,

    data_block: BlockBuilder,
    index_block: BlockBuilder,
    filter_block: Option<FilterBlockBuilder>,

    last_key: Vec<u8>,
    num_entries: u64,
    closed: bool,

    /// A data block was finished but its index entry is deferred until the
    /// next key arrives, so the separator can be shortened against it.
    pending_index_entry: bool,
    pending_handle: BlockHandle,

    compressed_output: Vec<u8>,
}

impl TableBuilder {
    pub fn new(config: Arc<Config>, file: Box<dyn WritableFile>) -> Self {
        let data_block = BlockBuilder::new(config.clone());
        // Every index key is a restart point so the index is fully
        // binary-searchable.
        let index_block = BlockBuilder::with_restart_interval(config.clone(), 1);

        let filter_block = config.filter_policy.clone().map(|policy| {
            let mut builder = FilterBlockBuilder::new(policy);
            builder.start_block(0);
            builder
        });

        Self {
            config,
            file,
            offset: 0,
            data_block,
            index_block,
            filter_block,
            last_key: Vec::new(),
            num_entries: 0,
            closed: false,
            pending_index_entry: false,
            pending_handle: BlockHandle::new(0, 0),
            compressed_output: Vec::new(),
        }
    }

    /// Appends an entry. Keys must arrive in ascending order.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        assert!(!self.closed);
        if self.num_entries > 0 {
            assert!(
                self.config.comparator.compare(key, &self.last_key).is_gt(),
                "keys out of order"
            );
        }

        if self.pending_index_entry {
            assert!(self.data_block.is_empty());
            let separator = self
                .config
                .comparator
                .find_shortest_separator(&self.last_key, key);
            self.index_block
                .add(&separator, &self.pending_handle.encode());
            self.pending_index_entry = false;
        }

        if let Some(filter_block) = &mut self.filter_block {
            filter_block.add_key(key);
        }

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.num_entries += 1;
        self.data_block.add(key, value);

        if self.data_block.current_size_estimate() >= self.config.block_size {
            self.flush()?;
        }
        Ok(())
    }

    /// Forces the current data block out to the file.
    pub fn flush(&mut self) -> Result<()> {
        assert!(!self.closed);
        if self.data_block.is_empty() {
            return Ok(());
        }
        assert!(!self.pending_index_entry);

        self.pending_handle = write_block(
            &mut *self.file,
            &mut self.offset,
            self.config.compression_type,
            &mut self.compressed_output,
            self.data_block.finish(),
        )?;
        self.data_block.reset();
        self.pending_index_entry = true;
        self.file.flush()?;

        if let Some(filter_block) = &mut self.filter_block {
            filter_block.start_block(self.offset);
        }
        Ok(())
    }

    /// Writes everything that trails the data blocks. No further entries
    /// may be added.
    pub fn finish(&mut self) -> Result<()> {
        self.flush()?;
        assert!(!self.closed);
        self.closed = true;

        // Filter block, stored uncompressed.
        let mut filter_handle = BlockHandle::new(0, 0);
        if let Some(filter_block) = &mut self.filter_block {
            filter_handle = write_raw_block(
                &mut *self.file,
                &mut self.offset,
                filter_block.finish(),
                CompressionType::None,
            )?;
        }

        // Meta-index block: one entry pointing at the filter, when present.
        let mut metaindex_block = BlockBuilder::new(self.config.clone());
        if let Some(policy) = &self.config.filter_policy {
            let key = format!("filter.{}", policy.name());
            metaindex_block.add(key.as_bytes(), &filter_handle.encode());
        }
        let metaindex_handle = write_block(
            &mut *self.file,
            &mut self.offset,
            self.config.compression_type,
            &mut self.compressed_output,
            metaindex_block.finish(),
        )?;

        // Index block, closing the deferred entry past the last key.
        if self.pending_index_entry {
            let successor = self.config.comparator.find_short_successor(&self.last_key);
            self.index_block
                .add(&successor, &self.pending_handle.encode());
            self.pending_index_entry = false;
        }
        let index_handle = write_block(
            &mut *self.file,
            &mut self.offset,
            self.config.compression_type,
            &mut self.compressed_output,
            self.index_block.finish(),
        )?;

        let footer = Footer::new(metaindex_handle, index_handle).encode();
        self.file.append(&footer)?;
        self.offset += footer.len() as u64;
        self.file.flush()?;
        Ok(())
    }

    /// Discards a partially built table.
    pub fn abandon(&mut self) {
        assert!(!self.closed);
        self.closed = true;
    }

    pub fn num_entries(&self) -> u64 {
        self.num_entries
    }

    pub fn file_size(&self) -> u64 {
        self.offset
    }
}

/// Compresses `raw` per `compression` and stores whichever form is
/// smaller; snappy is kept only when it wins back more than 1/8th.
fn write_block(
    file: &mut dyn WritableFile,
    offset: &mut u64,
    compression: CompressionType,
    scratch: &mut Vec<u8>,
    raw: &[u8],
) -> Result<BlockHandle> {
    match compression {
        CompressionType::None => write_raw_block(file, offset, raw, CompressionType::None),
        CompressionType::Snappy => {
            scratch.clear();
            scratch.resize(snap::raw::max_compress_len(raw.len()), 0);
            let n = snap::raw::Encoder::new()
                .compress(raw, scratch)
                .expect("snappy compression with sized output");
            scratch.truncate(n);
            if n < raw.len() - raw.len() / 8 {
                write_raw_block(file, offset, scratch, CompressionType::Snappy)
            } else {
                write_raw_block(file, offset, raw, CompressionType::None)
            }
        }
    }
}

/// Appends `contents || type || masked crc32c(contents || type)` and
/// returns the handle of the stored block.
fn write_raw_block(
    file: &mut dyn WritableFile,
    offset: &mut u64,
    contents: &[u8],
    ty: CompressionType,
) -> Result<BlockHandle> {
    let handle = BlockHandle::new(*offset, contents.len() as u64);
    file.append(contents)?;

    let mut trailer = vec![ty as u8];
    put_fixed32(&mut trailer, crc::mask(crc::extend(contents, &[ty as u8])));
    debug_assert_eq!(trailer.len(), super::block_handle::BLOCK_TRAILER_SIZE);
    file.append(&trailer)?;

    *offset += contents.len() as u64 + trailer.len() as u64;
    Ok(handle)
}
