//! Immutable sorted tables: builder, reader and the iterators over them.

pub mod block;
pub mod block_builder;
pub mod block_handle;
pub mod filter_block;
pub mod table_builder;
pub mod two_level_iterator;

use std::sync::Arc;

use bytes::Bytes;

use crate::{
    config::Config,
    env::RandomAccessFile,
    error::{Error, Result},
    iterator::{EmptyIterator, Iterator},
    options::ReadOptions,
    util::{cache::ShardedLruCache, coding::put_fixed64},
};

use block::Block;
use block_handle::{read_block, BlockHandle, Footer, FOOTER_ENCODED_LENGTH};
use filter_block::FilterBlockReader;
use two_level_iterator::TwoLevelIterator;

pub use table_builder::TableBuilder;

const SIZE_U32: usize = std::mem::size_of::<u32>();

/// Decompressed blocks shared between tables, keyed by
/// `fixed64(cache_id) || fixed64(block_offset)`.
pub type BlockCache = ShardedLruCache<Arc<Block>>;

/// An open table file: the footer and index block are parsed once at open
/// and held for the table's lifetime; data blocks are fetched on demand,
/// through the block cache when one is configured.
pub struct Table {
    config: Arc<Config>,
    file: Box<dyn RandomAccessFile>,
    cache_id: u64,
    index_block: Block,
    filter: Option<FilterBlockReader>,
}

impl Table {
    pub fn open(
        config: Arc<Config>,
        file: Box<dyn RandomAccessFile>,
        file_size: u64,
    ) -> Result<Self> {
        if (file_size as usize) < FOOTER_ENCODED_LENGTH {
            return Err(Error::corruption("file is too short to be an sstable"));
        }

        let mut footer_bytes = [0u8; FOOTER_ENCODED_LENGTH];
        file.read_at(file_size - FOOTER_ENCODED_LENGTH as u64, &mut footer_bytes)?;
        let footer = Footer::decode_from(&footer_bytes)?;

        let read_options = ReadOptions {
            verify_checksums: config.paranoid_checks,
            fill_cache: false,
        };
        let index_contents = read_block(&*file, &read_options, footer.index_handle())?;
        let index_block = Block::new(Bytes::from(index_contents))?;

        let cache_id = match &config.block_cache {
            Some(cache) => cache.new_id(),
            None => 0,
        };

        let mut table = Self {
            config,
            file,
            cache_id,
            index_block,
            filter: None,
        };
        table.read_meta(&footer);
        Ok(table)
    }

    /// Loads the filter block. Failures here only lose the filter
    /// optimization, so they are logged and swallowed.
    fn read_meta(&mut self, footer: &Footer) {
        let Some(policy) = self.config.filter_policy.clone() else {
            return;
        };

        let read_options = ReadOptions {
            verify_checksums: self.config.paranoid_checks,
            fill_cache: false,
        };
        let metaindex = match read_block(&*self.file, &read_options, footer.metaindex_handle())
            .and_then(|contents| Block::new(Bytes::from(contents)))
        {
            Ok(block) => block,
            Err(e) => {
                tracing::debug!("skipping unreadable metaindex block: {e}");
                return;
            }
        };

        let key = format!("filter.{}", policy.name());
        let mut iter = metaindex.iter(self.config.comparator.clone());
        iter.seek(key.as_bytes());
        if !iter.is_valid() || iter.key() != key.as_bytes() {
            return;
        }

        let handle = match BlockHandle::decode_from(iter.value()) {
            Ok((handle, _)) => handle,
            Err(_) => return,
        };
        match read_block(&*self.file, &read_options, handle) {
            Ok(contents) => {
                self.filter = Some(FilterBlockReader::new(policy, Bytes::from(contents)));
            }
            Err(e) => {
                tracing::debug!("skipping unreadable filter block: {e}");
            }
        }
    }

    /// Fetches the data block `handle` points at, consulting and filling
    /// the block cache.
    fn load_block(
        &self,
        handle: BlockHandle,
        options: &ReadOptions,
    ) -> Result<Arc<Block>> {
        let Some(cache) = &self.config.block_cache else {
            let contents = read_block(&*self.file, options, handle)?;
            return Ok(Arc::new(Block::new(Bytes::from(contents))?));
        };

        let mut cache_key = Vec::with_capacity(16);
        put_fixed64(&mut cache_key, self.cache_id);
        put_fixed64(&mut cache_key, handle.offset());

        if let Some(cache_handle) = cache.lookup(&cache_key) {
            let block = cache.value(&cache_handle).clone();
            cache.release(cache_handle);
            return Ok(block);
        }

        let contents = read_block(&*self.file, options, handle)?;
        let block = Arc::new(Block::new(Bytes::from(contents))?);
        if options.fill_cache {
            let cache_handle = cache.insert(&cache_key, block.clone(), block.size(), None);
            cache.release(cache_handle);
        }
        Ok(block)
    }

    /// Iterator over a data block named by an index entry's value.
    fn block_iterator(&self, options: &ReadOptions, index_value: &[u8]) -> Box<dyn Iterator> {
        let handle = match BlockHandle::decode_from(index_value) {
            Ok((handle, _)) => handle,
            Err(e) => return Box::new(EmptyIterator::with_error(e)),
        };
        match self.load_block(handle, options) {
            Ok(block) => Box::new(block.iter(self.config.comparator.clone())),
            Err(e) => Box::new(EmptyIterator::with_error(e)),
        }
    }

    /// Point lookup: index block, then filter, then one data block.
    /// Returns the first entry at or past `key` within its data block, or
    /// `None` when the table cannot contain the key.
    pub fn internal_get(
        &self,
        options: &ReadOptions,
        key: &[u8],
    ) -> Result<Option<(Bytes, Bytes)>> {
        let mut index_iter = self.index_block.iter(self.config.comparator.clone());
        index_iter.seek(key);
        if !index_iter.is_valid() {
            index_iter.status()?;
            return Ok(None);
        }

        let index_value = index_iter.value().to_vec();
        if let Some(filter) = &self.filter {
            if let Ok((handle, _)) = BlockHandle::decode_from(&index_value) {
                if !filter.key_may_match(handle.offset(), key) {
                    return Ok(None);
                }
            }
        }

        let mut block_iter = self.block_iterator(options, &index_value);
        block_iter.seek(key);
        let result = if block_iter.is_valid() {
            Some((
                Bytes::copy_from_slice(block_iter.key()),
                Bytes::copy_from_slice(block_iter.value()),
            ))
        } else {
            None
        };
        block_iter.status()?;
        index_iter.status()?;
        Ok(result)
    }

    /// A two-level iterator over every entry in the table.
    pub fn iter(self: Arc<Self>, options: ReadOptions) -> TwoLevelIterator {
        let index_iter = Box::new(self.index_block.iter(self.config.comparator.clone()));
        TwoLevelIterator::new(
            index_iter,
            Box::new(move |index_value| self.block_iterator(&options, index_value)),
        )
    }
}
