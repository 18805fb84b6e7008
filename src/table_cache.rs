//! Process-level cache of open table files, keyed by file number.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use bytes::Bytes;

use crate::{
    config::Config,
    error::Result,
    filename::{sst_table_file_name, table_file_name},
    iterator::Iterator,
    options::ReadOptions,
    table::Table,
    util::{
        cache::{Handle, ShardedLruCache},
        coding::put_fixed64,
    },
};

/// The cached value: an open table (which owns its file handle).
struct TableAndFile {
    table: Arc<Table>,
}

pub struct TableCache {
    db_path: PathBuf,
    config: Arc<Config>,
    cache: Arc<ShardedLruCache<TableAndFile>>,
}

impl TableCache {
    /// `entries` bounds how many tables stay open at once.
    pub fn new(db_path: impl Into<PathBuf>, config: Arc<Config>, entries: usize) -> Self {
        Self {
            db_path: db_path.into(),
            config,
            cache: Arc::new(ShardedLruCache::new(entries)),
        }
    }

    /// Point lookup through the table for `file_number`.
    pub fn get(
        &self,
        options: &ReadOptions,
        file_number: u64,
        file_size: u64,
        internal_key: &[u8],
    ) -> Result<Option<(Bytes, Bytes)>> {
        let handle = self.find_table(file_number, file_size)?;
        let result = self
            .cache
            .value(&handle)
            .table
            .internal_get(options, internal_key);
        self.cache.release(handle);
        result
    }

    /// An iterator over the table for `file_number`. The cache handle stays
    /// pinned until the iterator is dropped.
    pub fn iter(
        &self,
        options: ReadOptions,
        file_number: u64,
        file_size: u64,
    ) -> Result<TableCacheIterator> {
        let handle = self.find_table(file_number, file_size)?;
        let table = self.cache.value(&handle).table.clone();
        Ok(TableCacheIterator {
            inner: table.iter(options),
            cache: self.cache.clone(),
            handle: Some(handle),
        })
    }

    /// Drops the cached table for a file that is being deleted.
    pub fn evict(&self, file_number: u64) {
        self.cache.erase(&cache_key(file_number));
    }

    fn find_table(&self, file_number: u64, file_size: u64) -> Result<Handle<TableAndFile>> {
        let key = cache_key(file_number);
        if let Some(handle) = self.cache.lookup(&key) {
            return Ok(handle);
        }

        let table = self.open_table(file_number, file_size)?;
        // Errors are not cached: a transient failure or a repaired file
        // gets a fresh chance on the next lookup.
        Ok(self
            .cache
            .insert(&key, TableAndFile { table }, 1, None))
    }

    fn open_table(&self, file_number: u64, file_size: u64) -> Result<Arc<Table>> {
        let name = table_file_name(&self.db_path, file_number);
        let file = match self.config.env.new_random_access_file(&name) {
            Ok(file) => file,
            Err(open_err) => {
                // Fall back to the historical table suffix.
                let old_name = sst_table_file_name(&self.db_path, file_number);
                match self.config.env.new_random_access_file(&old_name) {
                    Ok(file) => file,
                    Err(_) => {
                        tracing::debug!("table file missing: {}", name.display());
                        return Err(open_err);
                    }
                }
            }
        };
        let table = Table::open(self.config.clone(), file, file_size)?;
        Ok(Arc::new(table))
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }
}

fn cache_key(file_number: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(8);
    put_fixed64(&mut key, file_number);
    key
}

/// Iterator borrowed from a cached table; releases its cache handle when
/// dropped.
pub struct TableCacheIterator {
    inner: crate::table::two_level_iterator::TwoLevelIterator,
    cache: Arc<ShardedLruCache<TableAndFile>>,
    handle: Option<Handle<TableAndFile>>,
}

impl Drop for TableCacheIterator {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.cache.release(handle);
        }
    }
}

impl Iterator for TableCacheIterator {
    fn is_valid(&self) -> bool {
        self.inner.is_valid()
    }

    fn seek_to_first(&mut self) {
        self.inner.seek_to_first();
    }

    fn seek_to_last(&mut self) {
        self.inner.seek_to_last();
    }

    fn seek(&mut self, target: &[u8]) {
        self.inner.seek(target);
    }

    fn next(&mut self) {
        self.inner.next();
    }

    fn prev(&mut self) {
        self.inner.prev();
    }

    fn key(&self) -> &[u8] {
        self.inner.key()
    }

    fn value(&self) -> &[u8] {
        self.inner.value()
    }

    fn status(&mut self) -> Result<()> {
        self.inner.status()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use anyhow::Result;
    use bytes::Bytes;

    use crate::{
        config::{Config, ConfigBuilder},
        filename::{sst_table_file_name, table_file_name},
        iterator::Iterator,
        options::ReadOptions,
        table::TableBuilder,
        table_cache::TableCache,
    };

    fn write_table(
        config: &Arc<Config>,
        path: &std::path::Path,
        entries: &[(&str, &str)],
    ) -> Result<u64> {
        let mut builder = TableBuilder::new(
            config.clone(),
            config.env.new_writable_file(path)?,
        );
        for (k, v) in entries {
            builder.add(k.as_bytes(), v.as_bytes())?;
        }
        builder.finish()?;
        Ok(builder.file_size())
    }

    #[test]
    fn get_through_cache() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = ConfigBuilder::default().build();
        let size = write_table(
            &config,
            &table_file_name(dir.path(), 7),
            &[("aaa", "1"), ("bbb", "2")],
        )?;

        let cache = TableCache::new(dir.path(), config, 100);
        let got = cache.get(&ReadOptions::default(), 7, size, b"bbb")?;
        assert_eq!(got, Some((Bytes::from("bbb"), Bytes::from("2"))));

        // Second get is served by the cached table.
        let got = cache.get(&ReadOptions::default(), 7, size, b"aaa")?;
        assert_eq!(got, Some((Bytes::from("aaa"), Bytes::from("1"))));
        Ok(())
    }

    #[test]
    fn legacy_sst_suffix_is_readable() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = ConfigBuilder::default().build();
        let size = write_table(
            &config,
            &sst_table_file_name(dir.path(), 9),
            &[("k", "v")],
        )?;

        let cache = TableCache::new(dir.path(), config, 100);
        let got = cache.get(&ReadOptions::default(), 9, size, b"k")?;
        assert_eq!(got, Some((Bytes::from("k"), Bytes::from("v"))));
        Ok(())
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConfigBuilder::default().build();
        let cache = TableCache::new(dir.path(), config, 100);
        assert!(cache.get(&ReadOptions::default(), 42, 1024, b"k").is_err());
    }

    #[test]
    fn iterator_pins_and_releases_table() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = ConfigBuilder::default().build();
        let entries: Vec<(String, String)> = (0..100)
            .map(|i| (format!("key-{i:04}"), format!("value-{i}")))
            .collect();
        let borrowed: Vec<(&str, &str)> =
            entries.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        let size = write_table(&config, &table_file_name(dir.path(), 3), &borrowed)?;

        let cache = TableCache::new(dir.path(), config, 100);
        {
            let mut iter = cache.iter(ReadOptions::default(), 3, size)?;
            iter.seek_to_first();
            let mut count = 0;
            while iter.is_valid() {
                count += 1;
                iter.next();
            }
            assert_eq!(count, entries.len());
            iter.status()?;

            // The entry is pinned while the iterator lives; evicting now
            // must not break the iterator.
            cache.evict(3);
            iter.seek(b"key-0050");
            assert!(iter.is_valid());
            assert_eq!(iter.key(), b"key-0050");
        }

        // After the iterator dropped its handle, the table reopens cleanly.
        let got = cache.get(&ReadOptions::default(), 3, size, b"key-0000")?;
        assert_eq!(got, Some((Bytes::from("key-0000"), Bytes::from("value-0"))));
        Ok(())
    }

    #[test]
    fn eviction_forces_reopen() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = ConfigBuilder::default().build();
        let path = table_file_name(dir.path(), 5);
        let size = write_table(&config, &path, &[("k", "v")])?;

        let cache = TableCache::new(dir.path(), config.clone(), 100);
        assert!(cache.get(&ReadOptions::default(), 5, size, b"k")?.is_some());

        // Remove the file; the cached table still answers.
        config.env.remove_file(&path)?;
        assert!(cache.get(&ReadOptions::default(), 5, size, b"k")?.is_some());

        // Until it is evicted.
        cache.evict(5);
        assert!(cache.get(&ReadOptions::default(), 5, size, b"k").is_err());
        Ok(())
    }
}
