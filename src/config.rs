use std::sync::Arc;

use crate::{
    comparator::{bytewise, Comparator},
    env::{std_env, Env},
    filter::FilterPolicy,
    options::CompressionType,
    table::BlockCache,
};

/// Engine-wide tuning knobs, shared immutably once built.
pub struct Config {
    pub(crate) comparator: Arc<dyn Comparator>,

    /// Uncompressed size threshold that closes a data block.
    pub(crate) block_size: usize,

    /// Entries between restart points in data blocks.
    pub(crate) block_restart_interval: u32,

    pub(crate) compression_type: CompressionType,

    pub(crate) filter_policy: Option<Arc<dyn FilterPolicy>>,

    pub(crate) block_cache: Option<Arc<BlockCache>>,

    pub(crate) env: Arc<dyn Env>,

    /// Verify checksums on every internal read, not just when asked.
    pub(crate) paranoid_checks: bool,
}

impl Config {
    pub fn comparator(&self) -> &Arc<dyn Comparator> {
        &self.comparator
    }

    pub fn env(&self) -> &Arc<dyn Env> {
        &self.env
    }
}

pub struct ConfigBuilder {
    comparator: Arc<dyn Comparator>,
    block_size: usize,
    block_restart_interval: u32,
    compression_type: CompressionType,
    filter_policy: Option<Arc<dyn FilterPolicy>>,
    block_cache: Option<Arc<BlockCache>>,
    env: Arc<dyn Env>,
    paranoid_checks: bool,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self {
            comparator: bytewise(),
            block_size: 4 * 1024,
            block_restart_interval: 16,
            compression_type: CompressionType::Snappy,
            filter_policy: None,
            block_cache: None,
            env: std_env(),
            paranoid_checks: false,
        }
    }
}

impl ConfigBuilder {
    pub fn comparator(mut self, comparator: Arc<dyn Comparator>) -> Self {
        self.comparator = comparator;
        self
    }

    pub fn block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn block_restart_interval(mut self, interval: u32) -> Self {
        self.block_restart_interval = interval;
        self
    }

    pub fn compression_type(mut self, ty: CompressionType) -> Self {
        self.compression_type = ty;
        self
    }

    pub fn filter_policy(mut self, policy: Arc<dyn FilterPolicy>) -> Self {
        self.filter_policy = Some(policy);
        self
    }

    pub fn block_cache(mut self, cache: Arc<BlockCache>) -> Self {
        self.block_cache = Some(cache);
        self
    }

    pub fn env(mut self, env: Arc<dyn Env>) -> Self {
        self.env = env;
        self
    }

    pub fn paranoid_checks(mut self, paranoid: bool) -> Self {
        self.paranoid_checks = paranoid;
        self
    }

    pub fn build(self) -> Arc<Config> {
        assert!(
            self.block_restart_interval > 0,
            "required block_restart_interval > 0"
        );
        Arc::new(Config {
            comparator: self.comparator,
            block_size: self.block_size,
            block_restart_interval: self.block_restart_interval,
            compression_type: self.compression_type,
            filter_policy: self.filter_policy,
            block_cache: self.block_cache,
            env: self.env,
            paranoid_checks: self.paranoid_checks,
        })
    }
}
