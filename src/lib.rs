pub mod comparator;
pub mod config;
pub mod env;
pub mod error;
pub mod filename;
pub mod filter;
pub mod format;
pub mod iterator;
pub mod memtable;
pub mod options;
pub mod table;
pub mod table_cache;
pub mod util;
pub mod wal;

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL_ALLOCATOR: MiMalloc = MiMalloc;

#[ctor::ctor]
fn init() {
    color_backtrace::install();

    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_target(true)
        .with_file(true)
        .with_level(true)
        .without_time()
        .with_thread_ids(true)
        .init();
}
