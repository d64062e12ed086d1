//! Page caching: a bounded read cache in front of the write cache that owns
//! page files and dirty pages.

pub mod read_cache;
pub mod replacer;
pub mod two_q;
pub mod write_cache;

pub use read_cache::{CacheStats, ExhaustionPolicy, PageReadGuard, PageWriteGuard, ReadCache};
pub use replacer::Replacer;
pub use two_q::TwoQueueReplacer;
pub use write_cache::WriteCache;
