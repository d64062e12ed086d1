use std::fmt::Debug;

use crate::storage::page::PageKey;

/// Eviction policy of the read cache. All calls happen under the cache's
/// policy mutex.
pub trait Replacer: Send + Sync + Debug {
    /// Note an access to a resident page, admitting it if it is new.
    fn record_access(&mut self, key: PageKey);

    /// Select an unpinned page to evict and stop tracking it. Returns None if
    /// every resident page is pinned.
    fn evict(&mut self) -> Option<PageKey>;

    /// Mark a page as pinned (not evictable). Pins nest.
    fn pin(&mut self, key: PageKey);

    /// Release one pin.
    fn unpin(&mut self, key: PageKey);

    /// Forget a page entirely, including any history.
    fn remove(&mut self, key: PageKey);

    fn is_pinned(&self, key: PageKey) -> bool;

    /// Number of evictable pages.
    fn size(&self) -> usize;
}
