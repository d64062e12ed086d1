//! 2Q replacement policy.
//!
//! * **A1-in**: FIFO of pages accessed once.
//! * **A1-out**: ghost FIFO remembering identities recently aged out of A1-in
//!   (no page data), bounded to half the cache capacity.
//! * **Am**: LRU of pages accessed at least twice.
//!
//! A second access while a page is in A1-in or A1-out promotes it to Am.
//! Victims come from the head of A1-in first, then from the LRU end of Am.

use std::collections::HashMap;
use std::num::NonZeroUsize;

use lru::LruCache;

use super::replacer::Replacer;
use crate::storage::page::PageKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Queue {
    A1In,
    A1Out,
    Am,
}

#[derive(Debug)]
pub struct TwoQueueReplacer {
    a1_in: LruCache<PageKey, ()>,
    a1_out: LruCache<PageKey, ()>,
    am: LruCache<PageKey, ()>,
    pins: HashMap<PageKey, usize>,
}

impl TwoQueueReplacer {
    pub fn new(capacity: usize) -> Self {
        let ghost_capacity = NonZeroUsize::new((capacity / 2).max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            a1_in: LruCache::unbounded(),
            a1_out: LruCache::new(ghost_capacity),
            am: LruCache::unbounded(),
            pins: HashMap::new(),
        }
    }

    /// Which queue currently holds `key`.
    pub fn queue_of(&self, key: PageKey) -> Option<Queue> {
        if self.a1_in.contains(&key) {
            Some(Queue::A1In)
        } else if self.am.contains(&key) {
            Some(Queue::Am)
        } else if self.a1_out.contains(&key) {
            Some(Queue::A1Out)
        } else {
            None
        }
    }

    fn pinned(&self, key: &PageKey) -> bool {
        self.pins.get(key).is_some_and(|count| *count > 0)
    }

    /// Oldest unpinned entry of a queue; `iter().rev()` walks from the
    /// least recently inserted end.
    fn oldest_unpinned(&self, queue: &LruCache<PageKey, ()>) -> Option<PageKey> {
        queue
            .iter()
            .rev()
            .map(|(key, _)| *key)
            .find(|key| !self.pinned(key))
    }
}

impl Replacer for TwoQueueReplacer {
    fn record_access(&mut self, key: PageKey) {
        if self.am.contains(&key) {
            self.am.promote(&key);
        } else if self.a1_in.pop(&key).is_some() || self.a1_out.pop(&key).is_some() {
            self.am.put(key, ());
        } else {
            self.a1_in.put(key, ());
        }
    }

    fn evict(&mut self) -> Option<PageKey> {
        if let Some(victim) = self.oldest_unpinned(&self.a1_in) {
            self.a1_in.pop(&victim);
            self.a1_out.put(victim, ());
            self.pins.remove(&victim);
            return Some(victim);
        }
        if let Some(victim) = self.oldest_unpinned(&self.am) {
            self.am.pop(&victim);
            self.pins.remove(&victim);
            return Some(victim);
        }
        None
    }

    fn pin(&mut self, key: PageKey) {
        *self.pins.entry(key).or_insert(0) += 1;
    }

    fn unpin(&mut self, key: PageKey) {
        if let Some(count) = self.pins.get_mut(&key) {
            *count -= 1;
            if *count == 0 {
                self.pins.remove(&key);
            }
        }
    }

    fn remove(&mut self, key: PageKey) {
        self.a1_in.pop(&key);
        self.a1_out.pop(&key);
        self.am.pop(&key);
        self.pins.remove(&key);
    }

    fn is_pinned(&self, key: PageKey) -> bool {
        self.pinned(&key)
    }

    fn size(&self) -> usize {
        let resident = self.a1_in.len() + self.am.len();
        let pinned = self
            .pins
            .keys()
            .filter(|key| self.a1_in.contains(*key) || self.am.contains(*key))
            .count();
        resident - pinned
    }
}
