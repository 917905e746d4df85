//! Time-boxed in-memory mirror of recently accessed items.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::backend::Record;

#[derive(Debug)]
struct CacheEntry {
    value: Record,
    inserted_at: Instant,
}

impl CacheEntry {
    fn is_fresh(&self, ttl: Duration) -> bool {
        self.inserted_at.elapsed() < ttl
    }
}

/// TTL cache handing out copies, never shared references.
///
/// While suspended (by one or more batch scopes) every lookup misses and
/// nothing is inserted.
#[derive(Debug)]
pub(crate) struct TtlCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, CacheEntry>>,
    suspended: AtomicUsize,
}

impl TtlCache {
    pub(crate) fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
            suspended: AtomicUsize::new(0),
        }
    }

    pub(crate) fn ttl(&self) -> Duration {
        self.ttl
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_active(&self) -> bool {
        !self.ttl.is_zero() && self.suspended.load(Ordering::SeqCst) == 0
    }

    pub(crate) fn get(&self, id: &str) -> Option<Record> {
        if !self.is_active() {
            return None;
        }

        let mut entries = self.entries();
        let entry = entries.get(id)?;
        if entry.is_fresh(self.ttl) {
            debug!(id, "cache hit");
            return Some(entry.value.clone());
        }

        debug!(id, "cache entry expired");
        entries.remove(id);
        None
    }

    pub(crate) fn put(&self, id: &str, value: Record) {
        if !self.is_active() {
            return;
        }

        self.entries().insert(
            id.to_string(),
            CacheEntry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    pub(crate) fn invalidate(&self, id: &str) {
        self.entries().remove(id);
    }

    pub(crate) fn clear(&self) {
        self.entries().clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.entries().len()
    }

    /// Drop every entry older than the TTL. Returns the number evicted.
    pub(crate) fn evict_expired(&self) -> usize {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, entry| entry.is_fresh(self.ttl));
        before - entries.len()
    }

    pub(crate) fn suspend(&self) {
        self.suspended.fetch_add(1, Ordering::SeqCst);
    }

    /// End one suspension and clear everything.
    pub(crate) fn resume(&self) {
        let previous = self.suspended.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "cache resumed more often than suspended");
        self.clear();
    }
}
