//! Time-bounded map used to remember routing decisions

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::trace;

/// Writes between two cleanup scans
pub const CLEANUP_THRESHOLD: u32 = 1000;

struct Entry<V> {
    value: V,
    /// `None` when the deadline lies past what `Instant` can represent
    valid_until: Option<Instant>,
}

impl<V> Entry<V> {
    fn is_valid(&self, now: Instant) -> bool {
        self.valid_until.map_or(true, |until| now < until)
    }
}

struct Inner<K, V> {
    entries: RwLock<HashMap<K, Entry<V>>>,
    ops: AtomicU32,
}

/// Map whose entries expire a fixed time after being written.
///
/// Expired entries are invisible to `get` and are purged by a scan that runs
/// every [`CLEANUP_THRESHOLD`] writes. Cloning shares the map.
pub struct ValidityMap<K, V> {
    inner: Arc<Inner<K, V>>,
}

impl<K, V> Clone for ValidityMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> Default for ValidityMap<K, V> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: RwLock::new(HashMap::new()),
                ops: AtomicU32::new(0),
            }),
        }
    }
}

impl<K, V> ValidityMap<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Value for `key` if present and not expired
    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        self.inner
            .entries
            .read()
            .get(key)
            .filter(|entry| entry.is_valid(now))
            .map(|entry| entry.value.clone())
    }

    /// Store `value`, valid for `ttl` from now. A `ttl` too large to
    /// represent never expires.
    pub fn set(&self, key: K, value: V, ttl: Duration) {
        let entry = Entry {
            value,
            valid_until: Instant::now().checked_add(ttl),
        };
        self.inner.entries.write().insert(key, entry);

        if self.inner.ops.fetch_add(1, Ordering::AcqRel) + 1 >= CLEANUP_THRESHOLD {
            self.inner.ops.store(0, Ordering::Release);
            self.schedule_cleanup();
        }
    }

    /// Number of stored entries, expired ones included
    pub fn len(&self) -> usize {
        self.inner.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn schedule_cleanup(&self) {
        let map = self.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || map.cleanup());
            }
            Err(_) => map.cleanup(),
        }
    }

    /// Purge expired entries.
    pub fn cleanup(&self) {
        let now = Instant::now();
        let expired = self.expired_keys(now);
        let removed = self.remove_expired(&expired, now);
        trace!("ValidityMap: removed {} expired entries", removed);
    }

    fn expired_keys(&self, now: Instant) -> Vec<K> {
        self.inner
            .entries
            .read()
            .iter()
            .filter(|(_, entry)| !entry.is_valid(now))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Delete `keys` whose *current* entry is still expired; entries
    /// rewritten since the scan survive.
    fn remove_expired(&self, keys: &[K], now: Instant) -> usize {
        let mut entries = self.inner.entries.write();
        let mut removed = 0;
        for key in keys {
            let still_expired = entries.get(key).map(|e| !e.is_valid(now)).unwrap_or(false);
            if still_expired {
                entries.remove(key);
                removed += 1;
            }
        }
        removed
    }
}
