//! Per-name read/write locks
//!
//! The device primitives touch host-global state without locking. Callers
//! that run volume operations concurrently serialize them per WWN through
//! [`NamedLocks`]: writers (attach/detach) exclude each other and readers
//! (health checks) on the same name. Entries nobody holds are evicted once
//! idle for longer than a caller-chosen age.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use tracing::debug;

struct Entry {
    lock: RwLock<()>,
    last_used: Mutex<Instant>,
}

impl Entry {
    fn touch(&self) {
        *self.last_used.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_used
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }
}

#[derive(Default)]
pub struct NamedLocks {
    entries: Mutex<HashMap<String, Arc<Entry>>>,
}

impl NamedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, name: &str) -> Arc<Entry> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = entries
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(Entry {
                    lock: RwLock::new(()),
                    last_used: Mutex::new(Instant::now()),
                })
            })
            .clone();
        entry.touch();
        entry
    }

    /// Run `f` while holding the shared lock of `name`.
    pub fn with_read<T>(&self, name: &str, f: impl FnOnce() -> T) -> T {
        let entry = self.entry(name);
        let _guard = entry.lock.read().unwrap_or_else(PoisonError::into_inner);
        let result = f();
        entry.touch();
        result
    }

    /// Run `f` while holding the exclusive lock of `name`.
    pub fn with_write<T>(&self, name: &str, f: impl FnOnce() -> T) -> T {
        let entry = self.entry(name);
        let _guard = entry.lock.write().unwrap_or_else(PoisonError::into_inner);
        let result = f();
        entry.touch();
        result
    }

    /// Drop entries that are not held and were last used more than
    /// `max_idle` ago. Returns the number of entries removed.
    pub fn evict_stale(&self, max_idle: Duration) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|name, entry| {
            let keep = Arc::strong_count(entry) > 1 || entry.idle_for() <= max_idle;
            if !keep {
                debug!(name = %name, "Evicting idle lock");
            }
            keep
        });
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
