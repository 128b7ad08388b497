//! In-memory byte cache with per-entry TTLs and size-bounded eviction.
//!
//! Eviction is deliberately lazy: expired entries linger until a sweep runs.
//! A single sweep is scheduled after the first insert with a non-zero TTL;
//! inserting a payload larger than the soft limit cancels the scheduled sweep
//! and runs one immediately, and letting the tracked size grow past the hard
//! limit flushes everything.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use tokio::task::AbortHandle;

#[derive(Debug)]
struct Entry {
    data: Vec<u8>,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct Inner {
    data: HashMap<String, Entry>,
    size: usize,
    sweep: Option<AbortHandle>,
}

/// Cheaply cloneable handle; clones share the same store.
#[derive(Debug, Clone)]
pub struct MemoryCache {
    inner: Arc<Mutex<Inner>>,
    soft_limit: usize,
    hard_limit: usize,
}

impl MemoryCache {
    pub fn new(soft_limit: usize, hard_limit: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            soft_limit,
            hard_limit,
        }
    }

    /// Returns the stored bytes for `key` if the entry has not expired.
    /// A miss never evicts.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        inner
            .data
            .get(key)
            .filter(|e| Instant::now() < e.expires_at)
            .map(|e| e.data.clone())
    }

    /// Inserts or replaces `key`. A `ttl` of zero stores an entry that is
    /// already expired and schedules no sweep for it.
    ///
    /// Replacing a key adds the new payload's length to the tracked size
    /// without subtracting the old one; the counter is conservative, and the
    /// hard-limit flush bounds the drift.
    pub fn set(&self, key: &str, data: Vec<u8>, ttl: Duration) {
        let size = data.len();
        let mut inner = self.inner.lock().unwrap();

        // About to hit the soft limit: cancel the scheduled sweep and run it now
        if size > self.soft_limit {
            if let Some(handle) = inner.sweep.take() {
                handle.abort();
            }
            Self::sweep(&mut inner);
        }

        // About to hit the hard limit: flush all entries
        if inner.size > self.hard_limit {
            inner.data.clear();
            inner.size = 0;
        }

        inner.data.insert(
            key.to_string(),
            Entry {
                data,
                expires_at: Instant::now() + ttl,
            },
        );
        inner.size += size;

        if inner.sweep.is_none() && ttl > Duration::ZERO {
            let cache = self.clone();
            let task = tokio::spawn(async move {
                tokio::time::sleep(ttl).await;
                cache.flush_expired();
            });
            inner.sweep = Some(task.abort_handle());
        }
    }

    /// Removes every expired entry, returning the removed keys. Consumes the
    /// scheduled sweep, if any; the next `set` may schedule a fresh one.
    pub fn flush_expired(&self) -> Vec<String> {
        let mut inner = self.inner.lock().unwrap();
        inner.sweep = None;
        Self::sweep(&mut inner)
    }

    /// Drops every entry and zeroes the tracked size.
    pub fn flush_all(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.data.clear();
        inner.size = 0;
    }

    /// Sum of inserted payload lengths not yet reclaimed by a sweep or flush.
    pub fn size(&self) -> usize {
        self.inner.lock().unwrap().size
    }

    /// Number of entries, expired or not.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn sweep(inner: &mut Inner) -> Vec<String> {
        let now = Instant::now();
        let expired: Vec<String> = inner
            .data
            .iter()
            .filter(|(_, e)| e.expires_at < now)
            .map(|(k, _)| k.clone())
            .collect();

        for key in &expired {
            if let Some(entry) = inner.data.remove(key) {
                inner.size -= entry.data.len();
            }
        }

        expired
    }
}
