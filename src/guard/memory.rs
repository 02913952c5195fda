//! In-process counter store.
//!
//! Used when no shared store is configured or reachable.  Counters live in
//! this process only: two replicas each keep their own windows, so a user
//! balanced across N replicas effectively gets N times the quota.  That is a
//! consistency boundary of the fallback, not something it tries to fix.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;

use super::store::CounterStore;
use crate::error::RelayError;

#[derive(Debug, Clone, Copy)]
struct Entry {
    value: i64,
    expires_at: Instant,
}

impl Entry {
    fn live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Increments between two sweeps of expired keys.
const SWEEP_EVERY: u64 = 4096;

/// `DashMap` backed store with lazy expiry: an entry is dropped the first
/// time it is touched after its deadline.  Keys of users who never come back
/// are never touched again, so every `SWEEP_EVERY` increments the writer also
/// drops whatever has expired.  Without it the map grows with the number of
/// distinct users seen since start.
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
    writes: AtomicU64,
    sweep_every: u64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_sweep_every(SWEEP_EVERY)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sweep_every(sweep_every: u64) -> Self {
        Self {
            entries: DashMap::new(),
            writes: AtomicU64::new(0),
            sweep_every: sweep_every.max(1),
        }
    }

    /// Drops every expired key.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.entries.retain(|_, e| e.live(now));
    }

    fn maybe_sweep(&self) {
        let n = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if n % self.sweep_every == 0 {
            self.sweep();
        }
    }

    /// Number of keys currently held, expired or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn live_entry(&self, key: &str) -> Option<Entry> {
        let now = Instant::now();
        let entry = self.entries.get(key).map(|e| *e.value())?;
        if entry.live(now) {
            Some(entry)
        } else {
            self.entries.remove_if(key, |_, e| !e.live(now));
            None
        }
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<i64, RelayError> {
        let now = Instant::now();
        let value = {
            // The shard lock held by `entry` makes the read-modify-write atomic.
            let mut slot = self.entries.entry(key.to_string()).or_insert(Entry {
                value: 0,
                expires_at: now + ttl,
            });
            let entry = slot.value_mut();
            if !entry.live(now) {
                entry.value = 0;
                entry.expires_at = now + ttl;
            }
            entry.value += 1;
            entry.value
        };
        // `retain` takes every shard lock, so the slot must be released first.
        self.maybe_sweep();
        Ok(value)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, RelayError> {
        Ok(self
            .live_entry(key)
            .map(|e| e.expires_at.saturating_duration_since(Instant::now())))
    }

    async fn set_with_expiry(
        &self,
        key: &str,
        value: i64,
        ttl: Duration,
    ) -> Result<(), RelayError> {
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn get_int(&self, key: &str) -> Result<Option<i64>, RelayError> {
        Ok(self.live_entry(key).map(|e| e.value))
    }

    fn kind(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn counter_restarts_at_one_after_window() {
        let store = MemoryStore::new();
        let w = Duration::from_secs(60);
        assert_eq!(store.incr_with_expiry("k", w).await.unwrap(), 1);
        assert_eq!(store.incr_with_expiry("k", w).await.unwrap(), 2);
        // Window is fixed: later increments do not push the expiry out.
        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(store.incr_with_expiry("k", w).await.unwrap(), 3);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(store.incr_with_expiry("k", w).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_are_dropped_on_read() {
        let store = MemoryStore::new();
        store
            .set_with_expiry("ban", 600, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(store.get_int("ban").await.unwrap(), Some(600));
        assert_eq!(
            store.ttl("ban").await.unwrap(),
            Some(Duration::from_secs(10))
        );
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(store.len(), 1);
        assert_eq!(store.ttl("ban").await.unwrap(), None);
        assert!(store.is_empty());
        assert_eq!(store.get_int("ban").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn departed_users_are_swept() {
        let store = MemoryStore::with_sweep_every(4);
        let w = Duration::from_secs(60);
        for user in ["a", "b", "c"] {
            store.incr_with_expiry(user, w).await.unwrap();
        }
        assert_eq!(store.len(), 3);
        tokio::time::advance(w).await;

        // The fourth write triggers a sweep; only the new key survives.
        store.incr_with_expiry("d", w).await.unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get_int("d").await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn concurrent_increments_are_not_lost() {
        let store = std::sync::Arc::new(MemoryStore::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let s = store.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..25 {
                    s.incr_with_expiry("hot", Duration::from_secs(60))
                        .await
                        .unwrap();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(store.get_int("hot").await.unwrap(), Some(400));
    }
}
