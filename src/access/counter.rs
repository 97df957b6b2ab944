//! Atomic expiring counters shared by the rate limiter and the lockout guard.
//!
//! Flow Overview:
//! 1) `increment_and_get` creates the counter on first use with `expires_at = now + ttl`.
//! 2) Later increments inside the window bump the count without moving the expiry.
//! 3) An increment after expiry starts a fresh window with count 1.
//!
//! The increment is a single atomic step per key, so concurrent callers always
//! observe distinct counts and a cancelled caller never leaves a partial update.
//! Keys never contend with each other beyond the map shard they hash into.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::{DashMap, mapref::entry::Entry};
use std::{fmt, sync::Arc};

use super::clock::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterValue {
    pub count: u64,
    pub window_start: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CounterValue {
    fn fresh(now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            count: 1,
            window_start: now,
            expires_at: now + ttl,
        }
    }

    #[must_use]
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Storage seam for counters. Multi-instance deployments must back this with a
/// shared store or lockout and rate limits only hold per instance.
#[async_trait]
pub trait CounterStore: Send + Sync + fmt::Debug {
    /// Atomically increment `key`, starting a new window of length `ttl` when absent or expired.
    async fn increment_and_get(&self, key: &str, ttl: Duration) -> Result<CounterValue>;

    /// Current live value, `None` when absent or expired.
    async fn get(&self, key: &str) -> Result<Option<CounterValue>>;

    async fn reset(&self, key: &str) -> Result<()>;

    /// Drop expired counters. Returns how many were removed.
    async fn purge_expired(&self) -> Result<u64>;
}

/// Single-instance counter store.
#[derive(Debug)]
pub struct MemoryCounterStore {
    counters: DashMap<String, CounterValue>,
    clock: Arc<dyn Clock>,
}

impl MemoryCounterStore {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            counters: DashMap::new(),
            clock,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment_and_get(&self, key: &str, ttl: Duration) -> Result<CounterValue> {
        let now = self.clock.now();
        // The shard lock is held for the whole read-modify-write.
        let value = match self.counters.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let counter = occupied.get_mut();
                if counter.is_live(now) {
                    counter.count = counter.count.saturating_add(1);
                } else {
                    *counter = CounterValue::fresh(now, ttl);
                }
                *counter
            }
            Entry::Vacant(vacant) => *vacant.insert(CounterValue::fresh(now, ttl)),
        };
        Ok(value)
    }

    async fn get(&self, key: &str) -> Result<Option<CounterValue>> {
        let now = self.clock.now();
        Ok(self
            .counters
            .get(key)
            .map(|entry| *entry.value())
            .filter(|value| value.is_live(now)))
    }

    async fn reset(&self, key: &str) -> Result<()> {
        self.counters.remove(key);
        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64> {
        let now = self.clock.now();
        let before = self.counters.len();
        self.counters.retain(|_, value| value.is_live(now));
        Ok(u64::try_from(before.saturating_sub(self.counters.len())).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::clock::ManualClock;

    fn store() -> (Arc<ManualClock>, MemoryCounterStore) {
        let clock = Arc::new(ManualClock::starting_now());
        let store = MemoryCounterStore::new(clock.clone());
        (clock, store)
    }

    #[tokio::test]
    async fn increments_within_window_keep_expiry() -> Result<()> {
        let (clock, store) = store();
        let first = store.increment_and_get("k", Duration::seconds(60)).await?;
        clock.advance(Duration::seconds(10));
        let second = store.increment_and_get("k", Duration::seconds(60)).await?;

        assert_eq!(first.count, 1);
        assert_eq!(second.count, 2);
        assert_eq!(first.expires_at, second.expires_at);
        assert_eq!(second.window_start, first.window_start);
        Ok(())
    }

    #[tokio::test]
    async fn increment_after_expiry_starts_new_window() -> Result<()> {
        let (clock, store) = store();
        store.increment_and_get("k", Duration::seconds(60)).await?;
        store.increment_and_get("k", Duration::seconds(60)).await?;
        clock.advance(Duration::seconds(60));

        assert_eq!(store.get("k").await?, None);
        let value = store.increment_and_get("k", Duration::seconds(60)).await?;
        assert_eq!(value.count, 1);
        assert_eq!(value.window_start, clock.now());
        Ok(())
    }

    #[tokio::test]
    async fn reset_removes_counter() -> Result<()> {
        let (_clock, store) = store();
        store.increment_and_get("k", Duration::seconds(60)).await?;
        store.reset("k").await?;
        assert_eq!(store.get("k").await?, None);
        assert!(store.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn purge_drops_only_expired() -> Result<()> {
        let (clock, store) = store();
        store.increment_and_get("short", Duration::seconds(5)).await?;
        store.increment_and_get("long", Duration::seconds(500)).await?;
        clock.advance(Duration::seconds(10));

        assert_eq!(store.purge_expired().await?, 1);
        assert_eq!(store.len(), 1);
        assert!(store.get("long").await?.is_some());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_increments_observe_distinct_counts() -> Result<()> {
        let (_clock, store) = store();
        let store = Arc::new(store);
        let mut handles = Vec::new();
        for _ in 0..64 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.increment_and_get("hot", Duration::seconds(60)).await
            }));
        }

        let mut counts = Vec::new();
        for handle in handles {
            counts.push(handle.await??.count);
        }
        counts.sort_unstable();
        let expected: Vec<u64> = (1..=64).collect();
        assert_eq!(counts, expected);
        Ok(())
    }
}
