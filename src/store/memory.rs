//! In-process store.
//!
//! Runs the same procedures as the Redis scripts, natively, while holding the
//! key's map shard locked. Good for tests and single-process deployments; it
//! shares nothing across processes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, trace};

use super::{AtomicStore, StoreError};
use crate::clock::{Clock, SystemClock};
use crate::ratelimit::{Procedure, Reply, StoredState};

/// One key's value and its expiry, in epoch seconds.
#[derive(Debug, Default)]
struct Slot {
    state: Option<StoredState>,
    expires_at: Option<f64>,
}

impl Slot {
    fn is_live(&self, now: f64) -> bool {
        self.state.is_some() && self.expires_at.map_or(true, |at| now < at)
    }

    fn expire_if_due(&mut self, now: f64) {
        if !self.is_live(now) {
            self.state = None;
            self.expires_at = None;
        }
    }
}

/// Executions between sweeps of expired keys.
const SWEEP_EVERY: u64 = 1024;

/// A [`DashMap`]-backed [`AtomicStore`].
///
/// Expired keys are dropped when touched again and by a full sweep every
/// [`SWEEP_EVERY`] executions, so identifiers that never come back do not
/// pin memory.
#[derive(Debug)]
pub struct MemoryStore {
    entries: DashMap<String, Slot>,
    clock: Arc<dyn Clock>,
    executions: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store that expires keys by the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty store that expires keys by `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
            executions: AtomicU64::new(0),
        }
    }

    /// Drop every expired key. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_secs();
        let mut removed = 0;
        self.entries.retain(|_, slot| {
            let live = slot.is_live(now);
            if !live {
                removed += 1;
            }
            live
        });

        if removed > 0 {
            debug!(removed = removed, remaining = self.entries.len(), "Purged expired keys");
        }
        removed
    }

    /// Number of stored slots, expired ones not yet swept included.
    pub fn stored_len(&self) -> usize {
        self.entries.len()
    }

    /// Number of live keys.
    pub fn key_count(&self) -> usize {
        let now = self.clock.now_secs();
        self.entries.iter().filter(|e| e.is_live(now)).count()
    }

    /// Number of logged requests under a sliding window key, expired or not
    /// yet pruned entries included. `None` if the key holds no log.
    pub fn log_len(&self, key: &str) -> Option<usize> {
        let now = self.clock.now_secs();
        let slot = self.entries.get(key)?;
        match &slot.state {
            Some(StoredState::Log(log)) if slot.is_live(now) => Some(log.len()),
            _ => None,
        }
    }

    /// Seconds of inactivity left before `key` expires.
    pub fn ttl(&self, key: &str) -> Option<f64> {
        let now = self.clock.now_secs();
        let slot = self.entries.get(key)?;
        if !slot.is_live(now) {
            return None;
        }
        slot.expires_at.map(|at| at - now)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AtomicStore for MemoryStore {
    async fn execute(&self, key: &str, procedure: &Procedure) -> Result<Reply, StoreError> {
        let now = self.clock.now_secs();

        let (reply, emptied) = {
            // The shard stays write-locked until `slot` drops, which makes the
            // procedure atomic with respect to every other call on this key.
            let mut slot = self.entries.entry(key.to_string()).or_default();
            slot.expire_if_due(now);

            let reply = procedure.apply(key, &mut slot.state)?;
            if let Some(ttl) = procedure.ttl_seconds().filter(|_| slot.state.is_some()) {
                slot.expires_at = Some(now + ttl as f64);
            }
            (reply, slot.state.is_none())
        };

        if emptied {
            self.entries.remove_if(key, |_, slot| slot.state.is_none());
        }

        if self.executions.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            self.purge_expired();
        }

        trace!(key = %key, procedure = procedure.name(), "Executed procedure in memory");
        Ok(reply)
    }

    async fn delete_key(&self, key: &str) -> Result<bool, StoreError> {
        let now = self.clock.now_secs();
        Ok(self
            .entries
            .remove(key)
            .map_or(false, |(_, slot)| slot.is_live(now)))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ratelimit::sliding_window::WindowParams;
    use crate::ratelimit::token_bucket::BucketParams;
    use crate::ratelimit::{Quota, Usage};
    use std::time::Duration;

    fn store() -> (MemoryStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Duration::from_secs(1_000)));
        (MemoryStore::with_clock(clock.clone()), clock)
    }

    fn take(clock: &ManualClock) -> Procedure {
        Procedure::TakeToken(BucketParams::new(&Quota::new(2, 10).unwrap(), clock.now_nanos()))
    }

    #[tokio::test]
    async fn test_execute_persists_state() {
        let (store, clock) = store();

        let first = store.execute("token_bucket:a", &take(&clock)).await.unwrap();
        let second = store.execute("token_bucket:a", &take(&clock)).await.unwrap();
        let third = store.execute("token_bucket:a", &take(&clock)).await.unwrap();

        assert!(matches!(first, Reply::Decision(d) if d.allowed && d.remaining == 1));
        assert!(matches!(second, Reply::Decision(d) if d.allowed && d.remaining == 0));
        assert!(matches!(third, Reply::Decision(d) if !d.allowed));
        assert_eq!(store.key_count(), 1);
    }

    #[tokio::test]
    async fn test_ttl_is_twice_the_window() {
        let (store, clock) = store();
        store.execute("token_bucket:a", &take(&clock)).await.unwrap();

        assert_eq!(store.ttl("token_bucket:a"), Some(20.0));
    }

    #[tokio::test]
    async fn test_key_expires_after_inactivity() {
        let (store, clock) = store();
        store.execute("token_bucket:a", &take(&clock)).await.unwrap();

        clock.advance(Duration::from_secs(20));
        assert_eq!(store.key_count(), 0);
        assert!(!store.delete_key("token_bucket:a").await.unwrap());
    }

    #[tokio::test]
    async fn test_purge_drops_expired_keys() {
        let (store, clock) = store();
        for i in 0..10 {
            store.execute(&format!("token_bucket:ip{}", i), &take(&clock)).await.unwrap();
        }

        assert_eq!(store.purge_expired(), 0);
        clock.advance(Duration::from_secs(3_600));
        assert_eq!(store.stored_len(), 10);

        assert_eq!(store.purge_expired(), 10);
        assert_eq!(store.stored_len(), 0);
    }

    #[tokio::test]
    async fn test_one_shot_keys_are_swept_without_being_touched() {
        let (store, clock) = store();
        for i in 0..SWEEP_EVERY {
            store.execute(&format!("token_bucket:ip{}", i), &take(&clock)).await.unwrap();
        }
        assert_eq!(store.stored_len(), SWEEP_EVERY as usize);

        clock.advance(Duration::from_secs(3_600));
        for _ in 0..SWEEP_EVERY {
            store.execute("token_bucket:busy", &take(&clock)).await.unwrap();
        }

        assert_eq!(store.key_count(), 1);
        assert_eq!(store.stored_len(), 1);
    }

    #[tokio::test]
    async fn test_delete_reports_existence() {
        let (store, clock) = store();
        assert!(!store.delete_key("token_bucket:a").await.unwrap());

        store.execute("token_bucket:a", &take(&clock)).await.unwrap();
        assert!(store.delete_key("token_bucket:a").await.unwrap());
        assert!(!store.delete_key("token_bucket:a").await.unwrap());
    }

    #[tokio::test]
    async fn test_inspect_on_missing_key_leaves_no_key() {
        let (store, clock) = store();
        let params = WindowParams::new(&Quota::new(3, 60).unwrap(), clock.now_millis());

        let reply = store
            .execute("sliding_window:a", &Procedure::InspectWindow(params))
            .await
            .unwrap();

        assert_eq!(
            reply,
            Reply::Usage(Usage {
                used: 0,
                remaining: 3,
                reset_in_seconds: 60.0,
            })
        );
        assert_eq!(store.key_count(), 0);
    }
}
