// ============================
// crates/backend-lib/src/lease_store.rs
// ============================
//! Lease storage abstraction with an in-memory implementation.
//!
//! The store is the only shared mutable resource of the coordinator. Every
//! mutating operation is atomic per `ChapterKey`; callers never read a lease
//! and write it back outside these operations.
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::clock::{add_duration, Clock, SystemClock};
use crate::ids::{ChapterKey, ConnectionId, UserIdentity};

/// Exclusive, time-bounded edit ownership of one chapter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub key: ChapterKey,
    pub owner_connection: ConnectionId,
    pub owner: UserIdentity,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    /// A lease past `expires_at` is logically absent even if not yet swept.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// Result of `try_acquire`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    Granted {
        lease: Lease,
        /// The caller already owned the live lease and only extended it
        renewed: bool,
        /// Expired lease of another connection that this grant replaced
        displaced: Option<Lease>,
    },
    Denied {
        holder: Lease,
    },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("lease store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Trait for lease store backends
///
/// Implementations must linearize all mutations of the same key. A networked
/// implementation has to offer the same guarantee through conditional writes.
pub trait LeaseStore: Send + Sync {
    /// Grant the lease if it is absent, expired, or already owned by `connection_id`.
    fn try_acquire(
        &self,
        key: &ChapterKey,
        connection_id: ConnectionId,
        owner: &UserIdentity,
        ttl: Duration,
    ) -> StoreResult<AcquireOutcome>;

    /// Extend a live lease owned by `connection_id`. `false` means ownership was lost.
    fn renew(&self, key: &ChapterKey, connection_id: ConnectionId, ttl: Duration)
        -> StoreResult<bool>;

    /// Remove the lease only if owned by `connection_id`.
    fn release(&self, key: &ChapterKey, connection_id: ConnectionId) -> StoreResult<bool>;

    /// Remove and return the lease if it has expired, whoever owns it.
    fn force_expire(&self, key: &ChapterKey) -> StoreResult<Option<Lease>>;

    /// Current live lease, if any.
    fn get(&self, key: &ChapterKey) -> StoreResult<Option<Lease>>;

    /// Every live lease in a story.
    fn story_leases(&self, story_id: &str) -> StoreResult<Vec<Lease>>;

    /// Keys whose lease has expired but is still stored.
    fn expired_keys(&self) -> StoreResult<Vec<ChapterKey>>;
}

/// Process-local lease store backed by a sharded map
pub struct InMemoryLeaseStore {
    leases: DashMap<ChapterKey, Lease>,
    clock: Arc<dyn Clock>,
}

impl InMemoryLeaseStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            leases: DashMap::new(),
            clock,
        }
    }

    /// Number of stored leases, including expired ones not yet swept
    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }
}

impl Default for InMemoryLeaseStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl LeaseStore for InMemoryLeaseStore {
    fn try_acquire(
        &self,
        key: &ChapterKey,
        connection_id: ConnectionId,
        owner: &UserIdentity,
        ttl: Duration,
    ) -> StoreResult<AcquireOutcome> {
        let now = self.clock.now();
        let expires_at = add_duration(now, ttl);
        let fresh = Lease {
            key: key.clone(),
            owner_connection: connection_id,
            owner: owner.clone(),
            acquired_at: now,
            expires_at,
        };

        // The entry guard holds the shard lock, so the check and the write are one step.
        let outcome = match self.leases.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                let current = entry.get_mut();
                if current.is_live(now) {
                    if current.owner_connection == connection_id {
                        current.expires_at = expires_at;
                        AcquireOutcome::Granted {
                            lease: current.clone(),
                            renewed: true,
                            displaced: None,
                        }
                    } else {
                        AcquireOutcome::Denied {
                            holder: current.clone(),
                        }
                    }
                } else {
                    let previous = entry.insert(fresh.clone());
                    let displaced = (previous.owner_connection != connection_id).then_some(previous);
                    AcquireOutcome::Granted {
                        lease: fresh,
                        renewed: false,
                        displaced,
                    }
                }
            },
            Entry::Vacant(entry) => {
                entry.insert(fresh.clone());
                AcquireOutcome::Granted {
                    lease: fresh,
                    renewed: false,
                    displaced: None,
                }
            },
        };

        Ok(outcome)
    }

    fn renew(
        &self,
        key: &ChapterKey,
        connection_id: ConnectionId,
        ttl: Duration,
    ) -> StoreResult<bool> {
        let now = self.clock.now();
        let Some(mut lease) = self.leases.get_mut(key) else {
            return Ok(false);
        };
        if lease.owner_connection != connection_id || !lease.is_live(now) {
            return Ok(false);
        }
        lease.expires_at = add_duration(now, ttl);
        Ok(true)
    }

    fn release(&self, key: &ChapterKey, connection_id: ConnectionId) -> StoreResult<bool> {
        Ok(self
            .leases
            .remove_if(key, |_, lease| lease.owner_connection == connection_id)
            .is_some())
    }

    fn force_expire(&self, key: &ChapterKey) -> StoreResult<Option<Lease>> {
        let now = self.clock.now();
        Ok(self
            .leases
            .remove_if(key, |_, lease| !lease.is_live(now))
            .map(|(_, lease)| lease))
    }

    fn get(&self, key: &ChapterKey) -> StoreResult<Option<Lease>> {
        let now = self.clock.now();
        Ok(self
            .leases
            .get(key)
            .filter(|lease| lease.is_live(now))
            .map(|lease| lease.value().clone()))
    }

    fn story_leases(&self, story_id: &str) -> StoreResult<Vec<Lease>> {
        let now = self.clock.now();
        let mut leases: Vec<Lease> = self
            .leases
            .iter()
            .filter(|entry| entry.key().story_id == story_id && entry.value().is_live(now))
            .map(|entry| entry.value().clone())
            .collect();
        leases.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(leases)
    }

    fn expired_keys(&self) -> StoreResult<Vec<ChapterKey>> {
        let now = self.clock.now();
        Ok(self
            .leases
            .iter()
            .filter(|entry| !entry.value().is_live(now))
            .map(|entry| entry.key().clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Barrier;

    const TTL: Duration = Duration::from_millis(12_000);

    fn setup() -> (InMemoryLeaseStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        (InMemoryLeaseStore::new(clock.clone()), clock)
    }

    fn alice() -> UserIdentity {
        UserIdentity::new("u-alice", "Alice")
    }

    fn bob() -> UserIdentity {
        UserIdentity::new("u-bob", "Bob")
    }

    fn granted(outcome: AcquireOutcome) -> (Lease, bool) {
        match outcome {
            AcquireOutcome::Granted { lease, renewed, .. } => (lease, renewed),
            AcquireOutcome::Denied { holder } => panic!("unexpected denial, held by {holder:?}"),
        }
    }

    #[test]
    fn test_second_connection_is_denied() {
        let (store, _clock) = setup();
        let key = ChapterKey::new("s1", "c1");
        let (x, y) = (ConnectionId::new(), ConnectionId::new());

        granted(store.try_acquire(&key, x, &alice(), TTL).unwrap());
        match store.try_acquire(&key, y, &bob(), TTL).unwrap() {
            AcquireOutcome::Denied { holder } => {
                assert_eq!(holder.owner_connection, x);
                assert_eq!(holder.owner, alice());
            },
            other => panic!("expected denial, got {other:?}"),
        }
    }

    #[test]
    fn test_reacquire_extends_expiry() {
        let (store, clock) = setup();
        let key = ChapterKey::new("s1", "c1");
        let x = ConnectionId::new();

        let (first, renewed) = granted(store.try_acquire(&key, x, &alice(), TTL).unwrap());
        assert!(!renewed);

        clock.advance(Duration::from_millis(4_000));
        let (second, renewed) = granted(store.try_acquire(&key, x, &alice(), TTL).unwrap());
        assert!(renewed);
        assert_eq!(second.owner_connection, x);
        assert_eq!(second.acquired_at, first.acquired_at);
        assert!(second.expires_at > first.expires_at);
    }

    #[test]
    fn test_renew_only_by_owner() {
        let (store, clock) = setup();
        let key = ChapterKey::new("s1", "c1");
        let (x, y) = (ConnectionId::new(), ConnectionId::new());

        assert!(!store.renew(&key, x, TTL).unwrap());
        let (lease, _) = granted(store.try_acquire(&key, x, &alice(), TTL).unwrap());

        assert!(!store.renew(&key, y, TTL).unwrap());
        clock.advance(Duration::from_millis(1_000));
        assert!(store.renew(&key, x, TTL).unwrap());
        assert!(store.get(&key).unwrap().unwrap().expires_at > lease.expires_at);
    }

    #[test]
    fn test_renew_after_expiry_fails() {
        let (store, clock) = setup();
        let key = ChapterKey::new("s1", "c1");
        let x = ConnectionId::new();

        granted(store.try_acquire(&key, x, &alice(), TTL).unwrap());
        clock.advance(TTL);
        assert!(!store.renew(&key, x, TTL).unwrap());
    }

    #[test]
    fn test_release_only_by_owner() {
        let (store, _clock) = setup();
        let key = ChapterKey::new("s1", "c1");
        let (x, y) = (ConnectionId::new(), ConnectionId::new());

        granted(store.try_acquire(&key, x, &alice(), TTL).unwrap());
        assert!(!store.release(&key, y).unwrap());
        assert!(store.get(&key).unwrap().is_some());
        assert!(store.release(&key, x).unwrap());
        assert!(store.get(&key).unwrap().is_none());
        assert!(!store.release(&key, x).unwrap());
    }

    #[test]
    fn test_expired_lease_is_absent_and_reclaimable() {
        let (store, clock) = setup();
        let key = ChapterKey::new("s1", "c1");
        let x = ConnectionId::new();

        granted(store.try_acquire(&key, x, &alice(), TTL).unwrap());
        assert!(store.force_expire(&key).unwrap().is_none());
        assert!(store.expired_keys().unwrap().is_empty());

        clock.advance(TTL);
        assert!(store.get(&key).unwrap().is_none());
        assert_eq!(store.expired_keys().unwrap(), vec![key.clone()]);

        let expired = store.force_expire(&key).unwrap().unwrap();
        assert_eq!(expired.owner_connection, x);
        assert!(store.is_empty());
    }

    #[test]
    fn test_expired_lease_is_displaced_by_new_owner() {
        let (store, clock) = setup();
        let key = ChapterKey::new("s1", "c1");
        let (x, y) = (ConnectionId::new(), ConnectionId::new());

        granted(store.try_acquire(&key, x, &alice(), TTL).unwrap());
        clock.advance(TTL + Duration::from_millis(1));

        match store.try_acquire(&key, y, &bob(), TTL).unwrap() {
            AcquireOutcome::Granted {
                lease,
                renewed,
                displaced,
            } => {
                assert_eq!(lease.owner_connection, y);
                assert!(!renewed);
                assert_eq!(displaced.unwrap().owner_connection, x);
            },
            other => panic!("expected grant, got {other:?}"),
        }
        // the stale owner's heartbeat now degrades to a denial
        assert!(matches!(
            store.try_acquire(&key, x, &alice(), TTL).unwrap(),
            AcquireOutcome::Denied { .. }
        ));
    }

    #[test]
    fn test_chapters_are_independent() {
        let (store, _clock) = setup();
        let (a, b) = (ChapterKey::new("s1", "a"), ChapterKey::new("s1", "b"));
        let (x, y) = (ConnectionId::new(), ConnectionId::new());

        granted(store.try_acquire(&a, x, &alice(), TTL).unwrap());
        granted(store.try_acquire(&b, y, &bob(), TTL).unwrap());
        assert_eq!(store.get(&a).unwrap().unwrap().owner_connection, x);
        assert_eq!(store.story_leases("s1").unwrap().len(), 2);
        assert!(store.story_leases("s2").unwrap().is_empty());
    }

    #[test]
    fn test_concurrent_acquire_has_single_winner() {
        let store = Arc::new(InMemoryLeaseStore::default());
        let key = ChapterKey::new("s1", "contested");
        let contenders = 16;
        let barrier = Arc::new(Barrier::new(contenders));

        let handles: Vec<_> = (0..contenders)
            .map(|i| {
                let store = store.clone();
                let key = key.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    let user = UserIdentity::new(format!("u{i}"), format!("User {i}"));
                    barrier.wait();
                    store.try_acquire(&key, ConnectionId::new(), &user, TTL).unwrap()
                })
            })
            .collect();

        let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let winners: Vec<_> = outcomes
            .iter()
            .filter_map(|o| match o {
                AcquireOutcome::Granted { lease, .. } => Some(lease.owner_connection),
                AcquireOutcome::Denied { .. } => None,
            })
            .collect();
        assert_eq!(winners.len(), 1);

        for outcome in &outcomes {
            if let AcquireOutcome::Denied { holder } = outcome {
                assert_eq!(holder.owner_connection, winners[0]);
            }
        }
    }
}
