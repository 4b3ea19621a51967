// ============================
// crates/backend-lib/src/lease_manager.rs
// ============================
//! Lock policy on top of the lease store.
//!
//! Every decision about a chapter (grant, renew, deny, release, expiry) runs
//! under that chapter's serialization guard, and the notifications it produces
//! are enqueued before the guard is dropped. Different chapters only contend
//! when they hash to the same stripe.
use chapterlock_common::{ChapterLockState, ServerToClient};
use metrics::counter;
use parking_lot::{Mutex, MutexGuard};
use std::collections::hash_map::RandomState;
use std::hash::BuildHasher;
use std::sync::Arc;
use std::time::Duration;

use crate::broadcast::RoomBroadcaster;
use crate::error::AppError;
use crate::ids::{ChapterKey, ConnectionId, UserIdentity};
use crate::lease_store::{AcquireOutcome, Lease, LeaseStore};
use crate::metrics::{
    LOCK_DENIED, LOCK_EXPIRED, LOCK_GRANTED, LOCK_RELEASED, LOCK_RENEWED, LOCK_STORE_UNAVAILABLE,
};
use crate::presence::PresenceRegistry;

const SERIALIZATION_STRIPES: usize = 64;

/// Striped mutexes giving a single writer per chapter
struct ChapterSerializer {
    stripes: Vec<Mutex<()>>,
    hasher: RandomState,
}

impl ChapterSerializer {
    fn new(stripes: usize) -> Self {
        Self {
            stripes: (0..stripes.max(1)).map(|_| Mutex::new(())).collect(),
            hasher: RandomState::new(),
        }
    }

    fn lock(&self, key: &ChapterKey) -> MutexGuard<'_, ()> {
        let index = (self.hasher.hash_one(key) % self.stripes.len() as u64) as usize;
        self.stripes[index].lock()
    }

    /// Every stripe, taken in index order. Mutations hold one stripe at a time.
    fn lock_all(&self) -> Vec<MutexGuard<'_, ()>> {
        self.stripes.iter().map(|stripe| stripe.lock()).collect()
    }
}

/// Result of a lock request as seen by the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome {
    Granted { lease: Lease, renewed: bool },
    Denied { holder: Lease },
    /// The store could not be reached; nothing was granted.
    Unavailable,
}

impl LockOutcome {
    pub fn is_granted(&self) -> bool {
        matches!(self, LockOutcome::Granted { .. })
    }
}

/// Lock state of `key` given its current live lease
pub fn lease_state(key: &ChapterKey, lease: Option<&Lease>) -> ChapterLockState {
    match lease {
        Some(lease) => ChapterLockState::locked(key.chapter_id.clone(), lease.owner.locked_by()),
        None => ChapterLockState::unlocked(key.chapter_id.clone()),
    }
}

pub struct LeaseManager {
    store: Arc<dyn LeaseStore>,
    presence: Arc<PresenceRegistry>,
    broadcaster: RoomBroadcaster,
    ttl: Duration,
    serializer: ChapterSerializer,
}

impl LeaseManager {
    pub fn new(store: Arc<dyn LeaseStore>, presence: Arc<PresenceRegistry>, ttl: Duration) -> Self {
        let broadcaster = RoomBroadcaster::new(presence.clone());
        Self {
            store,
            presence,
            broadcaster,
            ttl,
            serializer: ChapterSerializer::new(SERIALIZATION_STRIPES),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn broadcaster(&self) -> &RoomBroadcaster {
        &self.broadcaster
    }

    /// The connection must be registered and joined to `story_id`.
    fn authorize(&self, connection_id: ConnectionId, story_id: &str) -> Result<UserIdentity, AppError> {
        let user = self
            .presence
            .user(connection_id)
            .ok_or_else(|| AppError::UnknownConnection(connection_id.to_string()))?;
        if self.presence.joined_story(connection_id).as_deref() != Some(story_id) {
            return Err(AppError::NotInStory {
                story_id: story_id.to_string(),
            });
        }
        Ok(user)
    }

    /// Acquire or renew the lock on a chapter.
    ///
    /// A grant is broadcast to the whole room; a denial goes only to the
    /// requester and names the current owner. Store failures deny (fail closed).
    pub fn request_lock(
        &self,
        story_id: &str,
        chapter_id: &str,
        connection_id: ConnectionId,
    ) -> Result<LockOutcome, AppError> {
        let user = self.authorize(connection_id, story_id)?;
        let key = ChapterKey::new(story_id, chapter_id);

        let _guard = self.serializer.lock(&key);
        let outcome = match self.store.try_acquire(&key, connection_id, &user, self.ttl) {
            Ok(AcquireOutcome::Granted {
                lease,
                renewed,
                displaced,
            }) => {
                if let Some(previous) = displaced {
                    self.presence.remove_held(previous.owner_connection, &key);
                    tracing::info!(
                        chapter = %key,
                        previous_owner = %previous.owner.id,
                        "expired lease taken over before sweep"
                    );
                }
                self.presence.add_held(connection_id, &key);

                if renewed {
                    counter!(LOCK_RENEWED).increment(1);
                    tracing::debug!(chapter = %key, %connection_id, "lease renewed");
                } else {
                    counter!(LOCK_GRANTED).increment(1);
                    tracing::info!(chapter = %key, %connection_id, user = %user.id, "lease granted");
                }

                let state = lease_state(&key, Some(&lease));
                self.broadcaster
                    .broadcast(story_id, &ServerToClient::state_changed(state));
                LockOutcome::Granted { lease, renewed }
            },
            Ok(AcquireOutcome::Denied { holder }) => {
                // a stale renewal lands here once ownership moved elsewhere
                self.presence.remove_held(connection_id, &key);
                counter!(LOCK_DENIED).increment(1);
                tracing::info!(
                    chapter = %key,
                    %connection_id,
                    holder = %holder.owner.id,
                    "lease denied"
                );
                self.broadcaster.unicast(
                    connection_id,
                    ServerToClient::LockDenied {
                        chapter_id: key.chapter_id.clone(),
                        locked_by: holder.owner.locked_by(),
                    },
                );
                LockOutcome::Denied { holder }
            },
            Err(err) => {
                counter!(LOCK_STORE_UNAVAILABLE).increment(1);
                tracing::warn!(chapter = %key, error = %err, "lease store unavailable, denying lock");
                self.broadcaster
                    .unicast(connection_id, AppError::from(err).to_server_message());
                LockOutcome::Unavailable
            },
        };

        Ok(outcome)
    }

    /// Renewal shares the acquisition path.
    pub fn heartbeat(
        &self,
        story_id: &str,
        chapter_id: &str,
        connection_id: ConnectionId,
    ) -> Result<LockOutcome, AppError> {
        self.request_lock(story_id, chapter_id, connection_id)
    }

    /// Release a chapter. The room always receives the chapter's resulting
    /// state, even when the caller was not the owner.
    pub fn request_unlock(
        &self,
        story_id: &str,
        chapter_id: &str,
        connection_id: ConnectionId,
    ) -> Result<bool, AppError> {
        self.authorize(connection_id, story_id)?;
        self.release_and_refresh(&ChapterKey::new(story_id, chapter_id), connection_id)
    }

    /// Release every lease the connection holds. Used when it leaves its room
    /// or disconnects; store failures are logged and left to expiry.
    pub fn release_all(&self, connection_id: ConnectionId) -> usize {
        let mut released = 0;
        for key in self.presence.held_leases(connection_id) {
            match self.release_and_refresh(&key, connection_id) {
                Ok(true) => released += 1,
                Ok(false) => {},
                Err(err) => {
                    tracing::warn!(chapter = %key, %connection_id, error = %err, "release failed, lease left to expire");
                },
            }
        }
        released
    }

    fn release_and_refresh(&self, key: &ChapterKey, connection_id: ConnectionId) -> Result<bool, AppError> {
        let _guard = self.serializer.lock(key);
        let released = self.store.release(key, connection_id)?;
        self.presence.remove_held(connection_id, key);

        let state = if released {
            counter!(LOCK_RELEASED).increment(1);
            tracing::info!(chapter = %key, %connection_id, "lease released");
            ChapterLockState::unlocked(key.chapter_id.clone())
        } else {
            lease_state(key, self.store.get(key)?.as_ref())
        };
        self.broadcaster
            .broadcast(&key.story_id, &ServerToClient::state_changed(state));
        Ok(released)
    }

    /// Current state of one chapter; never mutates.
    pub fn chapter_state(&self, story_id: &str, chapter_id: &str) -> Result<ChapterLockState, AppError> {
        let key = ChapterKey::new(story_id, chapter_id);
        let lease = self.store.get(&key)?;
        Ok(lease_state(&key, lease.as_ref()))
    }

    /// Put the connection in `story_id`'s room and queue `reply`, built from the
    /// story's current locks. No chapter changes between the snapshot and the
    /// enqueue, so every later change reaches the connection after its reply.
    pub fn join_room(
        &self,
        connection_id: ConnectionId,
        story_id: &str,
        reply: impl FnOnce(Vec<ChapterLockState>) -> ServerToClient,
    ) -> Result<(), AppError> {
        let _guards = self.serializer.lock_all();
        let locks = self.story_locks(story_id)?;
        self.presence
            .join(connection_id, story_id)
            .ok_or_else(|| AppError::UnknownConnection(connection_id.to_string()))?;
        self.broadcaster.unicast(connection_id, reply(locks));
        Ok(())
    }

    /// Every locked chapter of a story.
    pub fn story_locks(&self, story_id: &str) -> Result<Vec<ChapterLockState>, AppError> {
        Ok(self
            .store
            .story_leases(story_id)?
            .iter()
            .map(|lease| lease_state(&lease.key, Some(lease)))
            .collect())
    }

    /// Remove every expired lease and broadcast that its chapter is unlocked.
    /// A lease renewed or re-granted between the scan and the removal is kept.
    pub fn reclaim_expired(&self) -> Result<usize, AppError> {
        let mut reclaimed = 0;
        for key in self.store.expired_keys()? {
            let _guard = self.serializer.lock(&key);
            match self.store.force_expire(&key) {
                Ok(Some(lease)) => {
                    self.presence.remove_held(lease.owner_connection, &key);
                    counter!(LOCK_EXPIRED).increment(1);
                    tracing::info!(chapter = %key, owner = %lease.owner.id, "lease expired");
                    self.broadcaster.broadcast(
                        &key.story_id,
                        &ServerToClient::state_changed(ChapterLockState::unlocked(
                            key.chapter_id.clone(),
                        )),
                    );
                    reclaimed += 1;
                },
                Ok(None) => {},
                Err(err) => {
                    tracing::warn!(chapter = %key, error = %err, "could not expire lease");
                },
            }
        }
        Ok(reclaimed)
    }
}
