// ============================
// crates/backend-lib/src/presence.rs
// ============================
//! Presence registry: which connection belongs to which user and story room,
//! and which leases each connection currently holds.
use chapterlock_common::{ServerToClient, StoryId};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Notify;

use crate::ids::{ChapterKey, ConnectionId, UserIdentity};

/// Queued messages a connection may fall behind by before it is dropped
pub const OUTBOUND_QUEUE_CAPACITY: usize = 1024;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundError {
    #[error("outbound queue full")]
    Full,
    #[error("connection closed")]
    Closed,
}

/// Outbound queue of one connection. FIFO, so per-connection delivery order is
/// the order messages were enqueued. Sends never block; a connection whose
/// backlog is full is flagged as overflowed and must be dropped by its socket task.
#[derive(Debug, Clone)]
pub struct Outbound {
    tx: mpsc::Sender<ServerToClient>,
    overflow: Arc<Notify>,
}

impl Outbound {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ServerToClient>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx,
                overflow: Arc::new(Notify::new()),
            },
            rx,
        )
    }

    pub fn send(&self, message: ServerToClient) -> Result<(), OutboundError> {
        match self.tx.try_send(message) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.overflow.notify_one();
                Err(OutboundError::Full)
            },
            Err(TrySendError::Closed(_)) => Err(OutboundError::Closed),
        }
    }

    /// Resolves once a send found the queue full.
    pub async fn overflowed(&self) {
        self.overflow.notified().await;
    }
}

struct ConnectionEntry {
    user: UserIdentity,
    joined_story: Option<StoryId>,
    held_leases: HashSet<ChapterKey>,
    outbound: Outbound,
}

/// What was left behind when a connection went away
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub user: UserIdentity,
    pub story_id: Option<StoryId>,
    pub held_leases: Vec<ChapterKey>,
}

/// Registry of live connections and story rooms
#[derive(Default)]
pub struct PresenceRegistry {
    connections: DashMap<ConnectionId, ConnectionEntry>,
    rooms: DashMap<StoryId, HashSet<ConnectionId>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly authenticated connection. It belongs to no room yet.
    pub fn register(&self, user: UserIdentity, outbound: Outbound) -> ConnectionId {
        let connection_id = ConnectionId::new();
        self.connections.insert(
            connection_id,
            ConnectionEntry {
                user,
                joined_story: None,
                held_leases: HashSet::new(),
                outbound,
            },
        );
        connection_id
    }

    /// Put the connection into `story_id`'s room, leaving any previous room.
    /// Returns the previous room, or `None` for an unknown connection.
    pub fn join(&self, connection_id: ConnectionId, story_id: &str) -> Option<Option<StoryId>> {
        let previous = {
            let mut entry = self.connections.get_mut(&connection_id)?;
            entry.joined_story.replace(story_id.to_string())
        };

        if let Some(old) = previous.as_deref() {
            if old != story_id {
                self.remove_from_room(old, connection_id);
            }
        }
        self.rooms
            .entry(story_id.to_string())
            .or_default()
            .insert(connection_id);

        Some(previous)
    }

    /// Take the connection out of its room without unregistering it.
    pub fn leave_room(&self, connection_id: ConnectionId) -> Option<StoryId> {
        let story_id = self
            .connections
            .get_mut(&connection_id)
            .and_then(|mut entry| entry.joined_story.take())?;
        self.remove_from_room(&story_id, connection_id);
        Some(story_id)
    }

    /// Forget the connection entirely.
    pub fn unregister(&self, connection_id: ConnectionId) -> Option<Departure> {
        let (_, entry) = self.connections.remove(&connection_id)?;
        if let Some(story_id) = entry.joined_story.as_deref() {
            self.remove_from_room(story_id, connection_id);
        }
        let mut held_leases: Vec<ChapterKey> = entry.held_leases.into_iter().collect();
        held_leases.sort();
        Some(Departure {
            user: entry.user,
            story_id: entry.joined_story,
            held_leases,
        })
    }

    fn remove_from_room(&self, story_id: &str, connection_id: ConnectionId) {
        if let Some(mut members) = self.rooms.get_mut(story_id) {
            members.remove(&connection_id);
        }
        self.rooms.remove_if(story_id, |_, members| members.is_empty());
    }

    pub fn user(&self, connection_id: ConnectionId) -> Option<UserIdentity> {
        self.connections
            .get(&connection_id)
            .map(|entry| entry.user.clone())
    }

    pub fn joined_story(&self, connection_id: ConnectionId) -> Option<StoryId> {
        self.connections
            .get(&connection_id)
            .and_then(|entry| entry.joined_story.clone())
    }

    pub fn outbound(&self, connection_id: ConnectionId) -> Option<Outbound> {
        self.connections
            .get(&connection_id)
            .map(|entry| entry.outbound.clone())
    }

    /// Leases held by the connection, sorted for stable release order
    pub fn held_leases(&self, connection_id: ConnectionId) -> Vec<ChapterKey> {
        let mut held: Vec<ChapterKey> = self
            .connections
            .get(&connection_id)
            .map(|entry| entry.held_leases.iter().cloned().collect())
            .unwrap_or_default();
        held.sort();
        held
    }

    pub fn add_held(&self, connection_id: ConnectionId, key: &ChapterKey) -> bool {
        self.connections
            .get_mut(&connection_id)
            .is_some_and(|mut entry| entry.held_leases.insert(key.clone()))
    }

    pub fn remove_held(&self, connection_id: ConnectionId, key: &ChapterKey) -> bool {
        self.connections
            .get_mut(&connection_id)
            .is_some_and(|mut entry| entry.held_leases.remove(key))
    }

    pub fn room_members(&self, story_id: &str) -> Vec<ConnectionId> {
        let mut members: Vec<ConnectionId> = self
            .rooms
            .get(story_id)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default();
        members.sort();
        members
    }

    /// Outbound queues of every member of `story_id`'s room
    pub fn room_outbounds(&self, story_id: &str) -> Vec<(ConnectionId, Outbound)> {
        self.room_members(story_id)
            .into_iter()
            .filter_map(|id| self.outbound(id).map(|tx| (id, tx)))
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn register(registry: &PresenceRegistry, name: &str) -> ConnectionId {
        let (tx, _rx) = Outbound::channel(8);
        registry.register(UserIdentity::new(format!("u-{name}"), name), tx)
    }

    #[tokio::test]
    async fn test_full_queue_flags_overflow() {
        let (outbound, mut rx) = Outbound::channel(2);
        let msg = ServerToClient::StoryLeft {
            story_id: "s1".to_string(),
        };
        assert_eq!(outbound.send(msg.clone()), Ok(()));
        assert_eq!(outbound.send(msg.clone()), Ok(()));
        assert_eq!(outbound.send(msg.clone()), Err(OutboundError::Full));

        // the flag is remembered until the socket task looks at it
        tokio::time::timeout(std::time::Duration::from_secs(1), outbound.overflowed())
            .await
            .expect("overflow should be signalled");

        assert_eq!(rx.try_recv().unwrap(), msg);
        drop(rx);
        assert_eq!(outbound.send(msg), Err(OutboundError::Closed));
    }

    #[test]
    fn test_join_and_switch_rooms() {
        let registry = PresenceRegistry::new();
        let x = register(&registry, "x");

        assert_eq!(registry.join(x, "s1"), Some(None));
        assert_eq!(registry.room_members("s1"), vec![x]);

        assert_eq!(registry.join(x, "s2"), Some(Some("s1".to_string())));
        assert!(registry.room_members("s1").is_empty());
        assert_eq!(registry.room_members("s2"), vec![x]);
        assert_eq!(registry.room_count(), 1);
    }

    #[test]
    fn test_join_unknown_connection() {
        let registry = PresenceRegistry::new();
        assert_eq!(registry.join(ConnectionId::new(), "s1"), None);
        assert_eq!(registry.room_count(), 0);
    }

    #[test]
    fn test_unregister_reports_held_leases() {
        let registry = PresenceRegistry::new();
        let x = register(&registry, "x");
        registry.join(x, "s1");
        let a = ChapterKey::new("s1", "a");
        let b = ChapterKey::new("s1", "b");
        assert!(registry.add_held(x, &b));
        assert!(registry.add_held(x, &a));
        assert!(!registry.add_held(x, &a));

        let departure = registry.unregister(x).unwrap();
        assert_eq!(departure.story_id.as_deref(), Some("s1"));
        assert_eq!(departure.held_leases, vec![a, b]);
        assert_eq!(registry.connection_count(), 0);
        assert_eq!(registry.room_count(), 0);
        assert!(registry.unregister(x).is_none());
    }

    #[test]
    fn test_leave_room_keeps_connection() {
        let registry = PresenceRegistry::new();
        let x = register(&registry, "x");
        let y = register(&registry, "y");
        registry.join(x, "s1");
        registry.join(y, "s1");

        assert_eq!(registry.leave_room(x).as_deref(), Some("s1"));
        assert_eq!(registry.room_members("s1"), vec![y]);
        assert!(registry.joined_story(x).is_none());
        assert!(registry.user(x).is_some());
        assert!(registry.leave_room(x).is_none());
    }

    #[test]
    fn test_remove_held() {
        let registry = PresenceRegistry::new();
        let x = register(&registry, "x");
        let key = ChapterKey::new("s1", "a");
        registry.add_held(x, &key);
        assert!(registry.remove_held(x, &key));
        assert!(!registry.remove_held(x, &key));
        assert!(registry.held_leases(x).is_empty());
    }
}
