// ============================
// crates/backend-lib/src/broadcast.rs
// ============================
//! Room broadcaster: fan-out of lock notifications to story rooms.
//!
//! Sends are non-blocking enqueues onto each member's bounded outbound queue.
//! Callers that enqueue while holding a chapter's serialization guard therefore
//! give every member the same per-chapter order.
use chapterlock_common::ServerToClient;
use std::sync::Arc;

use crate::ids::ConnectionId;
use crate::presence::{OutboundError, PresenceRegistry};

#[derive(Clone)]
pub struct RoomBroadcaster {
    presence: Arc<PresenceRegistry>,
}

impl RoomBroadcaster {
    pub fn new(presence: Arc<PresenceRegistry>) -> Self {
        Self { presence }
    }

    /// Deliver `message` to every connection in `story_id`'s room.
    /// Returns the number of members it was enqueued for.
    pub fn broadcast(&self, story_id: &str, message: &ServerToClient) -> usize {
        let mut delivered = 0;
        for (connection_id, outbound) in self.presence.room_outbounds(story_id) {
            match outbound.send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(OutboundError::Full) => {
                    tracing::warn!(%connection_id, story_id, "outbound backlog full, connection will be dropped");
                },
                Err(OutboundError::Closed) => {
                    // socket task already gone; its disconnect cleanup is on the way
                    tracing::debug!(%connection_id, story_id, "dropping broadcast for closed connection");
                },
            }
        }
        delivered
    }

    /// Deliver `message` to a single connection.
    pub fn unicast(&self, connection_id: ConnectionId, message: ServerToClient) -> bool {
        match self.presence.outbound(connection_id) {
            Some(outbound) => outbound.send(message).is_ok(),
            None => {
                tracing::debug!(%connection_id, "unicast to unknown connection");
                false
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::UserIdentity;
    use crate::presence::Outbound;
    use chapterlock_common::ChapterLockState;

    #[test]
    fn test_broadcast_reaches_only_room_members() {
        let presence = Arc::new(PresenceRegistry::new());
        let broadcaster = RoomBroadcaster::new(presence.clone());

        let (tx1, mut rx1) = Outbound::channel(16);
        let (tx2, mut rx2) = Outbound::channel(16);
        let (tx3, mut rx3) = Outbound::channel(16);
        let a = presence.register(UserIdentity::new("u1", "One"), tx1);
        let b = presence.register(UserIdentity::new("u2", "Two"), tx2);
        let c = presence.register(UserIdentity::new("u3", "Three"), tx3);
        presence.join(a, "s1");
        presence.join(b, "s1");
        presence.join(c, "s2");

        let msg = ServerToClient::state_changed(ChapterLockState::unlocked("c1"));
        assert_eq!(broadcaster.broadcast("s1", &msg), 2);

        assert_eq!(rx1.try_recv().unwrap(), msg);
        assert_eq!(rx2.try_recv().unwrap(), msg);
        assert!(rx3.try_recv().is_err());
    }

    #[test]
    fn test_unicast_and_closed_receivers() {
        let presence = Arc::new(PresenceRegistry::new());
        let broadcaster = RoomBroadcaster::new(presence.clone());

        let (tx, rx) = Outbound::channel(16);
        let a = presence.register(UserIdentity::new("u1", "One"), tx);
        presence.join(a, "s1");
        drop(rx);

        let msg = ServerToClient::state_changed(ChapterLockState::unlocked("c1"));
        assert_eq!(broadcaster.broadcast("s1", &msg), 0);
        assert!(!broadcaster.unicast(a, msg.clone()));
        assert!(!broadcaster.unicast(ConnectionId::new(), msg));
    }

    #[tokio::test]
    async fn test_stalled_member_is_flagged_without_blocking_others() {
        let presence = Arc::new(PresenceRegistry::new());
        let broadcaster = RoomBroadcaster::new(presence.clone());
        let (slow, _slow_rx) = Outbound::channel(1);
        let (fast, mut fast_rx) = Outbound::channel(16);
        let a = presence.register(UserIdentity::new("u1", "Slow"), slow.clone());
        let b = presence.register(UserIdentity::new("u2", "Fast"), fast);
        presence.join(a, "s1");
        presence.join(b, "s1");

        let msg = ServerToClient::state_changed(ChapterLockState::unlocked("c1"));
        assert_eq!(broadcaster.broadcast("s1", &msg), 2);
        assert_eq!(broadcaster.broadcast("s1", &msg), 1);

        tokio::time::timeout(std::time::Duration::from_secs(1), slow.overflowed())
            .await
            .expect("stalled member should be flagged");
        assert_eq!(fast_rx.try_recv().unwrap(), msg);
        assert_eq!(fast_rx.try_recv().unwrap(), msg);
    }

    #[test]
    fn test_broadcasts_keep_order() {
        let presence = Arc::new(PresenceRegistry::new());
        let broadcaster = RoomBroadcaster::new(presence.clone());
        let (tx, mut rx) = Outbound::channel(16);
        let a = presence.register(UserIdentity::new("u1", "One"), tx);
        presence.join(a, "s1");

        for i in 0..10 {
            let msg = ServerToClient::state_changed(ChapterLockState::unlocked(format!("c{i}")));
            broadcaster.broadcast("s1", &msg);
        }
        for i in 0..10 {
            match rx.try_recv().unwrap() {
                ServerToClient::LockStateChanged { chapter_id, .. } => {
                    assert_eq!(chapter_id, format!("c{i}"));
                },
                other => panic!("unexpected message: {other:?}"),
            }
        }
    }
}
