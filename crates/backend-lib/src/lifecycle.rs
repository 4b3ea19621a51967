// ============================
// crates/backend-lib/src/lifecycle.rs
// ============================
//! Connection lifecycle: maps transport events onto presence and lease operations.
//!
//! Each socket feeds its events through [`LifecycleHandler::handle`] one at a
//! time, so a connection never races itself. Disconnect is the compensating
//! path for every lease the connection still holds.
use chapterlock_common::{ChapterId, ClientToServer, ServerToClient, StoryId};
use std::sync::Arc;

use crate::config::LockSettings;
use crate::error::AppError;
use crate::ids::{ConnectionId, UserIdentity};
use crate::lease_manager::LeaseManager;
use crate::presence::{Outbound, PresenceRegistry};

/// Everything that can happen to a connection after it is established
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Join { story_id: StoryId },
    Leave,
    Acquire { story_id: StoryId, chapter_id: ChapterId },
    Heartbeat { story_id: StoryId, chapter_id: ChapterId },
    Release { story_id: StoryId, chapter_id: ChapterId },
    Query { story_id: StoryId, chapter_id: ChapterId },
    Disconnect,
}

impl From<ClientToServer> for ConnectionEvent {
    fn from(msg: ClientToServer) -> Self {
        match msg {
            ClientToServer::JoinStory { story_id } => ConnectionEvent::Join { story_id },
            ClientToServer::LeaveStory => ConnectionEvent::Leave,
            ClientToServer::AcquireLock {
                story_id,
                chapter_id,
            } => ConnectionEvent::Acquire {
                story_id,
                chapter_id,
            },
            ClientToServer::Heartbeat {
                story_id,
                chapter_id,
            } => ConnectionEvent::Heartbeat {
                story_id,
                chapter_id,
            },
            ClientToServer::ReleaseLock {
                story_id,
                chapter_id,
            } => ConnectionEvent::Release {
                story_id,
                chapter_id,
            },
            ClientToServer::QueryLock {
                story_id,
                chapter_id,
            } => ConnectionEvent::Query {
                story_id,
                chapter_id,
            },
        }
    }
}

pub struct LifecycleHandler {
    presence: Arc<PresenceRegistry>,
    manager: Arc<LeaseManager>,
    ttl_ms: u64,
    heartbeat_interval_ms: u64,
}

impl LifecycleHandler {
    pub fn new(presence: Arc<PresenceRegistry>, manager: Arc<LeaseManager>, lock: &LockSettings) -> Self {
        Self {
            presence,
            manager,
            ttl_ms: lock.ttl_ms,
            heartbeat_interval_ms: lock.heartbeat_interval_ms(),
        }
    }

    /// Register an authenticated socket. The connection joins no room until
    /// it sends `JoinStory`.
    pub fn connect(&self, user: UserIdentity, outbound: Outbound) -> ConnectionId {
        let connection_id = self.presence.register(user, outbound);
        tracing::debug!(%connection_id, "connection registered");
        connection_id
    }

    /// Apply one event. Errors are per-request and never affect other connections.
    pub fn handle(&self, connection_id: ConnectionId, event: ConnectionEvent) -> Result<(), AppError> {
        match event {
            ConnectionEvent::Join { story_id } => self.join(connection_id, &story_id),
            ConnectionEvent::Leave => self.leave(connection_id),
            ConnectionEvent::Acquire {
                story_id,
                chapter_id,
            } => self
                .manager
                .request_lock(&story_id, &chapter_id, connection_id)
                .map(|_| ()),
            ConnectionEvent::Heartbeat {
                story_id,
                chapter_id,
            } => self
                .manager
                .heartbeat(&story_id, &chapter_id, connection_id)
                .map(|_| ()),
            ConnectionEvent::Release {
                story_id,
                chapter_id,
            } => self
                .manager
                .request_unlock(&story_id, &chapter_id, connection_id)
                .map(|_| ()),
            ConnectionEvent::Query {
                story_id,
                chapter_id,
            } => self.query(connection_id, &story_id, &chapter_id),
            ConnectionEvent::Disconnect => {
                self.disconnect(connection_id);
                Ok(())
            },
        }
    }

    fn join(&self, connection_id: ConnectionId, story_id: &str) -> Result<(), AppError> {
        let current = self
            .presence
            .user(connection_id)
            .map(|_| self.presence.joined_story(connection_id))
            .ok_or_else(|| AppError::UnknownConnection(connection_id.to_string()))?;

        // switching stories gives up every lease held in the old one
        if current.as_deref().is_some_and(|old| old != story_id) {
            let released = self.manager.release_all(connection_id);
            tracing::info!(%connection_id, from = ?current, to = story_id, released, "connection switched story");
        }

        self.manager.join_room(connection_id, story_id, |locks| ServerToClient::StoryJoined {
            story_id: story_id.to_string(),
            ttl_ms: self.ttl_ms,
            heartbeat_interval_ms: self.heartbeat_interval_ms,
            locks,
        })?;
        tracing::info!(%connection_id, story_id, "joined story room");
        Ok(())
    }

    fn leave(&self, connection_id: ConnectionId) -> Result<(), AppError> {
        let story_id = self
            .presence
            .joined_story(connection_id)
            .ok_or_else(|| AppError::InvalidInput("connection has not joined a story".to_string()))?;

        let released = self.manager.release_all(connection_id);
        self.presence.leave_room(connection_id);
        tracing::info!(%connection_id, story_id, released, "left story room");

        self.manager
            .broadcaster()
            .unicast(connection_id, ServerToClient::StoryLeft { story_id });
        Ok(())
    }

    fn query(&self, connection_id: ConnectionId, story_id: &str, chapter_id: &str) -> Result<(), AppError> {
        if self.presence.joined_story(connection_id).as_deref() != Some(story_id) {
            return Err(AppError::NotInStory {
                story_id: story_id.to_string(),
            });
        }
        let state = self.manager.chapter_state(story_id, chapter_id)?;
        self.manager
            .broadcaster()
            .unicast(connection_id, ServerToClient::status(state));
        Ok(())
    }

    /// Release every held lease, then forget the connection. Safe to call
    /// for a connection that is already gone.
    pub fn disconnect(&self, connection_id: ConnectionId) {
        let released = self.manager.release_all(connection_id);
        match self.presence.unregister(connection_id) {
            Some(departure) => {
                if !departure.held_leases.is_empty() {
                    // only leases whose release failed in the store are left here
                    tracing::warn!(
                        %connection_id,
                        remaining = departure.held_leases.len(),
                        "leases left to expire after disconnect"
                    );
                }
                tracing::info!(
                    %connection_id,
                    user = %departure.user.id,
                    story = ?departure.story_id,
                    released,
                    "connection closed"
                );
            },
            None => tracing::debug!(%connection_id, "disconnect for unknown connection"),
        }
    }
}
