// ============================
// crates/common/src/lib.rs
// ============================
//! Common types and structures
//! used for communication between story editor clients and the chapter lock server.
//! This module defines the WebSocket protocol messages and supporting types.

use serde::{Deserialize, Serialize};

/// Identity of a story; doubles as the broadcast room name
pub type StoryId = String;

/// Identity of a chapter, unique within its story
pub type ChapterId = String;

/// Identity of an authenticated user
pub type UserId = String;

/// Messages sent from client to server
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "msgType", rename_all_fields = "camelCase")]
pub enum ClientToServer {
    /// Join the broadcast room of a story
    /// # Fields
    /// * `story_id` - Story whose lock notifications the client wants
    JoinStory { story_id: StoryId },
    /// Leave the current story room, releasing every held lock
    LeaveStory,
    /// Acquire (or re-acquire) the edit lock on a chapter
    /// # Fields
    /// * `story_id` - Story the chapter belongs to
    /// * `chapter_id` - Chapter to lock
    AcquireLock {
        story_id: StoryId,
        chapter_id: ChapterId,
    },
    /// Renew a held lock; handled exactly like `AcquireLock`
    Heartbeat {
        story_id: StoryId,
        chapter_id: ChapterId,
    },
    /// Release a lock
    ReleaseLock {
        story_id: StoryId,
        chapter_id: ChapterId,
    },
    /// Ask for the current lock state of a chapter without changing it
    QueryLock {
        story_id: StoryId,
        chapter_id: ChapterId,
    },
}

/// Owner of a lock as shown to other editors
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LockedBy {
    /// User ID of the owner
    pub id: UserId,
    /// Display name of the owner
    pub name: String,
}

/// Lock state of a single chapter
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChapterLockState {
    pub chapter_id: ChapterId,
    pub is_locked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_by: Option<LockedBy>,
}

impl ChapterLockState {
    /// State of a chapter nobody is editing
    pub fn unlocked(chapter_id: impl Into<ChapterId>) -> Self {
        Self {
            chapter_id: chapter_id.into(),
            is_locked: false,
            locked_by: None,
        }
    }

    /// State of a chapter held by `owner`
    pub fn locked(chapter_id: impl Into<ChapterId>, owner: LockedBy) -> Self {
        Self {
            chapter_id: chapter_id.into(),
            is_locked: true,
            locked_by: Some(owner),
        }
    }
}

/// Messages sent from server to client
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "msgType", rename_all_fields = "camelCase")]
pub enum ServerToClient {
    /// Response to a successful room join
    StoryJoined {
        /// Joined story
        story_id: StoryId,
        /// Lease lifetime in milliseconds
        ttl_ms: u64,
        /// Cadence at which lock holders should send `Heartbeat`
        heartbeat_interval_ms: u64,
        /// Every chapter of the story that is currently locked
        locks: Vec<ChapterLockState>,
    },
    /// Response to `LeaveStory`
    StoryLeft { story_id: StoryId },
    /// Broadcast to the room whenever a chapter's lock changes or is refreshed
    LockStateChanged {
        chapter_id: ChapterId,
        is_locked: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        locked_by: Option<LockedBy>,
    },
    /// Sent only to a requester that lost the race for a lock
    LockDenied {
        chapter_id: ChapterId,
        locked_by: LockedBy,
    },
    /// Response to `QueryLock`
    LockStatus {
        chapter_id: ChapterId,
        is_locked: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        locked_by: Option<LockedBy>,
    },
    /// Error response for frames that could not be parsed
    MalformedMessage {
        /// Error description
        err_msg: String,
    },
    /// Error response for rejected requests
    Error { code: String, message: String },
}

impl ServerToClient {
    /// Room broadcast carrying `state`
    pub fn state_changed(state: ChapterLockState) -> Self {
        ServerToClient::LockStateChanged {
            chapter_id: state.chapter_id,
            is_locked: state.is_locked,
            locked_by: state.locked_by,
        }
    }

    /// Query reply carrying `state`
    pub fn status(state: ChapterLockState) -> Self {
        ServerToClient::LockStatus {
            chapter_id: state.chapter_id,
            is_locked: state.is_locked,
            locked_by: state.locked_by,
        }
    }
}
