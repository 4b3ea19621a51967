// ============================
// crates/backend-lib/src/ids.rs
// ============================
//! Identity types shared by every coordinator component.

use chapterlock_common::{ChapterId, LockedBy, StoryId, UserId};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique id of one live WebSocket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Authenticated user behind a connection, as supplied by the auth service
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserIdentity {
    pub id: UserId,
    pub name: String,
}

impl UserIdentity {
    pub fn new(id: impl Into<UserId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }

    pub fn locked_by(&self) -> LockedBy {
        LockedBy {
            id: self.id.clone(),
            name: self.name.clone(),
        }
    }
}

/// Lease key: chapter ids are only unique within a story
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChapterKey {
    pub story_id: StoryId,
    pub chapter_id: ChapterId,
}

impl ChapterKey {
    pub fn new(story_id: impl Into<StoryId>, chapter_id: impl Into<ChapterId>) -> Self {
        Self {
            story_id: story_id.into(),
            chapter_id: chapter_id.into(),
        }
    }
}

impl fmt::Display for ChapterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.story_id, self.chapter_id)
    }
}
