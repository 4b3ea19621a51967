// ============================
// crates/backend-lib/src/validation.rs
// ============================
//! Message validation module.

use chapterlock_common::ClientToServer;
use regex::Regex;
use std::sync::LazyLock;
use thiserror::Error;

const MAX_ID_LENGTH: usize = 128;

static ID_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").unwrap());

/// Possible validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid story ID: {0}")]
    InvalidStoryId(String),

    #[error("Invalid chapter ID: {0}")]
    InvalidChapterId(String),
}

/// Result type for validation operations
pub type ValidationResult<T> = Result<T, ValidationError>;

fn check_id(id: &str, label: &str) -> Result<(), String> {
    if id.is_empty() {
        return Err(format!("{label} must not be empty"));
    }
    if id.len() > MAX_ID_LENGTH {
        return Err(format!("{label} must be at most {MAX_ID_LENGTH} characters"));
    }
    if !ID_REGEX.is_match(id) {
        return Err(format!(
            "{label} must contain only alphanumeric characters, hyphens and underscores"
        ));
    }
    Ok(())
}

/// Validate a story ID
pub fn validate_story_id(story_id: &str) -> ValidationResult<&str> {
    check_id(story_id, "Story ID").map_err(ValidationError::InvalidStoryId)?;
    Ok(story_id)
}

/// Validate a chapter ID
pub fn validate_chapter_id(chapter_id: &str) -> ValidationResult<&str> {
    check_id(chapter_id, "Chapter ID").map_err(ValidationError::InvalidChapterId)?;
    Ok(chapter_id)
}

/// Validate a client message before it reaches the coordinator
pub fn validate_client_message(msg: &ClientToServer) -> ValidationResult<()> {
    match msg {
        ClientToServer::JoinStory { story_id } => {
            validate_story_id(story_id)?;
        },
        ClientToServer::LeaveStory => {},
        ClientToServer::AcquireLock {
            story_id,
            chapter_id,
        }
        | ClientToServer::Heartbeat {
            story_id,
            chapter_id,
        }
        | ClientToServer::ReleaseLock {
            story_id,
            chapter_id,
        }
        | ClientToServer::QueryLock {
            story_id,
            chapter_id,
        } => {
            validate_story_id(story_id)?;
            validate_chapter_id(chapter_id)?;
        },
    }
    Ok(())
}
