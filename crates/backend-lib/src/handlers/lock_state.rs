// ============================
// crates/backend-lib/src/handlers/lock_state.rs
// ============================
//! Read-only lock state over HTTP, for clients that need a one-off refresh
//! without holding a socket open.
use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use chapterlock_common::ChapterLockState;
use std::sync::Arc;

use super::TokenQuery;
use crate::error::AppError;
use crate::validation::{validate_chapter_id, validate_story_id};
use crate::AppState;

/// `GET /stories/{story_id}/chapters/{chapter_id}/lock`
pub async fn chapter_lock(
    State(state): State<Arc<AppState>>,
    Path((story_id, chapter_id)): Path<(String, String)>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> Result<Json<ChapterLockState>, AppError> {
    let user = state.authenticate(&headers, query.token.as_deref()).await?;
    validate_story_id(&story_id)?;
    validate_chapter_id(&chapter_id)?;

    tracing::debug!(user = %user.id, story_id, chapter_id, "lock state requested");
    Ok(Json(state.manager.chapter_state(&story_id, &chapter_id)?))
}

/// `GET /stories/{story_id}/locks`
pub async fn story_locks(
    State(state): State<Arc<AppState>>,
    Path(story_id): Path<String>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> Result<Json<Vec<ChapterLockState>>, AppError> {
    let user = state.authenticate(&headers, query.token.as_deref()).await?;
    validate_story_id(&story_id)?;

    tracing::debug!(user = %user.id, story_id, "story locks requested");
    Ok(Json(state.manager.story_locks(&story_id)?))
}
