// ============================
// crates/backend-lib/src/error.rs
// ============================
//! Central error type + Axum integration.
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chapterlock_common::ServerToClient;
use thiserror::Error;

use crate::lease_store::StoreError;
use crate::validation::ValidationError;

/// Application error types with error codes and context
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unknown connection: {0}")]
    UnknownConnection(String),

    #[error("Connection has not joined story {story_id}")]
    NotInStory { story_id: String },

    #[error("Lease store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AppError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Auth(_) => StatusCode::UNAUTHORIZED,
            AppError::InvalidInput(_) | AppError::Json(_) => StatusCode::BAD_REQUEST,
            AppError::NotInStory { .. } => StatusCode::FORBIDDEN,
            AppError::UnknownConnection(_) => StatusCode::NOT_FOUND,
            AppError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code for this error
    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::Auth(_) => "AUTH_001",
            AppError::InvalidInput(_) => "VAL_001",
            AppError::UnknownConnection(_) => "CONN_001",
            AppError::NotInStory { .. } => "NOT_IN_STORY",
            AppError::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            AppError::Config(_) => "CFG_001",
            AppError::Internal(_) => "INT_001",
            AppError::Io(_) => "IO_001",
            AppError::Json(_) => "JSON_001",
        }
    }

    /// Get a sanitized message suitable for production use
    pub fn sanitized_message(&self) -> String {
        match self {
            AppError::Auth(_) => "Authentication failed".to_string(),
            AppError::InvalidInput(_) | AppError::Json(_) => "Invalid input provided".to_string(),
            AppError::UnknownConnection(_) => "Connection is not registered".to_string(),
            AppError::NotInStory { .. } => "Join the story before locking its chapters".to_string(),
            AppError::StoreUnavailable(_) => {
                "Chapter locking is temporarily unavailable".to_string()
            },
            AppError::Config(_) | AppError::Internal(_) | AppError::Io(_) => {
                "An internal server error occurred".to_string()
            },
        }
    }

    fn client_message(&self) -> String {
        if cfg!(debug_assertions) {
            self.to_string()
        } else {
            self.sanitized_message()
        }
    }

    /// Convert into the error frame sent back over the socket
    pub fn to_server_message(&self) -> ServerToClient {
        ServerToClient::Error {
            code: self.error_code().to_string(),
            message: self.client_message(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let body = serde_json::json!({
            "error": {
                "code": self.error_code(),
                "message": self.client_message(),
            }
        });

        (status, axum::Json(body)).into_response()
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        AppError::StoreUnavailable(err.to_string())
    }
}

impl From<ValidationError> for AppError {
    fn from(err: ValidationError) -> Self {
        AppError::InvalidInput(err.to_string())
    }
}

impl From<figment::Error> for AppError {
    fn from(err: figment::Error) -> Self {
        AppError::Config(err.to_string())
    }
}
