use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::types::ChannelOrigin;

#[derive(Debug, Error)]
pub enum RelayError {
    /// Missing or malformed input. Rejected before anything is written.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Outbound send to a platform failed or timed out.
    #[error("delivery to {channel} failed: {reason}")]
    Delivery {
        channel: ChannelOrigin,
        reason: String,
    },

    /// Session already folded into a different authenticated user.
    #[error("session {session_id} already belongs to user {existing_user_id}, refusing to merge into {requested_user_id}")]
    MergeConflict {
        session_id: String,
        existing_user_id: String,
        requested_user_id: String,
    },

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl RelayError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn delivery(channel: ChannelOrigin, reason: impl Into<String>) -> Self {
        Self::Delivery {
            channel,
            reason: reason.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            RelayError::Validation(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            RelayError::NotFound { .. } => (StatusCode::NOT_FOUND, self.to_string()),
            RelayError::Delivery { .. } => (StatusCode::BAD_GATEWAY, self.to_string()),
            RelayError::MergeConflict { .. } => (StatusCode::CONFLICT, self.to_string()),
            RelayError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, self.to_string()),
            RelayError::Storage(_) | RelayError::Migration(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "storage error".to_string(),
            ),
            RelayError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal server error".to_string(),
            ),
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}
