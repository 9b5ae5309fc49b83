use std::io;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, warn};

use crate::relay::RelayError;
use crate::session::SessionError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to prepare output directory {path}: {source}")]
    OutputDir {
        path: std::path::PathBuf,
        source: io::Error,
    },
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: String, source: io::Error },
    #[error("http server failed: {0}")]
    Serve(#[source] io::Error),
    #[error(transparent)]
    Relay(#[from] RelayError),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

/// Error type returned by every route; renders as `{"error": "..."}`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn bad_gateway(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        match &err {
            SessionError::ChannelNotFound { .. } => ApiError::not_found(err.to_string()),
            SessionError::StartupTimeout { channel_id, .. } => {
                warn!(channel_id = %channel_id, "startup timed out");
                ApiError::new(StatusCode::GATEWAY_TIMEOUT, err.to_string())
            }
            SessionError::SessionExited { channel_id, exit_code } => {
                warn!(channel_id = %channel_id, exit_code = ?exit_code, "transcoder exited during startup");
                ApiError::bad_gateway(err.to_string())
            }
            SessionError::Catalog(_) => {
                error!(error = %err, "catalog unavailable");
                ApiError::internal("catalog unavailable")
            }
            SessionError::Spawn { channel_id, .. } => {
                error!(channel_id = %channel_id, error = %err, "transcoder spawn failed");
                ApiError::internal("failed to start transcoder")
            }
            SessionError::Io { .. } => {
                error!(error = %err, "session io failure");
                ApiError::internal("failed to prepare channel output")
            }
        }
    }
}

impl From<RelayError> for ApiError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::InvalidUrl { .. } => ApiError::bad_request(err.to_string()),
            other => ApiError::bad_gateway(other.to_string()),
        }
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;
