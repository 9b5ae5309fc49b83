use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::catalog::CatalogError;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("channel {channel_id} not found")]
    ChannelNotFound { channel_id: String },
    #[error("failed to spawn transcoder for channel {channel_id} ({command}): {source}")]
    Spawn {
        channel_id: String,
        command: String,
        source: std::io::Error,
    },
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("channel {channel_id} produced no manifest within {timeout:?}")]
    StartupTimeout {
        channel_id: String,
        timeout: Duration,
    },
    #[error("transcoder for channel {channel_id} exited before producing output (exit code {exit_code:?})")]
    SessionExited {
        channel_id: String,
        exit_code: Option<i32>,
    },
}

pub type SessionResult<T> = std::result::Result<T, SessionError>;
