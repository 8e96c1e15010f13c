use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AggregatorError {
    #[error("settings file invalid or unreadable: {0}")]
    InvalidConfig(String),
    #[error("remote storage enabled but credentials are missing: {0}")]
    MissingCredentials(String),
    #[error("archive already exists: {}", .0.display())]
    ArchiveExists(PathBuf),
    #[error("remote object not found: {0}")]
    ObjectNotFound(String),
    #[error("invalid feed payload: {0}")]
    InvalidPayload(String),
    #[error("timestamp {0} is outside 1970-01-01T000000Z..=9999-12-31T235959Z")]
    TimestampOutOfRange(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
    Ok,
    Degraded,
    Failed,
}

impl StageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Degraded => "degraded",
            Self::Failed => "failed",
        }
    }
}
