//! Error types for backup and restore operations
//!
//! Every variant renders with a bracketed code prefix (`[not-found]`,
//! `[invalid-path]`, ...) so callers on the other side of an RPC boundary can
//! match on the message alone.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("[invalid-path] Invalid path {0}")]
    InvalidPath(String),

    #[error("[invalid-path] Path to exclude must be in /Home: {0}")]
    NotInHome(String),

    #[error("[already-exists] Repository already exists at {0}")]
    AlreadyExists(String),

    #[error("[not-found] Repository {0} not found")]
    RepositoryNotFound(String),

    #[error("[not-found] Backup {0} not found")]
    BackupNotFound(String),

    #[error("[invalid-password] invalid repository password")]
    InvalidPassword,

    #[error("[not-enough-space] Not enough free space to restore backup (need {needed} bytes, {available} available)")]
    NotEnoughSpace { needed: u64, available: u64 },

    #[error("[in-progress] {0}")]
    InProgress(String),

    #[error("[shutting-down] Refusing to spawn new backup tool processes")]
    ShuttingDown,

    #[error("Invalid token")]
    InvalidToken,

    #[error("Mount of backup {backup_id} failed: {reason}")]
    Mount { backup_id: String, reason: String },

    /// Failure reported by the external backup tool or the OS underneath it.
    /// The original message is kept verbatim (e.g. "host is down").
    #[error(transparent)]
    Tool(#[from] anyhow::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl BackupError {
    /// Stable short code for the error, used by the API layer and logs
    pub fn code(&self) -> &'static str {
        match self {
            BackupError::InvalidPath(_) | BackupError::NotInHome(_) => "invalid-path",
            BackupError::AlreadyExists(_) => "already-exists",
            BackupError::RepositoryNotFound(_) | BackupError::BackupNotFound(_) => "not-found",
            BackupError::InvalidPassword => "invalid-password",
            BackupError::NotEnoughSpace { .. } => "not-enough-space",
            BackupError::InProgress(_) => "in-progress",
            BackupError::ShuttingDown => "shutting-down",
            BackupError::InvalidToken => "invalid-token",
            BackupError::Mount { .. } => "mount-failed",
            BackupError::Tool(_) | BackupError::Io(_) => "io",
        }
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
