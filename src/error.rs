//! Error types for the datshare library
//!
//! Every fallible operation in the crate returns [`ShareError`]. Variants are
//! split between fatal conditions (missing root, busy root, exhausted
//! persistence retries) and per-entry conditions that the walker and the
//! reconciler recover from locally by recording a warning.

use std::path::PathBuf;
use thiserror::Error;

/// Type alias for Results in the datshare library
pub type Result<T> = std::result::Result<T, ShareError>;

/// Main error type for all datshare operations
#[derive(Debug, Error)]
pub enum ShareError {
    /// The root directory does not exist
    #[error("Path not found: {0:?}")]
    PathNotFound(PathBuf),

    /// Permission denied for an entry
    #[error("Permission denied: {path:?}")]
    PermissionDenied {
        /// Path where permission was denied
        path: PathBuf,
    },

    /// Reading file content failed part way
    #[error("Read failure on {path:?}: {source}")]
    ReadFailure {
        /// Path that could not be read
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Resume state could not be written after all retries
    #[error("Failed to persist state after {attempts} attempts: {reason}")]
    PersistFailure {
        /// Number of attempts made
        attempts: u32,
        /// Last error observed
        reason: String,
    },

    /// Another instance already holds the root
    #[error("Root is busy: {0:?} is locked by another instance")]
    RootBusy(PathBuf),

    /// I/O errors during file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors during JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Errors during bincode serialization/deserialization
    #[error("Bincode error: {0}")]
    Bincode(String),

    /// Filesystem notification backend failure
    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),

    /// Walk directory error from walkdir crate
    #[error("Walk directory error: {0}")]
    Walk(#[from] walkdir::Error),

    /// Pattern parsing error
    #[error("Invalid ignore pattern: {0}")]
    InvalidPattern(String),

    /// Persisted state failed validation
    #[error("Corrupt resume state: {0}")]
    CorruptState(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Text that does not parse as a 64 character hex key
    #[error("Invalid identity key: {0}")]
    InvalidKey(String),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<bincode::error::DecodeError> for ShareError {
    fn from(err: bincode::error::DecodeError) -> Self {
        ShareError::Bincode(err.to_string())
    }
}

impl From<bincode::error::EncodeError> for ShareError {
    fn from(err: bincode::error::EncodeError) -> Self {
        ShareError::Bincode(err.to_string())
    }
}

impl From<globset::Error> for ShareError {
    fn from(err: globset::Error) -> Self {
        ShareError::InvalidPattern(err.to_string())
    }
}

impl ShareError {
    /// Create an internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        ShareError::Internal(msg.into())
    }

    /// Create a corrupt-state error with a custom message
    pub fn corrupt(msg: impl Into<String>) -> Self {
        ShareError::CorruptState(msg.into())
    }

    /// Classify an I/O error raised while reading `path`
    ///
    /// `PermissionDenied` keeps its own variant so callers can degrade the
    /// entry without retrying; everything else is a [`ShareError::ReadFailure`].
    pub fn from_read(path: impl Into<PathBuf>, err: std::io::Error) -> Self {
        let path = path.into();
        match err.kind() {
            std::io::ErrorKind::PermissionDenied => ShareError::PermissionDenied { path },
            std::io::ErrorKind::NotFound => ShareError::PathNotFound(path),
            _ => ShareError::ReadFailure { path, source: err },
        }
    }

    /// Check if this error is recoverable at the entry level
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ShareError::PermissionDenied { .. } | ShareError::ReadFailure { .. }
        )
    }

    /// Check if this error indicates a damaged control directory
    pub fn is_corruption(&self) -> bool {
        matches!(self, ShareError::CorruptState(_) | ShareError::Bincode(_))
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self {
            ShareError::PathNotFound(path) => {
                format!("Directory {:?} does not exist. Check the path and try again.", path)
            }
            ShareError::PermissionDenied { path } => {
                format!(
                    "Permission denied for {:?}. The entry was skipped; check file permissions.",
                    path
                )
            }
            ShareError::RootBusy(path) => {
                format!(
                    "{:?} is already being shared by another process. Stop it first.",
                    path
                )
            }
            ShareError::PersistFailure { attempts, .. } => {
                format!(
                    "Could not save share state after {} attempts. Check free disk space \
                     and permissions of the control directory.",
                    attempts
                )
            }
            _ => self.to_string(),
        }
    }
}
