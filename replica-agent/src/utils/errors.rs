//! Error types for the replication engine.

use crate::fs::fingerprint::FileFingerprint;
use crate::replication::source::Source;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReplicationError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unknown replication session: {0}")]
    UnknownSession(String),

    #[error("Unknown file in session manifest: {src}/{name}")]
    UnknownFile { src: Source, name: String },

    #[error("Unknown index: {0}")]
    UnknownIndex(String),

    #[error("Required source directory is missing: {src} ({})", .path.display())]
    MissingSource { src: Source, path: PathBuf },

    #[error("Content mismatch for {src}/{name}: expected {expected}, got {actual}")]
    ContentMismatch {
        src: Source,
        name: String,
        expected: FileFingerprint,
        actual: FileFingerprint,
    },

    #[error("Invalid replication session: {0}")]
    InvalidSession(String),

    #[error("Staging error: {0}")]
    Staging(String),

    #[error("Invalid replication state: cannot {action} while {state}")]
    InvalidState { action: &'static str, state: String },

    #[error("Replication cancelled")]
    Cancelled,

    #[error("A replication round is already running for index {0}")]
    AlreadyRunning(String),
}

/// How a failure should be treated by whoever drives replication rounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Caller mistake or bad configuration, never retried automatically.
    Programming,
    /// The round failed as a whole and can be retried from scratch.
    Transient,
    /// Local environment is broken (staging not creatable, live dir not writable).
    Fatal,
    /// An operator asked for the round to stop.
    Cancelled,
}

impl ReplicationError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ReplicationError::Config(_)
            | ReplicationError::UnknownSession(_)
            | ReplicationError::UnknownFile { .. }
            | ReplicationError::UnknownIndex(_)
            | ReplicationError::MissingSource { .. }
            | ReplicationError::InvalidSession(_)
            | ReplicationError::InvalidState { .. } => ErrorClass::Programming,
            ReplicationError::Network(_)
            | ReplicationError::Http(_)
            | ReplicationError::Io(_)
            | ReplicationError::Serialization(_)
            | ReplicationError::ContentMismatch { .. }
            | ReplicationError::AlreadyRunning(_) => ErrorClass::Transient,
            ReplicationError::Staging(_) => ErrorClass::Fatal,
            ReplicationError::Cancelled => ErrorClass::Cancelled,
        }
    }

    /// Short machine-readable code, shared with the master's HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            ReplicationError::Config(_) => "config",
            ReplicationError::Io(_) => "io",
            ReplicationError::Network(_) | ReplicationError::Http(_) => "network",
            ReplicationError::Serialization(_) => "serialization",
            ReplicationError::UnknownSession(_) => "unknown_session",
            ReplicationError::UnknownFile { .. } => "unknown_file",
            ReplicationError::UnknownIndex(_) => "unknown_index",
            ReplicationError::MissingSource { .. } => "missing_source",
            ReplicationError::ContentMismatch { .. } => "content_mismatch",
            ReplicationError::InvalidSession(_) => "invalid_session",
            ReplicationError::Staging(_) => "staging",
            ReplicationError::InvalidState { .. } => "invalid_state",
            ReplicationError::Cancelled => "cancelled",
            ReplicationError::AlreadyRunning(_) => "already_running",
        }
    }
}

pub type Result<T> = std::result::Result<T, ReplicationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert_eq!(
            ReplicationError::UnknownSession("s1".into()).class(),
            ErrorClass::Programming
        );
        assert_eq!(
            ReplicationError::UnknownFile { src: Source::Index, name: "seg1".into() }.class(),
            ErrorClass::Programming
        );
        assert_eq!(
            ReplicationError::ContentMismatch {
                src: Source::Index,
                name: "seg1".into(),
                expected: FileFingerprint::new(100, 1000),
                actual: FileFingerprint::new(99, 1000),
            }
            .class(),
            ErrorClass::Transient
        );
        assert_eq!(ReplicationError::Staging("no space".into()).class(), ErrorClass::Fatal);
        assert_eq!(ReplicationError::Cancelled.class(), ErrorClass::Cancelled);
    }

    #[test]
    fn test_error_messages() {
        let err = ReplicationError::UnknownFile { src: Source::Taxonomy, name: "_0.cfs".into() };
        assert_eq!(err.to_string(), "Unknown file in session manifest: taxonomy/_0.cfs");
        assert_eq!(err.code(), "unknown_file");
    }
}
