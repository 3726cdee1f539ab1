//! Error types for CostPulse operations.
//!
//! This module defines [`CostPulseError`], the error enum shared by every
//! CostPulse crate. The ingestion paths never let these escape to the host
//! process: background triggers classify them with [`CostPulseError::is_transient`]
//! and log them, while foreground operations (CLI commands, manual entry)
//! surface them to the user.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using [`CostPulseError`].
pub type Result<T> = std::result::Result<T, CostPulseError>;

/// Error type for all CostPulse operations.
#[derive(Debug, Error)]
pub enum CostPulseError {
    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error with context
    #[error("I/O error {operation}: {path}")]
    Io {
        operation: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Data directory could not be determined or created
    #[error("Data directory unavailable: {message}")]
    DataDirectory { message: String },

    // =========================================================================
    // Parsing Errors
    // =========================================================================
    /// JSON parsing or serialization error
    #[error("JSON error in {context}: {message}")]
    JsonParse {
        context: String,
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    /// Settings document failed validation
    #[error("Invalid settings: {message}")]
    SettingsInvalid { message: String },

    /// A usage entry was rejected before it reached the store
    #[error("Invalid usage entry: {message}")]
    InvalidEntry { message: String },

    // =========================================================================
    // Ingestion Errors
    // =========================================================================
    /// File watcher initialization failed
    #[error("Failed to initialize file watcher: {message}")]
    WatcherInit { message: String },

    /// A single configured watch path could not be watched
    #[error("Cannot watch {path}: {message}")]
    WatchPath { path: PathBuf, message: String },

    /// Clipboard could not be read (usually held by another application)
    #[error("Clipboard unavailable: {message}")]
    Clipboard { message: String },

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal error (bug in CostPulse)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl CostPulseError {
    /// Create an I/O error
    pub fn io(operation: impl Into<String>, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            path: path.into(),
            source,
        }
    }

    /// Create a JSON parse error
    pub fn json_parse(context: impl Into<String>, source: serde_json::Error) -> Self {
        Self::JsonParse {
            context: context.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create an invalid entry error
    pub fn invalid_entry(message: impl Into<String>) -> Self {
        Self::InvalidEntry {
            message: message.into(),
        }
    }

    /// Create a clipboard error
    pub fn clipboard(message: impl Into<String>) -> Self {
        Self::Clipboard {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    // =========================================================================
    // Error classification helpers
    // =========================================================================

    /// Returns true if the next scheduled trigger should simply retry.
    ///
    /// Covers resource contention: a log file held exclusively by its writer,
    /// or a clipboard owned by another application.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Clipboard { .. } => true,
            Self::Io { source, .. } => matches!(
                source.kind(),
                std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::PermissionDenied
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }

    /// Returns true if this is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::SettingsInvalid { .. } | Self::WatchPath { .. } | Self::DataDirectory { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_context() {
        let source = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = CostPulseError::io("reading offsets", "/tmp/offsets.json", source);
        assert!(err.to_string().contains("reading offsets"));
        assert!(err.to_string().contains("/tmp/offsets.json"));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_locked_file_is_transient() {
        let source = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "locked");
        let err = CostPulseError::io("opening log", "/var/log/app.log", source);
        assert!(err.is_transient());
        assert!(CostPulseError::clipboard("owned by another app").is_transient());
    }

    #[test]
    fn test_error_classification() {
        let err = CostPulseError::WatchPath {
            path: "/missing".into(),
            message: "does not exist".into(),
        };
        assert!(err.is_config_error());
        assert!(!CostPulseError::internal("bug").is_config_error());
    }
}
