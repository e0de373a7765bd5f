//! Error types for Tether.
//!
//! This module provides a unified error type for all Tether operations,
//! with specific error variants for different failure modes.

use std::io;

use thiserror::Error;

/// A specialized `Result` type for Tether operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Message fragments that mark an error as an authentication failure.
const AUTH_ERROR_MARKERS: [&str; 5] = ["401", "403", "unauthorized", "authentication", "token"];

/// The main error type for Tether.
#[derive(Error, Debug)]
pub enum Error {
    /// Remote session does not exist
    #[error("session '{0}' not found")]
    SessionNotFound(String),

    /// No session id was given and no session is active
    #[error("no active session")]
    NoActiveSession,

    /// Title is empty or only whitespace
    #[error("session title cannot be empty")]
    InvalidTitle,

    /// Host has no data for the task
    #[error("task '{0}' not found")]
    TaskNotFound(String),

    /// Remote store request failed
    #[error("remote store error: {0}")]
    Remote(String),

    /// Remote store rejected the credentials
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Git command failed
    #[error("git command failed: {0}")]
    Git(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration file error
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Operation timeout
    #[error("operation timed out after {0} seconds")]
    Timeout(u64),

    /// Internal error (should not happen)
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl Error {
    /// Returns whether this error means the auth token is no longer accepted.
    ///
    /// Transport errors arrive as free-form messages, so detection is by
    /// message content rather than by variant.
    #[must_use]
    pub fn is_auth_error(&self) -> bool {
        if matches!(self, Self::Auth(_)) {
            return true;
        }
        let message = self.to_string().to_lowercase();
        AUTH_ERROR_MARKERS
            .iter()
            .any(|marker| message.contains(marker))
    }

    /// Returns whether this error is transient and worth retrying on the next pass.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Remote(_) | Self::Timeout(_) | Self::Io(_))
    }
}
