//! Error taxonomy shared by every role
//!
//! Only startup paths (config loading, port binding, credential checks) let
//! these errors escape to `main`. Everything that happens while running is
//! logged and turned into an `error` reply or a per-target failure.

use std::io;
use thiserror::Error;

/// Errors produced by the announce/request/transfer machinery
#[derive(Debug, Error)]
pub enum MoveError {
    /// A path did not match the configured pattern. Never fatal.
    #[error("path {0} does not match the pattern")]
    PatternMismatch(String),

    /// A payload or request could not be understood
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// A mover backend reported a failure
    #[error("transfer to {destination} failed: {reason}")]
    TransferFailure { destination: String, reason: String },

    /// No reply arrived before the request timeout
    #[error("request to {address} timed out")]
    RequestTimeout { address: String },

    /// A config section could not be (re)started
    #[error("could not reload section {section}: {reason}")]
    ConfigReload { section: String, reason: String },

    /// The identity is already in the dedup cache
    #[error("message {0} was already handled")]
    DuplicateMessage(String),

    /// Configuration file or value is invalid
    #[error("configuration error: {0}")]
    Config(String),

    /// A template could not be composed from the available metadata
    #[error("template error: {0}")]
    Template(String),

    /// No mover is registered for the URI scheme
    #[error("unsupported protocol '{0}'")]
    UnsupportedScheme(String),

    /// Transport-level problem on the message bus
    #[error("bus error: {0}")]
    Bus(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl MoveError {
    /// Shorthand used by the executor and movers
    pub fn transfer(destination: impl Into<String>, reason: impl ToString) -> Self {
        MoveError::TransferFailure {
            destination: destination.into(),
            reason: reason.to_string(),
        }
    }

    /// True for the errors that are expected during normal operation and
    /// should not be reported as failures.
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            MoveError::PatternMismatch(_) | MoveError::DuplicateMessage(_)
        )
    }
}

impl From<serde_json::Error> for MoveError {
    fn from(e: serde_json::Error) -> Self {
        MoveError::InvalidMessage(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MoveError>;
