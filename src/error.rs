//! Error types for the submission pipeline.
//!
//! Errors fall into four classes with different propagation rules: validation
//! failures are reported before any I/O, staging and dispatch failures are
//! terminal for the submission (cleanup still runs), and audit write failures
//! are logged and swallowed by the reconciler.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using the fieldlog error type.
pub type Result<T> = std::result::Result<T, FieldlogError>;

/// Main error type for the submission pipeline.
#[derive(Error, Debug)]
pub enum FieldlogError {
    /// The submitted form is missing data or has too many attachments
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Uploaded attachments could not be written to the staging area
    #[error("Staging error: {0}")]
    Staging(#[from] StagingError),

    /// The notification could not be delivered to the mail relay
    #[error("Failed to send email: {0}")]
    Dispatch(#[from] DispatchFailure),

    /// The audit trail entry could not be written
    #[error("Audit write failed: {0}")]
    AuditWrite(String),

    /// Invalid or missing configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// General error from anyhow
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// How a caller should react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Fix the input and resubmit
    Client,
    /// Nothing wrong with the input; resubmitting later may succeed
    Retryable,
    /// Server-side fault
    Internal,
}

impl FieldlogError {
    pub fn class(&self) -> ErrorClass {
        match self {
            FieldlogError::Validation(_) => ErrorClass::Client,
            FieldlogError::Dispatch(DispatchFailure::Message(_)) => ErrorClass::Internal,
            FieldlogError::Dispatch(_) => ErrorClass::Retryable,
            FieldlogError::Staging(StagingError::QuotaExceeded { .. }) => ErrorClass::Client,
            FieldlogError::Staging(_)
            | FieldlogError::AuditWrite(_)
            | FieldlogError::Config(_)
            | FieldlogError::Serialization(_)
            | FieldlogError::Other(_) => ErrorClass::Internal,
        }
    }

    /// Short machine-readable tag used in API error payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            FieldlogError::Validation(_) => "validation",
            FieldlogError::Staging(_) => "staging",
            FieldlogError::Dispatch(_) => "dispatch",
            FieldlogError::AuditWrite(_) => "audit",
            FieldlogError::Config(_) => "config",
            FieldlogError::Serialization(_) | FieldlogError::Other(_) => "internal",
        }
    }
}

/// The first constraint a submission violated.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("missing hours for employee #{index} ({name})")]
    MissingEmployeeHours { index: usize, name: String },

    #[error("too many attachments: {count} (maximum {max})")]
    TooManyAttachments { count: usize, max: usize },
}

/// Failure while materializing uploaded attachments.
#[derive(Error, Debug)]
pub enum StagingError {
    #[error("failed to create staging directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write attachment '{name}': {source}")]
    Write {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("attachments exceed the staging quota of {limit} bytes")]
    QuotaExceeded { limit: u64 },

    #[error("failed to scan staging area {path}: {source}")]
    Sweep {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Why a dispatch attempt did not transmit the message.
///
/// Carried inside [`crate::transport::DispatchOutcome::Failed`]; the transport
/// never retries, so each value is final for its submission.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchFailure {
    #[error("timed out connecting to mail relay")]
    ConnectTimeout,

    #[error("could not connect to mail relay: {0}")]
    Connect(String),

    #[error("timed out transmitting message")]
    SendTimeout,

    #[error("mail relay rejected message: {0}")]
    Relay(String),

    /// The message could not be built locally (unreadable attachment, bad
    /// address); the relay was never involved
    #[error("{0}")]
    Message(String),

    #[error("dispatch transport is shutting down")]
    Shutdown,
}

impl DispatchFailure {
    /// Low-cardinality label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            DispatchFailure::ConnectTimeout => "connect_timeout",
            DispatchFailure::Connect(_) => "connect",
            DispatchFailure::SendTimeout => "send_timeout",
            DispatchFailure::Relay(_) => "relay",
            DispatchFailure::Message(_) => "message",
            DispatchFailure::Shutdown => "shutdown",
        }
    }
}
