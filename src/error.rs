use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{EndpointId, SecretId};

/// Storage backend failure.
///
/// The in-memory store never produces these; durable backends wrap their
/// driver errors here.
#[derive(Debug, Error)]
#[error("storage backend error: {0}")]
pub struct StorageError(pub String);

#[cfg(feature = "postgres")]
impl From<tokio_postgres::Error> for StorageError {
    fn from(err: tokio_postgres::Error) -> Self {
        Self(err.to_string())
    }
}

/// Errors surfaced synchronously to callers configuring the catalog or
/// the endpoint registry. Never raised from the delivery path.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("event type already registered: {name}")]
    DuplicateEventType { name: String },

    #[error("unknown event type: {name}")]
    EventTypeNotFound { name: String },

    #[error("endpoint not found: {id}")]
    EndpointNotFound { id: EndpointId },

    #[error("secret not found: {id}")]
    SecretNotFound { id: SecretId },

    #[error("invalid endpoint configuration: {reason}")]
    Validation { reason: String },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl RegistryError {
    pub(crate) fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }
}

/// Errors returned by `emit()`.
///
/// `emit()` fails only when the event cannot be durably recorded or names
/// an unregistered event type. Fan-out, filtering, and delivery failures
/// are never surfaced here.
#[derive(Debug, Error)]
pub enum EmitError {
    /// The event type was never registered. Unknown types fail loudly
    /// instead of falling back to a default definition.
    #[error("unknown event type: {name}")]
    UnknownEventType { name: String },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Classification of a failed delivery attempt.
///
/// Recorded on attempt rows for operator diagnostics. Control flow only
/// cares about the success/failure boolean plus the retryability of
/// [`AttemptFailure::HttpStatus`] codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "status", rename_all = "snake_case")]
pub enum AttemptFailure {
    /// The attempt exceeded the endpoint's configured timeout.
    Timeout,

    /// TCP-level failure: refused, reset, unreachable.
    Connection,

    /// TLS handshake or certificate failure.
    Ssl,

    /// Name resolution failure.
    Dns,

    /// The receiver responded with a non-2xx status.
    HttpStatus(u16),
}

impl AttemptFailure {
    /// Whether a failure of this class may succeed on a later attempt.
    ///
    /// 4xx responses (other than 429) indicate the receiver rejects this
    /// request; retrying them is an endpoint policy decision.
    pub fn is_retryable(&self, retry_client_errors: bool) -> bool {
        match self {
            Self::Timeout | Self::Connection | Self::Ssl | Self::Dns => true,
            Self::HttpStatus(429) => true,
            Self::HttpStatus(status) if (400..500).contains(status) => retry_client_errors,
            Self::HttpStatus(_) => true,
        }
    }
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "request timed out"),
            Self::Connection => write!(f, "connection error"),
            Self::Ssl => write!(f, "ssl error"),
            Self::Dns => write!(f, "dns error"),
            Self::HttpStatus(status) => write!(f, "http error: status {status}"),
        }
    }
}
