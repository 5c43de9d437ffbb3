//! Error types for the Stratus message bus.

use thiserror::Error;

/// Result type alias for bus operations.
pub type BusResult<T> = Result<T, BusError>;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("failed to encode payload for {subject}: {source}")]
    Encode {
        subject: String,
        source: serde_json::Error,
    },

    #[error("bus is closed")]
    Closed,

    #[error("envelope on {subject} has no reply subject")]
    NoReplySubject { subject: String },

    #[error("bus connection error: {0}")]
    Connection(#[from] std::io::Error),

    #[error("malformed frame: {0}")]
    Frame(#[source] serde_json::Error),
}

/// An inbound payload that could not be decoded into a command.
///
/// `droplet` carries the application id when the payload still exposed
/// one, so the failure can be reported against that application.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed message on {subject}: {reason}")]
pub struct MalformedMessage {
    pub subject: String,
    pub droplet: Option<String>,
    pub reason: String,
}

impl MalformedMessage {
    pub(crate) fn new(subject: &str, droplet: Option<String>, reason: impl Into<String>) -> Self {
        Self {
            subject: subject.to_string(),
            droplet,
            reason: reason.into(),
        }
    }
}
