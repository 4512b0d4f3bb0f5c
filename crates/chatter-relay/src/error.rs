//! Relay error types

use thiserror::Error;

/// Errors surfaced by the relay hub and its handles
#[derive(Debug, Error)]
pub enum RelayError {
    /// The hub refused a new connection because the configured limit is reached
    #[error("connection limit reached ({limit} live connections)")]
    TooManyConnections { limit: usize },

    /// The hub task has stopped; no further commands are accepted
    #[error("relay hub is shut down")]
    HubClosed,

    /// An inbound frame was not a recognized event or had the wrong payload shape
    #[error("invalid event: {0}")]
    InvalidEvent(String),
}

impl RelayError {
    pub fn invalid_event(message: impl Into<String>) -> Self {
        Self::InvalidEvent(message.into())
    }
}
