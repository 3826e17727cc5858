//! Error types for the preview subsystem.
//!
//! None of these reach the end user: every failure degrades to "not
//! connected" and is surfaced only through the mode indicator.

use thiserror::Error;

use crate::signaling::PeerId;

/// Failures of the signaling relay (the store-mediated mailbox).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    /// The store could not be reached or rejected the call.
    #[error("signaling relay unavailable: {0}")]
    Unavailable(String),
    /// A participant joined with a room key that differs from the session's.
    #[error("room key does not match session {0}")]
    RoomKeyMismatch(String),
}

/// Failures of a direct peer transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("failed to create connection to {0}")]
    Connect(PeerId),
    #[error("session description rejected: {0}")]
    Description(String),
    #[error("ice candidate rejected: {0}")]
    Candidate(String),
    #[error("data channel error: {0}")]
    Channel(String),
    #[error("connection closed")]
    Closed,
}

/// Top-level errors of the manager and session façade.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PreviewError {
    #[error(transparent)]
    Relay(#[from] RelayError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("preview manager already initialized")]
    AlreadyInitialized,
    #[error("preview manager has been destroyed")]
    Destroyed,
    #[error("invalid configuration: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_error_converts() {
        let err: PreviewError = RelayError::Unavailable("timeout".into()).into();
        assert_eq!(err.to_string(), "signaling relay unavailable: timeout");
    }

    #[test]
    fn test_transport_error_converts() {
        let err: PreviewError = TransportError::Connect(PeerId::from("bob")).into();
        assert!(matches!(err, PreviewError::Transport(_)));
        assert_eq!(err.to_string(), "failed to create connection to bob");
    }
}
