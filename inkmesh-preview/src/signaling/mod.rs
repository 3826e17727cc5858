//! Signaling relay: the slow mailbox used to bootstrap direct channels.
//!
//! ```text
//!  Peer A                 authoritative store               Peer B
//!    │  join_session ──────────► presence ◄──────── join_session │
//!    │  send(offer) ───────────► mailbox                         │
//!    │                           mailbox ◄──────────── poll (1s) │
//!    │                           mailbox ◄──── delete_signals    │
//!    │  poll (1s) ─────────────► mailbox ◄──────── send(answer)  │
//!    │                                                           │
//!    │            sweep: drop anything older than TTL            │
//! ```
//!
//! Delivery is at-least-once: a receiver deletes what it processed, and a
//! crash between processing and deletion redelivers. Every consumer must
//! apply signals idempotently.

pub mod mailbox;
pub mod types;

use async_trait::async_trait;

use crate::error::RelayError;

pub use mailbox::{MailboxRelay, RelayConfig, SweepStats};
pub use types::{
    IceCandidate, JoinResponse, PeerId, SdpKind, SessionDescription, SessionId, SignalId,
    SignalKind, SignalMessage, SignalPayload, TopologyMode,
};

/// Client view of the signaling store.
///
/// Implemented by [`MailboxRelay`] in-process; a deployment backs it with
/// remote calls to the authoritative store.
#[async_trait]
pub trait SignalingRelay: Send + Sync {
    /// Register presence and fetch the other live participants.
    async fn join_session(
        &self,
        session_id: &SessionId,
        peer_id: &PeerId,
        room_key: &str,
    ) -> Result<JoinResponse, RelayError>;

    /// Append one message addressed to `to`. No acknowledgement.
    async fn send(
        &self,
        session_id: &SessionId,
        from: &PeerId,
        to: &PeerId,
        payload: SignalPayload,
    ) -> Result<(), RelayError>;

    /// Undelivered messages for `peer_id`, oldest first.
    async fn poll(
        &self,
        session_id: &SessionId,
        peer_id: &PeerId,
    ) -> Result<Vec<SignalMessage>, RelayError>;

    /// Acknowledge processed messages.
    async fn delete_signals(&self, ids: &[SignalId]) -> Result<(), RelayError>;

    /// Drop presence and every message to or from `peer_id`.
    async fn leave(&self, session_id: &SessionId, peer_id: &PeerId) -> Result<(), RelayError>;
}
