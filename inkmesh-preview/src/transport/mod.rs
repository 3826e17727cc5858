//! Direct peer transport seam.
//!
//! The manager never talks to a concrete NAT-traversing stack. It drives a
//! [`Transport`] that hands out one [`PeerLink`] per remote participant, and
//! every asynchronous happening on a link (a trickled local candidate, the
//! data channel opening, an inbound message, a close) comes back as a
//! [`LinkEvent`] on a channel the manager owns.
//!
//! ```text
//!   PeerConnectionManager ──connect()──► Transport
//!          ▲                                 │
//!          │ LinkEvent (peer, link id, kind) │ Arc<dyn PeerLink>
//!          └─────────── mpsc ◄───────────────┘
//! ```
//!
//! Implementations:
//! - [`loopback::LoopbackNetwork`]: in-process network for tests and demos
//! - `webrtc::WebRtcTransport`: WebRTC data channels (feature `webrtc`)

pub mod loopback;
#[cfg(feature = "webrtc")]
pub mod webrtc;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::signaling::{IceCandidate, PeerId, SessionDescription};

pub use loopback::{LoopbackNetwork, LoopbackTransport};

/// Generation number of a link. A peer that reconnects gets a new one, so
/// late events from the previous link can be told apart.
pub type LinkId = u64;

/// Data channel configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOptions {
    pub label: String,
    pub ordered: bool,
    /// `Some(0)` means fire-and-forget with no retransmission.
    pub max_retransmits: Option<u16>,
}

impl ChannelOptions {
    /// Unordered, zero-retransmit channel. Stale preview points are worse
    /// than lost ones.
    pub fn unreliable(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ordered: false,
            max_retransmits: Some(0),
        }
    }
}

/// What happened on a link.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEventKind {
    /// A local candidate was gathered and must be relayed to the peer.
    LocalCandidate(IceCandidate),
    /// The answering side received the channel created by the offerer.
    ChannelAdopted,
    ChannelOpen,
    /// One binary message, delivered whole.
    Message(Vec<u8>),
    ChannelClosed,
    ChannelError(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct LinkEvent {
    pub peer_id: PeerId,
    pub link_id: LinkId,
    pub kind: LinkEventKind,
}

/// Handle a transport uses to report events for one link.
#[derive(Debug, Clone)]
pub struct LinkEventSender {
    peer_id: PeerId,
    link_id: LinkId,
    tx: mpsc::UnboundedSender<LinkEvent>,
}

impl LinkEventSender {
    pub fn new(peer_id: PeerId, link_id: LinkId, tx: mpsc::UnboundedSender<LinkEvent>) -> Self {
        Self {
            peer_id,
            link_id,
            tx,
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn link_id(&self) -> LinkId {
        self.link_id
    }

    /// Report an event. Returns `false` once the manager has gone away.
    pub fn emit(&self, kind: LinkEventKind) -> bool {
        self.tx
            .send(LinkEvent {
                peer_id: self.peer_id.clone(),
                link_id: self.link_id,
                kind,
            })
            .is_ok()
    }
}

/// Factory for links to remote peers.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Create a fresh link to `remote`. Events for it go to `events`.
    async fn connect(
        &self,
        remote: &PeerId,
        events: LinkEventSender,
    ) -> Result<Arc<dyn PeerLink>, TransportError>;
}

/// One transport connection plus its data channel.
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Create the outbound data channel (offering side only).
    async fn create_data_channel(&self, options: &ChannelOptions) -> Result<(), TransportError>;

    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    /// Queue one message on the data channel without waiting.
    ///
    /// Returns `false` when the channel is not open or its buffer is full;
    /// the message is dropped in that case.
    fn send(&self, data: &[u8]) -> bool;

    /// Current round-trip estimate, if the link can measure one.
    async fn round_trip_time(&self) -> Option<Duration>;

    /// Close channel and connection. Never fails.
    async fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unreliable_options() {
        let opts = ChannelOptions::unreliable("preview");
        assert_eq!(opts.label, "preview");
        assert!(!opts.ordered);
        assert_eq!(opts.max_retransmits, Some(0));
    }

    #[tokio::test]
    async fn test_event_sender_tags_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sender = LinkEventSender::new(PeerId::from("bob"), 7, tx);
        assert!(sender.emit(LinkEventKind::ChannelOpen));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.peer_id, PeerId::from("bob"));
        assert_eq!(event.link_id, 7);
        assert_eq!(event.kind, LinkEventKind::ChannelOpen);
    }

    #[test]
    fn test_event_sender_reports_dropped_receiver() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let sender = LinkEventSender::new(PeerId::from("bob"), 1, tx);
        assert!(!sender.emit(LinkEventKind::ChannelClosed));
    }
}
