//! # inkmesh-preview: live stroke previews for a collaborative canvas
//!
//! Streams in-progress strokes and cursors directly between participants so
//! everyone sees a stroke while it is being drawn, well before the committed
//! version arrives through the document store. The slow store doubles as a
//! signaling mailbox used once per peer pair to open an unreliable data
//! channel.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐   offer/answer/candidates   ┌──────────────────┐
//! │ PeerConnection   │ ◄──── SignalingRelay ─────► │ PeerConnection   │
//! │ Manager (peer A) │        (1s mailbox poll)    │ Manager (peer B) │
//! └────────┬─────────┘                             └────────┬─────────┘
//!          │        22-byte point / 11-byte cursor          │
//!          └──────────── unreliable data channel ───────────┘
//!          │                                                │
//!          ▼                                                ▼
//! ┌──────────────────┐                             ┌──────────────────┐
//! │ PreviewSession   │                             │ PreviewSession   │
//! │ (strokes, cursors│                             │ (strokes, cursors│
//! │  idle sweep)     │                             │  idle sweep)     │
//! └──────────────────┘                             └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`codec`]: fixed-layout binary packets (bincode, little-endian)
//! - [`signaling`]: relay trait, signal records and the in-memory mailbox
//! - [`transport`]: peer link seam, loopback network, optional WebRTC
//! - [`peer`]: connection manager, per-peer state machine, metrics
//! - [`session`]: remote stroke/cursor book and the consumer façade
//! - [`config`]: tuning knobs with serde defaults

pub mod codec;
pub mod config;
pub mod error;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod transport;

// Re-exports for convenience
pub use codec::{
    decode_batch, encode_batch, CodecError, CursorPacket, Packet, PointPacket, StrokeTag,
    CURSOR_PACKET_SIZE, POINT_PACKET_SIZE,
};
pub use config::PreviewConfig;
pub use error::{PreviewError, RelayError, TransportError};
pub use peer::{
    ConnectStrategy, FullMesh, InboundPacket, ManagerEvent, ManagerMode, MetricsSnapshot,
    PeerConnectionManager, PeerState,
};
pub use session::{
    CanvasSize, PreviewSession, RemoteCursor, RemoteStroke, SessionUpdate, StrokeBook, StrokeKey,
    StrokePoint,
};
pub use signaling::{
    JoinResponse, MailboxRelay, PeerId, RelayConfig, SessionId, SignalMessage, SignalPayload,
    SignalingRelay, TopologyMode,
};
pub use transport::{LoopbackNetwork, PeerLink, Transport};
#[cfg(feature = "webrtc")]
pub use transport::webrtc::WebRtcTransport;
