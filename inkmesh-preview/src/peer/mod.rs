//! Direct connection management: one unreliable data channel per remote
//! participant, negotiated through the signaling relay.

pub mod manager;
pub mod metrics;
pub mod state;
pub mod strategy;

pub use manager::{InboundPacket, ManagerEvent, ManagerMode, PeerConnectionManager};
pub use metrics::{Metrics, MetricsSnapshot};
pub use state::{PeerEntry, PeerState, Role};
pub use strategy::{ConnectStrategy, FullMesh};
