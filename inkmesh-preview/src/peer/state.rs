//! Per-peer connection bookkeeping owned by the driver task.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use tokio::time::Instant;

use crate::signaling::{IceCandidate, PeerId};
use crate::transport::{LinkId, PeerLink};

/// Lifecycle of one direct connection.
///
/// `Idle → Negotiating → Open → Closed`. A closed entry is removed from the
/// peer map right away, so `Closed` is only observed on a detached entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Idle,
    Negotiating,
    Open,
    Closed,
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PeerState::Idle => "idle",
            PeerState::Negotiating => "negotiating",
            PeerState::Open => "open",
            PeerState::Closed => "closed",
        })
    }
}

/// Which side of the offer/answer exchange we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Offerer,
    Answerer,
}

pub struct PeerEntry {
    pub peer_id: PeerId,
    pub link_id: LinkId,
    pub link: Arc<dyn PeerLink>,
    pub role: Role,
    pub state: PeerState,
    pub started_at: Instant,
    pub remote_description_set: bool,
    /// Candidates that arrived before the remote description.
    pending_candidates: Vec<IceCandidate>,
    seen_candidates: HashSet<String>,
}

impl PeerEntry {
    pub fn new(peer_id: PeerId, link_id: LinkId, link: Arc<dyn PeerLink>, role: Role) -> Self {
        Self {
            peer_id,
            link_id,
            link,
            role,
            state: PeerState::Idle,
            started_at: Instant::now(),
            remote_description_set: false,
            pending_candidates: Vec::new(),
            seen_candidates: HashSet::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == PeerState::Open
    }

    pub fn is_negotiating(&self) -> bool {
        matches!(self.state, PeerState::Idle | PeerState::Negotiating)
    }

    /// Record a remote candidate. Returns `false` for one already seen.
    pub fn note_candidate(&mut self, candidate: &IceCandidate) -> bool {
        self.seen_candidates.insert(candidate.candidate.clone())
    }

    pub fn buffer_candidate(&mut self, candidate: IceCandidate) {
        self.pending_candidates.push(candidate);
    }

    pub fn take_pending_candidates(&mut self) -> Vec<IceCandidate> {
        std::mem::take(&mut self.pending_candidates)
    }
}

impl fmt::Debug for PeerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerEntry")
            .field("peer_id", &self.peer_id)
            .field("link_id", &self.link_id)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("remote_description_set", &self.remote_description_set)
            .field("pending_candidates", &self.pending_candidates.len())
            .finish()
    }
}
