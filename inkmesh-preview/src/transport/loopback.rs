//! In-process transport.
//!
//! Every participant in one process gets a [`LoopbackTransport`] from a
//! shared [`LoopbackNetwork`]. Links follow the same handshake a real stack
//! does: the channel only opens once both ends have a local and a remote
//! description and have each received at least one candidate from the other
//! side. Tests use [`LoopbackNetwork::sever`] and [`LoopbackNetwork::block`]
//! to simulate a dropped connection and an unreachable peer.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, trace};

use crate::error::TransportError;
use crate::signaling::{IceCandidate, PeerId, SdpKind, SessionDescription};
use crate::transport::{ChannelOptions, LinkEventKind, LinkEventSender, LinkId, PeerLink, Transport};

const SDP_PREFIX: &str = "loopback";
const DEFAULT_RTT: Duration = Duration::from_millis(2);

/// One side of a link, keyed by (local, remote).
struct Endpoint {
    link_id: LinkId,
    events: LinkEventSender,
    channel: Option<ChannelOptions>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    remote_candidates: usize,
    open: bool,
}

#[derive(Default)]
struct NetworkState {
    endpoints: HashMap<(PeerId, PeerId), Endpoint>,
    blocked: HashSet<(PeerId, PeerId)>,
    links_created: u64,
    rtt: Option<Duration>,
}

impl NetworkState {
    fn pair(a: &PeerId, b: &PeerId) -> (PeerId, PeerId) {
        if a <= b {
            (a.clone(), b.clone())
        } else {
            (b.clone(), a.clone())
        }
    }

    fn endpoint_mut(&mut self, local: &PeerId, remote: &PeerId, link_id: LinkId) -> Option<&mut Endpoint> {
        self.endpoints
            .get_mut(&(local.clone(), remote.clone()))
            .filter(|ep| ep.link_id == link_id)
    }

    /// Open both ends if the handshake is complete.
    fn try_open(&mut self, a: &PeerId, b: &PeerId) {
        if self.blocked.contains(&Self::pair(a, b)) {
            return;
        }
        let ready = |ep: Option<&Endpoint>| {
            ep.map(|ep| !ep.open && ep.local.is_some() && ep.remote.is_some() && ep.remote_candidates > 0)
                .unwrap_or(false)
        };
        let ab = (a.clone(), b.clone());
        let ba = (b.clone(), a.clone());
        if !ready(self.endpoints.get(&ab)) || !ready(self.endpoints.get(&ba)) {
            return;
        }

        for key in [&ab, &ba] {
            if let Some(ep) = self.endpoints.get_mut(key) {
                ep.open = true;
                if ep.channel.is_none() {
                    ep.events.emit(LinkEventKind::ChannelAdopted);
                }
                ep.events.emit(LinkEventKind::ChannelOpen);
            }
        }
        debug!("loopback link {} <-> {} open", a, b);
    }

    /// Tear down the open state of both ends and notify them.
    fn close_pair(&mut self, a: &PeerId, b: &PeerId) -> bool {
        let mut closed = false;
        for key in [(a.clone(), b.clone()), (b.clone(), a.clone())] {
            if let Some(ep) = self.endpoints.get_mut(&key) {
                if ep.open {
                    ep.open = false;
                    ep.events.emit(LinkEventKind::ChannelClosed);
                    closed = true;
                }
            }
        }
        closed
    }
}

/// Shared in-process network.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport for one participant.
    pub fn transport(&self, local: impl Into<PeerId>) -> LoopbackTransport {
        LoopbackTransport {
            local: local.into(),
            state: Arc::clone(&self.state),
        }
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        lock_state(&self.state)
    }

    /// Drop an open link between `a` and `b`. Both ends see a close.
    pub fn sever(&self, a: &PeerId, b: &PeerId) -> bool {
        self.lock().close_pair(a, b)
    }

    /// Make `a` and `b` unreachable from each other. Open links are severed
    /// and new handshakes never complete.
    pub fn block(&self, a: &PeerId, b: &PeerId) {
        let mut state = self.lock();
        state.blocked.insert(NetworkState::pair(a, b));
        state.close_pair(a, b);
    }

    pub fn unblock(&self, a: &PeerId, b: &PeerId) {
        let mut state = self.lock();
        state.blocked.remove(&NetworkState::pair(a, b));
        state.try_open(a, b);
    }

    /// Round-trip time reported by every open link.
    pub fn set_rtt(&self, rtt: Duration) {
        self.lock().rtt = Some(rtt);
    }

    pub fn is_open(&self, a: &PeerId, b: &PeerId) -> bool {
        self.lock()
            .endpoints
            .get(&(a.clone(), b.clone()))
            .map(|ep| ep.open)
            .unwrap_or(false)
    }

    /// Total links ever created on this network.
    pub fn links_created(&self) -> u64 {
        self.lock().links_created
    }
}

fn lock_state(state: &Mutex<NetworkState>) -> MutexGuard<'_, NetworkState> {
    // A panic while holding the lock leaves plain data behind.
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One participant's view of the loopback network.
#[derive(Clone)]
pub struct LoopbackTransport {
    local: PeerId,
    state: Arc<Mutex<NetworkState>>,
}

impl LoopbackTransport {
    pub fn local_peer(&self) -> &PeerId {
        &self.local
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn connect(
        &self,
        remote: &PeerId,
        events: LinkEventSender,
    ) -> Result<Arc<dyn PeerLink>, TransportError> {
        if *remote == self.local {
            return Err(TransportError::Connect(remote.clone()));
        }
        let link_id = events.link_id();
        let mut state = lock_state(&self.state);
        let key = (self.local.clone(), remote.clone());
        let replaced = state.endpoints.insert(
            key,
            Endpoint {
                link_id,
                events,
                channel: None,
                local: None,
                remote: None,
                remote_candidates: 0,
                open: false,
            },
        );
        if replaced.is_some_and(|ep| ep.open) {
            // The remote end loses its counterpart.
            if let Some(ep) = state.endpoints.get_mut(&(remote.clone(), self.local.clone())) {
                if ep.open {
                    ep.open = false;
                    ep.events.emit(LinkEventKind::ChannelClosed);
                }
            }
        }
        state.links_created += 1;
        trace!("loopback link {} -> {} created (link {})", self.local, remote, link_id);

        Ok(Arc::new(LoopbackLink {
            local: self.local.clone(),
            remote: remote.clone(),
            link_id,
            state: Arc::clone(&self.state),
        }))
    }
}

struct LoopbackLink {
    local: PeerId,
    remote: PeerId,
    link_id: LinkId,
    state: Arc<Mutex<NetworkState>>,
}

impl LoopbackLink {
    fn with_endpoint<T>(
        &self,
        f: impl FnOnce(&mut Endpoint) -> Result<T, TransportError>,
    ) -> Result<T, TransportError> {
        let mut state = lock_state(&self.state);
        let ep = state
            .endpoint_mut(&self.local, &self.remote, self.link_id)
            .ok_or(TransportError::Closed)?;
        let out = f(ep)?;
        state.try_open(&self.local, &self.remote);
        Ok(out)
    }

    fn sdp(&self, kind: &str) -> String {
        format!("{SDP_PREFIX} {kind} {}->{} link={}", self.local, self.remote, self.link_id)
    }
}

#[async_trait]
impl PeerLink for LoopbackLink {
    async fn create_data_channel(&self, options: &ChannelOptions) -> Result<(), TransportError> {
        self.with_endpoint(|ep| {
            ep.channel = Some(options.clone());
            Ok(())
        })
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let sdp = self.sdp("offer");
        self.with_endpoint(|ep| {
            if ep.channel.is_none() {
                return Err(TransportError::Description("offer without a data channel".into()));
            }
            Ok(SessionDescription::offer(sdp))
        })
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let sdp = self.sdp("answer");
        self.with_endpoint(|ep| match &ep.remote {
            Some(remote) if remote.kind == SdpKind::Offer => Ok(SessionDescription::answer(sdp)),
            _ => Err(TransportError::Description("answer without a remote offer".into())),
        })
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        let candidate = IceCandidate {
            candidate: format!("candidate:{} 1 udp 2130706431 127.0.0.1 {} typ host", self.link_id, self.link_id),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
            username_fragment: None,
        };
        self.with_endpoint(|ep| {
            ep.local = Some(desc);
            ep.events.emit(LinkEventKind::LocalCandidate(candidate));
            Ok(())
        })
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        if !desc.sdp.starts_with(SDP_PREFIX) {
            return Err(TransportError::Description(format!("unparseable sdp from {}", self.remote)));
        }
        self.with_endpoint(|ep| {
            if ep.remote.is_some() {
                return Err(TransportError::Description("remote description already set".into()));
            }
            ep.remote = Some(desc);
            Ok(())
        })
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        if !candidate.candidate.starts_with("candidate:") {
            return Err(TransportError::Candidate(candidate.candidate));
        }
        self.with_endpoint(|ep| {
            if ep.remote.is_none() {
                return Err(TransportError::Candidate("no remote description".into()));
            }
            ep.remote_candidates += 1;
            Ok(())
        })
    }

    fn send(&self, data: &[u8]) -> bool {
        let mut state = lock_state(&self.state);
        let open = state
            .endpoint_mut(&self.local, &self.remote, self.link_id)
            .map(|ep| ep.open)
            .unwrap_or(false);
        if !open {
            return false;
        }
        match state.endpoints.get(&(self.remote.clone(), self.local.clone())) {
            Some(peer) if peer.open => peer.events.emit(LinkEventKind::Message(data.to_vec())),
            _ => false,
        }
    }

    async fn round_trip_time(&self) -> Option<Duration> {
        let mut state = lock_state(&self.state);
        let rtt = state.rtt.unwrap_or(DEFAULT_RTT);
        state
            .endpoint_mut(&self.local, &self.remote, self.link_id)
            .filter(|ep| ep.open)
            .map(|_| rtt)
    }

    async fn close(&self) {
        let mut state = lock_state(&self.state);
        let key = (self.local.clone(), self.remote.clone());
        let was_open = match state.endpoints.get(&key) {
            Some(ep) if ep.link_id == self.link_id => ep.open,
            _ => return,
        };
        state.endpoints.remove(&key);
        if was_open {
            if let Some(peer) = state.endpoints.get_mut(&(self.remote.clone(), self.local.clone())) {
                if peer.open {
                    peer.open = false;
                    peer.events.emit(LinkEventKind::ChannelClosed);
                }
            }
        }
    }
}
