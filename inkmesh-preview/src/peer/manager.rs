//! Peer connection manager.
//!
//! The handle is cheap to call from UI code; all connection state lives in
//! a single driver task that owns the peer map. Nothing outside the driver
//! touches a [`PeerEntry`], so transport callbacks, poll results and
//! outbound sends are serialized through channels instead of locks.
//!
//! ```text
//!  PeerConnectionManager (handle)
//!    │ send_packet / send_cursor_packet / destroy
//!    ▼
//!  commands ──► Driver task ◄── link events (per-link callbacks)
//!                 │   ▲
//!                 │   ├── poll results (one poll in flight at a time)
//!                 │   └── step results (transport work, one per peer)
//!                 ├──► outbound signals ──► signal sender task ──► relay
//!                 ├──► ManagerEvent (mode, connect, disconnect)
//!                 └──► InboundPacket (decoded point / cursor)
//! ```

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use log::{debug, info, trace, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::codec::{CursorPacket, Packet, PointPacket};
use crate::config::PreviewConfig;
use crate::error::{PreviewError, RelayError, TransportError};
use crate::peer::metrics::{Metrics, MetricsSnapshot};
use crate::peer::state::{PeerEntry, PeerState, Role};
use crate::peer::strategy::{ConnectStrategy, FullMesh};
use crate::signaling::{
    IceCandidate, PeerId, SdpKind, SessionDescription, SessionId, SignalId, SignalMessage,
    SignalPayload, SignalingRelay, TopologyMode,
};
use crate::transport::{
    ChannelOptions, LinkEvent, LinkEventKind, LinkEventSender, LinkId, PeerLink, Transport,
};

/// Connection mode reported to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerMode {
    /// `init` has not completed.
    Pending,
    /// Joined; direct channels are in use with the relay's suggested topology.
    Direct(TopologyMode),
    /// The relay could not be joined. No preview traffic flows.
    Fallback,
}

impl ManagerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ManagerMode::Pending => "pending",
            ManagerMode::Direct(mode) => mode.as_str(),
            ManagerMode::Fallback => "fallback",
        }
    }

    pub fn is_direct(&self) -> bool {
        matches!(self, ManagerMode::Direct(_))
    }

    fn to_u8(self) -> u8 {
        match self {
            ManagerMode::Pending => 0,
            ManagerMode::Direct(TopologyMode::Mesh) => 1,
            ManagerMode::Direct(TopologyMode::Sfu) => 2,
            ManagerMode::Fallback => 3,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => ManagerMode::Direct(TopologyMode::Mesh),
            2 => ManagerMode::Direct(TopologyMode::Sfu),
            3 => ManagerMode::Fallback,
            _ => ManagerMode::Pending,
        }
    }
}

impl fmt::Display for ManagerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notifications for the session layer.
#[derive(Debug, Clone, PartialEq)]
pub enum ManagerEvent {
    ModeChanged(ManagerMode),
    PeerConnected(PeerId),
    PeerDisconnected(PeerId),
}

/// A decoded packet and the peer whose channel carried it.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundPacket {
    pub peer_id: PeerId,
    pub packet: Packet,
}

enum Command {
    Broadcast { bytes: Vec<u8>, counted: bool },
    Shutdown,
}

enum Outbound {
    Signal { to: PeerId, payload: SignalPayload },
    Leave,
}

struct Shared {
    metrics: Metrics,
    mode: AtomicU8,
    destroyed: AtomicBool,
}

impl Shared {
    fn mode(&self) -> ManagerMode {
        ManagerMode::from_u8(self.mode.load(Ordering::Acquire))
    }

    fn swap_mode(&self, mode: ManagerMode) -> ManagerMode {
        ManagerMode::from_u8(self.mode.swap(mode.to_u8(), Ordering::AcqRel))
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }
}

/// Owns the direct connections of one participant in one session.
pub struct PeerConnectionManager {
    session_id: SessionId,
    local_peer: PeerId,
    room_key: String,
    config: PreviewConfig,
    relay: Arc<dyn SignalingRelay>,
    transport: Arc<dyn Transport>,
    strategy: Arc<dyn ConnectStrategy>,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    command_rx: Option<mpsc::UnboundedReceiver<Command>>,
    event_tx: mpsc::UnboundedSender<ManagerEvent>,
    event_rx: Option<mpsc::UnboundedReceiver<ManagerEvent>>,
    packet_tx: mpsc::Sender<InboundPacket>,
    packet_rx: Option<mpsc::Receiver<InboundPacket>>,
    tasks: Vec<JoinHandle<()>>,
}

impl PeerConnectionManager {
    pub fn new(
        session_id: SessionId,
        local_peer: PeerId,
        room_key: impl Into<String>,
        relay: Arc<dyn SignalingRelay>,
        transport: Arc<dyn Transport>,
        config: PreviewConfig,
    ) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (packet_tx, packet_rx) = mpsc::channel(config.packet_buffer());
        Self {
            session_id,
            local_peer,
            room_key: room_key.into(),
            config,
            relay,
            transport,
            strategy: Arc::new(FullMesh),
            shared: Arc::new(Shared {
                metrics: Metrics::new(),
                mode: AtomicU8::new(ManagerMode::Pending.to_u8()),
                destroyed: AtomicBool::new(false),
            }),
            commands,
            command_rx: Some(command_rx),
            event_tx,
            event_rx: Some(event_rx),
            packet_tx,
            packet_rx: Some(packet_rx),
            tasks: Vec::new(),
        }
    }

    /// Replace the dialing strategy. Only effective before `init`.
    pub fn with_strategy(mut self, strategy: Arc<dyn ConnectStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<ManagerEvent>> {
        self.event_rx.take()
    }

    /// Take the inbound packet receiver (can only be called once).
    pub fn take_packet_rx(&mut self) -> Option<mpsc::Receiver<InboundPacket>> {
        self.packet_rx.take()
    }

    /// Join the session, dial the roster and start polling for signals.
    ///
    /// A relay failure switches the mode to [`ManagerMode::Fallback`] and is
    /// returned; the manager stays inert afterwards.
    pub async fn init(&mut self) -> Result<TopologyMode, PreviewError> {
        if self.shared.is_destroyed() {
            return Err(PreviewError::Destroyed);
        }
        let command_rx = self.command_rx.take().ok_or(PreviewError::AlreadyInitialized)?;

        let join = match self
            .relay
            .join_session(&self.session_id, &self.local_peer, &self.room_key)
            .await
        {
            Ok(join) => join,
            Err(e) => {
                warn!(
                    "{} could not join session {}: {}; preview disabled",
                    self.local_peer, self.session_id, e
                );
                self.set_mode(ManagerMode::Fallback);
                return Err(e.into());
            }
        };

        let mode = join.suggested_mode;
        info!(
            "{} joined session {} with {} peers ({})",
            self.local_peer,
            self.session_id,
            join.roster.len(),
            mode
        );
        self.set_mode(ManagerMode::Direct(mode));

        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        self.tasks.push(tokio::spawn(run_signal_sender(
            Arc::clone(&self.relay),
            self.session_id.clone(),
            self.local_peer.clone(),
            signal_rx,
        )));

        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (poll_tx, poll_rx) = mpsc::unbounded_channel();
        let (step_tx, step_rx) = mpsc::unbounded_channel();
        let mut driver = Driver {
            session_id: self.session_id.clone(),
            local_peer: self.local_peer.clone(),
            channel: ChannelOptions::unreliable(self.config.channel_label.clone()),
            config: self.config.clone(),
            relay: Arc::clone(&self.relay),
            transport: Arc::clone(&self.transport),
            shared: Arc::clone(&self.shared),
            peers: HashMap::new(),
            in_flight: HashMap::new(),
            next_link_id: 0,
            link_tx,
            poll_tx,
            poll_in_flight: false,
            step_tx,
            signal_tx,
            event_tx: self.event_tx.clone(),
            packet_tx: self.packet_tx.clone(),
        };

        for peer_id in self.strategy.peers_to_dial(mode, &join.roster) {
            if peer_id != self.local_peer {
                driver.dial(peer_id);
            }
        }
        self.tasks
            .push(tokio::spawn(driver.run(command_rx, link_rx, poll_rx, step_rx)));
        Ok(mode)
    }

    /// Broadcast a stroke point to every open channel.
    ///
    /// Returns `false` when nothing was queued (no open peers, destroyed, or
    /// not yet initialized).
    pub fn send_packet(&self, packet: &PointPacket) -> bool {
        self.broadcast(Packet::Point(*packet), true)
    }

    /// Broadcast a cursor update. Not counted in metrics.
    pub fn send_cursor_packet(&self, packet: &CursorPacket) -> bool {
        self.broadcast(Packet::Cursor(*packet), false)
    }

    fn broadcast(&self, packet: Packet, counted: bool) -> bool {
        if self.shared.is_destroyed()
            || self.command_rx.is_some()
            || self.shared.metrics.connected_peers() == 0
        {
            return false;
        }
        let bytes = match packet.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("dropping unencodable packet: {}", e);
                return false;
            }
        };
        self.commands
            .send(Command::Broadcast { bytes, counted })
            .is_ok()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    pub fn mode(&self) -> ManagerMode {
        self.shared.mode()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.metrics.connected_peers() > 0
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.is_destroyed()
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn local_peer(&self) -> &PeerId {
        &self.local_peer
    }

    pub fn config(&self) -> &PreviewConfig {
        &self.config
    }

    /// Stop polling, close every connection and leave the session.
    ///
    /// Returns immediately; the driver finishes teardown in the background.
    /// Calling it again, or before `init`, is a no-op.
    pub fn destroy(&self) {
        if self.shared.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.commands.send(Command::Shutdown);
        self.shared.metrics.reset_connected();
        debug!("preview manager for {} destroyed", self.local_peer);
    }

    /// Wait for background tasks to finish after [`destroy`](Self::destroy).
    pub async fn closed(&mut self) {
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }

    fn set_mode(&self, mode: ManagerMode) {
        if self.shared.swap_mode(mode) != mode {
            let _ = self.event_tx.send(ManagerEvent::ModeChanged(mode));
        }
    }
}

impl Drop for PeerConnectionManager {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Delivers outbound signals in the order the driver produced them, so an
/// offer always reaches the relay before its candidates.
async fn run_signal_sender(
    relay: Arc<dyn SignalingRelay>,
    session_id: SessionId,
    local_peer: PeerId,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(item) = rx.recv().await {
        match item {
            Outbound::Signal { to, payload } => {
                let kind = payload.kind();
                if let Err(e) = relay.send(&session_id, &local_peer, &to, payload).await {
                    warn!("failed to relay {} to {}: {}", kind, to, e);
                }
            }
            Outbound::Leave => {
                if let Err(e) = relay.leave(&session_id, &local_peer).await {
                    warn!("{} failed to leave session {}: {}", local_peer, session_id, e);
                }
                break;
            }
        }
    }
}

/// Result of transport work that ran off the driver loop.
enum StepOutcome {
    /// A link was created and the local offer or answer is in place.
    Connected {
        role: Role,
        result: Result<(Arc<dyn PeerLink>, SessionDescription), TransportError>,
    },
    AnswerApplied(Result<(), TransportError>),
    CandidateApplied(Result<(), TransportError>),
}

impl StepOutcome {
    /// A link nobody is waiting for any more.
    fn into_orphan(self) -> Option<Arc<dyn PeerLink>> {
        match self {
            StepOutcome::Connected {
                result: Ok((link, _)),
                ..
            } => Some(link),
            _ => None,
        }
    }
}

struct StepDone {
    peer_id: PeerId,
    link_id: LinkId,
    outcome: StepOutcome,
}

/// Work held back while a step for the same peer is running.
enum Deferred {
    Signal(SignalMessage),
    Link(LinkEvent),
}

/// The one step currently running for a peer.
struct InFlight {
    link_id: LinkId,
    /// No peer entry exists until a connect step completes.
    connecting: bool,
    started_at: Instant,
    backlog: VecDeque<Deferred>,
}

/// Create a link and put the local description in place. An offer is
/// produced when `offer` is `None`, otherwise it is answered.
async fn negotiate(
    transport: Arc<dyn Transport>,
    peer_id: PeerId,
    events: LinkEventSender,
    channel: ChannelOptions,
    offer: Option<SessionDescription>,
) -> Result<(Arc<dyn PeerLink>, SessionDescription), TransportError> {
    let link = transport.connect(&peer_id, events).await?;
    let described = match offer {
        None => make_offer(link.as_ref(), &channel).await,
        Some(offer) => make_answer(link.as_ref(), offer).await,
    };
    match described {
        Ok(description) => Ok((link, description)),
        Err(e) => {
            link.close().await;
            Err(e)
        }
    }
}

async fn make_offer(
    link: &dyn PeerLink,
    channel: &ChannelOptions,
) -> Result<SessionDescription, TransportError> {
    link.create_data_channel(channel).await?;
    let offer = link.create_offer().await?;
    link.set_local_description(offer.clone()).await?;
    Ok(offer)
}

async fn make_answer(
    link: &dyn PeerLink,
    offer: SessionDescription,
) -> Result<SessionDescription, TransportError> {
    link.set_remote_description(offer).await?;
    let answer = link.create_answer().await?;
    link.set_local_description(answer.clone()).await?;
    Ok(answer)
}

struct Driver {
    session_id: SessionId,
    local_peer: PeerId,
    channel: ChannelOptions,
    config: PreviewConfig,
    relay: Arc<dyn SignalingRelay>,
    transport: Arc<dyn Transport>,
    shared: Arc<Shared>,
    peers: HashMap<PeerId, PeerEntry>,
    in_flight: HashMap<PeerId, InFlight>,
    next_link_id: LinkId,
    link_tx: mpsc::UnboundedSender<LinkEvent>,
    poll_tx: mpsc::UnboundedSender<Result<Vec<SignalMessage>, RelayError>>,
    poll_in_flight: bool,
    step_tx: mpsc::UnboundedSender<StepDone>,
    signal_tx: mpsc::UnboundedSender<Outbound>,
    event_tx: mpsc::UnboundedSender<ManagerEvent>,
    packet_tx: mpsc::Sender<InboundPacket>,
}

impl Driver {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut link_rx: mpsc::UnboundedReceiver<LinkEvent>,
        mut poll_rx: mpsc::UnboundedReceiver<Result<Vec<SignalMessage>, RelayError>>,
        mut step_rx: mpsc::UnboundedReceiver<StepDone>,
    ) {
        let mut poll_timer = time::interval(self.config.poll_interval());
        poll_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut metrics_timer = time::interval(self.config.metrics_interval());
        metrics_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                cmd = commands.recv() => match cmd {
                    Some(Command::Broadcast { bytes, counted }) => self.broadcast(&bytes, counted),
                    Some(Command::Shutdown) | None => break,
                },
                Some(event) = link_rx.recv() => self.handle_link_event(event),
                Some(done) = step_rx.recv() => self.finish_step(done),
                Some(outcome) = poll_rx.recv() => {
                    self.poll_in_flight = false;
                    self.handle_poll(outcome);
                }
                _ = poll_timer.tick() => {
                    self.expire_negotiations();
                    self.start_poll();
                }
                _ = metrics_timer.tick() => self.sample_latency(),
            }
            if self.shared.is_destroyed() {
                break;
            }
        }

        // Steps finishing from here on close their own links.
        step_rx.close();
        let mut orphans = Vec::new();
        while let Ok(done) = step_rx.try_recv() {
            orphans.extend(done.outcome.into_orphan());
        }
        self.shutdown(orphans).await;
    }

    async fn shutdown(mut self, orphans: Vec<Arc<dyn PeerLink>>) {
        let mut links: Vec<Arc<dyn PeerLink>> =
            self.peers.drain().map(|(_, entry)| entry.link).collect();
        links.extend(orphans);
        self.in_flight.clear();
        self.shared.metrics.reset_connected();
        let _ = self.signal_tx.send(Outbound::Leave);
        debug!("{} closing {} links", self.local_peer, links.len());
        join_all(links.iter().map(|link| link.close())).await;
    }

    fn start_poll(&mut self) {
        if self.poll_in_flight {
            trace!("signal poll still running, skipping tick");
            return;
        }
        if self.shared.is_destroyed() {
            return;
        }
        self.poll_in_flight = true;
        let relay = Arc::clone(&self.relay);
        let session_id = self.session_id.clone();
        let peer_id = self.local_peer.clone();
        let tx = self.poll_tx.clone();
        tokio::spawn(async move {
            let outcome = relay.poll(&session_id, &peer_id).await;
            let _ = tx.send(outcome);
        });
    }

    fn handle_poll(&mut self, outcome: Result<Vec<SignalMessage>, RelayError>) {
        let messages = match outcome {
            Ok(messages) => messages,
            Err(e) => {
                warn!("signal poll for {} failed: {}", self.local_peer, e);
                return;
            }
        };
        if messages.is_empty() {
            return;
        }

        let ids: Vec<SignalId> = messages.iter().map(|m| m.id).collect();
        for message in messages {
            self.handle_signal(message);
        }

        let relay = Arc::clone(&self.relay);
        tokio::spawn(async move {
            if let Err(e) = relay.delete_signals(&ids).await {
                warn!("failed to delete {} processed signals: {}", ids.len(), e);
            }
        });
    }

    fn handle_signal(&mut self, message: SignalMessage) {
        if message.session_id != self.session_id
            || message.to_peer_id != self.local_peer
            || message.from_peer_id == self.local_peer
        {
            trace!("ignoring misaddressed signal {}", message.id);
            return;
        }
        if let Some(flight) = self.in_flight.get_mut(&message.from_peer_id) {
            flight.backlog.push_back(Deferred::Signal(message));
            return;
        }
        if message.kind != message.payload.kind() {
            debug!(
                "signal {} labelled {} carries {}",
                message.id,
                message.kind,
                message.payload.kind()
            );
        }

        let from = message.from_peer_id;
        match message.payload {
            SignalPayload::Description(desc) => match desc.kind {
                SdpKind::Offer => self.accept_offer(from, desc),
                SdpKind::Answer => self.apply_answer(from, desc),
            },
            SignalPayload::Candidate(candidate) => self.apply_candidate(from, candidate),
        }
    }

    /// Run transport work for `peer_id` in the background. Signals for that
    /// peer wait until it reports back through [`finish_step`](Self::finish_step).
    fn spawn_step<F>(&mut self, peer_id: PeerId, link_id: LinkId, connecting: bool, work: F)
    where
        F: Future<Output = StepOutcome> + Send + 'static,
    {
        self.in_flight.insert(
            peer_id.clone(),
            InFlight {
                link_id,
                connecting,
                started_at: Instant::now(),
                backlog: VecDeque::new(),
            },
        );
        let tx = self.step_tx.clone();
        tokio::spawn(async move {
            let outcome = work.await;
            let done = StepDone {
                peer_id,
                link_id,
                outcome,
            };
            if let Err(mpsc::error::SendError(done)) = tx.send(done) {
                if let Some(link) = done.outcome.into_orphan() {
                    link.close().await;
                }
            }
        });
    }

    fn finish_step(&mut self, done: StepDone) {
        let StepDone {
            peer_id,
            link_id,
            outcome,
        } = done;
        let current = self
            .in_flight
            .get(&peer_id)
            .is_some_and(|flight| flight.link_id == link_id);
        let Some(flight) = current.then(|| self.in_flight.remove(&peer_id)).flatten() else {
            trace!("discarding late step for link {} to {}", link_id, peer_id);
            if let Some(link) = outcome.into_orphan() {
                tokio::spawn(async move { link.close().await });
            }
            return;
        };

        match outcome {
            StepOutcome::Connected { role, result } => {
                self.on_connected(&peer_id, link_id, role, flight.started_at, result)
            }
            StepOutcome::AnswerApplied(Ok(())) => {
                if let Some(entry) = self.peers.get_mut(&peer_id) {
                    if entry.link_id == link_id {
                        entry.remote_description_set = true;
                    }
                }
            }
            StepOutcome::AnswerApplied(Err(e)) => {
                self.drop_peer(&peer_id, link_id, &format!("answer rejected: {e}"))
            }
            StepOutcome::CandidateApplied(Ok(())) => {}
            StepOutcome::CandidateApplied(Err(e)) => {
                self.drop_peer(&peer_id, link_id, &format!("candidate rejected: {e}"))
            }
        }
        self.resume(&peer_id, flight.backlog);
    }

    /// Replay held-back work in arrival order, stopping behind the next step.
    fn resume(&mut self, peer_id: &PeerId, mut backlog: VecDeque<Deferred>) {
        while let Some(item) = backlog.pop_front() {
            match item {
                Deferred::Signal(message) => self.handle_signal(message),
                Deferred::Link(event) => self.handle_link_event(event),
            }
            if let Some(flight) = self.in_flight.get_mut(peer_id) {
                flight.backlog.extend(backlog);
                return;
            }
        }
    }

    fn on_connected(
        &mut self,
        peer_id: &PeerId,
        link_id: LinkId,
        role: Role,
        started_at: Instant,
        result: Result<(Arc<dyn PeerLink>, SessionDescription), TransportError>,
    ) {
        let (link, description) = match result {
            Ok(connected) => connected,
            Err(e) => {
                warn!("abandoning connection to {}: {}", peer_id, e);
                return;
            }
        };
        let mut entry = PeerEntry::new(peer_id.clone(), link_id, link, role);
        entry.state = PeerState::Negotiating;
        entry.started_at = started_at;
        entry.remote_description_set = role == Role::Answerer;
        self.peers.insert(peer_id.clone(), entry);

        match role {
            Role::Offerer => debug!("{} offering to {}", self.local_peer, peer_id),
            Role::Answerer => debug!("{} answering {}", self.local_peer, peer_id),
        }
        self.queue_signal(peer_id, SignalPayload::Description(description));
    }

    fn start_link(&mut self, peer_id: PeerId, role: Role, offer: Option<SessionDescription>) {
        self.next_link_id += 1;
        let link_id = self.next_link_id;
        let events = LinkEventSender::new(peer_id.clone(), link_id, self.link_tx.clone());
        let work = negotiate(
            Arc::clone(&self.transport),
            peer_id.clone(),
            events,
            self.channel.clone(),
            offer,
        );
        self.spawn_step(peer_id, link_id, true, async move {
            StepOutcome::Connected {
                role,
                result: work.await,
            }
        });
    }

    /// Active connect: create the channel, offer, relay the offer.
    fn dial(&mut self, peer_id: PeerId) {
        if self.peers.contains_key(&peer_id) || self.in_flight.contains_key(&peer_id) {
            trace!("already connecting to {}", peer_id);
            return;
        }
        self.start_link(peer_id, Role::Offerer, None);
    }

    /// Passive connect.
    fn accept_offer(&mut self, from: PeerId, offer: SessionDescription) {
        if let Some(entry) = self.peers.get(&from) {
            match (entry.state, entry.role) {
                (PeerState::Open, _) => {
                    debug!("ignoring offer from {}: channel already open", from);
                    return;
                }
                (_, Role::Answerer) => {
                    trace!("ignoring repeated offer from {}", from);
                    return;
                }
                (_, Role::Offerer) => {
                    // Both sides offered. The smaller id keeps its offer.
                    if self.local_peer < from {
                        debug!("offer collision with {}: keeping ours", from);
                        return;
                    }
                    debug!("offer collision with {}: answering theirs", from);
                    let link_id = entry.link_id;
                    self.drop_peer(&from, link_id, "offer collision");
                }
            }
        }
        self.start_link(from, Role::Answerer, Some(offer));
    }

    fn apply_answer(&mut self, from: PeerId, answer: SessionDescription) {
        let Some(entry) = self.peers.get_mut(&from) else {
            debug!("ignoring answer from unknown peer {}", from);
            return;
        };
        if entry.role != Role::Offerer || entry.remote_description_set {
            trace!("ignoring unexpected answer from {}", from);
            return;
        }
        let link = Arc::clone(&entry.link);
        let link_id = entry.link_id;
        let pending = entry.take_pending_candidates();
        let peer_id = from.clone();

        self.spawn_step(from, link_id, false, async move {
            if let Err(e) = link.set_remote_description(answer).await {
                return StepOutcome::AnswerApplied(Err(e));
            }
            // Buffered candidates may belong to a link the peer already gave
            // up in an offer collision; a rejection here is not fatal.
            for candidate in pending {
                if let Err(e) = link.add_ice_candidate(candidate).await {
                    debug!("skipping buffered candidate from {}: {}", peer_id, e);
                }
            }
            StepOutcome::AnswerApplied(Ok(()))
        });
    }

    fn apply_candidate(&mut self, from: PeerId, candidate: IceCandidate) {
        let Some(entry) = self.peers.get_mut(&from) else {
            trace!("dropping candidate from unknown peer {}", from);
            return;
        };
        if !entry.note_candidate(&candidate) {
            trace!("dropping repeated candidate from {}", from);
            return;
        }
        if !entry.remote_description_set {
            entry.buffer_candidate(candidate);
            return;
        }
        let link = Arc::clone(&entry.link);
        let link_id = entry.link_id;
        self.spawn_step(from, link_id, false, async move {
            StepOutcome::CandidateApplied(link.add_ice_candidate(candidate).await)
        });
    }

    fn handle_link_event(&mut self, event: LinkEvent) {
        if self.peers.get(&event.peer_id).map(|e| e.link_id) != Some(event.link_id) {
            match self.in_flight.get_mut(&event.peer_id) {
                Some(flight) if flight.link_id == event.link_id => {
                    flight.backlog.push_back(Deferred::Link(event));
                }
                _ => trace!(
                    "dropping event from stale link {} to {}",
                    event.link_id,
                    event.peer_id
                ),
            }
            return;
        }
        let LinkEvent {
            peer_id,
            link_id,
            kind,
        } = event;

        match kind {
            LinkEventKind::LocalCandidate(candidate) => {
                self.queue_signal(&peer_id, SignalPayload::Candidate(candidate))
            }
            LinkEventKind::ChannelAdopted => debug!("adopted data channel from {}", peer_id),
            LinkEventKind::ChannelOpen => self.mark_open(&peer_id),
            LinkEventKind::Message(bytes) => self.deliver(peer_id, &bytes),
            LinkEventKind::ChannelClosed => self.drop_peer(&peer_id, link_id, "channel closed"),
            LinkEventKind::ChannelError(e) => {
                self.drop_peer(&peer_id, link_id, &format!("channel error: {e}"))
            }
        }
    }

    fn mark_open(&mut self, peer_id: &PeerId) {
        let Some(entry) = self.peers.get_mut(peer_id) else {
            return;
        };
        if entry.is_open() {
            return;
        }
        entry.state = PeerState::Open;
        self.shared.metrics.peer_opened();
        info!("{} connected to {}", self.local_peer, peer_id);
        let _ = self.event_tx.send(ManagerEvent::PeerConnected(peer_id.clone()));
    }

    fn deliver(&self, peer_id: PeerId, bytes: &[u8]) {
        let Some(packet) = Packet::decode(bytes) else {
            trace!("discarding {} byte message from {}", bytes.len(), peer_id);
            return;
        };
        if matches!(packet, Packet::Point(_)) {
            self.shared.metrics.record_received(bytes.len());
        }
        if let Err(mpsc::error::TrySendError::Full(dropped)) =
            self.packet_tx.try_send(InboundPacket { peer_id, packet })
        {
            trace!("inbound buffer full, dropping packet from {}", dropped.peer_id);
        }
    }

    fn broadcast(&self, bytes: &[u8], counted: bool) {
        for entry in self.peers.values().filter(|e| e.is_open()) {
            if entry.link.send(bytes) {
                if counted {
                    self.shared.metrics.record_sent(bytes.len());
                }
            } else {
                trace!("channel to {} not writable, packet dropped", entry.peer_id);
            }
        }
    }

    /// Remove a peer whose link failed or closed. Ignores stale link ids.
    fn drop_peer(&mut self, peer_id: &PeerId, link_id: LinkId, reason: &str) {
        if self.peers.get(peer_id).map(|e| e.link_id) != Some(link_id) {
            return;
        }
        let Some(mut entry) = self.peers.remove(peer_id) else {
            return;
        };
        if self
            .in_flight
            .get(peer_id)
            .is_some_and(|flight| flight.link_id == link_id)
        {
            self.in_flight.remove(peer_id);
        }
        let was_open = entry.is_open();
        entry.state = PeerState::Closed;

        if was_open {
            self.shared.metrics.peer_closed();
            info!("{} lost {}: {}", self.local_peer, peer_id, reason);
            let _ = self
                .event_tx
                .send(ManagerEvent::PeerDisconnected(peer_id.clone()));
        } else {
            warn!("abandoning connection to {}: {}", peer_id, reason);
        }

        let link = entry.link;
        tokio::spawn(async move { link.close().await });
    }

    fn expire_negotiations(&mut self) {
        let Some(timeout) = self.config.negotiation_timeout() else {
            return;
        };
        let now = Instant::now();
        let expired: Vec<(PeerId, LinkId)> = self
            .peers
            .values()
            .filter(|e| e.is_negotiating() && now.duration_since(e.started_at) >= timeout)
            .map(|e| (e.peer_id.clone(), e.link_id))
            .collect();
        for (peer_id, link_id) in expired {
            self.drop_peer(&peer_id, link_id, "negotiation timed out");
        }

        // Connects that never produced a link. A late result is closed on arrival.
        self.in_flight.retain(|peer_id, flight| {
            let stuck = flight.connecting && now.duration_since(flight.started_at) >= timeout;
            if stuck {
                warn!("abandoning connection to {}: negotiation timed out", peer_id);
            }
            !stuck
        });
    }

    fn sample_latency(&self) {
        let links: Vec<Arc<dyn PeerLink>> = self
            .peers
            .values()
            .filter(|e| e.is_open())
            .map(|e| Arc::clone(&e.link))
            .collect();
        if links.is_empty() {
            return;
        }
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let samples: Vec<Duration> = join_all(links.iter().map(|link| link.round_trip_time()))
                .await
                .into_iter()
                .flatten()
                .collect();
            shared.metrics.record_latency(&samples);
        });
    }

    fn queue_signal(&self, to: &PeerId, payload: SignalPayload) {
        trace!("{} queueing {} for {}", self.local_peer, payload.kind(), to);
        let _ = self.signal_tx.send(Outbound::Signal {
            to: to.clone(),
            payload,
        });
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::signaling::{JoinResponse, MailboxRelay};
    use crate::transport::{LoopbackNetwork, LoopbackTransport};

    const WAIT: Duration = Duration::from_secs(30);

    fn manager(relay: &Arc<MailboxRelay>, net: &LoopbackNetwork, peer: &str) -> PeerConnectionManager {
        manager_with(
            Arc::clone(relay) as Arc<dyn SignalingRelay>,
            Arc::new(net.transport(peer)),
            peer,
        )
    }

    fn manager_with(
        relay: Arc<dyn SignalingRelay>,
        transport: Arc<dyn Transport>,
        peer: &str,
    ) -> PeerConnectionManager {
        PeerConnectionManager::new(
            SessionId::from("canvas-1"),
            PeerId::from(peer),
            "key",
            relay,
            transport,
            PreviewConfig::default(),
        )
    }

    /// Never acknowledges, so every poll hands back the whole mailbox again.
    struct RedeliveringRelay(Arc<MailboxRelay>);

    #[async_trait]
    impl SignalingRelay for RedeliveringRelay {
        async fn join_session(
            &self,
            session_id: &SessionId,
            peer_id: &PeerId,
            room_key: &str,
        ) -> Result<JoinResponse, RelayError> {
            self.0.join_session(session_id, peer_id, room_key).await
        }

        async fn send(
            &self,
            session_id: &SessionId,
            from: &PeerId,
            to: &PeerId,
            payload: SignalPayload,
        ) -> Result<(), RelayError> {
            self.0.send(session_id, from, to, payload).await
        }

        async fn poll(
            &self,
            session_id: &SessionId,
            peer_id: &PeerId,
        ) -> Result<Vec<SignalMessage>, RelayError> {
            self.0.poll(session_id, peer_id).await
        }

        async fn delete_signals(&self, _ids: &[SignalId]) -> Result<(), RelayError> {
            Ok(())
        }

        async fn leave(&self, session_id: &SessionId, peer_id: &PeerId) -> Result<(), RelayError> {
            self.0.leave(session_id, peer_id).await
        }
    }

    /// Loopback transport whose connects to one peer take a while.
    struct SlowConnect {
        inner: LoopbackTransport,
        slow_peer: PeerId,
        delay: Duration,
    }

    #[async_trait]
    impl Transport for SlowConnect {
        async fn connect(
            &self,
            remote: &PeerId,
            events: LinkEventSender,
        ) -> Result<Arc<dyn PeerLink>, TransportError> {
            if *remote == self.slow_peer {
                time::sleep(self.delay).await;
            }
            self.inner.connect(remote, events).await
        }
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<ManagerEvent>) -> ManagerEvent {
        time::timeout(WAIT, rx.recv()).await.unwrap().unwrap()
    }

    async fn wait_connected(rx: &mut mpsc::UnboundedReceiver<ManagerEvent>, peer: &str) {
        loop {
            if next_event(rx).await == ManagerEvent::PeerConnected(PeerId::from(peer)) {
                return;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_peers_reports_mesh_once() {
        let relay = Arc::new(MailboxRelay::with_defaults());
        let net = LoopbackNetwork::new();
        let mut alice = manager(&relay, &net, "alice");
        let mut events = alice.take_event_rx().unwrap();

        assert_eq!(alice.mode(), ManagerMode::Pending);
        assert_eq!(alice.init().await.unwrap(), TopologyMode::Mesh);
        assert_eq!(alice.mode(), ManagerMode::Direct(TopologyMode::Mesh));
        assert_eq!(
            events.try_recv().unwrap(),
            ManagerEvent::ModeChanged(ManagerMode::Direct(TopologyMode::Mesh))
        );
        assert!(events.try_recv().is_err());
        assert!(!alice.is_connected());
        assert_eq!(net.links_created(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_peers_connect_and_exchange() {
        let relay = Arc::new(MailboxRelay::with_defaults());
        let net = LoopbackNetwork::new();
        let mut alice = manager(&relay, &net, "alice");
        let mut bob = manager(&relay, &net, "bob");
        let mut alice_events = alice.take_event_rx().unwrap();
        let mut bob_events = bob.take_event_rx().unwrap();
        let mut bob_packets = bob.take_packet_rx().unwrap();

        alice.init().await.unwrap();
        bob.init().await.unwrap();
        wait_connected(&mut alice_events, "bob").await;
        wait_connected(&mut bob_events, "alice").await;
        assert!(alice.is_connected());

        let point = PointPacket::new("s1", 0.25, 0.5, 0.75);
        assert!(alice.send_packet(&point));
        let inbound = time::timeout(WAIT, bob_packets.recv()).await.unwrap().unwrap();
        assert_eq!(inbound.peer_id, PeerId::from("alice"));
        assert_eq!(inbound.packet, Packet::Point(point));

        assert!(alice.send_cursor_packet(&CursorPacket::new(0.1, 0.2, true)));
        let inbound = time::timeout(WAIT, bob_packets.recv()).await.unwrap().unwrap();
        assert!(matches!(inbound.packet, Packet::Cursor(_)));

        let sent = alice.metrics();
        assert_eq!(sent.packets_sent, 1);
        assert_eq!(sent.bytes_transferred, 22);
        assert_eq!(sent.connected_peer_count, 1);
        let received = bob.metrics();
        assert_eq!(received.packets_received, 1);
        assert_eq!(received.bytes_transferred, 22);
    }

    #[tokio::test(start_paused = true)]
    async fn test_offer_collision_settles_on_one_link() {
        let relay = Arc::new(MailboxRelay::with_defaults());
        let net = LoopbackNetwork::new();
        // Bob is registered before alice joins, so both dial each other.
        relay
            .join_session(&SessionId::from("canvas-1"), &PeerId::from("bob"), "key")
            .await
            .unwrap();
        let mut alice = manager(&relay, &net, "alice");
        let mut bob = manager(&relay, &net, "bob");
        let mut alice_events = alice.take_event_rx().unwrap();
        let mut bob_events = bob.take_event_rx().unwrap();

        alice.init().await.unwrap();
        bob.init().await.unwrap();
        wait_connected(&mut alice_events, "bob").await;
        wait_connected(&mut bob_events, "alice").await;

        time::sleep(Duration::from_secs(5)).await;
        assert!(alice_events.try_recv().is_err());
        assert!(bob_events.try_recv().is_err());
        assert_eq!(alice.metrics().connected_peer_count, 1);
        assert_eq!(bob.metrics().connected_peer_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sever_reports_disconnect() {
        let relay = Arc::new(MailboxRelay::with_defaults());
        let net = LoopbackNetwork::new();
        let mut alice = manager(&relay, &net, "alice");
        let mut bob = manager(&relay, &net, "bob");
        let mut alice_events = alice.take_event_rx().unwrap();
        alice.init().await.unwrap();
        bob.init().await.unwrap();
        wait_connected(&mut alice_events, "bob").await;

        net.sever(&PeerId::from("alice"), &PeerId::from("bob"));
        assert_eq!(
            next_event(&mut alice_events).await,
            ManagerEvent::PeerDisconnected(PeerId::from("bob"))
        );
        assert!(!alice.is_connected());
        assert!(!alice.send_packet(&PointPacket::new("s1", 0.0, 0.0, 0.0)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_peer_times_out() {
        let relay = Arc::new(MailboxRelay::with_defaults());
        let net = LoopbackNetwork::new();
        net.block(&PeerId::from("alice"), &PeerId::from("bob"));
        let mut alice = manager(&relay, &net, "alice");
        let mut bob = manager(&relay, &net, "bob");
        alice.init().await.unwrap();
        bob.init().await.unwrap();

        time::sleep(Duration::from_secs(20)).await;
        assert!(!alice.is_connected());
        assert!(!bob.is_connected());
        // Bob's offer and alice's answer were both abandoned.
        assert_eq!(net.links_created(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_outage_falls_back() {
        let relay = Arc::new(MailboxRelay::with_defaults());
        relay.set_available(false);
        let net = LoopbackNetwork::new();
        let mut alice = manager(&relay, &net, "alice");
        let mut events = alice.take_event_rx().unwrap();

        let err = alice.init().await.unwrap_err();
        assert!(matches!(err, PreviewError::Relay(RelayError::Unavailable(_))));
        assert_eq!(alice.mode(), ManagerMode::Fallback);
        assert_eq!(
            events.try_recv().unwrap(),
            ManagerEvent::ModeChanged(ManagerMode::Fallback)
        );
        assert!(!alice.send_packet(&PointPacket::new("s1", 0.0, 0.0, 0.0)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_init_twice_rejected() {
        let relay = Arc::new(MailboxRelay::with_defaults());
        let net = LoopbackNetwork::new();
        let mut alice = manager(&relay, &net, "alice");
        alice.init().await.unwrap();
        assert_eq!(alice.init().await.unwrap_err(), PreviewError::AlreadyInitialized);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_is_idempotent_and_leaves() {
        let relay = Arc::new(MailboxRelay::with_defaults());
        let net = LoopbackNetwork::new();
        let mut early = manager(&relay, &net, "early");
        early.destroy();
        early.destroy();
        assert_eq!(early.init().await.unwrap_err(), PreviewError::Destroyed);

        let mut alice = manager(&relay, &net, "alice");
        alice.init().await.unwrap();
        assert_eq!(
            relay.participants(&SessionId::from("canvas-1")).await,
            vec![PeerId::from("alice")]
        );
        alice.destroy();
        alice.destroy();
        alice.closed().await;
        assert!(relay.participants(&SessionId::from("canvas-1")).await.is_empty());
        assert!(alice.is_destroyed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_redelivered_signals_keep_one_link() {
        let mailbox = Arc::new(MailboxRelay::with_defaults());
        let relay: Arc<dyn SignalingRelay> = Arc::new(RedeliveringRelay(Arc::clone(&mailbox)));
        let net = LoopbackNetwork::new();
        let mut alice = manager_with(Arc::clone(&relay), Arc::new(net.transport("alice")), "alice");
        let mut bob = manager_with(relay, Arc::new(net.transport("bob")), "bob");
        let mut alice_events = alice.take_event_rx().unwrap();
        let mut bob_events = bob.take_event_rx().unwrap();

        alice.init().await.unwrap();
        bob.init().await.unwrap();
        wait_connected(&mut alice_events, "bob").await;
        wait_connected(&mut bob_events, "alice").await;

        // Offers, answers and candidates come back on every poll.
        time::sleep(Duration::from_secs(40)).await;
        assert!(alice_events.try_recv().is_err());
        assert!(bob_events.try_recv().is_err());
        assert_eq!(net.links_created(), 2);
        assert_eq!(alice.metrics().connected_peer_count, 1);
        assert_eq!(bob.metrics().connected_peer_count, 1);
        assert!(net.is_open(&PeerId::from("alice"), &PeerId::from("bob")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_is_mean_link_rtt() {
        let relay = Arc::new(MailboxRelay::with_defaults());
        let net = LoopbackNetwork::new();
        net.set_rtt(Duration::from_millis(40));
        let mut alice = manager(&relay, &net, "alice");
        let mut bob = manager(&relay, &net, "bob");
        let mut alice_events = alice.take_event_rx().unwrap();
        alice.init().await.unwrap();
        bob.init().await.unwrap();
        wait_connected(&mut alice_events, "bob").await;

        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(alice.metrics().latency_ms, 40.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sends_flow_while_newcomer_negotiates() {
        let relay = Arc::new(MailboxRelay::with_defaults());
        let net = LoopbackNetwork::new();
        let slow = SlowConnect {
            inner: net.transport("alice"),
            slow_peer: PeerId::from("carol"),
            delay: Duration::from_secs(5),
        };
        let mut alice = manager_with(
            Arc::clone(&relay) as Arc<dyn SignalingRelay>,
            Arc::new(slow),
            "alice",
        );
        let mut bob = manager(&relay, &net, "bob");
        let mut alice_events = alice.take_event_rx().unwrap();
        let mut bob_packets = bob.take_packet_rx().unwrap();
        alice.init().await.unwrap();
        bob.init().await.unwrap();
        wait_connected(&mut alice_events, "bob").await;

        // Carol dials alice, whose connect back to carol stalls.
        let mut carol = manager(&relay, &net, "carol");
        carol.init().await.unwrap();
        time::sleep(Duration::from_millis(1500)).await;

        let point = PointPacket::new("s1", 0.5, 0.5, 0.5);
        assert!(alice.send_packet(&point));
        let inbound = time::timeout(Duration::from_millis(100), bob_packets.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(inbound.packet, Packet::Point(point));

        wait_connected(&mut alice_events, "carol").await;
        assert_eq!(alice.metrics().connected_peer_count, 2);
    }

    #[test]
    fn test_mode_strings() {
        assert_eq!(ManagerMode::Pending.to_string(), "pending");
        assert_eq!(ManagerMode::Direct(TopologyMode::Sfu).to_string(), "sfu");
        assert_eq!(ManagerMode::Fallback.as_str(), "fallback");
        for mode in [
            ManagerMode::Pending,
            ManagerMode::Direct(TopologyMode::Mesh),
            ManagerMode::Direct(TopologyMode::Sfu),
            ManagerMode::Fallback,
        ] {
            assert_eq!(ManagerMode::from_u8(mode.to_u8()), mode);
        }
    }
}
