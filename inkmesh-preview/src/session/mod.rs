//! Session façade: what a canvas view consumes.
//!
//! Wraps a [`PeerConnectionManager`] and turns its event and packet streams
//! into a live map of remote strokes and cursors. Outbound pointer events are
//! normalized against the local canvas size and throttled before they reach
//! the manager.
//!
//! Two ways to consume it:
//! - a frame loop calls [`PreviewSession::pump`] once per frame;
//! - an async task awaits [`PreviewSession::next_update`] in a loop.
//!
//! Either way the idle-stroke sweep runs on the configured interval.

pub mod book;
pub mod outbound;

use std::collections::HashSet;
use std::time::Duration;

use log::{debug, trace};
use tokio::sync::mpsc;
use tokio::time::{self, Instant};

use crate::codec::{CursorPacket, PointPacket, StrokeTag};
use crate::error::PreviewError;
use crate::peer::{InboundPacket, ManagerEvent, ManagerMode, MetricsSnapshot, PeerConnectionManager};
use crate::signaling::PeerId;

pub use book::{Applied, RemoteCursor, RemoteStroke, StrokeBook, StrokeKey, StrokePoint};
pub use outbound::{normalize_pressure, CanvasSize, OutboundThrottle};

/// A change the view may want to redraw for.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    ModeChanged(ManagerMode),
    PeerConnected(PeerId),
    PeerDisconnected {
        peer_id: PeerId,
        strokes_removed: usize,
    },
    StrokeUpdated(StrokeKey),
    CursorMoved(PeerId),
    /// Strokes dropped by the idle sweep.
    StrokesExpired(Vec<StrokeKey>),
}

pub struct PreviewSession {
    manager: PeerConnectionManager,
    events: mpsc::UnboundedReceiver<ManagerEvent>,
    packets: mpsc::Receiver<InboundPacket>,
    book: StrokeBook,
    throttle: OutboundThrottle,
    canvas: CanvasSize,
    connected: HashSet<PeerId>,
    sweep_interval: Duration,
    next_sweep: Instant,
}

impl PreviewSession {
    /// Take ownership of a manager whose receivers have not been taken.
    pub fn new(mut manager: PeerConnectionManager) -> Result<Self, PreviewError> {
        let events = manager
            .take_event_rx()
            .ok_or_else(|| PreviewError::Config("manager event receiver already taken".into()))?;
        let packets = manager
            .take_packet_rx()
            .ok_or_else(|| PreviewError::Config("manager packet receiver already taken".into()))?;
        let config = manager.config();
        let sweep_interval = config.sweep_interval();
        let book = StrokeBook::new(config.stroke_idle_timeout());
        let throttle = OutboundThrottle::new(config.point_interval(), config.cursor_interval());

        Ok(Self {
            book,
            throttle,
            canvas: CanvasSize::default(),
            connected: HashSet::new(),
            sweep_interval,
            next_sweep: Instant::now() + sweep_interval,
            manager,
            events,
            packets,
        })
    }

    /// Join the session and start connecting.
    ///
    /// An unreachable relay is not an error here: the session reports
    /// [`ManagerMode::Fallback`] and stays inert. Misuse (double init, init
    /// after destroy) is.
    pub async fn init(&mut self) -> Result<ManagerMode, PreviewError> {
        match self.manager.init().await {
            Ok(mode) => Ok(ManagerMode::Direct(mode)),
            Err(PreviewError::Relay(e)) => {
                debug!("preview running in fallback: {}", e);
                Ok(ManagerMode::Fallback)
            }
            Err(e) => Err(e),
        }
    }

    /// Apply everything that is ready without waiting.
    pub fn pump(&mut self) -> Vec<SessionUpdate> {
        let now = Instant::now();
        let mut updates = Vec::new();

        while let Ok(event) = self.events.try_recv() {
            updates.extend(self.on_event(event));
        }
        while let Ok(inbound) = self.packets.try_recv() {
            updates.extend(self.on_packet(inbound, now));
        }
        if now >= self.next_sweep {
            updates.extend(self.sweep(now));
        }
        updates
    }

    /// Wait for the next change.
    ///
    /// Returns `None` once the session has been destroyed.
    pub async fn next_update(&mut self) -> Option<SessionUpdate> {
        loop {
            if self.manager.is_destroyed() {
                return None;
            }
            let sweep_at = self.next_sweep;
            tokio::select! {
                biased;
                event = self.events.recv() => match event {
                    Some(event) => {
                        if let Some(update) = self.on_event(event) {
                            return Some(update);
                        }
                    }
                    None => return None,
                },
                Some(inbound) = self.packets.recv() => {
                    if let Some(update) = self.on_packet(inbound, Instant::now()) {
                        return Some(update);
                    }
                }
                _ = time::sleep_until(sweep_at) => {
                    if let Some(update) = self.sweep(Instant::now()) {
                        return Some(update);
                    }
                }
            }
        }
    }

    fn on_event(&mut self, event: ManagerEvent) -> Option<SessionUpdate> {
        match event {
            ManagerEvent::ModeChanged(mode) => Some(SessionUpdate::ModeChanged(mode)),
            ManagerEvent::PeerConnected(peer_id) => {
                self.connected.insert(peer_id.clone());
                Some(SessionUpdate::PeerConnected(peer_id))
            }
            ManagerEvent::PeerDisconnected(peer_id) => {
                self.connected.remove(&peer_id);
                let strokes_removed = self.book.remove_peer(&peer_id);
                debug!("{} left, discarded {} strokes", peer_id, strokes_removed);
                Some(SessionUpdate::PeerDisconnected {
                    peer_id,
                    strokes_removed,
                })
            }
        }
    }

    fn on_packet(&mut self, inbound: InboundPacket, now: Instant) -> Option<SessionUpdate> {
        // Packets can trail a disconnect; they must not resurrect strokes.
        if !self.connected.contains(&inbound.peer_id) {
            trace!("dropping packet from disconnected {}", inbound.peer_id);
            return None;
        }
        Some(match self.book.apply(&inbound.peer_id, &inbound.packet, now) {
            Applied::Stroke(key) => SessionUpdate::StrokeUpdated(key),
            Applied::Cursor(peer_id) => SessionUpdate::CursorMoved(peer_id),
        })
    }

    fn sweep(&mut self, now: Instant) -> Option<SessionUpdate> {
        self.next_sweep = now + self.sweep_interval;
        let expired = self.book.sweep_idle(now);
        if expired.is_empty() {
            None
        } else {
            trace!("expired {} idle strokes", expired.len());
            Some(SessionUpdate::StrokesExpired(expired))
        }
    }

    pub fn set_canvas_size(&mut self, width: f32, height: f32) {
        self.canvas = CanvasSize::new(width, height);
    }

    pub fn canvas_size(&self) -> CanvasSize {
        self.canvas
    }

    /// Send one point of the local stroke being drawn, in canvas pixels.
    ///
    /// Returns `false` when nothing went out: no open peers, unusable canvas
    /// size or input, or the point was throttled.
    pub fn send_stroke_point(&mut self, stroke_id: &str, px: f32, py: f32, pressure: f32) -> bool {
        let Some((x, y)) = self.canvas.normalize(px, py) else {
            return false;
        };
        let Some(pressure) = normalize_pressure(pressure) else {
            return false;
        };
        if !self.manager.is_connected() {
            return false;
        }
        let tag = StrokeTag::from_id(stroke_id);
        if !self.throttle.allow_point(tag, Instant::now()) {
            return false;
        }
        self.manager.send_packet(&PointPacket::new(tag, x, y, pressure))
    }

    /// Send the local pointer position, in canvas pixels.
    pub fn send_cursor_position(&mut self, px: f32, py: f32, drawing: bool) -> bool {
        let Some((x, y)) = self.canvas.normalize(px, py) else {
            return false;
        };
        if !self.manager.is_connected() || !self.throttle.allow_cursor(Instant::now()) {
            return false;
        }
        self.manager.send_cursor_packet(&CursorPacket::new(x, y, drawing))
    }

    pub fn remote_strokes(&self) -> impl Iterator<Item = &RemoteStroke> {
        self.book.strokes()
    }

    pub fn remote_stroke(&self, peer_id: &PeerId, stroke_id: &str) -> Option<&RemoteStroke> {
        self.book.stroke(peer_id, stroke_id)
    }

    pub fn remote_cursors(&self) -> impl Iterator<Item = &RemoteCursor> {
        self.book.cursors()
    }

    /// Forget a preview stroke, typically once its committed version has
    /// arrived through the document store.
    pub fn clear_stroke(&mut self, peer_id: &PeerId, stroke_id: &str) -> bool {
        self.book.clear_stroke(peer_id, stroke_id)
    }

    /// Forget everything received from `peer_id` so far.
    pub fn clear_peer(&mut self, peer_id: &PeerId) -> usize {
        self.book.remove_peer(peer_id)
    }

    pub fn is_connected(&self) -> bool {
        self.manager.is_connected()
    }

    pub fn mode(&self) -> ManagerMode {
        self.manager.mode()
    }

    /// Live counters; latency is resampled once per metrics interval.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.manager.metrics()
    }

    pub fn connected_peers(&self) -> impl Iterator<Item = &PeerId> {
        self.connected.iter()
    }

    pub fn manager(&self) -> &PeerConnectionManager {
        &self.manager
    }

    /// Tear down all connections and drop remote state. Idempotent.
    pub fn destroy(&mut self) {
        self.manager.destroy();
        self.connected.clear();
        self.book.clear();
    }

    /// Wait for background teardown after [`destroy`](Self::destroy).
    pub async fn closed(&mut self) {
        self.manager.closed().await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::codec::Packet;
    use crate::config::PreviewConfig;
    use crate::signaling::{MailboxRelay, SessionId, SignalingRelay, TopologyMode};
    use crate::transport::LoopbackNetwork;

    fn session() -> PreviewSession {
        let relay: Arc<dyn SignalingRelay> = Arc::new(MailboxRelay::with_defaults());
        let net = LoopbackNetwork::new();
        let manager = PeerConnectionManager::new(
            SessionId::from("canvas"),
            PeerId::from("me"),
            "key",
            relay,
            Arc::new(net.transport("me")),
            PreviewConfig::default(),
        );
        PreviewSession::new(manager).unwrap()
    }

    fn point(peer: &str, stroke: &str, x: f32) -> InboundPacket {
        InboundPacket {
            peer_id: PeerId::from(peer),
            packet: Packet::Point(PointPacket::new(stroke, x, 0.5, 1.0)),
        }
    }

    #[tokio::test]
    async fn test_receivers_must_be_available() {
        let relay: Arc<dyn SignalingRelay> = Arc::new(MailboxRelay::with_defaults());
        let mut manager = PeerConnectionManager::new(
            SessionId::from("canvas"),
            PeerId::from("me"),
            "key",
            relay,
            Arc::new(LoopbackNetwork::new().transport("me")),
            PreviewConfig::default(),
        );
        let _events = manager.take_event_rx();
        assert!(matches!(PreviewSession::new(manager), Err(PreviewError::Config(_))));
    }

    #[tokio::test]
    async fn test_packets_from_unknown_peer_ignored() {
        let mut s = session();
        assert_eq!(s.on_packet(point("ghost", "s", 0.1), Instant::now()), None);
        assert_eq!(s.remote_strokes().count(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_discards_strokes_and_cursor() {
        let mut s = session();
        let alice = PeerId::from("alice");
        s.on_event(ManagerEvent::PeerConnected(alice.clone()));
        s.on_packet(point("alice", "a", 0.1), Instant::now());
        s.on_packet(point("alice", "b", 0.1), Instant::now());
        s.on_packet(
            InboundPacket {
                peer_id: alice.clone(),
                packet: Packet::Cursor(CursorPacket::new(0.2, 0.2, true)),
            },
            Instant::now(),
        );
        assert_eq!(s.remote_strokes().count(), 2);
        assert_eq!(s.remote_cursors().count(), 1);

        let update = s.on_event(ManagerEvent::PeerDisconnected(alice.clone()));
        assert_eq!(
            update,
            Some(SessionUpdate::PeerDisconnected {
                peer_id: alice.clone(),
                strokes_removed: 2,
            })
        );
        assert_eq!(s.remote_strokes().count(), 0);
        assert_eq!(s.remote_cursors().count(), 0);
        // Trailing packets do not bring the stroke back.
        assert_eq!(s.on_packet(point("alice", "a", 0.2), Instant::now()), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pump_sweeps_idle_strokes() {
        let mut s = session();
        s.on_event(ManagerEvent::PeerConnected(PeerId::from("alice")));
        s.on_packet(point("alice", "s", 0.1), Instant::now());

        time::advance(Duration::from_secs(3)).await;
        assert!(s.pump().is_empty());
        assert!(s.remote_stroke(&PeerId::from("alice"), "s").is_some());

        time::advance(Duration::from_secs(3)).await;
        let updates = s.pump();
        assert!(matches!(updates.as_slice(), [SessionUpdate::StrokesExpired(keys)] if keys.len() == 1));
        assert_eq!(s.remote_strokes().count(), 0);
    }

    #[tokio::test]
    async fn test_send_requires_canvas_and_peers() {
        let mut s = session();
        assert!(!s.send_stroke_point("s", 10.0, 10.0, 0.5));
        s.set_canvas_size(100.0, 100.0);
        // Still no open channel.
        assert!(!s.send_stroke_point("s", 10.0, 10.0, 0.5));
        assert!(!s.send_cursor_position(10.0, 10.0, false));
    }

    #[tokio::test]
    async fn test_clear_helpers() {
        let mut s = session();
        let alice = PeerId::from("alice");
        s.on_event(ManagerEvent::PeerConnected(alice.clone()));
        s.on_packet(point("alice", "a", 0.1), Instant::now());
        s.on_packet(point("alice", "b", 0.1), Instant::now());

        assert!(s.clear_stroke(&alice, "a"));
        assert_eq!(s.clear_peer(&alice), 1);
        assert_eq!(s.remote_strokes().count(), 0);
    }

    #[tokio::test]
    async fn test_destroy_twice() {
        let mut s = session();
        s.destroy();
        s.destroy();
        assert!(s.manager().is_destroyed());
        assert_eq!(s.init().await.unwrap_err(), PreviewError::Destroyed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_update_ends_after_destroy() {
        let mut s = session();
        s.init().await.unwrap();
        assert_eq!(
            s.next_update().await,
            Some(SessionUpdate::ModeChanged(ManagerMode::Direct(TopologyMode::Mesh)))
        );

        s.destroy();
        s.closed().await;
        let next = time::timeout(Duration::from_secs(30), s.next_update()).await;
        assert_eq!(next, Ok(None));
    }
}
