//! Remote stroke and cursor bookkeeping.
//!
//! Points arrive unordered and lossy. A stroke is keyed by the sending peer
//! plus its truncated stroke tag and grows in arrival order; it disappears
//! when its author disconnects or when no point has arrived for the idle
//! timeout.
//!
//! ```text
//! InboundPacket
//!       │
//!       ▼
//! StrokeBook::apply()
//!       ├── Point  ──► strokes[(peer, tag)].points.push()
//!       └── Cursor ──► cursors[peer] = latest
//!
//! every sweep interval: StrokeBook::sweep_idle(now)
//! on disconnect:        StrokeBook::remove_peer(peer)
//! ```

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::codec::{CursorPacket, Packet, PointPacket, StrokeTag};
use crate::signaling::PeerId;

// ───────────────────────────────────────────────────────────────────
// Core types
// ───────────────────────────────────────────────────────────────────

/// Identity of a remote stroke.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StrokeKey {
    pub peer_id: PeerId,
    pub stroke_id: StrokeTag,
}

impl StrokeKey {
    pub fn new(peer_id: PeerId, stroke_id: StrokeTag) -> Self {
        Self { peer_id, stroke_id }
    }
}

/// One point of a remote stroke, normalized to `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StrokePoint {
    pub x: f32,
    pub y: f32,
    pub pressure: f32,
}

impl From<&PointPacket> for StrokePoint {
    fn from(p: &PointPacket) -> Self {
        Self {
            x: p.x,
            y: p.y,
            pressure: p.pressure,
        }
    }
}

/// A stroke another participant is drawing right now.
#[derive(Debug, Clone)]
pub struct RemoteStroke {
    pub peer_id: PeerId,
    pub stroke_id: StrokeTag,
    pub points: Vec<StrokePoint>,
    pub last_update: Instant,
}

impl RemoteStroke {
    pub fn key(&self) -> StrokeKey {
        StrokeKey::new(self.peer_id.clone(), self.stroke_id)
    }

    pub fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_update) > timeout
    }
}

/// Latest known pointer of another participant.
#[derive(Debug, Clone)]
pub struct RemoteCursor {
    pub peer_id: PeerId,
    pub x: f32,
    pub y: f32,
    pub drawing: bool,
    pub last_update: Instant,
}

/// What an applied packet changed.
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    Stroke(StrokeKey),
    Cursor(PeerId),
}

// ───────────────────────────────────────────────────────────────────
// StrokeBook
// ───────────────────────────────────────────────────────────────────

pub struct StrokeBook {
    strokes: HashMap<StrokeKey, RemoteStroke>,
    cursors: HashMap<PeerId, RemoteCursor>,
    idle_timeout: Duration,
}

impl StrokeBook {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            strokes: HashMap::new(),
            cursors: HashMap::new(),
            idle_timeout,
        }
    }

    pub fn apply(&mut self, peer_id: &PeerId, packet: &Packet, now: Instant) -> Applied {
        match packet {
            Packet::Point(point) => Applied::Stroke(self.apply_point(peer_id, point, now)),
            Packet::Cursor(cursor) => {
                self.apply_cursor(peer_id, cursor, now);
                Applied::Cursor(peer_id.clone())
            }
        }
    }

    /// Append a point, creating the stroke on first sight.
    pub fn apply_point(&mut self, peer_id: &PeerId, point: &PointPacket, now: Instant) -> StrokeKey {
        let key = StrokeKey::new(peer_id.clone(), point.stroke_id);
        let stroke = self.strokes.entry(key.clone()).or_insert_with(|| RemoteStroke {
            peer_id: peer_id.clone(),
            stroke_id: point.stroke_id,
            points: Vec::new(),
            last_update: now,
        });
        stroke.points.push(StrokePoint::from(point));
        stroke.last_update = now;
        key
    }

    pub fn apply_cursor(&mut self, peer_id: &PeerId, cursor: &CursorPacket, now: Instant) {
        self.cursors.insert(
            peer_id.clone(),
            RemoteCursor {
                peer_id: peer_id.clone(),
                x: cursor.x,
                y: cursor.y,
                drawing: cursor.drawing,
                last_update: now,
            },
        );
    }

    /// Drop every stroke and the cursor of a departed peer.
    /// Returns the number of strokes removed.
    pub fn remove_peer(&mut self, peer_id: &PeerId) -> usize {
        let before = self.strokes.len();
        self.strokes.retain(|key, _| key.peer_id != *peer_id);
        self.cursors.remove(peer_id);
        before - self.strokes.len()
    }

    /// Remove strokes idle for at least the timeout. Returns their keys.
    pub fn sweep_idle(&mut self, now: Instant) -> Vec<StrokeKey> {
        let timeout = self.idle_timeout;
        let stale: Vec<StrokeKey> = self
            .strokes
            .values()
            .filter(|s| s.is_idle(now, timeout))
            .map(RemoteStroke::key)
            .collect();

        for key in &stale {
            self.strokes.remove(key);
        }
        stale
    }

    /// Drop one stroke early, e.g. once the committed stroke has arrived
    /// through the document store.
    pub fn clear_stroke(&mut self, peer_id: &PeerId, stroke_id: &str) -> bool {
        let key = StrokeKey::new(peer_id.clone(), StrokeTag::from_id(stroke_id));
        self.strokes.remove(&key).is_some()
    }

    pub fn stroke(&self, peer_id: &PeerId, stroke_id: &str) -> Option<&RemoteStroke> {
        self.strokes
            .get(&StrokeKey::new(peer_id.clone(), StrokeTag::from_id(stroke_id)))
    }

    pub fn strokes(&self) -> impl Iterator<Item = &RemoteStroke> {
        self.strokes.values()
    }

    pub fn cursors(&self) -> impl Iterator<Item = &RemoteCursor> {
        self.cursors.values()
    }

    pub fn cursor(&self, peer_id: &PeerId) -> Option<&RemoteCursor> {
        self.cursors.get(peer_id)
    }

    pub fn stroke_count(&self) -> usize {
        self.strokes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strokes.is_empty() && self.cursors.is_empty()
    }

    pub fn clear(&mut self) {
        self.strokes.clear();
        self.cursors.clear();
    }
}
