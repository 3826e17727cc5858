//! In-memory signaling mailbox with presence tracking and TTL sweep.
//!
//! Mirrors the semantics the authoritative store provides: a presence table
//! with a freshness window, a per-recipient mailbox ordered by arrival, and
//! a background sweep that bounds storage regardless of delivery.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::types::{
    JoinResponse, PeerId, SessionId, SignalId, SignalMessage, SignalPayload, TopologyMode,
};
use super::SignalingRelay;
use crate::error::RelayError;

/// Mailbox tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Age after which a signal is purged, delivered or not.
    pub signal_ttl_secs: u64,
    /// A participant is in the roster if seen within this window.
    pub presence_window_secs: u64,
    /// Roster size at which `sfu` is suggested.
    pub sfu_threshold: usize,
    /// Period of the background sweep.
    pub sweep_interval_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            signal_ttl_secs: 60,
            presence_window_secs: 30,
            sfu_threshold: 4,
            sweep_interval_secs: 10,
        }
    }
}

impl RelayConfig {
    pub fn signal_ttl(&self) -> Duration {
        Duration::from_secs(self.signal_ttl_secs)
    }

    pub fn presence_window(&self) -> Duration {
        Duration::from_secs(self.presence_window_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// What one sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub expired_signals: usize,
    pub stale_peers: usize,
}

struct SessionRecord {
    room_key: String,
    last_seen: HashMap<PeerId, Instant>,
}

struct StoredSignal {
    seq: u64,
    created: Instant,
    message: SignalMessage,
}

#[derive(Default)]
struct MailboxState {
    sessions: HashMap<SessionId, SessionRecord>,
    signals: HashMap<SignalId, StoredSignal>,
}

/// In-process [`SignalingRelay`].
///
/// Cheap to share behind an `Arc`; all state sits under one lock that is
/// never held across an await on anything but itself.
pub struct MailboxRelay {
    config: RelayConfig,
    state: RwLock<MailboxState>,
    next_seq: AtomicU64,
    /// When false every call fails with `Unavailable` (outage simulation).
    available: AtomicBool,
}

impl MailboxRelay {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            state: RwLock::new(MailboxState::default()),
            next_seq: AtomicU64::new(0),
            available: AtomicBool::new(true),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Toggle availability. While unavailable, every call returns
    /// [`RelayError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Relaxed);
    }

    fn check_available(&self) -> Result<(), RelayError> {
        if self.available.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(RelayError::Unavailable("mailbox offline".into()))
        }
    }

    /// Delete expired signals and stale presence rows.
    pub async fn sweep(&self) -> SweepStats {
        let now = Instant::now();
        let ttl = self.config.signal_ttl();
        let window = self.config.presence_window();
        let mut state = self.state.write().await;

        let before = state.signals.len();
        state
            .signals
            .retain(|_, s| now.saturating_duration_since(s.created) <= ttl);
        let expired_signals = before - state.signals.len();

        let mut stale_peers = 0;
        for record in state.sessions.values_mut() {
            let before = record.last_seen.len();
            record
                .last_seen
                .retain(|_, seen| now.saturating_duration_since(*seen) <= window);
            stale_peers += before - record.last_seen.len();
        }
        state.sessions.retain(|_, r| !r.last_seen.is_empty());

        if expired_signals > 0 || stale_peers > 0 {
            log::debug!("Mailbox sweep: {expired_signals} expired signals, {stale_peers} stale peers");
        }
        SweepStats {
            expired_signals,
            stale_peers,
        }
    }

    /// Run [`sweep`](Self::sweep) on the configured interval until aborted.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let relay = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(relay.config.sweep_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                relay.sweep().await;
            }
        })
    }

    /// Number of stored signals, delivered or not.
    pub async fn pending_signals(&self) -> usize {
        self.state.read().await.signals.len()
    }

    /// Live participants of a session, sorted.
    pub async fn participants(&self, session_id: &SessionId) -> Vec<PeerId> {
        let now = Instant::now();
        let window = self.config.presence_window();
        let state = self.state.read().await;
        let mut peers: Vec<PeerId> = state
            .sessions
            .get(session_id)
            .map(|r| {
                r.last_seen
                    .iter()
                    .filter(|(_, seen)| now.saturating_duration_since(**seen) <= window)
                    .map(|(id, _)| id.clone())
                    .collect()
            })
            .unwrap_or_default();
        peers.sort();
        peers
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[async_trait]
impl SignalingRelay for MailboxRelay {
    async fn join_session(
        &self,
        session_id: &SessionId,
        peer_id: &PeerId,
        room_key: &str,
    ) -> Result<JoinResponse, RelayError> {
        self.check_available()?;
        let now = Instant::now();
        let window = self.config.presence_window();
        let mut state = self.state.write().await;

        let record = state
            .sessions
            .entry(session_id.clone())
            .or_insert_with(|| SessionRecord {
                room_key: room_key.to_string(),
                last_seen: HashMap::new(),
            });

        if record.room_key != room_key {
            return Err(RelayError::RoomKeyMismatch(session_id.to_string()));
        }

        record.last_seen.insert(peer_id.clone(), now);

        let mut roster: Vec<PeerId> = record
            .last_seen
            .iter()
            .filter(|(id, seen)| *id != peer_id && now.saturating_duration_since(**seen) <= window)
            .map(|(id, _)| id.clone())
            .collect();
        roster.sort();

        let suggested_mode = TopologyMode::for_roster(roster.len(), self.config.sfu_threshold);
        log::info!(
            "{peer_id} joined session {session_id}: {} other peers, suggesting {suggested_mode}",
            roster.len()
        );

        Ok(JoinResponse {
            roster,
            suggested_mode,
        })
    }

    async fn send(
        &self,
        session_id: &SessionId,
        from: &PeerId,
        to: &PeerId,
        payload: SignalPayload,
    ) -> Result<(), RelayError> {
        self.check_available()?;
        let message = SignalMessage {
            id: SignalId::new(),
            session_id: session_id.clone(),
            from_peer_id: from.clone(),
            to_peer_id: to.clone(),
            kind: payload.kind(),
            payload,
            timestamp: unix_millis(),
        };
        log::debug!("Relay {} {from} -> {to}", message.kind);

        let stored = StoredSignal {
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            created: Instant::now(),
            message,
        };
        self.state.write().await.signals.insert(stored.message.id, stored);
        Ok(())
    }

    async fn poll(
        &self,
        session_id: &SessionId,
        peer_id: &PeerId,
    ) -> Result<Vec<SignalMessage>, RelayError> {
        self.check_available()?;
        let now = Instant::now();
        let ttl = self.config.signal_ttl();
        let mut state = self.state.write().await;

        // A poll doubles as a presence heartbeat.
        if let Some(record) = state.sessions.get_mut(session_id) {
            if let Some(seen) = record.last_seen.get_mut(peer_id) {
                *seen = now;
            }
        }

        let mut inbox: Vec<&StoredSignal> = state
            .signals
            .values()
            .filter(|s| {
                s.message.session_id == *session_id
                    && s.message.to_peer_id == *peer_id
                    && now.saturating_duration_since(s.created) <= ttl
            })
            .collect();
        inbox.sort_by_key(|s| s.seq);

        Ok(inbox.into_iter().map(|s| s.message.clone()).collect())
    }

    async fn delete_signals(&self, ids: &[SignalId]) -> Result<(), RelayError> {
        self.check_available()?;
        let mut state = self.state.write().await;
        for id in ids {
            state.signals.remove(id);
        }
        Ok(())
    }

    async fn leave(&self, session_id: &SessionId, peer_id: &PeerId) -> Result<(), RelayError> {
        self.check_available()?;
        let mut state = self.state.write().await;

        state.signals.retain(|_, s| {
            s.message.session_id != *session_id
                || (s.message.from_peer_id != *peer_id && s.message.to_peer_id != *peer_id)
        });

        if let Some(record) = state.sessions.get_mut(session_id) {
            record.last_seen.remove(peer_id);
            if record.last_seen.is_empty() {
                state.sessions.remove(session_id);
            }
        }
        log::info!("{peer_id} left session {session_id}");
        Ok(())
    }
}
