//! Runs a handful of preview participants in one process.
//!
//! The first participant draws a spiral; everyone else logs what arrives.
//!
//! Environment:
//! - `INKMESH_PEERS`: number of participants (default 3)
//! - `INKMESH_CONFIG`: path to a JSON `PreviewConfig`
//! - `RUST_LOG`: log filter, e.g. `info` or `inkmesh_preview=debug`

use std::sync::Arc;
use std::time::Duration;

use inkmesh_preview::{
    LoopbackNetwork, MailboxRelay, PeerConnectionManager, PeerId, PreviewConfig, PreviewError,
    PreviewSession, SessionId, SessionUpdate, SignalingRelay,
};
use log::{info, warn};

const CANVAS: (f32, f32) = (1280.0, 720.0);
const STROKE_POINTS: usize = 90;

fn load_config() -> Result<PreviewConfig, PreviewError> {
    match std::env::var("INKMESH_CONFIG") {
        Ok(path) => {
            let json = std::fs::read_to_string(&path)
                .map_err(|e| PreviewError::Config(format!("{path}: {e}")))?;
            PreviewConfig::from_json_str(&json)
        }
        Err(_) => Ok(PreviewConfig::default()),
    }
}

fn peer_count() -> usize {
    std::env::var("INKMESH_PEERS")
        .ok()
        .and_then(|v| v.parse().ok())
        .filter(|n| *n >= 2)
        .unwrap_or(3)
}

fn spiral_point(i: usize) -> (f32, f32, f32) {
    let t = i as f32 / STROKE_POINTS as f32;
    let angle = t * std::f32::consts::TAU * 3.0;
    let radius = 40.0 + t * 260.0;
    let x = CANVAS.0 / 2.0 + radius * angle.cos();
    let y = CANVAS.1 / 2.0 + radius * angle.sin();
    (x, y, 0.3 + 0.7 * t)
}

/// Pump every session for `duration`, logging interesting updates.
async fn run_for(sessions: &mut [PreviewSession], duration: Duration) {
    let frame = Duration::from_millis(16);
    let frames = (duration.as_millis() / frame.as_millis()).max(1);
    for _ in 0..frames {
        for session in sessions.iter_mut() {
            let me = session.manager().local_peer().clone();
            for update in session.pump() {
                log_update(&me, &update);
            }
        }
        tokio::time::sleep(frame).await;
    }
}

fn log_update(me: &PeerId, update: &SessionUpdate) {
    match update {
        SessionUpdate::ModeChanged(mode) => info!("[{me}] mode {mode}"),
        SessionUpdate::PeerConnected(peer) => info!("[{me}] connected to {peer}"),
        SessionUpdate::PeerDisconnected {
            peer_id,
            strokes_removed,
        } => info!("[{me}] {peer_id} left, {strokes_removed} strokes dropped"),
        SessionUpdate::StrokesExpired(keys) => info!("[{me}] {} idle strokes expired", keys.len()),
        SessionUpdate::StrokeUpdated(_) | SessionUpdate::CursorMoved(_) => {}
    }
}

#[tokio::main]
async fn main() -> Result<(), PreviewError> {
    env_logger::init();

    let config = load_config()?;
    let peers = peer_count();
    info!("Starting inkmesh demo with {peers} participants");

    let relay = Arc::new(MailboxRelay::with_defaults());
    let sweeper = relay.spawn_sweeper();
    let network = LoopbackNetwork::new();
    let session_id = SessionId::from("demo-board");

    let mut sessions = Vec::with_capacity(peers);
    for i in 0..peers {
        let name = format!("peer-{i}");
        let manager = PeerConnectionManager::new(
            session_id.clone(),
            PeerId::from(name.as_str()),
            "demo-room",
            Arc::clone(&relay) as Arc<dyn SignalingRelay>,
            Arc::new(network.transport(name.as_str())),
            config.clone(),
        );
        let mut session = PreviewSession::new(manager)?;
        session.set_canvas_size(CANVAS.0, CANVAS.1);
        let mode = session.init().await?;
        info!("{name} joined ({mode})");
        sessions.push(session);
    }

    // Signaling runs at the poll interval; give every pair time to connect.
    let settle = config.poll_interval() * 4;
    run_for(&mut sessions, settle).await;
    let ready = sessions.iter().filter(|s| s.is_connected()).count();
    if ready < peers {
        warn!("only {ready}/{peers} participants connected after {settle:?}");
    }

    let stroke_id = "spiral-0001";
    let mut sent = 0;
    for i in 0..STROKE_POINTS {
        let (x, y, pressure) = spiral_point(i);
        if sessions[0].send_stroke_point(stroke_id, x, y, pressure) {
            sent += 1;
        }
        sessions[0].send_cursor_position(x, y, true);
        run_for(&mut sessions, Duration::from_millis(16)).await;
    }
    run_for(&mut sessions, Duration::from_millis(200)).await;

    let author = sessions[0].manager().local_peer().clone();
    for session in &sessions[1..] {
        let me = session.manager().local_peer();
        match session.remote_stroke(&author, stroke_id) {
            Some(stroke) => info!(
                "[{me}] sees {} of {sent} points from {author}",
                stroke.points.len()
            ),
            None => warn!("[{me}] received nothing from {author}"),
        }
        let m = session.metrics();
        info!(
            "[{me}] peers={} received={} bytes={} latency={:.2}ms",
            m.connected_peer_count, m.packets_received, m.bytes_transferred, m.latency_ms
        );
    }

    // Let the idle sweep reclaim the finished stroke.
    run_for(&mut sessions, config.stroke_idle_timeout() + config.sweep_interval()).await;

    for session in sessions.iter_mut() {
        session.destroy();
    }
    for session in sessions.iter_mut() {
        session.closed().await;
    }
    sweeper.abort();
    info!("Demo finished");
    Ok(())
}
