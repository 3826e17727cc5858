//! Connection metrics shared between the driver task and the handle.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    /// Mean round-trip time across open channels at the last sample.
    pub latency_ms: f64,
    /// Successful point-packet channel writes. Cursor packets are excluded.
    pub packets_sent: u64,
    /// Point packets received. Cursor packets are excluded.
    pub packets_received: u64,
    /// Bytes of point packets sent plus received.
    pub bytes_transferred: u64,
    pub connected_peer_count: usize,
}

/// Lock-free counters; the hot path only does relaxed adds.
#[derive(Debug, Default)]
pub struct Metrics {
    latency_us: AtomicU64,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    bytes_transferred: AtomicU64,
    connected_peers: AtomicUsize,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&self, bytes: usize) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_transferred.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: usize) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_transferred.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn peer_opened(&self) {
        self.connected_peers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn peer_closed(&self) {
        let _ = self
            .connected_peers
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn reset_connected(&self) {
        self.connected_peers.store(0, Ordering::Relaxed);
    }

    pub fn connected_peers(&self) -> usize {
        self.connected_peers.load(Ordering::Relaxed)
    }

    /// Store the mean of `samples`. An empty sample set leaves the last value.
    pub fn record_latency(&self, samples: &[Duration]) {
        if samples.is_empty() {
            return;
        }
        let total: Duration = samples.iter().sum();
        let mean = total / samples.len() as u32;
        self.latency_us.store(mean.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            latency_ms: self.latency_us.load(Ordering::Relaxed) as f64 / 1000.0,
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            bytes_transferred: self.bytes_transferred.load(Ordering::Relaxed),
            connected_peer_count: self.connected_peers(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let m = Metrics::new();
        m.record_sent(22);
        m.record_sent(22);
        m.record_received(22);
        let snap = m.snapshot();
        assert_eq!(snap.packets_sent, 2);
        assert_eq!(snap.packets_received, 1);
        assert_eq!(snap.bytes_transferred, 66);
    }

    #[test]
    fn test_peer_count_never_underflows() {
        let m = Metrics::new();
        m.peer_opened();
        m.peer_closed();
        m.peer_closed();
        assert_eq!(m.connected_peers(), 0);
    }

    #[test]
    fn test_latency_mean() {
        let m = Metrics::new();
        m.record_latency(&[Duration::from_millis(10), Duration::from_millis(30)]);
        assert_eq!(m.snapshot().latency_ms, 20.0);

        m.record_latency(&[]);
        assert_eq!(m.snapshot().latency_ms, 20.0);
    }
}
