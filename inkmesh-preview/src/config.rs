//! Runtime configuration for a preview session.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PreviewError;

/// Timing and sizing knobs for the manager and the session façade.
///
/// Every field has a default, so a partial JSON document is enough:
///
/// ```
/// use inkmesh_preview::PreviewConfig;
///
/// let config = PreviewConfig::from_json_str(r#"{ "poll_interval_ms": 500 }"#).unwrap();
/// assert_eq!(config.poll_interval_ms, 500);
/// assert_eq!(config.stroke_idle_timeout_ms, 5000);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreviewConfig {
    /// Signaling mailbox poll period.
    pub poll_interval_ms: u64,
    /// Latency sampling period.
    pub metrics_interval_ms: u64,
    /// Idle-stroke sweep period.
    pub sweep_interval_ms: u64,
    /// A remote stroke with no new point for this long is discarded.
    pub stroke_idle_timeout_ms: u64,
    /// Abandon a connection that is still negotiating after this long.
    /// Zero disables the timeout.
    pub negotiation_timeout_ms: u64,
    /// Minimum spacing of outbound points within one stroke.
    pub point_interval_ms: u64,
    /// Minimum spacing of outbound cursor updates.
    pub cursor_interval_ms: u64,
    /// Inbound packets buffered between the manager and the session.
    pub packet_buffer: usize,
    pub channel_label: String,
    /// STUN/TURN urls handed to the WebRTC transport.
    pub ice_servers: Vec<String>,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            metrics_interval_ms: 1000,
            sweep_interval_ms: 1000,
            stroke_idle_timeout_ms: 5000,
            negotiation_timeout_ms: 15_000,
            point_interval_ms: 16,
            cursor_interval_ms: 33,
            packet_buffer: 1024,
            channel_label: "preview".to_string(),
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
        }
    }
}

impl PreviewConfig {
    pub fn from_json_str(json: &str) -> Result<Self, PreviewError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| PreviewError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the runtime cannot work with.
    pub fn validate(&self) -> Result<(), PreviewError> {
        for (name, value) in [
            ("poll_interval_ms", self.poll_interval_ms),
            ("metrics_interval_ms", self.metrics_interval_ms),
            ("sweep_interval_ms", self.sweep_interval_ms),
        ] {
            if value == 0 {
                return Err(PreviewError::Config(format!("{name} must be positive")));
            }
        }
        if self.packet_buffer == 0 {
            return Err(PreviewError::Config("packet_buffer must be positive".into()));
        }
        if self.channel_label.is_empty() {
            return Err(PreviewError::Config("channel_label must not be empty".into()));
        }
        Ok(())
    }

    // Periodic timers cannot tick at zero; getters floor at 1ms.

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_millis(self.metrics_interval_ms.max(1))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }

    pub fn stroke_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.stroke_idle_timeout_ms)
    }

    pub fn negotiation_timeout(&self) -> Option<Duration> {
        (self.negotiation_timeout_ms > 0).then(|| Duration::from_millis(self.negotiation_timeout_ms))
    }

    pub fn point_interval(&self) -> Duration {
        Duration::from_millis(self.point_interval_ms)
    }

    pub fn cursor_interval(&self) -> Duration {
        Duration::from_millis(self.cursor_interval_ms)
    }

    pub fn packet_buffer(&self) -> usize {
        self.packet_buffer.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PreviewConfig::default();
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.stroke_idle_timeout(), Duration::from_secs(5));
        assert_eq!(config.negotiation_timeout(), Some(Duration::from_secs(15)));
        assert_eq!(config.channel_label, "preview");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json() {
        let config =
            PreviewConfig::from_json_str(r#"{"negotiation_timeout_ms": 0, "ice_servers": []}"#)
                .unwrap();
        assert_eq!(config.negotiation_timeout(), None);
        assert!(config.ice_servers.is_empty());
        assert_eq!(config.cursor_interval_ms, 33);
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        let err = PreviewConfig::from_json_str(r#"{"poll_interval_ms": 0}"#).unwrap_err();
        assert!(matches!(err, PreviewError::Config(msg) if msg.contains("poll_interval_ms")));
    }

    #[test]
    fn test_malformed_json_rejected() {
        assert!(matches!(
            PreviewConfig::from_json_str("{"),
            Err(PreviewError::Config(_))
        ));
    }
}
