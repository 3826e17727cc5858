//! Signaling records exchanged through the relay.
//!
//! Everything here is plain serde data: the relay path carries JSON, never
//! binary. Binary traffic only flows over the direct channel.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable per-device participant identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Application session (canvas room) identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Relay-assigned signal identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignalId(Uuid);

impl SignalId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SignalId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SignalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Connection topology suggested by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopologyMode {
    /// Every participant connects directly to every other.
    Mesh,
    /// Selective forwarding. Reserved: advertised, never enforced.
    Sfu,
}

impl TopologyMode {
    /// Mode for a roster of `roster_len` other participants.
    pub fn for_roster(roster_len: usize, sfu_threshold: usize) -> Self {
        if roster_len >= sfu_threshold {
            TopologyMode::Sfu
        } else {
            TopologyMode::Mesh
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TopologyMode::Mesh => "mesh",
            TopologyMode::Sfu => "sfu",
        }
    }
}

impl fmt::Display for TopologyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of registering in a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinResponse {
    /// Other live participants, excluding the caller.
    pub roster: Vec<PeerId>,
    pub suggested_mode: TopologyMode,
}

/// Kind of a relayed signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::IceCandidate => "ice-candidate",
        })
    }
}

/// Session description type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// An offer or answer description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A trickled connectivity candidate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default)]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
            username_fragment: None,
        }
    }
}

/// Payload of a relayed signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignalPayload {
    Description(SessionDescription),
    Candidate(IceCandidate),
}

impl SignalPayload {
    /// The signal kind this payload is sent as.
    pub fn kind(&self) -> SignalKind {
        match self {
            SignalPayload::Description(d) => match d.kind {
                SdpKind::Offer => SignalKind::Offer,
                SdpKind::Answer => SignalKind::Answer,
            },
            SignalPayload::Candidate(_) => SignalKind::IceCandidate,
        }
    }
}

/// One mailbox entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalMessage {
    pub id: SignalId,
    pub session_id: SessionId,
    pub from_peer_id: PeerId,
    pub to_peer_id: PeerId,
    #[serde(rename = "type")]
    pub kind: SignalKind,
    pub payload: SignalPayload,
    /// Milliseconds since the Unix epoch at creation.
    pub timestamp: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topology_threshold() {
        assert_eq!(TopologyMode::for_roster(0, 4), TopologyMode::Mesh);
        assert_eq!(TopologyMode::for_roster(3, 4), TopologyMode::Mesh);
        assert_eq!(TopologyMode::for_roster(4, 4), TopologyMode::Sfu);
        assert_eq!(TopologyMode::for_roster(9, 4), TopologyMode::Sfu);
    }

    #[test]
    fn test_payload_kind() {
        let offer = SignalPayload::Description(SessionDescription::offer("v=0"));
        let answer = SignalPayload::Description(SessionDescription::answer("v=0"));
        let cand = SignalPayload::Candidate(IceCandidate::new("candidate:1"));
        assert_eq!(offer.kind(), SignalKind::Offer);
        assert_eq!(answer.kind(), SignalKind::Answer);
        assert_eq!(cand.kind(), SignalKind::IceCandidate);
    }

    #[test]
    fn test_description_json_shape() {
        let payload = SignalPayload::Description(SessionDescription::offer("v=0"));
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "offer");
        assert_eq!(json["sdp"], "v=0");
    }

    #[test]
    fn test_candidate_json_roundtrip() {
        let payload = SignalPayload::Candidate(IceCandidate {
            candidate: "candidate:0 1 UDP 1 10.0.0.1 5000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
            username_fragment: Some("abc".into()),
        });
        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains("sdpMLineIndex"));
        let back: SignalPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn test_signal_kind_json() {
        let json = serde_json::to_string(&SignalKind::IceCandidate).unwrap();
        assert_eq!(json, "\"ice-candidate\"");
        assert_eq!(SignalKind::IceCandidate.to_string(), "ice-candidate");
    }

    #[test]
    fn test_mode_strings() {
        assert_eq!(TopologyMode::Mesh.to_string(), "mesh");
        assert_eq!(serde_json::to_string(&TopologyMode::Sfu).unwrap(), "\"sfu\"");
    }
}
