//! Which roster members to dial when joining.

use log::warn;

use crate::signaling::{PeerId, TopologyMode};

/// Chooses the peers to offer to after a successful join.
///
/// Peers not dialed here still connect when their offers arrive.
pub trait ConnectStrategy: Send + Sync {
    fn peers_to_dial(&self, mode: TopologyMode, roster: &[PeerId]) -> Vec<PeerId>;
}

/// Dial everyone. Used for both mesh and sfu suggestions since no
/// forwarding server exists; sfu only gets a warning.
#[derive(Debug, Clone, Copy, Default)]
pub struct FullMesh;

impl ConnectStrategy for FullMesh {
    fn peers_to_dial(&self, mode: TopologyMode, roster: &[PeerId]) -> Vec<PeerId> {
        if mode == TopologyMode::Sfu {
            warn!(
                "relay suggested sfu for {} peers; no forwarder available, dialing full mesh",
                roster.len()
            );
        }
        roster.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_mesh_dials_everyone() {
        let roster = vec![PeerId::from("a"), PeerId::from("b")];
        assert_eq!(FullMesh.peers_to_dial(TopologyMode::Mesh, &roster), roster);
        assert_eq!(FullMesh.peers_to_dial(TopologyMode::Sfu, &roster), roster);
        assert!(FullMesh.peers_to_dial(TopologyMode::Mesh, &[]).is_empty());
    }
}
