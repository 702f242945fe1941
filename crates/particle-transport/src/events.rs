use particle_core::{Contact, PeerId};

/// Peer connectivity lifecycle reported by the connection layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A connection to the peer is up; its addresses are usable right away.
    Connected(Contact),
    Disconnected(PeerId),
}

/// Everything the connection layer feeds into a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    /// Serialized particle received from `from`.
    Particle { from: PeerId, bytes: Vec<u8> },
    Connection(ConnectionEvent),
}
