// P2P networking

pub mod message;
pub mod node;
pub mod peer;

pub use message::{Message, PeerAddress, VersionMessage, PROTOCOL_VERSION};
pub use node::{Node, NodeEvent};
pub use peer::{Peer, PeerInfo, PeerState};
