//! Coda P2P stack - libp2p-backed networking primitives for the sidecar.

mod behaviour;
mod config;
mod filters;
mod helper;
mod identity;
mod swarm;

pub use config::HelperConfig;
pub use filters::{FilterAction, Filters};
pub use helper::{AddrInfo, ConnInfo, GossipMessage, Helper, IncomingStream};
pub use identity::{
    generate_keypair, marshal_private_key, marshal_public_key, unmarshal_private_key,
};
pub use swarm::HelperError;

pub use libp2p::gossipsub::MessageAcceptance;
pub use libp2p::identity::Keypair;
pub use libp2p::{Multiaddr, PeerId, Stream, StreamProtocol};
