//! Peer descriptors: the `{libp2p_port, host, peer_id}` triple the parent
//! uses to identify remote peers.

use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use serde::{Deserialize, Serialize};

use crate::error::{bad_rpc, RpcError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub libp2p_port: u16,
    pub host: String,
    pub peer_id: String,
}

impl PeerInfo {
    /// The stand-in descriptor used under *unsafe-no-trust-ip* when no
    /// connection exists to read a real address from.
    pub fn localhost_placeholder(peer_id: &PeerId) -> Self {
        Self {
            libp2p_port: 0,
            host: "127.0.0.1".into(),
            peer_id: peer_id.to_base58(),
        }
    }
}

/// Splits a remote multiaddress into a descriptor. The address must lead
/// with an IP component followed by a TCP port.
pub fn peer_info_from_multiaddr(addr: &Multiaddr, peer_id: &PeerId) -> Result<PeerInfo, RpcError> {
    let mut components = addr.iter();
    let host = match components.next() {
        Some(Protocol::Ip4(ip)) => ip.to_string(),
        Some(Protocol::Ip6(ip)) => ip.to_string(),
        _ => {
            return Err(bad_rpc(format!(
                "only IP connections are supported, cannot describe peer at {addr}"
            )))
        }
    };
    let libp2p_port = match components.next() {
        Some(Protocol::Tcp(port)) => port,
        _ => {
            return Err(bad_rpc(format!(
                "only TCP connections are supported, cannot describe peer at {addr}"
            )))
        }
    };
    Ok(PeerInfo {
        libp2p_port,
        host,
        peer_id: peer_id.to_base58(),
    })
}
