//! Helper construction parameters.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use libp2p::identity::Keypair;
use libp2p::Multiaddr;

use crate::filters::Filters;

/// How often mDNS re-queries the local network for peers.
pub const MDNS_QUERY_INTERVAL: Duration = Duration::from_secs(60);

/// Idle timeout for connections with no active streams. Protocol streams and
/// gossip meshes keep connections busy, so this only reaps truly dead links.
pub const IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(600);

/// Everything the helper factory needs. Immutable once handed over.
pub struct HelperConfig {
    pub state_dir: PathBuf,
    pub keypair: Keypair,
    pub network_id: String,
    pub listen_on: Vec<Multiaddr>,
    pub external_addr: Multiaddr,
    pub filters: Arc<Filters>,
}

impl HelperConfig {
    /// The fixed tag under which this network advertises itself on the DHT.
    pub fn rendezvous_string(&self) -> String {
        format!("/coda/0.0.1/{}", self.network_id)
    }

    /// Kademlia protocol name, namespaced per network so different networks
    /// never share routing tables.
    pub fn kad_protocol(&self) -> String {
        format!("/coda/kad/{}", self.network_id)
    }

    /// Identify protocol version string.
    pub fn identify_protocol(&self) -> String {
        format!("coda/{}", self.network_id)
    }
}
