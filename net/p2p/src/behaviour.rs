//! Composite libp2p network behaviour for the helper.

use libp2p::identity::Keypair;
use libp2p::kad::store::MemoryStore;
use libp2p::swarm::NetworkBehaviour;
use libp2p::{gossipsub, identify, kad, mdns, PeerId, StreamProtocol};
use libp2p_stream as stream;

use crate::config::{HelperConfig, MDNS_QUERY_INTERVAL};
use crate::swarm::HelperError;

/// Upper bound on a single gossip frame. Generous: block-sized payloads pass,
/// runaway frames do not.
const MAX_GOSSIP_TRANSMIT_SIZE: usize = 10 * 1024 * 1024;

#[derive(NetworkBehaviour)]
pub(crate) struct Behaviour {
    /// Gossip pub/sub with manual validation; the sidecar's validator
    /// handshake decides propagation.
    pub(crate) gossipsub: gossipsub::Behaviour,

    /// Kademlia DHT for rendezvous advertisement and peer lookup.
    pub(crate) kad: kad::Behaviour<MemoryStore>,

    /// Local multicast discovery.
    pub(crate) mdns: mdns::tokio::Behaviour,

    /// Peer versioning and address exchange.
    pub(crate) identify: identify::Behaviour,

    /// Raw per-protocol byte streams.
    pub(crate) stream: stream::Behaviour,
}

impl Behaviour {
    pub(crate) fn new(config: &HelperConfig, keypair: &Keypair) -> Result<Self, HelperError> {
        let local_peer_id = PeerId::from(keypair.public());

        let gossipsub_config = gossipsub::ConfigBuilder::default()
            .validation_mode(gossipsub::ValidationMode::Strict)
            .validate_messages()
            .max_transmit_size(MAX_GOSSIP_TRANSMIT_SIZE)
            .build()
            .map_err(|err| HelperError::Gossipsub(format!("config: {err}")))?;
        let gossipsub = gossipsub::Behaviour::new(
            gossipsub::MessageAuthenticity::Signed(keypair.clone()),
            gossipsub_config,
        )
        .map_err(|err| HelperError::Gossipsub(format!("initialise gossipsub: {err}")))?;

        let kad_protocol = StreamProtocol::try_from_owned(config.kad_protocol())
            .map_err(|err| HelperError::Setup(format!("kad protocol name: {err}")))?;
        let mut kad = kad::Behaviour::with_config(
            local_peer_id,
            MemoryStore::new(local_peer_id),
            kad::Config::new(kad_protocol),
        );
        kad.set_mode(Some(kad::Mode::Server));

        let mdns = mdns::tokio::Behaviour::new(
            mdns::Config {
                query_interval: MDNS_QUERY_INTERVAL,
                ..Default::default()
            },
            local_peer_id,
        )
        .map_err(|err| HelperError::Setup(format!("mdns: {err}")))?;

        let identify = identify::Behaviour::new(identify::Config::new(
            config.identify_protocol(),
            keypair.public(),
        ));

        Ok(Self {
            gossipsub,
            kad,
            mdns,
            identify,
            stream: stream::Behaviour::new(),
        })
    }
}
