//! The helper façade: a cloneable handle over the swarm task.
//!
//! All networking goes through here. RPC-layer code never touches the swarm
//! directly; it sends commands and consumes the gossip / discovery channels
//! this module hands out.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use libp2p::gossipsub::{MessageAcceptance, MessageId, TopicHash};
use libp2p::{noise, tcp, yamux, Multiaddr, PeerId, Stream, StreamProtocol, SwarmBuilder};
use libp2p_stream as stream;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::behaviour::Behaviour;
use crate::config::{HelperConfig, IDLE_CONNECTION_TIMEOUT};
use crate::filters::Filters;
use crate::swarm::{Command, EventLoop, HelperError};

/// Capacity of the channels the swarm task writes into. The swarm never
/// blocks on them; see the event loop for the overflow handling.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A peer and the addresses it was discovered under.
#[derive(Debug, Clone)]
pub struct AddrInfo {
    pub peer_id: PeerId,
    pub addrs: Vec<Multiaddr>,
}

/// One live connection.
#[derive(Debug, Clone)]
pub struct ConnInfo {
    pub peer_id: PeerId,
    pub remote_addr: Multiaddr,
}

/// An inbound gossip message awaiting validation.
#[derive(Debug)]
pub struct GossipMessage {
    pub propagation_source: PeerId,
    pub message_id: MessageId,
    pub source: Option<PeerId>,
    pub topic: TopicHash,
    pub data: Vec<u8>,
}

/// A stream opened towards us by a remote peer.
pub struct IncomingStream {
    pub peer_id: PeerId,
    pub stream: Stream,
}

pub struct Helper {
    commands: mpsc::Sender<Command>,
    control: stream::Control,
    local_peer_id: PeerId,
    rendezvous: String,
    filters: Arc<Filters>,
    gossip_rx: Mutex<Option<mpsc::Receiver<GossipMessage>>>,
    mdns_rx: Mutex<Option<mpsc::Receiver<AddrInfo>>>,
    handlers: Mutex<HashMap<StreamProtocol, CancellationToken>>,
    pubsub_joined: AtomicBool,
}

impl Helper {
    /// Builds the libp2p stack described by `config` and spawns its event
    /// loop. The swarm listens on every configured interface before this
    /// returns.
    pub fn spawn(config: HelperConfig) -> Result<Arc<Self>, HelperError> {
        std::fs::create_dir_all(&config.state_dir)
            .map_err(|err| HelperError::Setup(format!("state directory: {err}")))?;

        let mut swarm = SwarmBuilder::with_existing_identity(config.keypair.clone())
            .with_tokio()
            .with_tcp(
                tcp::Config::default().nodelay(true),
                noise::Config::new,
                yamux::Config::default,
            )
            .map_err(|err| HelperError::Setup(format!("transport: {err}")))?
            .with_behaviour(|keypair| {
                Behaviour::new(&config, keypair)
                    .map_err(|err| Box::new(err) as Box<dyn std::error::Error + Send + Sync>)
            })
            .map_err(|err| HelperError::Setup(format!("behaviour: {err}")))?
            .with_swarm_config(|swarm_config| {
                swarm_config.with_idle_connection_timeout(IDLE_CONNECTION_TIMEOUT)
            })
            .build();

        let local_peer_id = *swarm.local_peer_id();
        let control = swarm.behaviour_mut().stream.new_control();

        for addr in &config.listen_on {
            swarm
                .listen_on(addr.clone())
                .map_err(|err| HelperError::Setup(format!("listen on {addr}: {err}")))?;
        }
        swarm.add_external_address(config.external_addr.clone());

        let rendezvous = config.rendezvous_string();
        let filters = config.filters.clone();
        let (command_tx, command_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (gossip_tx, gossip_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (mdns_tx, mdns_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let event_loop = EventLoop::new(
            swarm,
            command_rx,
            gossip_tx,
            mdns_tx,
            filters.clone(),
            &rendezvous,
        );
        tokio::spawn(event_loop.run());
        info!(%local_peer_id, network = %config.network_id, "helper up");

        Ok(Arc::new(Self {
            commands: command_tx,
            control,
            local_peer_id,
            rendezvous,
            filters,
            gossip_rx: Mutex::new(Some(gossip_rx)),
            mdns_rx: Mutex::new(Some(mdns_rx)),
            handlers: Mutex::new(HashMap::new()),
            pubsub_joined: AtomicBool::new(false),
        }))
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    pub fn rendezvous(&self) -> &str {
        &self.rendezvous
    }

    pub fn filters(&self) -> &Arc<Filters> {
        &self.filters
    }

    /// Whether `begin_advertising` has joined this node to the DHT and thus
    /// to pub/sub.
    pub fn pubsub_joined(&self) -> bool {
        self.pubsub_joined.load(Ordering::Acquire)
    }

    /// Takes the inbound gossip channel. Yields `None` after the first call.
    pub fn gossip_messages(&self) -> Option<mpsc::Receiver<GossipMessage>> {
        self.gossip_rx.lock().take()
    }

    pub async fn listen(&self, addr: Multiaddr) -> Result<(), HelperError> {
        self.request(|reply| Command::Listen { addr, reply }).await?
    }

    pub async fn listening_addrs(&self) -> Result<Vec<Multiaddr>, HelperError> {
        self.request(|reply| Command::ListeningAddrs { reply }).await
    }

    pub async fn connections(&self) -> Result<Vec<ConnInfo>, HelperError> {
        self.request(|reply| Command::Connections { reply }).await
    }

    pub async fn connections_to_peer(&self, peer: PeerId) -> Result<Vec<ConnInfo>, HelperError> {
        self.request(|reply| Command::ConnectionsToPeer { peer, reply })
            .await
    }

    /// Dials `peer`, hinting `addrs`. Resolves once a connection exists (or
    /// the dial definitively fails); callers impose their own deadlines.
    pub async fn dial_peer(&self, peer: PeerId, addrs: Vec<Multiaddr>) -> Result<(), HelperError> {
        self.request(|reply| Command::Dial { peer, addrs, reply })
            .await?
    }

    /// Records addresses for `peer` in the routing table.
    pub async fn add_addresses(&self, peer: PeerId, addrs: Vec<Multiaddr>) {
        let _ = self.commands.send(Command::AddAddresses { peer, addrs }).await;
    }

    pub async fn publish(&self, topic: String, data: Vec<u8>) -> Result<(), HelperError> {
        self.request(|reply| Command::Publish { topic, data, reply })
            .await?
    }

    pub async fn subscribe(&self, topic: String) -> Result<(), HelperError> {
        self.request(|reply| Command::Subscribe { topic, reply })
            .await?
    }

    pub async fn unsubscribe(&self, topic: String) -> Result<(), HelperError> {
        self.request(|reply| Command::Unsubscribe { topic, reply })
            .await?
    }

    /// Hands a validation verdict back to gossipsub.
    pub async fn report_validation(
        &self,
        message_id: MessageId,
        propagation_source: PeerId,
        acceptance: MessageAcceptance,
    ) {
        let _ = self
            .commands
            .send(Command::ReportValidation {
                message_id,
                propagation_source,
                acceptance,
            })
            .await;
    }

    /// Joins the DHT: advertises the rendezvous string, bootstraps, and
    /// enables local discovery. Returns the locally-discovered-peer channel;
    /// calling twice returns an error.
    pub async fn begin_advertising(&self) -> Result<mpsc::Receiver<AddrInfo>, HelperError> {
        let receiver = self
            .mdns_rx
            .lock()
            .take()
            .ok_or_else(|| HelperError::Setup("already advertising".into()))?;
        self.request(|reply| Command::BeginAdvertising { reply })
            .await??;
        self.pubsub_joined.store(true, Ordering::Release);
        Ok(receiver)
    }

    /// Runs one bounded provider lookup under the rendezvous key.
    pub async fn find_peers(&self) -> Result<Vec<AddrInfo>, HelperError> {
        self.request(|reply| Command::FindPeers { reply }).await?
    }

    /// Opens an outbound stream to `peer` for `protocol`.
    pub async fn open_stream(&self, peer: PeerId, protocol: &str) -> Result<Stream, HelperError> {
        let protocol = StreamProtocol::try_from_owned(protocol.to_string())
            .map_err(|err| HelperError::Stream(err.to_string()))?;
        self.control
            .clone()
            .open_stream(peer, protocol)
            .await
            .map_err(|err| HelperError::Stream(err.to_string()))
    }

    /// Installs an inbound handler for `protocol` and returns its stream of
    /// incoming streams.
    pub fn accept_streams(
        &self,
        protocol: &str,
    ) -> Result<mpsc::Receiver<IncomingStream>, HelperError> {
        let protocol = StreamProtocol::try_from_owned(protocol.to_string())
            .map_err(|err| HelperError::Stream(err.to_string()))?;
        let mut incoming = self
            .control
            .clone()
            .accept(protocol.clone())
            .map_err(|err| HelperError::Stream(err.to_string()))?;

        let token = CancellationToken::new();
        self.handlers.lock().insert(protocol, token.clone());

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    accepted = incoming.next() => {
                        let Some((peer_id, stream)) = accepted else { break };
                        if tx.send(IncomingStream { peer_id, stream }).await.is_err() {
                            break;
                        }
                    }
                }
            }
            // Dropping `incoming` releases the protocol registration.
        });
        Ok(rx)
    }

    /// Uninstalls the inbound handler for `protocol`, if any.
    pub fn remove_stream_handler(&self, protocol: &str) -> Result<(), HelperError> {
        let protocol = StreamProtocol::try_from_owned(protocol.to_string())
            .map_err(|err| HelperError::Stream(err.to_string()))?;
        if let Some(token) = self.handlers.lock().remove(&protocol) {
            token.cancel();
        }
        Ok(())
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, HelperError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| HelperError::ChannelClosed)?;
        rx.await.map_err(|_| HelperError::ChannelClosed)
    }
}
