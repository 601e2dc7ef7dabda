//! The swarm task: one event loop owning the libp2p `Swarm`, driven by a
//! command channel from the [`crate::Helper`] handle.
//!
//! Dial results, provider queries, and connection bookkeeping are all
//! correlated here so the handle can expose plain async methods.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;

use futures::StreamExt;
use libp2p::core::transport::ListenerId;
use libp2p::gossipsub::{self, IdentTopic, MessageAcceptance, MessageId};
use libp2p::kad::{self, GetProvidersOk, QueryId, QueryResult, RecordKey};
use libp2p::multiaddr::Protocol;
use libp2p::swarm::dial_opts::DialOpts;
use libp2p::swarm::{ConnectionId, DialError, SwarmEvent};
use libp2p::{identify, mdns, Multiaddr, PeerId, Swarm};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::behaviour::{Behaviour, BehaviourEvent};
use crate::filters::{FilterAction, Filters};
use crate::helper::{AddrInfo, ConnInfo, GossipMessage};

#[derive(Debug, Clone, Error)]
pub enum HelperError {
    #[error("{0}")]
    Setup(String),
    #[error("gossipsub error: {0}")]
    Gossipsub(String),
    #[error("dial error: {0}")]
    Dial(String),
    #[error("kademlia error: {0}")]
    Kad(String),
    #[error("stream error: {0}")]
    Stream(String),
    #[error("connection denied by IP filter")]
    Filtered,
    #[error("helper task is gone")]
    ChannelClosed,
}

pub(crate) enum Command {
    Listen {
        addr: Multiaddr,
        reply: oneshot::Sender<Result<(), HelperError>>,
    },
    ListeningAddrs {
        reply: oneshot::Sender<Vec<Multiaddr>>,
    },
    Connections {
        reply: oneshot::Sender<Vec<ConnInfo>>,
    },
    ConnectionsToPeer {
        peer: PeerId,
        reply: oneshot::Sender<Vec<ConnInfo>>,
    },
    Dial {
        peer: PeerId,
        addrs: Vec<Multiaddr>,
        reply: oneshot::Sender<Result<(), HelperError>>,
    },
    AddAddresses {
        peer: PeerId,
        addrs: Vec<Multiaddr>,
    },
    Publish {
        topic: String,
        data: Vec<u8>,
        reply: oneshot::Sender<Result<(), HelperError>>,
    },
    Subscribe {
        topic: String,
        reply: oneshot::Sender<Result<(), HelperError>>,
    },
    Unsubscribe {
        topic: String,
        reply: oneshot::Sender<Result<(), HelperError>>,
    },
    ReportValidation {
        message_id: MessageId,
        propagation_source: PeerId,
        acceptance: MessageAcceptance,
    },
    BeginAdvertising {
        reply: oneshot::Sender<Result<(), HelperError>>,
    },
    FindPeers {
        reply: oneshot::Sender<Result<Vec<AddrInfo>, HelperError>>,
    },
}

struct ProviderQuery {
    providers: HashSet<PeerId>,
    reply: oneshot::Sender<Result<Vec<AddrInfo>, HelperError>>,
}

pub(crate) struct EventLoop {
    swarm: Swarm<Behaviour>,
    commands: mpsc::Receiver<Command>,
    gossip_tx: mpsc::Sender<GossipMessage>,
    mdns_tx: mpsc::Sender<AddrInfo>,
    filters: Arc<Filters>,
    rendezvous_key: RecordKey,
    advertising: bool,
    connections: HashMap<PeerId, Vec<(ConnectionId, Multiaddr)>>,
    pending_dials: HashMap<PeerId, Vec<oneshot::Sender<Result<(), HelperError>>>>,
    pending_listens: HashMap<ListenerId, oneshot::Sender<Result<(), HelperError>>>,
    provider_queries: HashMap<QueryId, ProviderQuery>,
}

impl EventLoop {
    pub(crate) fn new(
        swarm: Swarm<Behaviour>,
        commands: mpsc::Receiver<Command>,
        gossip_tx: mpsc::Sender<GossipMessage>,
        mdns_tx: mpsc::Sender<AddrInfo>,
        filters: Arc<Filters>,
        rendezvous: &str,
    ) -> Self {
        Self {
            swarm,
            commands,
            gossip_tx,
            mdns_tx,
            filters,
            rendezvous_key: RecordKey::new(&rendezvous.as_bytes()),
            advertising: false,
            connections: HashMap::new(),
            pending_dials: HashMap::new(),
            pending_listens: HashMap::new(),
            provider_queries: HashMap::new(),
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            tokio::select! {
                event = self.swarm.select_next_some() => {
                    self.handle_swarm_event(event);
                }
                command = self.commands.recv() => {
                    match command {
                        Some(command) => self.handle_command(command),
                        // All handles dropped; nothing can reach the swarm
                        // any more.
                        None => break,
                    }
                }
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Listen { addr, reply } => {
                // The bind completes asynchronously; the reply waits for the
                // listener's first event so callers observe a bound address.
                match self.swarm.listen_on(addr) {
                    Ok(listener_id) => {
                        self.pending_listens.insert(listener_id, reply);
                    }
                    Err(err) => {
                        let _ = reply.send(Err(HelperError::Setup(err.to_string())));
                    }
                }
            }
            Command::ListeningAddrs { reply } => {
                let _ = reply.send(self.swarm.listeners().cloned().collect());
            }
            Command::Connections { reply } => {
                let conns = self
                    .connections
                    .iter()
                    .flat_map(|(peer, conns)| {
                        conns.iter().map(|(_, addr)| ConnInfo {
                            peer_id: *peer,
                            remote_addr: addr.clone(),
                        })
                    })
                    .collect();
                let _ = reply.send(conns);
            }
            Command::ConnectionsToPeer { peer, reply } => {
                let conns = self
                    .connections
                    .get(&peer)
                    .map(|conns| {
                        conns
                            .iter()
                            .map(|(_, addr)| ConnInfo {
                                peer_id: peer,
                                remote_addr: addr.clone(),
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                let _ = reply.send(conns);
            }
            Command::Dial { peer, addrs, reply } => self.start_dial(peer, addrs, reply),
            Command::AddAddresses { peer, addrs } => {
                for addr in addrs {
                    self.swarm.behaviour_mut().kad.add_address(&peer, addr);
                }
            }
            Command::Publish { topic, data, reply } => {
                let result = self
                    .swarm
                    .behaviour_mut()
                    .gossipsub
                    .publish(IdentTopic::new(topic), data)
                    .map(|_| ())
                    .map_err(|err| HelperError::Gossipsub(err.to_string()));
                let _ = reply.send(result);
            }
            Command::Subscribe { topic, reply } => {
                let result = self
                    .swarm
                    .behaviour_mut()
                    .gossipsub
                    .subscribe(&IdentTopic::new(topic))
                    .map(|_| ())
                    .map_err(|err| HelperError::Gossipsub(err.to_string()));
                let _ = reply.send(result);
            }
            Command::Unsubscribe { topic, reply } => {
                let _ = self
                    .swarm
                    .behaviour_mut()
                    .gossipsub
                    .unsubscribe(&IdentTopic::new(topic));
                let _ = reply.send(Ok(()));
            }
            Command::ReportValidation {
                message_id,
                propagation_source,
                acceptance,
            } => {
                let _ = self
                    .swarm
                    .behaviour_mut()
                    .gossipsub
                    .report_message_validation_result(&message_id, &propagation_source, acceptance);
            }
            Command::BeginAdvertising { reply } => {
                self.advertising = true;
                if let Err(err) = self
                    .swarm
                    .behaviour_mut()
                    .kad
                    .start_providing(self.rendezvous_key.clone())
                {
                    let _ = reply.send(Err(HelperError::Kad(err.to_string())));
                    return;
                }
                // An empty routing table is normal on a fresh start; the
                // bootstrap retries once peers show up via addPeer or mdns.
                if let Err(err) = self.swarm.behaviour_mut().kad.bootstrap() {
                    warn!(%err, "kademlia bootstrap deferred");
                }
                let _ = reply.send(Ok(()));
            }
            Command::FindPeers { reply } => {
                let query_id = self
                    .swarm
                    .behaviour_mut()
                    .kad
                    .get_providers(self.rendezvous_key.clone());
                self.provider_queries.insert(
                    query_id,
                    ProviderQuery {
                        providers: HashSet::new(),
                        reply,
                    },
                );
            }
        }
    }

    fn start_dial(
        &mut self,
        peer: PeerId,
        addrs: Vec<Multiaddr>,
        reply: oneshot::Sender<Result<(), HelperError>>,
    ) {
        if self.connections.contains_key(&peer) {
            let _ = reply.send(Ok(()));
            return;
        }
        let opts = DialOpts::peer_id(peer).addresses(addrs).build();
        match self.swarm.dial(opts) {
            Ok(()) => self.pending_dials.entry(peer).or_default().push(reply),
            // Another dial to this peer is already in flight; piggyback on it.
            Err(DialError::DialPeerConditionFalse(_)) => {
                self.pending_dials.entry(peer).or_default().push(reply)
            }
            Err(err) => {
                let _ = reply.send(Err(HelperError::Dial(err.to_string())));
            }
        }
    }

    fn resolve_dials(&mut self, peer: &PeerId, result: &Result<(), HelperError>) {
        if let Some(waiters) = self.pending_dials.remove(peer) {
            for waiter in waiters {
                let _ = waiter.send(result.clone());
            }
        }
    }

    fn handle_swarm_event(&mut self, event: SwarmEvent<BehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr {
                listener_id,
                address,
                ..
            } => {
                info!(%address, "listening");
                if let Some(reply) = self.pending_listens.remove(&listener_id) {
                    let _ = reply.send(Ok(()));
                }
            }
            SwarmEvent::ListenerError {
                listener_id, error, ..
            } => {
                warn!(%error, "listener error");
                if let Some(reply) = self.pending_listens.remove(&listener_id) {
                    let _ = reply.send(Err(HelperError::Setup(error.to_string())));
                }
            }
            SwarmEvent::ListenerClosed {
                listener_id,
                reason,
                ..
            } => {
                if let Some(reply) = self.pending_listens.remove(&listener_id) {
                    let result = match reason {
                        Ok(()) => Err(HelperError::Setup("listener closed".into())),
                        Err(err) => Err(HelperError::Setup(err.to_string())),
                    };
                    let _ = reply.send(result);
                }
            }
            SwarmEvent::ConnectionEstablished {
                peer_id,
                connection_id,
                endpoint,
                ..
            } => {
                let remote_addr = endpoint.get_remote_address().clone();
                if let Some(ip) = multiaddr_ip(&remote_addr) {
                    if self.filters.action_for_addr(ip) == FilterAction::Deny {
                        warn!(%peer_id, %remote_addr, "dropping filtered connection");
                        self.swarm.close_connection(connection_id);
                        self.resolve_dials(&peer_id, &Err(HelperError::Filtered));
                        return;
                    }
                }
                self.swarm
                    .behaviour_mut()
                    .kad
                    .add_address(&peer_id, remote_addr.clone());
                self.connections
                    .entry(peer_id)
                    .or_default()
                    .push((connection_id, remote_addr));
                self.resolve_dials(&peer_id, &Ok(()));
            }
            SwarmEvent::ConnectionClosed {
                peer_id,
                connection_id,
                ..
            } => {
                if let Some(conns) = self.connections.get_mut(&peer_id) {
                    conns.retain(|(id, _)| *id != connection_id);
                    if conns.is_empty() {
                        self.connections.remove(&peer_id);
                    }
                }
            }
            SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                if let Some(peer_id) = peer_id {
                    debug!(%peer_id, %error, "outgoing connection failed");
                    self.resolve_dials(&peer_id, &Err(HelperError::Dial(error.to_string())));
                }
            }
            SwarmEvent::Behaviour(event) => self.handle_behaviour_event(event),
            _ => {}
        }
    }

    fn handle_behaviour_event(&mut self, event: BehaviourEvent) {
        match event {
            BehaviourEvent::Gossipsub(gossipsub::Event::Message {
                propagation_source,
                message_id,
                message,
            }) => {
                let forwarded = GossipMessage {
                    propagation_source,
                    message_id: message_id.clone(),
                    source: message.source,
                    topic: message.topic,
                    data: message.data,
                };
                if let Err(err) = self.gossip_tx.try_send(forwarded) {
                    // Nobody is draining validations; answer gossipsub
                    // ourselves so its cache does not pin the message forever.
                    warn!(%propagation_source, %err, "gossip channel unavailable, ignoring message");
                    let _ = self
                        .swarm
                        .behaviour_mut()
                        .gossipsub
                        .report_message_validation_result(
                            &message_id,
                            &propagation_source,
                            MessageAcceptance::Ignore,
                        );
                }
            }
            BehaviourEvent::Mdns(mdns::Event::Discovered(peers)) => {
                if !self.advertising {
                    return;
                }
                let mut grouped: HashMap<PeerId, Vec<Multiaddr>> = HashMap::new();
                for (peer_id, addr) in peers {
                    grouped.entry(peer_id).or_default().push(addr);
                }
                for (peer_id, addrs) in grouped {
                    if peer_id == *self.swarm.local_peer_id() {
                        continue;
                    }
                    if self.mdns_tx.try_send(AddrInfo { peer_id, addrs }).is_err() {
                        debug!(%peer_id, "local discovery channel full, dropping find");
                    }
                }
            }
            BehaviourEvent::Mdns(mdns::Event::Expired(_)) => {}
            BehaviourEvent::Kad(kad::Event::OutboundQueryProgressed {
                id, result, step, ..
            }) => {
                self.handle_query_progress(id, result, step.last);
            }
            BehaviourEvent::Kad(_) => {}
            BehaviourEvent::Identify(identify::Event::Received { peer_id, info, .. }) => {
                for addr in info.listen_addrs {
                    self.swarm.behaviour_mut().kad.add_address(&peer_id, addr);
                }
            }
            BehaviourEvent::Identify(_) => {}
            _ => {}
        }
    }

    fn handle_query_progress(&mut self, id: QueryId, result: QueryResult, last: bool) {
        match result {
            QueryResult::GetProviders(progress) => {
                let Some(query) = self.provider_queries.get_mut(&id) else {
                    return;
                };
                match progress {
                    Ok(GetProvidersOk::FoundProviders { providers, .. }) => {
                        query.providers.extend(providers);
                    }
                    Ok(GetProvidersOk::FinishedWithNoAdditionalRecord { .. }) => {}
                    Err(err) => {
                        debug!(%err, "provider lookup ended early");
                    }
                }
                if last {
                    let query = self
                        .provider_queries
                        .remove(&id)
                        .expect("query checked above");
                    let local = *self.swarm.local_peer_id();
                    let found = query
                        .providers
                        .into_iter()
                        .filter(|peer_id| *peer_id != local)
                        .map(|peer_id| AddrInfo {
                            peer_id,
                            addrs: self
                                .connections
                                .get(&peer_id)
                                .map(|conns| conns.iter().map(|(_, addr)| addr.clone()).collect())
                                .unwrap_or_default(),
                        })
                        .collect();
                    let _ = query.reply.send(Ok(found));
                }
            }
            QueryResult::Bootstrap(result) => {
                debug!(?result, "bootstrap progress");
            }
            QueryResult::StartProviding(result) => {
                debug!(?result, "advertisement progress");
            }
            _ => {}
        }
    }
}

/// Extracts the IP component of a multiaddress, if it leads with one.
pub(crate) fn multiaddr_ip(addr: &Multiaddr) -> Option<IpAddr> {
    match addr.iter().next()? {
        Protocol::Ip4(ip) => Some(IpAddr::V4(ip)),
        Protocol::Ip6(ip) => Some(IpAddr::V6(ip)),
        _ => None,
    }
}
