//! Shared sidecar state: the helper slot, the registries, the sequence
//! generator, and the output multiplexer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use coda_p2p::{Helper, PeerId};
use parking_lot::RwLock;

use crate::error::{bad_p2p, needs_configure, needs_dht, RpcError};
use crate::peer::{peer_info_from_multiaddr, PeerInfo};
use crate::registry::{StreamRegistry, SubscriptionRegistry, ValidatorRegistry};
use crate::seq::SeqGen;
use crate::writer::MsgWriter;

pub struct App {
    pub seq: SeqGen,
    pub writer: Arc<MsgWriter>,
    pub subs: SubscriptionRegistry,
    pub validators: ValidatorRegistry,
    pub streams: StreamRegistry,
    helper: RwLock<Option<Arc<Helper>>>,
    unsafe_no_trust_ip: AtomicBool,
}

impl App {
    pub fn new(writer: Arc<MsgWriter>) -> Arc<Self> {
        Arc::new(Self {
            seq: SeqGen::new(),
            writer,
            subs: SubscriptionRegistry::default(),
            validators: ValidatorRegistry::default(),
            streams: StreamRegistry::default(),
            helper: RwLock::new(None),
            unsafe_no_trust_ip: AtomicBool::new(false),
        })
    }

    /// Installs the helper built by `configure`. A second call replaces the
    /// previous helper; tasks spawned against it keep running (repeated
    /// configure is undefined behaviour at the protocol level).
    pub fn set_helper(&self, helper: Arc<Helper>) {
        *self.helper.write() = Some(helper);
    }

    pub fn helper(&self) -> Result<Arc<Helper>, RpcError> {
        self.helper.read().clone().ok_or_else(needs_configure)
    }

    /// Helper that has additionally joined the DHT, as pub/sub methods
    /// require.
    pub fn pubsub_helper(&self) -> Result<Arc<Helper>, RpcError> {
        let helper = self.helper()?;
        if !helper.pubsub_joined() {
            return Err(needs_dht());
        }
        Ok(helper)
    }

    pub fn set_unsafe_no_trust_ip(&self, value: bool) {
        self.unsafe_no_trust_ip.store(value, Ordering::Release);
    }

    pub fn unsafe_no_trust_ip(&self) -> bool {
        self.unsafe_no_trust_ip.load(Ordering::Acquire)
    }

    /// Resolves a peer to its descriptor via the first open connection.
    /// Without a connection this fails, unless *unsafe-no-trust-ip* allows
    /// the loopback placeholder.
    pub async fn find_peer_info(&self, peer: PeerId) -> Result<PeerInfo, RpcError> {
        let helper = self.helper()?;
        let conns = helper
            .connections_to_peer(peer)
            .await
            .map_err(bad_p2p)?;
        match conns.first() {
            Some(conn) => peer_info_from_multiaddr(&conn.remote_addr, &peer),
            None if self.unsafe_no_trust_ip() => Ok(PeerInfo::localhost_placeholder(&peer)),
            None => Err(bad_p2p(
                "tried to find peer info but no open connections to that peer ID",
            )),
        }
    }

    /// Like [`App::find_peer_info`] but never synthesizes a placeholder;
    /// stream bookkeeping wants real addresses only.
    pub async fn strict_peer_info(&self, peer: PeerId) -> Result<PeerInfo, RpcError> {
        let helper = self.helper()?;
        let conns = helper
            .connections_to_peer(peer)
            .await
            .map_err(bad_p2p)?;
        match conns.first() {
            Some(conn) => peer_info_from_multiaddr(&conn.remote_addr, &peer),
            None => Err(bad_p2p("no open connections to that peer ID")),
        }
    }
}
