//! Addressing, dialing, peer listing, and IP-level bans.

use std::net::Ipv4Addr;
use std::sync::Arc;

use coda_p2p::{FilterAction, Multiaddr, PeerId};
use ipnetwork::{IpNetwork, Ipv4Network};
use libp2p::multiaddr::Protocol;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use crate::app::App;
use crate::error::{bad_p2p, bad_rpc, RpcError};
use crate::peer::peer_info_from_multiaddr;

#[derive(Debug, Deserialize)]
pub struct ListenMsg {
    pub iface: String,
}

impl ListenMsg {
    pub async fn run(self, app: &Arc<App>) -> Result<Value, RpcError> {
        let helper = app.helper()?;
        let addr: Multiaddr = self.iface.parse().map_err(bad_p2p)?;
        helper.listen(addr).await.map_err(bad_p2p)?;
        let addrs = helper.listening_addrs().await.map_err(bad_p2p)?;
        Ok(json!(addr_strings(addrs)))
    }
}

#[derive(Debug, Deserialize)]
pub struct ListeningAddrsMsg {}

impl ListeningAddrsMsg {
    pub async fn run(self, app: &Arc<App>) -> Result<Value, RpcError> {
        let helper = app.helper()?;
        let addrs = helper.listening_addrs().await.map_err(bad_p2p)?;
        Ok(json!(addr_strings(addrs)))
    }
}

fn addr_strings(addrs: Vec<Multiaddr>) -> Vec<String> {
    addrs.into_iter().map(|addr| addr.to_string()).collect()
}

#[derive(Debug, Deserialize)]
pub struct AddPeerMsg {
    pub multiaddr: String,
}

impl AddPeerMsg {
    pub async fn run(self, app: &Arc<App>) -> Result<Value, RpcError> {
        let helper = app.helper()?;
        let addr: Multiaddr = self.multiaddr.parse().map_err(bad_rpc)?;
        let (peer, transport_addr) = split_peer_multiaddr(&addr)?;
        helper
            .dial_peer(peer, vec![transport_addr])
            .await
            .map_err(bad_p2p)?;
        Ok(json!("addPeer success"))
    }
}

/// Splits `/…/p2p/<peer-id>` into the peer identifier and the transport part.
fn split_peer_multiaddr(addr: &Multiaddr) -> Result<(PeerId, Multiaddr), RpcError> {
    let mut transport = Multiaddr::empty();
    let mut peer = None;
    for component in addr.iter() {
        match component {
            Protocol::P2p(peer_id) => peer = Some(peer_id),
            other => transport.push(other),
        }
    }
    match peer {
        Some(peer) => Ok((peer, transport)),
        None => Err(bad_rpc(format!("multiaddr {addr} carries no peer ID"))),
    }
}

#[derive(Debug, Deserialize)]
pub struct FindPeerMsg {
    pub peer_id: String,
}

impl FindPeerMsg {
    pub async fn run(self, app: &Arc<App>) -> Result<Value, RpcError> {
        let peer: PeerId = self.peer_id.parse().map_err(bad_rpc)?;
        let info = app.find_peer_info(peer).await?;
        Ok(serde_json::to_value(info).map_err(bad_rpc)?)
    }
}

#[derive(Debug, Deserialize)]
pub struct ListPeersMsg {}

impl ListPeersMsg {
    pub async fn run(self, app: &Arc<App>) -> Result<Value, RpcError> {
        let helper = app.helper()?;
        let conns = helper.connections().await.map_err(bad_p2p)?;
        let mut peers = Vec::new();
        for conn in conns {
            match peer_info_from_multiaddr(&conn.remote_addr, &conn.peer_id) {
                Ok(info) => peers.push(info),
                Err(err) => {
                    warn!(addr = %conn.remote_addr, %err, "skipping undescribable connection");
                }
            }
        }
        Ok(serde_json::to_value(peers).map_err(bad_rpc)?)
    }
}

/// Parses the ban/unban operand. IPv6 is not supported by the filter
/// protocol, so it shares the error with unparsable input.
fn parse_banned_ip(ip: &str) -> Result<IpNetwork, RpcError> {
    let ip: Ipv4Addr = ip
        .parse()
        .map_err(|_| bad_rpc("unparsable IP or IPv6"))?;
    let net = Ipv4Network::new(ip, 32).map_err(bad_rpc)?;
    Ok(IpNetwork::V4(net))
}

#[derive(Debug, Deserialize)]
pub struct BanIpMsg {
    pub ip: String,
}

impl BanIpMsg {
    pub async fn run(self, app: &Arc<App>) -> Result<Value, RpcError> {
        let helper = app.helper()?;
        let net = parse_banned_ip(&self.ip)?;
        let filters = helper.filters();
        let (action, matched) = filters.action_for_filter(net);
        filters.add_filter(net, FilterAction::Deny);
        if matched && action == FilterAction::Deny {
            Ok(json!("banIP already banned"))
        } else {
            Ok(json!("banIP success"))
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct UnbanIpMsg {
    pub ip: String,
}

impl UnbanIpMsg {
    pub async fn run(self, app: &Arc<App>) -> Result<Value, RpcError> {
        let helper = app.helper()?;
        let net = parse_banned_ip(&self.ip)?;
        let filters = helper.filters();
        let (action, matched) = filters.action_for_filter(net);
        if !matched || action == FilterAction::Accept {
            return Ok(json!("unbanIP not banned"));
        }
        filters.remove_literal(net);
        Ok(json!("unbanIP success"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_peer_multiaddrs() {
        let peer = PeerId::random();
        let addr: Multiaddr = format!("/ip4/203.0.113.9/tcp/8302/p2p/{peer}")
            .parse()
            .unwrap();
        let (parsed_peer, transport) = split_peer_multiaddr(&addr).unwrap();
        assert_eq!(parsed_peer, peer);
        assert_eq!(transport, "/ip4/203.0.113.9/tcp/8302".parse().unwrap());
    }

    #[test]
    fn peerless_multiaddr_is_an_rpc_error() {
        let addr: Multiaddr = "/ip4/203.0.113.9/tcp/8302".parse().unwrap();
        let err = split_peer_multiaddr(&addr).unwrap_err();
        assert!(err.to_string().starts_with("internal RPC error: "));
    }

    #[test]
    fn ban_operand_must_be_ipv4() {
        assert!(parse_banned_ip("10.0.0.1").is_ok());
        let err = parse_banned_ip("::1").unwrap_err();
        assert_eq!(
            err.to_string(),
            "internal RPC error: unparsable IP or IPv6"
        );
        assert!(parse_banned_ip("not an ip").is_err());
    }
}
