//! The RPC error taxonomy. Every per-request failure reaching the parent
//! carries one of these prefixes.

use std::fmt::Display;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("internal RPC error: {0}")]
    Rpc(String),
    #[error("libp2p error: {0}")]
    P2p(String),
    #[error("initializing helper: {0}")]
    Helper(String),
    #[error("initializing external addr: {0}")]
    ExternalAddr(String),
}

pub fn bad_rpc(err: impl Display) -> RpcError {
    RpcError::Rpc(err.to_string())
}

pub fn bad_p2p(err: impl Display) -> RpcError {
    RpcError::P2p(err.to_string())
}

pub fn bad_helper(err: impl Display) -> RpcError {
    RpcError::Helper(err.to_string())
}

pub fn bad_addr(err: impl Display) -> RpcError {
    RpcError::ExternalAddr(err.to_string())
}

/// Guard failure for every method that needs a configured helper.
pub fn needs_configure() -> RpcError {
    bad_rpc("helper not yet configured")
}

/// Guard failure for pub/sub methods invoked before the DHT join.
pub fn needs_dht() -> RpcError {
    bad_rpc("helper not yet joined to pubsub")
}
