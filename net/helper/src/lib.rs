//! Sidecar core: the JSON-RPC surface the parent process drives over stdio,
//! bridged onto the [`coda_p2p`] networking stack.

pub mod app;
pub mod codec;
pub mod error;
pub mod methods;
pub mod peer;
pub mod registry;
pub mod rpc;
pub mod seq;
pub mod writer;
