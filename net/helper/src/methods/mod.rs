//! The method table: fixed numeric identifiers mapped to typed requests.

mod discovery;
mod gossip;
mod peers;
mod setup;
mod stream;

use std::sync::Arc;

use serde_json::Value;

use crate::app::App;
use crate::error::RpcError;
use crate::rpc::RequestCtx;

pub use gossip::spawn_validation_router;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Configure,
    Listen,
    Publish,
    Subscribe,
    Unsubscribe,
    ValidationComplete,
    GenerateKeypair,
    OpenStream,
    CloseStream,
    ResetStream,
    SendStreamMsg,
    RemoveStreamHandler,
    AddStreamHandler,
    ListeningAddrs,
    AddPeer,
    BeginAdvertising,
    FindPeer,
    ListPeers,
    BanIp,
    UnbanIp,
}

impl TryFrom<u8> for Method {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        Ok(match value {
            0 => Self::Configure,
            1 => Self::Listen,
            2 => Self::Publish,
            3 => Self::Subscribe,
            4 => Self::Unsubscribe,
            5 => Self::ValidationComplete,
            6 => Self::GenerateKeypair,
            7 => Self::OpenStream,
            8 => Self::CloseStream,
            9 => Self::ResetStream,
            10 => Self::SendStreamMsg,
            11 => Self::RemoveStreamHandler,
            12 => Self::AddStreamHandler,
            13 => Self::ListeningAddrs,
            14 => Self::AddPeer,
            15 => Self::BeginAdvertising,
            16 => Self::FindPeer,
            17 => Self::ListPeers,
            18 => Self::BanIp,
            19 => Self::UnbanIp,
            other => return Err(other),
        })
    }
}

/// Parses the request body for `method` and runs its handler. The outer
/// error is a body-parse failure, which the dispatcher treats as fatal.
pub async fn dispatch(
    app: Arc<App>,
    method: Method,
    body: Value,
    ctx: RequestCtx,
) -> Result<Result<Value, RpcError>, serde_json::Error> {
    macro_rules! handle {
        ($request:ty) => {{
            let request: $request = serde_json::from_value(body)?;
            Ok(request.run(&app).await)
        }};
    }

    match method {
        Method::Configure => handle!(setup::ConfigureMsg),
        Method::GenerateKeypair => handle!(setup::GenerateKeypairMsg),
        Method::Listen => handle!(peers::ListenMsg),
        Method::ListeningAddrs => handle!(peers::ListeningAddrsMsg),
        Method::AddPeer => handle!(peers::AddPeerMsg),
        Method::FindPeer => handle!(peers::FindPeerMsg),
        Method::ListPeers => handle!(peers::ListPeersMsg),
        Method::BanIp => handle!(peers::BanIpMsg),
        Method::UnbanIp => handle!(peers::UnbanIpMsg),
        Method::Publish => handle!(gossip::PublishMsg),
        Method::Subscribe => handle!(gossip::SubscribeMsg),
        Method::Unsubscribe => handle!(gossip::UnsubscribeMsg),
        Method::ValidationComplete => handle!(gossip::ValidationCompleteMsg),
        Method::OpenStream => {
            let request: stream::OpenStreamMsg = serde_json::from_value(body)?;
            Ok(request.run(&app, ctx).await)
        }
        Method::CloseStream => handle!(stream::CloseStreamMsg),
        Method::ResetStream => handle!(stream::ResetStreamMsg),
        Method::SendStreamMsg => handle!(stream::SendStreamMsgMsg),
        Method::AddStreamHandler => handle!(stream::AddStreamHandlerMsg),
        Method::RemoveStreamHandler => handle!(stream::RemoveStreamHandlerMsg),
        Method::BeginAdvertising => handle!(discovery::BeginAdvertisingMsg),
    }
}
