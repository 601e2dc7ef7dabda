//! Byte streams: open/close/reset/send, inbound handlers, and the per-stream
//! read task.

use std::sync::Arc;

use coda_p2p::{IncomingStream, PeerId, Stream};
use futures::io::ReadHalf;
use futures::{AsyncReadExt, AsyncWriteExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::app::App;
use crate::codec;
use crate::error::{bad_p2p, bad_rpc, RpcError};
use crate::peer::PeerInfo;
use crate::registry::StreamRecord;
use crate::rpc::RequestCtx;

/// Read buffer per stream task.
const READ_BUFFER_SIZE: usize = 4096;

#[derive(Debug, Serialize)]
struct IncomingStreamUpcall {
    upcall: &'static str,
    peer: PeerInfo,
    stream_idx: u64,
    protocol: String,
}

#[derive(Debug, Serialize)]
struct IncomingStreamMsgUpcall {
    upcall: &'static str,
    stream_idx: u64,
    data: String,
}

#[derive(Debug, Serialize)]
struct StreamLostUpcall {
    upcall: &'static str,
    stream_idx: u64,
    reason: String,
}

#[derive(Debug, Serialize)]
struct StreamReadCompleteUpcall {
    upcall: &'static str,
    stream_idx: u64,
}

/// Registers `stream` under `idx`, handing back the read half and the
/// cancellation token for its read task. Callers start the read task only
/// after the upcall or response that must precede stream events.
fn register_stream(app: &Arc<App>, idx: u64, stream: Stream) -> (ReadHalf<Stream>, CancellationToken) {
    let (read_half, write_half) = stream.split();
    let cancel = CancellationToken::new();
    app.streams.insert(
        idx,
        StreamRecord {
            write: Arc::new(tokio::sync::Mutex::new(write_half)),
            cancel: cancel.clone(),
        },
    );
    (read_half, cancel)
}

/// The per-stream read task. When `gate` is given, the first read waits
/// until the gate fires so the `openStream` response reaches the parent
/// before any `incomingStreamMsg` for the same index.
fn spawn_read_task(
    app: Arc<App>,
    stream_idx: u64,
    mut read: ReadHalf<Stream>,
    cancel: CancellationToken,
    gate: Option<oneshot::Receiver<()>>,
) {
    tokio::spawn(async move {
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = read.read(&mut buf) => result,
            };
            match result {
                Ok(0) => break,
                Ok(n) => {
                    app.writer
                        .must_write(&IncomingStreamMsgUpcall {
                            upcall: "incomingStreamMsg",
                            stream_idx,
                            data: codec::encode(&buf[..n]),
                        })
                        .await;
                }
                Err(err) => {
                    app.writer
                        .must_write(&StreamLostUpcall {
                            upcall: "streamLost",
                            stream_idx,
                            reason: format!("read failure: {err}"),
                        })
                        .await;
                    break;
                }
            }
        }
        app.writer
            .must_write(&StreamReadCompleteUpcall {
                upcall: "streamReadComplete",
                stream_idx,
            })
            .await;
    });
}

#[derive(Debug, Deserialize)]
pub struct OpenStreamMsg {
    pub peer: String,
    #[serde(rename = "protocol")]
    pub protocol_id: String,
}

impl OpenStreamMsg {
    pub async fn run(self, app: &Arc<App>, ctx: RequestCtx) -> Result<Value, RpcError> {
        let helper = app.helper()?;
        let stream_idx = app.seq.next();
        let peer: PeerId = self.peer.parse().map_err(bad_rpc)?;

        let stream = helper
            .open_stream(peer, &self.protocol_id)
            .await
            .map_err(bad_p2p)?;
        let peer_info = match app.strict_peer_info(peer).await {
            Ok(info) => info,
            Err(err) => {
                // Dropping the stream resets it.
                drop(stream);
                return Err(err);
            }
        };

        let (read_half, cancel) = register_stream(app, stream_idx, stream);
        spawn_read_task(
            app.clone(),
            stream_idx,
            read_half,
            cancel,
            Some(ctx.reply_sent),
        );
        Ok(json!({ "stream_idx": stream_idx, "peer": peer_info }))
    }
}

#[derive(Debug, Deserialize)]
pub struct CloseStreamMsg {
    pub stream_idx: u64,
}

impl CloseStreamMsg {
    pub async fn run(self, app: &Arc<App>) -> Result<Value, RpcError> {
        app.helper()?;
        let Some(writer) = app.streams.writer(self.stream_idx) else {
            return Err(bad_rpc("unknown stream_idx"));
        };
        writer.lock().await.close().await.map_err(bad_p2p)?;
        Ok(json!("closeStream success"))
    }
}

#[derive(Debug, Deserialize)]
pub struct ResetStreamMsg {
    pub stream_idx: u64,
}

impl ResetStreamMsg {
    pub async fn run(self, app: &Arc<App>) -> Result<Value, RpcError> {
        app.helper()?;
        let Some(record) = app.streams.remove(self.stream_idx) else {
            return Err(bad_rpc("unknown stream_idx"));
        };
        // The read task drops its half on cancellation; with both halves gone
        // the stream resets.
        record.cancel.cancel();
        Ok(json!("resetStream success"))
    }
}

#[derive(Debug, Deserialize)]
pub struct SendStreamMsgMsg {
    pub stream_idx: u64,
    pub data: String,
}

impl SendStreamMsgMsg {
    pub async fn run(self, app: &Arc<App>) -> Result<Value, RpcError> {
        app.helper()?;
        let data = codec::decode(&self.data).map_err(bad_rpc)?;
        let Some(writer) = app.streams.writer(self.stream_idx) else {
            return Err(bad_rpc("unknown stream_idx"));
        };
        writer.lock().await.write_all(&data).await.map_err(bad_p2p)?;
        Ok(json!("sendStreamMsg success"))
    }
}

#[derive(Debug, Deserialize)]
pub struct AddStreamHandlerMsg {
    pub protocol: String,
}

impl AddStreamHandlerMsg {
    pub async fn run(self, app: &Arc<App>) -> Result<Value, RpcError> {
        let helper = app.helper()?;
        let incoming = helper.accept_streams(&self.protocol).map_err(bad_p2p)?;
        spawn_accept_task(app.clone(), self.protocol, incoming);
        Ok(json!("addStreamHandler success"))
    }
}

/// Accepts inbound streams for one protocol until the handler is removed.
fn spawn_accept_task(
    app: Arc<App>,
    protocol: String,
    mut incoming: mpsc::Receiver<IncomingStream>,
) {
    tokio::spawn(async move {
        while let Some(accepted) = incoming.recv().await {
            let peer_info = match app.strict_peer_info(accepted.peer_id).await {
                Ok(info) => info,
                Err(err) => {
                    error!(
                        peer = %accepted.peer_id.to_base58(),
                        %err,
                        "cannot describe remote, silently dropping inbound stream"
                    );
                    continue;
                }
            };
            let stream_idx = app.seq.next();
            let (read_half, cancel) = register_stream(&app, stream_idx, accepted.stream);
            app.writer
                .must_write(&IncomingStreamUpcall {
                    upcall: "incomingStream",
                    peer: peer_info,
                    stream_idx,
                    protocol: protocol.clone(),
                })
                .await;
            spawn_read_task(app.clone(), stream_idx, read_half, cancel, None);
        }
    });
}

#[derive(Debug, Deserialize)]
pub struct RemoveStreamHandlerMsg {
    pub protocol: String,
}

impl RemoveStreamHandlerMsg {
    pub async fn run(self, app: &Arc<App>) -> Result<Value, RpcError> {
        let helper = app.helper()?;
        helper
            .remove_stream_handler(&self.protocol)
            .map_err(bad_p2p)?;
        Ok(json!("removeStreamHandler success"))
    }
}
