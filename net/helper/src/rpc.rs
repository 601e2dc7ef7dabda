//! The RPC dispatcher: one line in, one response out, upcalls in between.
//!
//! Envelope-level failures are channel-fatal (continuing after one would
//! desynchronize seqnos); handler panics are contained per request.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::oneshot;
use tracing::error;

use crate::app::App;
use crate::methods::{self, Method};

#[derive(Debug, Deserialize)]
pub struct Envelope {
    pub method: u8,
    pub seqno: u64,
    #[serde(default)]
    pub body: Value,
}

#[derive(Debug, Serialize)]
struct SuccessResponse {
    seqno: u64,
    success: Value,
    duration: String,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    seqno: u64,
    error: String,
}

/// Failures that make the channel unusable and terminate the sidecar.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("malformed envelope: {0}")]
    Envelope(serde_json::Error),
    #[error("unknown method {0}")]
    UnknownMethod(u8),
    #[error("malformed request body: {0}")]
    Body(serde_json::Error),
    #[error("RPC channel i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// Signals a handler may wait on before emitting upcalls that must trail the
/// request's own response.
pub struct RequestCtx {
    pub reply_sent: oneshot::Receiver<()>,
}

/// Runs the dispatcher until `input` closes. Returning `Ok(())` is the clean
/// parent-went-away exit.
pub async fn run(app: Arc<App>, input: impl AsyncBufRead + Unpin) -> Result<(), FatalError> {
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        let envelope: Envelope = serde_json::from_str(&line).map_err(FatalError::Envelope)?;
        let method =
            Method::try_from(envelope.method).map_err(FatalError::UnknownMethod)?;

        let started = Instant::now();
        let (done_tx, done_rx) = oneshot::channel();
        let ctx = RequestCtx {
            reply_sent: done_rx,
        };
        let task = tokio::spawn(methods::dispatch(app.clone(), method, envelope.body, ctx));
        let outcome = match task.await {
            Ok(outcome) => outcome,
            Err(join_error) => {
                // Contain the crash; the parent times this request out.
                error!(%line, %join_error, "request handler crashed");
                continue;
            }
        };
        match outcome.map_err(FatalError::Body)? {
            Ok(success) => {
                app.writer
                    .write(&SuccessResponse {
                        seqno: envelope.seqno,
                        success,
                        duration: format!("{:?}", started.elapsed()),
                    })
                    .await?
            }
            Err(err) => {
                app.writer
                    .write(&ErrorResponse {
                        seqno: envelope.seqno,
                        error: err.to_string(),
                    })
                    .await?
            }
        }
        let _ = done_tx.send(());
    }
    Ok(())
}
