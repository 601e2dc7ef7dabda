//! The output multiplexer: every response and upcall leaves through here,
//! one JSON document per line, serialized fully before a single locked
//! write-and-flush so frames never interleave.

use std::io;

use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::error;

pub struct MsgWriter {
    out: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
}

impl MsgWriter {
    pub fn new(out: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self {
            out: Mutex::new(Box::new(out)),
        }
    }

    /// Writes one message frame. A failure here means the RPC channel is
    /// gone; callers either propagate it as channel-fatal or use
    /// [`MsgWriter::must_write`].
    pub async fn write<T: Serialize>(&self, msg: &T) -> io::Result<()> {
        let mut frame = serde_json::to_vec(msg)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        frame.push(b'\n');
        let mut out = self.out.lock().await;
        out.write_all(&frame).await?;
        out.flush().await
    }

    /// Writes from contexts with nowhere to report failure (upcall tasks).
    /// The sidecar cannot make progress without its output pipe, so a write
    /// failure exits the process.
    pub async fn must_write<T: Serialize>(&self, msg: &T) {
        if let Err(err) = self.write(msg).await {
            error!(%err, "output pipe failure");
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tokio::io::{AsyncBufReadExt, BufReader};

    #[tokio::test]
    async fn frames_are_newline_delimited_json() {
        let (tx, rx) = tokio::io::duplex(4096);
        let writer = MsgWriter::new(tx);
        writer.write(&json!({"seqno": 1, "success": "ok"})).await.unwrap();
        writer.write(&json!({"upcall": "publish"})).await.unwrap();
        drop(writer);

        let mut lines = BufReader::new(rx).lines();
        let first: Value =
            serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(first["seqno"], 1);
        let second: Value =
            serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(second["upcall"], "publish");
    }

    #[tokio::test]
    async fn concurrent_writers_never_interleave() {
        let (tx, rx) = tokio::io::duplex(64 * 1024);
        let writer = Arc::new(MsgWriter::new(tx));

        let mut tasks = Vec::new();
        for task_id in 0..8u64 {
            let writer = writer.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0..50u64 {
                    let payload = "x".repeat(512);
                    writer
                        .write(&json!({"task": task_id, "i": i, "payload": payload}))
                        .await
                        .unwrap();
                }
            }));
        }

        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(rx).lines();
            let mut count = 0;
            while let Some(line) = lines.next_line().await.unwrap() {
                let value: Value = serde_json::from_str(&line).expect("intact frame");
                assert_eq!(value["payload"].as_str().unwrap().len(), 512);
                count += 1;
            }
            count
        });

        for task in tasks {
            task.await.unwrap();
        }
        drop(writer);
        assert_eq!(reader.await.unwrap(), 8 * 50);
    }
}
