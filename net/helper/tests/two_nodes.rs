//! End-to-end tests: two sidecars over loopback TCP, driven purely through
//! their RPC surfaces.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines};
use tokio::time::{sleep, timeout};

use coda_helper::app::App;
use coda_helper::rpc;
use coda_helper::writer::MsgWriter;

const WAIT: Duration = Duration::from_secs(30);

struct Node {
    requests: DuplexStream,
    lines: Lines<BufReader<DuplexStream>>,
    stashed_upcalls: VecDeque<Value>,
    next_seqno: u64,
    peer_id: String,
    addr: String,
    _statedir: TempDir,
}

impl Node {
    /// Boots a sidecar, configures it, and binds one loopback listener.
    async fn start() -> Self {
        let (requests, request_feed) = duplex(256 * 1024);
        let (output, output_feed) = duplex(256 * 1024);
        let app = App::new(Arc::new(MsgWriter::new(output)));
        tokio::spawn(rpc::run(app, BufReader::new(request_feed)));

        let statedir = tempfile::tempdir().unwrap();
        let mut node = Self {
            requests,
            lines: BufReader::new(output_feed).lines(),
            stashed_upcalls: VecDeque::new(),
            next_seqno: 1,
            peer_id: String::new(),
            addr: String::new(),
            _statedir: statedir,
        };

        let keypair = node.call_ok(6, json!({})).await;
        node.peer_id = keypair["peer_id"].as_str().unwrap().to_string();

        let configured = node
            .call_ok(
                0,
                json!({
                    "statedir": node._statedir.path(),
                    "privk": keypair["sk"],
                    "network_id": "integration-test",
                    "ifaces": [],
                    "external_maddr": "/ip4/127.0.0.1/tcp/1",
                    "unsafe_no_trust_ip": false
                }),
            )
            .await;
        assert_eq!(configured, json!("configure success"));

        let addrs = node
            .call_ok(1, json!({"iface": "/ip4/127.0.0.1/tcp/0"}))
            .await;
        node.addr = addrs
            .as_array()
            .unwrap()
            .iter()
            .map(|addr| addr.as_str().unwrap())
            .find(|addr| addr.starts_with("/ip4/127.0.0.1/tcp/"))
            .expect("loopback listener bound")
            .to_string();
        node
    }

    async fn call(&mut self, method: u8, body: Value) -> Value {
        let seqno = self.next_seqno;
        self.next_seqno += 1;
        let line = json!({"method": method, "seqno": seqno, "body": body}).to_string();
        self.requests.write_all(line.as_bytes()).await.unwrap();
        self.requests.write_all(b"\n").await.unwrap();

        loop {
            let line = timeout(WAIT, self.lines.next_line())
                .await
                .expect("response in time")
                .unwrap()
                .expect("channel open");
            let frame: Value = serde_json::from_str(&line).unwrap();
            if frame.get("upcall").is_some() {
                self.stashed_upcalls.push_back(frame);
                continue;
            }
            assert_eq!(frame["seqno"], seqno);
            return frame;
        }
    }

    async fn call_ok(&mut self, method: u8, body: Value) -> Value {
        let frame = self.call(method, body).await;
        assert!(
            frame.get("error").is_none(),
            "expected success, got {frame}"
        );
        frame["success"].clone()
    }

    /// Waits for the next upcall of `kind`, draining the channel.
    async fn upcall(&mut self, kind: &str) -> Value {
        if let Some(position) = self
            .stashed_upcalls
            .iter()
            .position(|frame| frame["upcall"] == kind)
        {
            return self.stashed_upcalls.remove(position).unwrap();
        }
        loop {
            let line = timeout(WAIT, self.lines.next_line())
                .await
                .unwrap_or_else(|_| panic!("waiting for {kind} upcall"))
                .unwrap()
                .expect("channel open");
            let frame: Value = serde_json::from_str(&line).unwrap();
            if frame["upcall"] == kind {
                return frame;
            }
            if frame.get("upcall").is_some() {
                self.stashed_upcalls.push_back(frame);
            }
        }
    }

    fn peer_addr(&self) -> String {
        format!("{}/p2p/{}", self.addr, self.peer_id)
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn streams_flow_between_two_sidecars() {
    let mut alpha = Node::start().await;
    let mut beta = Node::start().await;

    let installed = alpha.call_ok(12, json!({"protocol": "/echo/1"})).await;
    assert_eq!(installed, json!("addStreamHandler success"));

    let added = beta.call_ok(14, json!({"multiaddr": alpha.peer_addr()})).await;
    assert_eq!(added, json!("addPeer success"));

    let opened = beta
        .call_ok(7, json!({"peer": alpha.peer_id, "protocol": "/echo/1"}))
        .await;
    let beta_idx = opened["stream_idx"].as_u64().unwrap();
    assert_eq!(opened["peer"]["peer_id"], alpha.peer_id);
    assert_eq!(opened["peer"]["host"], "127.0.0.1");

    let incoming = alpha.upcall("incomingStream").await;
    assert_eq!(incoming["protocol"], "/echo/1");
    assert_eq!(incoming["peer"]["peer_id"], beta.peer_id);
    let alpha_idx = incoming["stream_idx"].as_u64().unwrap();

    // beta -> alpha
    let sent = beta
        .call_ok(10, json!({"stream_idx": beta_idx, "data": "aGVsbG8="}))
        .await;
    assert_eq!(sent, json!("sendStreamMsg success"));
    let message = alpha.upcall("incomingStreamMsg").await;
    assert_eq!(message["stream_idx"].as_u64().unwrap(), alpha_idx);
    assert_eq!(message["data"], "aGVsbG8=");

    // alpha -> beta
    alpha
        .call_ok(10, json!({"stream_idx": alpha_idx, "data": "d29ybGQ="}))
        .await;
    let reply = beta.upcall("incomingStreamMsg").await;
    assert_eq!(reply["stream_idx"].as_u64().unwrap(), beta_idx);
    assert_eq!(reply["data"], "d29ybGQ=");

    // Closing beta's write side ends alpha's read loop.
    let closed = beta.call_ok(8, json!({"stream_idx": beta_idx})).await;
    assert_eq!(closed, json!("closeStream success"));
    let complete = alpha.upcall("streamReadComplete").await;
    assert_eq!(complete["stream_idx"].as_u64().unwrap(), alpha_idx);

    // Handle bookkeeping: unknown indices are RPC errors.
    let unknown = beta.call(8, json!({"stream_idx": 999_999})).await;
    assert_eq!(unknown["error"], "internal RPC error: unknown stream_idx");
}

#[tokio::test(flavor = "multi_thread")]
async fn gossip_round_trips_through_the_validator_handshake() {
    let mut alpha = Node::start().await;
    let mut beta = Node::start().await;

    alpha.call_ok(15, json!({})).await;
    beta.call_ok(15, json!({})).await;

    let subscribed = alpha
        .call_ok(3, json!({"topic": "t", "subscription_idx": 7}))
        .await;
    assert_eq!(subscribed, json!("subscribe success"));
    beta.call_ok(3, json!({"topic": "t", "subscription_idx": 8}))
        .await;

    beta.call_ok(14, json!({"multiaddr": alpha.peer_addr()}))
        .await;

    // The mesh needs a few heartbeats before a publish propagates.
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let frame = beta
            .call(2, json!({"topic": "t", "data": "aGVsbG8="}))
            .await;
        if frame.get("error").is_none() {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "publish kept failing: {frame}"
        );
        sleep(Duration::from_millis(500)).await;
    }

    let validate = alpha.upcall("validate").await;
    assert_eq!(validate["subscription_idx"].as_u64().unwrap(), 7);
    assert_eq!(validate["data"], "aGVsbG8=");
    assert_eq!(validate["sender"]["peer_id"], beta.peer_id);
    let validation_seqno = validate["seqno"].as_u64().unwrap();

    let verdict = alpha
        .call_ok(5, json!({"seqno": validation_seqno, "is_valid": true}))
        .await;
    assert_eq!(verdict, json!("validationComplete success"));

    let published = alpha.upcall("publish").await;
    assert_eq!(published["subscription_idx"].as_u64().unwrap(), 7);
    assert_eq!(published["data"], "aGVsbG8=");
    assert_eq!(published["sender"]["peer_id"], beta.peer_id);

    let unsubscribed = alpha.call_ok(4, json!({"subscription_idx": 7})).await;
    assert_eq!(unsubscribed, json!("unsubscribe success"));

    // The registry entry is gone: the same index is now unknown.
    let missing = alpha.call(4, json!({"subscription_idx": 7})).await;
    assert_eq!(missing["error"], "internal RPC error: subscription not found");
}
