//! Gossip pub/sub: publish, the subscription lifecycle, and the validator
//! handshake that lets the parent veto message propagation.

use std::sync::Arc;
use std::time::Duration;

use coda_p2p::{GossipMessage, Helper, MessageAcceptance, PeerId};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::app::App;
use crate::codec;
use crate::error::{bad_p2p, bad_rpc, RpcError};
use crate::peer::PeerInfo;
use crate::registry::{DeliveredGossip, SubscriptionRecord};

/// Deadline for the parent to answer a `validate` upcall.
const VALIDATION_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// In-flight validator handshakes allowed per topic.
const VALIDATOR_CONCURRENCY: usize = 32;

/// Buffered messages per subscription between validation and delivery.
const DELIVERY_BACKLOG: usize = 64;

#[derive(Debug, Serialize)]
struct ValidateUpcall {
    sender: Option<PeerInfo>,
    data: String,
    seqno: u64,
    upcall: &'static str,
    subscription_idx: u64,
}

#[derive(Debug, Serialize)]
struct PublishUpcall {
    upcall: &'static str,
    subscription_idx: u64,
    data: String,
    sender: Option<PeerInfo>,
}

#[derive(Debug, Deserialize)]
pub struct PublishMsg {
    pub topic: String,
    pub data: String,
}

impl PublishMsg {
    pub async fn run(self, app: &Arc<App>) -> Result<Value, RpcError> {
        let helper = app.pubsub_helper()?;
        let data = codec::decode(&self.data).map_err(bad_rpc)?;
        helper.publish(self.topic, data).await.map_err(bad_p2p)?;
        Ok(json!("publish success"))
    }
}

#[derive(Debug, Deserialize)]
pub struct SubscribeMsg {
    pub topic: String,
    #[serde(rename = "subscription_idx")]
    pub subscription: u64,
}

impl SubscribeMsg {
    pub async fn run(self, app: &Arc<App>) -> Result<Value, RpcError> {
        let helper = app.pubsub_helper()?;
        helper
            .subscribe(self.topic.clone())
            .await
            .map_err(bad_p2p)?;

        let (deliveries_tx, deliveries_rx) = mpsc::channel(DELIVERY_BACKLOG);
        let cancel = CancellationToken::new();
        let record = SubscriptionRecord {
            topic: self.topic.clone(),
            topic_hash: libp2p::gossipsub::IdentTopic::new(self.topic).hash(),
            deliveries: deliveries_tx,
            validation_slots: Arc::new(Semaphore::new(VALIDATOR_CONCURRENCY)),
            cancel: cancel.clone(),
        };
        if let Some(displaced) = app.subs.insert(self.subscription, record) {
            displaced.cancel.cancel();
        }
        spawn_delivery_task(app.clone(), self.subscription, deliveries_rx, cancel);

        Ok(json!("subscribe success"))
    }
}

/// Emits a `publish` upcall for every validated message until the
/// subscription is torn down.
fn spawn_delivery_task(
    app: Arc<App>,
    subscription_idx: u64,
    mut deliveries: mpsc::Receiver<DeliveredGossip>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            let delivered = tokio::select! {
                _ = cancel.cancelled() => break,
                delivered = deliveries.recv() => match delivered {
                    Some(delivered) => delivered,
                    None => break,
                },
            };
            let sender = match app.find_peer_info(delivered.sender).await {
                Ok(info) => Some(info),
                Err(err) if app.unsafe_no_trust_ip() => {
                    debug!(%err, "delivering with unresolved sender");
                    None
                }
                Err(err) => {
                    error!(
                        peer = %delivered.sender.to_base58(),
                        %err,
                        "dropping validated message from unresolvable peer"
                    );
                    continue;
                }
            };
            app.writer
                .must_write(&PublishUpcall {
                    upcall: "publish",
                    subscription_idx,
                    data: codec::encode(&delivered.data),
                    sender,
                })
                .await;
        }
    });
}

/// Routes inbound gossip through the validator handshake. One long-lived
/// router drains the helper's channel; each message is handled in its own
/// task under the concurrency bound.
pub fn spawn_validation_router(
    app: Arc<App>,
    helper: Arc<Helper>,
    mut gossip: mpsc::Receiver<GossipMessage>,
) {
    tokio::spawn(async move {
        while let Some(message) = gossip.recv().await {
            let app = app.clone();
            let helper = helper.clone();
            tokio::spawn(validate_message(app, helper, message));
        }
    });
}

async fn validate_message(app: Arc<App>, helper: Arc<Helper>, message: GossipMessage) {
    // Messages from ourselves are valid by definition.
    if message.propagation_source == helper.local_peer_id() {
        helper
            .report_validation(
                message.message_id,
                message.propagation_source,
                MessageAcceptance::Accept,
            )
            .await;
        return;
    }

    let Some((subscription_idx, deliveries, slots)) = app.subs.find_by_topic(&message.topic)
    else {
        debug!(topic = %message.topic, "gossip for unknown subscription");
        helper
            .report_validation(
                message.message_id,
                message.propagation_source,
                MessageAcceptance::Ignore,
            )
            .await;
        return;
    };
    let _permit = slots.acquire_owned().await.expect("validator slots closed");

    let seqno = app.seq.next();
    let sender = match app.find_peer_info(message.propagation_source).await {
        Ok(info) => Some(info),
        Err(err) if app.unsafe_no_trust_ip() => {
            debug!(%err, "validating with unresolved sender");
            None
        }
        Err(err) => {
            error!(
                peer = %message.propagation_source.to_base58(),
                %err,
                "failed to resolve pubsub sender, rejecting message"
            );
            helper
                .report_validation(
                    message.message_id,
                    message.propagation_source,
                    MessageAcceptance::Reject,
                )
                .await;
            return;
        }
    };

    let acceptance = run_validator_handshake(
        &app,
        subscription_idx,
        &deliveries,
        sender,
        message.propagation_source,
        &message.data,
    )
    .await;
    helper
        .report_validation(message.message_id, message.propagation_source, acceptance)
        .await;
}

/// Allocates a validator seqno, emits the `validate` upcall, and waits for
/// the parent's verdict under the pub/sub deadline. Accepted messages are
/// queued for their `publish` upcall.
async fn run_validator_handshake(
    app: &Arc<App>,
    subscription_idx: u64,
    deliveries: &mpsc::Sender<DeliveredGossip>,
    sender: Option<PeerInfo>,
    propagation_source: PeerId,
    data: &[u8],
) -> MessageAcceptance {
    let seqno = app.seq.next();
    let (verdict_tx, verdict_rx) = oneshot::channel();
    app.validators.insert(seqno, verdict_tx);
    app.writer
        .must_write(&ValidateUpcall {
            sender,
            data: codec::encode(data),
            seqno,
            upcall: "validate",
            subscription_idx,
        })
        .await;

    let acceptance = match tokio::time::timeout(VALIDATION_TIMEOUT, verdict_rx).await {
        Ok(Ok(true)) => MessageAcceptance::Accept,
        Ok(Ok(false)) => {
            debug!(seqno, "parent rejected message");
            MessageAcceptance::Reject
        }
        Ok(Err(_)) => {
            // Verdict slot torn down underneath us; treat as a rejection.
            MessageAcceptance::Reject
        }
        Err(_) => {
            // The registry entry stays: the parent does not care about our
            // deadline and its late verdict must still be absorbed.
            warn!(seqno, "validation timed out");
            if app.unsafe_no_trust_ip() {
                MessageAcceptance::Accept
            } else {
                MessageAcceptance::Reject
            }
        }
    };

    if matches!(acceptance, MessageAcceptance::Accept) {
        let _ = deliveries
            .send(DeliveredGossip {
                sender: propagation_source,
                data: data.to_vec(),
            })
            .await;
    }
    acceptance
}

#[derive(Debug, Deserialize)]
pub struct UnsubscribeMsg {
    #[serde(rename = "subscription_idx")]
    pub subscription: u64,
}

impl UnsubscribeMsg {
    pub async fn run(self, app: &Arc<App>) -> Result<Value, RpcError> {
        let helper = app.helper()?;
        let Some(record) = app.subs.remove(self.subscription) else {
            return Err(bad_rpc("subscription not found"));
        };
        record.cancel.cancel();
        helper.unsubscribe(record.topic).await.map_err(bad_p2p)?;
        Ok(json!("unsubscribe success"))
    }
}

#[derive(Debug, Deserialize)]
pub struct ValidationCompleteMsg {
    pub seqno: u64,
    pub is_valid: bool,
}

impl ValidationCompleteMsg {
    pub async fn run(self, app: &Arc<App>) -> Result<Value, RpcError> {
        app.helper()?;
        if app.validators.complete(self.seqno, self.is_valid) {
            Ok(json!("validationComplete success"))
        } else {
            Err(bad_rpc("validation seqno unknown"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::MsgWriter;
    use coda_p2p::{generate_keypair, HelperConfig};
    use tokio::io::{AsyncBufReadExt, BufReader};

    fn spawn_test_helper(statedir: &std::path::Path) -> Arc<Helper> {
        Helper::spawn(HelperConfig {
            state_dir: statedir.join("state"),
            keypair: generate_keypair(),
            network_id: "validator-test".into(),
            listen_on: Vec::new(),
            external_addr: "/ip4/127.0.0.1/tcp/1".parse().unwrap(),
            filters: Default::default(),
        })
        .expect("helper boots")
    }

    #[tokio::test(start_paused = true)]
    async fn late_verdict_after_deadline_is_absorbed_without_duplicate_publish() {
        let statedir = tempfile::tempdir().unwrap();
        let (output, output_feed) = tokio::io::duplex(64 * 1024);
        let app = App::new(Arc::new(MsgWriter::new(output)));
        app.set_helper(spawn_test_helper(statedir.path()));

        let (deliveries_tx, mut deliveries_rx) = mpsc::channel(8);
        let peer = PeerId::random();
        let handshake = {
            let app = app.clone();
            tokio::spawn(async move {
                run_validator_handshake(&app, 7, &deliveries_tx, None, peer, b"hello").await
            })
        };

        let mut lines = BufReader::new(output_feed).lines();
        let upcall: Value =
            serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(upcall["upcall"], "validate");
        assert_eq!(upcall["subscription_idx"], 7);
        assert_eq!(upcall["data"], "aGVsbG8=");
        let seqno = upcall["seqno"].as_u64().unwrap();

        // Withhold the verdict until the deadline has passed.
        tokio::time::advance(VALIDATION_TIMEOUT + Duration::from_secs(1)).await;
        let acceptance = handshake.await.unwrap();
        assert!(matches!(acceptance, MessageAcceptance::Reject));
        assert!(
            deliveries_rx.try_recv().is_err(),
            "a timed-out validation must not deliver"
        );
        assert!(
            !app.validators.is_empty(),
            "the verdict slot survives the deadline"
        );

        // The late verdict is still absorbed: the call succeeds, the slot is
        // freed, and no duplicate publish shows up.
        let late = ValidationCompleteMsg { seqno, is_valid: true }
            .run(&app)
            .await
            .unwrap();
        assert_eq!(late, json!("validationComplete success"));
        assert!(app.validators.is_empty());
        assert!(deliveries_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn prompt_verdict_resolves_before_the_deadline() {
        let statedir = tempfile::tempdir().unwrap();
        let (output, output_feed) = tokio::io::duplex(64 * 1024);
        let app = App::new(Arc::new(MsgWriter::new(output)));
        app.set_helper(spawn_test_helper(statedir.path()));

        let (deliveries_tx, mut deliveries_rx) = mpsc::channel(8);
        let peer = PeerId::random();
        let handshake = {
            let app = app.clone();
            tokio::spawn(async move {
                run_validator_handshake(&app, 3, &deliveries_tx, None, peer, b"hi").await
            })
        };

        let mut lines = BufReader::new(output_feed).lines();
        let upcall: Value =
            serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        let seqno = upcall["seqno"].as_u64().unwrap();

        let verdict = ValidationCompleteMsg { seqno, is_valid: true }
            .run(&app)
            .await
            .unwrap();
        assert_eq!(verdict, json!("validationComplete success"));

        let acceptance = handshake.await.unwrap();
        assert!(matches!(acceptance, MessageAcceptance::Accept));
        let delivered = deliveries_rx.try_recv().expect("accepted message queued");
        assert_eq!(delivered.sender, peer);
        assert_eq!(delivered.data, b"hi");
        assert!(app.validators.is_empty(), "verdict slot is single-use");
    }
}
