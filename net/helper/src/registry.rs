//! The three shared registries: gossip subscriptions, in-flight validator
//! handshakes, and open byte streams. Each map carries its own lock because
//! upcall-producing tasks mutate them concurrently with the dispatcher.

use std::collections::HashMap;
use std::sync::Arc;

use coda_p2p::{PeerId, Stream};
use futures::io::WriteHalf;
use libp2p::gossipsub::TopicHash;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio_util::sync::CancellationToken;

/// A gossip message that survived validation and awaits its `publish` upcall.
#[derive(Debug)]
pub struct DeliveredGossip {
    pub sender: PeerId,
    pub data: Vec<u8>,
}

pub struct SubscriptionRecord {
    pub topic: String,
    pub topic_hash: TopicHash,
    pub deliveries: mpsc::Sender<DeliveredGossip>,
    /// Per-topic validator concurrency bound.
    pub validation_slots: Arc<Semaphore>,
    pub cancel: CancellationToken,
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: Mutex<HashMap<u64, SubscriptionRecord>>,
}

impl SubscriptionRegistry {
    /// Registers `record` under `idx`, returning any record it displaces.
    pub fn insert(&self, idx: u64, record: SubscriptionRecord) -> Option<SubscriptionRecord> {
        self.entries.lock().insert(idx, record)
    }

    pub fn remove(&self, idx: u64) -> Option<SubscriptionRecord> {
        self.entries.lock().remove(&idx)
    }

    /// Finds the subscription for a topic, yielding its index, a delivery
    /// handle, and its validator slots.
    pub fn find_by_topic(
        &self,
        topic: &TopicHash,
    ) -> Option<(u64, mpsc::Sender<DeliveredGossip>, Arc<Semaphore>)> {
        self.entries
            .lock()
            .iter()
            .find(|(_, record)| record.topic_hash == *topic)
            .map(|(idx, record)| {
                (
                    *idx,
                    record.deliveries.clone(),
                    record.validation_slots.clone(),
                )
            })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[derive(Default)]
pub struct ValidatorRegistry {
    entries: Mutex<HashMap<u64, oneshot::Sender<bool>>>,
}

impl ValidatorRegistry {
    pub fn insert(&self, seqno: u64, verdict: oneshot::Sender<bool>) {
        self.entries.lock().insert(seqno, verdict);
    }

    /// Delivers a verdict. Returns false when the seqno is unknown. A verdict
    /// whose validator already timed out is silently discarded; the slot is
    /// freed either way.
    pub fn complete(&self, seqno: u64, is_valid: bool) -> bool {
        match self.entries.lock().remove(&seqno) {
            Some(verdict) => {
                let _ = verdict.send(is_valid);
                true
            }
            None => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

pub struct StreamRecord {
    /// Write half, shared so sends and closes serialize per stream without
    /// holding the registry lock across I/O.
    pub write: Arc<tokio::sync::Mutex<WriteHalf<Stream>>>,
    pub cancel: CancellationToken,
}

#[derive(Default)]
pub struct StreamRegistry {
    entries: Mutex<HashMap<u64, StreamRecord>>,
}

impl StreamRegistry {
    pub fn insert(&self, idx: u64, record: StreamRecord) {
        self.entries.lock().insert(idx, record);
    }

    pub fn remove(&self, idx: u64) -> Option<StreamRecord> {
        self.entries.lock().remove(&idx)
    }

    pub fn writer(&self, idx: u64) -> Option<Arc<tokio::sync::Mutex<WriteHalf<Stream>>>> {
        self.entries.lock().get(&idx).map(|record| record.write.clone())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validator_slots_are_single_use() {
        let registry = ValidatorRegistry::default();
        let (tx, mut rx) = oneshot::channel();
        registry.insert(4, tx);

        assert!(registry.complete(4, true));
        assert!(matches!(rx.try_recv(), Ok(true)));

        // Slot is gone; a second verdict is an unknown seqno.
        assert!(!registry.complete(4, false));
        assert!(registry.is_empty());
    }

    #[test]
    fn late_verdict_after_receiver_drop_is_discarded() {
        let registry = ValidatorRegistry::default();
        let (tx, rx) = oneshot::channel();
        registry.insert(9, tx);
        drop(rx);

        // The waiting validator gave up; the verdict still succeeds.
        assert!(registry.complete(9, true));
        assert!(registry.is_empty());
    }

    #[test]
    fn subscriptions_are_looked_up_by_topic() {
        let registry = SubscriptionRegistry::default();
        let (tx, _rx) = mpsc::channel(1);
        let hash = TopicHash::from_raw("blocks");
        registry.insert(
            7,
            SubscriptionRecord {
                topic: "blocks".into(),
                topic_hash: hash.clone(),
                deliveries: tx,
                validation_slots: Arc::new(Semaphore::new(32)),
                cancel: CancellationToken::new(),
            },
        );

        let (idx, _, _) = registry.find_by_topic(&hash).expect("registered");
        assert_eq!(idx, 7);
        assert!(registry.find_by_topic(&TopicHash::from_raw("votes")).is_none());

        assert!(registry.remove(7).is_some());
        assert!(registry.remove(7).is_none());
        assert!(registry.is_empty());
    }
}
