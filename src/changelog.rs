//! # Changelog
//!
//! The append-only sequence of committed mutations. Drivers generate the
//! sequence inside the write transaction; after commit the pipeline hands
//! the entry to the in-process [`ChangelogBroker`], which maintains a
//! per-resource ring of recent entries plus the set of live subscribers.
//!
//! Concurrency discipline: appends take a short critical section that
//! updates the ring and snapshots the current subscribers; fan-out happens
//! outside the lock through bounded, non-blocking sends. A subscriber whose
//! queue is full is handed a single `invalidate` and dropped — producers
//! never block on slow consumers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use strum_macros::{Display, EnumString};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, instrument, warn};

use crate::models::Record;

/// Bounded outbound queue per subscriber.
pub const SUBSCRIBER_QUEUE_CAPACITY: usize = 1000;

/// Entries retained per resource for tail replay.
pub const DEFAULT_RING_CAPACITY: usize = 4096;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ChangeOp {
    Create,
    Update,
    Delete,
}

/// One committed mutation. Immutable once written; `seq` is monotonic per
/// deployment and never skips a committed write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangelogEntry {
    pub seq: u64,
    pub resource: String,
    pub record_id: String,
    pub op: ChangeOp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<Record>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<Record>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub ts: DateTime<Utc>,
}

/// What a subscriber's queue carries.
#[derive(Debug, Clone)]
pub enum BrokerMessage {
    Entry(Arc<ChangelogEntry>),
    /// The subscriber fell behind or its session ended; it must resnapshot.
    Invalidate,
}

struct SubscriberSlot {
    tx: mpsc::Sender<BrokerMessage>,
    session_id: Option<String>,
}

#[derive(Default)]
struct ResourceLog {
    ring: VecDeque<Arc<ChangelogEntry>>,
    subscribers: HashMap<u64, SubscriberSlot>,
    next_subscriber_id: u64,
    last_seq: u64,
}

/// Handle owned by one subscription stream. Receives ring replay first,
/// then live entries. Explicitly detached via [`ChangelogBroker::unsubscribe`];
/// a dropped receiver is also reaped on the next publish.
pub struct Subscriber {
    pub resource: String,
    pub id: u64,
    pub rx: mpsc::Receiver<BrokerMessage>,
}

pub struct ChangelogBroker {
    resources: Mutex<HashMap<String, ResourceLog>>,
    ring_capacity: usize,
}

impl Default for ChangelogBroker {
    fn default() -> Self {
        Self::new(DEFAULT_RING_CAPACITY)
    }
}

impl ChangelogBroker {
    pub fn new(ring_capacity: usize) -> Self {
        Self { resources: Mutex::new(HashMap::new()), ring_capacity: ring_capacity.max(1) }
    }

    /// Publishes a committed entry: ring append + subscriber snapshot under
    /// the lock, fan-out outside it.
    #[instrument(skip_all, fields(resource = %entry.resource, seq = entry.seq))]
    pub async fn publish(&self, entry: Arc<ChangelogEntry>) {
        let targets: Vec<(u64, mpsc::Sender<BrokerMessage>)> = {
            let mut resources = self.resources.lock().await;
            let log = resources.entry(entry.resource.clone()).or_default();
            log.last_seq = log.last_seq.max(entry.seq);
            log.ring.push_back(entry.clone());
            while log.ring.len() > self.ring_capacity {
                log.ring.pop_front();
            }
            log.subscribers
                .iter()
                .map(|(id, slot)| (*id, slot.tx.clone()))
                .collect()
        };

        let mut stale = Vec::new();
        for (id, tx) in targets {
            match tx.try_send(BrokerMessage::Entry(entry.clone())) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // Slow consumer: one invalidate, then it is gone. The
                    // reserved capacity slot keeps this send from racing.
                    warn!(subscriber_id = id, "Subscriber queue full; invalidating");
                    let _ = tx.try_send(BrokerMessage::Invalidate);
                    stale.push(id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(subscriber_id = id, "Subscriber gone; removing");
                    stale.push(id);
                }
            }
        }

        if !stale.is_empty() {
            let mut resources = self.resources.lock().await;
            if let Some(log) = resources.get_mut(&entry.resource) {
                for id in stale {
                    log.subscribers.remove(&id);
                }
            }
        }
    }

    /// Attaches a subscriber to the tail starting at `from_seq`. Ring
    /// entries with `seq >= from_seq` are replayed into the fresh queue
    /// before any live entry. When the ring has already evicted `from_seq`
    /// the gap is unbridgeable and this returns `None`; the caller emits
    /// `invalidate` and closes.
    pub async fn subscribe(
        &self,
        resource: &str,
        from_seq: u64,
        session_id: Option<String>,
    ) -> Option<Subscriber> {
        // One extra slot so an overflowing subscriber can still be handed
        // its invalidate.
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY + 1);

        let mut resources = self.resources.lock().await;
        let log = resources.entry(resource.to_owned()).or_default();

        let oldest_retained = log.ring.front().map(|e| e.seq);
        if let Some(oldest) = oldest_retained {
            if from_seq < oldest {
                return None;
            }
        } else if log.last_seq >= from_seq {
            // Everything since from_seq has been evicted.
            return None;
        }

        for entry in log.ring.iter().filter(|e| e.seq >= from_seq) {
            // Cannot fail: the queue is fresh and the ring is smaller than
            // its capacity in any sane configuration; an overflow here is a
            // slow consumer before it even started.
            if tx.try_send(BrokerMessage::Entry(entry.clone())).is_err() {
                return None;
            }
        }

        let id = log.next_subscriber_id;
        log.next_subscriber_id += 1;
        log.subscribers.insert(id, SubscriberSlot { tx, session_id });
        debug!(resource, subscriber_id = id, from_seq, "New changelog subscriber");
        Some(Subscriber { resource: resource.to_owned(), id, rx })
    }

    pub async fn unsubscribe(&self, resource: &str, id: u64) {
        let mut resources = self.resources.lock().await;
        if let Some(log) = resources.get_mut(resource) {
            log.subscribers.remove(&id);
        }
    }

    /// Session-end cascade: every stream pinned to the session receives
    /// `invalidate` and is detached.
    pub async fn invalidate_session(&self, session_id: &str) {
        let mut resources = self.resources.lock().await;
        for log in resources.values_mut() {
            log.subscribers.retain(|_, slot| {
                if slot.session_id.as_deref() == Some(session_id) {
                    let _ = slot.tx.try_send(BrokerMessage::Invalidate);
                    false
                } else {
                    true
                }
            });
        }
    }

    pub async fn subscriber_count(&self, resource: &str) -> usize {
        self.resources
            .lock()
            .await
            .get(resource)
            .map(|log| log.subscribers.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn entry(seq: u64, resource: &str) -> Arc<ChangelogEntry> {
        Arc::new(ChangelogEntry {
            seq,
            resource: resource.to_owned(),
            record_id: format!("r{seq}"),
            op: ChangeOp::Create,
            before: None,
            after: None,
            user_id: None,
            ts: Utc::now(),
        })
    }

    #[tokio::test]
    async fn delivers_in_seq_order() {
        let broker = ChangelogBroker::default();
        broker.publish(entry(1, "users")).await;
        broker.publish(entry(2, "users")).await;

        let mut sub = broker.subscribe("users", 1, None).await.unwrap();
        broker.publish(entry(3, "users")).await;

        let mut seqs = Vec::new();
        for _ in 0..3 {
            match sub.rx.recv().await.unwrap() {
                BrokerMessage::Entry(e) => seqs.push(e.seq),
                BrokerMessage::Invalidate => panic!("unexpected invalidate"),
            }
        }
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn replay_respects_high_water_mark() {
        let broker = ChangelogBroker::default();
        broker.publish(entry(1, "users")).await;
        broker.publish(entry(2, "users")).await;

        // A snapshot taken at seq 2 resumes at 3: nothing replays.
        let mut sub = broker.subscribe("users", 3, None).await.unwrap();
        broker.publish(entry(3, "users")).await;
        match sub.rx.recv().await.unwrap() {
            BrokerMessage::Entry(e) => assert_eq!(e.seq, 3),
            BrokerMessage::Invalidate => panic!("unexpected invalidate"),
        }
    }

    #[tokio::test]
    async fn evicted_tail_is_a_gap() {
        let broker = ChangelogBroker::new(2);
        for seq in 1..=5 {
            broker.publish(entry(seq, "users")).await;
        }
        assert!(broker.subscribe("users", 2, None).await.is_none());
        assert!(broker.subscribe("users", 4, None).await.is_some());
    }

    #[tokio::test]
    async fn resources_are_isolated() {
        let broker = ChangelogBroker::default();
        let mut users = broker.subscribe("users", 1, None).await.unwrap();
        let _orders = broker.subscribe("orders", 1, None).await.unwrap();

        broker.publish(entry(1, "orders")).await;
        broker.publish(entry(1, "users")).await;

        match users.rx.recv().await.unwrap() {
            BrokerMessage::Entry(e) => assert_eq!(e.resource, "users"),
            BrokerMessage::Invalidate => panic!("unexpected invalidate"),
        }
    }

    #[tokio::test]
    async fn session_invalidation_cascades() {
        let broker = ChangelogBroker::default();
        let mut pinned = broker
            .subscribe("users", 1, Some("sess-1".to_owned()))
            .await
            .unwrap();
        let _other = broker.subscribe("users", 1, None).await.unwrap();

        broker.invalidate_session("sess-1").await;
        assert!(matches!(pinned.rx.recv().await.unwrap(), BrokerMessage::Invalidate));
        assert_eq!(broker.subscriber_count("users").await, 1);
    }

    #[tokio::test]
    async fn dropped_subscriber_is_reaped_on_publish() {
        let broker = ChangelogBroker::default();
        let sub = broker.subscribe("users", 1, None).await.unwrap();
        drop(sub);
        broker.publish(entry(1, "users")).await;
        assert_eq!(broker.subscriber_count("users").await, 0);
    }
}
