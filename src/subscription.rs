//! # Subscription engine
//!
//! One SSE connection per subscriber. The stream first replays a filtered
//! snapshot as `existing` events carrying the changelog high-water mark,
//! then delivers `added` / `changed` / `removed` events derived from the
//! changelog tail, each filtered through the subscriber's effective filter
//! (scope ∧ user filter, fixed at connection time).
//!
//! The stream terminates with a client close, a fatal error, or an
//! `invalidate` event followed by close — the latter whenever the
//! subscriber falls behind (bounded queue overflow), the changelog ring
//! has evicted its resume point, or its session ends.

use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use strum_macros::Display;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::changelog::{BrokerMessage, ChangeOp, ChangelogBroker, ChangelogEntry};
use crate::error::ApiError;
use crate::filter::CompiledFilter;
use crate::models::Record;
use crate::storage::{SelectQuery, StorageDriver, TableHandle};

pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum EventKind {
    Existing,
    Added,
    Changed,
    Removed,
    Invalidate,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SseEvent {
    #[serde(skip)]
    pub kind: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item: Option<Record>,
    pub seq: u64,
}

impl SseEvent {
    pub fn invalidate(seq: u64) -> Self {
        Self { kind: EventKind::Invalidate, item: None, seq }
    }

    /// Renders the wire frame: `event:` / `id:` / `data:` lines followed by
    /// the blank separator line.
    pub fn to_frame(&self) -> String {
        let data = serde_json::to_string(self).unwrap_or_else(|_| json!({}).to_string());
        format!("event: {}\nid: {}\ndata: {}\n\n", self.kind, self.seq, data)
    }
}

/// Heartbeat comment frame; keeps intermediaries from idling the
/// connection out.
pub const HEARTBEAT_FRAME: &str = ": ping\n\n";

/// Derives the subscriber-visible event for one changelog entry. `None`
/// filter is the tautology. Returns `None` when the entry is invisible to
/// this subscriber.
pub fn derive_event(entry: &ChangelogEntry, filter: Option<&CompiledFilter>) -> Option<SseEvent> {
    let matches = |record: &Option<Record>| -> bool {
        match record {
            Some(record) => filter.map(|f| f.matches(record)).unwrap_or(true),
            None => false,
        }
    };
    let match_before = matches(&entry.before);
    let match_after = matches(&entry.after);

    let (kind, item) = match entry.op {
        ChangeOp::Create if match_after => (EventKind::Added, entry.after.clone()),
        ChangeOp::Delete if match_before => (EventKind::Removed, entry.before.clone()),
        ChangeOp::Update => match (match_before, match_after) {
            (true, true) => (EventKind::Changed, entry.after.clone()),
            (false, true) => (EventKind::Added, entry.after.clone()),
            (true, false) => (EventKind::Removed, entry.before.clone()),
            (false, false) => return None,
        },
        _ => return None,
    };
    Some(SseEvent { kind, item, seq: entry.seq })
}

pub struct SubscriptionRequest {
    pub resource: String,
    pub table: TableHandle,
    /// Scope ∧ user filter, already composed. `None` matches everything.
    pub filter: Option<Arc<CompiledFilter>>,
    pub session_id: Option<String>,
    pub cancellation: CancellationToken,
    pub heartbeat: Duration,
}

/// Opens a subscription: snapshots, attaches to the changelog tail and
/// spawns the pump task. The returned receiver yields ready-to-write SSE
/// frames; dropping it cancels the pump.
#[instrument(skip_all, fields(resource = %request.resource))]
pub async fn open(
    driver: Arc<dyn StorageDriver>,
    broker: Arc<ChangelogBroker>,
    request: SubscriptionRequest,
) -> Result<mpsc::Receiver<String>, ApiError> {
    let query = SelectQuery { filter: request.filter.clone(), ..Default::default() };
    let (rows, high_water) = driver.snapshot(&request.table, &query).await?;

    let subscriber = broker
        .subscribe(&request.resource, high_water + 1, request.session_id.clone())
        .await;

    // Frames buffer; the pump blocks here on a slow client, which in turn
    // fills the broker-side queue and triggers the invalidate path.
    let (tx, rx) = mpsc::channel::<String>(64);

    tokio::spawn(pump(request, subscriber, broker, rows, high_water, tx));
    Ok(rx)
}

async fn pump(
    request: SubscriptionRequest,
    subscriber: Option<crate::changelog::Subscriber>,
    broker: Arc<ChangelogBroker>,
    rows: Vec<Record>,
    high_water: u64,
    tx: mpsc::Sender<String>,
) {
    for row in rows {
        let event = SseEvent { kind: EventKind::Existing, item: Some(row), seq: high_water };
        if tx.send(event.to_frame()).await.is_err() {
            return;
        }
    }

    let Some(mut subscriber) = subscriber else {
        // The resume point is already gone; the client must resnapshot.
        let _ = tx.send(SseEvent::invalidate(high_water).to_frame()).await;
        return;
    };

    let mut heartbeat = tokio::time::interval(request.heartbeat);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    heartbeat.tick().await; // first tick completes immediately

    let filter = request.filter.as_deref();
    loop {
        tokio::select! {
            _ = request.cancellation.cancelled() => {
                debug!("Subscription cancelled by client");
                break;
            }
            _ = heartbeat.tick() => {
                if tx.send(HEARTBEAT_FRAME.to_owned()).await.is_err() {
                    break;
                }
            }
            message = subscriber.rx.recv() => {
                match message {
                    Some(BrokerMessage::Entry(entry)) => {
                        // The snapshot already covers anything at or below
                        // the high-water mark.
                        if entry.seq <= high_water {
                            continue;
                        }
                        if let Some(event) = derive_event(&entry, filter) {
                            if tx.send(event.to_frame()).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(BrokerMessage::Invalidate) | None => {
                        let _ = tx.send(SseEvent::invalidate(high_water).to_frame()).await;
                        break;
                    }
                }
            }
        }
    }

    broker.unsubscribe(&subscriber.resource, subscriber.id).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn rec(v: serde_json::Value) -> Record {
        v.as_object().unwrap().clone()
    }

    fn entry(
        seq: u64,
        op: ChangeOp,
        before: Option<serde_json::Value>,
        after: Option<serde_json::Value>,
    ) -> ChangelogEntry {
        ChangelogEntry {
            seq,
            resource: "products".to_owned(),
            record_id: "p1".to_owned(),
            op,
            before: before.map(rec),
            after: after.map(rec),
            user_id: None,
            ts: Utc::now(),
        }
    }

    fn clothing() -> CompiledFilter {
        CompiledFilter::compile("category==\"Clothing\"").unwrap()
    }

    #[test]
    fn create_matching_is_added() {
        let e = entry(7, ChangeOp::Create, None, Some(json!({"category": "Clothing"})));
        let event = derive_event(&e, Some(&clothing())).unwrap();
        assert_eq!(event.kind, EventKind::Added);
        assert_eq!(event.seq, 7);
    }

    #[test]
    fn create_non_matching_is_silent() {
        let e = entry(7, ChangeOp::Create, None, Some(json!({"category": "Electronics"})));
        assert_eq!(derive_event(&e, Some(&clothing())), None);
    }

    #[test]
    fn update_transitions() {
        let filter = clothing();
        let stay = entry(
            1,
            ChangeOp::Update,
            Some(json!({"category": "Clothing", "price": 1})),
            Some(json!({"category": "Clothing", "price": 2})),
        );
        assert_eq!(derive_event(&stay, Some(&filter)).unwrap().kind, EventKind::Changed);

        let enter = entry(
            2,
            ChangeOp::Update,
            Some(json!({"category": "Electronics"})),
            Some(json!({"category": "Clothing"})),
        );
        assert_eq!(derive_event(&enter, Some(&filter)).unwrap().kind, EventKind::Added);

        let leave = entry(
            3,
            ChangeOp::Update,
            Some(json!({"category": "Clothing"})),
            Some(json!({"category": "Electronics"})),
        );
        let event = derive_event(&leave, Some(&filter)).unwrap();
        assert_eq!(event.kind, EventKind::Removed);
        assert_eq!(event.item.unwrap()["category"], "Clothing");

        let outside = entry(
            4,
            ChangeOp::Update,
            Some(json!({"category": "Books"})),
            Some(json!({"category": "Electronics"})),
        );
        assert_eq!(derive_event(&outside, Some(&filter)), None);
    }

    #[test]
    fn delete_matching_is_removed() {
        let e = entry(9, ChangeOp::Delete, Some(json!({"category": "Clothing"})), None);
        assert_eq!(derive_event(&e, Some(&clothing())).unwrap().kind, EventKind::Removed);
    }

    #[test]
    fn tautology_filter_sees_everything() {
        let e = entry(1, ChangeOp::Create, None, Some(json!({"category": "X"})));
        assert_eq!(derive_event(&e, None).unwrap().kind, EventKind::Added);
    }

    #[test]
    fn frame_rendering() {
        let event = SseEvent {
            kind: EventKind::Added,
            item: Some(rec(json!({"id": "p1"}))),
            seq: 17,
        };
        let frame = event.to_frame();
        assert!(frame.starts_with("event: added\nid: 17\ndata: "));
        assert!(frame.ends_with("\n\n"));
        let data: serde_json::Value =
            serde_json::from_str(frame.lines().nth(2).unwrap().trim_start_matches("data: "))
                .unwrap();
        assert_eq!(data["seq"], 17);
        assert_eq!(data["item"]["id"], "p1");
    }
}
