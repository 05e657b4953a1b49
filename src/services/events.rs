//! Versioned event bus for job lifecycle notifications.
//!
//! Every published event is stamped with the next value of a single global
//! counter, so versions are strictly increasing and gapless across all event
//! types. A client holding `last_version = v` can ask for everything after
//! `v` with one number; the bus retains a bounded history window to answer
//! those reconciliation requests and signals truncation when the window has
//! been exceeded.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Domain event payloads, discriminated by the `type` tag on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum DomainEvent {
    /// A caution card was accepted and queued for OCR.
    JobQueued {
        job_id: Uuid,
        original_filename: String,
        submitted_by: String,
    },
    /// A worker claimed the job.
    JobProcessing { job_id: Uuid },
    /// Stage update while a job is being processed.
    JobProgress {
        job_id: Uuid,
        stage: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// OCR and persistence finished.
    JobCompleted {
        job_id: Uuid,
        review_item_id: Uuid,
        attachment_id: Uuid,
        is_orphaned: bool,
    },
    /// The job ended in the terminal failed state.
    JobFailed { job_id: Uuid, error: String },
    /// An orphaned review item was attached to a patient.
    ReviewItemLinked {
        review_item_id: Uuid,
        patient_internal_id: Uuid,
        updated_by: String,
    },
}

impl DomainEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            DomainEvent::JobQueued { .. } => "job_queued",
            DomainEvent::JobProcessing { .. } => "job_processing",
            DomainEvent::JobProgress { .. } => "job_progress",
            DomainEvent::JobCompleted { .. } => "job_completed",
            DomainEvent::JobFailed { .. } => "job_failed",
            DomainEvent::ReviewItemLinked { .. } => "review_item_linked",
        }
    }
}

/// Event envelope. Serializes to `{type, version, timestamp, data}`; the
/// payload's adjacent tagging supplies `type` and `data`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    #[serde(flatten)]
    pub payload: DomainEvent,
    pub version: u64,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn event_type(&self) -> &'static str {
        self.payload.event_type()
    }
}

/// Reconciliation window exceeded: events between the client's cursor and
/// `oldest_retained` have been evicted. The client needs a full resync.
#[derive(Debug, thiserror::Error, PartialEq)]
#[error("event history truncated: oldest retained version is {oldest_retained}, current is {current_version}")]
pub struct HistoryTruncatedError {
    pub oldest_retained: u64,
    pub current_version: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileResponse {
    pub events: Vec<Event>,
    pub current_version: u64,
}

struct BusState {
    next_version: u64,
    history: VecDeque<Event>,
    /// Highest version dropped from history; 0 when nothing has been evicted.
    evicted_through: u64,
}

/// Broadcast-based event bus with a single global version counter.
///
/// Counter increment, history append, and the broadcast send happen under
/// one lock, so subscribers observe versions in order and the sequence has
/// no gaps even with many concurrent publishers.
pub struct EventBus {
    state: Mutex<BusState>,
    tx: broadcast::Sender<Event>,
    history_limit: usize,
}

impl EventBus {
    pub fn new(history_limit: usize) -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            state: Mutex::new(BusState {
                next_version: 0,
                history: VecDeque::new(),
                evicted_through: 0,
            }),
            tx,
            history_limit,
        }
    }

    /// Assign the next version, record the event, and broadcast it to all
    /// live subscribers. Publishers never mint their own version numbers.
    pub fn publish(&self, payload: DomainEvent) -> Event {
        let mut state = self.state.lock().expect("event bus lock poisoned");

        state.next_version += 1;
        let event = Event {
            payload,
            version: state.next_version,
            timestamp: Utc::now(),
        };

        state.history.push_back(event.clone());
        while state.history.len() > self.history_limit {
            if let Some(evicted) = state.history.pop_front() {
                state.evicted_through = evicted.version;
            }
        }

        tracing::debug!(
            event_type = event.event_type(),
            version = event.version,
            subscribers = self.tx.receiver_count(),
            "event published"
        );

        // No subscribers is fine; history still answers reconciliation.
        let _ = self.tx.send(event.clone());

        event
    }

    /// Subscribe to live events. Each receiver gets an independent stream.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn current_version(&self) -> u64 {
        self.state.lock().expect("event bus lock poisoned").next_version
    }

    /// Return all retained events with `version > since_version` whose type
    /// is in `types` (empty slice or `"*"` matches everything), ascending.
    ///
    /// Fails with [`HistoryTruncatedError`] when the client's cursor predates
    /// the retention window. A quiet gap would be worse than a full resync.
    pub fn reconcile(
        &self,
        since_version: u64,
        types: &[String],
    ) -> Result<ReconcileResponse, HistoryTruncatedError> {
        let state = self.state.lock().expect("event bus lock poisoned");

        if since_version < state.evicted_through {
            return Err(HistoryTruncatedError {
                oldest_retained: state.evicted_through + 1,
                current_version: state.next_version,
            });
        }

        let events = state
            .history
            .iter()
            .filter(|e| e.version > since_version && type_matches(types, e.event_type()))
            .cloned()
            .collect();

        Ok(ReconcileResponse {
            events,
            current_version: state.next_version,
        })
    }
}

/// Wildcard-aware subscription match.
pub fn type_matches(types: &[String], event_type: &str) -> bool {
    types.is_empty() || types.iter().any(|t| t == "*" || t == event_type)
}

/// Messages a client sends over the event socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe { event_types: Vec<String> },
    Unsubscribe { event_types: Vec<String> },
    ReconciliationRequest {
        last_version: u64,
        event_types: Vec<String>,
    },
}

/// Control frames the server sends beside live [`Event`]s.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    SubscriptionConfirmed {
        event_types: Vec<String>,
        current_version: u64,
    },
    UnsubscriptionConfirmed { event_types: Vec<String> },
    ReconciliationResponse {
        events: Vec<Event>,
        current_version: u64,
    },
    ReconciliationTruncated {
        oldest_retained: u64,
        current_version: u64,
    },
}

/// Everything the server can send: control frames or live events. Control
/// tags and event tags are disjoint, so untagged deserialization is
/// unambiguous.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Control(ControlMessage),
    Event(Event),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queued(n: u32) -> DomainEvent {
        DomainEvent::JobQueued {
            job_id: Uuid::nil(),
            original_filename: format!("card-{n}.png"),
            submitted_by: "tech".to_string(),
        }
    }

    #[test]
    fn versions_are_strictly_increasing_and_gapless() {
        let bus = EventBus::new(100);
        let versions: Vec<u64> = (0..10).map(|n| bus.publish(queued(n)).version).collect();
        assert_eq!(versions, (1..=10).collect::<Vec<u64>>());
        assert_eq!(bus.current_version(), 10);
    }

    #[tokio::test]
    async fn subscribers_receive_events_in_version_order() {
        let bus = EventBus::new(100);
        let mut rx = bus.subscribe();

        bus.publish(queued(1));
        bus.publish(DomainEvent::JobProcessing { job_id: Uuid::nil() });

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.version, 1);
        assert_eq!(second.version, 2);
        assert_eq!(second.event_type(), "job_processing");
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let bus = EventBus::new(10);
        let event = bus.publish(queued(1));
        assert_eq!(event.version, 1);
    }

    #[test]
    fn reconcile_returns_events_after_cursor_in_order() {
        let bus = EventBus::new(100);
        for n in 0..15 {
            bus.publish(queued(n));
        }

        let resp = bus.reconcile(10, &[]).unwrap();
        assert_eq!(resp.current_version, 15);
        assert_eq!(
            resp.events.iter().map(|e| e.version).collect::<Vec<_>>(),
            vec![11, 12, 13, 14, 15]
        );
    }

    #[test]
    fn reconcile_is_idempotent() {
        let bus = EventBus::new(100);
        for n in 0..5 {
            bus.publish(queued(n));
        }

        let first = bus.reconcile(2, &[]).unwrap();
        let second = bus.reconcile(2, &[]).unwrap();
        assert_eq!(first.events, second.events);
        assert_eq!(first.current_version, second.current_version);
    }

    #[test]
    fn reconcile_filters_by_type_and_wildcard() {
        let bus = EventBus::new(100);
        bus.publish(queued(1));
        bus.publish(DomainEvent::JobProcessing { job_id: Uuid::nil() });
        bus.publish(DomainEvent::JobFailed {
            job_id: Uuid::nil(),
            error: "decode error".to_string(),
        });

        let only_failed = bus
            .reconcile(0, &["job_failed".to_string()])
            .unwrap();
        assert_eq!(only_failed.events.len(), 1);
        assert_eq!(only_failed.events[0].event_type(), "job_failed");

        let wildcard = bus.reconcile(0, &["*".to_string()]).unwrap();
        assert_eq!(wildcard.events.len(), 3);
    }

    #[test]
    fn reconcile_from_current_version_is_empty() {
        let bus = EventBus::new(100);
        bus.publish(queued(1));
        let resp = bus.reconcile(1, &[]).unwrap();
        assert!(resp.events.is_empty());
        assert_eq!(resp.current_version, 1);
    }

    #[test]
    fn reconcile_past_retention_window_signals_truncation() {
        let bus = EventBus::new(3);
        for n in 0..10 {
            bus.publish(queued(n));
        }

        // Versions 1..=7 evicted; a cursor inside the evicted range must
        // not get a quiet gap.
        let err = bus.reconcile(2, &[]).unwrap_err();
        assert_eq!(err.oldest_retained, 8);
        assert_eq!(err.current_version, 10);

        // A cursor at the eviction boundary is still answerable.
        let resp = bus.reconcile(7, &[]).unwrap();
        assert_eq!(
            resp.events.iter().map(|e| e.version).collect::<Vec<_>>(),
            vec![8, 9, 10]
        );
    }

    #[test]
    fn event_wire_shape_is_flat_envelope() {
        let bus = EventBus::new(10);
        let event = bus.publish(DomainEvent::JobFailed {
            job_id: Uuid::nil(),
            error: "decode error".to_string(),
        });

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "job_failed");
        assert_eq!(json["version"], 1);
        assert!(json["timestamp"].is_string());
        assert_eq!(json["data"]["error"], "decode error");
    }

    #[test]
    fn server_message_round_trips_events_and_control() {
        let event = Event {
            payload: DomainEvent::JobProcessing { job_id: Uuid::nil() },
            version: 7,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&ServerMessage::Event(event)).unwrap();
        match serde_json::from_str::<ServerMessage>(&json).unwrap() {
            ServerMessage::Event(e) => assert_eq!(e.version, 7),
            other => panic!("expected event, got {other:?}"),
        }

        let control = ControlMessage::ReconciliationTruncated {
            oldest_retained: 5,
            current_version: 9,
        };
        let json = serde_json::to_string(&ServerMessage::Control(control)).unwrap();
        assert!(json.contains("reconciliation_truncated"));
        match serde_json::from_str::<ServerMessage>(&json).unwrap() {
            ServerMessage::Control(ControlMessage::ReconciliationTruncated {
                oldest_retained,
                ..
            }) => assert_eq!(oldest_retained, 5),
            other => panic!("expected control, got {other:?}"),
        }
    }

    #[test]
    fn client_message_tags_match_wire_protocol() {
        let msg = ClientMessage::ReconciliationRequest {
            last_version: 10,
            event_types: vec!["job_completed".to_string()],
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "reconciliation_request");
        assert_eq!(json["last_version"], 10);
    }

    #[test]
    fn type_matches_handles_empty_wildcard_and_exact() {
        assert!(type_matches(&[], "job_queued"));
        assert!(type_matches(&["*".to_string()], "job_queued"));
        assert!(type_matches(&["job_queued".to_string()], "job_queued"));
        assert!(!type_matches(&["job_failed".to_string()], "job_queued"));
    }
}
