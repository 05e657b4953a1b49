//! WebSocket endpoint for the versioned event protocol.
//!
//! Each connection keeps its own subscription set and receives live events
//! filtered by type. Clients drive reconciliation themselves: on (re)connect
//! they send `reconciliation_request` with the last version they saw and get
//! either the missed events or a truncation signal back.

use std::collections::HashSet;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast;

use crate::services::events::{ClientMessage, ControlMessage, Event, EventBus, ServerMessage};

/// GET /ws — upgrade to the event socket.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(bus): State<Arc<EventBus>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, bus))
}

async fn handle_socket(socket: WebSocket, bus: Arc<EventBus>) {
    let (mut sink, mut stream) = socket.split();
    let mut live = bus.subscribe();
    let mut subscriptions: HashSet<String> = HashSet::new();

    tracing::debug!("event socket connected");

    loop {
        tokio::select! {
            event = live.recv() => {
                match event {
                    Ok(event) => {
                        if wants(&subscriptions, &event) {
                            if send(&mut sink, &ServerMessage::Event(event)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // A slow consumer has already missed events; closing
                        // forces it through reconciliation instead of
                        // leaving a silent gap in its stream.
                        tracing::warn!(skipped, "event socket lagged, closing for resync");
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let parsed = match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(parsed) => parsed,
                            Err(e) => {
                                tracing::debug!(error = %e, "ignoring malformed client message");
                                continue;
                            }
                        };
                        if handle_client_message(&bus, &mut subscriptions, &mut sink, parsed)
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    Some(Ok(_)) => {} // ping/pong handled by axum
                }
            }
        }
    }

    tracing::debug!("event socket disconnected");
}

fn wants(subscriptions: &HashSet<String>, event: &Event) -> bool {
    subscriptions.contains("*") || subscriptions.contains(event.event_type())
}

async fn handle_client_message(
    bus: &EventBus,
    subscriptions: &mut HashSet<String>,
    sink: &mut SplitSink<WebSocket, Message>,
    message: ClientMessage,
) -> Result<(), axum::Error> {
    match message {
        ClientMessage::Subscribe { event_types } => {
            subscriptions.extend(event_types.iter().cloned());
            send(
                sink,
                &ServerMessage::Control(ControlMessage::SubscriptionConfirmed {
                    event_types,
                    current_version: bus.current_version(),
                }),
            )
            .await
        }
        ClientMessage::Unsubscribe { event_types } => {
            for t in &event_types {
                subscriptions.remove(t);
            }
            send(
                sink,
                &ServerMessage::Control(ControlMessage::UnsubscriptionConfirmed { event_types }),
            )
            .await
        }
        ClientMessage::ReconciliationRequest {
            last_version,
            event_types,
        } => {
            // An empty filter falls back to the connection's subscriptions;
            // if those are empty too, everything is replayed.
            let filter = if event_types.is_empty() {
                subscriptions.iter().cloned().collect()
            } else {
                event_types
            };

            let reply = match bus.reconcile(last_version, &filter) {
                Ok(resp) => ControlMessage::ReconciliationResponse {
                    events: resp.events,
                    current_version: resp.current_version,
                },
                Err(truncated) => ControlMessage::ReconciliationTruncated {
                    oldest_retained: truncated.oldest_retained,
                    current_version: truncated.current_version,
                },
            };

            send(sink, &ServerMessage::Control(reply)).await
        }
    }
}

async fn send(
    sink: &mut SplitSink<WebSocket, Message>,
    message: &ServerMessage,
) -> Result<(), axum::Error> {
    let json = serde_json::to_string(message).expect("server message serializes");
    sink.send(Message::Text(json.into())).await
}
