//! Reconnecting client for the versioned event socket.
//!
//! Tracks the highest version seen, re-sends its subscription set and issues
//! a reconciliation request on every (re)connect, and applies events in
//! ascending version order whether they arrive live or as a reconciliation
//! batch. Unexpected drops trigger bounded reconnection; exhausting the
//! budget surfaces a persistent-disconnection state instead of retrying
//! silently forever.

use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;

use crate::services::events::{ClientMessage, ControlMessage, Event, ServerMessage};

#[derive(Debug, Clone)]
pub struct EventClientConfig {
    /// ws:// URL of the event endpoint
    pub url: String,
    /// Fixed delay between reconnect attempts
    pub reconnect_delay: Duration,
    /// Reconnect attempts before giving up
    pub max_reconnect_attempts: u32,
}

impl EventClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reconnect_delay: Duration::from_secs(3),
            max_reconnect_attempts: 5,
        }
    }
}

/// Observable connection lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// The reconnect budget is exhausted; the caller must decide what to do.
    PersistentlyDisconnected { attempts: u32 },
}

type Handler = Box<dyn Fn(&Event) + Send + Sync>;

struct Shared {
    handlers: RwLock<HashMap<String, Vec<Handler>>>,
    subscriptions: Mutex<HashSet<String>>,
    last_version: AtomicU64,
    /// Set when a reconciliation came back truncated: events were lost for
    /// good and the caller needs a full state refresh, not a quiet gap.
    resync_required: AtomicBool,
}

impl Shared {
    /// Deliver one inbound event. Only versions above the cursor are
    /// dispatched, so replays from reconciliation never double-fire, and
    /// the cursor only ever advances.
    fn apply_event(&self, event: &Event) {
        let prev = self.last_version.load(Ordering::Acquire);
        if event.version <= prev {
            return;
        }

        let handlers = self.handlers.read().expect("handler lock poisoned");
        for key in [event.event_type(), "*"] {
            if let Some(list) = handlers.get(key) {
                for handler in list {
                    // One misbehaving handler must not block the others.
                    if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                        tracing::error!(
                            event_type = event.event_type(),
                            version = event.version,
                            "event handler panicked"
                        );
                    }
                }
            }
        }

        self.last_version.store(event.version, Ordering::Release);
    }

    fn subscription_list(&self) -> Vec<String> {
        let subs = self.subscriptions.lock().expect("subscription lock poisoned");
        subs.iter().cloned().collect()
    }
}

pub struct EventClient {
    shared: Arc<Shared>,
    state_rx: watch::Receiver<ConnectionState>,
    outbound_tx: mpsc::UnboundedSender<ClientMessage>,
    shutdown_tx: watch::Sender<bool>,
    driver: tokio::task::JoinHandle<()>,
}

impl EventClient {
    /// Connect to the event endpoint. The initial connection is retried with
    /// the configured delay; once established, a background driver keeps the
    /// session alive across drops.
    pub async fn connect(config: EventClientConfig) -> Result<Self, EventClientError> {
        let shared = Arc::new(Shared {
            handlers: RwLock::new(HashMap::new()),
            subscriptions: Mutex::new(HashSet::new()),
            last_version: AtomicU64::new(0),
            resync_required: AtomicBool::new(false),
        });

        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut attempts = 0u32;
        let stream = loop {
            match tokio_tungstenite::connect_async(config.url.as_str()).await {
                Ok((stream, _)) => break stream,
                Err(e) => {
                    attempts += 1;
                    if attempts >= config.max_reconnect_attempts {
                        let _ = state_tx
                            .send(ConnectionState::PersistentlyDisconnected { attempts });
                        return Err(EventClientError::Connect {
                            attempts,
                            source: Box::new(e),
                        });
                    }
                    tracing::warn!(attempt = attempts, error = %e, "event socket connect failed, retrying");
                    tokio::time::sleep(config.reconnect_delay).await;
                }
            }
        };

        let driver = tokio::spawn(drive(
            config,
            shared.clone(),
            state_tx,
            outbound_rx,
            shutdown_rx,
            Some(stream),
        ));

        Ok(Self {
            shared,
            state_rx,
            outbound_tx,
            shutdown_tx,
            driver,
        })
    }

    /// Register a handler for one event type, or `"*"` for every type.
    pub fn on(&self, event_type: &str, handler: impl Fn(&Event) + Send + Sync + 'static) {
        let mut handlers = self.shared.handlers.write().expect("handler lock poisoned");
        handlers
            .entry(event_type.to_string())
            .or_default()
            .push(Box::new(handler));
    }

    /// Add event types to the subscription set and inform the server.
    pub fn subscribe(&self, event_types: &[&str]) {
        {
            let mut subs = self
                .shared
                .subscriptions
                .lock()
                .expect("subscription lock poisoned");
            subs.extend(event_types.iter().map(|t| t.to_string()));
        }
        let _ = self.outbound_tx.send(ClientMessage::Subscribe {
            event_types: event_types.iter().map(|t| t.to_string()).collect(),
        });
    }

    /// Remove event types from the subscription set and inform the server.
    pub fn unsubscribe(&self, event_types: &[&str]) {
        {
            let mut subs = self
                .shared
                .subscriptions
                .lock()
                .expect("subscription lock poisoned");
            for t in event_types {
                subs.remove(*t);
            }
        }
        let _ = self.outbound_tx.send(ClientMessage::Unsubscribe {
            event_types: event_types.iter().map(|t| t.to_string()).collect(),
        });
    }

    /// Highest event version applied so far.
    pub fn last_version(&self) -> u64 {
        self.shared.last_version.load(Ordering::Acquire)
    }

    /// True after a truncated reconciliation: the caller should do a full
    /// state refresh rather than trust incremental events alone.
    pub fn resync_required(&self) -> bool {
        self.shared.resync_required.load(Ordering::Acquire)
    }

    /// Acknowledge a completed full refresh.
    pub fn clear_resync_required(&self) {
        self.shared.resync_required.store(false, Ordering::Release);
    }

    /// Watch the connection lifecycle.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Explicit local disconnect; suppresses reconnection.
    pub async fn close(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.driver.await;
    }
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Background driver: runs one session at a time, reconnecting with a fixed
/// delay up to the configured budget when the connection drops unexpectedly.
async fn drive(
    config: EventClientConfig,
    shared: Arc<Shared>,
    state_tx: watch::Sender<ConnectionState>,
    mut outbound_rx: mpsc::UnboundedReceiver<ClientMessage>,
    mut shutdown_rx: watch::Receiver<bool>,
    mut initial: Option<WsStream>,
) {
    let mut attempts = 0u32;

    loop {
        let stream = match initial.take() {
            Some(stream) => stream,
            None => {
                let _ = state_tx.send(ConnectionState::Connecting);
                match tokio_tungstenite::connect_async(config.url.as_str()).await {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        attempts += 1;
                        tracing::warn!(attempt = attempts, error = %e, "event socket reconnect failed");
                        if attempts >= config.max_reconnect_attempts {
                            let _ = state_tx
                                .send(ConnectionState::PersistentlyDisconnected { attempts });
                            return;
                        }
                        tokio::select! {
                            _ = tokio::time::sleep(config.reconnect_delay) => continue,
                            _ = shutdown_rx.changed() => return,
                        }
                    }
                }
            }
        };

        let _ = state_tx.send(ConnectionState::Connected);
        attempts = 0;

        let ended_by_shutdown = run_session(
            stream,
            &shared,
            &mut outbound_rx,
            &mut shutdown_rx,
        )
        .await;

        let _ = state_tx.send(ConnectionState::Disconnected);

        if ended_by_shutdown || *shutdown_rx.borrow() {
            return;
        }

        attempts += 1;
        if attempts >= config.max_reconnect_attempts {
            let _ = state_tx.send(ConnectionState::PersistentlyDisconnected { attempts });
            return;
        }

        tokio::select! {
            _ = tokio::time::sleep(config.reconnect_delay) => {}
            _ = shutdown_rx.changed() => return,
        }
    }
}

/// Run one connected session. Returns true when the session ended because of
/// a local shutdown rather than a connection drop.
async fn run_session(
    ws: WsStream,
    shared: &Arc<Shared>,
    outbound_rx: &mut mpsc::UnboundedReceiver<ClientMessage>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> bool {
    let (mut sink, mut stream) = ws.split();

    // Re-establish server-side state before consuming live events: the
    // subscription set, then a replay of everything missed while away.
    let subscriptions = shared.subscription_list();
    if !subscriptions.is_empty() {
        let subscribe = ClientMessage::Subscribe {
            event_types: subscriptions.clone(),
        };
        if send_json(&mut sink, &subscribe).await.is_err() {
            return false;
        }
    }

    let reconcile = ClientMessage::ReconciliationRequest {
        last_version: shared.last_version.load(Ordering::Acquire),
        event_types: subscriptions,
    };
    if send_json(&mut sink, &reconcile).await.is_err() {
        return false;
    }

    loop {
        tokio::select! {
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ServerMessage>(&text) {
                            Ok(message) => handle_server_message(shared, message),
                            Err(e) => {
                                tracing::warn!(error = %e, "unparseable event socket message");
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return false,
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "event socket error");
                        return false;
                    }
                    Some(Ok(_)) => {} // ping/pong handled by tungstenite
                }
            }
            out = outbound_rx.recv() => {
                match out {
                    Some(message) => {
                        if send_json(&mut sink, &message).await.is_err() {
                            return false;
                        }
                    }
                    None => return true,
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    let _ = sink.close().await;
                    return true;
                }
            }
        }
    }
}

fn handle_server_message(shared: &Arc<Shared>, message: ServerMessage) {
    match message {
        ServerMessage::Event(event) => shared.apply_event(&event),
        ServerMessage::Control(ControlMessage::ReconciliationResponse {
            mut events,
            current_version,
        }) => {
            // Apply in ascending version order even if the batch arrived
            // out of live-stream order.
            events.sort_by_key(|e| e.version);
            for event in &events {
                shared.apply_event(event);
            }
            let prev = shared.last_version.load(Ordering::Acquire);
            if current_version > prev {
                shared.last_version.store(current_version, Ordering::Release);
            }
            tracing::debug!(
                replayed = events.len(),
                current_version,
                "reconciliation applied"
            );
        }
        ServerMessage::Control(ControlMessage::ReconciliationTruncated {
            oldest_retained,
            current_version,
        }) => {
            tracing::warn!(
                oldest_retained,
                current_version,
                "reconciliation window exceeded, full resync required"
            );
            shared.resync_required.store(true, Ordering::Release);
            // Jump the cursor: the gap cannot be replayed and must not be
            // re-requested forever.
            shared.last_version.store(current_version, Ordering::Release);
        }
        ServerMessage::Control(ControlMessage::SubscriptionConfirmed {
            event_types,
            current_version,
        }) => {
            tracing::debug!(?event_types, current_version, "subscription confirmed");
        }
        ServerMessage::Control(ControlMessage::UnsubscriptionConfirmed { event_types }) => {
            tracing::debug!(?event_types, "unsubscription confirmed");
        }
    }
}

async fn send_json(
    sink: &mut futures_util::stream::SplitSink<WsStream, Message>,
    message: &ClientMessage,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let json = serde_json::to_string(message).expect("client message serializes");
    sink.send(Message::Text(json.into())).await
}

#[derive(Debug, thiserror::Error)]
pub enum EventClientError {
    #[error("failed to connect after {attempts} attempts: {source}")]
    Connect {
        attempts: u32,
        source: Box<tokio_tungstenite::tungstenite::Error>,
    },
}
