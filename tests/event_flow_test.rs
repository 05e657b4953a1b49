//! Event protocol integration tests: a real listener serving the event
//! socket, exercised by the reconnecting event client.
//!
//! These need no external infrastructure — the bus, the axum endpoint, and
//! the client all run in-process over a loopback TCP socket.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use caution_card_ocr::routes::events::ws_handler;
use caution_card_ocr::services::event_client::{
    ConnectionState, EventClient, EventClientConfig,
};
use caution_card_ocr::services::events::{DomainEvent, EventBus};

async fn start_event_server(bus: Arc<EventBus>) -> (String, std::net::SocketAddr, JoinHandle<()>) {
    let app = Router::new().route("/ws", get(ws_handler).with_state(bus));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("ws://{addr}/ws"), addr, handle)
}

/// Byte-level TCP proxy handling one connection at a time inside its own
/// task, so aborting the task drops the sockets and the client observes a
/// real connection loss (aborting `axum::serve` would leave already-spawned
/// connection tasks running).
async fn run_proxy(listener: TcpListener, target: std::net::SocketAddr) {
    loop {
        let Ok((mut inbound, _)) = listener.accept().await else {
            break;
        };
        let Ok(mut outbound) = tokio::net::TcpStream::connect(target).await else {
            continue;
        };
        let _ = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await;
    }
}

fn quick_config(url: &str) -> EventClientConfig {
    EventClientConfig {
        url: url.to_string(),
        reconnect_delay: Duration::from_millis(200),
        max_reconnect_attempts: 25,
    }
}

fn processing_event(bus: &EventBus) {
    bus.publish(DomainEvent::JobProcessing {
        job_id: uuid::Uuid::nil(),
    });
}

/// Poll until `predicate` holds or the deadline passes.
async fn wait_until(deadline: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    predicate()
}

#[tokio::test]
async fn live_events_reach_subscribed_client() {
    let bus = Arc::new(EventBus::new(100));
    let (url, _addr, server) = start_event_server(bus.clone()).await;

    let client = EventClient::connect(quick_config(&url)).await.unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = seen.clone();
        client.on("job_processing", move |event| {
            seen.lock().unwrap().push(event.version);
        });
    }
    client.subscribe(&["job_processing"]);

    // Let the subscription land server-side before publishing.
    tokio::time::sleep(Duration::from_millis(300)).await;

    processing_event(&bus);
    processing_event(&bus);

    assert!(
        wait_until(Duration::from_secs(3), || seen.lock().unwrap().len() == 2).await,
        "expected 2 live events, got {:?}",
        seen.lock().unwrap()
    );
    assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    assert_eq!(client.last_version(), 2);

    client.close().await;
    server.abort();
}

#[tokio::test]
async fn unsubscribed_types_are_not_delivered() {
    let bus = Arc::new(EventBus::new(100));
    let (url, _addr, server) = start_event_server(bus.clone()).await;

    let client = EventClient::connect(quick_config(&url)).await.unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = seen.clone();
        client.on("*", move |event| {
            seen.lock().unwrap().push(event.event_type().to_string());
        });
    }
    client.subscribe(&["job_failed"]);
    tokio::time::sleep(Duration::from_millis(300)).await;

    processing_event(&bus); // not subscribed
    bus.publish(DomainEvent::JobFailed {
        job_id: uuid::Uuid::nil(),
        error: "decode error".to_string(),
    });

    assert!(
        wait_until(Duration::from_secs(3), || !seen.lock().unwrap().is_empty()).await,
        "expected the subscribed event to arrive"
    );
    // Give the unsubscribed event a chance to (wrongly) arrive too.
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(*seen.lock().unwrap(), vec!["job_failed".to_string()]);

    client.close().await;
    server.abort();
}

#[tokio::test]
async fn reconciliation_replays_events_published_before_connect() {
    let bus = Arc::new(EventBus::new(100));
    for _ in 0..15 {
        processing_event(&bus);
    }

    let (url, _addr, server) = start_event_server(bus.clone()).await;
    let client = EventClient::connect(quick_config(&url)).await.unwrap();

    // The connect handshake reconciles from version 0 and replays history.
    assert!(
        wait_until(Duration::from_secs(3), || client.last_version() == 15).await,
        "expected last_version 15, got {}",
        client.last_version()
    );
    assert!(!client.resync_required());

    client.close().await;
    server.abort();
}

#[tokio::test]
async fn reconnect_reconciles_events_missed_while_disconnected() {
    let bus = Arc::new(EventBus::new(100));
    let (_url, server_addr, server) = start_event_server(bus.clone()).await;

    // The client talks to the server through an abortable proxy.
    let proxy_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_addr = proxy_listener.local_addr().unwrap();
    let proxy = tokio::spawn(run_proxy(proxy_listener, server_addr));

    let client = EventClient::connect(quick_config(&format!("ws://{proxy_addr}/ws")))
        .await
        .unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = seen.clone();
        client.on("*", move |event| {
            seen.lock().unwrap().push(event.version);
        });
    }
    client.subscribe(&["*"]);
    tokio::time::sleep(Duration::from_millis(300)).await;

    // Client catches up to version 10.
    for _ in 0..10 {
        processing_event(&bus);
    }
    assert!(wait_until(Duration::from_secs(3), || client.last_version() == 10).await);

    // Cut the proxy; publish 11..=15 while the client is disconnected.
    proxy.abort();
    let _ = proxy.await;
    let mut state = client.state();
    assert!(
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if *state.borrow() != ConnectionState::Connected {
                    break;
                }
                state.changed().await.unwrap();
            }
        })
        .await
        .is_ok(),
        "client never noticed the disconnect"
    );

    for _ in 0..5 {
        processing_event(&bus);
    }

    // Same bus, same proxy address: the reconnect handshake must replay 11..=15.
    let proxy_listener = TcpListener::bind(proxy_addr).await.unwrap();
    let proxy = tokio::spawn(run_proxy(proxy_listener, server_addr));

    assert!(
        wait_until(Duration::from_secs(10), || client.last_version() == 15).await,
        "expected last_version 15 after reconnect, got {}",
        client.last_version()
    );

    let seen = seen.lock().unwrap().clone();
    assert!(seen.windows(2).all(|w| w[0] < w[1]), "versions not ascending: {seen:?}");
    for v in 11..=15 {
        assert_eq!(seen.iter().filter(|&&x| x == v).count(), 1, "version {v} delivered once");
    }

    client.close().await;
    proxy.abort();
    server.abort();
}

#[tokio::test]
async fn truncated_reconciliation_surfaces_resync_required() {
    // Tiny retention window: versions 1..=7 are already gone.
    let bus = Arc::new(EventBus::new(3));
    for _ in 0..10 {
        processing_event(&bus);
    }

    let (url, _addr, server) = start_event_server(bus.clone()).await;
    let client = EventClient::connect(quick_config(&url)).await.unwrap();

    assert!(
        wait_until(Duration::from_secs(3), || client.resync_required()).await,
        "expected resync_required after truncated reconciliation"
    );
    // The cursor jumps to the server's head so the gap is not re-requested.
    assert_eq!(client.last_version(), 10);

    client.clear_resync_required();
    assert!(!client.resync_required());

    client.close().await;
    server.abort();
}

#[tokio::test]
async fn connect_fails_after_bounded_attempts() {
    // Nothing is listening here.
    let config = EventClientConfig {
        url: "ws://127.0.0.1:1/ws".to_string(),
        reconnect_delay: Duration::from_millis(50),
        max_reconnect_attempts: 3,
    };

    let err = EventClient::connect(config).await;
    assert!(err.is_err(), "connect to a dead port should fail");
}
