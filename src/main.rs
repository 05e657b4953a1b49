use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::sync::watch;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use caution_card_ocr::app_state::AppState;
use caution_card_ocr::config::AppConfig;
use caution_card_ocr::services::events::EventBus;
use caution_card_ocr::services::processor::CardProcessor;
use caution_card_ocr::{db, routes, worker};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing caution-card-ocr server");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    // Register application metrics
    metrics::describe_histogram!(
        "ocr_processing_seconds",
        "Time to process a caution card OCR job"
    );
    metrics::describe_counter!("ocr_jobs_total", "Total OCR jobs submitted");
    metrics::describe_counter!("ocr_jobs_completed", "Total OCR jobs completed");
    metrics::describe_counter!("ocr_jobs_failed", "Total OCR jobs that failed");
    metrics::describe_gauge!(
        "ocr_queue_depth",
        "Current number of queued OCR jobs"
    );

    // Initialize database connection pool
    tracing::info!("Connecting to PostgreSQL database");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    // Run database migrations
    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    // Staging directory for uploads awaiting OCR
    tokio::fs::create_dir_all(&config.upload_dir)
        .await
        .expect("Failed to create upload directory");

    // Event bus shared by the worker, upload routes, and the socket endpoint
    let events = Arc::new(EventBus::new(config.event_history_limit));

    // External OCR process adapter
    let processor = CardProcessor::new(
        &config.ocr_python,
        &config.ocr_script,
        config.ocr_resources.iter().map(PathBuf::from).collect(),
        Duration::from_secs(config.ocr_timeout_secs),
    );

    // Create shared application state
    let state = AppState::new(db_pool, events.clone(), processor, config.clone());

    // Start the supervised worker task
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker_handle = tokio::spawn(worker::run_worker(state.clone(), shutdown_rx));

    // Build API routes
    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/api/v1/cards", post(routes::cards::upload_card).get(routes::cards::list_jobs))
        .route("/api/v1/cards/{job_id}", get(routes::cards::get_job_status))
        .route("/api/v1/review/orphaned", get(routes::cards::list_orphaned))
        .route(
            "/api/v1/review/{review_item_id}/link",
            post(routes::cards::link_review_item),
        )
        .with_state(state)
        // Event socket (separate state)
        .route("/ws", get(routes::events::ws_handler).with_state(events))
        // Prometheus metrics endpoint (separate state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(10 * 1024 * 1024)); // 10 MB limit

    tracing::info!("Starting caution-card-ocr on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    // The worker gets the stop signal the moment the shutdown signal
    // arrives, finishes its current job, and claims no new ones.
    let signal_shutdown = {
        let shutdown_tx = shutdown_tx.clone();
        async move {
            shutdown_signal().await;
            tracing::info!("Shutdown signal received, stopping worker after current job");
            let _ = shutdown_tx.send(true);
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(signal_shutdown)
        .await
        .expect("Server error");

    let _ = worker_handle.await;

    tracing::info!("Shutdown complete");
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
