use sqlx::PgPool;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::services::events::EventBus;
use crate::services::processor::CardProcessor;

/// Shared application state passed to route handlers and the worker.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub events: Arc<EventBus>,
    pub processor: Arc<CardProcessor>,
    pub config: Arc<AppConfig>,
}

impl AppState {
    pub fn new(
        db: PgPool,
        events: Arc<EventBus>,
        processor: CardProcessor,
        config: AppConfig,
    ) -> Self {
        Self {
            db,
            events,
            processor: Arc::new(processor),
            config: Arc::new(config),
        }
    }
}
