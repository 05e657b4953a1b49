//! Caution Card OCR Intake Pipeline
//!
//! This library provides the core functionality for the caution-card-ocr
//! system: an asynchronous document-processing pipeline (durable job queue,
//! worker loop, external OCR process orchestration, result persistence) and
//! a versioned event-notification protocol that keeps connected clients
//! consistent across disconnects.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
pub mod worker;
