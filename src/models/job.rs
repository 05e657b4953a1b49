use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

/// Status of a caution-card OCR job in the durable queue.
///
/// Transitions are one-directional: queued → processing → completed | failed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, EnumString, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

/// A caution-card OCR job. Rows are never deleted; completed and failed jobs
/// remain queryable as the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrJob {
    pub id: Uuid,
    pub status: JobStatus,
    pub file_path: String,
    pub original_filename: String,
    pub mime_type: String,
    pub submitted_by: String,
    pub review_item_id: Option<Uuid>,
    pub attachment_id: Option<Uuid>,
    pub error_details: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub processing_completed_at: Option<DateTime<Utc>>,
}
