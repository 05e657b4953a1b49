use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A review-queue entry created from a successfully processed caution card.
/// `patient_internal_id` is None for orphaned items: the card arrived
/// before its patient record existed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewItem {
    pub id: Uuid,
    pub patient_internal_id: Option<Uuid>,
    pub item_type: String,
    pub payload: serde_json::Value,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

/// Outcome of persisting one OCR result.
#[derive(Debug, Clone, Serialize)]
pub struct PersistedCard {
    pub review_item_id: Uuid,
    pub attachment_id: Uuid,
    pub is_orphaned: bool,
    pub patient_internal_id: Option<Uuid>,
    pub mrn: String,
}
