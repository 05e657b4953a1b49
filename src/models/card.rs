use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Metadata portion of a caution-card upload.
#[derive(Debug, Deserialize, Validate)]
pub struct CardUploadRequest {
    #[garde(length(min = 1, max = 100))]
    pub submitted_by: String,
}

/// Response after accepting a caution card for processing.
#[derive(Debug, Serialize, Deserialize)]
pub struct CardUploadResponse {
    pub job_id: Uuid,
    pub status: String,
    pub message: String,
}

/// Response for querying job status.
#[derive(Debug, Serialize, Deserialize)]
pub struct JobStatusResponse {
    pub job_id: Uuid,
    pub status: String,
    pub review_item_id: Option<Uuid>,
    pub attachment_id: Option<Uuid>,
    pub error_details: Option<serde_json::Value>,
}

/// Request to link an orphaned review item to a patient.
#[derive(Debug, Deserialize, Validate)]
pub struct LinkReviewItemRequest {
    #[garde(skip)]
    pub patient_internal_id: Uuid,

    #[garde(length(min = 1, max = 100))]
    pub updated_by: String,
}
