use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use garde::Validate;
use serde::Deserialize;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::db::{queries, review_queries};
use crate::models::card::{
    CardUploadRequest, CardUploadResponse, JobStatusResponse, LinkReviewItemRequest,
};
use crate::models::job::{JobStatus, OcrJob};
use crate::models::review::ReviewItem;
use crate::services::events::DomainEvent;

/// POST /api/v1/cards — accept a caution card scan for asynchronous OCR.
///
/// Stages the file on disk, inserts a queued job, and publishes
/// `job_queued`. The response carries the job ID to poll or to correlate
/// with events on the socket.
pub async fn upload_card(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<CardUploadResponse>), StatusCode> {
    let mut file_data: Option<(Vec<u8>, String, String)> = None;
    let mut submitted_by: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|_| StatusCode::BAD_REQUEST)?
    {
        match field.name() {
            Some("file") => {
                let filename = field
                    .file_name()
                    .unwrap_or("caution_card.png")
                    .to_string();
                let mime_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let data = field.bytes().await.map_err(|_| StatusCode::BAD_REQUEST)?;
                file_data = Some((data.to_vec(), filename, mime_type));
            }
            Some("submitted_by") => {
                submitted_by =
                    Some(field.text().await.map_err(|_| StatusCode::BAD_REQUEST)?);
            }
            _ => {}
        }
    }

    let (data, original_filename, mime_type) = file_data.ok_or(StatusCode::BAD_REQUEST)?;
    let request = CardUploadRequest {
        submitted_by: submitted_by.ok_or(StatusCode::BAD_REQUEST)?,
    };
    request
        .validate()
        .map_err(|_| StatusCode::UNPROCESSABLE_ENTITY)?;

    // Image uploads must at least sniff as a real image; the hash stored
    // later is computed from what lands on disk, not from this metadata.
    if mime_type.starts_with("image/") {
        image::guess_format(&data).map_err(|_| StatusCode::UNSUPPORTED_MEDIA_TYPE)?;
    }

    let staged_name = format!("{}_{}", Uuid::new_v4(), sanitize_filename(&original_filename));
    let file_path = std::path::Path::new(&state.config.upload_dir).join(staged_name);

    tokio::fs::write(&file_path, &data).await.map_err(|e| {
        tracing::error!(error = %e, "failed to stage upload");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    let job = queries::enqueue_job(
        &state.db,
        &file_path.to_string_lossy(),
        &original_filename,
        &mime_type,
        &request.submitted_by,
    )
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "failed to enqueue job");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    state.events.publish(DomainEvent::JobQueued {
        job_id: job.id,
        original_filename: original_filename.clone(),
        submitted_by: request.submitted_by.clone(),
    });

    metrics::counter!("ocr_jobs_total").increment(1);

    tracing::info!(job_id = %job.id, file = %original_filename, "caution card queued");

    Ok((
        StatusCode::CREATED,
        Json(CardUploadResponse {
            job_id: job.id,
            status: job.status.to_string(),
            message: "Caution card queued for OCR processing".to_string(),
        }),
    ))
}

/// GET /api/v1/cards/{job_id} — job status, result ids, and error summary.
pub async fn get_job_status(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobStatusResponse>, StatusCode> {
    let job = queries::get_job(&state.db, job_id)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .ok_or(StatusCode::NOT_FOUND)?;

    Ok(Json(JobStatusResponse {
        job_id: job.id,
        status: job.status.to_string(),
        review_item_id: job.review_item_id,
        attachment_id: job.attachment_id,
        error_details: job.error_details,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
}

/// GET /api/v1/cards — recent jobs, optionally filtered by status.
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(params): Query<ListJobsQuery>,
) -> Result<Json<Vec<OcrJob>>, StatusCode> {
    let status = match params.status.as_deref() {
        Some(s) => Some(s.parse::<JobStatus>().map_err(|_| StatusCode::BAD_REQUEST)?),
        None => None,
    };
    let limit = params.limit.unwrap_or(50).clamp(1, 500);

    let jobs = queries::list_jobs(&state.db, status, limit)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    Ok(Json(jobs))
}

/// GET /api/v1/review/orphaned — review items awaiting a patient link.
pub async fn list_orphaned(
    State(state): State<AppState>,
) -> Result<Json<Vec<ReviewItem>>, StatusCode> {
    let items = review_queries::list_orphaned_review_items(&state.db, 200)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    Ok(Json(items))
}

/// POST /api/v1/review/{review_item_id}/link — attach an orphaned review
/// item (and its file attachments) to a patient record.
pub async fn link_review_item(
    State(state): State<AppState>,
    Path(review_item_id): Path<Uuid>,
    Json(request): Json<LinkReviewItemRequest>,
) -> Result<StatusCode, StatusCode> {
    request
        .validate()
        .map_err(|_| StatusCode::UNPROCESSABLE_ENTITY)?;

    let linked = review_queries::link_review_item_to_patient(
        &state.db,
        review_item_id,
        request.patient_internal_id,
    )
    .await
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    if !linked {
        return Err(StatusCode::NOT_FOUND);
    }

    state.events.publish(DomainEvent::ReviewItemLinked {
        review_item_id,
        patient_internal_id: request.patient_internal_id,
        updated_by: request.updated_by.clone(),
    });

    tracing::info!(
        review_item_id = %review_item_id,
        patient_internal_id = %request.patient_internal_id,
        "orphaned review item linked to patient"
    );

    Ok(StatusCode::OK)
}

/// Keep staged filenames flat and shell-safe.
fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_filename_flattens_paths() {
        assert_eq!(sanitize_filename("card (1).png"), "card__1_.png");
        assert_eq!(sanitize_filename("../../etc/passwd"), ".._.._etc_passwd");
        assert_eq!(sanitize_filename("scan-2024_03.jpeg"), "scan-2024_03.jpeg");
    }
}
