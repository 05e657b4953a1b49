use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::models::job::{JobStatus, OcrJob};

const JOB_COLUMNS: &str = "id, status, file_path, original_filename, mime_type, submitted_by, \
     review_item_id, attachment_id, error_details, created_at, \
     processing_started_at, processing_completed_at";

fn map_job(row: &PgRow) -> Result<OcrJob, sqlx::Error> {
    let status_str: String = row.try_get("status")?;
    let status = status_str.parse::<JobStatus>().unwrap_or(JobStatus::Queued);

    Ok(OcrJob {
        id: row.try_get("id")?,
        status,
        file_path: row.try_get("file_path")?,
        original_filename: row.try_get("original_filename")?,
        mime_type: row.try_get("mime_type")?,
        submitted_by: row.try_get("submitted_by")?,
        review_item_id: row.try_get("review_item_id")?,
        attachment_id: row.try_get("attachment_id")?,
        error_details: row.try_get("error_details")?,
        created_at: row.try_get("created_at")?,
        processing_started_at: row.try_get("processing_started_at")?,
        processing_completed_at: row.try_get("processing_completed_at")?,
    })
}

/// Insert a new OCR job in the `queued` state
pub async fn enqueue_job(
    pool: &PgPool,
    file_path: &str,
    original_filename: &str,
    mime_type: &str,
    submitted_by: &str,
) -> Result<OcrJob, sqlx::Error> {
    let row = sqlx::query(&format!(
        r#"
        INSERT INTO ocr_jobs (status, file_path, original_filename, mime_type, submitted_by)
        VALUES ('queued', $1, $2, $3, $4)
        RETURNING {JOB_COLUMNS}
        "#,
    ))
    .bind(file_path)
    .bind(original_filename)
    .bind(mime_type)
    .bind(submitted_by)
    .fetch_one(pool)
    .await?;

    map_job(&row)
}

/// Get a job by ID
pub async fn get_job(pool: &PgPool, job_id: Uuid) -> Result<Option<OcrJob>, sqlx::Error> {
    let row = sqlx::query(&format!(
        r#"
        SELECT {JOB_COLUMNS}
        FROM ocr_jobs
        WHERE id = $1
        "#,
    ))
    .bind(job_id)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(map_job).transpose()
}

/// Claim the oldest queued job and transition it to `processing`.
///
/// The SELECT ... FOR UPDATE SKIP LOCKED and the status update share one
/// transaction, so concurrent workers each obtain a distinct job and a
/// claimed job is already `processing` when this returns. Returns None when
/// the queue is empty.
pub async fn claim_next_job(pool: &PgPool) -> Result<Option<OcrJob>, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let claimed: Option<Uuid> = sqlx::query_scalar(
        r#"
        SELECT id
        FROM ocr_jobs
        WHERE status = 'queued'
        ORDER BY created_at ASC, id ASC
        LIMIT 1
        FOR UPDATE SKIP LOCKED
        "#,
    )
    .fetch_optional(&mut *tx)
    .await?;

    let Some(job_id) = claimed else {
        tx.rollback().await?;
        return Ok(None);
    };

    let row = sqlx::query(&format!(
        r#"
        UPDATE ocr_jobs
        SET status = 'processing',
            processing_started_at = NOW()
        WHERE id = $1
        RETURNING {JOB_COLUMNS}
        "#,
    ))
    .bind(job_id)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;

    Ok(Some(map_job(&row)?))
}

/// Mark a job completed, recording the persisted review item and attachment
/// and clearing any prior error.
pub async fn mark_job_completed(
    pool: &PgPool,
    job_id: Uuid,
    review_item_id: Uuid,
    attachment_id: Uuid,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE ocr_jobs
        SET status = 'completed',
            review_item_id = $1,
            attachment_id = $2,
            error_details = NULL,
            processing_completed_at = NOW()
        WHERE id = $3
        "#,
    )
    .bind(review_item_id)
    .bind(attachment_id)
    .bind(job_id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Mark a job failed with a JSON error summary, clearing any success fields.
/// The row is kept as the audit record.
pub async fn mark_job_failed(
    pool: &PgPool,
    job_id: Uuid,
    error_details: &serde_json::Value,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE ocr_jobs
        SET status = 'failed',
            error_details = $1,
            review_item_id = NULL,
            attachment_id = NULL,
            processing_completed_at = NOW()
        WHERE id = $2
        "#,
    )
    .bind(error_details)
    .bind(job_id)
    .execute(pool)
    .await?;

    Ok(())
}

/// List jobs, newest first, optionally filtered by status
pub async fn list_jobs(
    pool: &PgPool,
    status: Option<JobStatus>,
    limit: i64,
) -> Result<Vec<OcrJob>, sqlx::Error> {
    let rows = match status {
        Some(status) => {
            sqlx::query(&format!(
                r#"
                SELECT {JOB_COLUMNS}
                FROM ocr_jobs
                WHERE status = $1
                ORDER BY created_at DESC
                LIMIT $2
                "#,
            ))
            .bind(status.as_ref())
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query(&format!(
                r#"
                SELECT {JOB_COLUMNS}
                FROM ocr_jobs
                ORDER BY created_at DESC
                LIMIT $1
                "#,
            ))
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
    };

    rows.iter().map(map_job).collect()
}

/// Current number of queued jobs (for health checks and the depth gauge)
pub async fn queue_depth(pool: &PgPool) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar("SELECT COUNT(*) FROM ocr_jobs WHERE status = 'queued'")
        .fetch_one(pool)
        .await
}
