use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::models::review::ReviewItem;

/// Resolve a patient's internal ID by cleaned medical record number.
pub async fn find_patient_by_mrn(
    pool: &PgPool,
    mrn: &str,
) -> Result<Option<Uuid>, sqlx::Error> {
    sqlx::query_scalar("SELECT internal_id FROM patients WHERE mrn = $1")
        .bind(mrn)
        .fetch_optional(pool)
        .await
}

/// Insert a review item inside the persister's transaction.
pub async fn insert_review_item(
    tx: &mut Transaction<'_, Postgres>,
    patient_internal_id: Option<Uuid>,
    item_type: &str,
    payload: &serde_json::Value,
    created_by: &str,
) -> Result<Uuid, sqlx::Error> {
    sqlx::query_scalar(
        r#"
        INSERT INTO review_items (patient_internal_id, item_type, payload, created_by)
        VALUES ($1, $2, $3, $4)
        RETURNING id
        "#,
    )
    .bind(patient_internal_id)
    .bind(item_type)
    .bind(payload)
    .bind(created_by)
    .fetch_one(&mut **tx)
    .await
}

/// Insert a file attachment inside the persister's transaction. The review
/// link starts out NULL and is set by `link_attachment_to_review`.
#[allow(clippy::too_many_arguments)]
pub async fn insert_file_attachment(
    tx: &mut Transaction<'_, Postgres>,
    patient_internal_id: Option<Uuid>,
    file_type: &str,
    original_filename: &str,
    content_hash: &str,
    content: &[u8],
    created_by: &str,
) -> Result<Uuid, sqlx::Error> {
    sqlx::query_scalar(
        r#"
        INSERT INTO file_attachments
            (patient_internal_id, review_item_id, file_type, original_filename,
             content_hash, content, created_by)
        VALUES ($1, NULL, $2, $3, $4, $5, $6)
        RETURNING id
        "#,
    )
    .bind(patient_internal_id)
    .bind(file_type)
    .bind(original_filename)
    .bind(content_hash)
    .bind(content)
    .bind(created_by)
    .fetch_one(&mut **tx)
    .await
}

/// Link an attachment to its review item.
pub async fn link_attachment_to_review(
    tx: &mut Transaction<'_, Postgres>,
    attachment_id: Uuid,
    review_item_id: Uuid,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE file_attachments SET review_item_id = $1 WHERE id = $2")
        .bind(review_item_id)
        .bind(attachment_id)
        .execute(&mut **tx)
        .await?;

    Ok(())
}

fn map_review_item(row: &PgRow) -> Result<ReviewItem, sqlx::Error> {
    Ok(ReviewItem {
        id: row.try_get("id")?,
        patient_internal_id: row.try_get("patient_internal_id")?,
        item_type: row.try_get("item_type")?,
        payload: row.try_get("payload")?,
        created_by: row.try_get("created_by")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Review items with no resolvable owning patient.
pub async fn list_orphaned_review_items(
    pool: &PgPool,
    limit: i64,
) -> Result<Vec<ReviewItem>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT id, patient_internal_id, item_type, payload, created_by, created_at
        FROM review_items
        WHERE patient_internal_id IS NULL
        ORDER BY created_at ASC
        LIMIT $1
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.iter().map(map_review_item).collect()
}

/// Attach an orphaned review item (and its file attachments) to a patient.
/// Returns false when the review item does not exist.
pub async fn link_review_item_to_patient(
    pool: &PgPool,
    review_item_id: Uuid,
    patient_internal_id: Uuid,
) -> Result<bool, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let updated = sqlx::query(
        "UPDATE review_items SET patient_internal_id = $1 WHERE id = $2",
    )
    .bind(patient_internal_id)
    .bind(review_item_id)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if updated == 0 {
        tx.rollback().await?;
        return Ok(false);
    }

    sqlx::query(
        "UPDATE file_attachments SET patient_internal_id = $1 WHERE review_item_id = $2",
    )
    .bind(patient_internal_id)
    .bind(review_item_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(true)
}

/// Fetch an attachment's stored content and hash (integrity checks, tests).
pub async fn get_attachment_content(
    pool: &PgPool,
    attachment_id: Uuid,
) -> Result<Option<(String, Vec<u8>)>, sqlx::Error> {
    let row = sqlx::query(
        "SELECT content_hash, content FROM file_attachments WHERE id = $1",
    )
    .bind(attachment_id)
    .fetch_optional(pool)
    .await?;

    row.map(|r| {
        Ok::<_, sqlx::Error>((r.try_get::<String, _>("content_hash")?, r.try_get::<Vec<u8>, _>("content")?))
    })
    .transpose()
}
