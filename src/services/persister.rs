//! Persists one OCR result: resolves the owning patient (or marks the item
//! orphaned), stores the review item and file attachment, and links them.
//! The three writes share a transaction, so a partial failure leaves nothing
//! behind and a retry starts from a clean slate.

use std::path::Path;

use sha2::{Digest, Sha256};
use sqlx::PgPool;

use crate::db::review_queries;
use crate::models::ocr::OcrResult;
use crate::models::review::PersistedCard;

const ITEM_TYPE: &str = "caution_card";

/// Strip everything but digits from an extracted MRN.
pub fn clean_mrn(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Map an upload MIME type onto the stored attachment file type.
pub fn map_file_type(mime_type: &str) -> Result<&'static str, PersistError> {
    if mime_type.starts_with("image/") {
        Ok("image")
    } else if mime_type == "application/pdf" {
        Ok("pdf")
    } else if mime_type.starts_with("text/") {
        Ok("text")
    } else {
        Err(PersistError::UnsupportedFileType(mime_type.to_string()))
    }
}

/// Persist an OCR result and delete the temporary source file.
///
/// The file is removed whether persistence succeeded or failed; a deletion
/// failure is logged and never masks the primary outcome.
pub async fn persist_card(
    pool: &PgPool,
    ocr: &OcrResult,
    file_path: &Path,
    original_filename: &str,
    mime_type: &str,
    submitted_by: &str,
) -> Result<PersistedCard, PersistError> {
    let result = persist_inner(pool, ocr, file_path, original_filename, mime_type, submitted_by).await;
    cleanup_temp_file(file_path).await;
    result
}

/// Best-effort removal of a staged upload. The worker also calls this when
/// the OCR step fails before persistence is reached.
pub async fn cleanup_temp_file(file_path: &Path) {
    if let Err(e) = tokio::fs::remove_file(file_path).await {
        tracing::warn!(
            file = %file_path.display(),
            error = %e,
            "failed to delete temporary upload file"
        );
    } else {
        tracing::debug!(file = %file_path.display(), "deleted temporary upload file");
    }
}

async fn persist_inner(
    pool: &PgPool,
    ocr: &OcrResult,
    file_path: &Path,
    original_filename: &str,
    mime_type: &str,
    submitted_by: &str,
) -> Result<PersistedCard, PersistError> {
    // MRN extraction: a card without a readable record number cannot be
    // persisted at all.
    let raw_mrn = ocr
        .data
        .patient_info
        .mrn
        .as_deref()
        .ok_or_else(|| PersistError::DataExtraction("MRN missing from OCR results".to_string()))?;

    let mrn = clean_mrn(raw_mrn);
    if mrn.is_empty() {
        return Err(PersistError::DataExtraction(format!(
            "extracted MRN '{raw_mrn}' is invalid after cleaning"
        )));
    }

    // A card may arrive before its patient record exists; that is an
    // orphaned item, not a failure.
    let patient_internal_id = review_queries::find_patient_by_mrn(pool, &mrn).await?;
    let is_orphaned = patient_internal_id.is_none();
    if is_orphaned {
        tracing::warn!(mrn = %mrn, "no patient for MRN, persisting as orphaned item");
    }

    let file_type = map_file_type(mime_type)?;

    // Hash the bytes actually read from disk, never the upload metadata.
    let content = tokio::fs::read(file_path).await?;
    let content_hash = format!("{:x}", Sha256::digest(&content));

    let payload = serde_json::to_value(&ocr.data)
        .map_err(|e| PersistError::DataExtraction(format!("unserializable OCR payload: {e}")))?;

    let mut tx = pool.begin().await?;

    let review_item_id = review_queries::insert_review_item(
        &mut tx,
        patient_internal_id,
        ITEM_TYPE,
        &payload,
        submitted_by,
    )
    .await?;

    let attachment_id = review_queries::insert_file_attachment(
        &mut tx,
        patient_internal_id,
        file_type,
        original_filename,
        &content_hash,
        &content,
        submitted_by,
    )
    .await?;

    review_queries::link_attachment_to_review(&mut tx, attachment_id, review_item_id).await?;

    tx.commit().await?;

    tracing::info!(
        review_item_id = %review_item_id,
        attachment_id = %attachment_id,
        mrn = %mrn,
        is_orphaned,
        "caution card persisted"
    );

    Ok(PersistedCard {
        review_item_id,
        attachment_id,
        is_orphaned,
        patient_internal_id,
        mrn,
    })
}

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("data extraction failed: {0}")]
    DataExtraction(String),

    #[error("unsupported file type: {0}")]
    UnsupportedFileType(String),

    #[error("failed to read source file: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage write failed: {0}")]
    Database(#[from] sqlx::Error),
}

impl PersistError {
    /// Short tag stored in the job's error summary.
    pub fn kind(&self) -> &'static str {
        match self {
            PersistError::DataExtraction(_) => "data_extraction",
            PersistError::UnsupportedFileType(_) => "unsupported_file_type",
            PersistError::Io(_) => "io",
            PersistError::Database(_) => "persistence",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_mrn_strips_non_digits() {
        assert_eq!(clean_mrn("12-345"), "12345");
        assert_eq!(clean_mrn(" 00 77a9 "), "00779");
        assert_eq!(clean_mrn("MRN: 4521-88"), "452188");
    }

    #[test]
    fn clean_mrn_of_garbage_is_empty() {
        assert_eq!(clean_mrn("---"), "");
        assert_eq!(clean_mrn(""), "");
        assert_eq!(clean_mrn("unknown"), "");
    }

    #[test]
    fn file_type_mapping() {
        assert_eq!(map_file_type("image/png").unwrap(), "image");
        assert_eq!(map_file_type("image/jpeg").unwrap(), "image");
        assert_eq!(map_file_type("application/pdf").unwrap(), "pdf");
        assert_eq!(map_file_type("text/plain").unwrap(), "text");
        assert!(matches!(
            map_file_type("application/zip"),
            Err(PersistError::UnsupportedFileType(_))
        ));
    }
}
