//! Caution-card job worker.
//!
//! A single supervised task that claims one job at a time, drives it through
//! the OCR processor and the result persister, settles the job state, and
//! publishes the matching lifecycle event. After finishing a job it claims
//! again immediately to drain backlog; an empty queue means a fixed poll
//! wait, and an infrastructure error from the claim itself means a longer
//! backoff so a broken database does not produce a tight error loop.
//!
//! Multiple worker processes may run concurrently; the queue's
//! SKIP LOCKED claim guarantees no job is processed twice.

use std::path::Path;
use std::time::{Duration, Instant};

use tokio::sync::watch;

use crate::app_state::AppState;
use crate::db::queries;
use crate::models::job::OcrJob;
use crate::models::review::PersistedCard;
use crate::services::events::DomainEvent;
use crate::services::persister::{self, PersistError};
use crate::services::processor::ProcessorError;

/// Run the worker until the shutdown signal flips. The signal is only
/// consulted between jobs and at the idle waits, so an in-flight job always
/// runs to completion.
pub async fn run_worker(state: AppState, mut shutdown: watch::Receiver<bool>) {
    let poll_interval = Duration::from_secs(state.config.worker_poll_interval_secs);
    let error_backoff = Duration::from_secs(state.config.worker_error_backoff_secs);

    tracing::info!(
        poll_interval_secs = state.config.worker_poll_interval_secs,
        max_retries = state.config.max_retries,
        "worker ready; failed jobs are terminal (automatic requeue disabled)"
    );

    loop {
        if *shutdown.borrow() {
            break;
        }

        match process_next_job(&state).await {
            Ok(true) => {
                // Job handled; claim again immediately to drain the backlog.
                tracing::debug!("job settled, checking for next job");
            }
            Ok(false) => {
                tracing::trace!("queue empty, sleeping");
                if wait_or_shutdown(poll_interval, &mut shutdown).await {
                    break;
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "claim failed, backing off");
                if wait_or_shutdown(error_backoff, &mut shutdown).await {
                    break;
                }
            }
        }
    }

    tracing::info!("worker stopped");
}

/// Sleep for `duration` unless the shutdown signal fires first.
/// Returns true when the worker should stop.
async fn wait_or_shutdown(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = shutdown.changed() => *shutdown.borrow(),
    }
}

/// Claim and fully handle one job.
///
/// Returns Ok(true) if a job was settled (completed or failed), Ok(false)
/// if the queue was empty. Errors are infrastructure failures around the
/// claim/settle writes themselves; job-level failures are converted into
/// the terminal `failed` state here and do not propagate.
async fn process_next_job(state: &AppState) -> Result<bool, sqlx::Error> {
    let Some(job) = queries::claim_next_job(&state.db).await? else {
        return Ok(false);
    };

    tracing::info!(
        job_id = %job.id,
        file = %job.original_filename,
        submitted_by = %job.submitted_by,
        "processing caution card job"
    );

    // The claim already moved the row to `processing`; this is the
    // notification half of that transition.
    state.events.publish(DomainEvent::JobProcessing { job_id: job.id });

    let started = Instant::now();

    match process_job(state, &job).await {
        Ok(card) => {
            queries::mark_job_completed(&state.db, job.id, card.review_item_id, card.attachment_id)
                .await?;

            state.events.publish(DomainEvent::JobCompleted {
                job_id: job.id,
                review_item_id: card.review_item_id,
                attachment_id: card.attachment_id,
                is_orphaned: card.is_orphaned,
            });

            metrics::counter!("ocr_jobs_completed").increment(1);
            metrics::histogram!("ocr_processing_seconds").record(started.elapsed().as_secs_f64());

            tracing::info!(
                job_id = %job.id,
                review_item_id = %card.review_item_id,
                attachment_id = %card.attachment_id,
                is_orphaned = card.is_orphaned,
                duration_ms = started.elapsed().as_millis() as u64,
                "job completed"
            );
        }
        Err(e) => {
            tracing::error!(job_id = %job.id, error = %e, "job processing failed");

            queries::mark_job_failed(&state.db, job.id, &e.summary()).await?;

            state.events.publish(DomainEvent::JobFailed {
                job_id: job.id,
                error: e.to_string(),
            });

            metrics::counter!("ocr_jobs_failed").increment(1);
        }
    }

    Ok(true)
}

/// OCR then persist. On an OCR failure the staged upload is still cleaned
/// up, matching the persister's own cleanup contract.
async fn process_job(state: &AppState, job: &OcrJob) -> Result<PersistedCard, JobError> {
    let file_path = Path::new(&job.file_path);

    state.events.publish(DomainEvent::JobProgress {
        job_id: job.id,
        stage: "ocr".to_string(),
        message: None,
    });

    let ocr = match state.processor.run(file_path).await {
        Ok(ocr) => ocr,
        Err(e) => {
            persister::cleanup_temp_file(file_path).await;
            return Err(e.into());
        }
    };

    state.events.publish(DomainEvent::JobProgress {
        job_id: job.id,
        stage: "persist".to_string(),
        message: None,
    });

    let card = persister::persist_card(
        &state.db,
        &ocr,
        file_path,
        &job.original_filename,
        &job.mime_type,
        &job.submitted_by,
    )
    .await?;

    Ok(card)
}

/// Anything that can fail a job between claim and settle.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error(transparent)]
    Processor(#[from] ProcessorError),

    #[error(transparent)]
    Persist(#[from] PersistError),
}

impl JobError {
    pub fn kind(&self) -> &'static str {
        match self {
            JobError::Processor(e) => e.kind(),
            JobError::Persist(e) => e.kind(),
        }
    }

    /// JSON error summary stored on the failed job row.
    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "kind": self.kind(),
            "message": self.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_error_summary_carries_stderr() {
        let err = JobError::Processor(ProcessorError::Exit {
            code: Some(1),
            stderr: "decode error".to_string(),
        });

        let summary = err.summary();
        assert_eq!(summary["kind"], "process_exit");
        assert!(summary["message"].as_str().unwrap().contains("decode error"));
    }

    #[test]
    fn extraction_error_summary_kind() {
        let err = JobError::Persist(PersistError::DataExtraction(
            "MRN missing from OCR results".to_string(),
        ));

        let summary = err.summary();
        assert_eq!(summary["kind"], "data_extraction");
        assert!(summary["message"].as_str().unwrap().contains("MRN"));
    }

    #[test]
    fn timeout_error_summary_kind() {
        let err = JobError::Processor(ProcessorError::Timeout { seconds: 30 });
        assert_eq!(err.summary()["kind"], "process_timeout");
    }
}
