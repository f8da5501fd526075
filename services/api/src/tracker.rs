//! services/api/src/tracker.rs
//!
//! The job tracker: a persisted state machine for extraction and conversion
//! jobs. Writes come only from worker callbacks; terminal states are final
//! and silently absorb any late or duplicated message, which keeps the
//! pipeline safe under at-least-once callback delivery.

use lectern_core::domain::{Job, JobKind, JobStatus};
use lectern_core::ports::{DatabaseService, PortResult};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct JobTracker {
    db: Arc<dyn DatabaseService>,
}

impl JobTracker {
    pub fn new(db: Arc<dyn DatabaseService>) -> Self {
        Self { db }
    }

    // --- Read API (safe to poll) ---

    pub async fn get_by_id(&self, job_id: Uuid) -> PortResult<Job> {
        self.db.get_job_by_id(job_id).await
    }

    /// Most recently created job of the given kind. Retries create new
    /// rows, so this is the authoritative one for display.
    pub async fn get_latest(&self, document_id: Uuid, kind: JobKind) -> PortResult<Option<Job>> {
        self.db.get_latest_job(document_id, kind).await
    }

    pub async fn history(&self, document_id: Uuid, kind: JobKind) -> PortResult<Vec<Job>> {
        self.db.list_jobs(document_id, kind).await
    }

    // --- Write API (worker callbacks only) ---

    /// Applies a progress percentage. A job in `Pending` moves to `Running`
    /// on its first non-zero progress report.
    pub async fn report_progress(&self, job_id: Uuid, percent: i16) -> PortResult<()> {
        let percent = percent.clamp(0, 100);
        let current = self.db.get_job_by_id(job_id).await?;
        if current.status.is_terminal() {
            warn!(
                "Ignoring progress {}% for job {} already in a terminal state",
                percent, job_id
            );
            return Ok(());
        }
        let status = if percent > 0 {
            JobStatus::Running
        } else {
            current.status
        };
        match self.db.update_job_progress(job_id, status, percent).await? {
            Some(job) => {
                info!("Job {} progress {}% ({})", job.id, percent, job.status.as_str());
            }
            None => {
                warn!(
                    "Ignoring progress {}% for job {} already in a terminal state",
                    percent, job_id
                );
            }
        }
        Ok(())
    }

    /// Marks a job completed with its result reference.
    pub async fn report_completed(&self, job_id: Uuid, result_ref: &str) -> PortResult<()> {
        match self
            .db
            .finalize_job(job_id, JobStatus::Completed, Some(result_ref), None)
            .await?
        {
            Some(job) => info!("Job {} completed with result {}", job.id, result_ref),
            None => warn!(
                "Ignoring completion for job {} already in a terminal state",
                job_id
            ),
        }
        Ok(())
    }

    /// Marks a job failed with a user-visible error detail.
    pub async fn report_failed(&self, job_id: Uuid, error_detail: &str) -> PortResult<()> {
        match self
            .db
            .finalize_job(job_id, JobStatus::Failed, None, Some(error_detail))
            .await?
        {
            Some(job) => warn!("Job {} failed: {}", job.id, error_detail),
            None => warn!(
                "Ignoring failure for job {} already in a terminal state",
                job_id
            ),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{document_for, free_user, MemoryDb};
    use lectern_core::domain::{JobKind, JobStatus};

    #[tokio::test]
    async fn progress_moves_pending_to_running() {
        let db = MemoryDb::with_lifetime_tier("free", 10);
        let user = free_user(&db).await;
        let doc = document_for(&db, &user).await;
        let job = db.create_job(doc.id, JobKind::Extraction, None).await.unwrap();
        let tracker = JobTracker::new(db.clone());

        tracker.report_progress(job.id, 30).await.unwrap();
        let job = tracker.get_by_id(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.completion, 30);
    }

    #[tokio::test]
    async fn terminal_status_is_never_overwritten() {
        let db = MemoryDb::with_lifetime_tier("free", 10);
        let user = free_user(&db).await;
        let doc = document_for(&db, &user).await;
        let job = db.create_job(doc.id, JobKind::Extraction, None).await.unwrap();
        let tracker = JobTracker::new(db.clone());

        tracker.report_completed(job.id, "artifact.mp3").await.unwrap();
        // A delayed out-of-order progress callback must not reopen the job.
        tracker.report_progress(job.id, 60).await.unwrap();
        tracker.report_failed(job.id, "late failure").await.unwrap();

        let job = tracker.get_by_id(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.completion, 100);
        assert_eq!(job.result_ref.as_deref(), Some("artifact.mp3"));
        assert!(job.error_detail.is_none());
    }

    #[tokio::test]
    async fn duplicate_terminal_callback_is_a_noop() {
        let db = MemoryDb::with_lifetime_tier("free", 10);
        let user = free_user(&db).await;
        let doc = document_for(&db, &user).await;
        let job = db.create_job(doc.id, JobKind::Conversion, None).await.unwrap();
        let tracker = JobTracker::new(db.clone());

        tracker.report_failed(job.id, "worker crashed").await.unwrap();
        tracker.report_failed(job.id, "worker crashed").await.unwrap();

        let job = tracker.get_by_id(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_detail.as_deref(), Some("worker crashed"));
    }

    #[tokio::test]
    async fn latest_job_reflects_retry_rows() {
        let db = MemoryDb::with_lifetime_tier("free", 10);
        let user = free_user(&db).await;
        let doc = document_for(&db, &user).await;
        let tracker = JobTracker::new(db.clone());

        let first = db.create_job(doc.id, JobKind::Conversion, None).await.unwrap();
        tracker.report_failed(first.id, "out of memory").await.unwrap();
        let retry = db
            .create_job(doc.id, JobKind::Conversion, Some(first.id))
            .await
            .unwrap();

        let latest = tracker.get_latest(doc.id, JobKind::Conversion).await.unwrap().unwrap();
        assert_eq!(latest.id, retry.id);
        assert_eq!(latest.attempt_of, Some(first.id));

        let history = tracker.history(doc.id, JobKind::Conversion).await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.iter().any(|j| j.id == first.id && j.status == JobStatus::Failed));
    }
}
