//! services/api/src/gateway.rs
//!
//! The admission gateway: validates ownership, reserves quota, creates the
//! job row, and dispatches to the compute pool. Reservation happens before
//! dispatch so a burst of concurrent submissions cannot pass a stale quota
//! check and overshoot the limit.

use crate::quota::QuotaLedger;
use crate::tracker::JobTracker;
use lectern_core::domain::{JobKind, JobStatus};
use lectern_core::ports::{DatabaseService, PortError, WorkerPool};
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

/// The user-facing admission error taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    /// The caller does not own the document.
    #[error("Document does not belong to this user")]
    Forbidden,

    /// An extraction for this document is already pending or running; the
    /// client should poll the existing job instead of resubmitting.
    #[error("An extraction job for this document is already in progress")]
    AlreadyInProgress,

    /// Terminal rejection; surfaced as an upgrade prompt, never retried.
    #[error("Usage limit reached for the current period")]
    QuotaExceeded,

    /// Dispatch to the compute pool failed before the worker accepted the
    /// job. The job row is marked failed with this detail.
    #[error("Worker pool unavailable: {0}")]
    WorkerUnavailable(String),

    #[error("Service Port Error: {0}")]
    Port(PortError),
}

impl From<PortError> for SubmitError {
    fn from(e: PortError) -> Self {
        match e {
            PortError::QuotaExceeded => SubmitError::QuotaExceeded,
            other => SubmitError::Port(other),
        }
    }
}

#[derive(Clone)]
pub struct AdmissionGateway {
    db: Arc<dyn DatabaseService>,
    ledger: QuotaLedger,
    tracker: JobTracker,
    worker: Arc<dyn WorkerPool>,
}

impl AdmissionGateway {
    pub fn new(
        db: Arc<dyn DatabaseService>,
        ledger: QuotaLedger,
        tracker: JobTracker,
        worker: Arc<dyn WorkerPool>,
    ) -> Self {
        Self {
            db,
            ledger,
            tracker,
            worker,
        }
    }

    /// Admits one unit of pipeline work and returns the new job id without
    /// waiting for the work itself.
    pub async fn submit(
        &self,
        user_id: Uuid,
        document_id: Uuid,
        kind: JobKind,
        units_required: i64,
    ) -> Result<Uuid, SubmitError> {
        let user = self.db.get_user(user_id).await?;
        let document = self.db.get_document_by_id(document_id).await?;
        if document.user_id != user_id {
            return Err(SubmitError::Forbidden);
        }

        // At most one concurrent extraction per document; a new upload
        // supersedes the prior job instead of racing it.
        if kind == JobKind::Extraction {
            if let Some(job) = self.tracker.get_latest(document_id, kind).await? {
                if !job.status.is_terminal() {
                    return Err(SubmitError::AlreadyInProgress);
                }
            }
        }

        // Cheap rejection before touching the atomic path.
        if !self.ledger.can_consume(&user, units_required).await? {
            return Err(SubmitError::QuotaExceeded);
        }

        // The atomic reserve is the single point of truth; losing the race
        // here is still a QuotaExceeded.
        self.ledger.reserve(&user, units_required).await?;

        // Conversion retries keep an audit trail back to the attempt they
        // replace.
        let attempt_of = match self.tracker.get_latest(document_id, kind).await? {
            Some(prev) if prev.status == JobStatus::Failed => Some(prev.id),
            _ => None,
        };

        let job = self.db.create_job(document_id, kind, attempt_of).await?;

        let dispatched = match kind {
            JobKind::Extraction => self.worker.submit_extraction(&document, job.id).await,
            JobKind::Conversion => self.worker.submit_conversion(&document, job.id).await,
        };

        match dispatched {
            Ok(worker_ref) => {
                info!(
                    "Submitted {} job {} for document {} (worker task {})",
                    kind.as_str(),
                    job.id,
                    document_id,
                    worker_ref
                );
                Ok(job.id)
            }
            Err(e) => {
                // Quota stays charged: admission consumed the slot even
                // though the pool never started. Flagged as a product
                // decision, not a bug.
                error!("Dispatch of job {} failed: {}", job.id, e);
                let detail = format!("Worker pool unavailable: {}", e);
                self.tracker.report_failed(job.id, &detail).await?;
                Err(SubmitError::WorkerUnavailable(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{document_for, free_user, MemoryDb, ScriptedWorker};
    use lectern_core::domain::JobKind;

    fn gateway(db: &Arc<MemoryDb>, worker: Arc<ScriptedWorker>) -> AdmissionGateway {
        let db: Arc<dyn DatabaseService> = db.clone();
        AdmissionGateway::new(
            db.clone(),
            QuotaLedger::new(db.clone()),
            JobTracker::new(db.clone()),
            worker,
        )
    }

    #[tokio::test]
    async fn rejects_documents_owned_by_someone_else() {
        let db = MemoryDb::with_lifetime_tier("free", 10);
        let owner = free_user(&db).await;
        let intruder = free_user(&db).await;
        let doc = document_for(&db, &owner).await;
        let gw = gateway(&db, ScriptedWorker::reliable());

        let err = gw
            .submit(intruder.user_id, doc.id, JobKind::Extraction, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::Forbidden));
    }

    #[tokio::test]
    async fn rejects_duplicate_extraction_submissions() {
        let db = MemoryDb::with_lifetime_tier("free", 10);
        let user = free_user(&db).await;
        let doc = document_for(&db, &user).await;
        let worker = ScriptedWorker::reliable();
        let gw = gateway(&db, worker.clone());

        let job_id = gw
            .submit(user.user_id, doc.id, JobKind::Extraction, 1)
            .await
            .unwrap();
        let err = gw
            .submit(user.user_id, doc.id, JobKind::Extraction, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::AlreadyInProgress));

        // Only the first submission reached the pool.
        assert_eq!(worker.submissions(), vec![(job_id, "extraction")]);
    }

    #[tokio::test]
    async fn last_unit_goes_to_exactly_one_of_two_racers() {
        let db = MemoryDb::with_lifetime_tier("free", 10);
        let user = free_user(&db).await;
        let doc_a = document_for(&db, &user).await;
        let doc_b = document_for(&db, &user).await;
        let gw = gateway(&db, ScriptedWorker::reliable());

        // Burn nine of the ten lifetime units.
        for _ in 0..9 {
            let doc = document_for(&db, &user).await;
            gw.submit(user.user_id, doc.id, JobKind::Extraction, 1)
                .await
                .unwrap();
        }

        let gw_a = gw.clone();
        let gw_b = gw.clone();
        let uid = user.user_id;
        let a = tokio::spawn(async move { gw_a.submit(uid, doc_a.id, JobKind::Extraction, 1).await });
        let b = tokio::spawn(async move { gw_b.submit(uid, doc_b.id, JobKind::Extraction, 1).await });

        let results = [a.await.unwrap(), b.await.unwrap()];
        let granted = results.iter().filter(|r| r.is_ok()).count();
        let quota_rejected = results
            .iter()
            .filter(|r| matches!(r, Err(SubmitError::QuotaExceeded)))
            .count();
        assert_eq!(granted, 1);
        assert_eq!(quota_rejected, 1);
    }

    #[tokio::test]
    async fn dispatch_failure_marks_job_failed_and_keeps_quota_charged() {
        let db = MemoryDb::with_lifetime_tier("free", 10);
        let user = free_user(&db).await;
        let doc = document_for(&db, &user).await;
        let gw = gateway(&db, ScriptedWorker::unavailable());

        let err = gw
            .submit(user.user_id, doc.id, JobKind::Extraction, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::WorkerUnavailable(_)));

        let job = db
            .get_latest_job(doc.id, JobKind::Extraction)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error_detail.unwrap().contains("unavailable"));

        // Admission charged the slot; the failed dispatch does not refund it.
        let ledger = QuotaLedger::new(db.clone() as Arc<dyn DatabaseService>);
        let usage = ledger.get_or_create_usage(&user).await.unwrap();
        assert_eq!(usage.units_used, 1);
    }

    #[tokio::test]
    async fn conversion_retry_creates_a_new_row_with_audit_link() {
        let db = MemoryDb::with_lifetime_tier("free", 10);
        let user = free_user(&db).await;
        let doc = document_for(&db, &user).await;
        let gw = gateway(&db, ScriptedWorker::reliable());
        let tracker = JobTracker::new(db.clone() as Arc<dyn DatabaseService>);

        let first = gw
            .submit(user.user_id, doc.id, JobKind::Conversion, 1)
            .await
            .unwrap();
        tracker.report_failed(first, "synthesis crashed").await.unwrap();

        let second = gw
            .submit(user.user_id, doc.id, JobKind::Conversion, 1)
            .await
            .unwrap();
        assert_ne!(first, second);

        let latest = tracker
            .get_latest(doc.id, JobKind::Conversion)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.id, second);
        assert_eq!(latest.attempt_of, Some(first));

        let history = tracker.history(doc.id, JobKind::Conversion).await.unwrap();
        assert!(history
            .iter()
            .any(|j| j.id == first && j.status == JobStatus::Failed));
    }
}
