//! services/api/src/assembler.rs
//!
//! The progressive result assembler: applies the worker's per-page
//! extraction callbacks. Pages and their sentences are committed in reading
//! order with strictly increasing sequence numbers and are never revised
//! after insertion — that ordering guarantee is what makes it safe for
//! clients to start rendering once the early-unlock threshold is crossed.

use crate::tracker::JobTracker;
use lectern_core::domain::{Page, Sentence};
use lectern_core::ports::{DatabaseService, PortResult};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// One sentence as produced by the extraction worker.
#[derive(Debug, Clone)]
pub struct SentenceResult {
    /// Global reading-order index, supplied by the worker.
    pub sequence: i64,
    pub text: String,
    pub regions: Vec<Vec<[f64; 2]>>,
}

/// One extracted page with its sentences and the job's overall progress at
/// the time the page finished.
#[derive(Debug, Clone)]
pub struct PageResult {
    pub page_number: i32,
    pub width: f64,
    pub height: f64,
    pub text: String,
    pub sentences: Vec<SentenceResult>,
    pub percent: i16,
}

#[derive(Clone)]
pub struct ResultAssembler {
    db: Arc<dyn DatabaseService>,
    tracker: JobTracker,
}

impl ResultAssembler {
    pub fn new(db: Arc<dyn DatabaseService>, tracker: JobTracker) -> Self {
        Self { db, tracker }
    }

    /// Commits one page and its sentences, then advances job progress.
    pub async fn on_page(&self, job_id: Uuid, result: PageResult) -> PortResult<()> {
        let job = self.db.get_job_by_id(job_id).await?;
        if job.status.is_terminal() {
            warn!(
                "Ignoring page {} for job {} already in a terminal state",
                result.page_number, job_id
            );
            return Ok(());
        }

        self.db
            .insert_page(Page {
                document_id: job.document_id,
                page_number: result.page_number,
                width: result.width,
                height: result.height,
                text: result.text,
            })
            .await?;

        let sentences: Vec<Sentence> = result
            .sentences
            .into_iter()
            .map(|s| Sentence {
                document_id: job.document_id,
                page_number: result.page_number,
                sequence: s.sequence,
                text: s.text,
                regions: s.regions,
            })
            .collect();
        if !sentences.is_empty() {
            self.db.insert_sentences(sentences).await?;
        }

        self.tracker.report_progress(job_id, result.percent).await
    }

    /// Forwards a bare progress update (no page payload).
    pub async fn on_progress(&self, job_id: Uuid, percent: i16) -> PortResult<()> {
        self.tracker.report_progress(job_id, percent).await
    }

    /// Final callback. Extraction additionally delivers the concatenated,
    /// speech-cleaned document text, which lands on the document row before
    /// the job is finalized.
    pub async fn on_completed(
        &self,
        job_id: Uuid,
        result_ref: &str,
        document_text: Option<&str>,
    ) -> PortResult<()> {
        if let Some(text) = document_text {
            let job = self.db.get_job_by_id(job_id).await?;
            if job.status.is_terminal() {
                warn!(
                    "Ignoring completion for job {} already in a terminal state",
                    job_id
                );
                return Ok(());
            }
            self.db.set_document_text(job.document_id, text).await?;
            info!(
                "Stored {} characters of document text for job {}",
                text.len(),
                job_id
            );
        }
        self.tracker.report_completed(job_id, result_ref).await
    }

    pub async fn on_failed(&self, job_id: Uuid, error_detail: &str) -> PortResult<()> {
        self.tracker.report_failed(job_id, error_detail).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{document_for, free_user, MemoryDb};
    use lectern_core::domain::{JobKind, JobStatus};

    fn page(page_number: i32, sentences: std::ops::Range<i64>, percent: i16) -> PageResult {
        PageResult {
            page_number,
            width: 612.0,
            height: 792.0,
            text: format!("page {} text", page_number),
            sentences: sentences
                .map(|sequence| SentenceResult {
                    sequence,
                    text: format!("Sentence {}.", sequence),
                    regions: vec![vec![[0.0, 0.0], [10.0, 0.0], [10.0, 2.0], [0.0, 2.0]]],
                })
                .collect(),
            percent,
        }
    }

    fn assembler(db: &Arc<MemoryDb>) -> ResultAssembler {
        let db: Arc<dyn DatabaseService> = db.clone();
        ResultAssembler::new(db.clone(), JobTracker::new(db))
    }

    #[tokio::test]
    async fn pages_unlock_a_partial_view_past_the_threshold() {
        let db = MemoryDb::with_lifetime_tier("free", 10);
        let user = free_user(&db).await;
        let doc = document_for(&db, &user).await;
        let job = db.create_job(doc.id, JobKind::Extraction, None).await.unwrap();
        let asm = assembler(&db);

        asm.on_page(job.id, page(0, 0..14, 16)).await.unwrap();
        asm.on_page(job.id, page(1, 14..27, 18)).await.unwrap();
        asm.on_page(job.id, page(2, 27..40, 20)).await.unwrap();

        let job = db.get_job_by_id(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.completion, 20);
        assert!(job.partial_available());

        // A client polling right now can render all three pages and play
        // sentence 0 before extraction reaches 100%.
        let pages = db.list_pages(doc.id).await.unwrap();
        assert_eq!(pages.len(), 3);
        let sentences = db.list_sentences(doc.id).await.unwrap();
        assert_eq!(sentences.len(), 40);
        assert_eq!(sentences[0].sequence, 0);
    }

    #[tokio::test]
    async fn completed_document_has_contiguous_sequence_numbers() {
        let db = MemoryDb::with_lifetime_tier("free", 10);
        let user = free_user(&db).await;
        let doc = document_for(&db, &user).await;
        let job = db.create_job(doc.id, JobKind::Extraction, None).await.unwrap();
        let asm = assembler(&db);

        asm.on_page(job.id, page(0, 0..5, 40)).await.unwrap();
        asm.on_page(job.id, page(1, 5..9, 70)).await.unwrap();
        asm.on_page(job.id, page(2, 9..12, 85)).await.unwrap();
        asm.on_completed(job.id, "documents/parsed", Some("Sentence 0. Sentence 1."))
            .await
            .unwrap();

        let sentences = db.list_sentences(doc.id).await.unwrap();
        let sequences: Vec<i64> = sentences.iter().map(|s| s.sequence).collect();
        let expected: Vec<i64> = (0..12).collect();
        assert_eq!(sequences, expected);

        let job = db.get_job_by_id(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.completion, 100);

        let doc = db.get_document_by_id(doc.id).await.unwrap();
        assert_eq!(doc.parsed_text.as_deref(), Some("Sentence 0. Sentence 1."));
    }

    #[tokio::test]
    async fn late_page_after_failure_is_ignored() {
        let db = MemoryDb::with_lifetime_tier("free", 10);
        let user = free_user(&db).await;
        let doc = document_for(&db, &user).await;
        let job = db.create_job(doc.id, JobKind::Extraction, None).await.unwrap();
        let asm = assembler(&db);

        asm.on_failed(job.id, "corrupt document").await.unwrap();
        asm.on_page(job.id, page(0, 0..5, 30)).await.unwrap();

        assert!(db.list_pages(doc.id).await.unwrap().is_empty());
        let job = db.get_job_by_id(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
    }
}
