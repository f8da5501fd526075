//! services/api/src/testutil.rs
//!
//! In-memory fakes for the core ports, used by the unit tests across the
//! pipeline modules. `MemoryDb` mirrors the adapter's semantics closely
//! enough to exercise the concurrency-sensitive paths (atomic reservation,
//! terminal-state absorption) without a running database.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use lectern_core::domain::{
    BillingEvent, Document, Job, JobKind, JobStatus, Page, PeriodKind, PlaybackPosition, Sentence,
    TierConfig, UsagePeriod, User,
};
use lectern_core::ports::{
    DatabaseService, PortError, PortResult, SpeechSynthesisService, WorkerPool,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

//=========================================================================================
// MemoryDb
//=========================================================================================

#[derive(Default)]
struct MemoryState {
    users: HashMap<Uuid, User>,
    tiers: HashMap<String, TierConfig>,
    usage: HashMap<(Uuid, &'static str, DateTime<Utc>), UsagePeriod>,
    documents: HashMap<Uuid, Document>,
    /// Insertion order doubles as creation order, so `get_latest_job` has a
    /// deterministic tiebreak even when timestamps collide.
    jobs: Vec<Job>,
    pages: Vec<Page>,
    sentences: Vec<Sentence>,
    positions: HashMap<Uuid, i64>,
    billing_events: HashMap<String, BillingEvent>,
    fail_job_fetches: u32,
    position_writes: usize,
}

pub struct MemoryDb {
    state: Mutex<MemoryState>,
}

impl MemoryDb {
    pub fn with_lifetime_tier(tier: &str, unit_limit: i64) -> Arc<Self> {
        let db = Arc::new(Self {
            state: Mutex::new(MemoryState::default()),
        });
        db.state.lock().unwrap().tiers.insert(
            tier.to_string(),
            TierConfig {
                tier: tier.to_string(),
                unit_limit,
                period_kind: PeriodKind::Lifetime,
            },
        );
        db
    }

    pub fn set_tier_limit(&self, tier: &str, unit_limit: i64) {
        if let Some(config) = self.state.lock().unwrap().tiers.get_mut(tier) {
            config.unit_limit = unit_limit;
        }
    }

    pub fn set_unlimited(&self, user_id: Uuid) {
        if let Some(user) = self.state.lock().unwrap().users.get_mut(&user_id) {
            user.unlimited_quota = true;
        }
    }

    /// Makes the next `n` `get_job_by_id` calls fail, simulating transient
    /// network trouble for the poll loop.
    pub fn fail_next_job_fetches(&self, n: u32) {
        self.state.lock().unwrap().fail_job_fetches = n;
    }

    pub fn position_writes(&self) -> usize {
        self.state.lock().unwrap().position_writes
    }
}

#[async_trait]
impl DatabaseService for MemoryDb {
    async fn get_user(&self, user_id: Uuid) -> PortResult<User> {
        self.state
            .lock()
            .unwrap()
            .users
            .get(&user_id)
            .cloned()
            .ok_or_else(|| PortError::NotFound(format!("User {} not found", user_id)))
    }

    async fn get_or_create_user(&self, user_id: Uuid) -> PortResult<User> {
        let mut state = self.state.lock().unwrap();
        let user = state.users.entry(user_id).or_insert_with(|| User {
            user_id,
            email: None,
            tier: "free".to_string(),
            unlimited_quota: false,
            billing_period_start: None,
            billing_period_end: None,
            created_at: Utc::now(),
        });
        Ok(user.clone())
    }

    async fn get_tier_config(&self, tier: &str) -> PortResult<TierConfig> {
        self.state
            .lock()
            .unwrap()
            .tiers
            .get(tier)
            .cloned()
            .ok_or_else(|| PortError::Unexpected(format!("No tier config row for tier '{}'", tier)))
    }

    async fn update_user_tier(&self, user_id: Uuid, tier: &str) -> PortResult<()> {
        let mut state = self.state.lock().unwrap();
        let user = state
            .users
            .get_mut(&user_id)
            .ok_or_else(|| PortError::NotFound(format!("User {} not found", user_id)))?;
        user.tier = tier.to_string();
        Ok(())
    }

    async fn update_billing_period(
        &self,
        user_id: Uuid,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> PortResult<()> {
        let mut state = self.state.lock().unwrap();
        let user = state
            .users
            .get_mut(&user_id)
            .ok_or_else(|| PortError::NotFound(format!("User {} not found", user_id)))?;
        user.billing_period_start = Some(period_start);
        user.billing_period_end = Some(period_end);
        Ok(())
    }

    async fn get_usage_period(
        &self,
        user_id: Uuid,
        kind: PeriodKind,
        period_start: DateTime<Utc>,
    ) -> PortResult<Option<UsagePeriod>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .usage
            .get(&(user_id, kind.as_str(), period_start))
            .cloned())
    }

    async fn insert_usage_period(&self, record: UsagePeriod) -> PortResult<UsagePeriod> {
        let mut state = self.state.lock().unwrap();
        let key = (record.user_id, record.period_kind.as_str(), record.period_start);
        let entry = state.usage.entry(key).or_insert_with(|| record.clone());
        entry.unit_limit = record.unit_limit;
        entry.period_end = record.period_end;
        Ok(entry.clone())
    }

    async fn refresh_usage_snapshot(
        &self,
        user_id: Uuid,
        kind: PeriodKind,
        period_start: DateTime<Utc>,
        unit_limit: i64,
        period_end: Option<DateTime<Utc>>,
    ) -> PortResult<UsagePeriod> {
        let mut state = self.state.lock().unwrap();
        let record = state
            .usage
            .get_mut(&(user_id, kind.as_str(), period_start))
            .ok_or_else(|| {
                PortError::NotFound(format!(
                    "Usage period for user {} starting {} not found",
                    user_id, period_start
                ))
            })?;
        record.unit_limit = unit_limit;
        record.period_end = period_end;
        Ok(record.clone())
    }

    async fn consume_units(
        &self,
        user_id: Uuid,
        kind: PeriodKind,
        period_start: DateTime<Utc>,
        units: i64,
        enforce_limit: bool,
    ) -> PortResult<UsagePeriod> {
        // The mutex plays the role of the database's row lock: the check
        // and the increment are one critical section.
        let mut state = self.state.lock().unwrap();
        let record = state
            .usage
            .get_mut(&(user_id, kind.as_str(), period_start))
            .ok_or_else(|| {
                PortError::NotFound(format!(
                    "Usage period for user {} starting {} not found",
                    user_id, period_start
                ))
            })?;
        if enforce_limit && record.units_used + units > record.unit_limit {
            return Err(PortError::QuotaExceeded);
        }
        record.units_used += units;
        Ok(record.clone())
    }

    async fn create_document(
        &self,
        user_id: Uuid,
        file_name: &str,
        storage_path: &str,
    ) -> PortResult<Document> {
        let document = Document {
            id: Uuid::new_v4(),
            user_id,
            file_name: file_name.to_string(),
            storage_path: storage_path.to_string(),
            parsed_text: None,
            created_at: Utc::now(),
        };
        self.state
            .lock()
            .unwrap()
            .documents
            .insert(document.id, document.clone());
        Ok(document)
    }

    async fn get_document_by_id(&self, document_id: Uuid) -> PortResult<Document> {
        self.state
            .lock()
            .unwrap()
            .documents
            .get(&document_id)
            .cloned()
            .ok_or_else(|| PortError::NotFound(format!("Document {} not found", document_id)))
    }

    async fn set_document_text(&self, document_id: Uuid, parsed_text: &str) -> PortResult<()> {
        let mut state = self.state.lock().unwrap();
        let document = state
            .documents
            .get_mut(&document_id)
            .ok_or_else(|| PortError::NotFound(format!("Document {} not found", document_id)))?;
        document.parsed_text = Some(parsed_text.to_string());
        Ok(())
    }

    async fn create_job(
        &self,
        document_id: Uuid,
        kind: JobKind,
        attempt_of: Option<Uuid>,
    ) -> PortResult<Job> {
        let mut state = self.state.lock().unwrap();
        // Spread creation times so "latest by creation" stays meaningful
        // inside one fast test.
        let created_at = Utc::now() + ChronoDuration::microseconds(state.jobs.len() as i64);
        let job = Job {
            id: Uuid::new_v4(),
            document_id,
            kind,
            status: JobStatus::Pending,
            completion: 0,
            error_detail: None,
            result_ref: None,
            attempt_of,
            created_at,
            updated_at: created_at,
        };
        state.jobs.push(job.clone());
        Ok(job)
    }

    async fn get_job_by_id(&self, job_id: Uuid) -> PortResult<Job> {
        let mut state = self.state.lock().unwrap();
        if state.fail_job_fetches > 0 {
            state.fail_job_fetches -= 1;
            return Err(PortError::Unexpected("connection reset".to_string()));
        }
        state
            .jobs
            .iter()
            .find(|j| j.id == job_id)
            .cloned()
            .ok_or_else(|| PortError::NotFound(format!("Job {} not found", job_id)))
    }

    async fn get_latest_job(&self, document_id: Uuid, kind: JobKind) -> PortResult<Option<Job>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .jobs
            .iter()
            .rev()
            .find(|j| j.document_id == document_id && j.kind == kind)
            .cloned())
    }

    async fn list_jobs(&self, document_id: Uuid, kind: JobKind) -> PortResult<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .state
            .lock()
            .unwrap()
            .jobs
            .iter()
            .filter(|j| j.document_id == document_id && j.kind == kind)
            .cloned()
            .collect();
        jobs.reverse();
        Ok(jobs)
    }

    async fn update_job_progress(
        &self,
        job_id: Uuid,
        status: JobStatus,
        completion: i16,
    ) -> PortResult<Option<Job>> {
        let mut state = self.state.lock().unwrap();
        let Some(job) = state.jobs.iter_mut().find(|j| j.id == job_id) else {
            return Ok(None);
        };
        if job.status.is_terminal() {
            return Ok(None);
        }
        job.status = status;
        job.completion = completion;
        job.updated_at = Utc::now();
        Ok(Some(job.clone()))
    }

    async fn finalize_job(
        &self,
        job_id: Uuid,
        status: JobStatus,
        result_ref: Option<&str>,
        error_detail: Option<&str>,
    ) -> PortResult<Option<Job>> {
        let mut state = self.state.lock().unwrap();
        let Some(job) = state.jobs.iter_mut().find(|j| j.id == job_id) else {
            return Ok(None);
        };
        if job.status.is_terminal() {
            return Ok(None);
        }
        job.status = status;
        job.completion = if status == JobStatus::Completed { 100 } else { 0 };
        job.result_ref = result_ref.map(str::to_string);
        job.error_detail = error_detail.map(str::to_string);
        job.updated_at = Utc::now();
        Ok(Some(job.clone()))
    }

    async fn insert_page(&self, page: Page) -> PortResult<()> {
        self.state.lock().unwrap().pages.push(page);
        Ok(())
    }

    async fn insert_sentences(&self, sentences: Vec<Sentence>) -> PortResult<()> {
        self.state.lock().unwrap().sentences.extend(sentences);
        Ok(())
    }

    async fn list_pages(&self, document_id: Uuid) -> PortResult<Vec<Page>> {
        let mut pages: Vec<Page> = self
            .state
            .lock()
            .unwrap()
            .pages
            .iter()
            .filter(|p| p.document_id == document_id)
            .cloned()
            .collect();
        pages.sort_by_key(|p| p.page_number);
        Ok(pages)
    }

    async fn list_sentences(&self, document_id: Uuid) -> PortResult<Vec<Sentence>> {
        let mut sentences: Vec<Sentence> = self
            .state
            .lock()
            .unwrap()
            .sentences
            .iter()
            .filter(|s| s.document_id == document_id)
            .cloned()
            .collect();
        sentences.sort_by_key(|s| s.sequence);
        Ok(sentences)
    }

    async fn get_sentence(
        &self,
        document_id: Uuid,
        sequence: i64,
    ) -> PortResult<Option<Sentence>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .sentences
            .iter()
            .find(|s| s.document_id == document_id && s.sequence == sequence)
            .cloned())
    }

    async fn upsert_playback_position(
        &self,
        document_id: Uuid,
        sentence_index: i64,
    ) -> PortResult<()> {
        let mut state = self.state.lock().unwrap();
        state.positions.insert(document_id, sentence_index);
        state.position_writes += 1;
        Ok(())
    }

    async fn get_playback_position(
        &self,
        document_id: Uuid,
    ) -> PortResult<Option<PlaybackPosition>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .positions
            .get(&document_id)
            .map(|&sentence_index| PlaybackPosition {
                document_id,
                sentence_index,
            }))
    }

    async fn record_billing_event(&self, event_id: &str, kind: &str) -> PortResult<bool> {
        let mut state = self.state.lock().unwrap();
        if state.billing_events.contains_key(event_id) {
            return Ok(false);
        }
        state.billing_events.insert(
            event_id.to_string(),
            BillingEvent {
                event_id: event_id.to_string(),
                kind: kind.to_string(),
                received_at: Utc::now(),
                error: None,
            },
        );
        Ok(true)
    }

    async fn set_billing_event_error(&self, event_id: &str, error: &str) -> PortResult<()> {
        let mut state = self.state.lock().unwrap();
        let event = state
            .billing_events
            .get_mut(event_id)
            .ok_or_else(|| PortError::NotFound(format!("Billing event {} not found", event_id)))?;
        event.error = Some(error.to_string());
        Ok(())
    }

    async fn get_billing_event(&self, event_id: &str) -> PortResult<Option<BillingEvent>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .billing_events
            .get(event_id)
            .cloned())
    }
}

//=========================================================================================
// Worker / Synthesis / Sink Fakes
//=========================================================================================

/// A `WorkerPool` fake that records submissions and can be scripted to be
/// unreachable.
pub struct ScriptedWorker {
    fail: bool,
    submissions: Mutex<Vec<(Uuid, &'static str)>>,
}

impl ScriptedWorker {
    pub fn reliable() -> Arc<Self> {
        Arc::new(Self {
            fail: false,
            submissions: Mutex::new(Vec::new()),
        })
    }

    pub fn unavailable() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            submissions: Mutex::new(Vec::new()),
        })
    }

    pub fn submissions(&self) -> Vec<(Uuid, &'static str)> {
        self.submissions.lock().unwrap().clone()
    }

    fn accept(&self, job_id: Uuid, kind: &'static str) -> PortResult<String> {
        if self.fail {
            return Err(PortError::Unexpected("connection refused".to_string()));
        }
        let mut submissions = self.submissions.lock().unwrap();
        submissions.push((job_id, kind));
        Ok(format!("task-{}", submissions.len()))
    }
}

#[async_trait]
impl WorkerPool for ScriptedWorker {
    async fn submit_extraction(&self, _document: &Document, job_id: Uuid) -> PortResult<String> {
        self.accept(job_id, "extraction")
    }

    async fn submit_conversion(&self, _document: &Document, job_id: Uuid) -> PortResult<String> {
        self.accept(job_id, "conversion")
    }
}

/// A `SpeechSynthesisService` fake: the "audio" for a sentence is its UTF-8
/// text, which lets tests identify what was synthesized and played.
pub struct FakeSynth {
    delay: Duration,
    fail_remaining: Mutex<u32>,
    calls: Mutex<Vec<String>>,
}

impl FakeSynth {
    pub fn instant() -> Arc<Self> {
        Self::with_delay(Duration::ZERO)
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            fail_remaining: Mutex::new(0),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn failing_first(n: u32) -> Arc<Self> {
        let synth = Self::instant();
        *synth.fail_remaining.lock().unwrap() = n;
        synth
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn texts(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl SpeechSynthesisService for FakeSynth {
    async fn synthesize(&self, text: &str) -> PortResult<Vec<u8>> {
        self.calls.lock().unwrap().push(text.to_string());
        if self.delay > Duration::ZERO {
            tokio::time::sleep(self.delay).await;
        }
        {
            let mut remaining = self.fail_remaining.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(PortError::Unexpected("synthesis backend down".to_string()));
            }
        }
        Ok(text.as_bytes().to_vec())
    }
}

/// An `AudioSink` fake. Playback is recorded when it starts; the optional
/// delay stands in for the audio's natural duration.
pub struct FakeSink {
    delay: Duration,
    plays: Mutex<Vec<Vec<u8>>>,
}

impl FakeSink {
    pub fn instant() -> Arc<Self> {
        Self::with_delay(Duration::ZERO)
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            plays: Mutex::new(Vec::new()),
        })
    }

    pub fn play_count(&self) -> usize {
        self.plays.lock().unwrap().len()
    }

    pub fn played_texts(&self) -> Vec<String> {
        self.plays
            .lock()
            .unwrap()
            .iter()
            .map(|audio| String::from_utf8_lossy(audio).into_owned())
            .collect()
    }
}

#[async_trait]
impl lectern_core::ports::AudioSink for FakeSink {
    async fn play(&self, audio: &[u8]) -> PortResult<()> {
        self.plays.lock().unwrap().push(audio.to_vec());
        if self.delay > Duration::ZERO {
            tokio::time::sleep(self.delay).await;
        }
        Ok(())
    }
}

//=========================================================================================
// Seed Helpers
//=========================================================================================

/// Creates a fresh free-tier user.
pub async fn free_user(db: &Arc<MemoryDb>) -> User {
    db.get_or_create_user(Uuid::new_v4()).await.unwrap()
}

/// Creates a document owned by `user`.
pub async fn document_for(db: &Arc<MemoryDb>, user: &User) -> Document {
    db.create_document(user.user_id, "paper.pdf", "uploads/paper.pdf")
        .await
        .unwrap()
}

/// Seeds `count` sentences ("Sentence 0." .. ) for a document.
pub async fn seed_sentences(db: &Arc<MemoryDb>, document_id: Uuid, count: usize) {
    let sentences = (0..count)
        .map(|i| Sentence {
            document_id,
            page_number: 0,
            sequence: i as i64,
            text: format!("Sentence {}.", i),
            regions: vec![vec![[0.0, 0.0], [10.0, 0.0], [10.0, 2.0], [0.0, 2.0]]],
        })
        .collect();
    db.insert_sentences(sentences).await.unwrap();
}
