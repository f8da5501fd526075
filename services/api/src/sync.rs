//! services/api/src/sync.rs
//!
//! The client sync protocol: one polling loop per job id keeps a viewer
//! consistent with server-side job state. The registry is an explicit keyed
//! collection with a defined lifecycle (insert on start, remove on stop) —
//! no ambient global state. Polling is single-flight per job id, survives
//! transient fetch errors, and tears down exactly once when the job reaches
//! a terminal state or the viewing session ends.

use crate::tracker::JobTracker;
use lectern_core::domain::Job;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

struct PollHandle {
    stop: CancellationToken,
    nudge: Arc<Notify>,
    receiver: watch::Receiver<Option<Job>>,
}

/// Per-session registry of active job poll loops.
#[derive(Clone)]
pub struct PollRegistry {
    tracker: JobTracker,
    interval: Duration,
    active: Arc<Mutex<HashMap<Uuid, PollHandle>>>,
}

impl PollRegistry {
    pub fn new(tracker: JobTracker, interval: Duration) -> Self {
        Self {
            tracker,
            interval,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Begins polling a job, or returns the existing subscription when a
    /// loop for this job id is already running (single-flight).
    pub fn start(&self, job_id: Uuid) -> watch::Receiver<Option<Job>> {
        let mut active = self.active.lock().unwrap();
        if let Some(handle) = active.get(&job_id) {
            return handle.receiver.clone();
        }

        let (tx, rx) = watch::channel(None);
        let stop = CancellationToken::new();
        let nudge = Arc::new(Notify::new());
        active.insert(
            job_id,
            PollHandle {
                stop: stop.clone(),
                nudge: nudge.clone(),
                receiver: rx.clone(),
            },
        );
        drop(active);

        let tracker = self.tracker.clone();
        let registry = self.active.clone();
        let interval = self.interval;
        tokio::spawn(async move {
            poll_loop(tracker, registry, interval, job_id, tx, stop, nudge).await;
        });

        rx
    }

    /// Forces one immediate out-of-band poll, used when the viewer regains
    /// foreground visibility. A liveness nudge only; the next scheduled
    /// tick would converge anyway. Unknown job ids are ignored.
    pub fn nudge(&self, job_id: Uuid) {
        if let Some(handle) = self.active.lock().unwrap().get(&job_id) {
            handle.nudge.notify_one();
        }
    }

    /// Tears down the poll loop for a job. Safe to call repeatedly and
    /// after the loop has already ended on its own.
    pub fn stop(&self, job_id: Uuid) {
        if let Some(handle) = self.active.lock().unwrap().remove(&job_id) {
            handle.stop.cancel();
            info!("Stopped polling job {}", job_id);
        }
    }

    /// Ends every poll loop, for viewing-session shutdown.
    pub fn stop_all(&self) {
        let mut active = self.active.lock().unwrap();
        for (job_id, handle) in active.drain() {
            handle.stop.cancel();
            info!("Stopped polling job {}", job_id);
        }
    }

    /// Number of live poll loops, mainly for diagnostics.
    pub fn active_count(&self) -> usize {
        self.active.lock().unwrap().len()
    }
}

async fn poll_loop(
    tracker: JobTracker,
    registry: Arc<Mutex<HashMap<Uuid, PollHandle>>>,
    interval: Duration,
    job_id: Uuid,
    tx: watch::Sender<Option<Job>>,
    stop: CancellationToken,
    nudge: Arc<Notify>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {}
            _ = nudge.notified() => {}
        }

        match tracker.get_by_id(job_id).await {
            Ok(job) => {
                let terminal = job.status.is_terminal();
                if tx.send(Some(job)).is_err() {
                    // Every subscriber is gone; the viewer left.
                    break;
                }
                if terminal {
                    info!("Job {} reached a terminal state; polling stops", job_id);
                    break;
                }
            }
            Err(e) => {
                // Transient fetch failures keep the loop alive; only a
                // definitive terminal status or an explicit stop ends it.
                warn!("Poll for job {} failed (will retry): {}", job_id, e);
            }
        }
    }

    // Both teardown paths land here; removal is idempotent so racing an
    // explicit stop() is harmless.
    registry.lock().unwrap().remove(&job_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{document_for, free_user, MemoryDb};
    use lectern_core::domain::{JobKind, JobStatus};
    use lectern_core::ports::DatabaseService;
    use std::time::Duration;
    use tokio::time::timeout;

    fn registry(db: &Arc<MemoryDb>, interval_ms: u64) -> PollRegistry {
        let db: Arc<dyn DatabaseService> = db.clone();
        PollRegistry::new(JobTracker::new(db), Duration::from_millis(interval_ms))
    }

    async fn wait_for<F>(rx: &mut watch::Receiver<Option<Job>>, predicate: F) -> Job
    where
        F: Fn(&Job) -> bool,
    {
        timeout(Duration::from_secs(5), async {
            loop {
                {
                    let current = rx.borrow();
                    if let Some(job) = current.as_ref() {
                        if predicate(job) {
                            return job.clone();
                        }
                    }
                }
                rx.changed().await.expect("poll loop dropped the channel");
            }
        })
        .await
        .expect("timed out waiting for job update")
    }

    #[tokio::test]
    async fn start_is_single_flight_per_job_id() {
        let db = MemoryDb::with_lifetime_tier("free", 10);
        let user = free_user(&db).await;
        let doc = document_for(&db, &user).await;
        let job = db.create_job(doc.id, JobKind::Extraction, None).await.unwrap();
        let registry = registry(&db, 10);

        let _rx1 = registry.start(job.id);
        let _rx2 = registry.start(job.id);
        assert_eq!(registry.active_count(), 1);

        registry.stop(job.id);
        assert_eq!(registry.active_count(), 0);
    }

    #[tokio::test]
    async fn loop_tears_down_on_terminal_status() {
        let db = MemoryDb::with_lifetime_tier("free", 10);
        let user = free_user(&db).await;
        let doc = document_for(&db, &user).await;
        let job = db.create_job(doc.id, JobKind::Extraction, None).await.unwrap();
        let registry = registry(&db, 10);

        let mut rx = registry.start(job.id);
        wait_for(&mut rx, |j| j.status == JobStatus::Pending).await;

        db.finalize_job(job.id, JobStatus::Completed, Some("done"), None)
            .await
            .unwrap();
        let last = wait_for(&mut rx, |j| j.status.is_terminal()).await;
        assert_eq!(last.status, JobStatus::Completed);

        timeout(Duration::from_secs(5), async {
            while registry.active_count() != 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("loop did not tear itself down");
    }

    #[tokio::test]
    async fn transient_fetch_errors_do_not_kill_the_loop() {
        let db = MemoryDb::with_lifetime_tier("free", 10);
        let user = free_user(&db).await;
        let doc = document_for(&db, &user).await;
        let job = db.create_job(doc.id, JobKind::Extraction, None).await.unwrap();
        db.fail_next_job_fetches(3);
        let registry = registry(&db, 10);

        let mut rx = registry.start(job.id);
        // The first few polls fail; the loop keeps its cadence and the
        // update still arrives.
        let seen = wait_for(&mut rx, |j| j.id == job.id).await;
        assert_eq!(seen.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn nudge_forces_an_out_of_band_poll() {
        let db = MemoryDb::with_lifetime_tier("free", 10);
        let user = free_user(&db).await;
        let doc = document_for(&db, &user).await;
        let job = db.create_job(doc.id, JobKind::Extraction, None).await.unwrap();
        // An interval long enough that only the initial tick and the nudge
        // can deliver updates within the test window.
        let registry = registry(&db, 60_000);

        let mut rx = registry.start(job.id);
        wait_for(&mut rx, |j| j.status == JobStatus::Pending).await;

        db.update_job_progress(job.id, JobStatus::Running, 42)
            .await
            .unwrap();
        registry.nudge(job.id);
        let seen = wait_for(&mut rx, |j| j.completion == 42).await;
        assert_eq!(seen.status, JobStatus::Running);
    }

    #[tokio::test]
    async fn double_stop_is_harmless() {
        let db = MemoryDb::with_lifetime_tier("free", 10);
        let user = free_user(&db).await;
        let doc = document_for(&db, &user).await;
        let job = db.create_job(doc.id, JobKind::Extraction, None).await.unwrap();
        let registry = registry(&db, 10);

        let _rx = registry.start(job.id);
        registry.stop(job.id);
        registry.stop(job.id);
        registry.stop_all();
        assert_eq!(registry.active_count(), 0);
    }
}
