//! services/api/src/web/state.rs
//!
//! Defines the application's shared state: the port adapters and the
//! pipeline components built on top of them.

use crate::assembler::ResultAssembler;
use crate::config::Config;
use crate::gateway::AdmissionGateway;
use crate::quota::QuotaLedger;
use crate::sync::PollRegistry;
use crate::tracker::JobTracker;
use lectern_core::ports::{BlobStore, DatabaseService, SpeechSynthesisService, WorkerPool};
use std::sync::Arc;

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<dyn DatabaseService>,
    pub config: Arc<Config>,
    pub worker: Arc<dyn WorkerPool>,
    pub synth: Arc<dyn SpeechSynthesisService>,
    pub blobs: Arc<dyn BlobStore>,
    pub ledger: QuotaLedger,
    pub tracker: JobTracker,
    pub gateway: AdmissionGateway,
    pub assembler: ResultAssembler,
    pub polls: PollRegistry,
}

impl AppState {
    /// Wires the pipeline components over the provided port adapters.
    pub fn new(
        db: Arc<dyn DatabaseService>,
        config: Arc<Config>,
        worker: Arc<dyn WorkerPool>,
        synth: Arc<dyn SpeechSynthesisService>,
        blobs: Arc<dyn BlobStore>,
    ) -> Self {
        let ledger = QuotaLedger::new(db.clone());
        let tracker = JobTracker::new(db.clone());
        let gateway = AdmissionGateway::new(
            db.clone(),
            ledger.clone(),
            tracker.clone(),
            worker.clone(),
        );
        let assembler = ResultAssembler::new(db.clone(), tracker.clone());
        let polls = PollRegistry::new(tracker.clone(), config.poll_interval);
        Self {
            db,
            config,
            worker,
            synth,
            blobs,
            ledger,
            tracker,
            gateway,
            assembler,
            polls,
        }
    }
}
