pub mod domain;
pub mod ports;

pub use domain::{
    resolve_period, BillingEvent, Document, Job, JobKind, JobStatus, Page, PeriodKind,
    PlaybackPosition, Sentence, TierConfig, UsagePeriod, User, EARLY_UNLOCK_PERCENT,
};
pub use ports::{
    AudioSink, BlobStore, DatabaseService, PortError, PortResult, SpeechSynthesisService,
    WorkerPool,
};
