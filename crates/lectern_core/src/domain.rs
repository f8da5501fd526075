//! crates/lectern_core/src/domain.rs
//!
//! Defines the pure, core data structures for the application.
//! These structs are independent of any database or serialization format.

use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use uuid::Uuid;

/// Completion percentage above which a still-running extraction is safe to
/// render progressively on the client. Pages and sentences are committed in
/// reading order, so everything stored before this point is consumable.
pub const EARLY_UNLOCK_PERCENT: i16 = 15;

// Represents a user - used throughout app
#[derive(Debug, Clone)]
pub struct User {
    pub user_id: Uuid,
    pub email: Option<String>,
    /// Quota plan name, resolved against `TierConfig` on every admission.
    pub tier: String,
    /// Administrative override that bypasses the limit check (usage is
    /// still counted).
    pub unlimited_quota: bool,
    /// Billing-provider period window, when an active subscription exists.
    pub billing_period_start: Option<DateTime<Utc>>,
    pub billing_period_end: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// How often a tier's usage counter resets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeriodKind {
    Weekly,
    Monthly,
    Lifetime,
}

impl PeriodKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeriodKind::Weekly => "weekly",
            PeriodKind::Monthly => "monthly",
            PeriodKind::Lifetime => "lifetime",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "weekly" => Some(PeriodKind::Weekly),
            "monthly" => Some(PeriodKind::Monthly),
            "lifetime" => Some(PeriodKind::Lifetime),
            _ => None,
        }
    }
}

/// A named quota plan. Exactly one config row exists per tier.
#[derive(Debug, Clone)]
pub struct TierConfig {
    pub tier: String,
    pub unit_limit: i64,
    pub period_kind: PeriodKind,
}

/// The accounting row for one user's consumption within one reset window.
#[derive(Debug, Clone)]
pub struct UsagePeriod {
    pub user_id: Uuid,
    pub period_kind: PeriodKind,
    pub period_start: DateTime<Utc>,
    /// None for lifetime tiers.
    pub period_end: Option<DateTime<Utc>>,
    pub units_used: i64,
    /// Snapshot of the tier limit, refreshed from config on each access.
    pub unit_limit: i64,
}

/// Resolves the usage window a consumption event falls into.
///
/// Lifetime tiers are anchored at account creation. Periodic tiers use the
/// billing provider's window verbatim when the profile carries one; without
/// an active subscription they fall back to a calendar-aligned window so
/// free periodic tiers still reset sanely.
pub fn resolve_period(user: &User, config: &TierConfig) -> (DateTime<Utc>, Option<DateTime<Utc>>) {
    match config.period_kind {
        PeriodKind::Lifetime => (user.created_at, None),
        PeriodKind::Weekly => {
            if let (Some(start), Some(end)) = (user.billing_period_start, user.billing_period_end)
            {
                return (start, Some(end));
            }
            let today = Utc::now().date_naive();
            let week_start = today - Duration::days(today.weekday().num_days_from_monday() as i64);
            let start = Utc.from_utc_datetime(&week_start.and_hms_opt(0, 0, 0).unwrap());
            (start, Some(start + Duration::weeks(1)))
        }
        PeriodKind::Monthly => {
            if let (Some(start), Some(end)) = (user.billing_period_start, user.billing_period_end)
            {
                return (start, Some(end));
            }
            let today = Utc::now().date_naive();
            let month_start = today.with_day(1).unwrap();
            let next_month = if month_start.month() == 12 {
                month_start
                    .with_year(month_start.year() + 1)
                    .unwrap()
                    .with_month(1)
                    .unwrap()
            } else {
                month_start.with_month(month_start.month() + 1).unwrap()
            };
            let start = Utc.from_utc_datetime(&month_start.and_hms_opt(0, 0, 0).unwrap());
            let end = Utc.from_utc_datetime(&next_month.and_hms_opt(0, 0, 0).unwrap());
            (start, Some(end))
        }
    }
}

/// Represents a document uploaded by a user.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: Uuid,
    pub user_id: Uuid,
    pub file_name: String,
    /// Location of the raw upload in blob storage.
    pub storage_path: String,
    /// Concatenated, speech-cleaned text, written when extraction finishes.
    pub parsed_text: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// The two kinds of asynchronous work the pipeline tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Extraction,
    Conversion,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Extraction => "extraction",
            JobKind::Conversion => "conversion",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "extraction" => Some(JobKind::Extraction),
            "conversion" => Some(JobKind::Conversion),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    /// Terminal statuses are final; later callbacks must not reopen them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

/// One unit of asynchronous work (extraction or conversion) tracked through
/// a status/progress record. Retries create a new row; history is never
/// mutated in place.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub document_id: Uuid,
    pub kind: JobKind,
    pub status: JobStatus,
    /// Completion percent in [0, 100].
    pub completion: i16,
    pub error_detail: Option<String>,
    /// Reference to the finished artifact; set only on completion.
    pub result_ref: Option<String>,
    /// Back-reference to the attempt this job retries, for audit.
    pub attempt_of: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Whether partial extraction results are ready for progressive
    /// rendering and sentence playback.
    pub fn partial_available(&self) -> bool {
        self.status == JobStatus::Completed || self.completion > EARLY_UNLOCK_PERCENT
    }
}

/// One extracted page. Appended as extraction produces it, never mutated.
#[derive(Debug, Clone)]
pub struct Page {
    pub document_id: Uuid,
    pub page_number: i32,
    pub width: f64,
    pub height: f64,
    pub text: String,
}

/// A sentence with its highlight geometry. `sequence` is the global,
/// 0-based reading-order index across the whole document; the playback
/// engine relies on it for seek and scrub.
#[derive(Debug, Clone)]
pub struct Sentence {
    pub document_id: Uuid,
    pub page_number: i32,
    pub sequence: i64,
    pub text: String,
    /// One quadrilateral per visual line the sentence spans, as
    /// [[x, y]; 4] corner lists.
    pub regions: Vec<Vec<[f64; 2]>>,
}

/// Last played sentence for a document. Purely advisory; a lost write only
/// degrades resume accuracy.
#[derive(Debug, Clone)]
pub struct PlaybackPosition {
    pub document_id: Uuid,
    pub sentence_index: i64,
}

/// A processed billing-provider webhook delivery, recorded for idempotent
/// intake. A failed handler persists its error here instead of crashing.
#[derive(Debug, Clone)]
pub struct BillingEvent {
    pub event_id: String,
    pub kind: String,
    pub received_at: DateTime<Utc>,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;
    use uuid::Uuid;

    fn user(tier: &str) -> User {
        User {
            user_id: Uuid::new_v4(),
            email: None,
            tier: tier.to_string(),
            unlimited_quota: false,
            billing_period_start: None,
            billing_period_end: None,
            created_at: Utc::now() - Duration::days(90),
        }
    }

    fn config(period_kind: PeriodKind) -> TierConfig {
        TierConfig {
            tier: "free".to_string(),
            unit_limit: 10,
            period_kind,
        }
    }

    #[test]
    fn lifetime_period_is_anchored_at_account_creation() {
        let user = user("free");
        let (start, end) = resolve_period(&user, &config(PeriodKind::Lifetime));
        assert_eq!(start, user.created_at);
        assert!(end.is_none());
    }

    #[test]
    fn billing_window_is_used_verbatim_when_present() {
        let mut user = user("pro");
        let window_start = Utc::now() - Duration::days(3);
        let window_end = window_start + Duration::days(30);
        user.billing_period_start = Some(window_start);
        user.billing_period_end = Some(window_end);

        let (start, end) = resolve_period(&user, &config(PeriodKind::Monthly));
        assert_eq!(start, window_start);
        assert_eq!(end, Some(window_end));
    }

    #[test]
    fn weekly_fallback_aligns_to_the_start_of_the_iso_week() {
        let user = user("free");
        let (start, end) = resolve_period(&user, &config(PeriodKind::Weekly));

        assert_eq!(start.weekday(), chrono::Weekday::Mon);
        assert_eq!((start.hour(), start.minute(), start.second()), (0, 0, 0));
        assert_eq!(end, Some(start + Duration::weeks(1)));
        let now = Utc::now();
        assert!(start <= now && now < end.unwrap());
    }

    #[test]
    fn monthly_fallback_aligns_to_the_first_of_the_month() {
        let user = user("free");
        let (start, end) = resolve_period(&user, &config(PeriodKind::Monthly));

        assert_eq!(start.day(), 1);
        assert_eq!((start.hour(), start.minute(), start.second()), (0, 0, 0));
        let end = end.unwrap();
        assert_eq!(end.day(), 1);
        let now = Utc::now();
        assert!(start <= now && now < end);
    }

    #[test]
    fn enum_round_trips() {
        for kind in [PeriodKind::Weekly, PeriodKind::Monthly, PeriodKind::Lifetime] {
            assert_eq!(PeriodKind::parse(kind.as_str()), Some(kind));
        }
        for kind in [JobKind::Extraction, JobKind::Conversion] {
            assert_eq!(JobKind::parse(kind.as_str()), Some(kind));
        }
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }
}
