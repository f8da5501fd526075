//! services/api/src/web/billing.rs
//!
//! Billing-provider webhook intake. Every delivery carries a unique event
//! id; processed ids are recorded first, so redeliveries are no-ops. A
//! failing handler persists its error on the event row for later
//! inspection and still acknowledges the delivery — intake never crashes.

use crate::web::protocol::BillingEventPayload;
use crate::web::state::AppState;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use lectern_core::ports::{DatabaseService, PortError, PortResult};
use std::sync::Arc;
use tracing::{error, info, warn};

pub async fn billing_webhook_handler(
    State(app_state): State<Arc<AppState>>,
    Json(payload): Json<BillingEventPayload>,
) -> impl IntoResponse {
    match process_event(app_state.db.clone(), payload).await {
        Ok(_) => StatusCode::OK,
        // Only a failure to record the delivery itself warrants a retry
        // from the provider.
        Err(e) => {
            error!("Billing event intake failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Records and applies one delivery. Returns `false` for an
/// already-processed event id (idempotent redelivery).
pub async fn process_event(
    db: Arc<dyn DatabaseService>,
    event: BillingEventPayload,
) -> PortResult<bool> {
    let newly_recorded = db.record_billing_event(&event.id, &event.kind).await?;
    if !newly_recorded {
        info!("Billing event {} already processed; ignoring redelivery", event.id);
        return Ok(false);
    }

    if let Err(e) = apply_event(&*db, &event).await {
        error!("Billing event {} handler failed: {}", event.id, e);
        db.set_billing_event_error(&event.id, &e.to_string()).await?;
    }
    Ok(true)
}

async fn apply_event(db: &dyn DatabaseService, event: &BillingEventPayload) -> PortResult<()> {
    match event.kind.as_str() {
        // A period boundary from the provider becomes the user's usage
        // window verbatim; the ledger picks it up on the next access.
        "period.renewed" => {
            let (start, end) = match (event.period_start, event.period_end) {
                (Some(start), Some(end)) => (start, end),
                _ => {
                    return Err(PortError::Unexpected(format!(
                        "Event {} is missing its period window",
                        event.id
                    )))
                }
            };
            db.update_billing_period(event.user_id, start, end).await
        }
        "tier.changed" => {
            let tier = event.tier.as_deref().ok_or_else(|| {
                PortError::Unexpected(format!("Event {} is missing its tier", event.id))
            })?;
            db.update_user_tier(event.user_id, tier).await
        }
        other => {
            warn!("Ignoring billing event {} of unknown kind '{}'", event.id, other);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{free_user, MemoryDb};
    use chrono::{Duration, Utc};

    fn renewal(id: &str, user_id: uuid::Uuid) -> BillingEventPayload {
        let start = Utc::now();
        BillingEventPayload {
            id: id.to_string(),
            kind: "period.renewed".to_string(),
            user_id,
            period_start: Some(start),
            period_end: Some(start + Duration::days(30)),
            tier: None,
        }
    }

    #[tokio::test]
    async fn redelivered_event_is_a_noop() {
        let db = MemoryDb::with_lifetime_tier("free", 10);
        let user = free_user(&db).await;
        let first = renewal("evt-42", user.user_id);
        let window = (first.period_start, first.period_end);

        assert!(process_event(db.clone(), first).await.unwrap());

        // The redelivery carries a different window; it must not be applied.
        let mut second = renewal("evt-42", user.user_id);
        second.period_start = Some(Utc::now() + Duration::days(60));
        second.period_end = Some(Utc::now() + Duration::days(90));
        assert!(!process_event(db.clone(), second).await.unwrap());

        let stored = db.get_user(user.user_id).await.unwrap();
        assert_eq!(stored.billing_period_start, window.0);
        assert_eq!(stored.billing_period_end, window.1);
    }

    #[tokio::test]
    async fn handler_failure_is_persisted_without_crashing_intake() {
        let db = MemoryDb::with_lifetime_tier("free", 10);
        let user = free_user(&db).await;
        let mut event = renewal("evt-7", user.user_id);
        event.period_end = None;

        // Intake acknowledges the delivery even though the handler failed.
        assert!(process_event(db.clone(), event).await.unwrap());

        let stored = db.get_billing_event("evt-7").await.unwrap().unwrap();
        assert!(stored.error.unwrap().contains("missing its period window"));
    }

    #[tokio::test]
    async fn tier_change_updates_the_profile() {
        let db = MemoryDb::with_lifetime_tier("free", 10);
        let user = free_user(&db).await;
        let event = BillingEventPayload {
            id: "evt-9".to_string(),
            kind: "tier.changed".to_string(),
            user_id: user.user_id,
            period_start: None,
            period_end: None,
            tier: Some("pro".to_string()),
        };

        process_event(db.clone(), event).await.unwrap();
        let stored = db.get_user(user.user_id).await.unwrap();
        assert_eq!(stored.tier, "pro");
    }
}
