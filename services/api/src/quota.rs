//! services/api/src/quota.rs
//!
//! The quota ledger: per-user usage-period accounting and admission checks.
//! Tier limits are re-read from config on every access, so administrative
//! changes apply to future checks without rewriting accumulated history.

use lectern_core::domain::{resolve_period, UsagePeriod, User};
use lectern_core::ports::{DatabaseService, PortResult};
use std::sync::Arc;

/// Per-user usage accounting over the `DatabaseService` port.
#[derive(Clone)]
pub struct QuotaLedger {
    db: Arc<dyn DatabaseService>,
}

impl QuotaLedger {
    pub fn new(db: Arc<dyn DatabaseService>) -> Self {
        Self { db }
    }

    /// Fetches the usage record for the user's current period, creating it
    /// lazily on first access. An existing record gets its limit and
    /// period-end snapshot refreshed from the current tier config, which
    /// absorbs config or billing-period changes without losing usage.
    pub async fn get_or_create_usage(&self, user: &User) -> PortResult<UsagePeriod> {
        let config = self.db.get_tier_config(&user.tier).await?;
        let (period_start, period_end) = resolve_period(user, &config);

        match self
            .db
            .get_usage_period(user.user_id, config.period_kind, period_start)
            .await?
        {
            Some(_) => {
                self.db
                    .refresh_usage_snapshot(
                        user.user_id,
                        config.period_kind,
                        period_start,
                        config.unit_limit,
                        period_end,
                    )
                    .await
            }
            None => {
                self.db
                    .insert_usage_period(UsagePeriod {
                        user_id: user.user_id,
                        period_kind: config.period_kind,
                        period_start,
                        period_end,
                        units_used: 0,
                        unit_limit: config.unit_limit,
                    })
                    .await
            }
        }
    }

    /// Cheap admission pre-check. Advisory only: the authoritative check
    /// happens inside `reserve`.
    pub async fn can_consume(&self, user: &User, requested: i64) -> PortResult<bool> {
        if user.unlimited_quota {
            return Ok(true);
        }
        let usage = self.get_or_create_usage(user).await?;
        Ok(usage.units_used + requested <= usage.unit_limit)
    }

    /// Reserves `requested` units. The limit is re-validated atomically in
    /// the store, so two concurrent reservations cannot both take the last
    /// unit. Unlimited users skip the limit check but still accumulate
    /// usage for observability. Fails with `PortError::QuotaExceeded`
    /// without mutating anything.
    pub async fn reserve(&self, user: &User, requested: i64) -> PortResult<UsagePeriod> {
        let usage = self.get_or_create_usage(user).await?;
        self.db
            .consume_units(
                user.user_id,
                usage.period_kind,
                usage.period_start,
                requested,
                !user.unlimited_quota,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{free_user, MemoryDb};
    use lectern_core::ports::PortError;

    #[tokio::test]
    async fn creates_usage_lazily_and_idempotently() {
        let db = MemoryDb::with_lifetime_tier("free", 10);
        let user = free_user(&db).await;
        let ledger = QuotaLedger::new(db.clone());

        let first = ledger.get_or_create_usage(&user).await.unwrap();
        let second = ledger.get_or_create_usage(&user).await.unwrap();

        assert_eq!(first.units_used, 0);
        assert_eq!(second.units_used, first.units_used);
        assert_eq!(second.period_start, first.period_start);
    }

    #[tokio::test]
    async fn snapshot_refresh_applies_config_changes_without_losing_usage() {
        let db = MemoryDb::with_lifetime_tier("free", 10);
        let user = free_user(&db).await;
        let ledger = QuotaLedger::new(db.clone());

        ledger.reserve(&user, 4).await.unwrap();
        db.set_tier_limit("free", 20);

        let usage = ledger.get_or_create_usage(&user).await.unwrap();
        assert_eq!(usage.unit_limit, 20);
        assert_eq!(usage.units_used, 4);
    }

    #[tokio::test]
    async fn reserve_rejects_when_limit_reached() {
        let db = MemoryDb::with_lifetime_tier("free", 2);
        let user = free_user(&db).await;
        let ledger = QuotaLedger::new(db.clone());

        ledger.reserve(&user, 2).await.unwrap();
        let err = ledger.reserve(&user, 1).await.unwrap_err();
        assert!(matches!(err, PortError::QuotaExceeded));

        let usage = ledger.get_or_create_usage(&user).await.unwrap();
        assert_eq!(usage.units_used, 2);
    }

    #[tokio::test]
    async fn unlimited_users_still_accumulate_usage() {
        let db = MemoryDb::with_lifetime_tier("free", 1);
        let mut user = free_user(&db).await;
        user.unlimited_quota = true;
        db.set_unlimited(user.user_id);
        let ledger = QuotaLedger::new(db.clone());

        ledger.reserve(&user, 1).await.unwrap();
        let usage = ledger.reserve(&user, 1).await.unwrap();
        assert_eq!(usage.units_used, 2);
    }

    #[tokio::test]
    async fn concurrent_reservations_never_overshoot() {
        let db = MemoryDb::with_lifetime_tier("free", 5);
        let user = free_user(&db).await;
        let ledger = QuotaLedger::new(db.clone());

        let mut handles = Vec::new();
        for _ in 0..20 {
            let ledger = ledger.clone();
            let user = user.clone();
            handles.push(tokio::spawn(
                async move { ledger.reserve(&user, 1).await },
            ));
        }

        let mut granted = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                granted += 1;
            }
        }

        assert_eq!(granted, 5);
        let usage = ledger.get_or_create_usage(&user).await.unwrap();
        assert_eq!(usage.units_used, 5);
    }
}
