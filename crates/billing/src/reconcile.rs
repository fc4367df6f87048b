//! Subscription reconciliation
//!
//! Applies externally-sourced events to the per-workspace subscription
//! row. All mutation funnels through [`SubscriptionReconciler::reconcile`]:
//! one transaction, serialized per workspace via a row lock, with the plan
//! quota written in the same unit of work so a plan change and its quota
//! effect are never observable as separate states.

use std::sync::Arc;

use draftmill_shared::{PlanId, SubscriptionStatus};
use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::catalog::PlanCatalog;
use crate::entitlement;
use crate::error::{BillingError, BillingResult};

/// Subscription row
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Subscription {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub external_subscription_ref: Option<String>,
    pub plan_id: PlanId,
    pub status: SubscriptionStatus,
    pub period_start: Option<OffsetDateTime>,
    pub period_end: Option<OffsetDateTime>,
    /// Provider timestamp of the newest applied event
    pub last_event_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Partial update merged into the stored row. Absent fields are left
/// untouched, which is what lets a cancellation flip `status` while
/// preserving `plan_id` and `period_end` exactly as they were.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionUpdate {
    pub external_subscription_ref: Option<String>,
    pub plan_id: Option<PlanId>,
    pub status: Option<SubscriptionStatus>,
    pub period_start: Option<OffsetDateTime>,
    pub period_end: Option<OffsetDateTime>,
    /// Provider event timestamp, used for out-of-order rejection
    pub event_at: Option<OffsetDateTime>,
}

/// Result of merging an update into an existing row
#[derive(Debug)]
pub enum MergeOutcome {
    /// The merged row to store
    Applied(Subscription),
    /// The update's event timestamp is not newer than what was already
    /// applied; the stored row must be left untouched.
    Stale,
}

impl Subscription {
    /// Pure merge of a partial update into this row
    ///
    /// Ordering guard: when both the update and the row carry an event
    /// timestamp, an update that is not strictly newer is stale. Updates
    /// without a timestamp (local cancellation) always apply.
    pub fn merged(&self, update: &SubscriptionUpdate) -> MergeOutcome {
        if let (Some(incoming), Some(applied)) = (update.event_at, self.last_event_at) {
            if incoming <= applied {
                return MergeOutcome::Stale;
            }
        }

        let mut next = self.clone();
        if let Some(ref external_ref) = update.external_subscription_ref {
            next.external_subscription_ref = Some(external_ref.clone());
        }
        if let Some(plan_id) = update.plan_id {
            next.plan_id = plan_id;
        }
        if let Some(status) = update.status {
            next.status = status;
        }
        if let Some(period_start) = update.period_start {
            next.period_start = Some(period_start);
        }
        if let Some(period_end) = update.period_end {
            next.period_end = Some(period_end);
        }
        if let Some(event_at) = update.event_at {
            next.last_event_at = Some(event_at);
        }
        MergeOutcome::Applied(next)
    }
}

/// Map the provider's status vocabulary onto the internal enum
///
/// Unrecognized statuses map to PastDue rather than Active: an unknown
/// status must not silently grant access.
pub fn map_external_status(external: &str) -> SubscriptionStatus {
    match external {
        "active" | "trialing" => SubscriptionStatus::Active,
        "canceled" => SubscriptionStatus::Canceled,
        "past_due" | "unpaid" => SubscriptionStatus::PastDue,
        other => {
            tracing::warn!(
                external_status = %other,
                "Unrecognized external subscription status, treating as past_due"
            );
            SubscriptionStatus::PastDue
        }
    }
}

pub struct SubscriptionReconciler {
    pool: PgPool,
    catalog: Arc<PlanCatalog>,
}

impl SubscriptionReconciler {
    pub fn new(pool: PgPool, catalog: Arc<PlanCatalog>) -> Self {
        Self { pool, catalog }
    }

    /// Idempotent upsert of the workspace's subscription row
    ///
    /// Seed-inserts a Free/Active row when none exists (the unique
    /// constraint on workspace_id makes concurrent seeding race-free),
    /// locks the row, merges the partial update in memory, writes it back,
    /// and syncs the workspace quota to the stored plan, all inside one
    /// transaction.
    pub async fn reconcile(
        &self,
        workspace_id: Uuid,
        update: SubscriptionUpdate,
    ) -> BillingResult<Subscription> {
        let mut tx = self.pool.begin().await?;

        let workspace: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM workspaces WHERE id = $1")
            .bind(workspace_id)
            .fetch_optional(&mut *tx)
            .await?;
        if workspace.is_none() {
            return Err(BillingError::WorkspaceNotFound(workspace_id));
        }

        // Seed row for first-time reconciliation. ON CONFLICT DO NOTHING
        // keeps two concurrent deliveries from both inserting.
        sqlx::query(
            r#"
            INSERT INTO subscriptions (id, workspace_id, plan_id, status)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (workspace_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(workspace_id)
        .bind(PlanId::Free)
        .bind(SubscriptionStatus::Active)
        .execute(&mut *tx)
        .await?;

        // Row lock serializes reconciliation per workspace; other
        // workspaces proceed in parallel.
        let existing: Subscription = sqlx::query_as(
            r#"
            SELECT id, workspace_id, external_subscription_ref, plan_id, status,
                   period_start, period_end, last_event_at, created_at, updated_at
            FROM subscriptions
            WHERE workspace_id = $1
            FOR UPDATE
            "#,
        )
        .bind(workspace_id)
        .fetch_one(&mut *tx)
        .await?;

        let next = match existing.merged(&update) {
            MergeOutcome::Stale => {
                tracing::info!(
                    workspace_id = %workspace_id,
                    incoming_event_at = ?update.event_at,
                    applied_event_at = ?existing.last_event_at,
                    "Ignoring out-of-order reconciliation attempt"
                );
                tx.commit().await?;
                return Ok(existing);
            }
            MergeOutcome::Applied(next) => next,
        };

        sqlx::query(
            r#"
            UPDATE subscriptions
            SET external_subscription_ref = $1,
                plan_id = $2,
                status = $3,
                period_start = $4,
                period_end = $5,
                last_event_at = $6,
                updated_at = NOW()
            WHERE workspace_id = $7
            "#,
        )
        .bind(&next.external_subscription_ref)
        .bind(next.plan_id)
        .bind(next.status)
        .bind(next.period_start)
        .bind(next.period_end)
        .bind(next.last_event_at)
        .bind(workspace_id)
        .execute(&mut *tx)
        .await?;

        // Quota follows the stored plan in the same transaction, so a
        // committed reconciliation can never leave usage_limit stale. Runs
        // on every apply, not just plan-bearing updates: a seed-inserted
        // Free row must get the Free quota even when the triggering event
        // carried only a status.
        entitlement::sync_quota(&mut tx, workspace_id, next.plan_id, &self.catalog).await?;

        tx.commit().await?;

        tracing::info!(
            workspace_id = %workspace_id,
            plan_id = %next.plan_id,
            status = %next.status,
            "Subscription reconciled"
        );

        Ok(next)
    }

    /// Current subscription row, if any
    pub async fn find(&self, workspace_id: Uuid) -> BillingResult<Option<Subscription>> {
        let row = sqlx::query_as(
            r#"
            SELECT id, workspace_id, external_subscription_ref, plan_id, status,
                   period_start, period_end, last_event_at, created_at, updated_at
            FROM subscriptions
            WHERE workspace_id = $1
            "#,
        )
        .bind(workspace_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn base_subscription() -> Subscription {
        Subscription {
            id: Uuid::new_v4(),
            workspace_id: Uuid::new_v4(),
            external_subscription_ref: Some("sub_123".to_string()),
            plan_id: PlanId::Pro,
            status: SubscriptionStatus::Active,
            period_start: Some(datetime!(2025-01-01 00:00 UTC)),
            period_end: Some(datetime!(2025-02-01 00:00 UTC)),
            last_event_at: Some(datetime!(2025-01-15 12:00 UTC)),
            created_at: datetime!(2025-01-01 00:00 UTC),
            updated_at: datetime!(2025-01-15 12:00 UTC),
        }
    }

    #[test]
    fn status_mapping_covers_provider_vocabulary() {
        assert_eq!(map_external_status("active"), SubscriptionStatus::Active);
        assert_eq!(map_external_status("trialing"), SubscriptionStatus::Active);
        assert_eq!(
            map_external_status("canceled"),
            SubscriptionStatus::Canceled
        );
        assert_eq!(
            map_external_status("past_due"),
            SubscriptionStatus::PastDue
        );
        assert_eq!(map_external_status("unpaid"), SubscriptionStatus::PastDue);
    }

    #[test]
    fn unknown_status_fails_safe() {
        // Unknown input must never grant access
        assert_eq!(
            map_external_status("incomplete_expired"),
            SubscriptionStatus::PastDue
        );
        assert_eq!(map_external_status(""), SubscriptionStatus::PastDue);
    }

    #[test]
    fn cancellation_preserves_plan_and_period_end() {
        let existing = base_subscription();
        let update = SubscriptionUpdate {
            status: Some(SubscriptionStatus::Canceled),
            event_at: Some(datetime!(2025-01-20 00:00 UTC)),
            ..Default::default()
        };

        match existing.merged(&update) {
            MergeOutcome::Applied(next) => {
                assert_eq!(next.status, SubscriptionStatus::Canceled);
                assert_eq!(next.plan_id, PlanId::Pro);
                assert_eq!(next.period_end, existing.period_end);
                assert_eq!(
                    next.external_subscription_ref,
                    existing.external_subscription_ref
                );
            }
            MergeOutcome::Stale => panic!("newer event must apply"),
        }
    }

    #[test]
    fn older_event_is_stale() {
        let existing = base_subscription();
        let update = SubscriptionUpdate {
            status: Some(SubscriptionStatus::Active),
            event_at: Some(datetime!(2025-01-10 00:00 UTC)),
            ..Default::default()
        };
        assert!(matches!(existing.merged(&update), MergeOutcome::Stale));
    }

    #[test]
    fn equal_event_timestamp_is_stale() {
        // Re-delivery of the exact same event must be a no-op
        let existing = base_subscription();
        let update = SubscriptionUpdate {
            status: Some(SubscriptionStatus::Canceled),
            event_at: existing.last_event_at,
            ..Default::default()
        };
        assert!(matches!(existing.merged(&update), MergeOutcome::Stale));
    }

    #[test]
    fn update_without_event_timestamp_always_applies() {
        // Local cancellations have no provider sequence
        let existing = base_subscription();
        let update = SubscriptionUpdate {
            status: Some(SubscriptionStatus::Canceled),
            ..Default::default()
        };
        match existing.merged(&update) {
            MergeOutcome::Applied(next) => {
                assert_eq!(next.status, SubscriptionStatus::Canceled);
                assert_eq!(next.last_event_at, existing.last_event_at);
            }
            MergeOutcome::Stale => panic!("sequence-less update must apply"),
        }
    }

    #[test]
    fn merge_is_idempotent_on_identical_input() {
        let existing = base_subscription();
        let update = SubscriptionUpdate {
            status: Some(SubscriptionStatus::Canceled),
            period_end: Some(datetime!(2025-02-01 00:00 UTC)),
            event_at: Some(datetime!(2025-01-20 00:00 UTC)),
            ..Default::default()
        };

        let once = match existing.merged(&update) {
            MergeOutcome::Applied(next) => next,
            MergeOutcome::Stale => panic!("first application must apply"),
        };
        // Second application of the identical update is stale by sequence,
        // leaving the row exactly as after the first.
        assert!(matches!(once.merged(&update), MergeOutcome::Stale));
    }
}
