//! Entitlement updates and the current-entitlement view
//!
//! The quota a workspace holds is derived state: it must always equal the
//! catalog quota of the subscription's plan after a successful
//! reconciliation. [`sync_quota`] is the only writer of `usage_limit`.

use std::sync::Arc;

use draftmill_shared::{PlanId, SubscriptionStatus, Workspace};
use serde::Serialize;
use sqlx::{PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::catalog::PlanCatalog;
use crate::error::{BillingError, BillingResult};
use crate::reconcile::SubscriptionReconciler;

/// Recompute a workspace's usage quota from the plan catalog
///
/// Runs inside the reconciler's transaction. Never touches `usage_count`.
pub async fn sync_quota(
    tx: &mut Transaction<'_, Postgres>,
    workspace_id: Uuid,
    plan_id: PlanId,
    catalog: &PlanCatalog,
) -> BillingResult<()> {
    let quota = catalog.quota_of(plan_id);

    let result = sqlx::query(
        "UPDATE workspaces SET usage_limit = $1, updated_at = NOW() WHERE id = $2",
    )
    .bind(quota)
    .bind(workspace_id)
    .execute(&mut **tx)
    .await?;

    if result.rows_affected() == 0 {
        return Err(BillingError::WorkspaceNotFound(workspace_id));
    }

    tracing::info!(
        workspace_id = %workspace_id,
        plan_id = %plan_id,
        usage_limit = quota,
        "Workspace quota synced to plan"
    );

    Ok(())
}

/// Projection returned by `GET /billing/subscription`
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionView {
    pub id: Option<Uuid>,
    pub plan_id: PlanId,
    pub status: SubscriptionStatus,
    pub period_start: Option<OffsetDateTime>,
    pub period_end: Option<OffsetDateTime>,
    pub usage_count: i64,
    pub usage_limit: i64,
}

pub struct EntitlementService {
    pool: PgPool,
    catalog: Arc<PlanCatalog>,
}

impl EntitlementService {
    pub fn new(pool: PgPool, catalog: Arc<PlanCatalog>) -> Self {
        Self { pool, catalog }
    }

    /// Current entitlement for a workspace
    ///
    /// When no subscription row exists the workspace is implicitly on the
    /// Free plan, Active, with no external reference; the view is
    /// synthesized from the workspace's own usage fields.
    pub async fn subscription_view(&self, workspace_id: Uuid) -> BillingResult<SubscriptionView> {
        let workspace: Option<Workspace> = sqlx::query_as(
            "SELECT id, name, usage_count, usage_limit, created_at, updated_at \
             FROM workspaces WHERE id = $1",
        )
        .bind(workspace_id)
        .fetch_optional(&self.pool)
        .await?;

        let workspace = workspace.ok_or(BillingError::WorkspaceNotFound(workspace_id))?;
        let (usage_count, usage_limit) = (workspace.usage_count, workspace.usage_limit);

        let reconciler = SubscriptionReconciler::new(self.pool.clone(), self.catalog.clone());
        let view = match reconciler.find(workspace_id).await? {
            Some(sub) => SubscriptionView {
                id: Some(sub.id),
                plan_id: sub.plan_id,
                status: sub.status,
                period_start: sub.period_start,
                period_end: sub.period_end,
                usage_count,
                usage_limit,
            },
            None => SubscriptionView {
                id: None,
                plan_id: PlanId::Free,
                status: SubscriptionStatus::Active,
                period_start: None,
                period_end: None,
                usage_count,
                usage_limit,
            },
        };

        Ok(view)
    }
}
