//! Checkout initiation
//!
//! Starts an external payment session for a purchasable plan. The session
//! metadata embeds `{workspace_id, plan_id}` verbatim because no local
//! pending-checkout state exists when the asynchronous confirmation event
//! arrives — possibly on a different instance.

use std::collections::HashMap;
use std::sync::Arc;

use draftmill_shared::PlanId;
use sqlx::PgPool;
use uuid::Uuid;

use crate::catalog::PlanCatalog;
use crate::error::{BillingError, BillingResult};
use crate::gateway::{CheckoutSessionInfo, CheckoutSessionParams, PaymentGateway};

/// Metadata keys carried on the checkout session and its subscription
pub const META_WORKSPACE_ID: &str = "workspace_id";
pub const META_PLAN_ID: &str = "plan_id";

pub struct CheckoutService {
    gateway: Arc<dyn PaymentGateway>,
    catalog: Arc<PlanCatalog>,
    pool: PgPool,
}

impl CheckoutService {
    pub fn new(gateway: Arc<dyn PaymentGateway>, catalog: Arc<PlanCatalog>, pool: PgPool) -> Self {
        Self {
            gateway,
            catalog,
            pool,
        }
    }

    /// Start an external checkout session for a workspace
    ///
    /// Distinct rejections, in validation order: unknown plan, free plan,
    /// plan without a configured price reference, unknown workspace.
    pub async fn start_checkout(
        &self,
        workspace_id: Uuid,
        plan_id: PlanId,
        success_url: &str,
        cancel_url: &str,
    ) -> BillingResult<CheckoutSessionInfo> {
        let plan = self
            .catalog
            .lookup(plan_id)
            .ok_or_else(|| BillingError::InvalidPlan(plan_id.to_string()))?;

        if plan.id == PlanId::Free {
            return Err(BillingError::PlanNotPurchasable);
        }

        let price_ref = plan
            .price_ref
            .as_deref()
            .ok_or(BillingError::MissingPriceRef(plan.id))?;

        let exists: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM workspaces WHERE id = $1")
            .bind(workspace_id)
            .fetch_optional(&self.pool)
            .await?;
        if exists.is_none() {
            return Err(BillingError::WorkspaceNotFound(workspace_id));
        }

        let mut metadata = HashMap::new();
        metadata.insert(META_WORKSPACE_ID.to_string(), workspace_id.to_string());
        metadata.insert(META_PLAN_ID.to_string(), plan_id.to_string());

        let session = self
            .gateway
            .create_checkout_session(CheckoutSessionParams {
                price_ref: price_ref.to_string(),
                success_url: success_url.to_string(),
                cancel_url: cancel_url.to_string(),
                metadata,
            })
            .await?;

        tracing::info!(
            workspace_id = %workspace_id,
            plan_id = %plan_id,
            session_id = %session.session_id,
            "Checkout session created"
        );

        Ok(session)
    }
}
