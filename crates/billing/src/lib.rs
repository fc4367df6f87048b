// Billing crate clippy configuration
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Draftmill Billing Module
//!
//! Subscription billing for workspaces against an external payment
//! provider.
//!
//! ## Features
//!
//! - **Plan Catalog**: Immutable in-process catalog of the four plans
//! - **Checkout**: Hosted payment sessions for paid plans
//! - **Webhooks**: Signature-verified provider events, idempotent dispatch
//! - **Reconciliation**: Idempotent, order-guarded subscription upserts
//! - **Entitlements**: Workspace quota derived from the subscribed plan
//! - **Usage Metering**: Race-free quota gate for content generation

pub mod catalog;
pub mod checkout;
pub mod config;
pub mod entitlement;
pub mod error;
pub mod gateway;
pub mod reconcile;
pub mod usage;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

pub use catalog::{Plan, PlanCatalog, UNLIMITED_QUOTA};
pub use checkout::CheckoutService;
pub use config::BillingConfig;
pub use entitlement::{EntitlementService, SubscriptionView};
pub use error::{BillingError, BillingResult};
pub use gateway::{
    CheckoutSessionInfo, CheckoutSessionParams, MockGateway, PaymentGateway, StripeGateway,
};
pub use reconcile::{Subscription, SubscriptionReconciler, SubscriptionUpdate};
pub use usage::UsageMeter;
pub use webhooks::{verify_event, GatewayEvent, WebhookHandler};

use std::sync::Arc;

use sqlx::PgPool;

/// Wired-up billing services sharing one catalog and gateway
pub struct BillingService {
    pub config: BillingConfig,
    pub catalog: Arc<PlanCatalog>,
    pub checkout: CheckoutService,
    pub webhooks: WebhookHandler,
    pub reconciler: SubscriptionReconciler,
    pub entitlements: EntitlementService,
    pub usage: UsageMeter,
    gateway: Arc<dyn PaymentGateway>,
}

impl BillingService {
    /// Wire the billing stack against the live payment gateway
    pub fn new(config: BillingConfig, pool: PgPool) -> Self {
        let gateway: Arc<dyn PaymentGateway> = Arc::new(StripeGateway::new(&config.secret_key));
        Self::with_gateway(config, pool, gateway)
    }

    /// Wire the billing stack with an injected gateway (tests use the mock)
    pub fn with_gateway(
        config: BillingConfig,
        pool: PgPool,
        gateway: Arc<dyn PaymentGateway>,
    ) -> Self {
        let catalog = Arc::new(PlanCatalog::new(&config));
        Self {
            checkout: CheckoutService::new(gateway.clone(), catalog.clone(), pool.clone()),
            webhooks: WebhookHandler::new(pool.clone(), catalog.clone()),
            reconciler: SubscriptionReconciler::new(pool.clone(), catalog.clone()),
            entitlements: EntitlementService::new(pool.clone(), catalog.clone()),
            usage: UsageMeter::new(pool),
            gateway,
            catalog,
            config,
        }
    }

    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let config = BillingConfig::from_env()?;
        Ok(Self::new(config, pool))
    }

    /// Cancel a workspace's subscription at the end of the current period
    ///
    /// The provider is told first; the local row then flips to Canceled
    /// while keeping the plan and period_end, so the workspace retains its
    /// quota until the period boundary. The provider's own deletion event,
    /// arriving later, reconciles as a no-op.
    pub async fn cancel_subscription(&self, workspace_id: uuid::Uuid) -> BillingResult<Subscription> {
        let existing = self
            .reconciler
            .find(workspace_id)
            .await?
            .ok_or(BillingError::SubscriptionNotFound(workspace_id))?;

        let external_ref = existing
            .external_subscription_ref
            .as_deref()
            .ok_or(BillingError::SubscriptionNotFound(workspace_id))?;

        self.gateway.cancel_at_period_end(external_ref).await?;

        // No event_at: a local cancellation has no provider sequence and
        // must apply regardless of what events came before.
        self.reconciler
            .reconcile(
                workspace_id,
                SubscriptionUpdate {
                    status: Some(draftmill_shared::SubscriptionStatus::Canceled),
                    ..Default::default()
                },
            )
            .await
    }
}
