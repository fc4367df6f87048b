//! Billing error taxonomy

use draftmill_shared::PlanId;
use uuid::Uuid;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    /// Webhook signature could not be verified. Fails closed: the caller
    /// must return a generic 400 without touching any state.
    #[error("webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    #[error("the free plan cannot be purchased")]
    PlanNotPurchasable,

    #[error("plan {0} has no price configured")]
    MissingPriceRef(PlanId),

    #[error("workspace {0} not found")]
    WorkspaceNotFound(Uuid),

    #[error("no subscription found for workspace {0}")]
    SubscriptionNotFound(Uuid),

    #[error("payment gateway error: {0}")]
    Gateway(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        BillingError::Gateway(err.to_string())
    }
}
