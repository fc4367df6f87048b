//! Billing configuration loaded from the environment

use crate::error::{BillingError, BillingResult};

/// Stripe credentials plus the price references the plan catalog maps to
#[derive(Debug, Clone)]
pub struct BillingConfig {
    /// Stripe secret key (sk_...)
    pub secret_key: String,
    /// Webhook signing secret (whsec_...)
    pub webhook_secret: String,
    /// Price reference per purchasable plan. Free intentionally has none.
    pub price_starter: Option<String>,
    pub price_pro: Option<String>,
    pub price_enterprise: Option<String>,
}

impl BillingConfig {
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| BillingError::Internal("STRIPE_SECRET_KEY not set".to_string()))?;
        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET")
            .map_err(|_| BillingError::Internal("STRIPE_WEBHOOK_SECRET not set".to_string()))?;

        Ok(Self {
            secret_key,
            webhook_secret,
            price_starter: std::env::var("STRIPE_PRICE_STARTER").ok(),
            price_pro: std::env::var("STRIPE_PRICE_PRO").ok(),
            price_enterprise: std::env::var("STRIPE_PRICE_ENTERPRISE").ok(),
        })
    }
}
