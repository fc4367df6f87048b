//! Payment gateway seam
//!
//! The reconciliation core talks to the payment provider through this
//! trait so the HTTP round-trips can be substituted in tests. The live
//! implementation wraps async-stripe; the mock records calls and
//! synthesizes ids.

use async_trait::async_trait;
use std::collections::HashMap;

use crate::error::{BillingError, BillingResult};

/// Parameters for starting an external checkout session
#[derive(Debug, Clone)]
pub struct CheckoutSessionParams {
    pub price_ref: String,
    pub success_url: String,
    pub cancel_url: String,
    /// Correlation metadata carried verbatim on the confirmation event.
    /// This is the only link back to local state when the async
    /// confirmation arrives, possibly on another instance.
    pub metadata: HashMap<String, String>,
}

/// The provider-side session handle returned to the caller for redirect
#[derive(Debug, Clone, serde::Serialize)]
pub struct CheckoutSessionInfo {
    pub session_id: String,
    pub redirect_url: Option<String>,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_checkout_session(
        &self,
        params: CheckoutSessionParams,
    ) -> BillingResult<CheckoutSessionInfo>;

    /// Mark an external subscription to cancel at the end of the current
    /// period. The local status flip happens via reconciliation, not here.
    async fn cancel_at_period_end(&self, subscription_ref: &str) -> BillingResult<()>;
}

/// Live gateway backed by async-stripe
pub struct StripeGateway {
    client: stripe::Client,
}

impl StripeGateway {
    pub fn new(secret_key: &str) -> Self {
        Self {
            client: stripe::Client::new(secret_key.to_string()),
        }
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    async fn create_checkout_session(
        &self,
        params: CheckoutSessionParams,
    ) -> BillingResult<CheckoutSessionInfo> {
        let mut create = stripe::CreateCheckoutSession::new();
        create.mode = Some(stripe::CheckoutSessionMode::Subscription);
        create.success_url = Some(&params.success_url);
        create.cancel_url = Some(&params.cancel_url);
        create.line_items = Some(vec![stripe::CreateCheckoutSessionLineItems {
            price: Some(params.price_ref.clone()),
            quantity: Some(1),
            ..Default::default()
        }]);
        create.metadata = Some(params.metadata.clone());
        // Propagate the correlation metadata onto the subscription object
        // itself, so subscription_updated/deleted events carry it too.
        create.subscription_data = Some(stripe::CreateCheckoutSessionSubscriptionData {
            metadata: Some(params.metadata.clone()),
            ..Default::default()
        });

        let session = stripe::CheckoutSession::create(&self.client, create).await?;

        Ok(CheckoutSessionInfo {
            session_id: session.id.to_string(),
            redirect_url: session.url.clone(),
        })
    }

    async fn cancel_at_period_end(&self, subscription_ref: &str) -> BillingResult<()> {
        let sub_id = subscription_ref
            .parse::<stripe::SubscriptionId>()
            .map_err(|e| BillingError::Gateway(format!("invalid subscription ref: {}", e)))?;

        let mut update = stripe::UpdateSubscription::new();
        update.cancel_at_period_end = Some(true);
        stripe::Subscription::update(&self.client, &sub_id, update).await?;

        Ok(())
    }
}

/// In-memory gateway for tests: captures requests, fabricates sessions
#[derive(Clone, Default)]
pub struct MockGateway {
    pub checkout_requests: std::sync::Arc<std::sync::Mutex<Vec<CheckoutSessionParams>>>,
    pub cancelled_refs: std::sync::Arc<std::sync::Mutex<Vec<String>>>,
    pub fail_next: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    async fn create_checkout_session(
        &self,
        params: CheckoutSessionParams,
    ) -> BillingResult<CheckoutSessionInfo> {
        if self.fail_next.swap(false, std::sync::atomic::Ordering::SeqCst) {
            return Err(BillingError::Gateway("simulated failure".to_string()));
        }

        let n = {
            let mut captured = self
                .checkout_requests
                .lock()
                .map_err(|_| BillingError::Internal("mock lock poisoned".to_string()))?;
            captured.push(params);
            captured.len()
        };

        Ok(CheckoutSessionInfo {
            session_id: format!("cs_test_{}", n),
            redirect_url: Some("https://checkout.example.test/session".to_string()),
        })
    }

    async fn cancel_at_period_end(&self, subscription_ref: &str) -> BillingResult<()> {
        self.cancelled_refs
            .lock()
            .map_err(|_| BillingError::Internal("mock lock poisoned".to_string()))?
            .push(subscription_ref.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_captures_checkout_metadata() {
        let mock = MockGateway::new();
        let mut metadata = HashMap::new();
        metadata.insert("workspace_id".to_string(), "ws-1".to_string());
        metadata.insert("plan_id".to_string(), "pro".to_string());

        let session = mock
            .create_checkout_session(CheckoutSessionParams {
                price_ref: "price_123".to_string(),
                success_url: "https://example.test/ok".to_string(),
                cancel_url: "https://example.test/no".to_string(),
                metadata,
            })
            .await
            .unwrap();

        assert!(session.session_id.starts_with("cs_test_"));
        assert!(session.redirect_url.is_some());

        let captured = mock.checkout_requests.lock().unwrap();
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].metadata.get("plan_id").unwrap(), "pro");
        assert_eq!(captured[0].price_ref, "price_123");
    }

    #[tokio::test]
    async fn mock_records_cancellations() {
        let mock = MockGateway::new();
        mock.cancel_at_period_end("sub_abc").await.unwrap();
        assert_eq!(mock.cancelled_refs.lock().unwrap().as_slice(), ["sub_abc"]);
    }
}
