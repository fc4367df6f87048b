//! Billing endpoints

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::{Extension, Json};
use draftmill_billing::{verify_event, CheckoutSessionInfo, SubscriptionView};
use draftmill_shared::PlanId;
use serde::Deserialize;
use serde_json::json;

use crate::auth::AuthWorkspace;
use crate::error::ApiError;
use crate::state::AppState;

/// GET /billing/plans
pub async fn list_plans(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "plans": state.billing.catalog.plans() }))
}

#[derive(Debug, Deserialize)]
pub struct SubscribeRequest {
    pub plan_id: PlanId,
    pub success_url: Option<String>,
    pub cancel_url: Option<String>,
}

/// Checkout return links, falling back to the configured app base URL
fn checkout_urls(req: &SubscribeRequest, app_base_url: &str) -> (String, String) {
    let success_url = req
        .success_url
        .clone()
        .unwrap_or_else(|| format!("{}/billing/success", app_base_url));
    let cancel_url = req
        .cancel_url
        .clone()
        .unwrap_or_else(|| format!("{}/billing/cancelled", app_base_url));
    (success_url, cancel_url)
}

/// POST /billing/subscribe
///
/// Starts a hosted checkout session for the authenticated workspace and
/// returns the redirect URL. No local state is written here; activation
/// happens when the provider's confirmation event arrives.
pub async fn subscribe(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthWorkspace>,
    Json(req): Json<SubscribeRequest>,
) -> Result<Json<CheckoutSessionInfo>, ApiError> {
    let (success_url, cancel_url) = checkout_urls(&req, &state.config.app_base_url);

    let session = state
        .billing
        .checkout
        .start_checkout(auth.workspace_id, req.plan_id, &success_url, &cancel_url)
        .await?;

    Ok(Json(session))
}

/// GET /billing/subscription
pub async fn get_subscription(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthWorkspace>,
) -> Result<Json<SubscriptionView>, ApiError> {
    let view = state
        .billing
        .entitlements
        .subscription_view(auth.workspace_id)
        .await?;

    Ok(Json(view))
}

/// POST /billing/cancel
///
/// Cancels at period end. 404 when the workspace has no paid subscription
/// to cancel.
pub async fn cancel(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthWorkspace>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let subscription = state.billing.cancel_subscription(auth.workspace_id).await?;

    Ok(Json(json!({
        "status": subscription.status,
        "plan_id": subscription.plan_id,
        "period_end": subscription.period_end,
    })))
}

/// POST /billing/webhook
///
/// Takes the raw body bytes: signature verification runs over the exact
/// payload the provider signed, before any JSON parsing. Verification
/// failures are a generic 400. Processing failures after verification are
/// a 500 so the provider redelivers; the idempotency claim makes the
/// redelivery safe.
pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest("invalid webhook request".to_string()))?;

    let event = verify_event(&body, signature, &state.billing.config.webhook_secret)?;

    state.billing.webhooks.handle_event(event).await?;

    Ok(Json(json!({ "received": true })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn omitted_return_urls_fall_back_to_app_base() {
        let req = SubscribeRequest {
            plan_id: PlanId::Pro,
            success_url: None,
            cancel_url: None,
        };

        let (success, cancel) = checkout_urls(&req, "https://app.draftmill.test");
        assert_eq!(success, "https://app.draftmill.test/billing/success");
        assert_eq!(cancel, "https://app.draftmill.test/billing/cancelled");
    }

    #[test]
    fn explicit_return_urls_are_kept() {
        let req = SubscribeRequest {
            plan_id: PlanId::Starter,
            success_url: Some("https://elsewhere.test/ok".to_string()),
            cancel_url: None,
        };

        let (success, cancel) = checkout_urls(&req, "https://app.draftmill.test");
        assert_eq!(success, "https://elsewhere.test/ok");
        assert_eq!(cancel, "https://app.draftmill.test/billing/cancelled");
    }
}
