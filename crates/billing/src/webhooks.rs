//! Payment provider webhook handling
//!
//! Verification first, state second: an event reaches the reconciler only
//! after its signature checks out against the shared secret, computed over
//! the exact raw request bytes. Delivery is at-least-once and possibly
//! out of order, so processing claims each event id atomically and the
//! reconciler rejects stale sequences.

use std::collections::HashMap;
use std::sync::Arc;

use draftmill_shared::{PlanId, SubscriptionStatus};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::catalog::PlanCatalog;
use crate::checkout::{META_PLAN_ID, META_WORKSPACE_ID};
use crate::error::{BillingError, BillingResult};
use crate::reconcile::{map_external_status, SubscriptionReconciler, SubscriptionUpdate};

type HmacSha256 = Hmac<Sha256>;

/// Signature timestamp tolerance in seconds
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Events stuck in "processing" longer than this can be re-claimed
const PROCESSING_TIMEOUT_MINUTES: i32 = 30;

// =============================================================================
// Wire types
// =============================================================================

/// A verified provider event
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    /// Provider-side creation time (unix seconds); the per-subscription
    /// ordering sequence.
    pub created: i64,
    pub data: EventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventData {
    pub object: EventObject,
}

/// The payload object, flattened to the fields reconciliation reads
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventObject {
    pub id: Option<String>,
    pub status: Option<String>,
    /// Subscription reference on checkout sessions and invoices
    pub subscription: Option<String>,
    pub current_period_start: Option<i64>,
    pub current_period_end: Option<i64>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Invoices carry the subscription's metadata here
    pub subscription_details: Option<SubscriptionDetails>,
    /// Subscription line items; the price reference lives on the first one
    pub items: Option<EventItems>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubscriptionDetails {
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventItems {
    #[serde(default)]
    pub data: Vec<EventItem>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventItem {
    pub price: Option<EventPrice>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventPrice {
    pub id: String,
}

/// Closed set of event types this system reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    CheckoutCompleted,
    SubscriptionUpdated,
    SubscriptionDeleted,
    PaymentFailed,
    /// Anything else: logged and ignored, never an error
    Unknown,
}

impl EventKind {
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "checkout.session.completed" => Self::CheckoutCompleted,
            "customer.subscription.updated" => Self::SubscriptionUpdated,
            "customer.subscription.deleted" => Self::SubscriptionDeleted,
            "invoice.payment_failed" => Self::PaymentFailed,
            _ => Self::Unknown,
        }
    }
}

impl GatewayEvent {
    pub fn kind(&self) -> EventKind {
        EventKind::from_tag(&self.event_type)
    }

    /// Event creation time as the reconciliation sequence
    pub fn event_at(&self) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(self.created)
            .unwrap_or_else(|_| OffsetDateTime::now_utc())
    }
}

impl EventObject {
    /// Correlation workspace id from the event metadata
    ///
    /// Checkout sessions and subscriptions carry it directly; invoices
    /// carry it under subscription_details.
    pub fn workspace_id(&self) -> Option<Uuid> {
        let raw = self.metadata.get(META_WORKSPACE_ID).or_else(|| {
            self.subscription_details
                .as_ref()
                .and_then(|d| d.metadata.get(META_WORKSPACE_ID))
        })?;
        Uuid::parse_str(raw).ok()
    }

    /// Plan id from the event metadata, when present
    pub fn plan_id(&self) -> Option<PlanId> {
        self.metadata
            .get(META_PLAN_ID)
            .and_then(|raw| raw.parse().ok())
    }

    /// Price reference from the first subscription line item
    pub fn price_ref(&self) -> Option<&str> {
        self.items
            .as_ref()?
            .data
            .first()?
            .price
            .as_ref()
            .map(|p| p.id.as_str())
    }

    fn period_start(&self) -> Option<OffsetDateTime> {
        self.current_period_start
            .and_then(|t| OffsetDateTime::from_unix_timestamp(t).ok())
    }

    fn period_end(&self) -> Option<OffsetDateTime> {
        self.current_period_end
            .and_then(|t| OffsetDateTime::from_unix_timestamp(t).ok())
    }
}

// =============================================================================
// Event authentication
// =============================================================================

/// Parse a `t=...,v1=...` signature header
fn parse_signature_header(header: &str) -> Option<(i64, String)> {
    let mut timestamp: Option<i64> = None;
    let mut v1_signature: Option<String> = None;

    for part in header.split(',') {
        let kv: Vec<&str> = part.splitn(2, '=').collect();
        if kv.len() == 2 {
            match kv[0] {
                "t" => timestamp = kv[1].parse().ok(),
                "v1" => v1_signature = Some(kv[1].to_string()),
                _ => {}
            }
        }
    }

    Some((timestamp?, v1_signature?))
}

/// HMAC-SHA256 over `"{timestamp}.{payload}"`, hex-encoded
fn compute_signature(secret: &str, timestamp: i64, payload: &[u8]) -> BillingResult<String> {
    // Secrets may carry the provider's "whsec_" prefix
    let secret_key = secret.strip_prefix("whsec_").unwrap_or(secret);

    let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes())
        .map_err(|_| BillingError::WebhookSignatureInvalid)?;
    mac.update(format!("{}.", timestamp).as_bytes());
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Verify a webhook payload against its signature header, with an
/// injectable clock for tests.
///
/// Operates on the exact raw request bytes; any upstream re-encoding of
/// the body would invalidate the signature.
pub fn verify_event_at(
    payload: &[u8],
    signature_header: &str,
    secret: &str,
    now_unix: i64,
) -> BillingResult<GatewayEvent> {
    let (timestamp, v1_signature) = parse_signature_header(signature_header).ok_or_else(|| {
        tracing::warn!("Malformed webhook signature header");
        BillingError::WebhookSignatureInvalid
    })?;

    if (now_unix - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        tracing::warn!(
            timestamp = timestamp,
            now = now_unix,
            "Webhook timestamp outside tolerance"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let computed = compute_signature(secret, timestamp, payload)?;
    if computed != v1_signature {
        tracing::warn!("Webhook signature mismatch");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let event: GatewayEvent = serde_json::from_slice(payload).map_err(|e| {
        tracing::warn!(parse_error = %e, "Verified webhook payload failed to parse");
        BillingError::WebhookSignatureInvalid
    })?;

    Ok(event)
}

/// Verify a webhook payload against its signature header
pub fn verify_event(
    payload: &[u8],
    signature_header: &str,
    secret: &str,
) -> BillingResult<GatewayEvent> {
    let now = OffsetDateTime::now_utc().unix_timestamp();
    verify_event_at(payload, signature_header, secret, now)
}

// =============================================================================
// Dispatch
// =============================================================================

/// Resolve the plan an event describes: correlation metadata first, then
/// the line item's price reference via catalog reverse lookup. Subscription
/// events edited in the provider dashboard can lack the metadata.
fn resolve_plan(object: &EventObject, catalog: &PlanCatalog) -> Option<PlanId> {
    object
        .plan_id()
        .or_else(|| object.price_ref().and_then(|r| catalog.plan_for_price_ref(r)))
}

/// Webhook handler: idempotency claim plus event-type dispatch
pub struct WebhookHandler {
    pool: PgPool,
    catalog: Arc<PlanCatalog>,
    reconciler: SubscriptionReconciler,
}

impl WebhookHandler {
    pub fn new(pool: PgPool, catalog: Arc<PlanCatalog>) -> Self {
        let reconciler = SubscriptionReconciler::new(pool.clone(), catalog.clone());
        Self {
            pool,
            catalog,
            reconciler,
        }
    }

    /// Handle a verified event
    ///
    /// The INSERT...ON CONFLICT...RETURNING claim guarantees exactly one
    /// concurrent delivery processes a given event id; redeliveries and
    /// losers of the race are acknowledged without reprocessing. Events
    /// stuck in "processing" past the timeout can be re-claimed.
    pub async fn handle_event(&self, event: GatewayEvent) -> BillingResult<()> {
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO gateway_webhook_events
                (event_id, event_type, event_timestamp, processing_result, processing_started_at)
            VALUES ($1, $2, $3, 'processing', NOW())
            ON CONFLICT (event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW()
            WHERE gateway_webhook_events.processing_result = 'processing'
              AND gateway_webhook_events.processing_started_at < NOW() - make_interval(mins => $4)
            RETURNING id
            "#,
        )
        .bind(&event.id)
        .bind(&event.event_type)
        .bind(event.event_at())
        .bind(PROCESSING_TIMEOUT_MINUTES)
        .fetch_optional(&self.pool)
        .await?;

        if claimed.is_none() {
            tracing::info!(
                event_id = %event.id,
                event_type = %event.event_type,
                "Duplicate webhook event, skipping"
            );
            return Ok(());
        }

        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            "Processing webhook event"
        );

        let result = self.dispatch(&event).await;

        let (processing_result, error_message) = match &result {
            Ok(()) => ("success", None),
            Err(e) => ("error", Some(e.to_string())),
        };
        if let Err(e) = sqlx::query(
            r#"
            UPDATE gateway_webhook_events
            SET processing_result = $1, error_message = $2
            WHERE event_id = $3
            "#,
        )
        .bind(processing_result)
        .bind(&error_message)
        .bind(&event.id)
        .execute(&self.pool)
        .await
        {
            tracing::error!(
                event_id = %event.id,
                error = %e,
                "Failed to record webhook processing result"
            );
        }

        result
    }

    async fn dispatch(&self, event: &GatewayEvent) -> BillingResult<()> {
        match event.kind() {
            EventKind::CheckoutCompleted => self.handle_checkout_completed(event).await,
            EventKind::SubscriptionUpdated => self.handle_subscription_updated(event).await,
            EventKind::SubscriptionDeleted => self.handle_subscription_deleted(event).await,
            EventKind::PaymentFailed => self.handle_payment_failed(event).await,
            EventKind::Unknown => {
                // New provider event types arrive before handlers exist
                // for them; acknowledge so the provider stops retrying.
                tracing::info!(
                    event_type = %event.event_type,
                    event_id = %event.id,
                    "Unhandled webhook event type, ignoring"
                );
                Ok(())
            }
        }
    }

    /// Extract the correlation workspace id, or drop the event
    ///
    /// An event that can never be correlated gets at most one attempt;
    /// the drop is logged and reported as success so the provider does
    /// not retry it forever.
    fn require_workspace(&self, event: &GatewayEvent) -> Option<Uuid> {
        let workspace_id = event.data.object.workspace_id();
        if workspace_id.is_none() {
            tracing::warn!(
                event_id = %event.id,
                event_type = %event.event_type,
                "Webhook event missing workspace correlation metadata, dropping"
            );
        }
        workspace_id
    }

    async fn reconcile_or_drop(
        &self,
        event: &GatewayEvent,
        workspace_id: Uuid,
        update: SubscriptionUpdate,
    ) -> BillingResult<()> {
        match self.reconciler.reconcile(workspace_id, update).await {
            Ok(_) => Ok(()),
            // The referenced workspace does not exist locally; a provider
            // retry can never succeed, so acknowledge and drop.
            Err(BillingError::WorkspaceNotFound(_)) => {
                tracing::warn!(
                    event_id = %event.id,
                    workspace_id = %workspace_id,
                    "Webhook event references unknown workspace, dropping"
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn handle_checkout_completed(&self, event: &GatewayEvent) -> BillingResult<()> {
        let Some(workspace_id) = self.require_workspace(event) else {
            return Ok(());
        };

        let object = &event.data.object;
        let Some(plan_id) = object.plan_id() else {
            tracing::warn!(
                event_id = %event.id,
                workspace_id = %workspace_id,
                "Checkout confirmation missing plan metadata, dropping"
            );
            return Ok(());
        };

        let update = SubscriptionUpdate {
            external_subscription_ref: object.subscription.clone(),
            plan_id: Some(plan_id),
            status: Some(SubscriptionStatus::Active),
            period_start: object.period_start(),
            period_end: object.period_end(),
            event_at: Some(event.event_at()),
        };

        self.reconcile_or_drop(event, workspace_id, update).await?;

        tracing::info!(
            workspace_id = %workspace_id,
            plan_id = %plan_id,
            "Checkout completed, subscription activated"
        );
        Ok(())
    }

    async fn handle_subscription_updated(&self, event: &GatewayEvent) -> BillingResult<()> {
        let Some(workspace_id) = self.require_workspace(event) else {
            return Ok(());
        };

        let object = &event.data.object;
        let update = SubscriptionUpdate {
            external_subscription_ref: object.id.clone(),
            plan_id: resolve_plan(object, &self.catalog),
            status: object.status.as_deref().map(map_external_status),
            period_start: object.period_start(),
            period_end: object.period_end(),
            event_at: Some(event.event_at()),
        };

        self.reconcile_or_drop(event, workspace_id, update).await
    }

    async fn handle_subscription_deleted(&self, event: &GatewayEvent) -> BillingResult<()> {
        let Some(workspace_id) = self.require_workspace(event) else {
            return Ok(());
        };

        // Cancellation only flips status. Plan and period_end stay as they
        // were: the workspace keeps its quota until the period boundary.
        let update = SubscriptionUpdate {
            status: Some(SubscriptionStatus::Canceled),
            event_at: Some(event.event_at()),
            ..Default::default()
        };

        self.reconcile_or_drop(event, workspace_id, update).await
    }

    async fn handle_payment_failed(&self, event: &GatewayEvent) -> BillingResult<()> {
        let Some(workspace_id) = self.require_workspace(event) else {
            return Ok(());
        };

        let update = SubscriptionUpdate {
            status: Some(SubscriptionStatus::PastDue),
            event_at: Some(event.event_at()),
            ..Default::default()
        };

        self.reconcile_or_drop(event, workspace_id, update).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test_secret";

    fn signed_header(payload: &[u8], timestamp: i64, secret: &str) -> String {
        let sig = compute_signature(secret, timestamp, payload).unwrap();
        format!("t={},v1={}", timestamp, sig)
    }

    fn sample_payload() -> Vec<u8> {
        serde_json::json!({
            "id": "evt_001",
            "type": "customer.subscription.updated",
            "created": 1_700_000_000,
            "data": {
                "object": {
                    "id": "sub_001",
                    "status": "past_due",
                    "current_period_start": 1_699_000_000,
                    "current_period_end": 1_701_600_000,
                    "metadata": {
                        "workspace_id": "7f7f2b9e-3d5a-4a42-9a6d-0cf1a2b3c4d5",
                        "plan_id": "starter"
                    }
                }
            }
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn valid_signature_verifies_and_parses() {
        let payload = sample_payload();
        let now = 1_700_000_010;
        let header = signed_header(&payload, now, SECRET);

        let event = verify_event_at(&payload, &header, SECRET, now).unwrap();
        assert_eq!(event.id, "evt_001");
        assert_eq!(event.kind(), EventKind::SubscriptionUpdated);
        assert_eq!(event.data.object.status.as_deref(), Some("past_due"));
        assert!(event.data.object.workspace_id().is_some());
        assert_eq!(event.data.object.plan_id(), Some(PlanId::Starter));
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let payload = sample_payload();
        let now = 1_700_000_010;
        let header = signed_header(&payload, now, SECRET);

        let mut tampered = payload.clone();
        // Flip one byte of the body
        tampered[20] ^= 0x01;

        let result = verify_event_at(&tampered, &header, SECRET, now);
        assert!(matches!(result, Err(BillingError::WebhookSignatureInvalid)));
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let payload = sample_payload();
        let now = 1_700_000_010;
        let header = signed_header(&payload, now, "whsec_other");

        let result = verify_event_at(&payload, &header, SECRET, now);
        assert!(matches!(result, Err(BillingError::WebhookSignatureInvalid)));
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let payload = sample_payload();
        let signed_at = 1_700_000_000;
        let header = signed_header(&payload, signed_at, SECRET);

        // 301 seconds later: outside tolerance
        let result = verify_event_at(&payload, &header, SECRET, signed_at + 301);
        assert!(matches!(result, Err(BillingError::WebhookSignatureInvalid)));

        // 300 seconds later: still within tolerance
        assert!(verify_event_at(&payload, &header, SECRET, signed_at + 300).is_ok());
    }

    #[test]
    fn malformed_signature_header_is_rejected() {
        let payload = sample_payload();
        for header in ["", "t=abc,v1=def", "v1=onlysig", "t=1700000000"] {
            let result = verify_event_at(&payload, header, SECRET, 1_700_000_000);
            assert!(
                matches!(result, Err(BillingError::WebhookSignatureInvalid)),
                "header {:?} should fail",
                header
            );
        }
    }

    #[test]
    fn event_kind_mapping_is_closed() {
        assert_eq!(
            EventKind::from_tag("checkout.session.completed"),
            EventKind::CheckoutCompleted
        );
        assert_eq!(
            EventKind::from_tag("customer.subscription.updated"),
            EventKind::SubscriptionUpdated
        );
        assert_eq!(
            EventKind::from_tag("customer.subscription.deleted"),
            EventKind::SubscriptionDeleted
        );
        assert_eq!(
            EventKind::from_tag("invoice.payment_failed"),
            EventKind::PaymentFailed
        );
        assert_eq!(
            EventKind::from_tag("customer.tax_id.created"),
            EventKind::Unknown
        );
    }

    #[test]
    fn workspace_id_extraction_falls_back_to_subscription_details() {
        let ws = Uuid::new_v4();
        let object = EventObject {
            subscription_details: Some(SubscriptionDetails {
                metadata: [(META_WORKSPACE_ID.to_string(), ws.to_string())]
                    .into_iter()
                    .collect(),
            }),
            ..Default::default()
        };
        assert_eq!(object.workspace_id(), Some(ws));
    }

    #[test]
    fn plan_resolution_falls_back_to_price_ref() {
        let config = crate::config::BillingConfig {
            secret_key: "sk_test".to_string(),
            webhook_secret: "whsec_test".to_string(),
            price_starter: Some("price_starter_1".to_string()),
            price_pro: Some("price_pro_1".to_string()),
            price_enterprise: None,
        };
        let catalog = PlanCatalog::new(&config);

        // Metadata wins when present
        let with_metadata = EventObject {
            metadata: [(META_PLAN_ID.to_string(), "starter".to_string())]
                .into_iter()
                .collect(),
            items: Some(EventItems {
                data: vec![EventItem {
                    price: Some(EventPrice {
                        id: "price_pro_1".to_string(),
                    }),
                }],
            }),
            ..Default::default()
        };
        assert_eq!(resolve_plan(&with_metadata, &catalog), Some(PlanId::Starter));

        // Without metadata the line item's price reference resolves the plan
        let without_metadata = EventObject {
            items: Some(EventItems {
                data: vec![EventItem {
                    price: Some(EventPrice {
                        id: "price_pro_1".to_string(),
                    }),
                }],
            }),
            ..Default::default()
        };
        assert_eq!(resolve_plan(&without_metadata, &catalog), Some(PlanId::Pro));

        // Neither present: no plan change
        assert_eq!(resolve_plan(&EventObject::default(), &catalog), None);
    }

    #[test]
    fn missing_or_garbled_workspace_metadata_yields_none() {
        let object = EventObject::default();
        assert_eq!(object.workspace_id(), None);

        let garbled = EventObject {
            metadata: [(META_WORKSPACE_ID.to_string(), "not-a-uuid".to_string())]
                .into_iter()
                .collect(),
            ..Default::default()
        };
        assert_eq!(garbled.workspace_id(), None);
    }
}
