//! API error responses

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use draftmill_billing::BillingError;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("authentication required")]
    Unauthorized,

    #[error("invalid or expired token")]
    InvalidToken,

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("payment provider unavailable")]
    GatewayUnavailable,

    #[error("internal server error")]
    Internal,
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            // Deliberately generic: the response must not reveal whether
            // the header, timestamp, or digest was the problem.
            BillingError::WebhookSignatureInvalid => {
                ApiError::BadRequest("invalid webhook request".to_string())
            }
            BillingError::InvalidPlan(_)
            | BillingError::PlanNotPurchasable
            | BillingError::MissingPriceRef(_) => ApiError::BadRequest(err.to_string()),
            BillingError::WorkspaceNotFound(_) | BillingError::SubscriptionNotFound(_) => {
                ApiError::NotFound(err.to_string())
            }
            BillingError::Gateway(msg) => {
                tracing::error!(error = %msg, "Payment gateway error");
                ApiError::GatewayUnavailable
            }
            BillingError::Database(msg) => {
                tracing::error!(error = %msg, "Database error");
                ApiError::Internal
            }
            BillingError::Internal(msg) => {
                tracing::error!(error = %msg, "Internal billing error");
                ApiError::Internal
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Unauthorized | ApiError::InvalidToken => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::GatewayUnavailable => StatusCode::BAD_GATEWAY,
            ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_failure_maps_to_generic_400() {
        let err = ApiError::from(BillingError::WebhookSignatureInvalid);
        match err {
            ApiError::BadRequest(msg) => {
                assert!(!msg.contains("signature"));
                assert!(!msg.contains("timestamp"));
            }
            other => panic!("expected BadRequest, got {:?}", other),
        }
    }

    #[test]
    fn internal_errors_hide_detail() {
        let err = ApiError::from(BillingError::Database("relation missing".to_string()));
        assert_eq!(err.to_string(), "internal server error");
    }
}
