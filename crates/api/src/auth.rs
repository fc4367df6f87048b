//! Workspace authentication
//!
//! Bearer JWTs scoped to a workspace. The middleware validates the token
//! and injects [`AuthWorkspace`] as a request extension for handlers.

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::ApiError;

/// JWT claims for workspace-scoped access tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id
    pub sub: Uuid,
    /// Workspace the token grants access to
    pub workspace_id: Uuid,
    pub exp: i64,
    pub iat: i64,
}

/// Authenticated workspace context injected by the auth middleware
#[derive(Debug, Clone)]
pub struct AuthWorkspace {
    pub user_id: Uuid,
    pub workspace_id: Uuid,
}

#[derive(Clone)]
pub struct JwtManager {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    expiry_hours: i64,
}

impl JwtManager {
    pub fn new(secret: &str, expiry_hours: i64) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            expiry_hours,
        }
    }

    pub fn issue_token(&self, user_id: Uuid, workspace_id: Uuid) -> Result<String, ApiError> {
        let now = OffsetDateTime::now_utc();
        let claims = Claims {
            sub: user_id,
            workspace_id,
            iat: now.unix_timestamp(),
            exp: (now + Duration::hours(self.expiry_hours)).unix_timestamp(),
        };
        encode(&Header::default(), &claims, &self.encoding_key).map_err(|e| {
            tracing::error!(error = %e, "Failed to sign access token");
            ApiError::Internal
        })
    }

    pub fn validate_token(&self, token: &str) -> Result<Claims, ApiError> {
        decode::<Claims>(token, &self.decoding_key, &Validation::default())
            .map(|data| data.claims)
            .map_err(|_| ApiError::InvalidToken)
    }
}

fn extract_bearer_token(request: &Request) -> Option<&str> {
    request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|header| header.strip_prefix("Bearer "))
}

/// Middleware that requires a valid workspace token
pub async fn require_auth(
    State(jwt): State<JwtManager>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(token) = extract_bearer_token(&request) else {
        return ApiError::Unauthorized.into_response();
    };

    match jwt.validate_token(token) {
        Ok(claims) => {
            request.extensions_mut().insert(AuthWorkspace {
                user_id: claims.sub,
                workspace_id: claims.workspace_id,
            });
            next.run(request).await
        }
        Err(err) => {
            tracing::warn!(path = %request.uri().path(), "Token validation failed");
            err.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_token_round_trips() {
        let jwt = JwtManager::new("test-secret", 24);
        let user_id = Uuid::new_v4();
        let workspace_id = Uuid::new_v4();

        let token = jwt.issue_token(user_id, workspace_id).unwrap();
        let claims = jwt.validate_token(&token).unwrap();

        assert_eq!(claims.sub, user_id);
        assert_eq!(claims.workspace_id, workspace_id);
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let issuer = JwtManager::new("secret-a", 24);
        let verifier = JwtManager::new("secret-b", 24);

        let token = issuer.issue_token(Uuid::new_v4(), Uuid::new_v4()).unwrap();
        assert!(matches!(
            verifier.validate_token(&token),
            Err(ApiError::InvalidToken)
        ));
    }

    #[test]
    fn garbage_token_is_rejected() {
        let jwt = JwtManager::new("test-secret", 24);
        assert!(matches!(
            jwt.validate_token("not.a.jwt"),
            Err(ApiError::InvalidToken)
        ));
    }
}
