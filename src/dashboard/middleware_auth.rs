//! JWT auth for admin queue and run routes.
//!
//! Extracts the token from the `Authorization: Bearer <token>` header and
//! decodes it. The subject claim becomes the reviewer identity recorded as
//! `reviewed_by` on queue mutations. Mutating routes use the `RequireAdmin`
//! extractor to gate access; read routes stay open.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

/// Claims carried by an admin token.
#[derive(Debug, Deserialize)]
struct AdminClaims {
    /// Subject, recorded as the reviewer identity.
    sub: String,
    #[serde(default)]
    role: String,
}

/// Authenticated caller info, produced by the extractors.
#[derive(Debug, Clone, Serialize)]
pub struct AuthUser {
    pub user_id: String,
    pub role: String,
}

fn jwt_secret() -> Option<String> {
    std::env::var("ADMIN_JWT_SECRET").ok()
}

/// Decode and optionally verify a bearer token.
///
/// If `ADMIN_JWT_SECRET` is set, performs full HS256 verification including
/// expiry. Otherwise decodes without signature validation (development mode).
fn decode_jwt(token: &str) -> Result<AdminClaims, String> {
    if let Some(secret) = jwt_secret() {
        let key = DecodingKey::from_secret(secret.as_bytes());
        let validation = Validation::new(Algorithm::HS256);
        let data = decode::<AdminClaims>(token, &key, &validation)
            .map_err(|e| format!("JWT verification failed: {}", e))?;
        Ok(data.claims)
    } else {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.insecure_disable_signature_validation();
        validation.validate_exp = false;
        let data = decode::<AdminClaims>(token, &DecodingKey::from_secret(b""), &validation)
            .map_err(|e| format!("JWT decode failed: {}", e))?;
        Ok(data.claims)
    }
}

fn auth_user_from_parts(parts: &Parts) -> Option<AuthUser> {
    let auth_header = parts.headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = auth_header.strip_prefix("Bearer ")?;
    let claims = decode_jwt(token).ok()?;
    Some(AuthUser {
        user_id: claims.sub,
        role: claims.role,
    })
}

/// Axum extractor that requires an authenticated admin caller.
///
/// Returns 401 if no valid token is present, 403 if the caller's role claim
/// is not `admin`.
pub struct RequireAdmin(pub AuthUser);

impl<S: Send + Sync> FromRequestParts<S> for RequireAdmin {
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let auth_user = auth_user_from_parts(parts).ok_or_else(|| {
            (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({"error": "Authentication required"})),
            )
                .into_response()
        })?;

        if auth_user.role != "admin" {
            return Err((
                StatusCode::FORBIDDEN,
                Json(serde_json::json!({"error": "Admin access required"})),
            )
                .into_response());
        }

        Ok(RequireAdmin(auth_user))
    }
}
