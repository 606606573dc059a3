//! CSRF token issuance and revocation.

use axum::{
    extract::Extension,
    http::{header::SET_COOKIE, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Json},
};
use chrono::Utc;
use std::sync::Arc;
use tracing::error;

use super::types::CsrfTokenResponse;
use crate::gate::{principal, SecurityGate};

/// Issue a fresh double-submit token for the authenticated user.
///
/// The token travels twice: once in the `Set-Cookie` response header and
/// once in the JSON body, so the client can mirror it into `x-csrf-token`.
#[utoipa::path(
    post,
    path = "/v1/csrf/token",
    params(
        ("x-auth-user-id" = String, Header, description = "Authenticated principal")
    ),
    responses(
        (status = 200, description = "Token issued", body = CsrfTokenResponse),
        (status = 401, description = "Missing or invalid principal", body = String),
        (status = 500, description = "Issuance failed", body = String)
    ),
    tag = "csrf"
)]
pub async fn issue_token(
    headers: HeaderMap,
    gate: Extension<Arc<SecurityGate>>,
) -> impl IntoResponse {
    let Some(user_id) = principal(&headers) else {
        return (StatusCode::UNAUTHORIZED, "Missing principal".to_string()).into_response();
    };

    let issued = match gate.vault.issue(user_id, Utc::now()).await {
        Ok(issued) => issued,
        Err(err) => {
            error!("Failed to issue CSRF token: {err}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Token issuance failed".to_string(),
            )
                .into_response();
        }
    };

    let Ok(cookie) = HeaderValue::from_str(&issued.cookie) else {
        error!("Issued CSRF cookie is not a valid header value");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Token issuance failed".to_string(),
        )
            .into_response();
    };

    let mut response_headers = HeaderMap::new();
    response_headers.insert(SET_COOKIE, cookie);

    (
        StatusCode::OK,
        response_headers,
        Json(CsrfTokenResponse {
            csrf_token: issued.token,
            expires_at: issued.expires_at,
        }),
    )
        .into_response()
}

/// Revoke the client's token by expiring the cookie.
///
/// The stored row is left for the lazy purge on the next issuance; without
/// the cookie the pair can no longer be presented.
#[utoipa::path(
    delete,
    path = "/v1/csrf/token",
    responses(
        (status = 204, description = "Cookie cleared")
    ),
    tag = "csrf"
)]
pub async fn revoke_token(gate: Extension<Arc<SecurityGate>>) -> impl IntoResponse {
    let cookie = gate.vault.revoke_cookie();
    let mut response_headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(&cookie) {
        response_headers.insert(SET_COOKIE, value);
    }

    (StatusCode::NO_CONTENT, response_headers)
}
