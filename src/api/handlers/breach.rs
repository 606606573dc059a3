//! Breach classification reports from sibling services.
//!
//! The external auth provider rejects breached passwords; the service that
//! observed the rejection posts the provider error here so it is classified
//! consistently and lands in the audit trail.

use axum::{
    extract::Extension,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json},
};
use std::sync::Arc;

use super::types::{BreachReportRequest, BreachReportResponse};
use crate::breach::AuthProviderError;
use crate::gate::SecurityGate;

/// Classify an auth-provider error and record it in the audit trail.
#[utoipa::path(
    post,
    path = "/v1/breach/reports",
    request_body = BreachReportRequest,
    responses(
        (status = 200, description = "Classification result", body = BreachReportResponse),
        (status = 400, description = "Missing payload", body = String)
    ),
    tag = "breach"
)]
pub async fn report(
    headers: HeaderMap,
    gate: Extension<Arc<SecurityGate>>,
    payload: Option<Json<BreachReportRequest>>,
) -> impl IntoResponse {
    let request: BreachReportRequest = match payload {
        Some(Json(payload)) => payload,
        None => return (StatusCode::BAD_REQUEST, "Missing payload".to_string()).into_response(),
    };

    let mut error = AuthProviderError::new(request.message.unwrap_or_default());
    if let Some(code) = request.code {
        error = error.with_code(code);
    }

    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok());
    let classification = gate.breach.classify(&error);

    if request.resolved {
        gate.breach.log_breach_resolution(
            request.context,
            request.email.as_deref(),
            request.user_id,
            user_agent,
        );
    } else if classification.is_some() {
        gate.breach.log_breach_event(
            request.context,
            request.email.as_deref(),
            request.user_id,
            user_agent,
        );
    }

    Json(BreachReportResponse {
        breach: classification.is_some(),
        classification: classification.map(str::to_string),
    })
    .into_response()
}
