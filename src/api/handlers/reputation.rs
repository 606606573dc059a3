//! Violation reporting and block lookups for sibling services.

use axum::{
    extract::{Extension, Path},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json},
};
use chrono::Utc;
use std::sync::Arc;
use tracing::error;

use super::types::{BlockStatusResponse, ViolationRequest, ViolationResponse};
use crate::gate::SecurityGate;
use crate::reputation::{extract_client_ip, ViolationLimits};

/// Record a violation against an IP, escalating to a block at the threshold.
#[utoipa::path(
    post,
    path = "/v1/reputation/violations",
    request_body = ViolationRequest,
    responses(
        (status = 200, description = "Violation recorded", body = ViolationResponse),
        (status = 400, description = "Missing payload or unresolvable IP", body = String),
        (status = 500, description = "Recording failed", body = String)
    ),
    tag = "reputation"
)]
pub async fn record_violation(
    headers: HeaderMap,
    gate: Extension<Arc<SecurityGate>>,
    payload: Option<Json<ViolationRequest>>,
) -> impl IntoResponse {
    let request: ViolationRequest = match payload {
        Some(Json(payload)) => payload,
        None => return (StatusCode::BAD_REQUEST, "Missing payload".to_string()).into_response(),
    };

    if request.violation_type.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "Missing violation type".to_string()).into_response();
    }

    let ip = match request.ip_address.or_else(|| extract_client_ip(&headers)) {
        Some(ip) => ip,
        None => {
            return (StatusCode::BAD_REQUEST, "Client IP unknown".to_string()).into_response();
        }
    };

    let defaults = ViolationLimits::default();
    let limits = ViolationLimits {
        threshold: request.threshold.unwrap_or(defaults.threshold),
        window_minutes: request.window_minutes.unwrap_or(defaults.window_minutes),
        block_minutes: request.block_minutes.unwrap_or(defaults.block_minutes),
    };

    match gate
        .reputation
        .record_violation(&ip, request.violation_type.trim(), limits, Utc::now())
        .await
    {
        Ok(outcome) => Json(ViolationResponse {
            should_block: outcome.should_block,
            violation_count: outcome.violation_count,
        })
        .into_response(),
        Err(err) => {
            error!("Failed to record violation for {ip}: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Recording failed".to_string(),
            )
                .into_response()
        }
    }
}

/// Blocking predicate lookup for an IP.
#[utoipa::path(
    get,
    path = "/v1/reputation/blocks/{ip}",
    params(
        ("ip" = String, Path, description = "IP address to look up")
    ),
    responses(
        (status = 200, description = "Block status", body = BlockStatusResponse)
    ),
    tag = "reputation"
)]
pub async fn lookup_block(
    Path(ip): Path<String>,
    gate: Extension<Arc<SecurityGate>>,
) -> impl IntoResponse {
    let status = gate.reputation.is_blocked(&ip, Utc::now()).await;

    Json(BlockStatusResponse {
        blocked: status.blocked,
        reason: status.reason.clone(),
        blocked_until: status.blocked_until_value(),
    })
}
