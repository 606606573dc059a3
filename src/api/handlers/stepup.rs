//! Step-up evaluation and completion endpoints.

use axum::{
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json},
};
use chrono::Utc;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::error;

use super::types::{CompleteResponse, EvaluateRequest, EvaluateResponse};
use crate::gate::{principal, SecurityGate};
use crate::stepup::storage::{load_session, load_tenant_policy, mark_mfa_verified};
use crate::stepup::{ChallengeMode, Decision};

/// Evaluate the step-up decision for the caller's session.
#[utoipa::path(
    post,
    path = "/v1/stepup/evaluate",
    request_body = EvaluateRequest,
    params(
        ("x-auth-user-id" = String, Header, description = "Authenticated principal")
    ),
    responses(
        (status = 200, description = "Decision for the session", body = EvaluateResponse),
        (status = 401, description = "Missing principal or unknown session", body = String),
        (status = 500, description = "Evaluation failed", body = String)
    ),
    tag = "stepup"
)]
pub async fn evaluate(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    gate: Extension<Arc<SecurityGate>>,
    payload: Option<Json<EvaluateRequest>>,
) -> impl IntoResponse {
    let Some(user_id) = principal(&headers) else {
        return (StatusCode::UNAUTHORIZED, "Missing principal".to_string()).into_response();
    };
    let request = payload.map(|Json(payload)| payload).unwrap_or_default();

    let session = match load_session(&pool, user_id).await {
        Ok(Some(session)) => session,
        Ok(None) => {
            return (StatusCode::UNAUTHORIZED, "Unknown session".to_string()).into_response();
        }
        Err(err) => {
            error!("Failed to load session for step-up evaluation: {err}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Evaluation failed".to_string(),
            )
                .into_response();
        }
    };

    let policy = match session.tenant_id {
        Some(tenant_id) => match load_tenant_policy(&pool, tenant_id).await {
            Ok(policy) => policy,
            Err(err) => {
                error!("Failed to load tenant policy for step-up evaluation: {err}");
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Evaluation failed".to_string(),
                )
                    .into_response();
            }
        },
        None => None,
    };

    let decision = gate.engine.evaluate(&session, policy.as_ref(), Utc::now());
    let challenge_mode = (decision == Decision::RequireChallenge)
        .then(|| ChallengeMode::for_navigation(request.return_to.as_deref()));

    Json(EvaluateResponse {
        decision,
        challenge_mode,
        return_to: request.return_to,
    })
    .into_response()
}

/// Record a successful second-factor verification and hand back any parked
/// continuation.
///
/// The timestamp is persisted before the continuation is taken, so a crash
/// between the two leaves the user verified with nothing to retry but a
/// click.
#[utoipa::path(
    post,
    path = "/v1/stepup/complete",
    params(
        ("x-auth-user-id" = String, Header, description = "Authenticated principal")
    ),
    responses(
        (status = 200, description = "Verification recorded", body = CompleteResponse),
        (status = 401, description = "Missing principal", body = String),
        (status = 500, description = "Completion failed", body = String)
    ),
    tag = "stepup"
)]
pub async fn complete(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    gate: Extension<Arc<SecurityGate>>,
) -> impl IntoResponse {
    let Some(user_id) = principal(&headers) else {
        return (StatusCode::UNAUTHORIZED, "Missing principal".to_string()).into_response();
    };

    let now = Utc::now();
    if let Err(err) = mark_mfa_verified(&pool, user_id, now).await {
        error!("Failed to record MFA verification: {err}");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Completion failed".to_string(),
        )
            .into_response();
    }

    let pending_action = match gate.engine.complete(user_id, now).await {
        Ok(pending) => pending,
        Err(err) => {
            error!("Failed to take pending challenge: {err}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Completion failed".to_string(),
            )
                .into_response();
        }
    };

    Json(CompleteResponse {
        resumed: pending_action.is_some(),
        pending_action,
    })
    .into_response()
}
