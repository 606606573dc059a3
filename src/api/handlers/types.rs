//! Request and response bodies for the gate's HTTP surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::breach::BreachContext;
use crate::stepup::{ChallengeMode, Decision, PendingChallenge};

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct CsrfTokenResponse {
    pub csrf_token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug, Default)]
pub struct EvaluateRequest {
    /// Continuation target for full-page flows. Its presence selects the
    /// redirect challenge mode.
    #[serde(default)]
    pub return_to: Option<String>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct EvaluateResponse {
    pub decision: Decision,
    /// Present only when the decision requires a challenge.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub challenge_mode: Option<ChallengeMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub return_to: Option<String>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct CompleteResponse {
    /// True if a parked continuation was handed back by this completion.
    pub resumed: bool,
    /// The continuation for the caller to execute, when one was parked.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_action: Option<PendingChallenge>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct ViolationRequest {
    pub violation_type: String,
    /// IP the violation was observed from. Defaults to the caller's own IP
    /// when a sibling service reports on its own behalf.
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub threshold: Option<i64>,
    #[serde(default)]
    pub window_minutes: Option<i64>,
    #[serde(default)]
    pub block_minutes: Option<i64>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct ViolationResponse {
    pub should_block: bool,
    pub violation_count: i64,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct BreachReportRequest {
    /// Error message surfaced by the external auth provider.
    #[serde(default)]
    pub message: Option<String>,
    /// Machine-readable error code, when the provider sends one.
    #[serde(default)]
    pub code: Option<String>,
    pub context: BreachContext,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub user_id: Option<uuid::Uuid>,
    /// True when the user has since set a clean password; records a
    /// resolution instead of a rejection.
    #[serde(default)]
    pub resolved: bool,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct BreachReportResponse {
    pub breach: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classification: Option<String>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct BlockStatusResponse {
    pub blocked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// RFC 3339 timestamp, the string `"permanent"`, or null.
    #[serde(rename = "blockedUntil")]
    pub blocked_until: serde_json::Value,
}
