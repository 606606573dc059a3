//! Composition root: reputation, CSRF integrity, and step-up policy wired in
//! a fixed order.
//!
//! Every request passes reputation first (cheapest check, blocks abusers
//! before they touch anything), then CSRF double-submit on mutating calls,
//! and only then the step-up policy at the handlers that need it. An IP block
//! must not leak whether a CSRF token or session would have been accepted.

use std::sync::Arc;

use axum::extract::Request;
use axum::http::{HeaderMap, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Json, Response};
use axum::Extension;
use chrono::Utc;
use serde_json::json;
use sqlx::PgPool;
use thiserror::Error;
use url::Url;
use uuid::Uuid;

use crate::breach::BreachGuard;
use crate::csrf::storage::PgTokenStore;
use crate::csrf::{
    extract_cookie_token, TokenStore, TokenVault, CSRF_HEADER_NAME, DEFAULT_CSRF_TTL_SECONDS,
};
use crate::events::{HttpEventSink, NoopEventSink, SecurityEventSink};
use crate::reputation::storage::PgViolationStore;
use crate::reputation::{extract_client_ip, BlockStatus, ReputationTracker, ViolationStore};
use crate::stepup::storage::PgPendingStore;
use crate::stepup::{PendingStore, StepUpPolicyEngine, DEFAULT_STEPUP_WINDOW_SECONDS};

/// Header carrying the already-authenticated principal, set by the fronting
/// session layer.
pub const AUTH_USER_HEADER: &str = "x-auth-user-id";

/// Tunable knobs for the gate, built up from CLI flags.
#[derive(Clone, Debug)]
pub struct GateConfig {
    csrf_ttl_seconds: i64,
    stepup_window_seconds: i64,
    audit_url: Option<Url>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            csrf_ttl_seconds: DEFAULT_CSRF_TTL_SECONDS,
            stepup_window_seconds: DEFAULT_STEPUP_WINDOW_SECONDS,
            audit_url: None,
        }
    }
}

impl GateConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_csrf_ttl_seconds(mut self, ttl_seconds: i64) -> Self {
        self.csrf_ttl_seconds = ttl_seconds;
        self
    }

    #[must_use]
    pub fn with_stepup_window_seconds(mut self, window_seconds: i64) -> Self {
        self.stepup_window_seconds = window_seconds;
        self
    }

    #[must_use]
    pub fn with_audit_url(mut self, audit_url: Option<Url>) -> Self {
        self.audit_url = audit_url;
        self
    }

    #[must_use]
    pub fn csrf_ttl_seconds(&self) -> i64 {
        self.csrf_ttl_seconds
    }

    #[must_use]
    pub fn stepup_window_seconds(&self) -> i64 {
        self.stepup_window_seconds
    }

    #[must_use]
    pub fn audit_url(&self) -> Option<&Url> {
        self.audit_url.as_ref()
    }
}

/// Rejections produced by the gate. All map to 403: the caller learns that
/// the request was refused, not which layer refused it beyond the reason tag.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("request blocked by IP reputation")]
    RateLimitBlock(BlockStatus),
    #[error("request integrity check failed: {0}")]
    IntegrityFailure(&'static str),
    #[error("step-up policy denied the request")]
    PolicyDenial,
}

impl IntoResponse for GateError {
    fn into_response(self) -> Response {
        let body = match &self {
            Self::RateLimitBlock(status) => json!({
                "error": "forbidden",
                "reason": "ip_blocked",
                "message": status
                    .reason
                    .clone()
                    .unwrap_or_else(|| "access denied".to_string()),
                "blockedUntil": status.blocked_until_value(),
            }),
            Self::IntegrityFailure(detail) => json!({
                "error": "forbidden",
                "reason": "csrf",
                "message": detail,
            }),
            Self::PolicyDenial => json!({
                "error": "forbidden",
                "reason": "stepup_required",
                "message": "additional verification required",
            }),
        };
        (StatusCode::FORBIDDEN, Json(body)).into_response()
    }
}

/// All five security components behind one handle, shared via `Extension`.
///
/// Generic over the store seams so the middleware runs against in-memory
/// stores in tests; the defaults are the Postgres implementations the server
/// wires in production.
pub struct SecurityGate<T = PgTokenStore, V = PgViolationStore, P = PgPendingStore> {
    pub reputation: ReputationTracker<V>,
    pub vault: TokenVault<T>,
    pub engine: StepUpPolicyEngine<P>,
    pub breach: BreachGuard,
    pub config: GateConfig,
}

impl SecurityGate {
    /// Wire the components against the shared pool.
    ///
    /// # Errors
    /// Returns an error if the audit sink HTTP client cannot be built.
    pub fn new(pool: PgPool, config: GateConfig) -> anyhow::Result<Self> {
        let sink: Arc<dyn SecurityEventSink> = match config.audit_url() {
            Some(url) => Arc::new(HttpEventSink::new(url.clone())?),
            None => Arc::new(NoopEventSink),
        };

        Ok(Self::from_parts(
            ReputationTracker::new(PgViolationStore::new(pool.clone())),
            TokenVault::new(PgTokenStore::new(pool.clone()))
                .with_ttl_seconds(config.csrf_ttl_seconds()),
            StepUpPolicyEngine::new(config.stepup_window_seconds(), PgPendingStore::new(pool)),
            BreachGuard::new(sink),
            config,
        ))
    }
}

impl<T: TokenStore, V: ViolationStore, P: PendingStore> SecurityGate<T, V, P> {
    /// Assemble a gate from already-built components.
    #[must_use]
    pub fn from_parts(
        reputation: ReputationTracker<V>,
        vault: TokenVault<T>,
        engine: StepUpPolicyEngine<P>,
        breach: BreachGuard,
        config: GateConfig,
    ) -> Self {
        Self {
            reputation,
            vault,
            engine,
            breach,
            config,
        }
    }
}

/// First gate layer: refuse blocked IPs before anything else runs.
///
/// A request without a resolvable client IP passes: blocking "unknown" would
/// punish every caller behind a misconfigured proxy at once.
pub async fn reputation_middleware<T, V, P>(
    Extension(gate): Extension<Arc<SecurityGate<T, V, P>>>,
    request: Request,
    next: Next,
) -> Response
where
    T: TokenStore + 'static,
    V: ViolationStore + 'static,
    P: PendingStore + 'static,
{
    let Some(ip) = extract_client_ip(request.headers()) else {
        return next.run(request).await;
    };

    let status = gate.reputation.is_blocked(&ip, Utc::now()).await;
    if status.blocked {
        return GateError::RateLimitBlock(status).into_response();
    }

    next.run(request).await
}

/// Second gate layer: double-submit CSRF validation on mutating calls.
///
/// Fails closed: a missing principal, cookie, or header is a denial, as is
/// any validation failure.
pub async fn csrf_middleware<T, V, P>(
    Extension(gate): Extension<Arc<SecurityGate<T, V, P>>>,
    request: Request,
    next: Next,
) -> Response
where
    T: TokenStore + 'static,
    V: ViolationStore + 'static,
    P: PendingStore + 'static,
{
    if is_csrf_exempt(request.method(), request.uri().path()) {
        return next.run(request).await;
    }

    let Some(user_id) = principal(request.headers()) else {
        return GateError::IntegrityFailure("missing or invalid principal").into_response();
    };
    let Some(cookie_token) = extract_cookie_token(request.headers()) else {
        return GateError::IntegrityFailure("missing CSRF cookie").into_response();
    };
    let Some(header_token) = header_token(request.headers()) else {
        return GateError::IntegrityFailure("missing CSRF header").into_response();
    };

    if !gate
        .vault
        .validate(&header_token, &cookie_token, user_id, Utc::now())
        .await
    {
        return GateError::IntegrityFailure("CSRF token rejected").into_response();
    }

    next.run(request).await
}

/// Reads and writes that carry no body-changing intent skip CSRF, as do the
/// token bootstrap endpoint (a client cannot present a token it does not
/// have yet) and the internal reporting surfaces (machine callers from
/// sibling services hold no browser cookie jar).
fn is_csrf_exempt(method: &Method, path: &str) -> bool {
    if matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS) {
        return true;
    }
    *method == Method::POST
        && matches!(
            path,
            "/v1/csrf/token" | "/v1/reputation/violations" | "/v1/breach/reports"
        )
}

/// Principal forwarded by the session layer.
#[must_use]
pub fn principal(headers: &HeaderMap) -> Option<Uuid> {
    headers
        .get(AUTH_USER_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| Uuid::parse_str(value.trim()).ok())
}

fn header_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(CSRF_HEADER_NAME)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csrf::CsrfTokenRecord;
    use crate::reputation::{IpBlock, ViolationLimits};
    use crate::stepup::PendingChallenge;
    use anyhow::Result;
    use axum::body::{to_bytes, Body};
    use axum::http::HeaderValue;
    use axum::middleware;
    use axum::routing::post;
    use axum::Router;
    use chrono::{DateTime, Duration};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tower::{ServiceBuilder, ServiceExt};

    #[derive(Default)]
    struct MemoryTokenStore {
        records: Mutex<Vec<CsrfTokenRecord>>,
    }

    impl TokenStore for MemoryTokenStore {
        async fn insert(&self, record: CsrfTokenRecord) -> Result<()> {
            self.records.lock().expect("store lock").push(record);
            Ok(())
        }

        async fn find(&self, user_id: Uuid, token: &str) -> Result<Option<CsrfTokenRecord>> {
            let records = self.records.lock().expect("store lock");
            Ok(records
                .iter()
                .find(|record| record.user_id == user_id && record.token == token)
                .cloned())
        }

        async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
            let mut records = self.records.lock().expect("store lock");
            let before = records.len();
            records.retain(|record| record.expires_at >= now);
            Ok((before - records.len()) as u64)
        }
    }

    #[derive(Default)]
    struct MemoryViolationStore {
        counters: Mutex<HashMap<(String, String), i64>>,
        blocks: Mutex<HashMap<String, IpBlock>>,
    }

    impl ViolationStore for MemoryViolationStore {
        async fn increment_violation(
            &self,
            ip: &str,
            violation_type: &str,
            _window_minutes: i64,
            _now: DateTime<Utc>,
        ) -> Result<i64> {
            let mut counters = self.counters.lock().expect("counter lock");
            let count = counters
                .entry((ip.to_string(), violation_type.to_string()))
                .or_insert(0);
            *count += 1;
            Ok(*count)
        }

        async fn upsert_block(&self, block: IpBlock) -> Result<()> {
            self.blocks
                .lock()
                .expect("block lock")
                .insert(block.ip_address.clone(), block);
            Ok(())
        }

        async fn find_block(&self, ip: &str) -> Result<Option<IpBlock>> {
            Ok(self.blocks.lock().expect("block lock").get(ip).cloned())
        }
    }

    #[derive(Default)]
    struct MemoryPendingStore {
        rows: Mutex<HashMap<Uuid, PendingChallenge>>,
    }

    impl PendingStore for MemoryPendingStore {
        async fn upsert(&self, pending: PendingChallenge) -> Result<()> {
            self.rows
                .lock()
                .expect("pending lock")
                .insert(pending.user_id, pending);
            Ok(())
        }

        async fn take(&self, user_id: Uuid) -> Result<Option<PendingChallenge>> {
            Ok(self.rows.lock().expect("pending lock").remove(&user_id))
        }

        async fn exists(&self, user_id: Uuid) -> Result<bool> {
            Ok(self.rows.lock().expect("pending lock").contains_key(&user_id))
        }
    }

    type TestGate = SecurityGate<MemoryTokenStore, MemoryViolationStore, MemoryPendingStore>;

    fn test_gate(violations: MemoryViolationStore) -> Arc<TestGate> {
        Arc::new(SecurityGate::from_parts(
            ReputationTracker::new(violations),
            TokenVault::new(MemoryTokenStore::default()),
            StepUpPolicyEngine::new(DEFAULT_STEPUP_WINDOW_SECONDS, MemoryPendingStore::default()),
            BreachGuard::new(Arc::new(NoopEventSink)),
            GateConfig::new(),
        ))
    }

    /// Same layer ordering as the server: reputation outermost, CSRF inside.
    fn gated(router: Router, gate: Arc<TestGate>) -> Router {
        router.layer(
                ServiceBuilder::new()
                    .layer(Extension(gate))
                    .layer(middleware::from_fn(
                        reputation_middleware::<
                            MemoryTokenStore,
                            MemoryViolationStore,
                            MemoryPendingStore,
                        >,
                    ))
                    .layer(middleware::from_fn(
                        csrf_middleware::<
                            MemoryTokenStore,
                            MemoryViolationStore,
                            MemoryPendingStore,
                        >,
                    )),
            )
    }

    fn gated_app(gate: Arc<TestGate>) -> Router {
        gated(
            Router::new().route(
                "/v1/widgets",
                post(|| async { "created" }).get(|| async { "listed" }),
            ),
            gate,
        )
    }

    async fn body_json(response: Response) -> Result<serde_json::Value> {
        let bytes = to_bytes(response.into_body(), usize::MAX).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    #[test]
    fn config_defaults_match_documented_values() {
        let config = GateConfig::new();
        assert_eq!(config.csrf_ttl_seconds(), 86400);
        assert_eq!(config.stepup_window_seconds(), 300);
        assert!(config.audit_url().is_none());
    }

    #[test]
    fn config_builder_overrides() -> Result<()> {
        let url = Url::parse("https://audit.internal/v1/events")?;
        let config = GateConfig::new()
            .with_csrf_ttl_seconds(600)
            .with_stepup_window_seconds(120)
            .with_audit_url(Some(url.clone()));
        assert_eq!(config.csrf_ttl_seconds(), 600);
        assert_eq!(config.stepup_window_seconds(), 120);
        assert_eq!(config.audit_url(), Some(&url));
        Ok(())
    }

    #[test]
    fn safe_methods_and_machine_surfaces_are_exempt() {
        assert!(is_csrf_exempt(&Method::GET, "/v1/stepup/evaluate"));
        assert!(is_csrf_exempt(&Method::HEAD, "/health"));
        assert!(is_csrf_exempt(&Method::OPTIONS, "/health"));
        assert!(is_csrf_exempt(&Method::POST, "/v1/csrf/token"));
        assert!(is_csrf_exempt(&Method::POST, "/v1/reputation/violations"));
        assert!(is_csrf_exempt(&Method::POST, "/v1/breach/reports"));

        assert!(!is_csrf_exempt(&Method::POST, "/v1/stepup/evaluate"));
        assert!(!is_csrf_exempt(&Method::DELETE, "/v1/csrf/token"));
        assert!(!is_csrf_exempt(&Method::PUT, "/v1/anything"));
    }

    #[test]
    fn principal_requires_a_uuid() {
        let mut headers = HeaderMap::new();
        assert_eq!(principal(&headers), None);

        headers.insert(AUTH_USER_HEADER, HeaderValue::from_static("not-a-uuid"));
        assert_eq!(principal(&headers), None);

        let user_id = Uuid::new_v4();
        let value = HeaderValue::from_str(&user_id.to_string()).ok();
        if let Some(value) = value {
            headers.insert(AUTH_USER_HEADER, value);
        }
        assert_eq!(principal(&headers), Some(user_id));
    }

    #[test]
    fn header_token_rejects_empty_values() {
        let mut headers = HeaderMap::new();
        assert_eq!(header_token(&headers), None);

        headers.insert(CSRF_HEADER_NAME, HeaderValue::from_static("  "));
        assert_eq!(header_token(&headers), None);

        headers.insert(CSRF_HEADER_NAME, HeaderValue::from_static("deadbeef"));
        assert_eq!(header_token(&headers), Some("deadbeef".to_string()));
    }

    #[tokio::test]
    async fn block_rejection_carries_blocked_until() -> Result<()> {
        let until = Utc::now() + Duration::minutes(30);
        let error = GateError::RateLimitBlock(BlockStatus {
            blocked: true,
            reason: Some("rate_abuse violation threshold exceeded".to_string()),
            blocked_until: Some(until),
            is_permanent: false,
        });

        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let body = body_json(response).await?;
        assert_eq!(body["reason"], "ip_blocked");
        assert_eq!(body["blockedUntil"], until.to_rfc3339());
        Ok(())
    }

    #[tokio::test]
    async fn permanent_block_rejection_says_permanent() -> Result<()> {
        let error = GateError::RateLimitBlock(BlockStatus {
            blocked: true,
            reason: Some("manual ban".to_string()),
            blocked_until: None,
            is_permanent: true,
        });

        let body = body_json(error.into_response()).await?;
        assert_eq!(body["blockedUntil"], "permanent");
        Ok(())
    }

    #[tokio::test]
    async fn integrity_rejection_names_csrf() -> Result<()> {
        let response = GateError::IntegrityFailure("missing CSRF cookie").into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let body = body_json(response).await?;
        assert_eq!(body["reason"], "csrf");
        assert_eq!(body["message"], "missing CSRF cookie");
        Ok(())
    }

    #[tokio::test]
    async fn unknown_ip_passes_the_reputation_gate() -> Result<()> {
        let app = gated_app(test_gate(MemoryViolationStore::default()));

        // No forwarding headers at all: the caller is unknown, not blocked.
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method(Method::GET)
                    .uri("/v1/widgets")
                    .body(Body::empty())?,
            )
            .await?;

        assert_eq!(response.status(), StatusCode::OK);
        Ok(())
    }

    #[tokio::test]
    async fn blocked_ip_is_rejected_with_blocked_until() -> Result<()> {
        let until = Utc::now() + Duration::minutes(45);
        let violations = MemoryViolationStore::default();
        violations
            .upsert_block(IpBlock {
                ip_address: "1.2.3.4".to_string(),
                reason: "brute_force violation threshold exceeded".to_string(),
                blocked_until: Some(until),
                is_permanent: false,
            })
            .await?;

        let app = gated_app(test_gate(violations));
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method(Method::GET)
                    .uri("/v1/widgets")
                    .header("x-forwarded-for", "1.2.3.4")
                    .body(Body::empty())?,
            )
            .await?;

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body = body_json(response).await?;
        assert_eq!(body["reason"], "ip_blocked");
        assert_eq!(body["blockedUntil"], until.to_rfc3339());
        Ok(())
    }

    #[tokio::test]
    async fn blocked_ip_rejection_does_not_leak_csrf_state() -> Result<()> {
        let violations = MemoryViolationStore::default();
        violations
            .upsert_block(IpBlock {
                ip_address: "5.6.7.8".to_string(),
                reason: "manual ban".to_string(),
                blocked_until: None,
                is_permanent: true,
            })
            .await?;

        // A mutating request with no CSRF material at all: the block must
        // answer first, without hinting that a cookie was also missing.
        let app = gated_app(test_gate(violations));
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method(Method::POST)
                    .uri("/v1/widgets")
                    .header("x-forwarded-for", "5.6.7.8")
                    .body(Body::empty())?,
            )
            .await?;

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body = body_json(response).await?;
        assert_eq!(body["reason"], "ip_blocked");
        assert_eq!(body["blockedUntil"], "permanent");
        Ok(())
    }

    #[tokio::test]
    async fn mutating_request_without_cookie_is_rejected() -> Result<()> {
        let app = gated_app(test_gate(MemoryViolationStore::default()));
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method(Method::POST)
                    .uri("/v1/widgets")
                    .header("x-forwarded-for", "9.9.9.9")
                    .header(AUTH_USER_HEADER, Uuid::new_v4().to_string())
                    .body(Body::empty())?,
            )
            .await?;

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body = body_json(response).await?;
        assert_eq!(body["reason"], "csrf");
        assert_eq!(body["message"], "missing CSRF cookie");
        Ok(())
    }

    #[tokio::test]
    async fn valid_double_submit_pair_passes_both_gates() -> Result<()> {
        let gate = test_gate(MemoryViolationStore::default());
        let user_id = Uuid::new_v4();
        let issued = gate.vault.issue(user_id, Utc::now()).await?;

        let app = gated_app(gate);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method(Method::POST)
                    .uri("/v1/widgets")
                    .header("x-forwarded-for", "9.9.9.9")
                    .header(AUTH_USER_HEADER, user_id.to_string())
                    .header("cookie", format!("csrf_token={}", issued.token))
                    .header(CSRF_HEADER_NAME, issued.token.clone())
                    .body(Body::empty())?,
            )
            .await?;

        assert_eq!(response.status(), StatusCode::OK);
        Ok(())
    }

    #[tokio::test]
    async fn machine_reporting_surfaces_skip_the_csrf_gate() -> Result<()> {
        // Sibling services post reports without a cookie jar; only the
        // reputation gate applies to them.
        let app = gated(
            Router::new()
                .route("/v1/reputation/violations", post(|| async { "recorded" }))
                .route("/v1/breach/reports", post(|| async { "classified" })),
            test_gate(MemoryViolationStore::default()),
        );

        for path in ["/v1/reputation/violations", "/v1/breach/reports"] {
            let response = app
                .clone()
                .oneshot(
                    axum::http::Request::builder()
                        .method(Method::POST)
                        .uri(path)
                        .header("x-forwarded-for", "10.0.0.1")
                        .body(Body::empty())?,
                )
                .await?;
            assert_eq!(response.status(), StatusCode::OK, "{path}");
        }
        Ok(())
    }

    #[tokio::test]
    async fn escalated_block_is_enforced_end_to_end() -> Result<()> {
        let gate = test_gate(MemoryViolationStore::default());
        let limits = ViolationLimits {
            threshold: 2,
            ..ViolationLimits::default()
        };
        let now = Utc::now();
        gate.reputation
            .record_violation("7.7.7.7", "credential_stuffing", limits, now)
            .await?;
        gate.reputation
            .record_violation("7.7.7.7", "credential_stuffing", limits, now)
            .await?;

        let app = gated_app(gate);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method(Method::GET)
                    .uri("/v1/widgets")
                    .header("x-real-ip", "7.7.7.7")
                    .body(Body::empty())?,
            )
            .await?;

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        Ok(())
    }
}
