//! Step-up policy evaluation and pending-challenge state.
//!
//! Flow overview:
//! 1) Sensitive call sites evaluate the session against the tenant policy.
//! 2) `Allow` proceeds, `DenyHardFail` sends the user to enrollment, and
//!    `RequireChallenge` parks a continuation descriptor and presents a
//!    challenge.
//! 3) The external second-factor verifier reports success; the engine
//!    persists the verification time and hands the parked continuation back
//!    to the caller for resumption.
//!
//! Security boundaries:
//! - A super admin without TOTP enrollment is never allowed through,
//!   regardless of tenant policy or elapsed time.
//! - Continuations are durable data (an action kind plus parameters), not
//!   closures: any instance behind a load balancer can resume them, and a
//!   keyed upsert enforces at most one pending challenge per user.

pub mod storage;

use std::future::Future;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Window applied when the tenant policy does not set one.
pub const DEFAULT_STEPUP_WINDOW_SECONDS: i64 = 300;

/// Pending challenges older than this are not resumed.
pub const PENDING_TTL_SECONDS: i64 = 10 * 60;

/// Role carried by a session, as stored in the `profiles` collection.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Owner,
    Admin,
    Finance,
    Member,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Admin => "admin",
            Self::Finance => "finance",
            Self::Member => "member",
        }
    }

    /// Parse a stored role. Unknown values map to `Member`: an unrecognized
    /// role never grants an MFA exemption it would not otherwise have, and
    /// never imposes owner/finance requirements it was not assigned.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "owner" => Self::Owner,
            "admin" => Self::Admin,
            "finance" => Self::Finance,
            _ => Self::Member,
        }
    }
}

/// Session snapshot read from the auth provider's `profiles` collection.
///
/// Guardia only ever writes `last_mfa_verified_at` back, and only after a
/// successful challenge.
#[derive(Clone, Debug)]
pub struct Session {
    pub user_id: Uuid,
    pub role: Role,
    pub tenant_id: Option<Uuid>,
    pub is_super_admin: bool,
    pub totp_enabled: bool,
    pub last_mfa_verified_at: Option<DateTime<Utc>>,
}

/// Per-tenant step-up requirements, mutated by tenant admins elsewhere.
#[derive(Clone, Debug)]
pub struct TenantSecurityPolicy {
    pub tenant_id: Uuid,
    pub require_mfa_for_owner: bool,
    pub require_mfa_for_finance: bool,
    pub stepup_window_seconds: i64,
}

/// Outcome of a policy evaluation.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Allow,
    DenyHardFail,
    RequireChallenge,
}

/// How a required challenge should be presented to the user.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeMode {
    Inline,
    Redirect,
}

impl ChallengeMode {
    /// Full-page flows carry a `return_to` continuation target and get a
    /// redirect; interactive call sites without one get an inline modal.
    #[must_use]
    pub fn for_navigation(return_to: Option<&str>) -> Self {
        if return_to.is_some() {
            Self::Redirect
        } else {
            Self::Inline
        }
    }
}

/// Durable continuation for an action deferred behind a challenge.
///
/// This is data, not a closure: `action_kind` names the operation and
/// `action_params` carries its arguments, so any instance can resume it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct PendingChallenge {
    pub user_id: Uuid,
    pub action_kind: String,
    pub action_params: serde_json::Value,
    pub opened_at: DateTime<Utc>,
}

/// Result of the interactive `challenge` entry point.
#[derive(Debug, Eq, PartialEq)]
pub enum ChallengeOutcome {
    /// Policy allowed the action; the caller runs it now.
    Executed,
    /// A challenge is required; the continuation is parked until completion.
    Pending(ChallengeMode),
    /// Hard failure; nothing was stored, the caller must enroll.
    Denied,
}

/// Durable storage for pending challenge continuations.
///
/// `upsert` must be keyed by user so a new challenge replaces the previous
/// one atomically (at most one outstanding per user).
pub trait PendingStore: Send + Sync {
    fn upsert(&self, pending: PendingChallenge) -> impl Future<Output = Result<()>> + Send;
    fn take(&self, user_id: Uuid) -> impl Future<Output = Result<Option<PendingChallenge>>> + Send;
    fn exists(&self, user_id: Uuid) -> impl Future<Output = Result<bool>> + Send;
}

/// Policy-driven re-verification gate.
///
/// Evaluation is pure; pending continuations live in the store behind
/// `PendingStore`.
pub struct StepUpPolicyEngine<S> {
    default_window_seconds: i64,
    pending: S,
}

impl<S: PendingStore> StepUpPolicyEngine<S> {
    #[must_use]
    pub fn new(default_window_seconds: i64, pending: S) -> Self {
        Self {
            default_window_seconds,
            pending,
        }
    }

    /// Decide whether a fresh second-factor proof is required.
    #[must_use]
    pub fn evaluate(
        &self,
        session: &Session,
        policy: Option<&TenantSecurityPolicy>,
        now: DateTime<Utc>,
    ) -> Decision {
        // Super admins without MFA are redirected to enroll, never challenged.
        if session.is_super_admin && !session.totp_enabled {
            return Decision::DenyHardFail;
        }

        let mfa_required = session.is_super_admin
            || policy.is_some_and(|policy| match session.role {
                Role::Owner => policy.require_mfa_for_owner,
                Role::Finance => policy.require_mfa_for_finance,
                Role::Admin | Role::Member => false,
            });

        if !mfa_required {
            return Decision::Allow;
        }

        if !session.totp_enabled {
            return Decision::DenyHardFail;
        }

        let window = policy.map_or(self.default_window_seconds, |policy| {
            policy.stepup_window_seconds
        });

        match session.last_mfa_verified_at {
            None => Decision::RequireChallenge,
            Some(verified_at) => {
                let elapsed = now.signed_duration_since(verified_at).num_seconds();
                if elapsed >= window {
                    Decision::RequireChallenge
                } else {
                    Decision::Allow
                }
            }
        }
    }

    /// Interactive entry point: let the action run now, park its
    /// continuation behind a challenge, or refuse it outright.
    ///
    /// On `Pending`, any previously parked continuation for the same user is
    /// replaced through the store's keyed upsert.
    ///
    /// # Errors
    /// Returns an error if the store rejects the upsert; the caller treats
    /// that as a denial.
    pub async fn challenge(
        &self,
        session: &Session,
        policy: Option<&TenantSecurityPolicy>,
        now: DateTime<Utc>,
        mode: ChallengeMode,
        action_kind: &str,
        action_params: serde_json::Value,
    ) -> Result<ChallengeOutcome> {
        match self.evaluate(session, policy, now) {
            Decision::Allow => Ok(ChallengeOutcome::Executed),
            Decision::RequireChallenge => {
                self.pending
                    .upsert(PendingChallenge {
                        user_id: session.user_id,
                        action_kind: action_kind.to_string(),
                        action_params,
                        opened_at: now,
                    })
                    .await?;
                Ok(ChallengeOutcome::Pending(mode))
            }
            Decision::DenyHardFail => Ok(ChallengeOutcome::Denied),
        }
    }

    /// Hand back the pending continuation after the external verifier
    /// succeeded.
    ///
    /// The caller is responsible for persisting `last_mfa_verified_at`
    /// *before* calling this. The continuation is removed from the store
    /// either way; one that sat longer than the TTL is dropped, not resumed.
    ///
    /// # Errors
    /// Returns an error if the store lookup fails.
    pub async fn complete(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<PendingChallenge>> {
        let pending = self.pending.take(user_id).await?;
        Ok(pending
            .filter(|pending| now - pending.opened_at < Duration::seconds(PENDING_TTL_SECONDS)))
    }

    /// True if a challenge is outstanding for the user.
    ///
    /// # Errors
    /// Returns an error if the store lookup fails.
    pub async fn has_pending(&self, user_id: Uuid) -> Result<bool> {
        self.pending.exists(user_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex;

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

    fn session(role: Role) -> Session {
        Session {
            user_id: Uuid::new_v4(),
            role,
            tenant_id: Some(Uuid::new_v4()),
            is_super_admin: false,
            totp_enabled: true,
            last_mfa_verified_at: None,
        }
    }

    fn policy(owner: bool, finance: bool, window: i64) -> TenantSecurityPolicy {
        TenantSecurityPolicy {
            tenant_id: Uuid::new_v4(),
            require_mfa_for_owner: owner,
            require_mfa_for_finance: finance,
            stepup_window_seconds: window,
        }
    }

    fn engine() -> StepUpPolicyEngine<MemoryPendingStore> {
        StepUpPolicyEngine::new(DEFAULT_STEPUP_WINDOW_SECONDS, MemoryPendingStore::default())
    }

    #[test]
    fn super_admin_without_totp_always_hard_fails() {
        let engine = engine();
        let now = Utc::now();
        let mut session = session(Role::Member);
        session.is_super_admin = true;
        session.totp_enabled = false;
        // Even a fresh verification cannot rescue an unenrolled super admin.
        session.last_mfa_verified_at = Some(now);

        let policy = policy(false, false, 300);
        assert_eq!(
            engine.evaluate(&session, Some(&policy), now),
            Decision::DenyHardFail
        );
        assert_eq!(engine.evaluate(&session, None, now), Decision::DenyHardFail);
    }

    #[test]
    fn role_without_policy_requirement_is_allowed() {
        let engine = engine();
        let now = Utc::now();
        let session = session(Role::Member);
        let policy = policy(true, true, 300);
        assert_eq!(engine.evaluate(&session, Some(&policy), now), Decision::Allow);
    }

    #[test]
    fn missing_policy_means_no_requirement() {
        let engine = engine();
        let now = Utc::now();
        let session = session(Role::Owner);
        assert_eq!(engine.evaluate(&session, None, now), Decision::Allow);
    }

    #[test]
    fn required_role_without_totp_hard_fails() {
        let engine = engine();
        let now = Utc::now();
        let mut session = session(Role::Owner);
        session.totp_enabled = false;
        let policy = policy(true, false, 300);
        assert_eq!(
            engine.evaluate(&session, Some(&policy), now),
            Decision::DenyHardFail
        );
    }

    #[test]
    fn never_verified_requires_challenge() {
        let engine = engine();
        let now = Utc::now();
        let session = session(Role::Finance);
        let policy = policy(false, true, 300);
        assert_eq!(
            engine.evaluate(&session, Some(&policy), now),
            Decision::RequireChallenge
        );
    }

    #[test]
    fn window_boundary_is_inclusive_on_expiry() {
        let engine = engine();
        let now = Utc::now();
        let policy = policy(true, false, 300);

        let mut session = session(Role::Owner);
        session.last_mfa_verified_at = Some(now - ChronoDuration::seconds(299));
        assert_eq!(engine.evaluate(&session, Some(&policy), now), Decision::Allow);

        session.last_mfa_verified_at = Some(now - ChronoDuration::seconds(300));
        assert_eq!(
            engine.evaluate(&session, Some(&policy), now),
            Decision::RequireChallenge
        );

        session.last_mfa_verified_at = Some(now - ChronoDuration::seconds(301));
        assert_eq!(
            engine.evaluate(&session, Some(&policy), now),
            Decision::RequireChallenge
        );
    }

    #[test]
    fn super_admin_with_totp_uses_default_window_without_policy() {
        let engine = engine();
        let now = Utc::now();
        let mut session = session(Role::Member);
        session.is_super_admin = true;
        session.last_mfa_verified_at = Some(now - ChronoDuration::seconds(100));
        assert_eq!(engine.evaluate(&session, None, now), Decision::Allow);

        session.last_mfa_verified_at = Some(now - ChronoDuration::seconds(400));
        assert_eq!(engine.evaluate(&session, None, now), Decision::RequireChallenge);
    }

    #[test]
    fn role_parse_maps_unknown_to_member() {
        assert_eq!(Role::parse("owner"), Role::Owner);
        assert_eq!(Role::parse(" finance "), Role::Finance);
        assert_eq!(Role::parse("intern"), Role::Member);
        assert_eq!(Role::parse(""), Role::Member);
    }

    #[test]
    fn challenge_mode_follows_navigation_kind() {
        assert_eq!(
            ChallengeMode::for_navigation(Some("/billing")),
            ChallengeMode::Redirect
        );
        assert_eq!(ChallengeMode::for_navigation(None), ChallengeMode::Inline);
    }

    #[tokio::test]
    async fn challenge_executes_immediately_when_allowed() -> Result<()> {
        let engine = engine();
        let now = Utc::now();
        let session = session(Role::Member);

        let outcome = engine
            .challenge(
                &session,
                None,
                now,
                ChallengeMode::Inline,
                "payout.create",
                json!({"amount": 100}),
            )
            .await?;

        assert_eq!(outcome, ChallengeOutcome::Executed);
        assert!(!engine.has_pending(session.user_id).await?);
        Ok(())
    }

    #[tokio::test]
    async fn denied_challenge_never_stores_the_continuation() -> Result<()> {
        let engine = engine();
        let now = Utc::now();
        let mut session = session(Role::Owner);
        session.totp_enabled = false;
        let policy = policy(true, false, 300);

        let outcome = engine
            .challenge(
                &session,
                Some(&policy),
                now,
                ChallengeMode::Redirect,
                "payout.create",
                json!({}),
            )
            .await?;

        assert_eq!(outcome, ChallengeOutcome::Denied);
        assert!(!engine.has_pending(session.user_id).await?);
        Ok(())
    }

    #[tokio::test]
    async fn pending_challenge_resumes_on_completion() -> Result<()> {
        let engine = engine();
        let now = Utc::now();
        let session = session(Role::Owner);
        let policy = policy(true, false, 300);

        let outcome = engine
            .challenge(
                &session,
                Some(&policy),
                now,
                ChallengeMode::Inline,
                "payout.create",
                json!({"amount": 100}),
            )
            .await?;
        assert_eq!(outcome, ChallengeOutcome::Pending(ChallengeMode::Inline));

        let resumed = engine.complete(session.user_id, now).await?;
        let Some(resumed) = resumed else {
            anyhow::bail!("expected a pending continuation");
        };
        assert_eq!(resumed.action_kind, "payout.create");
        assert_eq!(resumed.action_params, json!({"amount": 100}));

        // The continuation is discarded after it is taken once.
        assert!(engine.complete(session.user_id, now).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn new_challenge_replaces_previous_pending_continuation() -> Result<()> {
        let engine = engine();
        let now = Utc::now();
        let session = session(Role::Owner);
        let policy = policy(true, false, 300);

        engine
            .challenge(
                &session,
                Some(&policy),
                now,
                ChallengeMode::Inline,
                "payout.create",
                json!({"amount": 100}),
            )
            .await?;
        engine
            .challenge(
                &session,
                Some(&policy),
                now,
                ChallengeMode::Inline,
                "tenant.delete",
                json!({}),
            )
            .await?;

        let resumed = engine.complete(session.user_id, now).await?;
        assert_eq!(
            resumed.map(|pending| pending.action_kind),
            Some("tenant.delete".to_string())
        );
        Ok(())
    }

    #[tokio::test]
    async fn stale_continuation_is_dropped_not_resumed() -> Result<()> {
        let engine = engine();
        let t0 = Utc::now();
        let session = session(Role::Owner);
        let policy = policy(true, false, 300);

        engine
            .challenge(
                &session,
                Some(&policy),
                t0,
                ChallengeMode::Inline,
                "payout.create",
                json!({}),
            )
            .await?;

        let late = t0 + ChronoDuration::seconds(PENDING_TTL_SECONDS + 1);
        assert!(engine.complete(session.user_id, late).await?.is_none());
        // Taken, even though it was too old to resume.
        assert!(!engine.has_pending(session.user_id).await?);
        Ok(())
    }

    #[tokio::test]
    async fn end_to_end_window_scenario() -> Result<()> {
        let engine = engine();
        let t0 = Utc::now();
        let policy = policy(true, false, 300);
        let mut session = session(Role::Owner);
        session.last_mfa_verified_at = None;

        assert_eq!(
            engine.evaluate(&session, Some(&policy), t0),
            Decision::RequireChallenge
        );

        // Challenge completes at t0; the verifier persists the timestamp.
        session.last_mfa_verified_at = Some(t0);

        assert_eq!(
            engine.evaluate(&session, Some(&policy), t0 + ChronoDuration::seconds(299)),
            Decision::Allow
        );
        assert_eq!(
            engine.evaluate(&session, Some(&policy), t0 + ChronoDuration::seconds(301)),
            Decision::RequireChallenge
        );
        Ok(())
    }
}
