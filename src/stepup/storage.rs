//! Database reads for session and tenant policy snapshots.
//!
//! Both are fetched fresh per call; nothing is cached across requests, so
//! staleness is bounded by each call's own read.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::Instrument;
use uuid::Uuid;

use super::{PendingChallenge, PendingStore, Role, Session, TenantSecurityPolicy,
    DEFAULT_STEPUP_WINDOW_SECONDS};

/// Load the session snapshot for a user from the `profiles` collection.
///
/// # Errors
/// Returns an error if the query fails.
pub async fn load_session(pool: &PgPool, user_id: Uuid) -> Result<Option<Session>> {
    let query = r"
        SELECT user_id, role, tenant_id, is_super_admin, totp_enabled, last_mfa_verified_at
        FROM profiles
        WHERE user_id = $1
        LIMIT 1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(user_id)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to load session profile")?;

    Ok(row.map(|row| {
        let role: String = row.get("role");
        Session {
            user_id: row.get("user_id"),
            role: Role::parse(&role),
            tenant_id: row.get("tenant_id"),
            is_super_admin: row.get("is_super_admin"),
            totp_enabled: row.get("totp_enabled"),
            last_mfa_verified_at: row.get("last_mfa_verified_at"),
        }
    }))
}

/// Load the step-up policy for a tenant, if one was configured.
///
/// A missing `stepup_window_seconds` falls back to the 300-second default.
///
/// # Errors
/// Returns an error if the query fails.
pub async fn load_tenant_policy(
    pool: &PgPool,
    tenant_id: Uuid,
) -> Result<Option<TenantSecurityPolicy>> {
    let query = r"
        SELECT tenant_id, require_mfa_for_owner, require_mfa_for_finance, stepup_window_seconds
        FROM tenant_security_policy
        WHERE tenant_id = $1
        LIMIT 1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(tenant_id)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to load tenant security policy")?;

    Ok(row.map(|row| {
        let window: Option<i64> = row.get("stepup_window_seconds");
        TenantSecurityPolicy {
            tenant_id: row.get("tenant_id"),
            require_mfa_for_owner: row.get("require_mfa_for_owner"),
            require_mfa_for_finance: row.get("require_mfa_for_finance"),
            stepup_window_seconds: window.unwrap_or(DEFAULT_STEPUP_WINDOW_SECONDS),
        }
    }))
}

/// Persist a successful second-factor verification.
///
/// This is the only profile field guardia ever writes.
///
/// # Errors
/// Returns an error if the update fails.
pub async fn mark_mfa_verified(pool: &PgPool, user_id: Uuid, now: DateTime<Utc>) -> Result<()> {
    let query = r"
        UPDATE profiles
        SET last_mfa_verified_at = $2
        WHERE user_id = $1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .bind(now)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to record MFA verification time")?;
    Ok(())
}

/// `PendingStore` over the `pending_stepups` collection.
///
/// The keyed upsert guarantees at most one pending challenge per user, and
/// `take` removes and returns in one statement so two completing requests
/// cannot both resume the same continuation.
#[derive(Clone, Debug)]
pub struct PgPendingStore {
    pool: PgPool,
}

impl PgPendingStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl PendingStore for PgPendingStore {
    async fn upsert(&self, pending: PendingChallenge) -> Result<()> {
        let query = r"
            INSERT INTO pending_stepups (user_id, action_kind, action_params, opened_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (user_id) DO UPDATE
            SET action_kind = EXCLUDED.action_kind,
                action_params = EXCLUDED.action_params,
                opened_at = EXCLUDED.opened_at
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        sqlx::query(query)
            .bind(pending.user_id)
            .bind(&pending.action_kind)
            .bind(&pending.action_params)
            .bind(pending.opened_at)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to park pending challenge")?;
        Ok(())
    }

    async fn take(&self, user_id: Uuid) -> Result<Option<PendingChallenge>> {
        let query = r"
            DELETE FROM pending_stepups
            WHERE user_id = $1
            RETURNING user_id, action_kind, action_params, opened_at
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to take pending challenge")?;

        Ok(row.map(|row| PendingChallenge {
            user_id: row.get("user_id"),
            action_kind: row.get("action_kind"),
            action_params: row.get("action_params"),
            opened_at: row.get("opened_at"),
        }))
    }

    async fn exists(&self, user_id: Uuid) -> Result<bool> {
        let query = "SELECT 1 AS present FROM pending_stepups WHERE user_id = $1 LIMIT 1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to look up pending challenge")?;
        Ok(row.is_some())
    }
}
