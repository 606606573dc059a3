//! Double-submit CSRF token lifecycle.
//!
//! One secret must appear both in the `csrf_token` cookie (origin-bound by
//! the browser) and in an explicit request header the attacker cannot read
//! cross-origin. Validation fails closed: a missing record, an expired row,
//! a mismatched pair, or a store error all deny.
//!
//! The cookie is deliberately *not* `HttpOnly`: the client must read it to
//! mirror the value into the request header.

pub mod storage;

use std::future::Future;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rand::{rngs::OsRng, RngCore};
use tracing::{error, warn};
use uuid::Uuid;

/// Cookie carrying the CSRF secret.
pub const CSRF_COOKIE_NAME: &str = "csrf_token";

/// Header mirroring the cookie value on every mutating call.
pub const CSRF_HEADER_NAME: &str = "x-csrf-token";

/// Token lifetime: 24 hours.
pub const DEFAULT_CSRF_TTL_SECONDS: i64 = 24 * 60 * 60;

/// Stored CSRF token row.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CsrfTokenRecord {
    pub token: String,
    pub user_id: Uuid,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Durable storage for CSRF tokens.
///
/// Expired rows are only ever reaped through `purge_expired` during the next
/// issuance (garbage-collect-on-write); there is no background sweep.
pub trait TokenStore: Send + Sync {
    fn insert(&self, record: CsrfTokenRecord) -> impl Future<Output = Result<()>> + Send;
    fn find(
        &self,
        user_id: Uuid,
        token: &str,
    ) -> impl Future<Output = Result<Option<CsrfTokenRecord>>> + Send;
    fn purge_expired(&self, now: DateTime<Utc>) -> impl Future<Output = Result<u64>> + Send;
}

/// Token returned by `issue`, with the cookie ready to set.
#[derive(Clone, Debug)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub cookie: String,
}

/// Issues, validates, and revokes double-submit CSRF tokens.
pub struct TokenVault<S> {
    store: S,
    ttl_seconds: i64,
}

impl<S: TokenStore> TokenVault<S> {
    #[must_use]
    pub fn new(store: S) -> Self {
        Self {
            store,
            ttl_seconds: DEFAULT_CSRF_TTL_SECONDS,
        }
    }

    #[must_use]
    pub fn with_ttl_seconds(mut self, ttl_seconds: i64) -> Self {
        self.ttl_seconds = ttl_seconds;
        self
    }

    /// Issue a fresh token for the user.
    ///
    /// Multiple live tokens per user are allowed within the TTL (multi-tab
    /// logins); older tokens expire on their own schedule and are purged on
    /// the next issuance.
    ///
    /// # Errors
    /// Returns an error if token generation or the insert fails. A failed
    /// opportunistic purge is logged and does not block issuance.
    pub async fn issue(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<IssuedToken> {
        if let Err(err) = self.store.purge_expired(now).await {
            warn!("Failed to purge expired CSRF tokens: {err}");
        }

        let token = generate_token()?;
        let expires_at = now + Duration::seconds(self.ttl_seconds);
        self.store
            .insert(CsrfTokenRecord {
                token: token.clone(),
                user_id,
                issued_at: now,
                expires_at,
            })
            .await?;

        let cookie = set_cookie(&token, self.ttl_seconds);
        Ok(IssuedToken {
            token,
            expires_at,
            cookie,
        })
    }

    /// Double-submit validation. Fails closed on every path.
    pub async fn validate(
        &self,
        supplied_token: &str,
        cookie_token: &str,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> bool {
        if supplied_token.is_empty() || supplied_token != cookie_token {
            return false;
        }

        match self.store.find(user_id, supplied_token).await {
            Ok(Some(record)) => now < record.expires_at,
            Ok(None) => false,
            Err(err) => {
                error!("Failed to look up CSRF token: {err}");
                false
            }
        }
    }

    /// Cookie that expires the client's token immediately.
    ///
    /// The store is not touched: orphaned rows are reaped lazily by the next
    /// `issue`.
    #[must_use]
    pub fn revoke_cookie(&self) -> String {
        clear_cookie()
    }
}

/// 32 random bytes, hex-encoded to 64 characters.
fn generate_token() -> Result<String> {
    let mut bytes = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to generate CSRF token")?;
    Ok(hex::encode(bytes))
}

fn set_cookie(token: &str, max_age: i64) -> String {
    format!("{CSRF_COOKIE_NAME}={token}; Path=/; SameSite=Strict; Max-Age={max_age}; Secure")
}

fn clear_cookie() -> String {
    format!("{CSRF_COOKIE_NAME}=; Path=/; SameSite=Strict; Max-Age=0; Secure")
}

/// Extract the CSRF cookie value from a `Cookie` request header.
#[must_use]
pub fn extract_cookie_token(headers: &axum::http::HeaderMap) -> Option<String> {
    let header = headers.get(axum::http::header::COOKIE)?;
    let value = header.to_str().ok()?;
    for pair in value.split(';') {
        let trimmed = pair.trim();
        let mut parts = trimmed.splitn(2, '=');
        let key = parts.next()?.trim();
        let val = parts.next()?.trim();
        if key == CSRF_COOKIE_NAME {
            return Some(val.to_string());
        }
    }
    None
}
