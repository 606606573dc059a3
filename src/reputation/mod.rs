//! Per-IP violation tracking and escalation to hard blocks.
//!
//! Violations are counted per (ip, violation type) inside a rolling window.
//! When the post-increment count reaches the caller-supplied threshold, the
//! IP is blocked for a caller-supplied duration. Blocking runs before every
//! other check: it is the cheapest, most universal rejection and must not
//! leak anything gated behind CSRF or step-up.
//!
//! Counting tolerates concurrency by design: the increment is a single
//! conditional upsert against the store, never read-modify-write in the
//! handler.

pub mod storage;

use std::future::Future;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use tracing::error;

/// Marker used on the wire for blocks without an expiry.
pub const PERMANENT_BLOCK: &str = "permanent";

/// Caller-supplied escalation limits for one violation type.
///
/// Stricter abuse classes (credential stuffing) pass tighter limits than
/// generic rate abuse.
#[derive(Clone, Copy, Debug)]
pub struct ViolationLimits {
    pub threshold: i64,
    pub window_minutes: i64,
    pub block_minutes: i64,
}

impl Default for ViolationLimits {
    fn default() -> Self {
        Self {
            threshold: 10,
            window_minutes: 60,
            block_minutes: 60,
        }
    }
}

/// Result of recording one violation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ViolationOutcome {
    pub should_block: bool,
    pub violation_count: i64,
}

/// Stored block row.
#[derive(Clone, Debug)]
pub struct IpBlock {
    pub ip_address: String,
    pub reason: String,
    pub blocked_until: Option<DateTime<Utc>>,
    pub is_permanent: bool,
}

/// Answer to the blocking predicate.
#[derive(Clone, Debug, Default)]
pub struct BlockStatus {
    pub blocked: bool,
    pub reason: Option<String>,
    pub blocked_until: Option<DateTime<Utc>>,
    pub is_permanent: bool,
}

impl BlockStatus {
    fn clear() -> Self {
        Self::default()
    }

    /// Wire value for `blockedUntil`: a timestamp, `"permanent"`, or null.
    #[must_use]
    pub fn blocked_until_value(&self) -> serde_json::Value {
        if self.is_permanent {
            serde_json::Value::String(PERMANENT_BLOCK.to_string())
        } else {
            self.blocked_until
                .map_or(serde_json::Value::Null, |until| {
                    serde_json::Value::String(until.to_rfc3339())
                })
        }
    }
}

/// Durable storage for violation counters and blocks.
pub trait ViolationStore: Send + Sync {
    /// Atomically bump the counter for (ip, violation type), resetting it if
    /// the window lapsed, and return the post-increment count.
    fn increment_violation(
        &self,
        ip: &str,
        violation_type: &str,
        window_minutes: i64,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<i64>> + Send;

    /// Insert or refresh a block. Must never downgrade a permanent block.
    fn upsert_block(&self, block: IpBlock) -> impl Future<Output = Result<()>> + Send;

    fn find_block(&self, ip: &str) -> impl Future<Output = Result<Option<IpBlock>>> + Send;
}

/// Violation escalation and blocking predicate.
pub struct ReputationTracker<S> {
    store: S,
}

impl<S: ViolationStore> ReputationTracker<S> {
    #[must_use]
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Blocking predicate. A permanent block dominates any expiry; a store
    /// error denies (fail closed).
    pub async fn is_blocked(&self, ip: &str, now: DateTime<Utc>) -> BlockStatus {
        match self.store.find_block(ip).await {
            Ok(Some(block)) => {
                if block.is_permanent {
                    return BlockStatus {
                        blocked: true,
                        reason: Some(block.reason),
                        blocked_until: block.blocked_until,
                        is_permanent: true,
                    };
                }
                match block.blocked_until {
                    Some(until) if now < until => BlockStatus {
                        blocked: true,
                        reason: Some(block.reason),
                        blocked_until: Some(until),
                        is_permanent: false,
                    },
                    _ => BlockStatus::clear(),
                }
            }
            Ok(None) => BlockStatus::clear(),
            Err(err) => {
                error!("Failed to look up IP block for {ip}: {err}");
                BlockStatus {
                    blocked: true,
                    reason: Some("reputation store unavailable".to_string()),
                    blocked_until: None,
                    is_permanent: false,
                }
            }
        }
    }

    /// Record one violation and escalate to a block when the threshold is
    /// reached within the window.
    ///
    /// # Errors
    /// Returns an error if the store rejects the increment or the block
    /// upsert; callers treat that as a denial.
    pub async fn record_violation(
        &self,
        ip: &str,
        violation_type: &str,
        limits: ViolationLimits,
        now: DateTime<Utc>,
    ) -> Result<ViolationOutcome> {
        let violation_count = self
            .store
            .increment_violation(ip, violation_type, limits.window_minutes, now)
            .await?;

        let should_block = violation_count >= limits.threshold;
        if should_block {
            self.store
                .upsert_block(IpBlock {
                    ip_address: ip.to_string(),
                    reason: format!("{violation_type} violation threshold exceeded"),
                    blocked_until: Some(now + Duration::minutes(limits.block_minutes)),
                    is_permanent: false,
                })
                .await?;
        }

        Ok(ViolationOutcome {
            should_block,
            violation_count,
        })
    }
}

/// Extract the caller IP from forwarding headers.
///
/// `x-forwarded-for` wins (first entry in the chain), then `x-real-ip`.
/// Absent both, the caller is unknown and cannot be fairly blocked.
#[must_use]
pub fn extract_client_ip(headers: &axum::http::HeaderMap) -> Option<String> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    if forwarded.is_some() {
        return forwarded.map(str::to_string);
    }
    headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}
