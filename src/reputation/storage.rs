//! Postgres-backed violation counters and IP blocks.
//!
//! The counter increment is a single conditional upsert so that concurrent
//! requests never lose an increment. The CASE inside the upsert resets the
//! counter when the previous window has lapsed.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::Instrument;

use super::{IpBlock, ViolationStore};

/// `ViolationStore` over the `ip_violations` and `ip_blocks` collections.
#[derive(Clone, Debug)]
pub struct PgViolationStore {
    pool: PgPool,
}

impl PgViolationStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl ViolationStore for PgViolationStore {
    async fn increment_violation(
        &self,
        ip: &str,
        violation_type: &str,
        window_minutes: i64,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let query = r"
            INSERT INTO ip_violations (ip_address, violation_type, count, window_started_at)
            VALUES ($1, $2, 1, $3)
            ON CONFLICT (ip_address, violation_type) DO UPDATE
            SET count = CASE
                    WHEN ip_violations.window_started_at <= $3 - $4 * interval '1 minute'
                    THEN 1
                    ELSE ip_violations.count + 1
                END,
                window_started_at = CASE
                    WHEN ip_violations.window_started_at <= $3 - $4 * interval '1 minute'
                    THEN $3
                    ELSE ip_violations.window_started_at
                END
            RETURNING count
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(ip)
            .bind(violation_type)
            .bind(now)
            .bind(window_minutes)
            .fetch_one(&self.pool)
            .instrument(span)
            .await
            .context("failed to record IP violation")?;
        Ok(row.get("count"))
    }

    async fn upsert_block(&self, block: IpBlock) -> Result<()> {
        let query = r"
            INSERT INTO ip_blocks (ip_address, reason, blocked_until, is_permanent)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (ip_address) DO UPDATE
            SET reason = EXCLUDED.reason,
                blocked_until = EXCLUDED.blocked_until,
                is_permanent = EXCLUDED.is_permanent
            WHERE NOT ip_blocks.is_permanent
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        sqlx::query(query)
            .bind(&block.ip_address)
            .bind(&block.reason)
            .bind(block.blocked_until)
            .bind(block.is_permanent)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to upsert IP block")?;
        Ok(())
    }

    async fn find_block(&self, ip: &str) -> Result<Option<IpBlock>> {
        let query = r"
            SELECT ip_address, reason, blocked_until, is_permanent
            FROM ip_blocks
            WHERE ip_address = $1
            LIMIT 1
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(ip)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to look up IP block")?;

        Ok(row.map(|row| IpBlock {
            ip_address: row.get("ip_address"),
            reason: row.get("reason"),
            blocked_until: row.get("blocked_until"),
            is_permanent: row.get("is_permanent"),
        }))
    }
}
