//! Postgres-backed CSRF token store.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::Instrument;
use uuid::Uuid;

use super::{CsrfTokenRecord, TokenStore};

/// `TokenStore` over the `csrf_tokens` collection.
#[derive(Clone, Debug)]
pub struct PgTokenStore {
    pool: PgPool,
}

impl PgTokenStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl TokenStore for PgTokenStore {
    async fn insert(&self, record: CsrfTokenRecord) -> Result<()> {
        let query = r"
            INSERT INTO csrf_tokens (token, user_id, issued_at, expires_at)
            VALUES ($1, $2, $3, $4)
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        sqlx::query(query)
            .bind(&record.token)
            .bind(record.user_id)
            .bind(record.issued_at)
            .bind(record.expires_at)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to insert CSRF token")?;
        Ok(())
    }

    async fn find(&self, user_id: Uuid, token: &str) -> Result<Option<CsrfTokenRecord>> {
        let query = r"
            SELECT token, user_id, issued_at, expires_at
            FROM csrf_tokens
            WHERE user_id = $1
              AND token = $2
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
            .bind(token)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to look up CSRF token")?;

        Ok(row.map(|row| CsrfTokenRecord {
            token: row.get("token"),
            user_id: row.get("user_id"),
            issued_at: row.get("issued_at"),
            expires_at: row.get("expires_at"),
        }))
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let query = "DELETE FROM csrf_tokens WHERE expires_at < $1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(now)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to purge expired CSRF tokens")?;
        Ok(result.rows_affected())
    }
}
