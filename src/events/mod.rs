//! Security event emission to an external audit sink.
//!
//! Events are fire-and-forget: delivery runs on a background task and a
//! failed delivery is logged locally, never surfaced to the caller. A broken
//! audit pipe must not block a user-facing flow.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

use crate::APP_USER_AGENT;

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Severity attached to an emitted security event.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

/// Payload posted to the external audit endpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub event_type: String,
    pub severity: Severity,
    pub event_data: serde_json::Value,
    pub user_id: Option<Uuid>,
    pub blocked: bool,
}

/// Destination for security events.
///
/// `emit` must never fail and must never block the caller beyond queueing.
pub trait SecurityEventSink: Send + Sync {
    fn emit(&self, event: SecurityEvent);
}

/// Sink that drops every event. Used when no audit endpoint is configured.
#[derive(Clone, Debug)]
pub struct NoopEventSink;

impl SecurityEventSink for NoopEventSink {
    fn emit(&self, event: SecurityEvent) {
        debug!("Security event dropped (no audit sink): {}", event.event_type);
    }
}

/// Sink that posts events as JSON to an external audit endpoint.
#[derive(Clone, Debug)]
pub struct HttpEventSink {
    client: reqwest::Client,
    endpoint: Url,
}

impl HttpEventSink {
    /// Build a sink for the given audit endpoint.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(endpoint: Url) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(APP_USER_AGENT)
            .timeout(DELIVERY_TIMEOUT)
            .build()
            .context("Failed to build audit sink HTTP client")?;

        Ok(Self { client, endpoint })
    }

    /// Deliver a single event, returning the failure if any.
    ///
    /// # Errors
    /// Returns an error if the request fails or the sink responds with a
    /// non-success status.
    pub async fn deliver(&self, event: &SecurityEvent) -> Result<()> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(event)
            .send()
            .await
            .context("Failed to reach audit sink")?;

        if !response.status().is_success() {
            anyhow::bail!("Audit sink rejected event: {}", response.status());
        }

        Ok(())
    }
}

impl SecurityEventSink for HttpEventSink {
    fn emit(&self, event: SecurityEvent) {
        let sink = self.clone();
        tokio::spawn(async move {
            if let Err(err) = sink.deliver(&event).await {
                warn!("Failed to deliver security event: {err}");
            }
        });
    }
}
