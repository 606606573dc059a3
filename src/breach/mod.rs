//! Breached-password classification and audit trail.
//!
//! The external auth provider performs the actual breach-corpus lookup; all
//! guardia sees is an opaque error. Classification is a best-effort substring
//! match over an ordered pattern table, conservative against false positives:
//! an unrecognized breach error degrades silently to "not a breach".

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::events::{SecurityEvent, SecurityEventSink, Severity};

/// Opaque error surfaced by the external auth provider.
#[derive(Clone, Debug, Default)]
pub struct AuthProviderError {
    pub message: String,
    pub code: Option<String>,
}

impl AuthProviderError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

/// Where in the password lifecycle the provider error was observed.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum BreachContext {
    Signup,
    PasswordChange,
    FirstLogin,
}

impl BreachContext {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Signup => "signup",
            Self::PasswordChange => "password_change",
            Self::FirstLogin => "first_login",
        }
    }
}

/// Ordered pattern table: first match wins. Multi-word patterns come first so
/// the classification is as specific as the provider message allows.
const BREACH_PATTERNS: &[(&str, &str)] = &[
    ("password_breach", "breached_password"),
    ("weak_password", "weak_password"),
    ("breach", "breached_password"),
    ("compromised", "breached_password"),
    ("pwned", "breached_password"),
    ("exposed", "breached_password"),
];

/// Classifies auth-provider errors and emits audit events for rejections.
pub struct BreachGuard {
    sink: Arc<dyn SecurityEventSink>,
}

impl BreachGuard {
    #[must_use]
    pub fn new(sink: Arc<dyn SecurityEventSink>) -> Self {
        Self { sink }
    }

    /// Match the error's message and code against the pattern table.
    #[must_use]
    pub fn classify(&self, error: &AuthProviderError) -> Option<&'static str> {
        let message = error.message.to_lowercase();
        let code = error.code.as_deref().unwrap_or("").to_lowercase();

        BREACH_PATTERNS
            .iter()
            .find(|(pattern, _)| message.contains(pattern) || code.contains(pattern))
            .map(|&(_, classification)| classification)
    }

    /// True if the error looks like a breached-password rejection.
    #[must_use]
    pub fn is_breach_error(&self, error: &AuthProviderError) -> bool {
        self.classify(error).is_some()
    }

    /// Record that a password was rejected because it appeared in a breach.
    ///
    /// Sink failures never reach the caller; the password flow must not
    /// depend on the audit pipe.
    pub fn log_breach_event(
        &self,
        context: BreachContext,
        email: Option<&str>,
        user_id: Option<Uuid>,
        user_agent: Option<&str>,
    ) {
        self.sink.emit(SecurityEvent {
            event_type: "breached_password_rejected".to_string(),
            severity: Severity::Warning,
            event_data: json!({
                "context": context.as_str(),
                "email": email,
                "user_agent": user_agent,
                "blocked": true,
            }),
            user_id,
            blocked: true,
        });
    }

    /// Record that a previously rejected user chose a clean password.
    pub fn log_breach_resolution(
        &self,
        context: BreachContext,
        email: Option<&str>,
        user_id: Option<Uuid>,
        user_agent: Option<&str>,
    ) {
        self.sink.emit(SecurityEvent {
            event_type: "breached_password_resolved".to_string(),
            severity: Severity::Info,
            event_data: json!({
                "context": context.as_str(),
                "email": email,
                "user_agent": user_agent,
                "blocked": false,
            }),
            user_id,
            blocked: false,
        });
    }
}
