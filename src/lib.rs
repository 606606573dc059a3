//! # Guardia (Step-Up Authentication & Request-Integrity Gate)
//!
//! `guardia` sits in front of a multi-tenant application and decides, per
//! request, how much proof the caller owes before a sensitive action is
//! allowed to proceed.
//!
//! ## Gate ordering
//!
//! Every inbound request passes the checks in a fixed order, cheapest and
//! most universal first:
//!
//! 1. **IP reputation** — blocked IPs are rejected with `403` before any
//!    other check runs, so nothing gated behind later checks can leak.
//! 2. **CSRF double-submit** — state-changing methods must present the same
//!    token in the `csrf_token` cookie and the `x-csrf-token` header.
//! 3. **Step-up policy** — sensitive actions consult the tenant security
//!    policy and the session's last second-factor verification time; the
//!    caller is allowed through, challenged, or hard-failed into enrollment.
//!
//! ## Failure posture
//!
//! Authorization decisions fail closed: any ambiguity (store error, missing
//! record, expired token) is a denial. Telemetry fails open: a broken audit
//! sink is logged locally and never blocks a legitimate user action.
//!
//! ## State ownership
//!
//! Sessions belong to the external auth provider; guardia reads them from
//! the `profiles` collection and only ever writes `last_mfa_verified_at`
//! after a successful challenge. Pending challenge continuations are
//! durable rows keyed by user (at most one outstanding each), so any
//! instance can resume them after verification.

pub mod api;
pub mod breach;
pub mod cli;
pub mod csrf;
pub mod events;
pub mod gate;
pub mod reputation;
pub mod stepup;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);
