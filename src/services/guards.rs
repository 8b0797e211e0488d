// SPDX-License-Identifier: MIT

//! Auth guards: predicate and recording checks consulted around
//! adapter calls.
//!
//! Client-side callers use these for optimistic UI decisions; the
//! server-side rate limiter stays authoritative regardless.

use crate::db::FirestoreDb;
use crate::error::AppError;
use crate::middleware::auth::decode_claims;
use crate::models::device::{fingerprint_from_signals, label_from_user_agent};
use crate::models::{AuthMethod, DeviceInfo, RateLimitAction, RateLimitDecision, User};
use crate::services::rate_limit::RateLimiter;
use crate::time_utils::format_utc_rfc3339;
use chrono::Utc;
use std::sync::Arc;

/// A detected account-linking collision.
#[derive(Debug, Clone)]
pub struct LinkingConflict {
    pub method: AuthMethod,
    pub existing_user_id: String,
}

impl LinkingConflict {
    /// Short, non-blaming message for the UI.
    pub fn message(&self) -> String {
        format!(
            "That {} account is already connected to a different FocusFlow account. \
             Sign in with it first if you'd like to merge things.",
            self.method.as_str()
        )
    }
}

pub struct Guards {
    db: FirestoreDb,
    limiter: Arc<RateLimiter>,
}

impl Guards {
    pub fn new(db: FirestoreDb, limiter: Arc<RateLimiter>) -> Self {
        Self { db, limiter }
    }

    /// Brute-force check: thin wrapper over the rate limiter. The
    /// decision carries the remaining block time when denied.
    pub async fn check_brute_force(
        &self,
        action: RateLimitAction,
        identifier: &str,
    ) -> RateLimitDecision {
        self.limiter
            .check_and_record_attempt(action, identifier)
            .await
    }

    // ─── Device checks ───────────────────────────────────────────
    //
    // Device recognition is a heuristic; a store failure degrades to
    // "unknown device" rather than blocking sign-in.

    pub async fn is_known_device(&self, user_id: &str, fingerprint: &str) -> bool {
        match self.db.get_device(user_id, fingerprint).await {
            Ok(device) => device.is_some(),
            Err(e) => {
                tracing::warn!(error = %e, "Device lookup failed, treating as unknown");
                false
            }
        }
    }

    /// Record (or refresh) a device in the user's known-device set.
    pub async fn register_device(
        &self,
        user_id: &str,
        fingerprint: &str,
        user_agent: &str,
    ) -> Result<(), AppError> {
        let now = format_utc_rfc3339(Utc::now());
        let device = match self.db.get_device(user_id, fingerprint).await? {
            Some(mut existing) => {
                existing.last_seen = now;
                existing
            }
            None => DeviceInfo {
                user_id: user_id.to_string(),
                fingerprint: fingerprint.to_string(),
                label: label_from_user_agent(user_agent),
                first_seen: now.clone(),
                last_seen: now,
            },
        };
        self.db.upsert_device(&device).await
    }

    /// Warn only when the device is unknown AND the user has logged in
    /// before. A first-ever login never warns.
    pub async fn should_warn_new_device(&self, user: &User, fingerprint: &str) -> bool {
        if self.is_known_device(&user.id, fingerprint).await {
            return false;
        }
        let first_login = user.created_at == user.last_login_at;
        let has_devices = match self.db.list_devices(&user.id).await {
            Ok(devices) => !devices.is_empty(),
            Err(_) => false,
        };
        !first_login && has_devices
    }

    /// Fingerprint the calling device from request signals.
    pub fn device_fingerprint(&self, user_agent: &str, accept_language: &str) -> String {
        fingerprint_from_signals(user_agent, accept_language)
    }

    // ─── Session checks ──────────────────────────────────────────

    /// Offline token check: structure and expiry only, no network. A
    /// malformed or expired token means "no session", not an error.
    pub fn validate_session(&self, token: &str, signing_key: &[u8]) -> Option<String> {
        decode_claims(token, signing_key).map(|claims| claims.sub)
    }

    // ─── Linking conflicts ───────────────────────────────────────

    /// Non-null when the new method's identifier already belongs to a
    /// different user.
    ///
    /// This is a pre-check for a friendlier message; the vendor still
    /// rejects colliding credentials itself, so a store failure here
    /// degrades to "no known conflict" rather than blocking the link.
    pub async fn detect_linking_conflict(
        &self,
        user: &User,
        method: AuthMethod,
        identifier: &str,
    ) -> Option<LinkingConflict> {
        let lookup = match method {
            AuthMethod::Phone => self.db.find_user_by_phone(identifier).await,
            AuthMethod::Email | AuthMethod::Google | AuthMethod::Apple => {
                self.db.find_user_by_email(identifier).await
            }
        };

        let existing = match lookup {
            Ok(existing) => existing,
            Err(e) => {
                tracing::warn!(error = %e, "Conflict lookup failed, deferring to vendor");
                return None;
            }
        };

        existing
            .filter(|other| other.id != user.id)
            .map(|other| LinkingConflict {
                method,
                existing_user_id: other.id,
            })
    }
}
