// SPDX-License-Identifier: MIT

//! Session-marker store.
//!
//! Minimal durable-ish state per client session: the pending email for
//! magic-link completion, the device fingerprint, and the last known
//! user id. Nothing else — the full user profile is never cached here.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

/// Pending-email markers lapse after an hour (matches the magic-link TTL).
const PENDING_EMAIL_TTL_SECS: i64 = 3600;

pub mod keys {
    pub const PENDING_EMAIL_FOR_SIGN_IN: &str = "pending_email_for_sign_in";
    pub const DEVICE_FINGERPRINT: &str = "device_fingerprint";
    pub const LAST_KNOWN_USER: &str = "last_known_user";
}

#[derive(Debug, Clone)]
struct Marker {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

/// Per-session marker storage, keyed by (session id, marker key).
#[derive(Default)]
pub struct SessionStore {
    markers: DashMap<(String, &'static str), Marker>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn set(&self, session_id: &str, key: &'static str, value: String, ttl_secs: Option<i64>) {
        self.markers.insert(
            (session_id.to_string(), key),
            Marker {
                value,
                expires_at: ttl_secs.map(|s| Utc::now() + Duration::seconds(s)),
            },
        );
    }

    fn get(&self, session_id: &str, key: &'static str) -> Option<String> {
        let map_key = (session_id.to_string(), key);
        let expired = match self.markers.get(&map_key) {
            Some(marker) => match marker.expires_at {
                Some(at) if Utc::now() >= at => true,
                _ => return Some(marker.value.clone()),
            },
            None => return None,
        };
        if expired {
            self.markers.remove(&map_key);
        }
        None
    }

    fn clear(&self, session_id: &str, key: &'static str) {
        self.markers.remove(&(session_id.to_string(), key));
    }

    // ─── Typed markers ───────────────────────────────────────────

    /// Set before the magic-link send goes over the wire, so completion
    /// survives a browser reload.
    pub fn set_pending_email(&self, session_id: &str, email: &str) {
        self.set(
            session_id,
            keys::PENDING_EMAIL_FOR_SIGN_IN,
            email.to_string(),
            Some(PENDING_EMAIL_TTL_SECS),
        );
    }

    pub fn pending_email(&self, session_id: &str) -> Option<String> {
        self.get(session_id, keys::PENDING_EMAIL_FOR_SIGN_IN)
    }

    pub fn clear_pending_email(&self, session_id: &str) {
        self.clear(session_id, keys::PENDING_EMAIL_FOR_SIGN_IN);
    }

    pub fn set_device_fingerprint(&self, session_id: &str, fingerprint: &str) {
        self.set(
            session_id,
            keys::DEVICE_FINGERPRINT,
            fingerprint.to_string(),
            None,
        );
    }

    pub fn device_fingerprint(&self, session_id: &str) -> Option<String> {
        self.get(session_id, keys::DEVICE_FINGERPRINT)
    }

    pub fn set_last_known_user(&self, session_id: &str, user_id: &str) {
        self.set(session_id, keys::LAST_KNOWN_USER, user_id.to_string(), None);
    }

    pub fn last_known_user(&self, session_id: &str) -> Option<String> {
        self.get(session_id, keys::LAST_KNOWN_USER)
    }

    /// Drop every marker for a session (logout).
    pub fn clear_all(&self, session_id: &str) {
        self.markers.retain(|(sid, _), _| sid != session_id);
    }
}
