// SPDX-License-Identifier: MIT

//! Device records and fingerprint derivation.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A device known to have signed in for a user.
///
/// Keyed in the `devices` collection by `{user_id}_{fingerprint}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub user_id: String,
    pub fingerprint: String,
    /// Short human label derived from the user agent, for account pages
    pub label: Option<String>,
    pub first_seen: String,
    pub last_seen: String,
}

/// Derive a device fingerprint from client signals.
///
/// This is a best-effort heuristic key, not a cryptographic identity:
/// it recognizes returning devices well enough to drive new-device
/// warnings and nothing more.
pub fn fingerprint_from_signals(user_agent: &str, accept_language: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(user_agent.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(accept_language.as_bytes());
    let digest = hasher.finalize();
    // 16 bytes of the digest is plenty for a heuristic key
    hex::encode(&digest[..16])
}

/// A coarse device label from the user agent, e.g. "iPhone" or "Mac".
pub fn label_from_user_agent(user_agent: &str) -> Option<String> {
    const KNOWN: &[&str] = &[
        "iPhone", "iPad", "Android", "Macintosh", "Windows", "Linux",
    ];
    KNOWN
        .iter()
        .find(|k| user_agent.contains(**k))
        .map(|k| match *k {
            "Macintosh" => "Mac".to_string(),
            other => other.to_string(),
        })
}
