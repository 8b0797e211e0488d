// SPDX-License-Identifier: MIT

//! Pending verification state and identifier normalization/masking.

use crate::models::AuthMethod;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Ephemeral state for one in-flight OTP or magic-link verification.
///
/// Created when a code or link is sent; destroyed on success, exhaustion,
/// or expiry. A newer verification for the same auth context supersedes
/// any prior one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingVerification {
    pub method: AuthMethod,
    /// Masked phone/email, safe to echo back to the client
    pub masked_identifier: String,
    /// Vendor-issued confirmation handle, required to verify
    pub confirmation_handle: String,
    pub expires_at: DateTime<Utc>,
}

impl PendingVerification {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Normalize a phone number to E.164, or reject it.
///
/// Accepts an optional leading `+`, separators (spaces, dashes, dots,
/// parentheses), and 8-15 digits. Numbers without a leading `+` are
/// rejected: the product never guesses a default country code.
pub fn normalize_phone(input: &str) -> Option<String> {
    let trimmed = input.trim();
    if !trimmed.starts_with('+') {
        return None;
    }

    let digits: String = trimmed
        .chars()
        .skip(1)
        .filter(|c| !matches!(c, ' ' | '-' | '.' | '(' | ')'))
        .collect();

    if digits.len() < 8 || digits.len() > 15 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    // E.164 forbids a leading zero in the country code
    if digits.starts_with('0') {
        return None;
    }

    Some(format!("+{}", digits))
}

/// Mask a phone number for display: keep country code prefix and last
/// two digits.
pub fn mask_phone(phone: &str) -> String {
    let len = phone.chars().count();
    if len <= 5 {
        return "*".repeat(len);
    }
    let prefix: String = phone.chars().take(3).collect();
    let suffix: String = phone.chars().skip(len - 2).collect();
    format!("{}{}{}", prefix, "*".repeat(len - 5), suffix)
}

/// Mask an email for display: first character of the local part plus
/// the full domain.
pub fn mask_email(email: &str) -> String {
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() => {
            let first = local.chars().next().unwrap_or('*');
            format!("{}***@{}", first, domain)
        }
        _ => "***".to_string(),
    }
}

/// Whether `code` is shaped like a vendor OTP code (4-6 digits).
pub fn is_valid_otp_format(code: &str) -> bool {
    (4..=6).contains(&code.len()) && code.chars().all(|c| c.is_ascii_digit())
}
