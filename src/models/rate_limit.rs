// SPDX-License-Identifier: MIT

//! Rate limit records and the windowed-block decision logic.
//!
//! The arithmetic lives here as pure functions over `RateLimitRecord` so
//! the semantics can be tested without a store; the Firestore glue in
//! `db::firestore` only loads, applies, and persists.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Action types that are rate limited, each with its own policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitAction {
    Otp,
    MagicLink,
    LoginAttempt,
    OtpVerify,
}

impl RateLimitAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitAction::Otp => "otp",
            RateLimitAction::MagicLink => "magic_link",
            RateLimitAction::LoginAttempt => "login_attempt",
            RateLimitAction::OtpVerify => "otp_verify",
        }
    }

    /// Fixed policy table.
    pub fn policy(&self) -> RateLimitPolicy {
        match self {
            RateLimitAction::Otp => RateLimitPolicy {
                max_attempts: 5,
                window_seconds: 3600,
                block_seconds: 3600,
            },
            RateLimitAction::MagicLink => RateLimitPolicy {
                max_attempts: 5,
                window_seconds: 3600,
                block_seconds: 3600,
            },
            RateLimitAction::LoginAttempt => RateLimitPolicy {
                max_attempts: 10,
                window_seconds: 900,
                block_seconds: 1800,
            },
            RateLimitAction::OtpVerify => RateLimitPolicy {
                max_attempts: 5,
                window_seconds: 300,
                block_seconds: 900,
            },
        }
    }
}

/// Per-action limiting policy.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitPolicy {
    pub max_attempts: u32,
    pub window_seconds: i64,
    pub block_seconds: i64,
}

/// Outcome of one `check_and_record_attempt` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Seconds until the block lifts; only set when denied by a block
    pub retry_after_seconds: Option<i64>,
}

impl RateLimitDecision {
    pub fn allowed() -> Self {
        Self {
            allowed: true,
            retry_after_seconds: None,
        }
    }

    pub fn denied(retry_after_seconds: Option<i64>) -> Self {
        Self {
            allowed: false,
            retry_after_seconds,
        }
    }
}

/// Attempt counter stored per (action, identifier) in the `rate_limits`
/// collection. Independent of any user: identifiers are raw phone
/// numbers, emails, or pre-auth session ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitRecord {
    pub count: u32,
    pub window_start: DateTime<Utc>,
    pub block_until: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl RateLimitRecord {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            count: 0,
            window_start: now,
            block_until: None,
            updated_at: now,
        }
    }

    /// Apply one attempt against `policy` at time `now`.
    ///
    /// Mutates the record (callers persist it afterwards) and returns
    /// the decision. An active block denies unconditionally; a block
    /// that has lapsed resets the window; attempts outside the window
    /// reset the count; exceeding `max_attempts` within the window
    /// starts a block of `block_seconds`.
    pub fn record_attempt(
        &mut self,
        policy: RateLimitPolicy,
        now: DateTime<Utc>,
    ) -> RateLimitDecision {
        self.updated_at = now;

        if let Some(block_until) = self.block_until {
            if now < block_until {
                let remaining = (block_until - now).num_seconds().max(1);
                return RateLimitDecision::denied(Some(remaining));
            }
            // Block lapsed: start fresh
            self.count = 0;
            self.window_start = now;
            self.block_until = None;
        }

        if now - self.window_start > Duration::seconds(policy.window_seconds) {
            self.count = 0;
            self.window_start = now;
        }

        self.count += 1;

        if self.count > policy.max_attempts {
            self.block_until = Some(now + Duration::seconds(policy.block_seconds));
            return RateLimitDecision::denied(Some(policy.block_seconds));
        }

        RateLimitDecision::allowed()
    }
}
