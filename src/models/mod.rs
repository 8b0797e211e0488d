// SPDX-License-Identifier: MIT

//! Data models for the application.

pub mod device;
pub mod rate_limit;
pub mod user;
pub mod verification;

pub use device::DeviceInfo;
pub use rate_limit::{RateLimitAction, RateLimitDecision, RateLimitPolicy, RateLimitRecord};
pub use user::{AuthMethod, Goal, NotificationPrefs, User};
pub use verification::PendingVerification;
