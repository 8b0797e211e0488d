//! Database layer (Firestore).

pub mod firestore;

pub use firestore::FirestoreDb;

/// Collection names as constants.
pub mod collections {
    pub const USERS: &str = "users";
    /// Attempt counters, keyed by `{action}:{identifier}`
    pub const RATE_LIMITS: &str = "rate_limits";
    /// Known devices, keyed by `{user_id}_{fingerprint}`
    pub const DEVICES: &str = "devices";
}
