// SPDX-License-Identifier: MIT

//! Rate limiter service.
//!
//! Wraps the windowed-block arithmetic in `models::rate_limit` with a
//! durable store. The Firestore store makes limiting hold across server
//! instances; the in-memory store is for tests and single-instance
//! local development.
//!
//! On store failure the limiter fails closed (denies): denying
//! availability during an outage beats allowing unlimited retries.

use crate::db::FirestoreDb;
use crate::models::{RateLimitAction, RateLimitDecision, RateLimitRecord};
use chrono::Utc;
use dashmap::DashMap;

enum Store {
    Firestore(FirestoreDb),
    Memory(DashMap<String, RateLimitRecord>),
}

/// Windowed attempt limiter, keyed by (action, identifier).
pub struct RateLimiter {
    store: Store,
}

impl RateLimiter {
    /// Limiter backed by the replicated Firestore store.
    pub fn new(db: FirestoreDb) -> Self {
        Self {
            store: Store::Firestore(db),
        }
    }

    /// Limiter backed by a process-local map.
    pub fn in_memory() -> Self {
        Self {
            store: Store::Memory(DashMap::new()),
        }
    }

    /// Record one attempt and decide whether it is allowed.
    ///
    /// Every call counts, including denied ones; the decision carries
    /// the remaining block time when denied by an active block.
    pub async fn check_and_record_attempt(
        &self,
        action: RateLimitAction,
        identifier: &str,
    ) -> RateLimitDecision {
        let now = Utc::now();

        match &self.store {
            Store::Firestore(db) => {
                match db.apply_rate_limit_attempt(action, identifier, now).await {
                    Ok(decision) => decision,
                    Err(e) => {
                        // Fail closed
                        tracing::error!(
                            action = action.as_str(),
                            error = %e,
                            "Rate limit store unavailable, denying attempt"
                        );
                        RateLimitDecision::denied(None)
                    }
                }
            }
            Store::Memory(map) => {
                let key = FirestoreDb::rate_limit_doc_id(action, identifier);
                let mut record = map
                    .entry(key)
                    .or_insert_with(|| RateLimitRecord::new(now));
                record.record_attempt(action.policy(), now)
            }
        }
    }
}
