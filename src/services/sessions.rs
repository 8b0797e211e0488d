// SPDX-License-Identifier: MIT

//! Session registry: one `AuthContext` per client session id.
//!
//! Contexts are created lazily on first use and reaped after a day of
//! inactivity so abandoned sessions do not pile up.

use crate::db::FirestoreDb;
use crate::services::context::AuthContext;
use crate::services::funnel::FunnelTracker;
use crate::services::guards::Guards;
use crate::services::identity::IdentityProvider;
use crate::services::session_store::SessionStore;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;

/// Contexts idle this long are dropped by the sweep.
const IDLE_TTL_SECS: i64 = 24 * 60 * 60;

pub struct SessionRegistry {
    sessions: DashMap<String, Arc<AuthContext>>,
    provider: Arc<IdentityProvider>,
    guards: Arc<Guards>,
    markers: Arc<SessionStore>,
    funnels: Arc<FunnelTracker>,
    db: FirestoreDb,
    frontend_url: String,
}

impl SessionRegistry {
    pub fn new(
        provider: Arc<IdentityProvider>,
        guards: Arc<Guards>,
        markers: Arc<SessionStore>,
        funnels: Arc<FunnelTracker>,
        db: FirestoreDb,
        frontend_url: String,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            provider,
            guards,
            markers,
            funnels,
            db,
            frontend_url,
        }
    }

    /// Fetch the session's context, creating it if this is the first
    /// request on this session id.
    pub async fn get_or_create(&self, session_id: &str) -> Arc<AuthContext> {
        if let Some(existing) = self.sessions.get(session_id) {
            existing.touch();
            return existing.clone();
        }

        let context = AuthContext::new(
            session_id.to_string(),
            self.provider.clone(),
            self.guards.clone(),
            self.markers.clone(),
            self.funnels.clone(),
            self.db.clone(),
            self.frontend_url.clone(),
        )
        .await;

        // A concurrent request may have won the race; keep theirs
        let entry = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| context);
        entry.touch();
        entry.clone()
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<AuthContext>> {
        self.sessions.get(session_id).map(|c| c.clone())
    }

    /// Drop a session's context and markers entirely.
    pub fn remove(&self, session_id: &str) {
        if let Some((_, context)) = self.sessions.remove(session_id) {
            context.close();
        }
        self.markers.clear_all(session_id);
    }

    /// Reap contexts idle past the TTL. Returns the number removed.
    pub fn sweep_idle(&self, now: DateTime<Utc>) -> usize {
        let cutoff = (now - Duration::seconds(IDLE_TTL_SECS)).timestamp();
        let stale: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.last_used_at() < cutoff)
            .map(|entry| entry.key().clone())
            .collect();

        for session_id in &stale {
            self.remove(session_id);
        }
        stale.len()
    }

    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }
}
