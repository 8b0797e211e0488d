// SPDX-License-Identifier: MIT

//! FocusFlow auth service
//!
//! Backend-for-frontend that owns sign-in for the FocusFlow app:
//! phone OTP, email magic links, and Google/Apple OAuth against the
//! identity vendor, with rate limiting, device recognition, account
//! linking, and sign-in funnel analytics.

pub mod config;
pub mod db;
pub mod error;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod services;
pub mod time_utils;

use config::Config;
use db::FirestoreDb;
use services::funnel::FunnelTracker;
use services::guards::Guards;
use services::identity::IdentityProvider;
use services::rate_limit::RateLimiter;
use services::session_store::SessionStore;
use services::sessions::SessionRegistry;
use std::sync::Arc;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub db: FirestoreDb,
    pub provider: Arc<IdentityProvider>,
    pub limiter: Arc<RateLimiter>,
    pub guards: Arc<Guards>,
    pub markers: Arc<SessionStore>,
    pub funnels: Arc<FunnelTracker>,
    pub sessions: SessionRegistry,
}

impl AppState {
    /// Wire the service graph over a database and identity adapter.
    pub fn build(config: Config, db: FirestoreDb, provider: IdentityProvider) -> Self {
        let provider = Arc::new(provider);
        let limiter = Arc::new(RateLimiter::new(db.clone()));
        Self::with_limiter(config, db, provider, limiter)
    }

    /// Same wiring with an explicit limiter (tests use the in-memory one).
    pub fn with_limiter(
        config: Config,
        db: FirestoreDb,
        provider: Arc<IdentityProvider>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        let guards = Arc::new(Guards::new(db.clone(), limiter.clone()));
        let markers = Arc::new(SessionStore::new());
        let funnels = Arc::new(FunnelTracker::new());
        let sessions = SessionRegistry::new(
            provider.clone(),
            guards.clone(),
            markers.clone(),
            funnels.clone(),
            db.clone(),
            config.frontend_url.clone(),
        );
        Self {
            config,
            db,
            provider,
            limiter,
            guards,
            markers,
            funnels,
            sessions,
        }
    }
}
