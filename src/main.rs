// SPDX-License-Identifier: MIT

//! FocusFlow auth API server
//!
//! Owns sign-in for the FocusFlow app: phone OTP, email magic links,
//! and OAuth against the identity vendor, plus rate limiting, device
//! recognition, and sign-in funnel analytics.

use focusflow_auth::{
    config::Config, db::FirestoreDb, services::identity::IdentityProvider, AppState,
};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How often expired funnels and idle sessions are reaped.
const SWEEP_INTERVAL_SECS: u64 = 60;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize structured JSON logging for GCP
    init_logging();

    // Load configuration from environment
    let config = Config::from_env().expect("Failed to load configuration");
    tracing::info!(port = config.port, "Starting FocusFlow auth API");

    // Initialize Firestore database
    let db = FirestoreDb::new(&config.gcp_project_id)
        .await
        .expect("Failed to connect to Firestore");

    // Identity vendor adapter
    let provider = IdentityProvider::new(&config.identity_api_url, &config.identity_api_key);
    tracing::info!(api_url = %config.identity_api_url, "Identity provider initialized");

    let port = config.port;
    let state = Arc::new(AppState::build(config, db, provider));

    // Periodic sweep: abort funnels idle past their timeout and drop
    // idle session contexts
    let sweep_state = state.clone();
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(SWEEP_INTERVAL_SECS));
        loop {
            interval.tick().await;
            let now = chrono::Utc::now();
            let funnels = sweep_state.funnels.sweep_expired(now);
            let sessions = sweep_state.sessions.sweep_idle(now);
            if funnels > 0 || sessions > 0 {
                tracing::debug!(funnels, sessions, "Sweep reaped stale state");
            }
        }
    });

    // Build router
    let app = focusflow_auth::routes::create_router(state);

    // Start server
    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(address = %addr, "Server listening");

    axum::serve(listener, app).await?;
    Ok(())
}

/// Initialize structured JSON logging (GCP-compliant).
fn init_logging() {
    let format = tracing_subscriber::fmt::layer()
        .json()
        .with_target(false)
        .with_current_span(true)
        .flatten_event(true);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("focusflow_auth=debug".parse().unwrap())
                .add_directive("info".parse().unwrap()),
        )
        .with(format)
        .init();
}
