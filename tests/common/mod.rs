// SPDX-License-Identifier: MIT

use focusflow_auth::config::Config;
use focusflow_auth::db::FirestoreDb;
use focusflow_auth::routes::create_router;
use focusflow_auth::services::identity::IdentityProvider;
use focusflow_auth::services::rate_limit::RateLimiter;
use focusflow_auth::AppState;
use std::sync::Arc;

/// Check if emulator is available via environment variable.
#[allow(dead_code)]
pub fn emulator_available() -> bool {
    std::env::var("FIRESTORE_EMULATOR_HOST").is_ok()
}

/// Skip test with message if emulator not available.
#[macro_export]
macro_rules! require_emulator {
    () => {
        if !crate::common::emulator_available() {
            eprintln!("⚠️  Skipping: FIRESTORE_EMULATOR_HOST not set");
            return;
        }
    };
}

/// Create a test database connection.
#[allow(dead_code)]
pub async fn test_db() -> FirestoreDb {
    FirestoreDb::new("test-project")
        .await
        .expect("Failed to connect to Firestore emulator")
}

/// Create a mock database connection (offline).
#[allow(dead_code)]
pub fn test_db_offline() -> FirestoreDb {
    FirestoreDb::new_mock()
}

/// Create a test app with an in-memory identity vendor and rate limiter
/// over an offline database. Returns the router and the shared state.
#[allow(dead_code)]
pub fn create_test_app() -> (axum::Router, Arc<AppState>) {
    let config = Config::test_default();
    let db = test_db_offline();
    let provider = Arc::new(IdentityProvider::new_mock());
    let limiter = Arc::new(RateLimiter::in_memory());

    let state = Arc::new(AppState::with_limiter(config, db, provider, limiter));
    (create_router(state.clone()), state)
}

/// Pull a cookie value out of a response's Set-Cookie headers.
#[allow(dead_code)]
pub fn cookie_value(response: &axum::http::Response<axum::body::Body>, name: &str) -> Option<String> {
    response
        .headers()
        .get_all(axum::http::header::SET_COOKIE)
        .iter()
        .filter_map(|h| h.to_str().ok())
        .find_map(|cookie| {
            let (pair, _) = cookie.split_once(';').unwrap_or((cookie, ""));
            let (key, value) = pair.split_once('=')?;
            (key.trim() == name).then(|| value.to_string())
        })
}

/// Read a response body as JSON.
#[allow(dead_code)]
pub async fn body_json(response: axum::http::Response<axum::body::Body>) -> serde_json::Value {
    let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
        .await
        .expect("Failed to read response body");
    serde_json::from_slice(&body).expect("Response body is not JSON")
}
