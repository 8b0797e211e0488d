// SPDX-License-Identifier: MIT

//! API routes for authenticated users.

use crate::error::{AppError, Result};
use crate::middleware::auth::AuthUser;
use crate::models::{AuthMethod, DeviceInfo, User};
use crate::routes::ensure_session;
use crate::AppState;
use axum::{
    extract::{Path, State},
    routing::{delete, get, post},
    Extension, Json, Router,
};
use axum_extra::extract::cookie::CookieJar;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
#[cfg(feature = "binding-generation")]
use ts_rs::TS;

/// API routes (require authentication via JWT).
/// The auth middleware is applied in routes/mod.rs for these routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/me", get(get_me))
        .route("/api/devices", get(get_devices))
        .route("/api/providers/link", post(link_provider))
        .route("/api/providers/{method}", delete(unlink_provider))
        .route("/api/onboarding/complete", post(complete_onboarding))
}

// ─── User Profile ────────────────────────────────────────────

/// Current user response.
#[derive(Serialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(
    feature = "binding-generation",
    ts(export, export_to = "web/src/lib/generated/")
)]
pub struct UserResponse {
    pub user: User,
}

/// Get current user profile.
async fn get_me(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthUser>,
) -> Result<Json<UserResponse>> {
    let user = load_user(&state, &auth.user_id).await?;
    Ok(Json(UserResponse { user }))
}

async fn load_user(state: &Arc<AppState>, user_id: &str) -> Result<User> {
    state
        .db
        .get_user(user_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("User {} not found", user_id)))
}

// ─── Devices ─────────────────────────────────────────────────

#[derive(Serialize)]
pub struct DevicesResponse {
    pub devices: Vec<DeviceInfo>,
}

/// List the devices this account has signed in from, most recent first.
async fn get_devices(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthUser>,
) -> Result<Json<DevicesResponse>> {
    let devices = state.db.list_devices(&auth.user_id).await?;
    Ok(Json(DevicesResponse { devices }))
}

// ─── Provider linking ────────────────────────────────────────

#[derive(Deserialize)]
pub struct LinkProviderRequest {
    pub method: AuthMethod,
    pub identifier: String,
}

/// Attach another sign-in method to the current account. Refused with a
/// conflict when the identifier already belongs to someone else.
async fn link_provider(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthUser>,
    Json(req): Json<LinkProviderRequest>,
) -> Result<Json<UserResponse>> {
    let user = load_user(&state, &auth.user_id).await?;

    if let Some(conflict) = state
        .guards
        .detect_linking_conflict(&user, req.method, &req.identifier)
        .await
    {
        return Err(crate::error::AuthError::provider_conflict(conflict.message()).into());
    }

    let updated = state
        .provider
        .link_credential(&user, req.method, &req.identifier)
        .await?;
    state.db.upsert_user(&updated).await?;

    tracing::info!(
        user_id = %updated.id,
        method = req.method.as_str(),
        "Provider linked"
    );

    Ok(Json(UserResponse { user: updated }))
}

/// Detach a sign-in method. The last remaining method can never be
/// removed.
async fn unlink_provider(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthUser>,
    Path(method): Path<String>,
) -> Result<Json<UserResponse>> {
    let method: AuthMethod = method
        .parse()
        .map_err(|_| AppError::BadRequest(format!("Unknown provider: {}", method)))?;

    let user = load_user(&state, &auth.user_id).await?;
    let updated = state.provider.unlink_provider(&user, method).await?;
    state.db.upsert_user(&updated).await?;

    tracing::info!(
        user_id = %updated.id,
        method = method.as_str(),
        "Provider unlinked"
    );

    Ok(Json(UserResponse { user: updated }))
}

// ─── Onboarding ──────────────────────────────────────────────

#[derive(Serialize)]
pub struct OnboardingResponse {
    pub status: String,
}

/// Mark onboarding finished for this session's sign-up funnel.
async fn complete_onboarding(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
) -> Result<(CookieJar, Json<OnboardingResponse>)> {
    let (session_id, jar) = ensure_session(jar);
    if let Some(context) = state.sessions.get(&session_id) {
        context.record_onboarding_complete();
    }
    Ok((
        jar,
        Json(OnboardingResponse {
            status: "completed".to_string(),
        }),
    ))
}
