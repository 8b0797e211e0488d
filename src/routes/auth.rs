// SPDX-License-Identifier: MIT

//! Sign-in routes: OAuth redirect flow, phone OTP, email magic links,
//! session refresh, and logout.

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::Redirect,
    routing::{get, post},
    Json, Router,
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{AppError, Result};
use crate::middleware::auth::{create_jwt, SESSION_COOKIE};
use crate::models::{AuthMethod, RateLimitAction, User};
use crate::routes::ensure_session;
use crate::AppState;

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/auth/rate-limit/check", post(rate_limit_check))
        .route("/auth/oauth/{provider}", get(oauth_start))
        .route("/auth/oauth/{provider}/callback", get(oauth_callback))
        .route("/auth/otp/send", post(otp_send))
        .route("/auth/otp/verify", post(otp_verify))
        .route("/auth/magic-link/send", post(magic_link_send))
        .route("/auth/magic-link/complete", post(magic_link_complete))
        .route("/auth/refresh", post(refresh))
        .route("/auth/logout", post(logout))
}

// ─── Rate limit preflight ────────────────────────────────────────

#[derive(Deserialize)]
pub struct RateLimitCheckRequest {
    pub action: RateLimitAction,
    pub identifier: String,
}

#[derive(Serialize)]
pub struct RateLimitCheckResponse {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<i64>,
}

/// Preflight rate-limit check. Counts as an attempt: callers should
/// only hit this when they are about to perform the action.
async fn rate_limit_check(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RateLimitCheckRequest>,
) -> Json<RateLimitCheckResponse> {
    let decision = state
        .limiter
        .check_and_record_attempt(req.action, &req.identifier)
        .await;
    Json(RateLimitCheckResponse {
        allowed: decision.allowed,
        retry_after_seconds: decision.retry_after_seconds,
    })
}

// ─── OAuth (Google / Apple) ──────────────────────────────────────

fn oauth_method(provider: &str) -> Result<AuthMethod> {
    let method: AuthMethod = provider
        .parse()
        .map_err(|_| AppError::BadRequest(format!("Unknown provider: {}", provider)))?;
    if !method.is_oauth() {
        return Err(AppError::BadRequest(format!(
            "Provider {} does not use OAuth",
            provider
        )));
    }
    Ok(method)
}

/// Start OAuth flow - redirect to the vendor's authorization page.
async fn oauth_start(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
    headers: HeaderMap,
) -> Result<Redirect> {
    let method = oauth_method(&provider)?;

    // Encode frontend URL + timestamp in state
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("System time error: {}", e)))?
        .as_millis();

    let state_payload = format!("{}|{:x}", state.config.frontend_url, timestamp);

    let mut mac = HmacSha256::new_from_slice(&state.config.oauth_state_key)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("HMAC init failed: {}", e)))?;
    mac.update(state_payload.as_bytes());
    let signature = mac.finalize().into_bytes();

    let signed_state = format!("{}|{}", state_payload, hex::encode(signature));
    let oauth_state = URL_SAFE_NO_PAD.encode(signed_state.as_bytes());

    // Get the host from the request headers for callback URL
    let host = headers
        .get(axum::http::header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("localhost:8080");
    let scheme = if host.contains("localhost") || host.contains("127.0.0.1") {
        "http"
    } else {
        "https"
    };
    let callback_url = format!("{}://{}/auth/oauth/{}/callback", scheme, host, provider);

    let auth_url = format!(
        "{}/oauth/{}/authorize?redirect_uri={}&response_type=code&state={}",
        state.config.identity_api_url,
        method.as_str(),
        urlencoding::encode(&callback_url),
        oauth_state
    );

    tracing::info!(provider = method.as_str(), "Starting OAuth flow");

    Ok(Redirect::temporary(&auth_url))
}

#[derive(Deserialize)]
pub struct CallbackParams {
    code: String,
    state: String,
    #[serde(default)]
    error: Option<String>,
}

/// OAuth callback - exchange the code for a user, create a session.
async fn oauth_callback(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
    jar: CookieJar,
    headers: HeaderMap,
    Query(params): Query<CallbackParams>,
) -> Result<(CookieJar, Redirect)> {
    let method = oauth_method(&provider)?;
    let (session_id, jar) = ensure_session(jar);

    // Decode and verify frontend URL from state parameter
    let frontend_url = verify_and_decode_state(&params.state, &state.config.oauth_state_key)
        .unwrap_or_else(|| {
            tracing::warn!(
                "Invalid or tampered state parameter, falling back to default frontend URL"
            );
            state.config.frontend_url.clone()
        });

    if let Some(error) = params.error {
        tracing::warn!(provider = method.as_str(), error = %error, "OAuth error from vendor");
        let redirect = format!("{}/login?error={}", frontend_url, error);
        return Ok((jar, Redirect::temporary(&redirect)));
    }

    let context = state.sessions.get_or_create(&session_id).await;
    let user = context.complete_oauth(method, &params.code).await?;

    let (new_device, token) = establish_session(&state, &session_id, &headers, &user).await?;
    let jar = jar.add(token_cookie(token.clone()));

    let mut redirect_url = format!("{}/callback?token={}", frontend_url, token);
    if new_device {
        redirect_url.push_str("&new_device=1");
    }

    Ok((jar, Redirect::temporary(&redirect_url)))
}

/// Verify HMAC signature and decode the frontend URL from the OAuth state parameter.
fn verify_and_decode_state(state: &str, secret: &[u8]) -> Option<String> {
    let bytes = URL_SAFE_NO_PAD.decode(state).ok()?;
    let state_str = String::from_utf8(bytes).ok()?;

    // Format is "frontend_url|timestamp_hex|signature_hex"
    let parts: Vec<&str> = state_str.splitn(3, '|').collect();
    if parts.len() != 3 {
        return None;
    }

    let frontend_url = parts[0];
    let timestamp_hex = parts[1];
    let signature_hex = parts[2];

    let payload = format!("{}|{}", frontend_url, timestamp_hex);

    let mut mac = HmacSha256::new_from_slice(secret).ok()?;
    mac.update(payload.as_bytes());

    let expected_signature = hex::encode(mac.finalize().into_bytes());

    if signature_hex != expected_signature {
        tracing::error!("OAuth state signature mismatch! Potential tampering.");
        return None;
    }

    Some(frontend_url.to_string())
}

// ─── Phone OTP ───────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct OtpSendRequest {
    pub phone: String,
    #[serde(default)]
    pub challenge_token: Option<String>,
}

#[derive(Serialize)]
pub struct VerificationStartedResponse {
    pub method: AuthMethod,
    pub masked_identifier: String,
    pub expires_at: DateTime<Utc>,
}

async fn otp_send(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Json(req): Json<OtpSendRequest>,
) -> Result<(CookieJar, Json<VerificationStartedResponse>)> {
    let (session_id, jar) = ensure_session(jar);
    let context = state.sessions.get_or_create(&session_id).await;

    let started = context
        .start_sign_in(
            AuthMethod::Phone,
            Some(&req.phone),
            req.challenge_token.as_deref(),
        )
        .await?;

    let pending = started
        .pending
        .ok_or_else(|| AppError::Internal(anyhow::anyhow!("OTP start produced no verification")))?;

    Ok((
        jar,
        Json(VerificationStartedResponse {
            method: pending.method,
            masked_identifier: pending.masked_identifier,
            expires_at: pending.expires_at,
        }),
    ))
}

#[derive(Deserialize)]
pub struct OtpVerifyRequest {
    pub code: String,
}

#[derive(Serialize)]
pub struct SignInResponse {
    pub user: User,
    pub token: String,
    pub new_device: bool,
}

async fn otp_verify(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    headers: HeaderMap,
    Json(req): Json<OtpVerifyRequest>,
) -> Result<(CookieJar, Json<SignInResponse>)> {
    let (session_id, jar) = ensure_session(jar);
    let context = state.sessions.get_or_create(&session_id).await;

    let user = context.verify(&req.code).await?;
    finish_sign_in(state, jar, headers, session_id, user).await
}

// ─── Email magic links ───────────────────────────────────────────

#[derive(Deserialize)]
pub struct MagicLinkSendRequest {
    pub email: String,
}

async fn magic_link_send(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Json(req): Json<MagicLinkSendRequest>,
) -> Result<(CookieJar, Json<VerificationStartedResponse>)> {
    let (session_id, jar) = ensure_session(jar);
    let context = state.sessions.get_or_create(&session_id).await;

    let started = context
        .start_sign_in(AuthMethod::Email, Some(&req.email), None)
        .await?;

    let pending = started.pending.ok_or_else(|| {
        AppError::Internal(anyhow::anyhow!("Magic link start produced no verification"))
    })?;

    Ok((
        jar,
        Json(VerificationStartedResponse {
            method: pending.method,
            masked_identifier: pending.masked_identifier,
            expires_at: pending.expires_at,
        }),
    ))
}

#[derive(Deserialize)]
pub struct MagicLinkCompleteRequest {
    pub link_url: String,
    /// Needed only when completing on a different device than the send
    #[serde(default)]
    pub email: Option<String>,
}

async fn magic_link_complete(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    headers: HeaderMap,
    Json(req): Json<MagicLinkCompleteRequest>,
) -> Result<(CookieJar, Json<SignInResponse>)> {
    let (session_id, jar) = ensure_session(jar);
    let context = state.sessions.get_or_create(&session_id).await;

    let user = context
        .complete_magic_link(req.email.as_deref(), &req.link_url)
        .await?;
    finish_sign_in(state, jar, headers, session_id, user).await
}

// ─── Session lifecycle ───────────────────────────────────────────

#[derive(Serialize)]
pub struct RefreshResponse {
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Silent refresh. Always 200: an expired vendor session reports
/// `active: false` rather than an error, and the token cookie is
/// dropped.
async fn refresh(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
) -> Result<(CookieJar, Json<RefreshResponse>)> {
    let (session_id, jar) = ensure_session(jar);
    let context = state.sessions.get_or_create(&session_id).await;

    match context.refresh().await {
        Some(session) => {
            let user = context
                .current_user()
                .ok_or_else(|| AppError::Internal(anyhow::anyhow!("Refresh without a user")))?;
            let token = create_jwt(&user.id, &state.config.jwt_signing_key)?;
            Ok((
                jar.add(token_cookie(token)),
                Json(RefreshResponse {
                    active: true,
                    expires_at: Some(session.expires_at),
                }),
            ))
        }
        None => Ok((
            jar.remove(Cookie::build(SESSION_COOKIE).path("/").build()),
            Json(RefreshResponse {
                active: false,
                expires_at: None,
            }),
        )),
    }
}

#[derive(Serialize)]
pub struct LogoutResponse {
    pub status: String,
}

/// Sign out. Idempotent: logging out twice is fine.
async fn logout(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
) -> Result<(CookieJar, Json<LogoutResponse>)> {
    let (session_id, jar) = ensure_session(jar);
    let context = state.sessions.get_or_create(&session_id).await;

    context.logout().await?;

    Ok((
        jar.remove(Cookie::build(SESSION_COOKIE).path("/").build()),
        Json(LogoutResponse {
            status: "signed_out".to_string(),
        }),
    ))
}

// ─── Shared sign-in tail ─────────────────────────────────────────

async fn finish_sign_in(
    state: Arc<AppState>,
    jar: CookieJar,
    headers: HeaderMap,
    session_id: String,
    user: User,
) -> Result<(CookieJar, Json<SignInResponse>)> {
    let (new_device, token) = establish_session(&state, &session_id, &headers, &user).await?;
    let jar = jar.add(token_cookie(token.clone()));
    Ok((
        jar,
        Json(SignInResponse {
            user,
            token,
            new_device,
        }),
    ))
}

/// Fingerprint the device, decide whether to warn about it, record it,
/// and mint the session token.
async fn establish_session(
    state: &Arc<AppState>,
    session_id: &str,
    headers: &HeaderMap,
    user: &User,
) -> Result<(bool, String)> {
    let user_agent = headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("");
    let accept_language = headers
        .get(axum::http::header::ACCEPT_LANGUAGE)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("");

    let fingerprint = state.guards.device_fingerprint(user_agent, accept_language);
    state
        .markers
        .set_device_fingerprint(session_id, &fingerprint);

    let new_device = state.guards.should_warn_new_device(user, &fingerprint).await;

    if let Err(e) = state
        .guards
        .register_device(&user.id, &fingerprint, user_agent)
        .await
    {
        tracing::warn!(error = %e, "Failed to record device, continuing anyway");
    }

    let token = create_jwt(&user.id, &state.config.jwt_signing_key)?;
    Ok((new_device, token))
}

fn token_cookie(token: String) -> Cookie<'static> {
    Cookie::build((SESSION_COOKIE, token))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .build()
}
