// SPDX-License-Identifier: MIT

//! Identity provider adapter.
//!
//! Wraps the vendor identity platform's OAuth, phone-OTP, and
//! email-magic-link primitives behind one method-agnostic surface. This
//! is the single error-normalization boundary: every vendor failure is
//! converted into an `AuthError` here, and nothing above this module
//! ever inspects vendor error shapes.
//!
//! Two backends, one type: an HTTP client against the vendor REST API,
//! and an in-memory mock that simulates the vendor for tests and
//! offline development.

use crate::error::{AuthError, AuthErrorCode};
use crate::models::verification::{is_valid_otp_format, mask_phone, normalize_phone};
use crate::models::{AuthMethod, PendingVerification, User};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

/// OTP codes expire after this many seconds (matches the otp_verify
/// rate-limit window).
const OTP_TTL_SECS: i64 = 300;
/// Magic links stay valid for an hour.
const MAGIC_LINK_TTL_SECS: i64 = 3600;

/// One auth-state event: the vendor's current view of the signed-in user.
#[derive(Debug, Clone)]
pub struct AuthStateSnapshot {
    pub user: Option<User>,
    pub at: DateTime<Utc>,
}

/// Cancellable subscription to the auth-state stream.
///
/// Dropping (or calling `close`) detaches the listener; the auth context
/// closes its subscription at teardown so no listener leaks past the
/// session lifetime.
pub struct AuthStateSubscription {
    rx: broadcast::Receiver<AuthStateSnapshot>,
}

impl AuthStateSubscription {
    pub async fn recv(&mut self) -> Option<AuthStateSnapshot> {
        loop {
            match self.rx.recv().await {
                Ok(snapshot) => return Some(snapshot),
                // Skip over lagged events; only the latest snapshot matters
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn close(self) {}
}

/// Vendor session material returned by a refresh.
#[derive(Debug, Clone)]
pub struct VendorSession {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
}

/// A successful sign-in: the user plus whether the account was created
/// by this sign-in (drives the user_created vs login funnel step).
#[derive(Debug, Clone)]
pub struct SignInOutcome {
    pub user: User,
    pub created: bool,
}

/// Identity provider adapter.
pub struct IdentityProvider {
    backend: Backend,
    events: broadcast::Sender<AuthStateSnapshot>,
}

enum Backend {
    Http(HttpVendor),
    Mock(MockVendor),
}

impl IdentityProvider {
    /// Create an adapter talking to the vendor REST API.
    pub fn new(api_url: &str, api_key: &str) -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            backend: Backend::Http(HttpVendor {
                http: reqwest::Client::new(),
                base_url: api_url.trim_end_matches('/').to_string(),
                api_key: api_key.to_string(),
            }),
            events,
        }
    }

    /// Create an adapter with an in-memory vendor simulation.
    pub fn new_mock() -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            backend: Backend::Mock(MockVendor::default()),
            events,
        }
    }

    /// Subscribe to the auth-state stream.
    pub fn subscribe(&self) -> AuthStateSubscription {
        AuthStateSubscription {
            rx: self.events.subscribe(),
        }
    }

    fn publish(&self, user: Option<User>) {
        // No receivers is fine; send only fails when nobody listens
        let _ = self.events.send(AuthStateSnapshot {
            user,
            at: Utc::now(),
        });
    }

    // ─── Sign-in operations ──────────────────────────────────────

    /// Exchange an OAuth authorization code for a signed-in user.
    pub async fn sign_in_with_oauth(
        &self,
        method: AuthMethod,
        code: &str,
    ) -> Result<SignInOutcome, AuthError> {
        if !method.is_oauth() {
            return Err(AuthError::invalid_input("Not an OAuth sign-in method."));
        }

        let outcome = match &self.backend {
            Backend::Http(http) => http.oauth_token(method, code).await?,
            Backend::Mock(mock) => mock.oauth_token(method, code)?,
        };

        self.publish(Some(outcome.user.clone()));
        Ok(outcome)
    }

    /// Send an OTP code to a phone number.
    ///
    /// The phone must pass E.164 normalization; the HTTP backend also
    /// requires a bot-challenge token issued to the client beforehand.
    pub async fn send_otp(
        &self,
        phone: &str,
        challenge_token: Option<&str>,
    ) -> Result<PendingVerification, AuthError> {
        let phone = normalize_phone(phone).ok_or_else(AuthError::invalid_phone)?;

        match &self.backend {
            Backend::Http(http) => {
                let challenge = challenge_token.ok_or_else(|| {
                    AuthError::invalid_input("Verification challenge missing. Reload and retry.")
                })?;
                http.send_otp(&phone, challenge).await
            }
            Backend::Mock(mock) => Ok(mock.send_otp(&phone)),
        }
    }

    /// Verify an OTP code against a pending verification.
    ///
    /// Not idempotent: every call consumes a rate-limit slot, and a
    /// successful code is single-use.
    pub async fn verify_otp(
        &self,
        pending: &PendingVerification,
        code: &str,
    ) -> Result<SignInOutcome, AuthError> {
        if !is_valid_otp_format(code) {
            return Err(AuthError::invalid_input(
                "Codes are 4-6 digits. Check the message we sent you.",
            ));
        }
        if pending.is_expired(Utc::now()) {
            return Err(AuthError::expired_code());
        }

        let outcome = match &self.backend {
            Backend::Http(http) => http.verify_otp(&pending.confirmation_handle, code).await?,
            Backend::Mock(mock) => {
                let outcome = mock.verify_otp(&pending.confirmation_handle, code)?;
                // Simulated vendor latency; the result lands after the stall
                let delay = mock.verify_delay_ms.load(Ordering::Relaxed);
                if delay > 0 {
                    tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                }
                outcome
            }
        };

        self.publish(Some(outcome.user.clone()));
        Ok(outcome)
    }

    /// Invalidate a pending verification (superseded by a newer one).
    pub async fn cancel_verification(&self, confirmation_handle: &str) {
        match &self.backend {
            // Vendor pendings expire naturally; nothing to do over HTTP
            Backend::Http(_) => {}
            Backend::Mock(mock) => mock.cancel(confirmation_handle),
        }
    }

    /// Email a single-use sign-in link.
    ///
    /// Callers persist the pending-email session marker *before* this
    /// network call so a browser reload can still complete the flow.
    pub async fn send_magic_link(
        &self,
        email: &str,
        continue_url: &str,
    ) -> Result<(), AuthError> {
        let email = valid_email(email)?;
        match &self.backend {
            Backend::Http(http) => http.send_magic_link(&email, continue_url).await,
            Backend::Mock(mock) => {
                mock.send_magic_link(&email, continue_url);
                Ok(())
            }
        }
    }

    /// Complete a magic-link sign-in from a callback URL.
    pub async fn complete_magic_link_sign_in(
        &self,
        email: &str,
        link_url: &str,
    ) -> Result<SignInOutcome, AuthError> {
        let email = valid_email(email)?;
        let oob_code = magic_link_code(link_url).ok_or_else(|| {
            AuthError::invalid_input("That link isn't a sign-in link. Check your latest email.")
        })?;

        let outcome = match &self.backend {
            Backend::Http(http) => http.complete_magic_link(&email, &oob_code).await?,
            Backend::Mock(mock) => mock.complete_magic_link(&email, &oob_code)?,
        };

        self.publish(Some(outcome.user.clone()));
        Ok(outcome)
    }

    // ─── Account linking ─────────────────────────────────────────

    /// Link an additional sign-in method to an existing account.
    ///
    /// Fails with `ProviderConflict` when the identifier is already
    /// bound to a different account.
    pub async fn link_credential(
        &self,
        user: &User,
        method: AuthMethod,
        identifier: &str,
    ) -> Result<User, AuthError> {
        match &self.backend {
            Backend::Http(http) => http.link(&user.id, method, identifier).await,
            Backend::Mock(mock) => mock.link(&user.id, method, identifier),
        }
    }

    /// Remove a sign-in method. Fails if it would leave the account
    /// with no way to sign in.
    pub async fn unlink_provider(
        &self,
        user: &User,
        method: AuthMethod,
    ) -> Result<User, AuthError> {
        if user.providers.len() <= 1 {
            return Err(AuthError::invalid_input(
                "Keep at least one way to sign in before removing this one.",
            ));
        }
        if !user.has_provider(method) {
            return Err(AuthError::invalid_input(
                "That sign-in method isn't linked to this account.",
            ));
        }

        match &self.backend {
            Backend::Http(http) => http.unlink(&user.id, method).await,
            Backend::Mock(mock) => mock.unlink(&user.id, method),
        }
    }

    // ─── Session lifecycle ───────────────────────────────────────

    /// Sign the user out with the vendor. Safe to call repeatedly.
    pub async fn sign_out(&self, user_id: &str) -> Result<(), AuthError> {
        match &self.backend {
            Backend::Http(http) => http.sign_out(user_id).await?,
            Backend::Mock(_) => {}
        }
        self.publish(None);
        Ok(())
    }

    /// Mint a fresh vendor session for a signed-in user.
    pub async fn refresh_session(&self, user_id: &str) -> Result<VendorSession, AuthError> {
        match &self.backend {
            Backend::Http(http) => http.refresh_session(user_id).await,
            Backend::Mock(mock) => mock.refresh_session(user_id),
        }
    }

    /// The vendor's current view of the session, used once at context
    /// initialization.
    pub async fn current_user(&self) -> Result<Option<User>, AuthError> {
        match &self.backend {
            Backend::Http(http) => http.current_user().await,
            // The mock vendor has no ambient browser session
            Backend::Mock(_) => Ok(None),
        }
    }

    // ─── Mock test support ───────────────────────────────────────
    //
    // These return None / do nothing on the HTTP backend.

    /// Code issued for a pending verification (mock only).
    pub fn mock_issued_code(&self, confirmation_handle: &str) -> Option<String> {
        match &self.backend {
            Backend::Http(_) => None,
            Backend::Mock(mock) => mock
                .pending
                .get(confirmation_handle)
                .map(|p| p.code.clone()),
        }
    }

    /// Latest magic-link URL emailed to `email` (mock only).
    pub fn mock_magic_link(&self, email: &str) -> Option<String> {
        match &self.backend {
            Backend::Http(_) => None,
            Backend::Mock(mock) => mock.magic_links.get(&email.to_lowercase()).map(|handle| {
                format!(
                    "{}?mode=signIn&oobCode={}",
                    mock.continue_urls
                        .get(&email.to_lowercase())
                        .map(|u| u.clone())
                        .unwrap_or_else(|| "http://localhost:5173/auth/complete".to_string()),
                    handle.value()
                )
            }),
        }
    }

    /// Force-expire a pending verification (mock only).
    pub fn mock_expire_pending(&self, confirmation_handle: &str) {
        if let Backend::Mock(mock) = &self.backend {
            if let Some(mut p) = mock.pending.get_mut(confirmation_handle) {
                p.expires_at = Utc::now() - Duration::seconds(1);
            }
        }
    }

    /// Seed a pre-existing vendor account (mock only).
    pub fn mock_seed_user(&self, user: User) {
        if let Backend::Mock(mock) = &self.backend {
            if let Some(email) = &user.email {
                mock.identifiers
                    .insert(format!("email:{}", email.to_lowercase()), user.id.clone());
            }
            if let Some(phone) = &user.phone {
                mock.identifiers
                    .insert(format!("phone:{}", phone), user.id.clone());
            }
            for method in &user.providers {
                if method.is_oauth() {
                    if let Some(email) = &user.email {
                        mock.identifiers.insert(
                            format!("{}:{}", method.as_str(), email.to_lowercase()),
                            user.id.clone(),
                        );
                    }
                }
            }
            mock.users.insert(user.id.clone(), user);
        }
    }

    /// Stall verification results by `ms` milliseconds (mock only), to
    /// simulate a slow vendor response.
    pub fn mock_delay_verification(&self, ms: u64) {
        if let Backend::Mock(mock) = &self.backend {
            mock.verify_delay_ms.store(ms, Ordering::Relaxed);
        }
    }

    /// Revoke all vendor sessions for a user (mock only), so the next
    /// refresh fails.
    pub fn mock_revoke_sessions(&self, user_id: &str) {
        if let Backend::Mock(mock) = &self.backend {
            mock.revoked.insert(user_id.to_string(), true);
        }
    }
}

/// Whether `link_url` looks like a vendor magic-link callback.
pub fn is_magic_link_url(link_url: &str) -> bool {
    magic_link_code(link_url).is_some()
}

/// Extract the single-use code from a magic-link callback URL.
fn magic_link_code(link_url: &str) -> Option<String> {
    let parsed = url::Url::parse(link_url).ok()?;
    let mut mode = None;
    let mut oob_code = None;
    for (k, v) in parsed.query_pairs() {
        match k.as_ref() {
            "mode" => mode = Some(v.to_string()),
            "oobCode" => oob_code = Some(v.to_string()),
            _ => {}
        }
    }
    match (mode.as_deref(), oob_code) {
        (Some("signIn"), Some(code)) if !code.is_empty() => Some(code),
        _ => None,
    }
}

fn valid_email(email: &str) -> Result<String, AuthError> {
    use validator::ValidateEmail;

    let email = email.trim().to_lowercase();
    if email.validate_email() {
        Ok(email)
    } else {
        Err(AuthError::invalid_input(
            "That email doesn't look right. Double-check and try again.",
        ))
    }
}

// ─────────────────────────────────────────────────────────────────────
// HTTP backend
// ─────────────────────────────────────────────────────────────────────

struct HttpVendor {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

/// Vendor error body: `{"error": {"message": "INVALID_CODE", ...}}`
#[derive(Deserialize)]
struct VendorErrorBody {
    error: VendorErrorDetail,
}

#[derive(Deserialize)]
struct VendorErrorDetail {
    message: String,
}

/// Vendor user payload.
#[derive(Deserialize)]
struct VendorUser {
    uid: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    phone: Option<String>,
    #[serde(default)]
    providers: Vec<String>,
    created_at: String,
    last_login_at: String,
}

#[derive(Deserialize)]
struct VendorSignInResponse {
    #[serde(flatten)]
    user: VendorUser,
    #[serde(default)]
    is_new_user: bool,
}

#[derive(Deserialize)]
struct VendorOtpResponse {
    handle: String,
    expires_in: i64,
}

#[derive(Deserialize)]
struct VendorSessionResponse {
    access_token: String,
    expires_in: i64,
}

impl From<VendorUser> for User {
    fn from(v: VendorUser) -> Self {
        let providers = v
            .providers
            .iter()
            .filter_map(|p| p.parse::<AuthMethod>().ok())
            .collect();
        User {
            id: v.uid,
            display_name: v.display_name,
            email: v.email,
            phone: v.phone,
            providers,
            created_at: v.created_at,
            last_login_at: v.last_login_at,
            notification_prefs: Default::default(),
            goals: Vec::new(),
        }
    }
}

impl HttpVendor {
    async fn post_json<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<T, AuthError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http
            .post(&url)
            .query(&[("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .await
            .map_err(|e| AuthError::network(format!("Identity API unreachable: {}", e)))?;

        Self::decode(response).await
    }

    /// Normalize a vendor response into `T` or an `AuthError`. The only
    /// place vendor error codes are interpreted.
    async fn decode<T: for<'de> Deserialize<'de>>(
        response: reqwest::Response,
    ) -> Result<T, AuthError> {
        let status = response.status();
        if status.is_success() {
            return response
                .json()
                .await
                .map_err(|e| AuthError::unknown(format!("Malformed vendor response: {}", e)));
        }

        let body = response.text().await.unwrap_or_default();
        let vendor_code = serde_json::from_str::<VendorErrorBody>(&body)
            .map(|b| b.error.message)
            .unwrap_or_default();

        Err(normalize_vendor_error(status.as_u16(), &vendor_code))
    }

    async fn oauth_token(&self, method: AuthMethod, code: &str) -> Result<SignInOutcome, AuthError> {
        let resp: VendorSignInResponse = self
            .post_json(
                "/v1/oauth:token",
                serde_json::json!({ "provider": method.as_str(), "code": code }),
            )
            .await?;
        Ok(SignInOutcome {
            created: resp.is_new_user,
            user: resp.user.into(),
        })
    }

    async fn send_otp(&self, phone: &str, challenge: &str) -> Result<PendingVerification, AuthError> {
        let resp: VendorOtpResponse = self
            .post_json(
                "/v1/otp:send",
                serde_json::json!({ "phone": phone, "challenge_token": challenge }),
            )
            .await?;
        Ok(PendingVerification {
            method: AuthMethod::Phone,
            masked_identifier: mask_phone(phone),
            confirmation_handle: resp.handle,
            expires_at: Utc::now() + Duration::seconds(resp.expires_in),
        })
    }

    async fn verify_otp(&self, handle: &str, code: &str) -> Result<SignInOutcome, AuthError> {
        let resp: VendorSignInResponse = self
            .post_json(
                "/v1/otp:verify",
                serde_json::json!({ "handle": handle, "code": code }),
            )
            .await?;
        Ok(SignInOutcome {
            created: resp.is_new_user,
            user: resp.user.into(),
        })
    }

    async fn send_magic_link(&self, email: &str, continue_url: &str) -> Result<(), AuthError> {
        let _: serde_json::Value = self
            .post_json(
                "/v1/magicLink:send",
                serde_json::json!({ "email": email, "continue_url": continue_url }),
            )
            .await?;
        Ok(())
    }

    async fn complete_magic_link(
        &self,
        email: &str,
        oob_code: &str,
    ) -> Result<SignInOutcome, AuthError> {
        let resp: VendorSignInResponse = self
            .post_json(
                "/v1/magicLink:complete",
                serde_json::json!({ "email": email, "oob_code": oob_code }),
            )
            .await?;
        Ok(SignInOutcome {
            created: resp.is_new_user,
            user: resp.user.into(),
        })
    }

    async fn link(
        &self,
        user_id: &str,
        method: AuthMethod,
        identifier: &str,
    ) -> Result<User, AuthError> {
        let resp: VendorUser = self
            .post_json(
                "/v1/accounts:link",
                serde_json::json!({
                    "uid": user_id,
                    "provider": method.as_str(),
                    "identifier": identifier,
                }),
            )
            .await?;
        Ok(resp.into())
    }

    async fn unlink(&self, user_id: &str, method: AuthMethod) -> Result<User, AuthError> {
        let resp: VendorUser = self
            .post_json(
                "/v1/accounts:unlink",
                serde_json::json!({ "uid": user_id, "provider": method.as_str() }),
            )
            .await?;
        Ok(resp.into())
    }

    async fn sign_out(&self, user_id: &str) -> Result<(), AuthError> {
        let _: serde_json::Value = self
            .post_json("/v1/session:signOut", serde_json::json!({ "uid": user_id }))
            .await?;
        Ok(())
    }

    async fn refresh_session(&self, user_id: &str) -> Result<VendorSession, AuthError> {
        let resp: VendorSessionResponse = self
            .post_json(
                "/v1/session:refresh",
                serde_json::json!({ "uid": user_id }),
            )
            .await?;
        Ok(VendorSession {
            access_token: resp.access_token,
            expires_at: Utc::now() + Duration::seconds(resp.expires_in),
        })
    }

    async fn current_user(&self) -> Result<Option<User>, AuthError> {
        let url = format!("{}/v1/session:current", self.base_url);
        let response = self
            .http
            .get(&url)
            .query(&[("key", self.api_key.as_str())])
            .send()
            .await
            .map_err(|e| AuthError::network(format!("Identity API unreachable: {}", e)))?;

        if response.status().as_u16() == 401 {
            return Ok(None);
        }
        let user: VendorUser = Self::decode(response).await?;
        Ok(Some(user.into()))
    }
}

/// Map a vendor HTTP status + error code string to the closed taxonomy.
fn normalize_vendor_error(status: u16, vendor_code: &str) -> AuthError {
    match vendor_code {
        "INVALID_CODE" | "INVALID_OOB_CODE" => AuthError::invalid_code(),
        "CODE_EXPIRED" | "EXPIRED_OOB_CODE" | "SESSION_SUPERSEDED" => AuthError::expired_code(),
        "INVALID_PHONE_NUMBER" => AuthError::invalid_phone(),
        "EMAIL_EXISTS" | "CREDENTIAL_ALREADY_IN_USE" | "PHONE_EXISTS" => {
            AuthError::provider_conflict(
                "That sign-in method already belongs to another account.",
            )
        }
        "TOO_MANY_ATTEMPTS_TRY_LATER" => AuthError::rate_limited(None),
        "TOKEN_EXPIRED" | "USER_DISABLED" | "INVALID_REFRESH_TOKEN" => {
            AuthError::session_expired()
        }
        _ => match status {
            429 => AuthError::rate_limited(None),
            500..=599 => AuthError::network(format!("Identity API returned {}", status)),
            _ => AuthError::unknown(format!(
                "Unmapped vendor error: HTTP {} {}",
                status, vendor_code
            )),
        },
    }
}

// ─────────────────────────────────────────────────────────────────────
// Mock backend — in-memory vendor simulation
// ─────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct MockVendor {
    /// uid -> user
    users: DashMap<String, User>,
    /// "{method}:{identifier}" -> uid
    identifiers: DashMap<String, String>,
    /// confirmation handle -> pending
    pending: DashMap<String, MockPending>,
    /// email -> latest magic-link handle
    magic_links: DashMap<String, String>,
    /// email -> continue URL the link was issued for
    continue_urls: DashMap<String, String>,
    /// uids with revoked vendor sessions
    revoked: DashMap<String, bool>,
    /// milliseconds to stall verification results
    verify_delay_ms: AtomicU64,
}

struct MockPending {
    identifier: String,
    code: String,
    expires_at: DateTime<Utc>,
    cancelled: bool,
}

impl MockVendor {
    fn send_otp(&self, phone: &str) -> PendingVerification {
        let handle = uuid::Uuid::new_v4().to_string();
        let code = format!("{:06}", rand::random::<u32>() % 1_000_000);
        let expires_at = Utc::now() + Duration::seconds(OTP_TTL_SECS);

        self.pending.insert(
            handle.clone(),
            MockPending {
                identifier: format!("phone:{}", phone),
                code,
                expires_at,
                cancelled: false,
            },
        );

        PendingVerification {
            method: AuthMethod::Phone,
            masked_identifier: mask_phone(phone),
            confirmation_handle: handle,
            expires_at,
        }
    }

    fn verify_otp(&self, handle: &str, code: &str) -> Result<SignInOutcome, AuthError> {
        let (identifier, ok) = {
            let pending = self.pending.get(handle).ok_or_else(AuthError::expired_code)?;
            if pending.cancelled || Utc::now() >= pending.expires_at {
                return Err(AuthError::expired_code());
            }
            (pending.identifier.clone(), pending.code == code)
        };

        if !ok {
            return Err(AuthError::invalid_code());
        }

        // Single use
        self.pending.remove(handle);

        let phone = identifier.trim_start_matches("phone:").to_string();
        Ok(self.find_or_create(&identifier, AuthMethod::Phone, None, Some(phone)))
    }

    fn cancel(&self, handle: &str) {
        if let Some(mut p) = self.pending.get_mut(handle) {
            p.cancelled = true;
        }
    }

    fn send_magic_link(&self, email: &str, continue_url: &str) {
        let handle = uuid::Uuid::new_v4().to_string();
        self.pending.insert(
            handle.clone(),
            MockPending {
                identifier: format!("email:{}", email),
                code: handle.clone(),
                expires_at: Utc::now() + Duration::seconds(MAGIC_LINK_TTL_SECS),
                cancelled: false,
            },
        );
        self.magic_links.insert(email.to_string(), handle);
        self.continue_urls
            .insert(email.to_string(), continue_url.to_string());
    }

    fn complete_magic_link(&self, email: &str, oob_code: &str) -> Result<SignInOutcome, AuthError> {
        let identifier = {
            let pending = self
                .pending
                .get(oob_code)
                .ok_or_else(AuthError::expired_code)?;
            if pending.cancelled || Utc::now() >= pending.expires_at {
                return Err(AuthError::expired_code());
            }
            pending.identifier.clone()
        };

        if identifier != format!("email:{}", email) {
            return Err(AuthError::new(
                AuthErrorCode::InvalidCode,
                "That link was sent to a different email address.",
            ));
        }

        self.pending.remove(oob_code);
        self.magic_links.remove(email);

        Ok(self.find_or_create(&identifier, AuthMethod::Email, Some(email.to_string()), None))
    }

    fn oauth_token(&self, method: AuthMethod, code: &str) -> Result<SignInOutcome, AuthError> {
        // Mock authorization codes look like "mock:{email}"
        let email = code
            .strip_prefix("mock:")
            .ok_or_else(|| AuthError::new(AuthErrorCode::InvalidCode, "Sign-in didn't complete."))?
            .to_lowercase();

        let identifier = format!("{}:{}", method.as_str(), email);
        Ok(self.find_or_create(&identifier, method, Some(email), None))
    }

    fn find_or_create(
        &self,
        identifier: &str,
        method: AuthMethod,
        email: Option<String>,
        phone: Option<String>,
    ) -> SignInOutcome {
        let now = crate::time_utils::format_utc_rfc3339(Utc::now());

        if let Some(uid) = self.identifiers.get(identifier) {
            let uid = uid.clone();
            let mut user = self
                .users
                .get(&uid)
                .map(|u| u.clone())
                .unwrap_or_else(|| new_user(&uid, method, email.clone(), phone.clone(), &now));
            user.last_login_at = now;
            self.users.insert(uid, user.clone());
            return SignInOutcome {
                user,
                created: false,
            };
        }

        let uid = uuid::Uuid::new_v4().to_string();
        let user = new_user(&uid, method, email, phone, &now);
        self.identifiers.insert(identifier.to_string(), uid.clone());
        self.users.insert(uid, user.clone());
        SignInOutcome {
            user,
            created: true,
        }
    }

    fn link(&self, user_id: &str, method: AuthMethod, identifier: &str) -> Result<User, AuthError> {
        let key = format!("{}:{}", method.as_str(), identifier.to_lowercase());
        if let Some(owner) = self.identifiers.get(&key) {
            if owner.value() != user_id {
                return Err(AuthError::provider_conflict(
                    "That sign-in method already belongs to another account.",
                ));
            }
        }

        let mut user = self
            .users
            .get(user_id)
            .map(|u| u.clone())
            .ok_or_else(AuthError::session_expired)?;

        self.identifiers.insert(key, user_id.to_string());
        if !user.providers.contains(&method) {
            user.providers.push(method);
        }
        match method {
            AuthMethod::Phone => user.phone = Some(identifier.to_string()),
            AuthMethod::Email | AuthMethod::Google | AuthMethod::Apple => {
                if user.email.is_none() {
                    user.email = Some(identifier.to_lowercase());
                }
            }
        }
        self.users.insert(user_id.to_string(), user.clone());
        Ok(user)
    }

    fn unlink(&self, user_id: &str, method: AuthMethod) -> Result<User, AuthError> {
        let mut user = self
            .users
            .get(user_id)
            .map(|u| u.clone())
            .ok_or_else(AuthError::session_expired)?;

        user.providers.retain(|m| *m != method);
        self.identifiers
            .retain(|k, v| !(v == user_id && k.starts_with(method.as_str())));
        self.users.insert(user_id.to_string(), user.clone());
        Ok(user)
    }

    fn refresh_session(&self, user_id: &str) -> Result<VendorSession, AuthError> {
        if self.revoked.contains_key(user_id) || !self.users.contains_key(user_id) {
            return Err(AuthError::session_expired());
        }
        Ok(VendorSession {
            access_token: uuid::Uuid::new_v4().to_string(),
            expires_at: Utc::now() + Duration::hours(1),
        })
    }
}

fn new_user(
    uid: &str,
    method: AuthMethod,
    email: Option<String>,
    phone: Option<String>,
    now: &str,
) -> User {
    User {
        id: uid.to_string(),
        display_name: None,
        email: email.map(|e| e.to_lowercase()),
        phone,
        providers: vec![method],
        created_at: now.to_string(),
        last_login_at: now.to_string(),
        notification_prefs: Default::default(),
        goals: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_magic_link_url_detection() {
        assert!(is_magic_link_url(
            "https://app.example.com/auth/complete?mode=signIn&oobCode=abc123"
        ));
        assert!(!is_magic_link_url(
            "https://app.example.com/auth/complete?mode=resetPassword&oobCode=abc123"
        ));
        assert!(!is_magic_link_url("https://app.example.com/?mode=signIn"));
        assert!(!is_magic_link_url("not a url"));
    }

    #[test]
    fn test_vendor_error_normalization() {
        assert_eq!(
            normalize_vendor_error(400, "INVALID_CODE").code,
            AuthErrorCode::InvalidCode
        );
        assert_eq!(
            normalize_vendor_error(400, "EXPIRED_OOB_CODE").code,
            AuthErrorCode::ExpiredCode
        );
        assert_eq!(
            normalize_vendor_error(409, "CREDENTIAL_ALREADY_IN_USE").code,
            AuthErrorCode::ProviderConflict
        );
        assert_eq!(
            normalize_vendor_error(429, "").code,
            AuthErrorCode::RateLimited
        );
        assert_eq!(
            normalize_vendor_error(503, "").code,
            AuthErrorCode::NetworkError
        );
        // Anything unrecognized stays behind the Unknown wall
        assert_eq!(
            normalize_vendor_error(400, "SOME_FUTURE_CODE").code,
            AuthErrorCode::Unknown
        );
    }

    #[tokio::test]
    async fn test_mock_otp_roundtrip() {
        let provider = IdentityProvider::new_mock();
        let pending = provider.send_otp("+15551234567", None).await.unwrap();
        assert_eq!(pending.masked_identifier, "+15*******67");

        let code = provider
            .mock_issued_code(&pending.confirmation_handle)
            .unwrap();
        let outcome = provider.verify_otp(&pending, &code).await.unwrap();
        assert!(outcome.created);
        assert_eq!(outcome.user.phone.as_deref(), Some("+15551234567"));
        assert!(outcome.user.has_provider(AuthMethod::Phone));

        // Second verification with the same (consumed) code
        let err = provider.verify_otp(&pending, &code).await.unwrap_err();
        assert_eq!(err.code, AuthErrorCode::ExpiredCode);
    }

    #[tokio::test]
    async fn test_mock_otp_wrong_code_then_expired() {
        let provider = IdentityProvider::new_mock();
        let pending = provider.send_otp("+15551234567", None).await.unwrap();

        let err = provider.verify_otp(&pending, "000000").await.unwrap_err();
        assert_eq!(err.code, AuthErrorCode::InvalidCode);

        provider.mock_expire_pending(&pending.confirmation_handle);
        let code = provider
            .mock_issued_code(&pending.confirmation_handle)
            .unwrap();
        let err = provider.verify_otp(&pending, &code).await.unwrap_err();
        assert_eq!(err.code, AuthErrorCode::ExpiredCode);
    }

    #[tokio::test]
    async fn test_send_otp_rejects_bad_phone() {
        let provider = IdentityProvider::new_mock();
        let err = provider.send_otp("not-a-phone", None).await.unwrap_err();
        assert_eq!(err.code, AuthErrorCode::InvalidPhone);
    }

    #[tokio::test]
    async fn test_mock_magic_link_roundtrip() {
        let provider = IdentityProvider::new_mock();
        provider
            .send_magic_link("user@example.com", "http://localhost:5173/auth/complete")
            .await
            .unwrap();

        let link = provider.mock_magic_link("user@example.com").unwrap();
        let outcome = provider
            .complete_magic_link_sign_in("user@example.com", &link)
            .await
            .unwrap();
        assert!(outcome.created);
        assert_eq!(outcome.user.email.as_deref(), Some("user@example.com"));
    }

    #[tokio::test]
    async fn test_mock_magic_link_wrong_email() {
        let provider = IdentityProvider::new_mock();
        provider
            .send_magic_link("user@example.com", "http://localhost:5173/auth/complete")
            .await
            .unwrap();

        let link = provider.mock_magic_link("user@example.com").unwrap();
        let err = provider
            .complete_magic_link_sign_in("other@example.com", &link)
            .await
            .unwrap_err();
        assert_eq!(err.code, AuthErrorCode::InvalidCode);
    }

    #[tokio::test]
    async fn test_link_conflict() {
        let provider = IdentityProvider::new_mock();

        // First account owns the Google identity
        let first = provider
            .sign_in_with_oauth(AuthMethod::Google, "mock:taken@example.com")
            .await
            .unwrap();

        // Second account tries to link the same Google email
        let second = provider
            .sign_in_with_oauth(AuthMethod::Google, "mock:other@example.com")
            .await
            .unwrap();
        let err = provider
            .link_credential(&second.user, AuthMethod::Google, "taken@example.com")
            .await
            .unwrap_err();
        assert_eq!(err.code, AuthErrorCode::ProviderConflict);

        // Linking its own identifier again is fine (idempotent)
        let linked = provider
            .link_credential(&first.user, AuthMethod::Google, "taken@example.com")
            .await
            .unwrap();
        assert!(linked.has_provider(AuthMethod::Google));
    }

    #[tokio::test]
    async fn test_unlink_last_provider_refused() {
        let provider = IdentityProvider::new_mock();
        let outcome = provider
            .sign_in_with_oauth(AuthMethod::Google, "mock:solo@example.com")
            .await
            .unwrap();

        let err = provider
            .unlink_provider(&outcome.user, AuthMethod::Google)
            .await
            .unwrap_err();
        assert_eq!(err.code, AuthErrorCode::InvalidInput);
    }
}
