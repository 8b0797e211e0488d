// SPDX-License-Identifier: MIT

//! Auth context: the per-session sign-in state machine.
//!
//! One `AuthContext` exists per client session and owns everything the
//! session knows about identity: the current user, the initialization
//! flag, the (at most one) pending verification, and a monotonic
//! generation counter that rejects results from superseded sign-in
//! attempts. UI-facing verbs live here; the context consults the guards
//! and rate limiter before delegating to the identity adapter, and
//! every transition lands a funnel event.

use crate::db::FirestoreDb;
use crate::error::{AuthError, AuthErrorCode};
use crate::models::verification::mask_email;
use crate::models::{AuthMethod, PendingVerification, RateLimitAction, User};
use crate::services::funnel::{AbortReason, FunnelId, FunnelStep, FunnelTracker};
use crate::services::guards::Guards;
use crate::services::identity::{IdentityProvider, SignInOutcome, VendorSession};
use crate::services::session_store::SessionStore;
use chrono::{Duration, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Magic links are completable for an hour after being sent.
const MAGIC_LINK_PENDING_TTL_SECS: i64 = 3600;

/// Top-level lifecycle of a session's identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPhase {
    /// No auth-state event has arrived yet: identity is unknown, which
    /// is not the same as logged out.
    Initializing,
    Authenticated,
    Unauthenticated,
}

/// Transient sub-state of an in-flight sign-in.
#[derive(Debug, Clone)]
enum SignInFlow {
    Idle,
    MethodSelected(AuthMethod),
    VerificationPending(PendingVerification),
    Failed(AuthErrorCode),
}

struct Inner {
    phase: AuthPhase,
    initialized: bool,
    flow: SignInFlow,
    user: Option<User>,
    /// Raw identifier for the in-flight verification (rate-limit key)
    identifier: Option<String>,
    /// Bumped by every start_sign_in; results carrying an older value
    /// are stale and discarded
    generation: u64,
    failed_attempts: u32,
    funnel: Option<FunnelId>,
}

/// Result of starting a sign-in.
#[derive(Debug, Clone)]
pub struct StartSignIn {
    pub method: AuthMethod,
    /// Set for phone/email flows; OAuth completes via the callback
    pub pending: Option<PendingVerification>,
}

pub struct AuthContext {
    session_id: String,
    inner: Mutex<Inner>,
    provider: Arc<IdentityProvider>,
    guards: Arc<Guards>,
    markers: Arc<SessionStore>,
    funnels: Arc<FunnelTracker>,
    db: FirestoreDb,
    frontend_url: String,
    listener: Mutex<Option<tokio::task::JoinHandle<()>>>,
    /// Unix seconds of last use, for the registry's idle sweep
    last_used: AtomicI64,
}

impl AuthContext {
    /// Build a context: subscribe to the provider's auth-state stream
    /// and resolve the initial snapshot. Until that snapshot arrives the
    /// context reports `initialized = false`.
    pub async fn new(
        session_id: String,
        provider: Arc<IdentityProvider>,
        guards: Arc<Guards>,
        markers: Arc<SessionStore>,
        funnels: Arc<FunnelTracker>,
        db: FirestoreDb,
        frontend_url: String,
    ) -> Arc<Self> {
        let context = Arc::new(Self {
            session_id,
            inner: Mutex::new(Inner {
                phase: AuthPhase::Initializing,
                initialized: false,
                flow: SignInFlow::Idle,
                user: None,
                identifier: None,
                generation: 0,
                failed_attempts: 0,
                funnel: None,
            }),
            provider: provider.clone(),
            guards,
            markers,
            funnels,
            db,
            frontend_url,
            listener: Mutex::new(None),
            last_used: AtomicI64::new(Utc::now().timestamp()),
        });

        // First snapshot: the vendor's current view of the session
        match provider.current_user().await {
            Ok(user) => {
                let mut inner = context.inner.lock().expect("auth context poisoned");
                inner.phase = if user.is_some() {
                    AuthPhase::Authenticated
                } else {
                    AuthPhase::Unauthenticated
                };
                inner.user = user;
                inner.initialized = true;
            }
            Err(e) => {
                // Identity stays unknown; callers must not treat this
                // as logged out
                tracing::warn!(error = %e, "Auth-state initialization deferred");
            }
        }

        // Keep listening for later snapshots of this user
        let mut subscription = provider.subscribe();
        let weak: Weak<AuthContext> = Arc::downgrade(&context);
        let handle = tokio::spawn(async move {
            while let Some(snapshot) = subscription.recv().await {
                let Some(context) = weak.upgrade() else { break };
                context.apply_snapshot(snapshot.user);
            }
        });
        *context.listener.lock().expect("auth context poisoned") = Some(handle);

        context
    }

    /// Apply an auth-state snapshot. Snapshots for other users (every
    /// session shares the vendor stream) and snapshots older than the
    /// current generation are discarded.
    fn apply_snapshot(&self, user: Option<User>) {
        let mut inner = self.inner.lock().expect("auth context poisoned");
        inner.initialized = true;
        match (&inner.user, user) {
            (Some(current), Some(fresh)) if current.id == fresh.id => {
                inner.user = Some(fresh);
            }
            _ => {}
        }
    }

    /// Tear down: close the auth-state subscription so no listener
    /// outlives the session.
    pub fn close(&self) {
        if let Some(handle) = self.listener.lock().expect("auth context poisoned").take() {
            handle.abort();
        }
    }

    pub fn touch(&self) {
        self.last_used.store(Utc::now().timestamp(), Ordering::Relaxed);
    }

    pub fn last_used_at(&self) -> i64 {
        self.last_used.load(Ordering::Relaxed)
    }

    // ─── Read-only views ─────────────────────────────────────────

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn phase(&self) -> AuthPhase {
        self.inner.lock().expect("auth context poisoned").phase
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.lock().expect("auth context poisoned").initialized
    }

    pub fn current_user(&self) -> Option<User> {
        self.inner.lock().expect("auth context poisoned").user.clone()
    }

    pub fn pending_verification(&self) -> Option<PendingVerification> {
        let inner = self.inner.lock().expect("auth context poisoned");
        match &inner.flow {
            SignInFlow::VerificationPending(pending) => Some(pending.clone()),
            _ => None,
        }
    }

    pub fn failed_attempts(&self) -> u32 {
        self.inner.lock().expect("auth context poisoned").failed_attempts
    }

    // ─── Sign-in verbs ───────────────────────────────────────────

    /// Begin a sign-in with the chosen method.
    ///
    /// Any prior pending verification is superseded: its funnel aborts,
    /// its confirmation handle is cancelled, and a later `verify` against
    /// it fails with `expired_code`. At most one verification is pending
    /// per session.
    pub async fn start_sign_in(
        &self,
        method: AuthMethod,
        identifier: Option<&str>,
        challenge_token: Option<&str>,
    ) -> Result<StartSignIn, AuthError> {
        let (generation, superseded_handle) = {
            let mut inner = self.inner.lock().expect("auth context poisoned");
            inner.generation += 1;
            inner.failed_attempts = 0;

            let old_handle = match &inner.flow {
                SignInFlow::VerificationPending(pending) => {
                    Some(pending.confirmation_handle.clone())
                }
                _ => None,
            };
            if let Some(funnel) = inner.funnel.take() {
                self.funnels.abort_funnel(funnel, AbortReason::Superseded);
            }

            inner.flow = SignInFlow::MethodSelected(method);
            inner.identifier = None;
            inner.funnel = Some(self.funnels.start_funnel(method));
            (inner.generation, old_handle)
        };

        if let Some(handle) = superseded_handle {
            self.provider.cancel_verification(&handle).await;
        }

        let result = match method {
            AuthMethod::Phone => {
                let phone = identifier.ok_or_else(|| {
                    AuthError::invalid_input("A phone number is needed to sign in by text.")
                })?;
                self.start_phone(phone, challenge_token, generation).await
            }
            AuthMethod::Email => {
                let email = identifier.ok_or_else(|| {
                    AuthError::invalid_input("An email address is needed for a sign-in link.")
                })?;
                self.start_email(email, generation).await
            }
            AuthMethod::Google | AuthMethod::Apple => {
                // The OAuth popup/redirect completes via complete_oauth
                Ok(StartSignIn {
                    method,
                    pending: None,
                })
            }
        };

        if let Err(err) = &result {
            self.fail_flow(generation, err.code);
        }
        result
    }

    async fn start_phone(
        &self,
        phone: &str,
        challenge_token: Option<&str>,
        generation: u64,
    ) -> Result<StartSignIn, AuthError> {
        let decision = self
            .guards
            .check_brute_force(RateLimitAction::Otp, phone)
            .await;
        if !decision.allowed {
            return Err(AuthError::rate_limited(decision.retry_after_seconds));
        }

        let pending = self.provider.send_otp(phone, challenge_token).await?;

        let mut inner = self.inner.lock().expect("auth context poisoned");
        if inner.generation != generation {
            // A newer sign-in started while the code was being sent
            return Err(AuthError::expired_code());
        }
        inner.flow = SignInFlow::VerificationPending(pending.clone());
        inner.identifier = Some(phone.to_string());
        if let Some(funnel) = inner.funnel {
            self.funnels.record_step(funnel, FunnelStep::CodeSent);
        }

        Ok(StartSignIn {
            method: AuthMethod::Phone,
            pending: Some(pending),
        })
    }

    async fn start_email(&self, email: &str, generation: u64) -> Result<StartSignIn, AuthError> {
        let decision = self
            .guards
            .check_brute_force(RateLimitAction::MagicLink, email)
            .await;
        if !decision.allowed {
            return Err(AuthError::rate_limited(decision.retry_after_seconds));
        }

        // Marker goes in before the network call so a reload on this
        // device can still complete the flow
        self.markers.set_pending_email(&self.session_id, email);

        let continue_url = format!("{}/auth/complete", self.frontend_url);
        if let Err(err) = self.provider.send_magic_link(email, &continue_url).await {
            self.markers.clear_pending_email(&self.session_id);
            return Err(err);
        }

        let pending = PendingVerification {
            method: AuthMethod::Email,
            masked_identifier: mask_email(email),
            confirmation_handle: String::new(),
            expires_at: Utc::now() + Duration::seconds(MAGIC_LINK_PENDING_TTL_SECS),
        };

        let mut inner = self.inner.lock().expect("auth context poisoned");
        if inner.generation != generation {
            return Err(AuthError::expired_code());
        }
        inner.flow = SignInFlow::VerificationPending(pending.clone());
        inner.identifier = Some(email.to_string());
        if let Some(funnel) = inner.funnel {
            self.funnels.record_step(funnel, FunnelStep::CodeSent);
        }

        Ok(StartSignIn {
            method: AuthMethod::Email,
            pending: Some(pending),
        })
    }

    /// Verify the OTP code for the pending phone verification.
    ///
    /// Consumes a rate-limit slot on every call. Only valid while a
    /// verification is pending.
    pub async fn verify(&self, code: &str) -> Result<User, AuthError> {
        let (pending, identifier, generation) = {
            let inner = self.inner.lock().expect("auth context poisoned");
            let pending = match &inner.flow {
                SignInFlow::VerificationPending(p) if p.method == AuthMethod::Phone => p.clone(),
                SignInFlow::VerificationPending(_) => {
                    return Err(AuthError::invalid_input(
                        "This sign-in finishes through the link in your email.",
                    ))
                }
                _ => {
                    return Err(AuthError::invalid_input(
                        "No code is waiting to be checked. Start signing in first.",
                    ))
                }
            };
            let identifier = inner
                .identifier
                .clone()
                .unwrap_or_else(|| self.session_id.clone());
            (pending, identifier, inner.generation)
        };

        // Limiter first: every verify consumes a slot, expired ones too
        let decision = self
            .guards
            .check_brute_force(RateLimitAction::OtpVerify, &identifier)
            .await;
        if !decision.allowed {
            return Err(AuthError::rate_limited(decision.retry_after_seconds));
        }

        if pending.is_expired(Utc::now()) {
            let mut inner = self.inner.lock().expect("auth context poisoned");
            if inner.generation == generation {
                inner.flow = SignInFlow::Failed(AuthErrorCode::ExpiredCode);
                if let Some(funnel) = inner.funnel.take() {
                    self.funnels.abort_funnel(funnel, AbortReason::Error);
                }
            }
            return Err(AuthError::expired_code());
        }

        match self.provider.verify_otp(&pending, code).await {
            Ok(outcome) => self.finish_sign_in(outcome, generation).await,
            Err(err) => {
                let mut inner = self.inner.lock().expect("auth context poisoned");
                if inner.generation == generation {
                    inner.failed_attempts += 1;
                    if err.code == AuthErrorCode::ExpiredCode {
                        inner.flow = SignInFlow::Failed(err.code);
                        if let Some(funnel) = inner.funnel.take() {
                            self.funnels.abort_funnel(funnel, AbortReason::Error);
                        }
                    }
                }
                Err(err)
            }
        }
    }

    /// Complete a magic-link sign-in.
    ///
    /// Same-device completions recover the email from the session
    /// marker; cross-device completions must re-supply it (the marker is
    /// device-local by design).
    pub async fn complete_magic_link(
        &self,
        email: Option<&str>,
        link_url: &str,
    ) -> Result<User, AuthError> {
        let stored = self.markers.pending_email(&self.session_id);
        let email = match (email, stored) {
            (Some(typed), _) => typed.to_string(),
            (None, Some(stored)) => stored,
            (None, None) => {
                return Err(AuthError::invalid_input(
                    "Enter the email the link was sent to so we can finish signing you in.",
                ))
            }
        };

        let decision = self
            .guards
            .check_brute_force(RateLimitAction::LoginAttempt, &email)
            .await;
        if !decision.allowed {
            return Err(AuthError::rate_limited(decision.retry_after_seconds));
        }

        let generation = self.inner.lock().expect("auth context poisoned").generation;

        match self
            .provider
            .complete_magic_link_sign_in(&email, link_url)
            .await
        {
            Ok(outcome) => {
                self.markers.clear_pending_email(&self.session_id);
                // Cross-device completion has no funnel open on this
                // session; open one so the conversion is still counted
                {
                    let mut inner = self.inner.lock().expect("auth context poisoned");
                    if inner.funnel.is_none() {
                        inner.funnel = Some(self.funnels.start_funnel(AuthMethod::Email));
                    }
                }
                self.finish_sign_in(outcome, generation).await
            }
            Err(err) => {
                // The marker survives transient failures only
                if !err.is_recoverable() {
                    self.markers.clear_pending_email(&self.session_id);
                }
                Err(err)
            }
        }
    }

    /// Complete an OAuth sign-in from the provider callback.
    pub async fn complete_oauth(&self, method: AuthMethod, code: &str) -> Result<User, AuthError> {
        let decision = self
            .guards
            .check_brute_force(RateLimitAction::LoginAttempt, &self.session_id)
            .await;
        if !decision.allowed {
            return Err(AuthError::rate_limited(decision.retry_after_seconds));
        }

        let generation = {
            let mut inner = self.inner.lock().expect("auth context poisoned");
            if inner.funnel.is_none() {
                inner.funnel = Some(self.funnels.start_funnel(method));
            }
            inner.generation
        };

        let outcome = self.provider.sign_in_with_oauth(method, code).await?;
        self.finish_sign_in(outcome, generation).await
    }

    /// Shared tail of every successful sign-in: apply the outcome if it
    /// is not stale, persist the profile mirror, and record the funnel
    /// conversion.
    async fn finish_sign_in(
        &self,
        outcome: SignInOutcome,
        generation: u64,
    ) -> Result<User, AuthError> {
        let funnel = {
            let mut inner = self.inner.lock().expect("auth context poisoned");
            if inner.generation != generation {
                // A newer sign-in superseded this one while the vendor
                // call was in flight; do not clobber it
                tracing::info!(session = %self.session_id, "Stale sign-in result discarded");
                return Err(AuthError::expired_code());
            }
            inner.phase = AuthPhase::Authenticated;
            inner.initialized = true;
            inner.user = Some(outcome.user.clone());
            inner.flow = SignInFlow::Idle;
            inner.identifier = None;
            inner.failed_attempts = 0;
            if outcome.created {
                inner.funnel
            } else {
                inner.funnel.take()
            }
        };

        if let Some(funnel) = funnel {
            self.funnels.record_step(funnel, FunnelStep::Verified);
            if outcome.created {
                // Funnel stays open until onboarding completes (or the
                // sweep times it out)
                self.funnels.record_step(funnel, FunnelStep::UserCreated);
            } else {
                self.funnels.record_step(funnel, FunnelStep::Login);
                self.funnels.complete_funnel(funnel);
            }
        }

        self.markers
            .set_last_known_user(&self.session_id, &outcome.user.id);

        // Profile mirror is best effort; sign-in already succeeded
        if let Err(e) = self.db.upsert_user(&outcome.user).await {
            tracing::warn!(error = %e, "Failed to mirror user profile, continuing anyway");
        }

        Ok(outcome.user)
    }

    fn fail_flow(&self, generation: u64, code: AuthErrorCode) {
        let mut inner = self.inner.lock().expect("auth context poisoned");
        if inner.generation != generation {
            return;
        }
        inner.flow = SignInFlow::Failed(code);
        if let Some(funnel) = inner.funnel.take() {
            self.funnels.abort_funnel(funnel, AbortReason::Error);
        }
    }

    /// Record the end of onboarding; completes the sign-up funnel.
    pub fn record_onboarding_complete(&self) {
        let funnel = self.inner.lock().expect("auth context poisoned").funnel.take();
        if let Some(funnel) = funnel {
            self.funnels
                .record_step(funnel, FunnelStep::OnboardingCompleted);
            self.funnels.complete_funnel(funnel);
        }
    }

    // ─── Account linking ─────────────────────────────────────────

    pub async fn link_provider(
        &self,
        method: AuthMethod,
        identifier: &str,
    ) -> Result<User, AuthError> {
        let user = self.require_user()?;

        if let Some(conflict) = self
            .guards
            .detect_linking_conflict(&user, method, identifier)
            .await
        {
            return Err(AuthError::provider_conflict(conflict.message()));
        }

        let updated = self
            .provider
            .link_credential(&user, method, identifier)
            .await?;
        self.store_user(updated.clone()).await;
        Ok(updated)
    }

    pub async fn unlink_provider(&self, method: AuthMethod) -> Result<User, AuthError> {
        let user = self.require_user()?;
        let updated = self.provider.unlink_provider(&user, method).await?;
        self.store_user(updated.clone()).await;
        Ok(updated)
    }

    fn require_user(&self) -> Result<User, AuthError> {
        self.inner
            .lock()
            .expect("auth context poisoned")
            .user
            .clone()
            .ok_or_else(AuthError::session_expired)
    }

    async fn store_user(&self, user: User) {
        {
            let mut inner = self.inner.lock().expect("auth context poisoned");
            inner.user = Some(user.clone());
        }
        if let Err(e) = self.db.upsert_user(&user).await {
            tracing::warn!(error = %e, "Failed to mirror user profile, continuing anyway");
        }
    }

    // ─── Session lifecycle ───────────────────────────────────────

    /// Sign out. Idempotent: a second call is a no-op that succeeds.
    pub async fn logout(&self) -> Result<(), AuthError> {
        let user_id = {
            let mut inner = self.inner.lock().expect("auth context poisoned");
            let user_id = inner.user.take().map(|u| u.id);
            inner.phase = AuthPhase::Unauthenticated;
            inner.initialized = true;
            inner.flow = SignInFlow::Idle;
            inner.identifier = None;
            if let Some(funnel) = inner.funnel.take() {
                self.funnels.abort_funnel(funnel, AbortReason::UserExit);
            }
            user_id
        };

        self.markers.clear_all(&self.session_id);

        if let Some(user_id) = user_id {
            // Local state is already gone; a vendor failure here must
            // not resurrect the session
            if let Err(e) = self.provider.sign_out(&user_id).await {
                tracing::warn!(error = %e, "Vendor sign-out failed after local logout");
            }
        }

        Ok(())
    }

    /// Silent background refresh.
    ///
    /// Never surfaces an error: on failure the context transitions to
    /// unauthenticated and emits a `session_expired` event, and callers
    /// see `None`.
    pub async fn refresh(&self) -> Option<VendorSession> {
        let user_id = {
            let inner = self.inner.lock().expect("auth context poisoned");
            inner.user.as_ref().map(|u| u.id.clone())
        }?;

        match self.provider.refresh_session(&user_id).await {
            Ok(session) => Some(session),
            Err(err) => {
                tracing::info!(
                    session = %self.session_id,
                    error = %err,
                    "session_expired"
                );
                let mut inner = self.inner.lock().expect("auth context poisoned");
                inner.user = None;
                inner.phase = AuthPhase::Unauthenticated;
                inner.flow = SignInFlow::Idle;
                None
            }
        }
    }
}

impl Drop for AuthContext {
    fn drop(&mut self) {
        if let Ok(mut listener) = self.listener.lock() {
            if let Some(handle) = listener.take() {
                handle.abort();
            }
        }
    }
}
