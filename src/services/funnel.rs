// SPDX-License-Identifier: MIT

//! Sign-in funnel tracking.
//!
//! Records step transitions through the sign-in funnel and guarantees
//! exactly one terminal event (complete xor abort) per funnel. Funnels
//! idle past the inactivity timeout are auto-aborted by the periodic
//! sweep, so open funnel state never accumulates without bound.
//!
//! Events ship as structured tracing output; the in-memory state exists
//! only to enforce the terminal-event and timeout guarantees.

use crate::models::AuthMethod;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use uuid::Uuid;

/// Funnels idle this long are auto-aborted.
const INACTIVITY_TIMEOUT_SECS: i64 = 30 * 60;

/// Ordered steps of the sign-in funnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FunnelStep {
    MethodSelected,
    CodeSent,
    Verified,
    UserCreated,
    Login,
    OnboardingCompleted,
}

impl FunnelStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            FunnelStep::MethodSelected => "method_selected",
            FunnelStep::CodeSent => "code_sent",
            FunnelStep::Verified => "verified",
            FunnelStep::UserCreated => "user_created",
            FunnelStep::Login => "login",
            FunnelStep::OnboardingCompleted => "onboarding_completed",
        }
    }
}

/// Why a funnel ended without completing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    UserExit,
    Error,
    Superseded,
    Timeout,
}

impl AbortReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            AbortReason::UserExit => "user_exit",
            AbortReason::Error => "error",
            AbortReason::Superseded => "superseded",
            AbortReason::Timeout => "timeout",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunnelId(Uuid);

impl std::fmt::Display for FunnelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

struct FunnelState {
    method: AuthMethod,
    started_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    steps: Vec<FunnelStep>,
}

/// In-process funnel registry.
#[derive(Default)]
pub struct FunnelTracker {
    funnels: DashMap<FunnelId, FunnelState>,
}

impl FunnelTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a funnel for a sign-in attempt.
    pub fn start_funnel(&self, method: AuthMethod) -> FunnelId {
        let id = FunnelId(Uuid::new_v4());
        let now = Utc::now();
        self.funnels.insert(
            id,
            FunnelState {
                method,
                started_at: now,
                last_activity: now,
                steps: vec![FunnelStep::MethodSelected],
            },
        );
        tracing::info!(
            funnel = %id,
            method = method.as_str(),
            step = FunnelStep::MethodSelected.as_str(),
            "funnel_step"
        );
        id
    }

    /// Record a step. No-op (logged at debug) for unknown or already
    /// terminated funnels.
    pub fn record_step(&self, id: FunnelId, step: FunnelStep) {
        let Some(mut state) = self.funnels.get_mut(&id) else {
            tracing::debug!(funnel = %id, step = step.as_str(), "step for closed funnel dropped");
            return;
        };
        state.last_activity = Utc::now();
        state.steps.push(step);
        tracing::info!(
            funnel = %id,
            method = state.method.as_str(),
            step = step.as_str(),
            "funnel_step"
        );
    }

    /// Terminate a funnel as converted. Returns false if the funnel was
    /// already terminated (the terminal event fires at most once).
    pub fn complete_funnel(&self, id: FunnelId) -> bool {
        let Some((_, state)) = self.funnels.remove(&id) else {
            return false;
        };
        let elapsed = (Utc::now() - state.started_at).num_seconds();
        tracing::info!(
            funnel = %id,
            method = state.method.as_str(),
            steps = state.steps.len(),
            elapsed_seconds = elapsed,
            "funnel_completed"
        );
        true
    }

    /// Terminate a funnel as abandoned. Returns false if already
    /// terminated.
    pub fn abort_funnel(&self, id: FunnelId, reason: AbortReason) -> bool {
        let Some((_, state)) = self.funnels.remove(&id) else {
            return false;
        };
        let last_step = state
            .steps
            .last()
            .map(|s| s.as_str())
            .unwrap_or("none");
        tracing::info!(
            funnel = %id,
            method = state.method.as_str(),
            reason = reason.as_str(),
            last_step,
            "funnel_aborted"
        );
        true
    }

    /// Auto-abort funnels idle past the inactivity timeout. Returns the
    /// number aborted.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - Duration::seconds(INACTIVITY_TIMEOUT_SECS);
        let stale: Vec<FunnelId> = self
            .funnels
            .iter()
            .filter(|entry| entry.last_activity < cutoff)
            .map(|entry| *entry.key())
            .collect();

        let mut aborted = 0;
        for id in stale {
            if self.abort_funnel(id, AbortReason::Timeout) {
                aborted += 1;
            }
        }
        aborted
    }

    pub fn active_count(&self) -> usize {
        self.funnels.len()
    }
}
