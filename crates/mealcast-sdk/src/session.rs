// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Session reconciliation state machine.
//!
//! ```text
//!  idle ──submit──▶ submitting ──ok──▶ listening ──match──▶ matched
//!                       │                  │
//!                       │ err              │ deadline
//!                       ▼                  ├── nothing observed ──▶ error
//!                     error                └── plans observed ────▶ recovering
//!                (rate limited:                                     │
//!                 back to idle                        pick ─────────┴──▶ matched
//!                 after countdown)
//! ```
//!
//! The machine is synchronous and owns no timers. Transitions that need a
//! timer armed or an in-flight call aborted return an [`Effect`] for the
//! driver to carry out. Every job gets a generation number, and timer firings
//! or settlements carrying an older generation are ignored.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{SelectError, SessionFailure, SubmitError};
use crate::listener::RecentPlans;
use crate::types::{CanonicalPlan, JobKind};

/// How a plan came to be matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchSource {
    /// The plan carries the active correlation id.
    Correlation,
    /// The user picked it from the recovery candidates.
    RecoveryPick,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum SessionPhase {
    Idle,
    Submitting,
    Listening,
    Matched {
        plan: CanonicalPlan,
        via: MatchSource,
    },
    /// The deadline passed without a match; the most recent plans are offered.
    Recovering {
        candidates: Vec<CanonicalPlan>,
    },
    Error {
        failure: SessionFailure,
    },
}

impl SessionPhase {
    /// Phases during which a job counts as active.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SessionPhase::Submitting | SessionPhase::Listening | SessionPhase::Recovering { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            SessionPhase::Idle => "idle",
            SessionPhase::Submitting => "submitting",
            SessionPhase::Listening => "listening",
            SessionPhase::Matched { .. } => "matched",
            SessionPhase::Recovering { .. } => "recovering",
            SessionPhase::Error { .. } => "error",
        }
    }
}

/// Everything a caller can observe about the session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub phase: SessionPhase,
    pub active_correlation_id: Option<String>,
    pub active_kind: Option<JobKind>,
    pub deadline_at: Option<DateTime<Utc>>,
    /// Merged plans of both streams, newest first.
    pub recent_plans: Vec<CanonicalPlan>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            phase: SessionPhase::Idle,
            active_correlation_id: None,
            active_kind: None,
            deadline_at: None,
            recent_plans: Vec::new(),
        }
    }
}

/// Side effects requested by a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Start the result-wait deadline for this generation.
    ArmDeadline { generation: u64, after: Duration },
    /// Start the rate-limit countdown for this generation.
    ArmRetryCountdown { generation: u64, after: Duration },
    /// Stop every pending timer.
    DisarmTimers,
    /// Cancel the in-flight submission and stop every pending timer.
    AbortSubmission,
}

pub struct ReconciliationStateMachine {
    state: SessionState,
    generation: u64,
    recovery_candidates: usize,
    /// Latest listener output, kept for matches that land before settlement.
    last_view: RecentPlans,
}

impl ReconciliationStateMachine {
    pub fn new(recovery_candidates: usize) -> Self {
        Self {
            state: SessionState::default(),
            generation: 0,
            recovery_candidates: recovery_candidates.max(1),
            last_view: RecentPlans::default(),
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn clear_active(&mut self) {
        self.state.active_correlation_id = None;
        self.state.active_kind = None;
        self.state.deadline_at = None;
    }

    fn enter_idle(&mut self) {
        self.clear_active();
        self.state.phase = SessionPhase::Idle;
    }

    /// `idle | matched | error` → `submitting`.
    ///
    /// Returns the new job generation.
    pub fn begin_submission(
        &mut self,
        kind: JobKind,
        correlation_id: &str,
    ) -> Result<u64, SubmitError> {
        if self.state.phase.is_active() {
            debug!(phase = self.state.phase.name(), "Submission refused, job already active");
            return Err(SubmitError::AlreadyInFlight);
        }

        self.generation += 1;
        self.state.phase = SessionPhase::Submitting;
        self.state.active_kind = Some(kind);
        self.state.active_correlation_id = Some(correlation_id.to_string());
        self.state.deadline_at = None;

        debug!(generation = self.generation, kind = %kind, "Submitting");
        Ok(self.generation)
    }

    /// Apply the outcome of the submission started with `generation`.
    ///
    /// Settlements of superseded jobs are ignored and return `None`.
    pub fn submission_settled(
        &mut self,
        generation: u64,
        outcome: &Result<String, SubmitError>,
        result_timeout: Duration,
        now: DateTime<Utc>,
    ) -> Option<Effect> {
        if generation != self.generation || self.state.phase != SessionPhase::Submitting {
            debug!(generation, current = self.generation, "Ignoring stale settlement");
            return None;
        }

        match outcome {
            Ok(correlation_id) => {
                self.state.active_correlation_id = Some(correlation_id.clone());
                self.state.deadline_at = chrono::Duration::from_std(result_timeout)
                    .ok()
                    .and_then(|timeout| now.checked_add_signed(timeout));
                self.state.phase = SessionPhase::Listening;
                info!(
                    correlation_id = %correlation_id,
                    timeout_ms = result_timeout.as_millis() as u64,
                    "Listening for result"
                );

                // The worker may have been faster than the submission reply.
                if self.try_match() {
                    return None;
                }
                Some(Effect::ArmDeadline {
                    generation,
                    after: result_timeout,
                })
            }
            Err(err) => match SessionFailure::from_submit(err, now) {
                Some(failure) => {
                    let effect = match &failure {
                        SessionFailure::RateLimited {
                            retry_after_seconds,
                            ..
                        } => Some(Effect::ArmRetryCountdown {
                            generation,
                            after: Duration::from_secs(*retry_after_seconds),
                        }),
                        _ => None,
                    };
                    warn!(error = %err, "Submission failed");
                    self.clear_active();
                    self.state.phase = SessionPhase::Error { failure };
                    effect
                }
                None => {
                    debug!(error = %err, "Submission ended without failure");
                    self.enter_idle();
                    None
                }
            },
        }
    }

    /// Feed the latest listener output.
    pub fn observe(&mut self, view: &RecentPlans) -> Option<Effect> {
        self.last_view = view.clone();
        self.state.recent_plans = view.plans.clone();

        let awaiting = matches!(
            self.state.phase,
            SessionPhase::Listening | SessionPhase::Recovering { .. }
        );
        (awaiting && self.try_match()).then_some(Effect::DisarmTimers)
    }

    /// Move to `matched` if the last view holds the active correlation id.
    fn try_match(&mut self) -> bool {
        let Some(correlation_id) = self.state.active_correlation_id.as_deref() else {
            return false;
        };
        let Some(plan) = self.last_view.find_correlated(correlation_id).cloned() else {
            return false;
        };

        info!(
            correlation_id = %correlation_id,
            plan_id = %plan.id,
            meals = plan.meals.len(),
            "Result matched"
        );
        self.state.deadline_at = None;
        self.state.phase = SessionPhase::Matched {
            plan,
            via: MatchSource::Correlation,
        };
        true
    }

    /// The result-wait deadline of `generation` fired after `waited`.
    pub fn deadline_elapsed(&mut self, generation: u64, waited: Duration) -> bool {
        if generation != self.generation || self.state.phase != SessionPhase::Listening {
            debug!(generation, current = self.generation, "Ignoring stale deadline");
            return false;
        }

        self.state.deadline_at = None;
        if self.last_view.ever_observed && !self.last_view.is_empty() {
            let candidates = self.last_view.top(self.recovery_candidates);
            info!(candidates = candidates.len(), "No match before deadline, recovering");
            self.state.phase = SessionPhase::Recovering { candidates };
        } else {
            warn!(waited_ms = waited.as_millis() as u64, "No result documents before deadline");
            self.state.active_correlation_id = None;
            self.state.phase = SessionPhase::Error {
                failure: SessionFailure::ResultTimeoutNoData {
                    waited_seconds: waited.as_secs(),
                },
            };
        }
        true
    }

    /// The rate-limit countdown of `generation` elapsed.
    pub fn rate_limit_elapsed(&mut self, generation: u64) -> bool {
        let rate_limited = matches!(
            self.state.phase,
            SessionPhase::Error {
                failure: SessionFailure::RateLimited { .. }
            }
        );
        if generation != self.generation || !rate_limited {
            return false;
        }
        debug!("Rate limit countdown elapsed");
        self.enter_idle();
        true
    }

    /// Any phase → `idle`. Supersedes the current job.
    pub fn cancel(&mut self) -> Effect {
        let was_submitting = self.state.phase == SessionPhase::Submitting;
        if self.state.phase != SessionPhase::Idle {
            info!(phase = self.state.phase.name(), "Session cancelled");
        }
        self.generation += 1;
        self.enter_idle();

        if was_submitting {
            Effect::AbortSubmission
        } else {
            Effect::DisarmTimers
        }
    }

    /// `matched | recovering | error` → `idle`.
    ///
    /// Returns `None` when there is nothing to start over from: idle already,
    /// or a job still submitting or listening (use [`cancel`](Self::cancel)).
    pub fn start_over(&mut self) -> Option<Effect> {
        match self.state.phase {
            SessionPhase::Matched { .. }
            | SessionPhase::Recovering { .. }
            | SessionPhase::Error { .. } => {
                debug!(phase = self.state.phase.name(), "Starting over");
                self.generation += 1;
                self.enter_idle();
                Some(Effect::DisarmTimers)
            }
            _ => None,
        }
    }

    /// `recovering` → `matched` with the chosen candidate.
    pub fn select_candidate(&mut self, plan_id: &str) -> Result<CanonicalPlan, SelectError> {
        let SessionPhase::Recovering { candidates } = &self.state.phase else {
            return Err(SelectError::NotRecovering(self.state.phase.name()));
        };
        let plan = candidates
            .iter()
            .find(|plan| plan.id == plan_id)
            .cloned()
            .ok_or_else(|| SelectError::UnknownCandidate(plan_id.to_string()))?;

        info!(plan_id = %plan.id, "Recovery candidate selected");
        self.state.phase = SessionPhase::Matched {
            plan: plan.clone(),
            via: MatchSource::RecoveryPick,
        };
        Ok(plan)
    }
}
