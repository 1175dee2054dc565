// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Orchestrator: the public face of a reconciliation session.

use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::auth::PrincipalProvider;
use crate::backend::{JobBackend, ResultStreams};
use crate::config::OrchestratorConfig;
use crate::error::{Result, SdkError, SelectError, SubmitError};
use crate::listener::{ListenerSubscription, RecentPlans, ResultListener};
use crate::rate_limit::RateLimitGate;
use crate::session::{Effect, ReconciliationStateMachine, SessionState};
use crate::submitter::{JobSubmitter, SubmitterStats};
use crate::types::{
    CanonicalPlan, JobKind, JobParameters, JobRequest, Principal, RateLimitStatus, Submission,
    SubmitOutcome,
};

enum Command {
    Submit {
        principal: Principal,
        parameters: JobParameters,
        reply: oneshot::Sender<SubmitOutcome>,
    },
    Cancel,
    StartOver,
    SelectCandidate {
        plan_id: String,
        reply: oneshot::Sender<std::result::Result<CanonicalPlan, SelectError>>,
    },
}

/// A submission task reporting back to the driver.
struct Settled {
    generation: u64,
    kind: JobKind,
    outcome: std::result::Result<String, SubmitError>,
    reply: oneshot::Sender<SubmitOutcome>,
}

/// A fire-once timer tagged with the job generation that armed it.
#[derive(Default)]
struct JobTimer {
    armed: Option<(u64, Pin<Box<Sleep>>)>,
}

impl JobTimer {
    fn arm(&mut self, generation: u64, after: Duration) {
        self.armed = Some((generation, Box::pin(tokio::time::sleep(after))));
    }

    fn disarm(&mut self) {
        self.armed = None;
    }

    /// Resolves with the generation once the timer fires. Pending while disarmed.
    async fn fired(&mut self) -> u64 {
        if let Some((generation, sleep)) = self.armed.as_mut() {
            sleep.await;
            let generation = *generation;
            self.armed = None;
            return generation;
        }
        std::future::pending().await
    }
}

/// Client-side orchestrator for meal recommendation jobs.
///
/// Submits a job, listens to both result streams, and reconciles the eventual
/// result against the submitted correlation id. All session state is owned by
/// one background driver task; callers observe it through [`observe`].
///
/// # Example
///
/// ```ignore
/// use mealcast_sdk::{AuthContext, HomeParameters, Orchestrator, OrchestratorConfig};
/// use std::sync::Arc;
///
/// let auth = AuthContext::login("owner-1", "token");
/// let orchestrator =
///     Orchestrator::connect_http(OrchestratorConfig::from_env()?, Arc::new(auth)).await?;
///
/// let submission = orchestrator.submit(HomeParameters::default().into()).await?;
/// let mut state = orchestrator.observe();
/// state.wait_for(|s| !s.phase.is_active()).await?;
/// ```
///
/// [`observe`]: Orchestrator::observe
pub struct Orchestrator {
    config: OrchestratorConfig,
    principals: Arc<dyn PrincipalProvider>,
    gate: Arc<RateLimitGate>,
    submitter: Arc<JobSubmitter>,
    listener: Arc<ResultListener>,
    subscription: tokio::sync::Mutex<Option<ListenerSubscription>>,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<SessionState>,
    current_submission: Arc<Mutex<Option<CancellationToken>>>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Start a session over the given collaborators.
    ///
    /// When a principal is signed in, both result streams are subscribed right
    /// away; otherwise call [`resubscribe`](Self::resubscribe) after login.
    pub async fn start(
        config: OrchestratorConfig,
        backend: Arc<dyn JobBackend>,
        streams: Arc<dyn ResultStreams>,
        principals: Arc<dyn PrincipalProvider>,
    ) -> Result<Self> {
        config.validate()?;

        let gate = Arc::new(RateLimitGate::new(
            Arc::clone(&backend),
            Arc::clone(&principals),
            config.rate_limit_poll_interval,
        ));
        let submitter = Arc::new(
            JobSubmitter::new(Arc::clone(&backend), config.submit_timeout)
                .with_rate_limit_gate(Arc::clone(&gate)),
        );
        let listener = Arc::new(ResultListener::new(streams));

        let shutdown = CancellationToken::new();
        let (state_tx, state_rx) = watch::channel(SessionState::default());
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let current_submission = Arc::new(Mutex::new(None));

        let driver = Driver {
            config: config.clone(),
            machine: ReconciliationStateMachine::new(config.recovery_candidates),
            gate: Arc::clone(&gate),
            submitter: Arc::clone(&submitter),
            state_tx,
            current_submission: Arc::clone(&current_submission),
            last_submission: None,
            shutdown: shutdown.clone(),
        };

        // Taken before the streams are subscribed so no snapshot goes unseen.
        let plans_rx = listener.recent_plans();
        let poller = gate.spawn_poller(shutdown.child_token());
        let driver_task = tokio::spawn(driver.run(commands_rx, plans_rx));

        let orchestrator = Self {
            config,
            principals,
            gate,
            submitter,
            listener,
            subscription: tokio::sync::Mutex::new(None),
            commands: commands_tx,
            state: state_rx,
            current_submission,
            shutdown,
            tasks: Mutex::new(vec![driver_task, poller]),
        };

        if orchestrator.principals.principal().is_some() {
            orchestrator.resubscribe().await?;
        } else {
            info!("No principal signed in, result streams not subscribed");
        }

        Ok(orchestrator)
    }

    /// Start a session against the HTTP backend at `config.api_url`.
    #[cfg(feature = "http")]
    pub async fn connect_http(
        config: OrchestratorConfig,
        principals: Arc<dyn PrincipalProvider>,
    ) -> Result<Self> {
        use crate::backend::http::{HttpBackend, PollingResultStreams};

        let backend = Arc::new(HttpBackend::new(&config)?);
        let streams = Arc::new(PollingResultStreams::new(&config)?);
        info!(api_url = %config.api_url, "Connecting orchestrator over HTTP");
        Self::start(config, backend, streams, principals).await
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Submit a job and wait until the backend has accepted or refused it.
    ///
    /// Resolves once the submission settles, not when the result arrives;
    /// follow [`observe`](Self::observe) for that.
    #[instrument(skip(self, parameters), fields(kind = %parameters.kind()))]
    pub async fn submit(&self, parameters: JobParameters) -> SubmitOutcome {
        let Some(principal) = self.principals.principal() else {
            warn!("Submission refused, no principal signed in");
            return Err(SubmitError::Unauthenticated);
        };

        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Submit {
                principal,
                parameters,
                reply,
            })
            .map_err(|_| SubmitError::SessionClosed)?;

        response.await.unwrap_or(Err(SubmitError::SessionClosed))
    }

    /// Receiver of the session state. Always holds the latest value.
    pub fn observe(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// Abandon the current job and return to idle.
    ///
    /// Aborts an in-flight submission immediately. The stream subscriptions
    /// stay open. Idempotent.
    pub fn cancel(&self) {
        if let Some(token) = self
            .current_submission
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
        {
            token.cancel();
        }
        let _ = self.commands.send(Command::Cancel);
    }

    /// Leave `matched`, `recovering` or `error` for `idle`.
    pub fn start_over(&self) {
        let _ = self.commands.send(Command::StartOver);
    }

    /// Accept one of the offered recovery candidates as the result.
    pub async fn select_recovery_candidate(
        &self,
        plan_id: impl Into<String>,
    ) -> std::result::Result<CanonicalPlan, SelectError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::SelectCandidate {
                plan_id: plan_id.into(),
                reply,
            })
            .map_err(|_| SelectError::SessionClosed)?;
        response.await.unwrap_or(Err(SelectError::SessionClosed))
    }

    /// Quota status, served from the gate's cache when fresh.
    pub async fn rate_limit_status(&self) -> Result<RateLimitStatus> {
        self.gate.check().await
    }

    /// Advisory: whether the quota allows a submission right now.
    pub async fn can_submit(&self) -> bool {
        self.gate.can_submit().await
    }

    /// Merged recent plans of both streams.
    pub fn recent_plans(&self) -> watch::Receiver<RecentPlans> {
        self.listener.recent_plans()
    }

    pub fn submitter_stats(&self) -> SubmitterStats {
        self.submitter.stats()
    }

    /// (Re)subscribe both result streams for the current principal.
    ///
    /// Disposes the previous subscription and starts from empty collections.
    pub async fn resubscribe(&self) -> Result<()> {
        let principal = self.principals.principal().ok_or(SdkError::Unauthenticated)?;
        let mut subscription = self.subscription.lock().await;
        if let Some(previous) = subscription.take() {
            previous.dispose();
        }
        *subscription = Some(self.listener.subscribe(&principal).await?);
        Ok(())
    }

    /// Stop the driver, the quota poller and both stream tasks.
    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        info!("Shutting down orchestrator");
        self.cancel();
        self.shutdown.cancel();

        if let Some(subscription) = self.subscription.lock().await.take() {
            subscription.join().await;
        }

        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Orchestrator task ended abnormally");
            }
        }
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Re-read the quota after the cached status refused a submission.
///
/// Returns `Ok` when the fresh status allows it after all.
async fn preflight_refusal(gate: &RateLimitGate) -> std::result::Result<(), SubmitError> {
    let refreshed = gate.refresh().await;
    let now = Utc::now();
    match refreshed {
        Ok(status) if !status.allows_submission(now) => {
            let retry_after_seconds = status.seconds_until_next_allowed(now).max(1);
            info!(retry_after_seconds, "Quota exhausted, not submitting");
            Err(SubmitError::RateLimited {
                retry_after_seconds,
            })
        }
        Ok(_) => {
            debug!("Quota reopened since the cached status");
            Ok(())
        }
        Err(e) => {
            debug!(error = %e, "Quota unknown after refresh, submitting");
            Ok(())
        }
    }
}

/// Sole writer of the session state.
struct Driver {
    config: OrchestratorConfig,
    machine: ReconciliationStateMachine,
    gate: Arc<RateLimitGate>,
    submitter: Arc<JobSubmitter>,
    state_tx: watch::Sender<SessionState>,
    current_submission: Arc<Mutex<Option<CancellationToken>>>,
    /// Task of the most recent submission. The next one waits for it to exit
    /// so the submitter's in-flight guard is released before it is retaken.
    last_submission: Option<JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl Driver {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut plans: watch::Receiver<RecentPlans>,
    ) {
        let (settled_tx, mut settled_rx) = mpsc::unbounded_channel::<Settled>();
        let mut plans_open = true;
        let mut deadline = JobTimer::default();
        let mut deadline_after = Duration::ZERO;
        let mut retry_countdown = JobTimer::default();

        debug!("Session driver started");

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    debug!("Session driver stopped");
                    break;
                }

                command = commands.recv() => {
                    let Some(command) = command else { break };
                    match command {
                        Command::Submit { principal, parameters, reply } => {
                            self.begin_submission(principal, parameters, reply, &settled_tx);
                        }
                        Command::Cancel => {
                            self.machine.cancel();
                            self.abort_submission();
                            deadline.disarm();
                            retry_countdown.disarm();
                        }
                        Command::StartOver => {
                            if self.machine.start_over().is_some() {
                                deadline.disarm();
                                retry_countdown.disarm();
                            }
                        }
                        Command::SelectCandidate { plan_id, reply } => {
                            let selected = self.machine.select_candidate(&plan_id);
                            if selected.is_ok() {
                                deadline.disarm();
                            }
                            self.publish();
                            let _ = reply.send(selected);
                        }
                    }
                }

                Some(settled) = settled_rx.recv() => {
                    let timeout = self.config.result_timeout_for(settled.kind);
                    let now = Utc::now();
                    let current = settled.generation == self.machine.generation();
                    let effect = self.machine.submission_settled(
                        settled.generation,
                        &settled.outcome,
                        timeout,
                        now,
                    );

                    match effect {
                        Some(Effect::ArmDeadline { generation, after }) => {
                            deadline_after = after;
                            deadline.arm(generation, after);
                        }
                        Some(Effect::ArmRetryCountdown { generation, after }) => {
                            retry_countdown.arm(generation, after);
                        }
                        _ => {}
                    }

                    let reply = match settled.outcome {
                        Ok(correlation_id) if current => Ok(Submission {
                            correlation_id,
                            kind: settled.kind,
                            deadline_at: self.machine.state().deadline_at.unwrap_or(now),
                        }),
                        Ok(_) => Err(SubmitError::Cancelled),
                        Err(e) => Err(e),
                    };
                    // Callers see the new phase as soon as their submit resolves.
                    self.publish();
                    let _ = settled.reply.send(reply);
                }

                changed = plans.changed(), if plans_open => {
                    if changed.is_err() {
                        plans_open = false;
                        continue;
                    }
                    let view = plans.borrow_and_update().clone();
                    if self.machine.observe(&view) == Some(Effect::DisarmTimers) {
                        deadline.disarm();
                    }
                }

                generation = deadline.fired() => {
                    self.machine.deadline_elapsed(generation, deadline_after);
                }

                generation = retry_countdown.fired() => {
                    self.machine.rate_limit_elapsed(generation);
                }
            }

            self.gate.set_polling(!self.machine.state().phase.is_active());
            self.publish();
        }

        self.abort_submission();
    }

    fn begin_submission(
        &mut self,
        principal: Principal,
        parameters: JobParameters,
        reply: oneshot::Sender<SubmitOutcome>,
        settled_tx: &mpsc::UnboundedSender<Settled>,
    ) {
        let kind = parameters.kind();
        let job = JobRequest::new(principal.owner_id.clone(), parameters);

        let generation = match self.machine.begin_submission(kind, &job.correlation_id) {
            Ok(generation) => generation,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };

        let cancel = self.shutdown.child_token();
        *self
            .current_submission
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(cancel.clone());

        let gate = Arc::clone(&self.gate);
        let submitter = Arc::clone(&self.submitter);
        let preflight = self.config.preflight_rate_limit;
        let settled_tx = settled_tx.clone();
        let previous = self.last_submission.take();

        self.last_submission = Some(tokio::spawn(async move {
            // Only reachable once the previous job settled or was cancelled,
            // so this wait is short.
            if let Some(previous) = previous {
                let _ = previous.await;
            }

            let outcome = async {
                if preflight {
                    let allowed = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(SubmitError::Cancelled),
                        allowed = gate.can_submit() => allowed,
                    };
                    if !allowed {
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => return Err(SubmitError::Cancelled),
                            refused = preflight_refusal(&gate) => refused?,
                        }
                    }
                }
                submitter.submit(&principal, &job, &cancel).await
            }
            .await;

            let _ = settled_tx.send(Settled {
                generation,
                kind,
                outcome,
                reply,
            });
        }));
    }

    fn abort_submission(&self) {
        if let Some(token) = self
            .current_submission
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            token.cancel();
        }
    }

    fn publish(&self) {
        let state = self.machine.state();
        self.state_tx.send_if_modified(|published| {
            if *published == *state {
                false
            } else {
                *published = state.clone();
                true
            }
        });
    }
}
