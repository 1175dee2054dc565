// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Single-flight job submission.
//!
//! A submission moves through `idle -> building payload -> in flight ->
//! settled`. Only one may be in flight per submitter; a second call is turned
//! away with [`SubmitError::AlreadyInFlight`] before anything touches the
//! network. Every settlement path releases the guard exactly once.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::backend::{JobBackend, SubmissionResponse};
use crate::error::SubmitError;
use crate::rate_limit::RateLimitGate;
use crate::types::{JobRequest, Principal};

#[derive(Default)]
struct Counters {
    submissions: AtomicU64,
    accepted: AtomicU64,
    rate_limited: AtomicU64,
    transport_failures: AtomicU64,
    timed_out: AtomicU64,
    cancelled: AtomicU64,
    rejected_in_flight: AtomicU64,
    guard_releases: AtomicU64,
}

/// Point-in-time copy of the submitter's outcome counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitterStats {
    /// Calls that acquired the guard.
    pub submissions: u64,
    pub accepted: u64,
    pub rate_limited: u64,
    pub transport_failures: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    /// Calls turned away because another submission was in flight.
    pub rejected_in_flight: u64,
    pub guard_releases: u64,
}

/// Held for the lifetime of one in-flight submission.
struct InFlightGuard<'a> {
    flag: &'a AtomicBool,
    releases: &'a AtomicU64,
}

impl<'a> InFlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool, releases: &'a AtomicU64) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag, releases })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if self.flag.swap(false, Ordering::AcqRel) {
            self.releases.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Submits jobs to the backend, one at a time.
pub struct JobSubmitter {
    backend: Arc<dyn JobBackend>,
    gate: Option<Arc<RateLimitGate>>,
    timeout: Duration,
    in_flight: AtomicBool,
    counters: Counters,
}

impl JobSubmitter {
    pub fn new(backend: Arc<dyn JobBackend>, timeout: Duration) -> Self {
        Self {
            backend,
            gate: None,
            timeout,
            in_flight: AtomicBool::new(false),
            counters: Counters::default(),
        }
    }

    /// Refresh `gate` after every accepted and every rate-limited submission.
    pub fn with_rate_limit_gate(mut self, gate: Arc<RateLimitGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> SubmitterStats {
        let c = &self.counters;
        SubmitterStats {
            submissions: c.submissions.load(Ordering::Relaxed),
            accepted: c.accepted.load(Ordering::Relaxed),
            rate_limited: c.rate_limited.load(Ordering::Relaxed),
            transport_failures: c.transport_failures.load(Ordering::Relaxed),
            timed_out: c.timed_out.load(Ordering::Relaxed),
            cancelled: c.cancelled.load(Ordering::Relaxed),
            rejected_in_flight: c.rejected_in_flight.load(Ordering::Relaxed),
            guard_releases: c.guard_releases.load(Ordering::Relaxed),
        }
    }

    /// Submit `job` and return its correlation id.
    ///
    /// Cancelling `cancel` aborts the network call and settles with
    /// [`SubmitError::Cancelled`].
    #[instrument(
        skip(self, principal, job, cancel),
        fields(correlation_id = %job.correlation_id, kind = %job.kind)
    )]
    pub async fn submit(
        &self,
        principal: &Principal,
        job: &JobRequest,
        cancel: &CancellationToken,
    ) -> Result<String, SubmitError> {
        let Some(guard) = InFlightGuard::acquire(&self.in_flight, &self.counters.guard_releases)
        else {
            self.counters.rejected_in_flight.fetch_add(1, Ordering::Relaxed);
            debug!("Submission rejected, another job is in flight");
            return Err(SubmitError::AlreadyInFlight);
        };
        self.counters.submissions.fetch_add(1, Ordering::Relaxed);

        let payload = job.to_payload().map_err(|e| {
            self.counters.transport_failures.fetch_add(1, Ordering::Relaxed);
            SubmitError::Transport {
                message: format!("failed to serialize job: {}", e),
            }
        })?;

        let call = tokio::time::timeout(self.timeout, self.backend.submit_job(principal, &payload));

        let outcome = tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
                info!("Submission cancelled");
                Err(SubmitError::Cancelled)
            }

            settled = call => self.settle(job, settled),
        };

        drop(guard);

        if matches!(outcome, Ok(_) | Err(SubmitError::RateLimited { .. }))
            && let Some(gate) = &self.gate
        {
            let gate = Arc::clone(gate);
            tokio::spawn(async move {
                if let Err(e) = gate.refresh().await {
                    debug!(error = %e, "Post-submission rate limit refresh failed");
                }
            });
        }

        outcome
    }

    fn settle(
        &self,
        job: &JobRequest,
        settled: std::result::Result<crate::error::Result<SubmissionResponse>, tokio::time::error::Elapsed>,
    ) -> Result<String, SubmitError> {
        let c = &self.counters;
        match settled {
            Err(_) => {
                c.timed_out.fetch_add(1, Ordering::Relaxed);
                warn!(timeout_ms = self.timeout.as_millis() as u64, "Submission timed out");
                Err(SubmitError::SubmissionTimedOut)
            }
            Ok(Err(e)) => {
                c.transport_failures.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "Submission failed");
                Err(SubmitError::Transport {
                    message: e.to_string(),
                })
            }
            Ok(Ok(SubmissionResponse::Rejected { status, message })) => {
                c.transport_failures.fetch_add(1, Ordering::Relaxed);
                warn!(status, message = %message, "Submission rejected");
                Err(SubmitError::Transport {
                    message: format!("HTTP {}: {}", status, message),
                })
            }
            Ok(Ok(SubmissionResponse::RateLimited {
                retry_after_seconds,
            })) => {
                c.rate_limited.fetch_add(1, Ordering::Relaxed);
                info!(retry_after_seconds, "Submission rate limited");
                Err(SubmitError::RateLimited {
                    retry_after_seconds,
                })
            }
            Ok(Ok(SubmissionResponse::Accepted { correlation_id })) => {
                c.accepted.fetch_add(1, Ordering::Relaxed);
                let correlation_id = match correlation_id {
                    Some(server_id) if server_id != job.correlation_id => {
                        warn!(
                            server_correlation_id = %server_id,
                            "Backend stored the job under a different correlation id"
                        );
                        server_id
                    }
                    _ => job.correlation_id.clone(),
                };
                info!("Submission accepted");
                Ok(correlation_id)
            }
        }
    }
}
