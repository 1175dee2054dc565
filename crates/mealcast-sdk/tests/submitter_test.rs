// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Single-flight submission tests.
//!
//! These tests verify:
//! 1. A second submission while one is in flight never reaches the backend
//! 2. Cancellation aborts the network call and releases the guard once
//! 3. Accepted and rate-limited submissions refresh the quota gate

use std::sync::Arc;
use std::time::Duration;

use mealcast_sdk::{
    AwayParameters, InMemoryBackend, JobRequest, JobSubmitter, Principal, RateLimitGate,
    RateLimitStatus, ScriptedResponse, SubmitError,
};
use tokio_util::sync::CancellationToken;

fn principal() -> Principal {
    Principal::new("owner", "token")
}

fn job() -> JobRequest {
    JobRequest::new(
        "owner",
        AwayParameters {
            latitude: 52.23,
            longitude: 21.01,
            ..Default::default()
        }
        .into(),
    )
}

async fn until_in_flight(submitter: &JobSubmitter, backend: &InMemoryBackend) {
    for _ in 0..100 {
        if submitter.is_in_flight() && backend.submission_count() > 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("submission never went in flight");
}

// ============================================================================
// Guard
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_concurrent_submit_is_rejected_without_network() {
    let backend = InMemoryBackend::new();
    backend.script(ScriptedResponse::Hang);
    let submitter = Arc::new(JobSubmitter::new(
        Arc::new(backend.clone()),
        Duration::from_secs(30),
    ));
    let token = CancellationToken::new();

    let first = tokio::spawn({
        let submitter = Arc::clone(&submitter);
        let token = token.clone();
        async move { submitter.submit(&principal(), &job(), &token).await }
    });
    until_in_flight(&submitter, &backend).await;

    let second = submitter
        .submit(&principal(), &job(), &CancellationToken::new())
        .await;
    assert_eq!(second, Err(SubmitError::AlreadyInFlight));
    assert_eq!(backend.submission_count(), 1);

    token.cancel();
    assert_eq!(first.await.unwrap(), Err(SubmitError::Cancelled));

    let stats = submitter.stats();
    assert_eq!(stats.submissions, 1);
    assert_eq!(stats.rejected_in_flight, 1);
    assert_eq!(stats.cancelled, 1);
    assert_eq!(stats.guard_releases, 1);
    assert!(!submitter.is_in_flight());
}

#[tokio::test(start_paused = true)]
async fn test_guard_released_on_every_path() {
    let backend = InMemoryBackend::new();
    backend.script(ScriptedResponse::Accept);
    backend.script(ScriptedResponse::RateLimited(10));
    backend.script(ScriptedResponse::Reject(503, "unavailable".into()));
    backend.script(ScriptedResponse::Fail("reset by peer".into()));
    backend.script(ScriptedResponse::Hang);
    let submitter = JobSubmitter::new(Arc::new(backend.clone()), Duration::from_secs(5));
    let token = CancellationToken::new();

    for _ in 0..5 {
        let _ = submitter.submit(&principal(), &job(), &token).await;
        assert!(!submitter.is_in_flight());
    }

    let stats = submitter.stats();
    assert_eq!(stats.submissions, 5);
    assert_eq!(stats.accepted, 1);
    assert_eq!(stats.rate_limited, 1);
    assert_eq!(stats.transport_failures, 2);
    assert_eq!(stats.timed_out, 1);
    assert_eq!(stats.guard_releases, 5);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_racing_settlement_releases_once() {
    for delay_ms in [0u64, 1, 2, 5] {
        let backend = InMemoryBackend::new();
        backend.script(ScriptedResponse::Hang);
        let submitter = Arc::new(JobSubmitter::new(
            Arc::new(backend.clone()),
            Duration::from_millis(3),
        ));
        let token = CancellationToken::new();

        let pending = tokio::spawn({
            let submitter = Arc::clone(&submitter);
            let token = token.clone();
            async move { submitter.submit(&principal(), &job(), &token).await }
        });

        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        token.cancel();
        token.cancel();

        let outcome = pending.await.unwrap();
        assert!(
            matches!(
                outcome,
                Err(SubmitError::Cancelled) | Err(SubmitError::SubmissionTimedOut)
            ),
            "unexpected outcome {:?} after {}ms",
            outcome,
            delay_ms
        );
        assert_eq!(submitter.stats().guard_releases, 1);
        assert!(!submitter.is_in_flight());
    }
}

// ============================================================================
// Gate refresh
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_settlement_refreshes_gate() {
    let backend = InMemoryBackend::new();
    backend.set_rate_limit_status(RateLimitStatus::open(5));
    backend.script(ScriptedResponse::RateLimited(30));
    let gate = Arc::new(RateLimitGate::new(
        Arc::new(backend.clone()),
        Arc::new(principal()),
        Duration::from_secs(60),
    ));
    let submitter = JobSubmitter::new(Arc::new(backend.clone()), Duration::from_secs(5))
        .with_rate_limit_gate(Arc::clone(&gate));

    gate.check().await.unwrap();
    assert_eq!(backend.status_reads(), 1);

    submitter
        .submit(&principal(), &job(), &CancellationToken::new())
        .await
        .unwrap_err();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(backend.status_reads(), 2);

    submitter
        .submit(&principal(), &job(), &CancellationToken::new())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(backend.status_reads(), 3);
}
