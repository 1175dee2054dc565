// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end session tests against the in-memory backend.
//!
//! Most tests run on a paused clock, so result deadlines and rate-limit
//! countdowns elapse instantly and in a deterministic order. Races between
//! cancellation and resubmission run on a multi-threaded runtime.
//!
//! Run with:
//! ```bash
//! cargo test -p mealcast-sdk --test orchestrator_test
//! ```

use std::sync::Arc;
use std::time::Duration;

use mealcast_sdk::{
    AuthContext, HomeParameters, InMemoryBackend, JobKind, MatchSource, Orchestrator,
    OrchestratorConfig, ScriptedResponse, SessionFailure, SessionPhase, SessionState,
    SubmitError,
};
use serde_json::json;
use tokio::sync::watch;

const OWNER: &str = "owner-1";

fn config() -> OrchestratorConfig {
    OrchestratorConfig::new()
        .with_submit_timeout(Duration::from_secs(30))
        .with_result_timeout(Duration::from_secs(60))
        .with_recovery_candidates(3)
}

async fn start(backend: &InMemoryBackend) -> Orchestrator {
    start_with(backend, config()).await
}

async fn start_with(backend: &InMemoryBackend, config: OrchestratorConfig) -> Orchestrator {
    Orchestrator::start(
        config,
        Arc::new(backend.clone()),
        Arc::new(backend.clone()),
        Arc::new(AuthContext::login(OWNER, "token")),
    )
    .await
    .expect("orchestrator should start")
}

async fn wait_for_phase(
    rx: &mut watch::Receiver<SessionState>,
    within: Duration,
    pred: impl FnMut(&SessionState) -> bool,
) -> SessionState {
    tokio::time::timeout(within, rx.wait_for(pred))
        .await
        .expect("phase not reached in time")
        .expect("session closed")
        .clone()
}

/// Poll `cond` until it holds.
async fn eventually(mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition never became true");
}

fn home_doc(id: &str, correlation_id: &str, created_ms: i64, meals: &[&str]) -> serde_json::Value {
    json!({
        "_id": id,
        "correlationId": correlation_id,
        "createdAt": created_ms,
        "title": format!("Plan {}", id),
        "meals": meals.iter().map(|title| json!({ "title": title })).collect::<Vec<_>>(),
    })
}

fn home() -> mealcast_sdk::JobParameters {
    HomeParameters {
        pantry_items: vec!["rice".into()],
        ..Default::default()
    }
    .into()
}

// ============================================================================
// Matching
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_home_job_matches_two_meal_plan() {
    let backend = InMemoryBackend::new();
    let orchestrator = start(&backend).await;
    let mut state = orchestrator.observe();

    let submission = orchestrator.submit(home()).await.unwrap();
    assert_eq!(submission.kind, JobKind::Home);
    assert_eq!(orchestrator.state().phase, SessionPhase::Listening);

    backend.push_snapshot(
        OWNER,
        JobKind::Home,
        vec![home_doc(
            "plan-x",
            &submission.correlation_id,
            1_000,
            &["Fried rice", "Egg soup"],
        )],
    );

    let matched = wait_for_phase(&mut state, Duration::from_secs(5), |s| {
        matches!(s.phase, SessionPhase::Matched { .. })
    })
    .await;

    let SessionPhase::Matched { plan, via } = matched.phase else {
        unreachable!()
    };
    assert_eq!(via, MatchSource::Correlation);
    let titles: Vec<&str> = plan.meals.iter().map(|m| m.title.as_str()).collect();
    assert_eq!(titles, vec!["Fried rice", "Egg soup"]);
    assert!(matched.deadline_at.is_none());

    // The deadline must never fire after a match.
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert!(matches!(
        orchestrator.state().phase,
        SessionPhase::Matched { .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_plan_on_other_stream_still_matches() {
    let backend = InMemoryBackend::new();
    let orchestrator = start(&backend).await;
    let mut state = orchestrator.observe();

    let submission = orchestrator.submit(home()).await.unwrap();
    backend.push_snapshot(
        OWNER,
        JobKind::Away,
        vec![json!({
            "_id": "away-1",
            "correlationId": submission.correlation_id,
            "recommendations": [{ "name": "Cafe" }]
        })],
    );

    let matched = wait_for_phase(&mut state, Duration::from_secs(5), |s| {
        matches!(s.phase, SessionPhase::Matched { .. })
    })
    .await;
    assert_eq!(matched.recent_plans.len(), 1);
}

// ============================================================================
// Deadline
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_deadline_without_documents_is_error() {
    let backend = InMemoryBackend::new();
    let orchestrator = start(&backend).await;
    let mut state = orchestrator.observe();

    orchestrator.submit(home()).await.unwrap();

    let failed = wait_for_phase(&mut state, Duration::from_secs(120), |s| {
        matches!(s.phase, SessionPhase::Error { .. })
    })
    .await;

    assert_eq!(
        failed.phase,
        SessionPhase::Error {
            failure: SessionFailure::ResultTimeoutNoData { waited_seconds: 60 }
        }
    );
    assert!(failed.recent_plans.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_deadline_with_unrelated_documents_recovers() {
    let backend = InMemoryBackend::new();
    backend.push_snapshot(
        OWNER,
        JobKind::Home,
        vec![
            home_doc("old", "someone-else-1", 1_000, &["Soup"]),
            home_doc("newest", "someone-else-2", 5_000, &["Salad"]),
            home_doc("broken", "someone-else-3", 9_000, &[]),
        ],
    );
    backend.push_snapshot(
        OWNER,
        JobKind::Away,
        vec![json!({
            "_id": "middle",
            "createdAt": 3_000,
            "recommendations": [{ "name": "Bistro" }]
        })],
    );

    let orchestrator = start(&backend).await;
    let mut state = orchestrator.observe();
    orchestrator.submit(home()).await.unwrap();

    let recovering = wait_for_phase(&mut state, Duration::from_secs(120), |s| {
        matches!(s.phase, SessionPhase::Recovering { .. })
    })
    .await;

    let SessionPhase::Recovering { candidates } = recovering.phase else {
        unreachable!()
    };
    let ids: Vec<&str> = candidates.iter().map(|p| p.id.as_str()).collect();
    assert_eq!(ids, vec!["newest", "middle", "old"]);

    let picked = orchestrator
        .select_recovery_candidate("middle")
        .await
        .unwrap();
    assert_eq!(picked.kind, JobKind::Away);
    assert!(matches!(
        orchestrator.state().phase,
        SessionPhase::Matched {
            via: MatchSource::RecoveryPick,
            ..
        }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_per_kind_timeout_override() {
    let backend = InMemoryBackend::new();
    let orchestrator = start_with(
        &backend,
        config().with_result_timeout_for(JobKind::Home, Duration::from_secs(10)),
    )
    .await;
    let mut state = orchestrator.observe();

    orchestrator.submit(home()).await.unwrap();
    let failed = wait_for_phase(&mut state, Duration::from_secs(30), |s| {
        matches!(s.phase, SessionPhase::Error { .. })
    })
    .await;
    assert_eq!(
        failed.phase,
        SessionPhase::Error {
            failure: SessionFailure::ResultTimeoutNoData { waited_seconds: 10 }
        }
    );
}

// ============================================================================
// Single flight and cancellation
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_second_submit_while_active_never_reaches_backend() {
    let backend = InMemoryBackend::new();
    backend.script(ScriptedResponse::Hang);
    let orchestrator = Arc::new(start(&backend).await);
    let mut state = orchestrator.observe();

    let first = tokio::spawn({
        let orchestrator = Arc::clone(&orchestrator);
        async move { orchestrator.submit(home()).await }
    });
    wait_for_phase(&mut state, Duration::from_secs(1), |s| {
        s.phase == SessionPhase::Submitting
    })
    .await;
    eventually(|| backend.submission_count() == 1).await;

    assert_eq!(
        orchestrator.submit(home()).await,
        Err(SubmitError::AlreadyInFlight)
    );
    assert_eq!(backend.submission_count(), 1);

    orchestrator.cancel();
    assert_eq!(first.await.unwrap(), Err(SubmitError::Cancelled));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_releases_guard_exactly_once() {
    let backend = InMemoryBackend::new();
    backend.script(ScriptedResponse::Hang);
    let orchestrator = Arc::new(start(&backend).await);
    let mut state = orchestrator.observe();

    let pending = tokio::spawn({
        let orchestrator = Arc::clone(&orchestrator);
        async move { orchestrator.submit(home()).await }
    });
    eventually(|| backend.submission_count() == 1).await;

    orchestrator.cancel();
    orchestrator.cancel();
    assert_eq!(pending.await.unwrap(), Err(SubmitError::Cancelled));

    let idle = wait_for_phase(&mut state, Duration::from_secs(1), |s| {
        s.phase == SessionPhase::Idle
    })
    .await;
    assert!(idle.active_correlation_id.is_none());

    let stats = orchestrator.submitter_stats();
    assert_eq!(stats.cancelled, 1);
    assert_eq!(stats.guard_releases, 1);

    // The session is usable again.
    orchestrator.submit(home()).await.unwrap();
    assert_eq!(orchestrator.submitter_stats().guard_releases, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_resubmit_right_after_cancel_is_accepted() {
    let backend = InMemoryBackend::new();
    let orchestrator =
        Arc::new(start_with(&backend, config().with_preflight_rate_limit(false)).await);

    for round in 0..100 {
        backend.script(ScriptedResponse::Hang);
        let sent = backend.submission_count();
        let pending = tokio::spawn({
            let orchestrator = Arc::clone(&orchestrator);
            async move { orchestrator.submit(home()).await }
        });
        eventually(|| backend.submission_count() == sent + 1).await;

        orchestrator.cancel();
        let resubmitted = orchestrator.submit(home()).await;
        assert!(
            resubmitted.is_ok(),
            "round {}: resubmit after cancel failed: {:?}",
            round,
            resubmitted
        );
        assert_eq!(pending.await.unwrap(), Err(SubmitError::Cancelled));

        orchestrator.cancel();
    }

    let stats = orchestrator.submitter_stats();
    assert_eq!(stats.rejected_in_flight, 0);
    assert_eq!(stats.cancelled, 100);
    assert_eq!(stats.accepted, 100);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_while_listening_keeps_streams() {
    let backend = InMemoryBackend::new();
    let orchestrator = start(&backend).await;
    let mut state = orchestrator.observe();

    let submission = orchestrator.submit(home()).await.unwrap();
    orchestrator.cancel();
    wait_for_phase(&mut state, Duration::from_secs(1), |s| {
        s.phase == SessionPhase::Idle
    })
    .await;

    // A late result for the abandoned job shows up in recent plans only.
    backend.push_snapshot(
        OWNER,
        JobKind::Home,
        vec![home_doc("late", &submission.correlation_id, 1, &["Toast"])],
    );
    let updated = wait_for_phase(&mut state, Duration::from_secs(1), |s| {
        !s.recent_plans.is_empty()
    })
    .await;
    assert_eq!(updated.phase, SessionPhase::Idle);

    // And the abandoned deadline never fires.
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(orchestrator.state().phase, SessionPhase::Idle);
}

// ============================================================================
// Rate limiting
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_two_rate_limits_have_independent_countdowns() {
    let backend = InMemoryBackend::new();
    backend.script(ScriptedResponse::RateLimited(30));
    backend.script(ScriptedResponse::RateLimited(30));
    let orchestrator = start(&backend).await;
    let mut state = orchestrator.observe();

    assert_eq!(
        orchestrator.submit(home()).await,
        Err(SubmitError::RateLimited {
            retry_after_seconds: 30
        })
    );
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(
        orchestrator.submit(home()).await,
        Err(SubmitError::RateLimited {
            retry_after_seconds: 30
        })
    );

    // The first countdown is superseded: still rate limited at t=30.5s.
    tokio::time::sleep(Duration::from_millis(29_500)).await;
    assert!(matches!(
        orchestrator.state().phase,
        SessionPhase::Error {
            failure: SessionFailure::RateLimited { .. }
        }
    ));

    // The second one returns the session to idle at t=31s.
    wait_for_phase(&mut state, Duration::from_secs(2), |s| {
        s.phase == SessionPhase::Idle
    })
    .await;

    let stats = orchestrator.submitter_stats();
    assert_eq!(stats.rate_limited, 2);
    assert_eq!(stats.rejected_in_flight, 0);
}

#[tokio::test(start_paused = true)]
async fn test_preflight_blocks_exhausted_quota() {
    let backend = InMemoryBackend::new();
    backend.set_rate_limit_status(mealcast_sdk::RateLimitStatus {
        requests_in_window: 5,
        remaining: 0,
        can_submit_now: false,
        next_available_at: None,
        limit: Some(5),
        window_seconds: Some(3600),
    });
    let orchestrator = start(&backend).await;

    assert!(!orchestrator.can_submit().await);
    assert!(matches!(
        orchestrator.submit(home()).await,
        Err(SubmitError::RateLimited { .. })
    ));
    assert_eq!(backend.submission_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_preflight_refusal_rereads_quota() {
    let backend = InMemoryBackend::new();
    backend.set_rate_limit_status(mealcast_sdk::RateLimitStatus {
        requests_in_window: 5,
        remaining: 0,
        can_submit_now: false,
        next_available_at: None,
        limit: Some(5),
        window_seconds: Some(3600),
    });
    let orchestrator = start(&backend).await;
    assert!(!orchestrator.can_submit().await);
    let reads = backend.status_reads();

    assert!(matches!(
        orchestrator.submit(home()).await,
        Err(SubmitError::RateLimited { .. })
    ));
    assert!(backend.status_reads() > reads);
    assert_eq!(backend.submission_count(), 0);

    // The server reopens the window; the cached status is still fresh.
    backend.set_rate_limit_status(mealcast_sdk::RateLimitStatus::open(5));
    orchestrator.submit(home()).await.unwrap();
    assert_eq!(backend.submission_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_preflight_can_be_disabled() {
    let backend = InMemoryBackend::new();
    backend.set_rate_limit_status(mealcast_sdk::RateLimitStatus {
        requests_in_window: 5,
        remaining: 0,
        can_submit_now: false,
        next_available_at: None,
        limit: Some(5),
        window_seconds: None,
    });
    let orchestrator = start_with(&backend, config().with_preflight_rate_limit(false)).await;

    orchestrator.submit(home()).await.unwrap();
    assert_eq!(backend.submission_count(), 1);
}

// ============================================================================
// Authentication and lifecycle
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_signed_out_cannot_submit() {
    let backend = InMemoryBackend::new();
    let auth = AuthContext::signed_out();
    let orchestrator = Orchestrator::start(
        config(),
        Arc::new(backend.clone()),
        Arc::new(backend.clone()),
        Arc::new(auth.clone()),
    )
    .await
    .unwrap();

    assert_eq!(
        orchestrator.submit(home()).await,
        Err(SubmitError::Unauthenticated)
    );
    assert_eq!(orchestrator.state().phase, SessionPhase::Idle);
    assert_eq!(backend.submission_count(), 0);
    assert_eq!(backend.subscriber_count(OWNER, JobKind::Home), 0);

    auth.sign_in(mealcast_sdk::Principal::new(OWNER, "token"));
    orchestrator.resubscribe().await.unwrap();
    assert_eq!(backend.subscriber_count(OWNER, JobKind::Home), 1);
    orchestrator.submit(home()).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_start_over_after_error() {
    let backend = InMemoryBackend::new();
    backend.script(ScriptedResponse::Reject(500, "worker pool exhausted".into()));
    let orchestrator = start(&backend).await;
    let mut state = orchestrator.observe();

    assert!(matches!(
        orchestrator.submit(home()).await,
        Err(SubmitError::Transport { .. })
    ));
    let failed = orchestrator.state();
    let SessionPhase::Error { failure } = &failed.phase else {
        panic!("expected error phase, got {:?}", failed.phase);
    };
    assert!(failure.is_user_visible());

    orchestrator.start_over();
    wait_for_phase(&mut state, Duration::from_secs(1), |s| {
        s.phase == SessionPhase::Idle
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_closes_session() {
    let backend = InMemoryBackend::new();
    let orchestrator = start(&backend).await;

    orchestrator.shutdown().await;
    assert_eq!(
        orchestrator.submit(home()).await,
        Err(SubmitError::SessionClosed)
    );
    eventually(|| backend.subscriber_count(OWNER, JobKind::Home) == 0).await;
}
