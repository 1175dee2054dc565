// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mealcast SDK - client-side job submission and result reconciliation.
//!
//! A meal or restaurant recommendation is produced by a backend worker the
//! client does not control. The client writes a job, and at some later point
//! the worker appends a result document to one of two result streams (home or
//! away), tagged with the job's correlation id. This crate bridges the two:
//! it submits the job, listens to both streams, normalizes whatever shape the
//! documents arrive in, and reconciles the session to a matched plan, a list
//! of recent alternatives, or a failure.
//!
//! # Features
//!
//! - **Rate-Limit Gate**: Cached, advisory quota status with background refresh
//! - **Single-Flight Submission**: One job at a time, cancellable, with timeouts
//! - **Dual-Stream Listening**: Home and away result streams merged newest-first
//! - **Normalization**: Tolerant mapping of drifting document schemas
//! - **Reconciliation**: Correlation matching, result deadline, recovery candidates
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use mealcast_sdk::{AuthContext, HomeParameters, Orchestrator, OrchestratorConfig, SessionPhase};
//!
//! #[tokio::main]
//! async fn main() -> mealcast_sdk::Result<()> {
//!     let auth = AuthContext::login("owner-1", std::env::var("MEALCAST_TOKEN").unwrap());
//!     let orchestrator =
//!         Orchestrator::connect_http(OrchestratorConfig::from_env()?, Arc::new(auth)).await?;
//!
//!     let params = HomeParameters {
//!         pantry_items: vec!["rice".into(), "eggs".into()],
//!         ..Default::default()
//!     };
//!     match orchestrator.submit(params.into()).await {
//!         Ok(submission) => println!("submitted {}", submission.correlation_id),
//!         Err(e) => println!("not submitted: {}", e),
//!     }
//!
//!     let mut state = orchestrator.observe();
//!     let settled = state.wait_for(|s| !s.phase.is_active()).await.unwrap().clone();
//!     if let SessionPhase::Matched { plan, .. } = settled.phase {
//!         println!("{}: {} meals", plan.title, plan.meals.len());
//!     }
//!
//!     orchestrator.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Session Phases
//!
//! | Phase | Meaning |
//! |-------|---------|
//! | `idle` | Nothing in progress |
//! | `submitting` | Submission call in flight |
//! | `listening` | Accepted; waiting for the correlated document |
//! | `matched` | A plan was matched (by correlation id or picked in recovery) |
//! | `recovering` | Deadline passed with documents but no match; recent plans offered |
//! | `error` | Submission failed, or no document at all before the deadline |
//!
//! # Configuration
//!
//! ## Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `MEALCAST_API_URL` | No | `http://127.0.0.1:8080` | Backend base URL |
//! | `MEALCAST_SUBMIT_TIMEOUT_MS` | No | `30000` | Submission call timeout |
//! | `MEALCAST_RESULT_TIMEOUT_MS` | No | `60000` | Result wait, both kinds |
//! | `MEALCAST_HOME_RESULT_TIMEOUT_MS` | No | - | Result wait override for home jobs |
//! | `MEALCAST_AWAY_RESULT_TIMEOUT_MS` | No | - | Result wait override for away jobs |
//! | `MEALCAST_RATE_LIMIT_POLL_INTERVAL_MS` | No | `15000` | Quota refresh interval |
//! | `MEALCAST_STREAM_POLL_INTERVAL_MS` | No | `2000` | HTTP result poll interval |
//! | `MEALCAST_RECOVERY_CANDIDATES` | No | `5` | Plans offered in recovery |
//! | `MEALCAST_PREFLIGHT_RATE_LIMIT` | No | `true` | Check quota before submitting |
//!
//! ## Programmatic Configuration
//!
//! ```ignore
//! use std::time::Duration;
//! use mealcast_sdk::{JobKind, OrchestratorConfig};
//!
//! let config = OrchestratorConfig::new()
//!     .with_api_url("https://api.mealcast.example")
//!     .with_result_timeout(Duration::from_secs(45))
//!     .with_result_timeout_for(JobKind::Away, Duration::from_secs(90));
//! ```

mod auth;
pub mod backend;
mod client;
mod config;
mod error;
mod listener;
pub mod normalize;
mod rate_limit;
mod session;
mod submitter;
mod types;

pub use auth::{AuthContext, PrincipalProvider};
pub use backend::memory::{InMemoryBackend, ScriptedResponse};
pub use backend::{JobBackend, ResultStreams, SnapshotReceiver, SubmissionResponse};
pub use client::Orchestrator;
pub use config::OrchestratorConfig;
pub use error::{Result, SdkError, SelectError, SessionFailure, SubmitError};
pub use listener::{ListenerSubscription, RecentPlans, ResultListener, merge};
pub use normalize::{MalformedDocument, normalize, normalize_snapshot, try_normalize};
pub use rate_limit::RateLimitGate;
pub use session::{
    Effect, MatchSource, ReconciliationStateMachine, SessionPhase, SessionState,
};
pub use submitter::{JobSubmitter, SubmitterStats};
pub use types::{
    Applicability, AwayParameters, CanonicalMeal, CanonicalPlan, Difficulty, HomeParameters,
    JobKind, JobParameters, JobRequest, Principal, RateLimitStatus, RawResultDocument, Submission,
    SubmitOutcome,
};

#[cfg(feature = "http")]
pub use backend::http::{HttpBackend, PollingResultStreams};
