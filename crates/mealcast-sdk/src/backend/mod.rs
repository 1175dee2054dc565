// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Backend collaborators.
//!
//! The orchestrator talks to two things it does not control:
//! - a job backend that accepts submissions and reports quota status
//! - a pair of result streams the worker appends documents to
//!
//! Implementations:
//! - `http`: reqwest-based job backend plus a polling result-stream adapter
//! - `memory`: in-process backend for embedded use and tests

#[cfg(feature = "http")]
pub mod http;

pub mod memory;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::Result;
use crate::types::{JobKind, Principal, RateLimitStatus, RawResultDocument};

/// How the backend answered a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionResponse {
    /// 2xx. The backend may echo the correlation id it stored.
    Accepted { correlation_id: Option<String> },
    /// 429. Quota exhausted.
    RateLimited { retry_after_seconds: u64 },
    /// Any other non-success status.
    Rejected { status: u16, message: String },
}

/// Submission and quota endpoints.
///
/// Transport failures are returned as `Err`; every answer the backend actually
/// gave is a [`SubmissionResponse`].
#[async_trait]
pub trait JobBackend: Send + Sync {
    /// Write a job. `payload` is the serialized [`JobRequest`](crate::JobRequest).
    async fn submit_job(
        &self,
        principal: &Principal,
        payload: &serde_json::Value,
    ) -> Result<SubmissionResponse>;

    /// Read the principal's quota status.
    async fn rate_limit_status(&self, principal: &Principal) -> Result<RateLimitStatus>;
}

/// Receives full snapshots of one result stream. Each value replaces the last.
pub type SnapshotReceiver = watch::Receiver<Vec<RawResultDocument>>;

/// Realtime result streams, one per job kind, scoped to an owner.
#[async_trait]
pub trait ResultStreams: Send + Sync {
    /// Open a subscription. Dropping the receiver ends it.
    async fn subscribe(&self, principal: &Principal, kind: JobKind) -> Result<SnapshotReceiver>;
}
