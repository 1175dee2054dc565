// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process backend.
//!
//! Serves both collaborator traits from memory. Submissions answer from a
//! script (accepting by default), quota status is whatever was last set, and
//! result streams are fed explicitly with [`InMemoryBackend::push_snapshot`].
//! Used for embedded deployments and throughout the test suite.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::debug;

use super::{JobBackend, ResultStreams, SnapshotReceiver, SubmissionResponse};
use crate::error::{Result, SdkError};
use crate::types::{JobKind, Principal, RateLimitStatus, RawResultDocument};

/// One scripted answer to a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedResponse {
    /// 2xx without a body.
    Accept,
    /// 2xx echoing this correlation id.
    AcceptWithId(String),
    /// 429 with this retry-after.
    RateLimited(u64),
    /// Non-success status.
    Reject(u16, String),
    /// Transport failure.
    Fail(String),
    /// Never answers. Only cancellation or a timeout settles the call.
    Hang,
}

#[derive(Default)]
struct Inner {
    script: VecDeque<ScriptedResponse>,
    submissions: Vec<serde_json::Value>,
    status: Option<RateLimitStatus>,
    status_failure: Option<String>,
    status_reads: usize,
    streams: HashMap<(String, JobKind), watch::Sender<Vec<RawResultDocument>>>,
}

/// In-memory job backend and result streams.
#[derive(Clone, Default)]
pub struct InMemoryBackend {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue the answer to the next unanswered submission.
    pub fn script(&self, response: ScriptedResponse) {
        self.lock().script.push_back(response);
    }

    /// Set the quota status returned from now on.
    pub fn set_rate_limit_status(&self, status: RateLimitStatus) {
        let mut inner = self.lock();
        inner.status = Some(status);
        inner.status_failure = None;
    }

    /// Make quota reads fail until a status is set again.
    pub fn fail_rate_limit_status(&self, message: impl Into<String>) {
        self.lock().status_failure = Some(message.into());
    }

    /// Replace the full content of one owner's stream.
    pub fn push_snapshot(&self, owner_id: &str, kind: JobKind, docs: Vec<RawResultDocument>) {
        let mut inner = self.lock();
        let sender = inner
            .streams
            .entry((owner_id.to_string(), kind))
            .or_insert_with(|| watch::channel(Vec::new()).0);
        debug!(owner_id, kind = %kind, documents = docs.len(), "Pushing snapshot");
        sender.send_replace(docs);
    }

    /// Number of submissions that reached the backend.
    pub fn submission_count(&self) -> usize {
        self.lock().submissions.len()
    }

    /// Payloads of every submission that reached the backend, oldest first.
    pub fn submissions(&self) -> Vec<serde_json::Value> {
        self.lock().submissions.clone()
    }

    /// Number of quota reads served.
    pub fn status_reads(&self) -> usize {
        self.lock().status_reads
    }

    /// Number of live receivers on one owner's stream.
    pub fn subscriber_count(&self, owner_id: &str, kind: JobKind) -> usize {
        self.lock()
            .streams
            .get(&(owner_id.to_string(), kind))
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl JobBackend for InMemoryBackend {
    async fn submit_job(
        &self,
        _principal: &Principal,
        payload: &serde_json::Value,
    ) -> Result<SubmissionResponse> {
        let next = {
            let mut inner = self.lock();
            inner.submissions.push(payload.clone());
            inner.script.pop_front().unwrap_or(ScriptedResponse::Accept)
        };

        match next {
            ScriptedResponse::Accept => Ok(SubmissionResponse::Accepted {
                correlation_id: None,
            }),
            ScriptedResponse::AcceptWithId(id) => Ok(SubmissionResponse::Accepted {
                correlation_id: Some(id),
            }),
            ScriptedResponse::RateLimited(retry_after_seconds) => {
                Ok(SubmissionResponse::RateLimited {
                    retry_after_seconds,
                })
            }
            ScriptedResponse::Reject(status, message) => {
                Ok(SubmissionResponse::Rejected { status, message })
            }
            ScriptedResponse::Fail(message) => Err(SdkError::Connection(message)),
            ScriptedResponse::Hang => {
                std::future::pending::<()>().await;
                Err(SdkError::Connection("unreachable".to_string()))
            }
        }
    }

    async fn rate_limit_status(&self, _principal: &Principal) -> Result<RateLimitStatus> {
        let mut inner = self.lock();
        inner.status_reads += 1;
        if let Some(message) = &inner.status_failure {
            return Err(SdkError::Connection(message.clone()));
        }
        inner
            .status
            .clone()
            .ok_or_else(|| SdkError::Server {
                status: 404,
                message: "no rate limit status".to_string(),
            })
    }
}

#[async_trait]
impl ResultStreams for InMemoryBackend {
    async fn subscribe(&self, principal: &Principal, kind: JobKind) -> Result<SnapshotReceiver> {
        let mut inner = self.lock();
        let sender = inner
            .streams
            .entry((principal.owner_id.clone(), kind))
            .or_insert_with(|| watch::channel(Vec::new()).0);
        Ok(sender.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn principal() -> Principal {
        Principal::new("owner", "token")
    }

    #[tokio::test]
    async fn test_script_is_consumed_in_order() {
        let backend = InMemoryBackend::new();
        backend.script(ScriptedResponse::RateLimited(5));

        let first = backend.submit_job(&principal(), &json!({})).await.unwrap();
        let second = backend.submit_job(&principal(), &json!({})).await.unwrap();

        assert_eq!(
            first,
            SubmissionResponse::RateLimited {
                retry_after_seconds: 5
            }
        );
        assert_eq!(
            second,
            SubmissionResponse::Accepted {
                correlation_id: None
            }
        );
        assert_eq!(backend.submission_count(), 2);
    }

    #[tokio::test]
    async fn test_snapshot_reaches_existing_subscriber() {
        let backend = InMemoryBackend::new();
        let mut rx = backend.subscribe(&principal(), JobKind::Home).await.unwrap();

        backend.push_snapshot("owner", JobKind::Home, vec![json!({"id": 1})]);
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().len(), 1);
    }

    #[tokio::test]
    async fn test_streams_are_scoped_by_owner_and_kind() {
        let backend = InMemoryBackend::new();
        backend.push_snapshot("owner", JobKind::Away, vec![json!({})]);

        let home = backend.subscribe(&principal(), JobKind::Home).await.unwrap();
        let away = backend.subscribe(&principal(), JobKind::Away).await.unwrap();
        let other = backend
            .subscribe(&Principal::new("someone-else", "t"), JobKind::Away)
            .await
            .unwrap();

        assert!(home.borrow().is_empty());
        assert_eq!(away.borrow().len(), 1);
        assert!(other.borrow().is_empty());
    }

    #[tokio::test]
    async fn test_missing_status_is_an_error() {
        let backend = InMemoryBackend::new();
        assert!(backend.rate_limit_status(&principal()).await.is_err());

        backend.set_rate_limit_status(RateLimitStatus::open(3));
        assert_eq!(
            backend.rate_limit_status(&principal()).await.unwrap().remaining,
            3
        );
        assert_eq!(backend.status_reads(), 2);
    }
}
