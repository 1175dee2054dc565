// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for mealcast-sdk.

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

/// Errors raised by configuration, backends and the session plumbing.
#[derive(Debug, Error)]
pub enum SdkError {
    /// Configuration error (missing or invalid values).
    #[error("configuration error: {0}")]
    Config(String),

    /// Transport-level failure talking to the backend.
    #[error("connection error: {0}")]
    Connection(String),

    /// Backend answered with a non-success status.
    #[error("server error [{status}]: {message}")]
    Server { status: u16, message: String },

    /// Backend answered with a body we could not interpret.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// No principal is signed in.
    #[error("no authenticated principal")]
    Unauthenticated,

    /// The session driver is no longer running.
    #[error("session closed")]
    SessionClosed,
}

impl From<serde_json::Error> for SdkError {
    fn from(err: serde_json::Error) -> Self {
        SdkError::Serialization(err.to_string())
    }
}

#[cfg(feature = "http")]
impl From<reqwest::Error> for SdkError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            SdkError::UnexpectedResponse(err.to_string())
        } else {
            SdkError::Connection(err.to_string())
        }
    }
}

/// Result type using SdkError.
pub type Result<T> = std::result::Result<T, SdkError>;

/// Why a job submission did not produce a correlation id.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SubmitError {
    /// Another job is already active for this session. No request was sent.
    #[error("a job is already in flight for this session")]
    AlreadyInFlight,

    /// Backend rejected the job because the quota is exhausted.
    #[error("rate limited, retry after {retry_after_seconds}s")]
    RateLimited { retry_after_seconds: u64 },

    /// Network failure or an unexpected backend status.
    #[error("transport error: {message}")]
    Transport { message: String },

    /// The submission call itself did not settle in time.
    #[error("submission timed out")]
    SubmissionTimedOut,

    /// The caller cancelled the submission.
    #[error("submission cancelled")]
    Cancelled,

    /// No principal is signed in.
    #[error("no authenticated principal")]
    Unauthenticated,

    /// The session driver is no longer running.
    #[error("session closed")]
    SessionClosed,
}

impl SubmitError {
    /// Whether the user can simply try again (immediately or after a countdown).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SubmitError::RateLimited { .. }
                | SubmitError::Transport { .. }
                | SubmitError::SubmissionTimedOut
        )
    }
}

/// Terminal failure recorded in the session's `error` phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionFailure {
    /// Quota exhausted. The session returns to idle once `retry_at` passes.
    RateLimited {
        retry_after_seconds: u64,
        retry_at: DateTime<Utc>,
    },
    /// Submission failed in transport or with an unexpected status.
    Transport { message: String },
    /// The submission call timed out.
    SubmissionTimedOut,
    /// The result wait elapsed without a single document on either stream.
    ResultTimeoutNoData { waited_seconds: u64 },
}

impl SessionFailure {
    /// Map a settled submission error onto a session failure.
    ///
    /// Returns `None` for outcomes that leave no failure behind
    /// (cancellation, guard rejections, a closed session).
    pub fn from_submit(err: &SubmitError, now: DateTime<Utc>) -> Option<Self> {
        match err {
            SubmitError::RateLimited {
                retry_after_seconds,
            } => Some(SessionFailure::RateLimited {
                retry_after_seconds: *retry_after_seconds,
                retry_at: i64::try_from(*retry_after_seconds)
                    .ok()
                    .and_then(chrono::Duration::try_seconds)
                    .and_then(|wait| now.checked_add_signed(wait))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC),
            }),
            SubmitError::Transport { message } => Some(SessionFailure::Transport {
                message: message.clone(),
            }),
            SubmitError::SubmissionTimedOut => Some(SessionFailure::SubmissionTimedOut),
            SubmitError::Unauthenticated => Some(SessionFailure::Transport {
                message: "no authenticated principal".to_string(),
            }),
            SubmitError::AlreadyInFlight | SubmitError::Cancelled | SubmitError::SessionClosed => {
                None
            }
        }
    }

    /// Whether this failure is shown as an error requiring an explicit retry.
    ///
    /// Rate limiting is rendered as a countdown instead.
    pub fn is_user_visible(&self) -> bool {
        !matches!(self, SessionFailure::RateLimited { .. })
    }
}

/// Errors from picking a recovery candidate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectError {
    /// The session is not in recovery mode.
    #[error("session is not recovering (phase: {0})")]
    NotRecovering(&'static str),

    /// The plan id is not among the offered candidates.
    #[error("unknown recovery candidate: {0}")]
    UnknownCandidate(String),

    /// The session driver is no longer running.
    #[error("session closed")]
    SessionClosed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_rate_limited_maps_to_countdown() {
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let failure = SessionFailure::from_submit(
            &SubmitError::RateLimited {
                retry_after_seconds: 30,
            },
            now,
        )
        .unwrap();

        assert_eq!(
            failure,
            SessionFailure::RateLimited {
                retry_after_seconds: 30,
                retry_at: Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 30).unwrap(),
            }
        );
        assert!(!failure.is_user_visible());
    }

    #[test]
    fn test_cancel_leaves_no_failure() {
        let now = Utc::now();
        assert!(SessionFailure::from_submit(&SubmitError::Cancelled, now).is_none());
        assert!(SessionFailure::from_submit(&SubmitError::AlreadyInFlight, now).is_none());
    }

    #[test]
    fn test_retryable_errors() {
        assert!(SubmitError::SubmissionTimedOut.is_retryable());
        assert!(
            SubmitError::Transport {
                message: "reset".into()
            }
            .is_retryable()
        );
        assert!(!SubmitError::AlreadyInFlight.is_retryable());
        assert!(!SubmitError::Cancelled.is_retryable());
    }
}
