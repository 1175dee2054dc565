// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP backend.
//!
//! Endpoints, relative to the configured base URL:
//! - `POST /jobs`: submit a job (bearer auth)
//! - `GET /rate-limit`: quota status of the caller
//! - `GET /results/{kind}?ownerId=`: current result documents of one stream

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::RETRY_AFTER;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, instrument, warn};

use super::{JobBackend, ResultStreams, SnapshotReceiver, SubmissionResponse};
use crate::config::OrchestratorConfig;
use crate::error::{Result, SdkError};
use crate::types::{JobKind, Principal, RateLimitStatus, RawResultDocument};

const USER_AGENT: &str = concat!("mealcast-sdk/", env!("CARGO_PKG_VERSION"));

/// Applied when a 429 carries neither a body hint nor a `Retry-After` header.
const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

fn build_client(connect_timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(connect_timeout)
        .build()
        .map_err(|e| SdkError::Config(format!("failed to build HTTP client: {}", e)))
}

fn base_url(raw: &str) -> String {
    raw.trim_end_matches('/').to_string()
}

/// Job backend speaking JSON over HTTP.
#[derive(Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBackend {
    /// Create a backend for `config.api_url`.
    pub fn new(config: &OrchestratorConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(config.connect_timeout)?,
            base_url: base_url(&config.api_url),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

/// `retryAfterSeconds` in the body wins over the header.
fn retry_after_seconds(header: Option<&str>, body: &str) -> u64 {
    let from_body = serde_json::from_str::<Value>(body).ok().and_then(|v| {
        ["retryAfterSeconds", "retry_after_seconds", "retryAfter"]
            .iter()
            .find_map(|key| v.get(*key).and_then(Value::as_u64))
    });
    from_body
        .or_else(|| header.and_then(|h| h.trim().parse::<u64>().ok()))
        .unwrap_or(DEFAULT_RETRY_AFTER_SECS)
}

fn accepted_correlation_id(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    ["correlationId", "correlation_id"]
        .iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str))
        .map(str::to_string)
}

#[async_trait]
impl JobBackend for HttpBackend {
    #[instrument(skip(self, principal, payload), fields(owner_id = %principal.owner_id))]
    async fn submit_job(
        &self,
        principal: &Principal,
        payload: &Value,
    ) -> Result<SubmissionResponse> {
        let url = format!("{}/jobs", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&principal.bearer_token)
            .json(payload)
            .send()
            .await?;

        let status = response.status();
        let retry_header = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|h| h.to_str().ok())
            .map(str::to_string);
        let body = response.text().await.unwrap_or_default();

        debug!(status = status.as_u16(), "Submission answered");

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Ok(SubmissionResponse::RateLimited {
                retry_after_seconds: retry_after_seconds(retry_header.as_deref(), &body),
            });
        }

        if status.is_success() {
            return Ok(SubmissionResponse::Accepted {
                correlation_id: accepted_correlation_id(&body),
            });
        }

        Ok(SubmissionResponse::Rejected {
            status: status.as_u16(),
            message: if body.is_empty() {
                status.canonical_reason().unwrap_or("unknown").to_string()
            } else {
                body
            },
        })
    }

    #[instrument(skip(self, principal), fields(owner_id = %principal.owner_id))]
    async fn rate_limit_status(&self, principal: &Principal) -> Result<RateLimitStatus> {
        let url = format!("{}/rate-limit", self.base_url);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&principal.bearer_token)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(SdkError::Server {
                status: status.as_u16(),
                message,
            });
        }

        Ok(response.json::<RateLimitStatus>().await?)
    }
}

/// Result streams emulated by polling the results endpoint.
///
/// Each subscription owns a task that re-reads the stream every
/// `poll_interval` and publishes a new snapshot only when the documents
/// changed. The task exits once the receiver is dropped.
#[derive(Clone)]
pub struct PollingResultStreams {
    client: reqwest::Client,
    base_url: String,
    poll_interval: Duration,
}

impl PollingResultStreams {
    pub fn new(config: &OrchestratorConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(config.connect_timeout)?,
            base_url: base_url(&config.api_url),
            poll_interval: config.stream_poll_interval,
        })
    }

    async fn fetch(
        client: &reqwest::Client,
        url: &str,
        principal: &Principal,
    ) -> Result<Vec<RawResultDocument>> {
        let response = client
            .get(url)
            .query(&[("ownerId", principal.owner_id.as_str())])
            .bearer_auth(&principal.bearer_token)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(SdkError::Server {
                status: status.as_u16(),
                message,
            });
        }

        documents_from_body(response.json::<Value>().await?)
    }
}

/// Accepts a bare array or an object wrapping it in `documents`/`results`.
fn documents_from_body(body: Value) -> Result<Vec<RawResultDocument>> {
    match body {
        Value::Array(docs) => Ok(docs),
        Value::Object(mut map) => ["documents", "results"]
            .iter()
            .find_map(|key| match map.remove(*key) {
                Some(Value::Array(docs)) => Some(docs),
                _ => None,
            })
            .ok_or_else(|| {
                SdkError::UnexpectedResponse("result body has no documents array".to_string())
            }),
        other => Err(SdkError::UnexpectedResponse(format!(
            "result body is not a list: {}",
            other
        ))),
    }
}

#[async_trait]
impl ResultStreams for PollingResultStreams {
    async fn subscribe(&self, principal: &Principal, kind: JobKind) -> Result<SnapshotReceiver> {
        let (tx, rx) = watch::channel(Vec::new());
        let client = self.client.clone();
        let url = format!("{}/results/{}", self.base_url, kind);
        let principal = principal.clone();
        let interval = self.poll_interval;

        tokio::spawn(async move {
            debug!(kind = %kind, interval_ms = interval.as_millis() as u64, "Result poller started");

            loop {
                match PollingResultStreams::fetch(&client, &url, &principal).await {
                    Ok(docs) => {
                        tx.send_if_modified(|current| {
                            if *current == docs {
                                false
                            } else {
                                *current = docs;
                                true
                            }
                        });
                    }
                    Err(e) => warn!(kind = %kind, error = %e, "Failed to poll result stream"),
                }

                tokio::select! {
                    biased;

                    _ = tx.closed() => {
                        debug!(kind = %kind, "Result poller stopped");
                        break;
                    }

                    _ = tokio::time::sleep(interval) => {}
                }
            }
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_retry_after_prefers_body() {
        assert_eq!(retry_after_seconds(Some("10"), r#"{"retryAfterSeconds": 42}"#), 42);
        assert_eq!(retry_after_seconds(Some("10"), "Too Many Requests"), 10);
        assert_eq!(retry_after_seconds(None, ""), DEFAULT_RETRY_AFTER_SECS);
    }

    #[test]
    fn test_accepted_correlation_id() {
        assert_eq!(
            accepted_correlation_id(r#"{"correlationId": "abc"}"#).as_deref(),
            Some("abc")
        );
        assert!(accepted_correlation_id("").is_none());
    }

    #[test]
    fn test_documents_from_body_shapes() {
        assert_eq!(documents_from_body(json!([{"a": 1}])).unwrap().len(), 1);
        assert_eq!(
            documents_from_body(json!({"documents": [{}, {}]})).unwrap().len(),
            2
        );
        assert_eq!(documents_from_body(json!({"results": []})).unwrap().len(), 0);
        assert!(documents_from_body(json!({"other": []})).is_err());
        assert!(documents_from_body(json!("nope")).is_err());
    }

    #[test]
    fn test_base_url_trims_trailing_slash() {
        let config = OrchestratorConfig::new().with_api_url("http://localhost:9000/api/");
        let backend = HttpBackend::new(&config).unwrap();
        assert_eq!(backend.base_url(), "http://localhost:9000/api");
    }
}
