// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Advisory quota gate.
//!
//! The gate caches the server-reported [`RateLimitStatus`] and answers "may I
//! submit now?" without a round trip. It is advisory only: the submission call
//! stays the source of truth, and a gate that cannot reach the backend lets
//! submissions through.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::auth::PrincipalProvider;
use crate::backend::JobBackend;
use crate::error::{Result, SdkError};
use crate::types::RateLimitStatus;

#[derive(Debug, Clone)]
struct CachedStatus {
    status: RateLimitStatus,
    fetched_at: Instant,
    /// Set when the last refresh failed and this value is older news.
    stale: bool,
}

/// Cached, periodically refreshed view of the caller's quota.
pub struct RateLimitGate {
    backend: Arc<dyn JobBackend>,
    principals: Arc<dyn PrincipalProvider>,
    poll_interval: Duration,
    cache: RwLock<Option<CachedStatus>>,
    /// Serializes refreshes; the cache has a single writer at a time.
    refresh_lock: Mutex<()>,
    polling: AtomicBool,
}

impl RateLimitGate {
    pub fn new(
        backend: Arc<dyn JobBackend>,
        principals: Arc<dyn PrincipalProvider>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            backend,
            principals,
            poll_interval,
            cache: RwLock::new(None),
            refresh_lock: Mutex::new(()),
            polling: AtomicBool::new(true),
        }
    }

    /// Current status, served from cache while younger than the poll interval.
    pub async fn check(&self) -> Result<RateLimitStatus> {
        if let Some(cached) = self.cache.read().await.as_ref()
            && !cached.stale
            && cached.fetched_at.elapsed() < self.poll_interval
        {
            return Ok(cached.status.clone());
        }
        self.refresh().await
    }

    /// Invalidate the cache and re-read the status.
    ///
    /// On failure the previous value is kept (marked stale) and returned if
    /// there is one.
    #[instrument(skip(self))]
    pub async fn refresh(&self) -> Result<RateLimitStatus> {
        let _writer = self.refresh_lock.lock().await;

        let principal = self.principals.principal().ok_or(SdkError::Unauthenticated)?;

        match self.backend.rate_limit_status(&principal).await {
            Ok(status) => {
                debug!(
                    remaining = status.remaining,
                    can_submit_now = status.can_submit_now,
                    "Rate limit status refreshed"
                );
                *self.cache.write().await = Some(CachedStatus {
                    status: status.clone(),
                    fetched_at: Instant::now(),
                    stale: false,
                });
                Ok(status)
            }
            Err(e) => {
                let mut cache = self.cache.write().await;
                match cache.as_mut() {
                    Some(cached) => {
                        warn!(error = %e, "Rate limit refresh failed, keeping previous status");
                        cached.stale = true;
                        Ok(cached.status.clone())
                    }
                    None => {
                        warn!(error = %e, "Rate limit refresh failed, no status known");
                        Err(e)
                    }
                }
            }
        }
    }

    /// Whether a submission is currently allowed. `true` when nothing is known.
    pub async fn can_submit(&self) -> bool {
        match self.check().await {
            Ok(status) => status.allows_submission(Utc::now()),
            Err(e) => {
                debug!(error = %e, "No rate limit status, allowing submission");
                true
            }
        }
    }

    /// Seconds until the next allowed submission, `0` when unknown.
    pub async fn seconds_until_next_allowed(&self) -> u64 {
        self.check()
            .await
            .map(|status| status.seconds_until_next_allowed(Utc::now()))
            .unwrap_or(0)
    }

    /// Last known status without touching the backend.
    pub async fn cached(&self) -> Option<RateLimitStatus> {
        self.cache.read().await.as_ref().map(|c| c.status.clone())
    }

    /// Pause or resume the background poller.
    pub fn set_polling(&self, enabled: bool) {
        if self.polling.swap(enabled, Ordering::AcqRel) != enabled {
            debug!(enabled, "Rate limit polling toggled");
        }
    }

    pub fn is_polling(&self) -> bool {
        self.polling.load(Ordering::Acquire)
    }

    /// Spawn the background poller. Runs until `cancel` fires.
    pub fn spawn_poller(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let gate = Arc::clone(self);
        let interval = self.poll_interval;

        tokio::spawn(async move {
            debug!(
                interval_ms = interval.as_millis() as u64,
                "Rate limit poller started"
            );

            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        debug!("Rate limit poller cancelled");
                        break;
                    }

                    _ = tokio::time::sleep(interval) => {
                        if !gate.is_polling() || gate.principals.principal().is_none() {
                            continue;
                        }
                        if let Err(e) = gate.refresh().await {
                            debug!(error = %e, "Background rate limit poll failed");
                        }
                    }
                }
            }
        })
    }
}
