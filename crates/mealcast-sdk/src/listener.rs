// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Dual-stream result listener.
//!
//! Subscribes to the home and away result streams of one principal, normalizes
//! every snapshot, and publishes the merged [`RecentPlans`] view. The listener
//! never filters by correlation id; matching is the session's job.

use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::backend::{ResultStreams, SnapshotReceiver};
use crate::error::Result;
use crate::normalize::normalize_snapshot;
use crate::types::{CanonicalPlan, JobKind, Principal};

/// Merged output of both streams.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentPlans {
    /// All normalized plans, newest first. Equal timestamps keep stream order.
    pub plans: Vec<CanonicalPlan>,
    /// Whether any plan was ever seen since the subscription started.
    ///
    /// Counts normalized plans, not raw documents: a stream that only ever
    /// delivers malformed documents leaves this `false`, and the deadline then
    /// reports no data rather than offering an empty recovery.
    pub ever_observed: bool,
    /// Snapshots received from the home stream.
    pub home_snapshots: u64,
    /// Snapshots received from the away stream.
    pub away_snapshots: u64,
}

impl RecentPlans {
    /// The plan carrying `correlation_id`. The newest wins if several do.
    pub fn find_correlated(&self, correlation_id: &str) -> Option<&CanonicalPlan> {
        self.plans.iter().find(|plan| plan.matches(correlation_id))
    }

    /// The `n` most recent plans.
    pub fn top(&self, n: usize) -> Vec<CanonicalPlan> {
        self.plans.iter().take(n).cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }
}

/// Stable sort of both collections by `created_at`, newest first.
pub fn merge(home: &[CanonicalPlan], away: &[CanonicalPlan]) -> Vec<CanonicalPlan> {
    let mut plans: Vec<CanonicalPlan> = home.iter().chain(away.iter()).cloned().collect();
    plans.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    plans
}

#[derive(Default)]
struct Collections {
    /// Bumped on every (re)subscription; updates from older tasks are ignored.
    generation: u64,
    home: Vec<CanonicalPlan>,
    away: Vec<CanonicalPlan>,
    ever_observed: bool,
    home_snapshots: u64,
    away_snapshots: u64,
}

struct ListenerState {
    collections: Mutex<Collections>,
    published: watch::Sender<RecentPlans>,
}

impl ListenerState {
    fn lock(&self) -> MutexGuard<'_, Collections> {
        self.collections.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Replace one stream's collection and republish the merged view.
    fn apply(&self, generation: u64, kind: JobKind, plans: Vec<CanonicalPlan>) {
        let mut c = self.lock();
        if c.generation != generation {
            debug!(kind = %kind, "Ignoring snapshot from a disposed subscription");
            return;
        }

        c.ever_observed |= !plans.is_empty();
        match kind {
            JobKind::Home => {
                c.home = plans;
                c.home_snapshots += 1;
            }
            JobKind::Away => {
                c.away = plans;
                c.away_snapshots += 1;
            }
        }

        let view = RecentPlans {
            plans: merge(&c.home, &c.away),
            ever_observed: c.ever_observed,
            home_snapshots: c.home_snapshots,
            away_snapshots: c.away_snapshots,
        };
        self.published.send_replace(view);
    }

    fn reset(&self) -> u64 {
        let mut c = self.lock();
        let generation = c.generation + 1;
        *c = Collections {
            generation,
            ..Collections::default()
        };
        self.published.send_replace(RecentPlans::default());
        generation
    }
}

/// Handle on a live pair of stream subscriptions.
///
/// Disposing (or dropping) it stops both stream tasks.
pub struct ListenerSubscription {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl ListenerSubscription {
    /// Stop both stream tasks. Idempotent.
    pub fn dispose(&self) {
        if !self.cancel.is_cancelled() {
            debug!("Disposing listener subscription");
            self.cancel.cancel();
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Dispose and wait for both stream tasks to exit.
    pub async fn join(mut self) {
        self.dispose();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}

impl Drop for ListenerSubscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Maintains the merged recent-plans view for the current principal.
pub struct ResultListener {
    streams: Arc<dyn ResultStreams>,
    state: Arc<ListenerState>,
    current: Mutex<Option<CancellationToken>>,
}

impl ResultListener {
    pub fn new(streams: Arc<dyn ResultStreams>) -> Self {
        let (published, _) = watch::channel(RecentPlans::default());
        Self {
            streams,
            state: Arc::new(ListenerState {
                collections: Mutex::new(Collections::default()),
                published,
            }),
            current: Mutex::new(None),
        }
    }

    /// Subscribe both streams for `principal`.
    ///
    /// Any previous subscription is disposed first and the collections start
    /// empty again.
    #[instrument(skip(self, principal), fields(owner_id = %principal.owner_id))]
    pub async fn subscribe(&self, principal: &Principal) -> Result<ListenerSubscription> {
        let cancel = CancellationToken::new();
        {
            let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(previous) = current.replace(cancel.clone()) {
                previous.cancel();
            }
        }
        let generation = self.state.reset();

        let mut tasks = Vec::with_capacity(JobKind::ALL.len());
        for kind in JobKind::ALL {
            let rx = match self.streams.subscribe(principal, kind).await {
                Ok(rx) => rx,
                Err(e) => {
                    cancel.cancel();
                    return Err(e);
                }
            };
            tasks.push(tokio::spawn(run_stream(
                Arc::clone(&self.state),
                generation,
                kind,
                rx,
                cancel.clone(),
            )));
        }

        info!(generation, "Listening to result streams");
        Ok(ListenerSubscription { cancel, tasks })
    }

    /// Receiver of the merged view. Always holds the latest value.
    pub fn recent_plans(&self) -> watch::Receiver<RecentPlans> {
        self.state.published.subscribe()
    }

    /// Current merged view.
    pub fn snapshot(&self) -> RecentPlans {
        self.state.published.borrow().clone()
    }
}

async fn run_stream(
    state: Arc<ListenerState>,
    generation: u64,
    kind: JobKind,
    mut rx: SnapshotReceiver,
    cancel: CancellationToken,
) {
    debug!(kind = %kind, generation, "Stream task started");

    // A subscription may already hold documents written before we attached.
    let initial = rx.borrow_and_update().clone();
    if !initial.is_empty() {
        state.apply(generation, kind, normalize_snapshot(&initial, kind));
    }

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!(kind = %kind, "Stream task cancelled");
                break;
            }

            changed = rx.changed() => {
                if changed.is_err() {
                    warn!(kind = %kind, "Result stream closed");
                    break;
                }
                let docs = rx.borrow_and_update().clone();
                let plans = normalize_snapshot(&docs, kind);
                debug!(kind = %kind, documents = docs.len(), plans = plans.len(), "Snapshot received");
                state.apply(generation, kind, plans);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn plan(id: &str, kind: JobKind, created_ms: i64) -> CanonicalPlan {
        CanonicalPlan {
            id: id.to_string(),
            kind,
            title: String::new(),
            greeting: String::new(),
            meals: Vec::new(),
            created_at: Utc.timestamp_millis_opt(created_ms).unwrap(),
            correlation_id: Some(format!("corr-{}", id)),
        }
    }

    #[test]
    fn test_merge_sorts_newest_first() {
        let home = vec![plan("h1", JobKind::Home, 1_000), plan("h2", JobKind::Home, 3_000)];
        let away = vec![plan("a1", JobKind::Away, 2_000)];

        let ids: Vec<String> = merge(&home, &away).into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec!["h2", "a1", "h1"]);
    }

    #[test]
    fn test_merge_ties_keep_stream_order() {
        let home = vec![plan("h1", JobKind::Home, 1_000)];
        let away = vec![plan("a1", JobKind::Away, 1_000), plan("a2", JobKind::Away, 1_000)];

        let ids: Vec<String> = merge(&home, &away).into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec!["h1", "a1", "a2"]);
    }

    #[test]
    fn test_recent_plans_lookup() {
        let recent = RecentPlans {
            plans: merge(&[plan("h1", JobKind::Home, 5)], &[plan("a1", JobKind::Away, 9)]),
            ever_observed: true,
            home_snapshots: 1,
            away_snapshots: 1,
        };

        assert_eq!(recent.find_correlated("corr-h1").unwrap().id, "h1");
        assert!(recent.find_correlated("corr-zz").is_none());
        assert_eq!(recent.top(1)[0].id, "a1");
        assert_eq!(recent.top(10).len(), 2);
    }
}
