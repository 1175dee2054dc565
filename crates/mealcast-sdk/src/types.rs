// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! High-level types for the SDK.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque backend-shaped payload from either result stream.
pub type RawResultDocument = serde_json::Value;

/// Which worker pipeline (and result stream) a job belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Cook at home: recipes built from the pantry.
    Home,
    /// Eat out: restaurant recommendations.
    Away,
}

impl JobKind {
    /// Both kinds, in stream order.
    pub const ALL: [JobKind; 2] = [JobKind::Home, JobKind::Away];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Home => "home",
            JobKind::Away => "away",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "home" => Ok(JobKind::Home),
            "away" => Ok(JobKind::Away),
            other => Err(format!("unknown job kind '{}' (expected home or away)", other)),
        }
    }
}

/// Parameters for a cook-at-home plan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HomeParameters {
    /// Requested slots, e.g. "breakfast", "dinner".
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub meal_types: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub servings: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pantry_items: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dietary_preferences: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_minutes: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cuisine: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Parameters for an eat-out recommendation. Coordinates come from the caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwayParameters {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub radius_km: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cuisine: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dietary_preferences: Vec<String>,
}

/// Job parameters, one variant per job kind.
///
/// Serialized without a tag; the kind travels next to it in [`JobRequest`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum JobParameters {
    Home(HomeParameters),
    Away(AwayParameters),
}

impl JobParameters {
    pub fn kind(&self) -> JobKind {
        match self {
            JobParameters::Home(_) => JobKind::Home,
            JobParameters::Away(_) => JobKind::Away,
        }
    }
}

impl From<HomeParameters> for JobParameters {
    fn from(params: HomeParameters) -> Self {
        JobParameters::Home(params)
    }
}

impl From<AwayParameters> for JobParameters {
    fn from(params: AwayParameters) -> Self {
        JobParameters::Away(params)
    }
}

/// A job as written to the submission endpoint.
///
/// Built once per submission and never mutated afterwards. `correlation_id`
/// is the only join key between this request and its eventual result.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRequest {
    pub correlation_id: String,
    pub submitted_at: DateTime<Utc>,
    pub owner_id: String,
    pub kind: JobKind,
    pub parameters: JobParameters,
}

impl JobRequest {
    /// Create a job with a fresh client-generated correlation id.
    pub fn new(owner_id: impl Into<String>, parameters: JobParameters) -> Self {
        Self {
            correlation_id: uuid::Uuid::new_v4().to_string(),
            submitted_at: Utc::now(),
            owner_id: owner_id.into(),
            kind: parameters.kind(),
            parameters,
        }
    }

    /// JSON body sent to the submission endpoint.
    pub fn to_payload(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self)
    }
}

/// Recipe difficulty, or the venue sentinel for eat-out recommendations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
    /// The backend did not say.
    Unrated,
    /// The meal is served at an external venue; difficulty is meaningless.
    ExternalVenue,
}

impl Difficulty {
    /// Lenient parse of backend difficulty labels.
    pub fn parse(label: &str) -> Difficulty {
        match label.trim().to_ascii_lowercase().as_str() {
            "easy" | "simple" | "beginner" | "low" => Difficulty::Easy,
            "medium" | "moderate" | "intermediate" | "normal" => Difficulty::Medium,
            "hard" | "difficult" | "advanced" | "high" => Difficulty::Hard,
            _ => Difficulty::Unrated,
        }
    }
}

/// A value that may be unknown, or that does not apply to this kind of meal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Applicability<T> {
    Known(T),
    Unknown,
    NotApplicable,
}

impl<T> Applicability<T> {
    pub fn known(&self) -> Option<&T> {
        match self {
            Applicability::Known(value) => Some(value),
            _ => None,
        }
    }
}

/// One meal (or venue) in the canonical model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalMeal {
    pub label: String,
    pub title: String,
    pub estimated_time: Applicability<String>,
    pub difficulty: Difficulty,
    pub calories_per_serving: Applicability<u32>,
    pub pantry_match_note: String,
    pub ingredients: Vec<String>,
    pub steps: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cuisine: Option<String>,
}

/// A normalized result document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalPlan {
    pub id: String,
    pub kind: JobKind,
    pub title: String,
    pub greeting: String,
    pub meals: Vec<CanonicalMeal>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl CanonicalPlan {
    /// Exact correlation-id equality.
    pub fn matches(&self, correlation_id: &str) -> bool {
        self.correlation_id.as_deref() == Some(correlation_id)
    }
}

/// Server-reported quota status. Advisory only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitStatus {
    pub requests_in_window: u32,
    pub remaining: u32,
    pub can_submit_now: bool,
    #[serde(default)]
    pub next_available_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_seconds: Option<u64>,
}

impl RateLimitStatus {
    /// Status of a fresh window with `limit` requests available.
    pub fn open(limit: u32) -> Self {
        Self {
            requests_in_window: 0,
            remaining: limit,
            can_submit_now: true,
            next_available_at: None,
            limit: Some(limit),
            window_seconds: None,
        }
    }

    /// Whether a submission is allowed at `now`. A `next_available_at` that
    /// has already passed counts as allowed even if the flag is stale.
    pub fn allows_submission(&self, now: DateTime<Utc>) -> bool {
        self.can_submit_now || self.next_available_at.is_some_and(|at| at <= now)
    }

    /// Whole seconds until the next submission is allowed, rounded up.
    pub fn seconds_until_next_allowed(&self, now: DateTime<Utc>) -> u64 {
        if self.can_submit_now {
            return 0;
        }
        match self.next_available_at {
            Some(at) if at > now => {
                let millis = (at - now).num_milliseconds().max(0) as u64;
                millis.div_ceil(1000)
            }
            _ => 0,
        }
    }
}

/// The signed-in identity: owner id plus the bearer token for backend calls.
#[derive(Clone, PartialEq, Eq)]
pub struct Principal {
    pub owner_id: String,
    pub bearer_token: String,
}

impl Principal {
    pub fn new(owner_id: impl Into<String>, bearer_token: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            bearer_token: bearer_token.into(),
        }
    }
}

impl fmt::Debug for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Principal")
            .field("owner_id", &self.owner_id)
            .field("bearer_token", &"<redacted>")
            .finish()
    }
}

/// An accepted submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub correlation_id: String,
    pub kind: JobKind,
    /// When the result wait gives up.
    pub deadline_at: DateTime<Utc>,
}

/// What `Orchestrator::submit` resolves to.
pub type SubmitOutcome = std::result::Result<Submission, crate::error::SubmitError>;
