// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for the orchestrator.

use std::time::Duration;

use crate::error::{Result, SdkError};
use crate::types::JobKind;

const DEFAULT_API_URL: &str = "http://127.0.0.1:8080";

/// Configuration for the [`Orchestrator`](crate::Orchestrator).
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    /// Backend base URL (HTTP backend only).
    pub api_url: String,
    /// Timeout for the submission call itself.
    pub submit_timeout: Duration,
    /// How long to wait for a correlated result after submission.
    pub result_timeout: Duration,
    /// Override of `result_timeout` for home jobs.
    pub home_result_timeout: Option<Duration>,
    /// Override of `result_timeout` for away jobs.
    pub away_result_timeout: Option<Duration>,
    /// Quota status refresh interval while idle.
    pub rate_limit_poll_interval: Duration,
    /// Poll interval of the HTTP result-stream adapter.
    pub stream_poll_interval: Duration,
    /// How many recent plans to offer in recovery.
    pub recovery_candidates: usize,
    /// Consult the quota status before submitting.
    pub preflight_rate_limit: bool,
    /// HTTP connect timeout.
    pub connect_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            submit_timeout: Duration::from_secs(30),
            result_timeout: Duration::from_secs(60),
            home_result_timeout: None,
            away_result_timeout: None,
            rate_limit_poll_interval: Duration::from_secs(15),
            stream_poll_interval: Duration::from_secs(2),
            recovery_candidates: 5,
            preflight_rate_limit: true,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

fn env_millis(name: &str, default: u64) -> Result<Duration> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|e| SdkError::Config(format!("invalid {}: {}", name, e))),
        Err(_) => Ok(Duration::from_millis(default)),
    }
}

fn env_optional_millis(name: &str) -> Result<Option<Duration>> {
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<u64>()
            .map(|ms| Some(Duration::from_millis(ms)))
            .map_err(|e| SdkError::Config(format!("invalid {}: {}", name, e))),
        _ => Ok(None),
    }
}

impl OrchestratorConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a configuration from environment variables.
    ///
    /// Environment variables:
    /// - `MEALCAST_API_URL`: Backend base URL (default: "http://127.0.0.1:8080")
    /// - `MEALCAST_SUBMIT_TIMEOUT_MS`: Submission timeout (default: 30000)
    /// - `MEALCAST_RESULT_TIMEOUT_MS`: Result wait for both kinds (default: 60000)
    /// - `MEALCAST_HOME_RESULT_TIMEOUT_MS`: Result wait override for home jobs
    /// - `MEALCAST_AWAY_RESULT_TIMEOUT_MS`: Result wait override for away jobs
    /// - `MEALCAST_RATE_LIMIT_POLL_INTERVAL_MS`: Quota poll interval (default: 15000)
    /// - `MEALCAST_STREAM_POLL_INTERVAL_MS`: HTTP result poll interval (default: 2000)
    /// - `MEALCAST_RECOVERY_CANDIDATES`: Plans offered in recovery (default: 5)
    /// - `MEALCAST_PREFLIGHT_RATE_LIMIT`: Check quota before submitting (default: "true")
    pub fn from_env() -> Result<Self> {
        let api_url =
            std::env::var("MEALCAST_API_URL").unwrap_or_else(|_| DEFAULT_API_URL.to_string());

        let recovery_candidates: usize = std::env::var("MEALCAST_RECOVERY_CANDIDATES")
            .unwrap_or_else(|_| "5".to_string())
            .trim()
            .parse()
            .map_err(|e| SdkError::Config(format!("invalid MEALCAST_RECOVERY_CANDIDATES: {}", e)))?;

        let preflight_rate_limit = std::env::var("MEALCAST_PREFLIGHT_RATE_LIMIT")
            .map(|v| v.to_lowercase() == "true" || v == "1")
            .unwrap_or(true);

        let config = Self {
            api_url,
            submit_timeout: env_millis("MEALCAST_SUBMIT_TIMEOUT_MS", 30_000)?,
            result_timeout: env_millis("MEALCAST_RESULT_TIMEOUT_MS", 60_000)?,
            home_result_timeout: env_optional_millis("MEALCAST_HOME_RESULT_TIMEOUT_MS")?,
            away_result_timeout: env_optional_millis("MEALCAST_AWAY_RESULT_TIMEOUT_MS")?,
            rate_limit_poll_interval: env_millis("MEALCAST_RATE_LIMIT_POLL_INTERVAL_MS", 15_000)?,
            stream_poll_interval: env_millis("MEALCAST_STREAM_POLL_INTERVAL_MS", 2_000)?,
            recovery_candidates,
            preflight_rate_limit,
            connect_timeout: Duration::from_secs(10),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values the orchestrator cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.api_url.trim().is_empty() {
            return Err(SdkError::Config("api_url must not be empty".to_string()));
        }
        if self.recovery_candidates == 0 {
            return Err(SdkError::Config(
                "recovery_candidates must be at least 1".to_string(),
            ));
        }
        if self.rate_limit_poll_interval.is_zero() || self.stream_poll_interval.is_zero() {
            return Err(SdkError::Config(
                "poll intervals must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Result wait for `kind`, honouring per-kind overrides.
    pub fn result_timeout_for(&self, kind: JobKind) -> Duration {
        let override_timeout = match kind {
            JobKind::Home => self.home_result_timeout,
            JobKind::Away => self.away_result_timeout,
        };
        override_timeout.unwrap_or(self.result_timeout)
    }

    /// Set the backend base URL.
    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = url.into();
        self
    }

    /// Set the submission timeout.
    pub fn with_submit_timeout(mut self, timeout: Duration) -> Self {
        self.submit_timeout = timeout;
        self
    }

    /// Set the result wait for both kinds.
    pub fn with_result_timeout(mut self, timeout: Duration) -> Self {
        self.result_timeout = timeout;
        self
    }

    /// Override the result wait for one kind.
    pub fn with_result_timeout_for(mut self, kind: JobKind, timeout: Duration) -> Self {
        match kind {
            JobKind::Home => self.home_result_timeout = Some(timeout),
            JobKind::Away => self.away_result_timeout = Some(timeout),
        }
        self
    }

    pub fn with_rate_limit_poll_interval(mut self, interval: Duration) -> Self {
        self.rate_limit_poll_interval = interval;
        self
    }

    pub fn with_stream_poll_interval(mut self, interval: Duration) -> Self {
        self.stream_poll_interval = interval;
        self
    }

    pub fn with_recovery_candidates(mut self, count: usize) -> Self {
        self.recovery_candidates = count;
        self
    }

    /// Enable or disable the pre-flight quota check.
    pub fn with_preflight_rate_limit(mut self, enabled: bool) -> Self {
        self.preflight_rate_limit = enabled;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.api_url, "http://127.0.0.1:8080");
        assert_eq!(config.submit_timeout, Duration::from_secs(30));
        assert_eq!(config.result_timeout, Duration::from_secs(60));
        assert_eq!(config.recovery_candidates, 5);
        assert!(config.preflight_rate_limit);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_methods() {
        let config = OrchestratorConfig::new()
            .with_api_url("https://api.example.com")
            .with_submit_timeout(Duration::from_secs(5))
            .with_result_timeout(Duration::from_secs(90))
            .with_rate_limit_poll_interval(Duration::from_secs(1))
            .with_stream_poll_interval(Duration::from_millis(500))
            .with_recovery_candidates(3)
            .with_preflight_rate_limit(false);

        assert_eq!(config.api_url, "https://api.example.com");
        assert_eq!(config.submit_timeout, Duration::from_secs(5));
        assert_eq!(config.result_timeout, Duration::from_secs(90));
        assert_eq!(config.rate_limit_poll_interval, Duration::from_secs(1));
        assert_eq!(config.stream_poll_interval, Duration::from_millis(500));
        assert_eq!(config.recovery_candidates, 3);
        assert!(!config.preflight_rate_limit);
    }

    #[test]
    fn test_per_kind_result_timeout() {
        let config = OrchestratorConfig::new()
            .with_result_timeout(Duration::from_secs(60))
            .with_result_timeout_for(JobKind::Away, Duration::from_secs(120));

        assert_eq!(config.result_timeout_for(JobKind::Home), Duration::from_secs(60));
        assert_eq!(config.result_timeout_for(JobKind::Away), Duration::from_secs(120));
    }

    #[test]
    fn test_validate_rejects_zero_candidates() {
        let config = OrchestratorConfig::new().with_recovery_candidates(0);
        assert!(matches!(config.validate(), Err(SdkError::Config(_))));
    }
}
