//! Orchestrator configuration.

use std::time::Duration;

use triage_core::ModelId;

use crate::error::ConfigError;

/// Default concurrency cap until the service reports its own.
pub const DEFAULT_MAX_INFLIGHT: usize = 8;

/// The service rejects bulk status requests above this many ids.
pub const BULK_STATUS_LIMIT: usize = 200;

/// Polling interval tiers, chosen by the number of active jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Interval while few jobs are active.
    pub base: Duration,
    /// Interval once more than `busy_above` jobs are active.
    pub busy: Duration,
    /// Interval once more than `heavy_above` jobs are active.
    pub heavy: Duration,
    pub busy_above: usize,
    pub heavy_above: usize,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(2000),
            busy: Duration::from_millis(3000),
            heavy: Duration::from_millis(4000),
            busy_above: 10,
            heavy_above: 20,
        }
    }
}

impl PollPolicy {
    /// Interval for `active` jobs; `None` means no polling at all.
    pub fn interval_for(&self, active: usize) -> Option<Duration> {
        if active == 0 {
            None
        } else if active > self.heavy_above {
            Some(self.heavy)
        } else if active > self.busy_above {
            Some(self.busy)
        } else {
            Some(self.base)
        }
    }
}

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct JobsConfig {
    /// Base URL of the judge service.
    pub api_url: String,
    /// Optional bearer token.
    pub auth_token: Option<String>,
    /// Model used for new runs.
    pub model: ModelId,
    /// Concurrency cap assumed until the service reports one.
    pub default_max_inflight: usize,
    pub poll: PollPolicy,
    /// Delay before the queue view is reloaded after completions.
    pub queue_refresh_delay: Duration,
    /// Minimum spacing of unforced quota fetches.
    pub quota_min_refetch: Duration,
    /// How long a quota exhaustion marker stays relevant.
    pub quota_recency_window: chrono::Duration,
    /// Page size when loading the queue view.
    pub queue_page_size: usize,
    /// Run against the in-process mock service instead of HTTP.
    pub mock_mode: bool,
    /// Start the headless runner with auto-run enabled.
    pub auto_run: bool,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:8000".to_string(),
            auth_token: None,
            model: ModelId::auto(),
            default_max_inflight: DEFAULT_MAX_INFLIGHT,
            poll: PollPolicy::default(),
            queue_refresh_delay: Duration::from_millis(600),
            quota_min_refetch: Duration::from_secs(30),
            quota_recency_window: chrono::Duration::hours(6),
            queue_page_size: 50,
            mock_mode: false,
            auto_run: true,
        }
    }
}

impl JobsConfig {
    /// Load configuration from `TRIAGE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("TRIAGE_API_URL").filter(|v| !v.trim().is_empty()) {
            config.api_url = url.trim().trim_end_matches('/').to_string();
        }

        config.auth_token = lookup("TRIAGE_AUTH_TOKEN").filter(|v| !v.trim().is_empty());

        if let Some(model) = lookup("TRIAGE_MODEL") {
            config.model = ModelId::new(model.clone()).map_err(|e| ConfigError::InvalidValue {
                key: "TRIAGE_MODEL",
                value: model,
                reason: e.to_string(),
            })?;
        }

        if let Some(raw) = lookup("TRIAGE_MAX_INFLIGHT") {
            let cap = raw
                .trim()
                .parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| ConfigError::InvalidValue {
                    key: "TRIAGE_MAX_INFLIGHT",
                    value: raw.clone(),
                    reason: "expected a positive integer".to_string(),
                })?;
            config.default_max_inflight = cap;
        }

        if let Some(mode) = lookup("TRIAGE_JUDGE_MODE") {
            config.mock_mode = mode.trim().eq_ignore_ascii_case("mock");
        }

        if let Some(raw) = lookup("TRIAGE_AUTO_RUN") {
            config.auto_run = parse_bool("TRIAGE_AUTO_RUN", &raw)?;
        }

        Ok(config)
    }

    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    pub fn with_model(mut self, model: ModelId) -> Self {
        self.model = model;
        self
    }

    pub fn with_default_max_inflight(mut self, cap: usize) -> Self {
        self.default_max_inflight = cap;
        self
    }

    pub fn with_poll_policy(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    pub fn with_queue_refresh_delay(mut self, delay: Duration) -> Self {
        self.queue_refresh_delay = delay;
        self
    }
}

fn parse_bool(key: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key,
            value: raw.to_string(),
            reason: "expected a boolean".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn interval_tiers() {
        let policy = PollPolicy::default();
        assert_eq!(policy.interval_for(0), None);
        assert_eq!(policy.interval_for(1), Some(Duration::from_millis(2000)));
        assert_eq!(policy.interval_for(9), Some(Duration::from_millis(2000)));
        assert_eq!(policy.interval_for(10), Some(Duration::from_millis(2000)));
        assert_eq!(policy.interval_for(11), Some(Duration::from_millis(3000)));
        assert_eq!(policy.interval_for(20), Some(Duration::from_millis(3000)));
        assert_eq!(policy.interval_for(21), Some(Duration::from_millis(4000)));
    }

    #[test]
    fn defaults_without_environment() {
        let config = JobsConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.api_url, "http://localhost:8000");
        assert_eq!(config.default_max_inflight, DEFAULT_MAX_INFLIGHT);
        assert_eq!(config.model, ModelId::auto());
        assert!(!config.mock_mode);
        assert!(config.auto_run);
    }

    #[test]
    fn reads_environment_overrides() {
        let config = JobsConfig::from_lookup(lookup(&[
            ("TRIAGE_API_URL", "http://judge:9000/"),
            ("TRIAGE_MODEL", "flash"),
            ("TRIAGE_MAX_INFLIGHT", "3"),
            ("TRIAGE_JUDGE_MODE", "MOCK"),
            ("TRIAGE_AUTO_RUN", "off"),
            ("TRIAGE_AUTH_TOKEN", "secret"),
        ]))
        .unwrap();
        assert_eq!(config.api_url, "http://judge:9000");
        assert_eq!(config.model.as_str(), "flash");
        assert_eq!(config.default_max_inflight, 3);
        assert!(config.mock_mode);
        assert!(!config.auto_run);
        assert_eq!(config.auth_token.as_deref(), Some("secret"));
    }

    #[test]
    fn rejects_bad_values() {
        let err = JobsConfig::from_lookup(lookup(&[("TRIAGE_MAX_INFLIGHT", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "TRIAGE_MAX_INFLIGHT", .. }));

        let err = JobsConfig::from_lookup(lookup(&[("TRIAGE_AUTO_RUN", "maybe")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "TRIAGE_AUTO_RUN", .. }));

        let err = JobsConfig::from_lookup(lookup(&[("TRIAGE_MODEL", "  ")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "TRIAGE_MODEL", .. }));
    }
}
