//! Engine configuration, overridable from the environment.

use std::time::Duration;

use tracing::warn;

use crate::defaults;

/// Timing and resource knobs of the engine. All durations come from the
/// environment in whole seconds (`LEET_SEARCH_TIMEOUT`, `LEET_POLL_INTERVAL`,
/// `LEET_JOB_EXPIRY`, `LEET_MAX_SESSIONS`).
#[derive(Debug, Clone)]
pub struct LeetConfig {
    /// Deadline for a search request.
    pub search_timeout: Duration,
    /// Delay between online probes.
    pub poll_interval: Duration,
    /// Eligibility window of a job.
    pub job_expiry: Duration,
    /// Session bound handed to newly constructed backends.
    pub max_sessions: usize,
    /// Whether a hostname found on several backends is resolved to the
    /// most-recent check-in (true) or failed outright (false).
    pub solve_conflicts: bool,
}

impl Default for LeetConfig {
    fn default() -> Self {
        Self {
            search_timeout: Duration::from_secs(defaults::DEFAULT_SEARCH_TIMEOUT_SECS),
            poll_interval: Duration::from_secs(defaults::DEFAULT_POLL_INTERVAL_SECS),
            job_expiry: Duration::from_secs(defaults::DEFAULT_JOB_EXPIRY_SECS),
            max_sessions: defaults::DEFAULT_MAX_SESSIONS,
            solve_conflicts: true,
        }
    }
}

impl LeetConfig {
    /// Defaults with environment overrides applied. Unparseable values are
    /// logged and fall back to the default.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(secs) = env_u64("LEET_SEARCH_TIMEOUT") {
            config.search_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("LEET_POLL_INTERVAL") {
            config.poll_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("LEET_JOB_EXPIRY") {
            config.job_expiry = Duration::from_secs(secs);
        }
        if let Some(n) = env_u64("LEET_MAX_SESSIONS") {
            config.max_sessions = (n as usize).max(1);
        }
        config
    }
}

fn env_u64(key: &str) -> Option<u64> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("ignoring {}={:?}: not a number of seconds", key, raw);
            None
        }
    }
}
