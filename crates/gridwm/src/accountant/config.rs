use std::time::Duration;

/// How often the accountant polls for completed jobs if not configured
/// explicitly.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Default size of the accounting worker pool.
pub const DEFAULT_WORKER_COUNT: usize = 4;

#[derive(Debug, Clone)]
pub struct AccountantConfig {
    /// Interval between polling cycles.
    pub poll_interval: Duration,
    /// Fixed number of accounting workers draining each batch.
    pub worker_count: usize,
    /// Optional per-job accounting timeout. A timed-out job counts as failed
    /// for the cycle and stays in `Complete` for a later retry.
    pub job_timeout: Option<Duration>,
}

impl AccountantConfig {
    /// Configuration with environment overrides applied
    /// (`GRIDWM_ACCOUNTANT_POLL_INTERVAL_MS`, `GRIDWM_ACCOUNTANT_WORKERS`,
    /// `GRIDWM_ACCOUNTANT_JOB_TIMEOUT_MS`).
    pub fn from_env() -> Self {
        Self {
            poll_interval: get_duration_from_env("GRIDWM_ACCOUNTANT_POLL_INTERVAL_MS")
                .unwrap_or(DEFAULT_POLL_INTERVAL),
            worker_count: std::env::var("GRIDWM_ACCOUNTANT_WORKERS")
                .ok()
                .and_then(|value| value.parse::<usize>().ok())
                .unwrap_or(DEFAULT_WORKER_COUNT),
            job_timeout: get_duration_from_env("GRIDWM_ACCOUNTANT_JOB_TIMEOUT_MS"),
        }
    }
}

impl Default for AccountantConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            worker_count: DEFAULT_WORKER_COUNT,
            job_timeout: None,
        }
    }
}

fn get_duration_from_env(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_millis)
}
