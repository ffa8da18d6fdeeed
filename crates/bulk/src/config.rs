use std::time::Duration;

use kvdesk_core::bulk_action::{SummaryLimits, DEFAULT_MAX_SUMMARY_ERRORS, DEFAULT_MAX_SUMMARY_KEYS};

/// Exponential backoff between retries of a failed scan call.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first failed attempt; `0` disables retrying.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on the delay between retries.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
}

impl RetryPolicy {
    /// The delay following `current`, clamped to `max_delay`.
    pub fn next_delay(&self, current: Duration) -> Duration {
        let next_ms = (current.as_millis() as f64 * self.multiplier) as u64;
        Duration::from_millis(next_ms).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

/// Engine tuning.
#[derive(Debug, Clone)]
pub struct BulkConfig {
    /// `COUNT` hint passed with every scan call.
    pub scan_count: u32,
    pub scan_retry: RetryPolicy,
    /// Commands per upload batch.
    pub upload_batch_size: usize,
    pub summary_limits: SummaryLimits,
    /// How long terminal actions stay queryable before the reaper evicts them.
    pub terminal_ttl: Duration,
    pub reaper_interval: Duration,
    /// Chunks buffered between a report and its reader.
    pub report_channel_capacity: usize,
    /// How long a report send may wait on a reader before it is detached.
    pub report_stall_timeout: Duration,
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            scan_count: 10_000,
            scan_retry: RetryPolicy::default(),
            upload_batch_size: 1_000,
            summary_limits: SummaryLimits::default(),
            terminal_ttl: Duration::from_secs(3600),
            reaper_interval: Duration::from_secs(60),
            report_channel_capacity: 16,
            report_stall_timeout: Duration::from_secs(30),
        }
    }
}

impl BulkConfig {
    /// Load configuration from environment variables, falling back to the
    /// default for anything missing or unparseable.
    ///
    /// | Env Var                        | Default |
    /// |--------------------------------|---------|
    /// | `BULK_SCAN_COUNT`              | `10000` |
    /// | `BULK_SCAN_RETRIES`            | `3`     |
    /// | `BULK_RETRY_BACKOFF_MS`        | `200`   |
    /// | `BULK_UPLOAD_BATCH_SIZE`       | `1000`  |
    /// | `BULK_MAX_SUMMARY_ERRORS`      | `500`   |
    /// | `BULK_MAX_SUMMARY_KEYS`        | `500`   |
    /// | `BULK_TERMINAL_TTL_SECS`       | `3600`  |
    /// | `BULK_REAPER_INTERVAL_SECS`    | `60`    |
    /// | `BULK_REPORT_CHANNEL_CAPACITY` | `16`    |
    /// | `BULK_REPORT_STALL_TIMEOUT_SECS` | `30`  |
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            scan_count: env_or("BULK_SCAN_COUNT", defaults.scan_count).max(1),
            scan_retry: RetryPolicy {
                max_retries: env_or("BULK_SCAN_RETRIES", defaults.scan_retry.max_retries),
                initial_delay: Duration::from_millis(env_or("BULK_RETRY_BACKOFF_MS", 200)),
                ..defaults.scan_retry
            },
            upload_batch_size: env_or("BULK_UPLOAD_BATCH_SIZE", defaults.upload_batch_size).max(1),
            summary_limits: SummaryLimits {
                max_errors: env_or("BULK_MAX_SUMMARY_ERRORS", DEFAULT_MAX_SUMMARY_ERRORS),
                max_keys: env_or("BULK_MAX_SUMMARY_KEYS", DEFAULT_MAX_SUMMARY_KEYS),
            },
            terminal_ttl: Duration::from_secs(env_or("BULK_TERMINAL_TTL_SECS", 3600)),
            reaper_interval: Duration::from_secs(env_or::<u64>("BULK_REAPER_INTERVAL_SECS", 60).max(1)),
            report_channel_capacity: env_or(
                "BULK_REPORT_CHANNEL_CAPACITY",
                defaults.report_channel_capacity,
            )
            .max(1),
            report_stall_timeout: Duration::from_secs(
                env_or::<u64>("BULK_REPORT_STALL_TIMEOUT_SECS", 30).max(1),
            ),
        }
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}
