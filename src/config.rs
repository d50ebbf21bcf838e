use std::path::PathBuf;
use std::time::Duration;

/// Maximum number of live jobs kept by the registry.
pub const DEFAULT_MAX_JOBS: usize = 99;

/// Safety-net wake-up for settlement waits.
pub const DEFAULT_SETTLE_POLL_INTERVAL: Duration = Duration::from_millis(150);

/// How long a pause request may take before the caller moves on.
pub const DEFAULT_PAUSE_SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_jobs: usize,
    pub settle_poll_interval: Duration,
    pub pause_settle_timeout: Duration,
    /// Where outputs go when neither the caller nor the job names a directory.
    /// `None` writes next to the input file.
    pub default_output_dir: Option<PathBuf>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_jobs: DEFAULT_MAX_JOBS,
            settle_poll_interval: DEFAULT_SETTLE_POLL_INTERVAL,
            pause_settle_timeout: DEFAULT_PAUSE_SETTLE_TIMEOUT,
            default_output_dir: None,
        }
    }
}

impl SchedulerConfig {
    pub fn with_max_jobs(mut self, max_jobs: usize) -> Self {
        self.max_jobs = max_jobs.max(1);
        self
    }

    pub fn with_settle_poll_interval(mut self, interval: Duration) -> Self {
        self.settle_poll_interval = interval;
        self
    }

    pub fn with_pause_settle_timeout(mut self, timeout: Duration) -> Self {
        self.pause_settle_timeout = timeout;
        self
    }

    pub fn with_default_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.default_output_dir = Some(dir.into());
        self
    }
}
