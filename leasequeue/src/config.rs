//! Defaults for queue operations and workers.
use chrono::TimeDelta;

use crate::job::DEFAULT_QUEUE;

/// Defaults applied by [`crate::JobQueue`] when a caller leaves a value out.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    pub default_max_attempts: u32,
    pub default_lease: TimeDelta,
    pub default_retry_delay: TimeDelta,
}

impl QueueConfig {
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 25;
    pub const DEFAULT_LEASE: TimeDelta = TimeDelta::seconds(30);
    pub const DEFAULT_RETRY_DELAY: TimeDelta = TimeDelta::minutes(5);

    pub const fn new() -> Self {
        Self {
            default_max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
            default_lease: Self::DEFAULT_LEASE,
            default_retry_delay: Self::DEFAULT_RETRY_DELAY,
        }
    }

    pub const fn with_default_max_attempts(mut self, max_attempts: u32) -> Self {
        self.default_max_attempts = max_attempts;
        self
    }

    pub const fn with_default_lease(mut self, lease: TimeDelta) -> Self {
        self.default_lease = lease;
        self
    }

    pub const fn with_default_retry_delay(mut self, retry_delay: TimeDelta) -> Self {
        self.default_retry_delay = retry_delay;
        self
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// How a [`crate::worker::Worker`] polls its queue.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub queue_name: String,
    pub lease_duration: TimeDelta,
    /// Upper bound on how long an idle worker waits before claiming again when no wake arrives.
    pub poll_interval: std::time::Duration,
    /// Extend the lease every half lease period while the handler runs.
    pub heartbeat: bool,
}

impl WorkerConfig {
    pub const DEFAULT_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);

    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            lease_duration: QueueConfig::DEFAULT_LEASE,
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
            heartbeat: true,
        }
    }

    pub fn with_lease_duration(self, lease_duration: TimeDelta) -> Self {
        Self {
            lease_duration,
            ..self
        }
    }

    pub fn with_poll_interval(self, poll_interval: std::time::Duration) -> Self {
        Self {
            poll_interval,
            ..self
        }
    }

    pub fn with_heartbeat(self, heartbeat: bool) -> Self {
        Self { heartbeat, ..self }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE)
    }
}
