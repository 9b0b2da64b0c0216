//! Pipeline configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Configuration shared by every client session of a [`Pipeline`](crate::Pipeline).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Capacity of each per-client stage queue.
    pub queue_capacity: usize,
    /// Target delivery frame rate. Frames arriving faster are dropped.
    pub target_fps: u32,
    /// Maximum consecutive connect attempts before a session fails.
    pub connect_max_attempts: u32,
    /// Delay between connect attempts in milliseconds.
    pub connect_backoff_ms: u64,
    /// Whether to add jitter to the connect backoff.
    pub connect_backoff_jitter: bool,
    /// Per-task inference timeout in seconds.
    pub task_timeout_secs: u64,
    /// Size of the cross-client inference worker pool.
    pub inference_workers: usize,
    /// Wall-clock segment rollover period in milliseconds.
    pub segment_rollover_ms: u64,
    /// Grace period for session stop in milliseconds. Workers still running
    /// after this are force-closed.
    pub stop_grace_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 8,
            target_fps: 25,
            connect_max_attempts: 5,
            connect_backoff_ms: 2000,
            connect_backoff_jitter: false,
            task_timeout_secs: 5,
            inference_workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            segment_rollover_ms: 5000,
            stop_grace_ms: 3000,
        }
    }
}

impl PipelineConfig {
    /// Validate the configuration, failing fast on unusable values.
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(Error::config("queue_capacity must be non-zero"));
        }
        if self.target_fps == 0 {
            return Err(Error::config("target_fps must be non-zero"));
        }
        if self.connect_max_attempts == 0 {
            return Err(Error::config("connect_max_attempts must be non-zero"));
        }
        if self.inference_workers == 0 {
            return Err(Error::config("inference_workers must be non-zero"));
        }
        if self.task_timeout_secs == 0 {
            return Err(Error::config("task_timeout_secs must be non-zero"));
        }
        if self.segment_rollover_ms == 0 {
            return Err(Error::config("segment_rollover_ms must be non-zero"));
        }
        Ok(())
    }

    /// Interval between two delivered frames at the target rate.
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.target_fps as f64)
    }

    pub fn connect_backoff(&self) -> Duration {
        Duration::from_millis(self.connect_backoff_ms)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn segment_rollover(&self) -> Duration {
        Duration::from_millis(self.segment_rollover_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(PipelineConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_zero_values() {
        let mut config = PipelineConfig::default();
        config.queue_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.target_fps = 0;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.inference_workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn frame_interval_matches_fps() {
        let mut config = PipelineConfig::default();
        config.target_fps = 10;
        assert_eq!(config.frame_interval(), Duration::from_millis(100));
    }
}
