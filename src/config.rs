//! # Engine Configuration
//!
//! Tuning knobs for the worker pool and queue behavior. Correctness
//! never depends on any of these values; they bound latency and
//! duplicate work.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the execution engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Number of identical poll/handle/ack workers
    pub worker_count: usize,
    /// How long an idle worker sleeps before polling again, in milliseconds
    pub poll_interval_ms: u64,
    /// How long a polled message stays hidden from other consumers, in seconds
    pub visibility_timeout_secs: u64,
    /// Delay before a paused stage rechecks its pause marker, in seconds
    pub pause_recheck_delay_secs: u64,
    /// Capacity of the broadcast event channel
    pub event_channel_capacity: usize,
}

impl EngineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn pause_recheck_delay(&self) -> Duration {
        Duration::from_secs(self.pause_recheck_delay_secs)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            poll_interval_ms: 50,
            visibility_timeout_secs: 30,
            pause_recheck_delay_secs: 10,
            event_channel_capacity: 1000,
        }
    }
}
