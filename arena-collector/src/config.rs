//! Collector configuration, the closed option set from spec §6 under
//! "Collector". Carried as a typed struct rather than free-form kwargs, per
//! SPEC_FULL.md's "Dynamic config objects" disposition; unknown keys are
//! rejected wherever this is deserialized by using `deny_unknown_fields` at
//! the `ArenaConfig` level in `arena-telemetry::config`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CollectorConfig {
    pub enabled: bool,
    pub collect_move_data: bool,
    pub collect_rethink_data: bool,
    pub collect_timing_data: bool,
    pub collect_llm_responses: bool,
    pub max_collection_latency_ms: u64,
    pub async_processing: bool,
    pub queue_size: usize,
    pub worker_threads: usize,
    pub min_game_length: Option<i32>,
    pub max_game_length: Option<i32>,
    pub sample_rate: f64,
    pub move_sample_rate: f64,
    pub max_retry_attempts: u32,
    pub retry_delay_seconds: u64,
    pub continue_on_collection_error: bool,
    /// Size of the rolling processing-duration window (spec §4.3's "rolling
    /// window of the most recent N durations (default 1000)").
    pub recent_durations_window: usize,
    /// Size of the bounded recent-error tail (spec §4.3's "bounded-size error
    /// tail (most recent 100 errors)").
    pub error_tail_size: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        CollectorConfig {
            enabled: true,
            collect_move_data: true,
            collect_rethink_data: true,
            collect_timing_data: true,
            collect_llm_responses: true,
            max_collection_latency_ms: 50,
            async_processing: true,
            queue_size: 1000,
            worker_threads: 2,
            min_game_length: None,
            max_game_length: None,
            sample_rate: 1.0,
            move_sample_rate: 1.0,
            max_retry_attempts: 3,
            retry_delay_seconds: 1,
            continue_on_collection_error: true,
            recent_durations_window: 1000,
            error_tail_size: 100,
        }
    }
}

impl CollectorConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_seconds)
    }

    pub fn latency_ceiling(&self) -> Duration {
        Duration::from_millis(self.max_collection_latency_ms)
    }

    /// Validates the closed option set's numeric ranges: `sample_rate` and
    /// `move_sample_rate` must be fractions in `[0, 1]` per spec §6.
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.sample_rate) {
            return Err("sample_rate must be within [0, 1]".into());
        }
        if !(0.0..=1.0).contains(&self.move_sample_rate) {
            return Err("move_sample_rate must be within [0, 1]".into());
        }
        if self.worker_threads == 0 {
            return Err("worker_threads must be at least 1".into());
        }
        Ok(())
    }
}
