use std::time::Duration;

use serde::Deserialize;

use crate::classify::{ClassifyScheduleConfig, StabilizerConfig};
use crate::reid::ReidConfig;
use crate::tracker::TrackerConfig;
use crate::zone::ZoneCounterConfig;

/// Everything one channel needs apart from its zones and models.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub tracker: TrackerConfig,
    pub reid: ReidConfig,
    pub stabilizer: StabilizerConfig,
    pub classify: ClassifyScheduleConfig,
    pub zones: ZoneCounterConfig,
    pub workers: WorkerConfig,
    pub sink: SinkConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Frames waiting for detection; the oldest is dropped when full
    pub frame_queue: usize,
    pub detection_workers: usize,
    /// Embedding and classification workers
    pub model_workers: usize,
    /// Pending model tasks; the lowest priority is dropped when full
    pub task_queue: usize,
    /// Model tasks older than this are abandoned
    pub task_timeout_ms: u64,
    /// Detection results slower than this are discarded
    pub detection_timeout_ms: u64,
    /// Target per-frame processing time; overruns are logged
    pub frame_budget_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let cores = std::thread::available_parallelism().map_or(2, |n| n.get());
        Self {
            frame_queue: 4,
            detection_workers: (cores / 2).clamp(1, 2),
            model_workers: 2,
            task_queue: 32,
            task_timeout_ms: 200,
            detection_timeout_ms: 120,
            frame_budget_ms: 40,
        }
    }
}

impl WorkerConfig {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    pub fn detection_timeout(&self) -> Duration {
        Duration::from_millis(self.detection_timeout_ms)
    }

    pub fn frame_budget(&self) -> Duration {
        Duration::from_millis(self.frame_budget_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    pub workers: usize,
    /// Records waiting for a writer; new records are dropped when full
    pub queue: usize,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    /// Retries of a transient failure before the batch is dropped
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            queue: 1024,
            batch_size: 32,
            flush_interval_ms: 500,
            max_retries: 5,
            initial_backoff_ms: 50,
            max_backoff_ms: 2_000,
        }
    }
}

impl SinkConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }

    /// Delay before retry number `attempt` (0-based): doubling from the
    /// initial backoff, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = SinkConfig {
            initial_backoff_ms: 10,
            max_backoff_ms: 50,
            ..SinkConfig::default()
        };
        let delays: Vec<u64> = (0..5).map(|a| config.backoff(a).as_millis() as u64).collect();
        assert_eq!(delays, vec![10, 20, 40, 50, 50]);
        assert_eq!(config.backoff(200).as_millis(), 50);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{"tracker": {"max_age": 12}, "workers": {"model_workers": 3}}"#).unwrap();
        assert_eq!(config.tracker.max_age, 12);
        assert_eq!(config.tracker.min_hits, 3);
        assert_eq!(config.workers.model_workers, 3);
        assert_eq!(config.workers.frame_queue, 4);
        assert!(config.workers.detection_workers >= 1);
    }
}
