//! Per-channel counters and latency statistics.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;

const LATENCY_WINDOW: usize = 512;
const FPS_WINDOW: usize = 120;

#[derive(Debug, Default)]
struct Timing {
    latencies_ms: VecDeque<f64>,
    processed_at: VecDeque<Instant>,
}

/// Lock-free counters shared by every thread of one channel. Latency and
/// FPS use a small mutex-guarded rolling window.
#[derive(Debug, Default)]
pub struct ChannelMetrics {
    pub(crate) frames_submitted: AtomicU64,
    pub(crate) frames_dropped: AtomicU64,
    pub(crate) frames_processed: AtomicU64,
    pub(crate) stale_results: AtomicU64,
    pub(crate) detection_failures: AtomicU64,
    pub(crate) detection_timeouts: AtomicU64,
    pub(crate) budget_overruns: AtomicU64,
    pub(crate) tasks_submitted: AtomicU64,
    pub(crate) tasks_dropped: AtomicU64,
    pub(crate) task_timeouts: AtomicU64,
    pub(crate) task_failures: AtomicU64,
    pub(crate) zone_events: AtomicU64,
    pub(crate) sink_batches: AtomicU64,
    pub(crate) sink_retries: AtomicU64,
    pub(crate) sink_records_written: AtomicU64,
    pub(crate) sink_records_dropped: AtomicU64,
    pub(crate) frame_queue_depth: AtomicUsize,
    pub(crate) task_queue_depth: AtomicUsize,
    pub(crate) sink_queue_depth: AtomicUsize,
    timing: Mutex<Timing>,
}

pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn add(counter: &AtomicU64, n: usize) {
    counter.fetch_add(n as u64, Ordering::Relaxed);
}

/// Nearest-rank percentile of an ascending slice.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

impl ChannelMetrics {
    /// Record the end-to-end latency of one processed frame.
    pub fn record_frame(&self, latency: Duration) {
        self.record_frame_at(latency, Instant::now());
    }

    pub(crate) fn record_frame_at(&self, latency: Duration, now: Instant) {
        bump(&self.frames_processed);
        let mut timing = self.timing.lock().unwrap_or_else(PoisonError::into_inner);
        timing.latencies_ms.push_back(latency.as_secs_f64() * 1000.0);
        if timing.latencies_ms.len() > LATENCY_WINDOW {
            timing.latencies_ms.pop_front();
        }
        timing.processed_at.push_back(now);
        if timing.processed_at.len() > FPS_WINDOW {
            timing.processed_at.pop_front();
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let depth = |c: &AtomicUsize| c.load(Ordering::Relaxed);

        let (p50, p95, p99, fps) = {
            let timing = self.timing.lock().unwrap_or_else(PoisonError::into_inner);
            let mut sorted: Vec<f64> = timing.latencies_ms.iter().copied().collect();
            sorted.sort_by(f64::total_cmp);
            let fps = match (timing.processed_at.front(), timing.processed_at.back()) {
                (Some(first), Some(last)) if timing.processed_at.len() > 1 => {
                    let span = last.duration_since(*first).as_secs_f64();
                    if span > 0.0 {
                        (timing.processed_at.len() - 1) as f64 / span
                    } else {
                        0.0
                    }
                }
                _ => 0.0,
            };
            (
                percentile(&sorted, 50.0),
                percentile(&sorted, 95.0),
                percentile(&sorted, 99.0),
                fps,
            )
        };

        MetricsSnapshot {
            frames_submitted: load(&self.frames_submitted),
            frames_dropped: load(&self.frames_dropped),
            frames_processed: load(&self.frames_processed),
            stale_results: load(&self.stale_results),
            detection_failures: load(&self.detection_failures),
            detection_timeouts: load(&self.detection_timeouts),
            budget_overruns: load(&self.budget_overruns),
            tasks_submitted: load(&self.tasks_submitted),
            tasks_dropped: load(&self.tasks_dropped),
            task_timeouts: load(&self.task_timeouts),
            task_failures: load(&self.task_failures),
            zone_events: load(&self.zone_events),
            sink_batches: load(&self.sink_batches),
            sink_retries: load(&self.sink_retries),
            sink_records_written: load(&self.sink_records_written),
            sink_records_dropped: load(&self.sink_records_dropped),
            frame_queue_depth: depth(&self.frame_queue_depth),
            task_queue_depth: depth(&self.task_queue_depth),
            sink_queue_depth: depth(&self.sink_queue_depth),
            latency_p50_ms: p50,
            latency_p95_ms: p95,
            latency_p99_ms: p99,
            fps,
        }
    }
}

/// Point-in-time copy of [`ChannelMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub frames_submitted: u64,
    pub frames_dropped: u64,
    pub frames_processed: u64,
    pub stale_results: u64,
    pub detection_failures: u64,
    pub detection_timeouts: u64,
    pub budget_overruns: u64,
    pub tasks_submitted: u64,
    pub tasks_dropped: u64,
    pub task_timeouts: u64,
    pub task_failures: u64,
    pub zone_events: u64,
    pub sink_batches: u64,
    pub sink_retries: u64,
    pub sink_records_written: u64,
    pub sink_records_dropped: u64,
    pub frame_queue_depth: usize,
    pub task_queue_depth: usize,
    pub sink_queue_depth: usize,
    pub latency_p50_ms: f64,
    pub latency_p95_ms: f64,
    pub latency_p99_ms: f64,
    pub fps: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentiles() {
        let sorted: Vec<f64> = (1..=100).map(f64::from).collect();
        assert_eq!(percentile(&sorted, 50.0), 50.0);
        assert_eq!(percentile(&sorted, 95.0), 95.0);
        assert_eq!(percentile(&sorted, 99.0), 99.0);
        assert_eq!(percentile(&[], 99.0), 0.0);
    }

    #[test]
    fn test_snapshot_latency_and_fps() {
        let metrics = ChannelMetrics::default();
        let start = Instant::now();
        for i in 0..11u64 {
            metrics.record_frame_at(
                Duration::from_millis(10 + i),
                start + Duration::from_millis(100 * i),
            );
        }
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.frames_processed, 11);
        assert!((snapshot.fps - 10.0).abs() < 1e-6);
        assert!((snapshot.latency_p50_ms - 15.0).abs() < 1e-6);
        assert!((snapshot.latency_p99_ms - 20.0).abs() < 1e-6);
    }
}
