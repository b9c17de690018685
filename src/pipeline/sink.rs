//! Storage sink and the writer pool that batches and retries deliveries.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::TrackId;
use crate::classify::Label;
use crate::error::{Result, SinkError};
use crate::pipeline::config::SinkConfig;
use crate::pipeline::metrics::{ChannelMetrics, add, bump};
use crate::zone::ZoneEvent;

/// Stabilized classification of one identity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassificationRecord {
    pub track_id: TrackId,
    pub label: Label,
    pub confidence: f32,
    pub frame: u64,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum SinkRecord {
    Zone(ZoneEvent),
    Classification(ClassificationRecord),
}

/// Durable storage for events. Called from the sink writer threads only.
pub trait Sink: Send + Sync {
    fn write_batch(&self, records: &[SinkRecord]) -> std::result::Result<(), SinkError>;
}

/// Sleep for `total`, waking early when `cancel` is raised. Returns false
/// if cancelled.
pub(crate) fn sleep_unless_cancelled(total: Duration, cancel: &AtomicBool) -> bool {
    let deadline = Instant::now() + total;
    loop {
        if cancel.load(Ordering::Relaxed) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep((deadline - now).min(Duration::from_millis(10)));
    }
}

/// Deliver one batch, retrying transient failures with exponential backoff.
/// Gives up (and counts the loss) after `max_retries`, on a permanent error
/// or when cancelled.
pub(crate) fn deliver(
    sink: &dyn Sink,
    batch: &[SinkRecord],
    config: &SinkConfig,
    metrics: &ChannelMetrics,
    cancel: &AtomicBool,
) -> bool {
    let mut attempt = 0;
    loop {
        match sink.write_batch(batch) {
            Ok(()) => {
                bump(&metrics.sink_batches);
                add(&metrics.sink_records_written, batch.len());
                debug!(records = batch.len(), attempt, "sink batch written");
                return true;
            }
            Err(SinkError::Permanent(reason)) => {
                error!(records = batch.len(), %reason, "sink rejected batch, dropping");
                break;
            }
            Err(SinkError::Transient(reason)) => {
                if attempt >= config.max_retries {
                    error!(records = batch.len(), attempt, %reason, "sink retries exhausted, dropping batch");
                    break;
                }
                let delay = config.backoff(attempt);
                warn!(records = batch.len(), attempt, ?delay, %reason, "sink write failed, retrying");
                bump(&metrics.sink_retries);
                attempt += 1;
                if !sleep_unless_cancelled(delay, cancel) {
                    warn!(records = batch.len(), "sink retry cancelled, dropping batch");
                    break;
                }
            }
        }
    }
    add(&metrics.sink_records_dropped, batch.len());
    false
}

/// Spawn the sink writer pool. Writers exit once every sender of `records`
/// is gone and their last batch is flushed, or when `cancel` is raised.
pub(crate) fn spawn_writers(
    channel_id: &str,
    sink: Arc<dyn Sink>,
    records: Receiver<SinkRecord>,
    config: &SinkConfig,
    metrics: Arc<ChannelMetrics>,
    cancel: Arc<AtomicBool>,
) -> Result<Vec<JoinHandle<()>>> {
    let mut handles = Vec::with_capacity(config.workers.max(1));
    for n in 0..config.workers.max(1) {
        let sink = Arc::clone(&sink);
        let records = records.clone();
        let config = config.clone();
        let metrics = Arc::clone(&metrics);
        let cancel = Arc::clone(&cancel);
        let handle = thread::Builder::new()
            .name(format!("{channel_id}-sink-{n}"))
            .spawn(move || writer_loop(sink.as_ref(), &records, &config, &metrics, &cancel))?;
        handles.push(handle);
    }
    info!(channel_id, workers = handles.len(), "sink writers started");
    Ok(handles)
}

fn writer_loop(
    sink: &dyn Sink,
    records: &Receiver<SinkRecord>,
    config: &SinkConfig,
    metrics: &ChannelMetrics,
    cancel: &AtomicBool,
) {
    let batch_size = config.batch_size.max(1);
    let mut batch = Vec::with_capacity(batch_size);
    let mut batch_started = Instant::now();

    loop {
        if cancel.load(Ordering::Relaxed) {
            let lost = batch.len() + records.try_iter().count();
            if lost > 0 {
                warn!(records = lost, "sink writer cancelled with pending records");
                add(&metrics.sink_records_dropped, lost);
            }
            return;
        }

        let wait = config.flush_interval().saturating_sub(batch_started.elapsed());
        match records.recv_timeout(wait.max(Duration::from_millis(1))) {
            Ok(record) => {
                if batch.is_empty() {
                    batch_started = Instant::now();
                }
                batch.push(record);
                metrics
                    .sink_queue_depth
                    .store(records.len(), Ordering::Relaxed);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                if !batch.is_empty() {
                    deliver(sink, &batch, config, metrics, cancel);
                }
                return;
            }
        }

        let due = batch.len() >= batch_size
            || (!batch.is_empty() && batch_started.elapsed() >= config.flush_interval());
        if due {
            deliver(sink, &batch, config, metrics, cancel);
            batch.clear();
            batch_started = Instant::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::AtomicU32;

    use super::*;
    use crate::zone::{EventKind, ZoneEvent};

    struct FlakySink {
        failures_left: AtomicU32,
        permanent: bool,
        written: Mutex<Vec<SinkRecord>>,
    }

    impl FlakySink {
        fn new(failures: u32, permanent: bool) -> Self {
            Self {
                failures_left: AtomicU32::new(failures),
                permanent,
                written: Mutex::new(Vec::new()),
            }
        }
    }

    impl Sink for FlakySink {
        fn write_batch(&self, records: &[SinkRecord]) -> std::result::Result<(), SinkError> {
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(if self.permanent {
                    SinkError::Permanent("schema".into())
                } else {
                    SinkError::Transient("timeout".into())
                });
            }
            self.written.lock().unwrap().extend_from_slice(records);
            Ok(())
        }
    }

    fn event(track_id: TrackId) -> SinkRecord {
        SinkRecord::Zone(ZoneEvent {
            kind: EventKind::Enter,
            zone_id: "door".into(),
            track_id,
            frame: 1,
            timestamp_ms: 0,
            reason: None,
        })
    }

    fn fast_config() -> SinkConfig {
        SinkConfig {
            max_retries: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 4,
            ..SinkConfig::default()
        }
    }

    #[test]
    fn test_transient_failures_are_retried() {
        let sink = FlakySink::new(2, false);
        let metrics = ChannelMetrics::default();
        let cancel = AtomicBool::new(false);
        assert!(deliver(&sink, &[event(1)], &fast_config(), &metrics, &cancel));
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.sink_retries, 2);
        assert_eq!(snapshot.sink_records_written, 1);
        assert_eq!(sink.written.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_gives_up_after_max_retries() {
        let sink = FlakySink::new(10, false);
        let metrics = ChannelMetrics::default();
        let cancel = AtomicBool::new(false);
        assert!(!deliver(&sink, &[event(1), event(2)], &fast_config(), &metrics, &cancel));
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.sink_retries, 3);
        assert_eq!(snapshot.sink_records_dropped, 2);
    }

    #[test]
    fn test_permanent_failure_is_not_retried() {
        let sink = FlakySink::new(1, true);
        let metrics = ChannelMetrics::default();
        let cancel = AtomicBool::new(false);
        assert!(!deliver(&sink, &[event(1)], &fast_config(), &metrics, &cancel));
        assert_eq!(metrics.snapshot().sink_retries, 0);
    }

    #[test]
    fn test_writer_flushes_on_disconnect() {
        let sink = Arc::new(FlakySink::new(0, false));
        let metrics = Arc::new(ChannelMetrics::default());
        let cancel = Arc::new(AtomicBool::new(false));
        let (tx, rx) = crossbeam_channel::bounded(16);
        let config = SinkConfig {
            batch_size: 2,
            flush_interval_ms: 10_000,
            ..fast_config()
        };
        let handles =
            spawn_writers("test", sink.clone(), rx, &config, metrics.clone(), cancel).unwrap();
        for id in 1..=3 {
            tx.send(event(id)).unwrap();
        }
        drop(tx);
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(sink.written.lock().unwrap().len(), 3);
        assert_eq!(metrics.snapshot().sink_batches, 2);
    }

    #[test]
    fn test_record_json_tag() {
        let json = serde_json::to_value(event(7)).unwrap();
        assert_eq!(json["record"], "zone");
        assert_eq!(json["type"], "enter");
        assert_eq!(json["track_id"], 7);
    }
}
