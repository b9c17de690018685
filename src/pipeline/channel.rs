//! Threaded per-channel pipeline.
//!
//! ```text
//! producer -> [frame queue, drop oldest] -> detection workers
//!          -> coordinator (ChannelContext) -> [task queue, drop lowest] -> model workers
//!                                          -> [sink queue] -> sink writers
//! ```
//!
//! Only the coordinator thread touches tracking state; every other thread
//! talks to it through bounded queues.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvError, Sender, TrySendError, bounded, never, select};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::classify::Priority;
use crate::error::{CollaboratorError, Error, Result};
use crate::pipeline::collaborator::{Collaborators, FrameSource};
use crate::pipeline::config::PipelineConfig;
use crate::pipeline::context::{ChannelContext, FrameOutcome};
use crate::pipeline::frame::Frame;
use crate::pipeline::metrics::{ChannelMetrics, MetricsSnapshot, add, bump};
use crate::pipeline::queue::{DropOldestQueue, PushOutcome, TaskQueue};
use crate::pipeline::sink::{self, Sink, SinkRecord};
use crate::pipeline::workers::{
    self, DetectionOutput, ModelOutput, ModelResult, ModelTask, POLL, PendingFrame,
};
use crate::zone::{ZoneCount, ZoneDefinition, ZoneEvent};

/// State shared by every thread of one channel.
pub(crate) struct Shared {
    pub channel_id: String,
    pub metrics: Arc<ChannelMetrics>,
    pub frames: DropOldestQueue<PendingFrame>,
    pub accepting: AtomicBool,
    /// No new frames will arrive; detection workers exit once idle
    pub draining: AtomicBool,
    /// Abandon all queued work immediately
    pub cancel: Arc<AtomicBool>,
    pub counts: Mutex<BTreeMap<String, ZoneCount>>,
}

impl Shared {
    fn submit(&self, frame: Frame) -> Result<()> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(Error::ChannelClosed);
        }
        bump(&self.metrics.frames_submitted);
        let evicted = self.frames.push(PendingFrame {
            frame,
            submitted_at: Instant::now(),
        });
        if evicted > 0 {
            debug!(channel = %self.channel_id, evicted, "frame queue full, dropped oldest");
            add(&self.metrics.frames_dropped, evicted);
        }
        self.metrics
            .frame_queue_depth
            .store(self.frames.len(), Ordering::Relaxed);
        Ok(())
    }
}

/// Builder for one channel's thread set.
pub struct ChannelPipeline {
    channel_id: String,
    config: PipelineConfig,
    zones: Vec<ZoneDefinition>,
    collaborators: Collaborators,
    sink: Arc<dyn Sink>,
}

impl ChannelPipeline {
    pub fn new(
        channel_id: impl Into<String>,
        collaborators: Collaborators,
        sink: impl Sink + 'static,
    ) -> Self {
        Self::with_shared_sink(channel_id, collaborators, Arc::new(sink))
    }

    /// Several channels may write to one sink.
    pub fn with_shared_sink(
        channel_id: impl Into<String>,
        collaborators: Collaborators,
        sink: Arc<dyn Sink>,
    ) -> Self {
        Self {
            channel_id: channel_id.into(),
            config: PipelineConfig::default(),
            zones: Vec::new(),
            collaborators,
            sink,
        }
    }

    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn zones(mut self, zones: Vec<ZoneDefinition>) -> Self {
        self.zones = zones;
        self
    }

    /// Validate the zones and start the worker threads.
    pub fn spawn(self) -> Result<ChannelHandle> {
        let Self {
            channel_id,
            config,
            zones,
            collaborators,
            sink,
        } = self;

        let context = ChannelContext::new(channel_id.clone(), &config, zones)?.with_models(
            collaborators.classifier.is_some(),
            collaborators.embedder.is_some(),
        );

        let metrics = Arc::new(ChannelMetrics::default());
        let cancel = Arc::new(AtomicBool::new(false));
        let shared = Arc::new(Shared {
            channel_id: channel_id.clone(),
            metrics: Arc::clone(&metrics),
            frames: DropOldestQueue::new(config.workers.frame_queue),
            accepting: AtomicBool::new(true),
            draining: AtomicBool::new(false),
            cancel: Arc::clone(&cancel),
            counts: Mutex::new(context.counts()),
        });
        let tasks: Arc<TaskQueue<Priority, ModelTask>> =
            Arc::new(TaskQueue::new(config.workers.task_queue));

        let mut threads = Threads::default();
        let started = Self::start_threads(
            &shared,
            &tasks,
            &config,
            &collaborators,
            sink,
            context,
            &mut threads,
        );
        if let Err(err) = started {
            error!(channel = %channel_id, %err, "failed to start channel, cancelling");
            cancel.store(true, Ordering::SeqCst);
            tasks.close();
            return Err(err);
        }

        info!(channel = %channel_id, threads = threads.handles.len(), "channel started");
        Ok(ChannelHandle {
            shared,
            tasks,
            threads,
        })
    }

    fn start_threads(
        shared: &Arc<Shared>,
        tasks: &Arc<TaskQueue<Priority, ModelTask>>,
        config: &PipelineConfig,
        collaborators: &Collaborators,
        output: Arc<dyn Sink>,
        context: ChannelContext,
        threads: &mut Threads,
    ) -> Result<()> {
        let id = shared.channel_id.as_str();
        let limits = &config.workers;

        let (record_tx, record_rx) = bounded::<SinkRecord>(config.sink.queue.max(1));
        for handle in sink::spawn_writers(
            id,
            output,
            record_rx,
            &config.sink,
            Arc::clone(&shared.metrics),
            Arc::clone(&shared.cancel),
        )? {
            threads.push(handle);
        }

        let (detection_tx, detection_rx) = bounded::<DetectionOutput>(limits.frame_queue.max(1) * 2);
        for n in 0..limits.detection_workers.max(1) {
            let name = format!("{id}-detect-{n}");
            let shared = Arc::clone(shared);
            let detector = Arc::clone(&collaborators.detector);
            let frames = shared.frames.receiver();
            let results = detection_tx.clone();
            let timeout = limits.detection_timeout();
            threads.spawn(name, move |name| {
                workers::run_named(name, || {
                    workers::detection_loop(&shared, detector.as_ref(), &frames, &results, timeout)
                })
            })?;
        }
        drop(detection_tx);

        let (model_tx, model_rx) = bounded::<ModelOutput>(limits.task_queue.max(1) * 2);
        let has_models = collaborators.classifier.is_some() || collaborators.embedder.is_some();
        if has_models {
            for n in 0..limits.model_workers.max(1) {
                let name = format!("{id}-model-{n}");
                let shared = Arc::clone(shared);
                let models = collaborators.clone();
                let tasks = Arc::clone(tasks);
                let results = model_tx.clone();
                let timeout = limits.task_timeout();
                threads.spawn(name, move |name| {
                    workers::run_named(name, || {
                        workers::model_loop(&shared, &models, &tasks, &results, timeout)
                    })
                })?;
            }
        }
        drop(model_tx);

        let coordinator = Coordinator {
            shared: Arc::clone(shared),
            tasks: Arc::clone(tasks),
            context,
            records: record_tx,
            frame_budget: limits.frame_budget(),
        };
        threads.spawn(format!("{id}-coordinator-0"), move |name| {
            workers::run_named(name, || coordinator.run(detection_rx, model_rx))
        })?;
        Ok(())
    }
}

#[derive(Default)]
struct Threads {
    handles: Vec<(String, JoinHandle<()>)>,
}

impl Threads {
    fn spawn(&mut self, name: String, body: impl FnOnce(&str) + Send + 'static) -> Result<()> {
        let thread_name = name.clone();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || body(&thread_name))?;
        self.handles.push((name, handle));
        Ok(())
    }

    fn push(&mut self, handle: JoinHandle<()>) {
        let name = handle.thread().name().unwrap_or("unnamed").to_string();
        self.handles.push((name, handle));
    }

    fn all_finished(&self) -> bool {
        self.handles.iter().all(|(_, h)| h.is_finished())
    }

    /// Join finished threads; return the names of those still running.
    fn reap(&mut self) -> Vec<String> {
        let mut running = Vec::new();
        for (name, handle) in std::mem::take(&mut self.handles) {
            if handle.is_finished() {
                if handle.join().is_err() {
                    error!(thread = %name, "worker panicked");
                }
            } else {
                running.push(name);
            }
        }
        running
    }
}

/// Summary of a [`ChannelHandle::shutdown`].
#[derive(Debug, Clone, Serialize)]
pub struct ShutdownReport {
    /// The grace period ran out and queued work was abandoned
    pub forced: bool,
    pub frames_dropped: usize,
    pub tasks_dropped: usize,
    /// Threads still blocked in a collaborator call, left detached
    pub abandoned_threads: Vec<String>,
    pub counts: BTreeMap<String, ZoneCount>,
    pub metrics: MetricsSnapshot,
}

/// Running channel. Dropping the handle without calling
/// [`ChannelHandle::shutdown`] cancels every thread.
pub struct ChannelHandle {
    shared: Arc<Shared>,
    tasks: Arc<TaskQueue<Priority, ModelTask>>,
    threads: Threads,
}

impl ChannelHandle {
    pub fn channel_id(&self) -> &str {
        &self.shared.channel_id
    }

    /// Queue a frame for detection. Never blocks: when the frame queue is
    /// full the oldest queued frame is dropped.
    pub fn submit(&self, frame: Frame) -> Result<()> {
        self.shared.submit(frame)
    }

    /// Pull frames from `source` on a dedicated producer thread until it is
    /// exhausted or the channel shuts down.
    pub fn spawn_producer(&mut self, mut source: impl FrameSource) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        let name = format!("{}-producer-{}", shared.channel_id, self.threads.handles.len());
        self.threads.spawn(name, move |name| {
            workers::run_named(name, || {
                while let Some(frame) = source.next_frame() {
                    if shared.submit(frame).is_err() {
                        break;
                    }
                }
            })
        })
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Zone counts as of the last processed frame.
    pub fn counts(&self) -> BTreeMap<String, ZoneCount> {
        self.shared
            .counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Stop accepting frames and let queued work finish within `grace`.
    /// Past the deadline every worker is cancelled and the remaining queue
    /// contents are dropped and counted.
    pub fn shutdown(mut self, grace: Duration) -> ShutdownReport {
        let id = self.shared.channel_id.clone();
        info!(channel = %id, ?grace, "channel shutting down");
        self.shared.accepting.store(false, Ordering::Release);
        self.shared.draining.store(true, Ordering::Release);

        let deadline = Instant::now() + grace;
        while !self.threads.all_finished() && Instant::now() < deadline {
            thread::sleep(POLL / 2);
        }

        let forced = !self.threads.all_finished();
        let (mut frames_dropped, mut tasks_dropped) = (0, 0);
        if forced {
            warn!(channel = %id, "grace period expired, cancelling workers");
            self.shared.cancel.store(true, Ordering::SeqCst);
            self.tasks.close();
            // Workers notice the flag within one poll interval unless they
            // are stuck inside a collaborator call.
            let settle = Instant::now() + POLL * 10;
            while !self.threads.all_finished() && Instant::now() < settle {
                thread::sleep(POLL / 2);
            }
            frames_dropped = self.shared.frames.clear();
            tasks_dropped = self.tasks.drain().len();
            add(&self.shared.metrics.frames_dropped, frames_dropped);
            add(&self.shared.metrics.tasks_dropped, tasks_dropped);
            workers::warn_dropped(&self.shared, frames_dropped, tasks_dropped);
        }

        let abandoned_threads = self.threads.reap();
        if !abandoned_threads.is_empty() {
            error!(channel = %id, threads = ?abandoned_threads, "threads did not stop, detaching");
        }
        info!(channel = %id, forced, "channel stopped");
        ShutdownReport {
            forced,
            frames_dropped,
            tasks_dropped,
            abandoned_threads,
            counts: self.counts(),
            metrics: self.metrics(),
        }
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        if !self.threads.handles.is_empty() {
            self.shared.accepting.store(false, Ordering::Release);
            self.shared.cancel.store(true, Ordering::SeqCst);
            self.tasks.close();
        }
    }
}

enum Wake {
    Detection(std::result::Result<DetectionOutput, RecvError>),
    Model(std::result::Result<ModelOutput, RecvError>),
    Idle,
}

/// Owner of the [`ChannelContext`]; runs on its own thread.
struct Coordinator {
    shared: Arc<Shared>,
    tasks: Arc<TaskQueue<Priority, ModelTask>>,
    context: ChannelContext,
    records: Sender<SinkRecord>,
    frame_budget: Duration,
}

impl Coordinator {
    fn run(mut self, mut detections: Receiver<DetectionOutput>, mut models: Receiver<ModelOutput>) {
        let (mut detections_done, mut models_done) = (false, false);
        loop {
            if self.shared.cancel.load(Ordering::Relaxed) {
                warn!(channel = %self.shared.channel_id, "coordinator cancelled");
                return;
            }
            let wake = select! {
                recv(detections) -> msg => Wake::Detection(msg),
                recv(models) -> msg => Wake::Model(msg),
                default(POLL) => Wake::Idle,
            };
            match wake {
                Wake::Detection(Ok(output)) => self.on_detections(output),
                Wake::Detection(Err(RecvError)) => {
                    // Detection finished: no new model work will come.
                    detections_done = true;
                    detections = never();
                    self.tasks.close();
                }
                Wake::Model(Ok(output)) => self.on_model_output(output),
                Wake::Model(Err(RecvError)) => {
                    models_done = true;
                    models = never();
                }
                Wake::Idle => {}
            }
            if detections_done && models_done {
                break;
            }
        }

        let events = self.context.finish();
        self.emit_events(events);
        self.publish_counts();
        // Dropping `self.records` lets the sink writers flush and exit.
    }

    fn on_detections(&mut self, output: DetectionOutput) {
        let metrics = &self.shared.metrics;
        let detections = match output.detections {
            Ok(detections) => detections,
            Err(CollaboratorError::TimedOut) => {
                bump(&metrics.detection_timeouts);
                warn!(channel = %self.shared.channel_id, frame = output.frame.index, "detection timed out, frame skipped");
                return;
            }
            Err(err) => {
                bump(&metrics.detection_failures);
                warn!(channel = %self.shared.channel_id, frame = output.frame.index, %err, "detection failed, frame skipped");
                return;
            }
        };

        let Some(outcome) = self
            .context
            .process_detections(output.frame.meta(), detections)
        else {
            bump(&metrics.stale_results);
            return;
        };
        self.dispatch_requests(&output.frame, &outcome);
        self.emit_events(outcome.events);
        self.publish_counts();

        let latency = output.submitted_at.elapsed();
        self.shared.metrics.record_frame(latency);
        if latency > self.frame_budget {
            bump(&self.shared.metrics.budget_overruns);
            debug!(channel = %self.shared.channel_id, frame = outcome.frame, ?latency, "frame over budget");
        }
    }

    fn dispatch_requests(&mut self, frame: &Frame, outcome: &FrameOutcome) {
        for request in &outcome.requests {
            let Some(crop) = frame.crop(&request.bbox) else {
                self.context.model_failed(request.kind, request.track_id);
                continue;
            };
            let task = ModelTask {
                request: request.clone(),
                frame: outcome.frame,
                crop,
                enqueued_at: Instant::now(),
            };
            match self.tasks.push(request.priority, task) {
                PushOutcome::Accepted => bump(&self.shared.metrics.tasks_submitted),
                PushOutcome::Evicted(dropped) => {
                    bump(&self.shared.metrics.tasks_submitted);
                    bump(&self.shared.metrics.tasks_dropped);
                    debug!(track_id = dropped.request.track_id, "task queue full, dropped lowest priority");
                    self.context
                        .model_failed(dropped.request.kind, dropped.request.track_id);
                }
                PushOutcome::Rejected(refused) | PushOutcome::Closed(refused) => {
                    bump(&self.shared.metrics.tasks_dropped);
                    self.context
                        .model_failed(refused.request.kind, refused.request.track_id);
                }
            }
        }
        self.shared
            .metrics
            .task_queue_depth
            .store(self.tasks.len(), Ordering::Relaxed);
    }

    fn on_model_output(&mut self, output: ModelOutput) {
        match output.result {
            Ok(ModelResult::Classified(classification)) => {
                if let Some(record) =
                    self.context
                        .apply_classification(output.track_id, output.frame, &classification)
                {
                    self.send_record(record);
                }
            }
            Ok(ModelResult::Embedded(embedding)) => {
                let (_, events) = self.context.apply_embedding(output.track_id, embedding);
                self.emit_events(events);
            }
            Err(err) => {
                let counter = match err {
                    CollaboratorError::TimedOut => &self.shared.metrics.task_timeouts,
                    _ => &self.shared.metrics.task_failures,
                };
                bump(counter);
                debug!(track_id = output.track_id, kind = ?output.kind, %err, "model task failed");
                self.context.model_failed(output.kind, output.track_id);
            }
        }
    }

    fn emit_events(&mut self, events: Vec<ZoneEvent>) {
        add(&self.shared.metrics.zone_events, events.len());
        for event in events {
            self.send_record(SinkRecord::Zone(event));
        }
    }

    /// Hand a record to the sink writers without ever blocking.
    fn send_record(&self, record: SinkRecord) {
        match self.records.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                bump(&self.shared.metrics.sink_records_dropped);
                warn!(channel = %self.shared.channel_id, "sink queue full, record dropped");
            }
            Err(TrySendError::Disconnected(_)) => {
                bump(&self.shared.metrics.sink_records_dropped);
            }
        }
        self.shared
            .metrics
            .sink_queue_depth
            .store(self.records.len(), Ordering::Relaxed);
    }

    fn publish_counts(&self) {
        *self
            .shared
            .counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = self.context.counts();
    }
}
