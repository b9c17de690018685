//! Detection and model worker loops.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info, warn};

use crate::TrackId;
use crate::classify::Priority;
use crate::error::CollaboratorError;
use crate::pipeline::channel::Shared;
use crate::pipeline::collaborator::{Classification, Collaborators, Detector};
use crate::pipeline::context::{ModelKind, ModelRequest};
use crate::pipeline::frame::{Crop, Frame};
use crate::pipeline::queue::TaskQueue;
use crate::reid::Embedding;
use crate::tracker::Detection;

/// Wake-up interval of idle workers, bounding shutdown latency.
pub(crate) const POLL: Duration = Duration::from_millis(20);

pub(crate) struct PendingFrame {
    pub frame: Frame,
    pub submitted_at: Instant,
}

pub(crate) struct DetectionOutput {
    pub frame: Frame,
    pub submitted_at: Instant,
    pub detections: Result<Vec<Detection>, CollaboratorError>,
}

pub(crate) struct ModelTask {
    pub request: ModelRequest,
    pub frame: u64,
    pub crop: Crop,
    pub enqueued_at: Instant,
}

pub(crate) enum ModelResult {
    Classified(Classification),
    Embedded(Embedding),
}

pub(crate) struct ModelOutput {
    pub kind: ModelKind,
    pub track_id: TrackId,
    pub frame: u64,
    pub result: Result<ModelResult, CollaboratorError>,
}

pub(crate) fn detection_loop(
    shared: &Shared,
    detector: &dyn Detector,
    frames: &Receiver<PendingFrame>,
    results: &Sender<DetectionOutput>,
    timeout: Duration,
) {
    loop {
        if shared.cancel.load(Ordering::Relaxed) {
            return;
        }
        let pending = match frames.recv_timeout(POLL) {
            Ok(pending) => pending,
            Err(RecvTimeoutError::Timeout) => {
                if shared.draining.load(Ordering::Relaxed) {
                    return;
                }
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => return,
        };
        shared
            .metrics
            .frame_queue_depth
            .store(frames.len(), Ordering::Relaxed);

        let started = Instant::now();
        let mut detections = detector.detect(&pending.frame);
        let elapsed = started.elapsed();
        if detections.is_ok() && elapsed > timeout {
            debug!(frame = pending.frame.index, ?elapsed, "detection exceeded its deadline");
            detections = Err(CollaboratorError::TimedOut);
        }

        let output = DetectionOutput {
            frame: pending.frame,
            submitted_at: pending.submitted_at,
            detections,
        };
        if results.send(output).is_err() {
            return;
        }
    }
}

pub(crate) fn model_loop(
    shared: &Shared,
    models: &Collaborators,
    tasks: &TaskQueue<Priority, ModelTask>,
    results: &Sender<ModelOutput>,
    timeout: Duration,
) {
    loop {
        if shared.cancel.load(Ordering::Relaxed) {
            return;
        }
        let Some(task) = tasks.pop_timeout(POLL) else {
            if tasks.is_closed() && tasks.is_empty() {
                return;
            }
            continue;
        };
        shared
            .metrics
            .task_queue_depth
            .store(tasks.len(), Ordering::Relaxed);

        let kind = task.request.kind;
        let result = if task.enqueued_at.elapsed() > timeout {
            Err(CollaboratorError::TimedOut)
        } else {
            run_model(models, kind, &task.crop)
        };
        let output = ModelOutput {
            kind,
            track_id: task.request.track_id,
            frame: task.frame,
            result,
        };
        if results.send(output).is_err() {
            return;
        }
    }
}

fn run_model(
    models: &Collaborators,
    kind: ModelKind,
    crop: &Crop,
) -> Result<ModelResult, CollaboratorError> {
    let missing = || CollaboratorError::Unavailable(format!("no {kind:?} backend configured"));
    match kind {
        ModelKind::Classify => {
            let classifier = models.classifier.as_ref().ok_or_else(missing)?;
            classifier.classify(crop).map(ModelResult::Classified)
        }
        ModelKind::Embed => {
            let embedder = models.embedder.as_ref().ok_or_else(missing)?;
            embedder.embed(crop).map(ModelResult::Embedded)
        }
    }
}

/// Spawned thread body wrapper: logs start and stop.
pub(crate) fn run_named(name: &str, body: impl FnOnce()) {
    info!(thread = name, "worker started");
    body();
    info!(thread = name, "worker stopped");
}

pub(crate) fn warn_dropped(shared: &Arc<Shared>, frames: usize, tasks: usize) {
    if frames + tasks > 0 {
        warn!(channel = %shared.channel_id, frames, tasks, "queued work dropped at shutdown");
    }
}
