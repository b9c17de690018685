//! Per-channel orchestration: queues, worker pools, the coordinator and
//! the storage sink.

mod builder;
mod channel;
mod collaborator;
mod config;
mod context;
mod frame;
mod metrics;
mod queue;
mod sink;
mod workers;

pub use builder::DetectionBuilder;
pub use channel::{ChannelHandle, ChannelPipeline, ShutdownReport};
pub use collaborator::{Classification, Classifier, Collaborators, Detector, Embedder, FrameSource};
pub use config::{PipelineConfig, SinkConfig, WorkerConfig};
pub use context::{ChannelContext, FrameOutcome, ModelKind, ModelRequest};
pub use frame::{Crop, Frame, FrameMeta};
pub use metrics::{ChannelMetrics, MetricsSnapshot};
pub use queue::{DropOldestQueue, PushOutcome, TaskQueue};
pub use sink::{ClassificationRecord, Sink, SinkRecord};
