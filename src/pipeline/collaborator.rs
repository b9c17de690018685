//! Capability traits for the external models and the frame source.

use std::sync::Arc;

use crate::error::CollaboratorError;
use crate::pipeline::frame::{Crop, Frame};
use crate::reid::Embedding;
use crate::tracker::Detection;

/// Person detection backend.
///
/// Implementations are shared by the detection workers, so `detect` takes
/// `&self`; backends with mutable state wrap it in a lock or a pool.
///
/// # Example
///
/// ```ignore
/// use zonetrack_rs::pipeline::Detector;
///
/// struct MyDetector {
///     // Your model here
/// }
///
/// impl Detector for MyDetector {
///     fn detect(&self, frame: &Frame) -> Result<Vec<Detection>, CollaboratorError> {
///         // Run inference and return person boxes
///         Ok(vec![])
///     }
/// }
/// ```
pub trait Detector: Send + Sync {
    fn detect(&self, frame: &Frame) -> Result<Vec<Detection>, CollaboratorError>;
}

/// Appearance embedding backend for Re-ID.
pub trait Embedder: Send + Sync {
    fn embed(&self, crop: &Crop) -> Result<Embedding, CollaboratorError>;
}

/// Raw, unstabilized label for one person crop.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub label: String,
    pub confidence: f32,
}

impl Classification {
    pub fn new(label: impl Into<String>, confidence: f32) -> Self {
        Self {
            label: label.into(),
            confidence,
        }
    }
}

/// Person attribute classifier (e.g. staff vs customer).
pub trait Classifier: Send + Sync {
    fn classify(&self, crop: &Crop) -> Result<Classification, CollaboratorError>;
}

/// Models used by one channel. Only the detector is mandatory.
#[derive(Clone)]
pub struct Collaborators {
    pub detector: Arc<dyn Detector>,
    pub embedder: Option<Arc<dyn Embedder>>,
    pub classifier: Option<Arc<dyn Classifier>>,
}

impl Collaborators {
    pub fn new(detector: impl Detector + 'static) -> Self {
        Self {
            detector: Arc::new(detector),
            embedder: None,
            classifier: None,
        }
    }

    pub fn with_embedder(mut self, embedder: impl Embedder + 'static) -> Self {
        self.embedder = Some(Arc::new(embedder));
        self
    }

    pub fn with_classifier(mut self, classifier: impl Classifier + 'static) -> Self {
        self.classifier = Some(Arc::new(classifier));
        self
    }
}

/// Pull-based frame producer; `None` ends the stream.
pub trait FrameSource: Send + 'static {
    fn next_frame(&mut self) -> Option<Frame>;
}

impl<I> FrameSource for I
where
    I: Iterator<Item = Frame> + Send + 'static,
{
    fn next_frame(&mut self) -> Option<Frame> {
        self.next()
    }
}
