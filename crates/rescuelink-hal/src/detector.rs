//! `Detector` trait: the object-detection model as seen by the core.

use rescuelink_types::{HazardEvent, RescueError};

use crate::camera::CameraFrame;

/// An object detector producing zero or more detections per frame.
///
/// Inference is blocking and may be slow; the runtime runs it on the
/// blocking pool and never lets it hold up the control loop.
pub trait Detector: Send {
    fn id(&self) -> &str;

    /// Load the model.
    ///
    /// # Errors
    ///
    /// Returns [`RescueError::Startup`] when the model cannot be loaded.
    fn open(&mut self) -> Result<(), RescueError>;

    /// Run inference on `frame`.  Filtering by class and confidence is the
    /// obstacle monitor's job; detectors report everything they see.
    ///
    /// # Errors
    ///
    /// Returns [`RescueError::SensorFault`] for a failed inference.
    fn detect(&mut self, frame: &CameraFrame) -> Result<Vec<HazardEvent>, RescueError>;

    /// Unload the model.  Called exactly once, during shutdown.
    fn release(&mut self);
}
