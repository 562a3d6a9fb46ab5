//! `FrameSource` trait and the frame type handed to the detector.

use chrono::{DateTime, Utc};
use rescuelink_types::RescueError;

/// A raw image frame returned by a frame source.
#[derive(Debug, Clone)]
pub struct CameraFrame {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Raw pixel data (e.g. RGB24 or greyscale).
    pub data: Vec<u8>,
    /// Capture counter assigned by the source, starting at 1.
    pub seq: u64,
    pub captured_at: DateTime<Utc>,
}

/// A camera or other image-capture device.
///
/// Calls are blocking; the runtime moves the source onto the blocking pool
/// for every capture.
pub trait FrameSource: Send {
    /// Stable identifier, e.g. `"nose_rgb"`.
    fn id(&self) -> &str;

    /// Acquire the device.
    ///
    /// # Errors
    ///
    /// Returns [`RescueError::Startup`] when the device cannot be opened.
    fn open(&mut self) -> Result<(), RescueError>;

    /// Capture and return the next available frame.
    ///
    /// # Errors
    ///
    /// Returns [`RescueError::SensorFault`] on a read miss.  The runtime
    /// treats this as transient.
    fn capture(&mut self) -> Result<CameraFrame, RescueError>;

    /// Release the device.  Called exactly once, during shutdown.
    fn release(&mut self);
}
