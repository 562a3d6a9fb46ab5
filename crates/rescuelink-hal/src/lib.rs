//! Collaborator contracts for RescueLink.
//!
//! The core never talks to hardware directly.  It talks to four traits:
//!
//! | Trait | Collaborator |
//! |---|---|
//! | [`FrameSource`] | camera / frame grabber |
//! | [`Detector`] | object-detection model |
//! | [`CommandLink`] | flight-controller command channel |
//! | [`TelemetrySource`] | vehicle battery / link / position feed |
//!
//! [`sim`] provides in-process drivers for all four so the whole stack runs
//! headless in tests and in the demo binary.

pub mod camera;
pub mod detector;
pub mod link;
pub mod sim;
pub mod telemetry;

pub use camera::{CameraFrame, FrameSource};
pub use detector::Detector;
pub use link::CommandLink;
pub use telemetry::TelemetrySource;
