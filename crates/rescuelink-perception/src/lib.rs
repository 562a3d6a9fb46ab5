//! `rescuelink-perception` – Hazard debounce layer.
//!
//! Turns the noisy, irregular detection stream of the vision collaborator
//! into a single debounced [`HazardSignal`][rescuelink_types::HazardSignal]
//! that the control loop can read without ever waiting on inference.
//!
//! # Modules
//!
//! - [`obstacle_monitor`] – [`ObstacleMonitor`][obstacle_monitor::ObstacleMonitor]:
//!   filters detections by class and confidence, applies raise/clear
//!   hysteresis, and commits the result to a watch cell read through
//!   [`HazardReader`][obstacle_monitor::HazardReader] handles.
//! - [`frame_slot`] – [`frame_slot()`][frame_slot::frame_slot]: single-slot,
//!   most-recent-wins handoff between the frame grabber and the inference
//!   loop, so a slow detector skips stale frames instead of queuing them.

pub mod frame_slot;
pub mod obstacle_monitor;

pub use frame_slot::{FramePublisher, FrameSubscriber, LatestFrame, frame_slot};
pub use obstacle_monitor::{HazardPolicy, HazardReader, IngestOutcome, MonitorStats, ObstacleMonitor};
