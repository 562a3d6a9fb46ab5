//! `rescuelink-runtime` – Concurrency and lifecycle.
//!
//! Runs perception and control side by side without letting either stall
//! the other, and makes sure every collaborator is released exactly once.
//!
//! # Modules
//!
//! - [`shutdown`] – [`RunFlag`][shutdown::RunFlag], the cooperative
//!   cancellation token, and the operator's latched emergency-stop and
//!   recall inputs ([`OperatorLatch`][shutdown::OperatorLatch]).
//! - [`perception_loop`] – the frame grabber and the
//!   [`PerceptionLoop`][perception_loop::PerceptionLoop] that feeds the
//!   obstacle monitor.
//! - [`control_loop`] – [`ControlLoop`][control_loop::ControlLoop]: the
//!   fixed-rate driver of the mission controller.
//! - [`system`] – [`RescueSystem`][system::RescueSystem]: startup, task
//!   supervision and the single finalization path.
//! - [`observability`] – [`init_tracing`][observability::init_tracing]:
//!   initialises the global `tracing` subscriber with an optional OTLP span
//!   exporter.
//!
//! # Shared state
//!
//! The two loops share exactly one value: the committed
//! [`HazardSignal`][rescuelink_types::HazardSignal], written by the
//! perception loop's obstacle monitor and read through a
//! [`HazardReader`][rescuelink_perception::HazardReader] by the control loop.

pub mod control_loop;
pub mod observability;
pub mod perception_loop;
pub mod shutdown;
pub mod system;

pub use control_loop::ControlLoop;
pub use observability::{TracerProviderGuard, init_tracing};
pub use perception_loop::{PerceptionLoop, run_frame_grabber};
pub use shutdown::{EmergencyLatch, OperatorLatch, RecallLatch, RunFlag};
pub use system::{Collaborators, RescueSystem, RunSummary, SystemConfig};
