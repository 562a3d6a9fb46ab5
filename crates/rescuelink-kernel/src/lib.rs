//! `rescuelink-kernel` – Mission decisions.
//!
//! Decides, once per control tick, what the vehicle should do next.  It does
//! not perceive and it does not fly; it reads a hazard snapshot and vehicle
//! telemetry and issues at most one command.
//!
//! # Modules
//!
//! - [`sequencer`] – [`WaypointSequencer`][sequencer::WaypointSequencer]:
//!   the mission plan and its progress pointer.
//! - [`dispatcher`] – [`CommandDispatcher`][dispatcher::CommandDispatcher]:
//!   wraps a [`CommandLink`][rescuelink_hal::CommandLink] with per-call
//!   timeouts, retries and exponential backoff.
//! - [`controller`] – [`MissionController`][controller::MissionController]:
//!   the mission state machine.

pub mod controller;
pub mod dispatcher;
pub mod sequencer;

pub use controller::{MissionConfig, MissionController, TickInputs, TickReport};
pub use dispatcher::{Command, CommandDispatcher, RetryPolicy};
pub use sequencer::WaypointSequencer;
