//! `rescuelink-middleware` – telemetry plumbing.
//!
//! Carries operator-facing telemetry out of the core without the core caring
//! who listens.
//!
//! # Modules
//!
//! - [`bus`] – Topic-based publish/subscribe telemetry bus built on Tokio
//!   broadcast channels.
//! - [`sink`] – The [`TelemetrySink`] contract the mission controller
//!   publishes through, plus bus-backed and recording implementations.
//! - [`dashboard`] – Encodes telemetry events as dashboard frames.

pub mod bus;
pub mod dashboard;
pub mod sink;

pub use bus::{TelemetryBus, Topic, TopicReceiver};
pub use dashboard::dashboard_frame;
pub use sink::{BusTelemetrySink, RecordingSink, TelemetrySink};
