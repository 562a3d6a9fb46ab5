//! The telemetry publish contract.
//!
//! The mission controller only ever sees a [`TelemetrySink`].  Publishing is
//! fire-and-forget: a sink must not block the control tick and must not
//! fail it.

use std::sync::{Arc, Mutex};

use rescuelink_types::TelemetryEvent;
use tracing::debug;

use crate::bus::TelemetryBus;

pub trait TelemetrySink: Send + Sync {
    fn publish(&self, event: TelemetryEvent);
}

/// Sink that forwards onto a [`TelemetryBus`].
#[derive(Clone, Debug)]
pub struct BusTelemetrySink {
    bus: TelemetryBus,
}

impl BusTelemetrySink {
    pub fn new(bus: TelemetryBus) -> Self {
        Self { bus }
    }

    pub fn bus(&self) -> &TelemetryBus {
        &self.bus
    }
}

impl TelemetrySink for BusTelemetrySink {
    fn publish(&self, event: TelemetryEvent) {
        let kind = event.payload.kind();
        // No listener is normal when the dashboard is not attached.
        if let Err(e) = self.bus.publish(event) {
            debug!(kind, error = %e, "telemetry event had no subscribers");
        }
    }
}

/// Sink that keeps every event in memory, in publish order.
#[derive(Clone, Debug, Default)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<TelemetryEvent>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Wire `type` of every recorded event, e.g. `["status", "log"]`.
    pub fn kinds(&self) -> Vec<&'static str> {
        self.events().iter().map(|e| e.payload.kind()).collect()
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }
}

impl TelemetrySink for RecordingSink {
    fn publish(&self, event: TelemetryEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
