//! `TelemetrySource` – the vehicle state feed read once per control tick.

use rescuelink_types::{RescueError, VehicleTelemetry};

pub trait TelemetrySource: Send {
    fn id(&self) -> &str;

    /// Latest vehicle telemetry.  Must not block.
    ///
    /// # Errors
    ///
    /// Returns [`RescueError::SensorFault`] when no reading is available;
    /// the control loop skips that tick.
    fn latest(&mut self) -> Result<VehicleTelemetry, RescueError>;
}
