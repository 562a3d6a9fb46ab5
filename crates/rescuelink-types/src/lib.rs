use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

// ────────────────────────────────────────────────────────────────────────────
// Perception
// ────────────────────────────────────────────────────────────────────────────

/// Normalised bounding box of a detection (`0.0..=1.0` in both axes).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x_min: f32,
    pub y_min: f32,
    pub x_max: f32,
    pub y_max: f32,
}

/// A single raw detection produced by the external vision collaborator.
///
/// The wire schema is `{class_id, confidence, timestamp}`; `label` and `bbox`
/// are optional extras carried for logging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HazardEvent {
    pub class_id: u32,
    pub confidence: f32,
    #[serde(rename = "timestamp")]
    pub detected_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<BoundingBox>,
}

impl HazardEvent {
    pub fn new(class_id: u32, confidence: f32, detected_at: DateTime<Utc>) -> Self {
        Self {
            class_id,
            confidence,
            detected_at,
            label: None,
            bbox: None,
        }
    }

    /// Attach a human-readable class name (builder-style).
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Check the invariants the wire schema cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`RescueError::MalformedEvent`] when the confidence is not a
    /// finite value in `[0, 1]` or the bounding box is degenerate.
    pub fn validate(&self) -> Result<(), RescueError> {
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(RescueError::MalformedEvent(format!(
                "confidence {} outside [0, 1]",
                self.confidence
            )));
        }
        if let Some(b) = self.bbox {
            let coords = [b.x_min, b.y_min, b.x_max, b.y_max];
            if coords.iter().any(|c| !c.is_finite()) || b.x_min > b.x_max || b.y_min > b.y_max {
                return Err(RescueError::MalformedEvent(format!(
                    "degenerate bounding box {b:?}"
                )));
            }
        }
        Ok(())
    }
}

/// The debounced hazard state committed by the obstacle monitor.
///
/// `last_seen` is the timestamp of the newest *eligible* event, whether or
/// not it was enough to raise the signal.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct HazardSignal {
    pub active: bool,
    pub confidence: f32,
    pub last_seen: Option<DateTime<Utc>>,
}

impl HazardSignal {
    /// `true` when the signal is inactive and no eligible event has been seen
    /// for at least `hold`.
    ///
    /// A `last_seen` in the future (detector clock ahead of ours) does not
    /// count as cleared.
    pub fn cleared_for(&self, now: DateTime<Utc>, hold: Duration) -> bool {
        if self.active {
            return false;
        }
        self.last_seen.is_none_or(|seen| {
            (now - seen)
                .to_std()
                .map(|elapsed| elapsed >= hold)
                .unwrap_or(false)
        })
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Mission plan
// ────────────────────────────────────────────────────────────────────────────

/// A geographic position reported by the vehicle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    #[serde(rename = "lat")]
    pub latitude: f64,
    #[serde(rename = "lon")]
    pub longitude: f64,
    #[serde(rename = "alt")]
    pub altitude: f32,
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6}, {:.6}", self.latitude, self.longitude)
    }
}

/// One entry of the mission plan. Immutable once created.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Waypoint {
    pub index: usize,
    #[serde(rename = "lat")]
    pub latitude: f64,
    #[serde(rename = "lon")]
    pub longitude: f64,
    #[serde(rename = "alt")]
    pub altitude: f32,
}

impl Waypoint {
    pub fn new(index: usize, latitude: f64, longitude: f64, altitude: f32) -> Self {
        Self {
            index,
            latitude,
            longitude,
            altitude,
        }
    }

    /// Return the waypoint's coordinates as a [`Position`].
    pub fn position(&self) -> Position {
        Position {
            latitude: self.latitude,
            longitude: self.longitude,
            altitude: self.altitude,
        }
    }

    fn validate(&self) -> Result<(), RescueError> {
        if !self.latitude.is_finite() || !(-90.0..=90.0).contains(&self.latitude) {
            return Err(RescueError::InvalidMission(format!(
                "waypoint {} latitude {} out of range",
                self.index, self.latitude
            )));
        }
        if !self.longitude.is_finite() || !(-180.0..=180.0).contains(&self.longitude) {
            return Err(RescueError::InvalidMission(format!(
                "waypoint {} longitude {} out of range",
                self.index, self.longitude
            )));
        }
        if !self.altitude.is_finite() {
            return Err(RescueError::InvalidMission(format!(
                "waypoint {} altitude is not finite",
                self.index
            )));
        }
        Ok(())
    }
}

/// Ordered list of waypoints; insertion order is flight order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MissionPlan {
    waypoints: Vec<Waypoint>,
}

impl MissionPlan {
    /// Build a plan from pre-indexed waypoints.
    ///
    /// # Errors
    ///
    /// Returns [`RescueError::InvalidMission`] when a waypoint's `index` does
    /// not match its position or its coordinates are out of range.
    pub fn new(waypoints: Vec<Waypoint>) -> Result<Self, RescueError> {
        for (position, wp) in waypoints.iter().enumerate() {
            if wp.index != position {
                return Err(RescueError::InvalidMission(format!(
                    "waypoint at position {position} carries index {}",
                    wp.index
                )));
            }
            wp.validate()?;
        }
        Ok(Self { waypoints })
    }

    /// Build a plan from `(latitude, longitude, altitude)` triples, assigning
    /// indices in order.
    pub fn from_coordinates(
        coords: impl IntoIterator<Item = (f64, f64, f32)>,
    ) -> Result<Self, RescueError> {
        let waypoints = coords
            .into_iter()
            .enumerate()
            .map(|(i, (lat, lon, alt))| Waypoint::new(i, lat, lon, alt))
            .collect();
        Self::new(waypoints)
    }

    pub fn waypoints(&self) -> &[Waypoint] {
        &self.waypoints
    }

    pub fn get(&self, index: usize) -> Option<&Waypoint> {
        self.waypoints.get(index)
    }

    pub fn len(&self) -> usize {
        self.waypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waypoints.is_empty()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Vehicle telemetry & mission state
// ────────────────────────────────────────────────────────────────────────────

/// Vehicle state read once per control tick.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VehicleTelemetry {
    pub battery_pct: f32,
    pub link_healthy: bool,
    #[serde(default)]
    pub position: Option<Position>,
    /// Index of the waypoint the flight controller reports as reached.
    #[serde(default)]
    pub reached_waypoint: Option<usize>,
}

impl VehicleTelemetry {
    pub fn new(battery_pct: f32, link_healthy: bool) -> Self {
        Self {
            battery_pct,
            link_healthy,
            position: None,
            reached_waypoint: None,
        }
    }

    pub fn with_position(mut self, position: Position) -> Self {
        self.position = Some(position);
        self
    }

    pub fn with_reached_waypoint(mut self, index: usize) -> Self {
        self.reached_waypoint = Some(index);
        self
    }

    /// # Errors
    ///
    /// Returns [`RescueError::InvalidTelemetry`] for a non-finite battery
    /// reading or one outside `[0, 100]`.
    pub fn validate(&self) -> Result<(), RescueError> {
        if !self.battery_pct.is_finite() || !(0.0..=100.0).contains(&self.battery_pct) {
            return Err(RescueError::InvalidTelemetry(format!(
                "battery_pct {} outside [0, 100]",
                self.battery_pct
            )));
        }
        Ok(())
    }
}

/// The mission controller's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MissionState {
    Nominal,
    Avoiding,
    Resuming,
    LowBatteryRth,
    EmergencyStop,
    Terminated,
}

impl MissionState {
    /// Terminal states have no outgoing transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, MissionState::EmergencyStop | MissionState::Terminated)
    }

    /// Operator-facing status line for the dashboard.
    ///
    /// TERMINATED is only reached through a return home, so it never reads
    /// as a completed mission.
    pub fn status_text(self) -> &'static str {
        match self {
            MissionState::Nominal => "Mission Active",
            MissionState::Avoiding => "Obstacle Detected - Holding Position",
            MissionState::Resuming => "Resuming Mission",
            MissionState::LowBatteryRth => "Low Battery - Returning Home",
            MissionState::EmergencyStop => "Emergency Stop",
            MissionState::Terminated => "Returned Home - Mission Ended",
        }
    }
}

impl fmt::Display for MissionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MissionState::Nominal => "NOMINAL",
            MissionState::Avoiding => "AVOIDING",
            MissionState::Resuming => "RESUMING",
            MissionState::LowBatteryRth => "LOW_BATTERY_RTH",
            MissionState::EmergencyStop => "EMERGENCY_STOP",
            MissionState::Terminated => "TERMINATED",
        };
        f.write_str(s)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Commands
// ────────────────────────────────────────────────────────────────────────────

/// The four command kinds the core issues to the flight controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Loiter,
    Waypoint,
    ReturnHome,
    Stop,
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CommandKind::Loiter => "loiter",
            CommandKind::Waypoint => "send_waypoint",
            CommandKind::ReturnHome => "return_home",
            CommandKind::Stop => "stop",
        };
        f.write_str(s)
    }
}

/// One outbound command attempt.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub command_kind: CommandKind,
    pub issued_at: DateTime<Utc>,
    /// Zero for the first attempt.
    pub retry_count: u32,
}

// ────────────────────────────────────────────────────────────────────────────
// Telemetry events
// ────────────────────────────────────────────────────────────────────────────

/// Event published to the telemetry sink for operator display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g., "rescuelink-kernel::mission_controller"
    pub source: String,
    #[serde(flatten)]
    pub payload: TelemetryPayload,
}

impl TelemetryEvent {
    /// Build an event stamped with the current wall-clock time.
    pub fn new(source: impl Into<String>, payload: TelemetryPayload) -> Self {
        Self::at(source, payload, Utc::now())
    }

    /// Build an event with an explicit timestamp.
    pub fn at(source: impl Into<String>, payload: TelemetryPayload, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp,
            source: source.into(),
            payload,
        }
    }
}

/// Typed payloads, serialised as `{"type": ..., "payload": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "lowercase")]
pub enum TelemetryPayload {
    Status {
        status: String,
    },
    Battery {
        level: f32,
    },
    Location {
        lat: f64,
        lng: f64,
    },
    Emergency {
        #[serde(rename = "type")]
        kind: String,
        location: String,
        device_id: String,
    },
    Log {
        message: String,
    },
}

impl TelemetryPayload {
    /// The wire `type` discriminator.
    pub fn kind(&self) -> &'static str {
        match self {
            TelemetryPayload::Status { .. } => "status",
            TelemetryPayload::Battery { .. } => "battery",
            TelemetryPayload::Location { .. } => "location",
            TelemetryPayload::Emergency { .. } => "emergency",
            TelemetryPayload::Log { .. } => "log",
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// Whether an error may be skipped or must escalate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Logged and skipped; the affected loop continues on its next iteration.
    Transient,
    /// Drives an explicit terminal transition or aborts startup.
    Fatal,
}

/// Global error type spanning perception input, link failures and startup.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RescueError {
    #[error("Malformed hazard event: {0}")]
    MalformedEvent(String),

    #[error("Invalid telemetry: {0}")]
    InvalidTelemetry(String),

    #[error("Invalid mission plan: {0}")]
    InvalidMission(String),

    #[error("Sensor fault on {component}: {details}")]
    SensorFault { component: String, details: String },

    #[error("Command {command} rejected by link: {details}")]
    LinkFailure { command: CommandKind, details: String },

    #[error("Command {command} timed out after {timeout_ms} ms")]
    CommandTimeout { command: CommandKind, timeout_ms: u64 },

    #[error("Command {command} failed after {attempts} attempts")]
    RetriesExhausted { command: CommandKind, attempts: u32 },

    #[error("Startup failure on {resource}: {details}")]
    Startup { resource: String, details: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Channel error: {0}")]
    Channel(String),
}

impl RescueError {
    pub fn severity(&self) -> Severity {
        match self {
            RescueError::RetriesExhausted { .. }
            | RescueError::Startup { .. }
            | RescueError::InvalidMission(_)
            | RescueError::Config(_) => Severity::Fatal,
            _ => Severity::Transient,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }
}
