//! In-process simulation drivers for CI and the demo binary.
//!
//! [`SimVehicle`] is a shared handle onto one simulated airframe.  It hands
//! out a [`SimCommandLink`] and a [`SimTelemetry`] that observe the same
//! state: waypoints sent over the link become the target the telemetry feed
//! reports as reached a few polls later, and every command is recorded so
//! tests can assert on the exact sequence.
//!
//! [`SimCamera`] and [`SimDetector`] fake the perception side.  The detector
//! reports a person (COCO class 0) on a scripted range of frame numbers.
//!
//! # Example
//!
//! ```rust
//! use rescuelink_hal::sim::SimVehicle;
//! use rescuelink_hal::{CommandLink, TelemetrySource};
//! use rescuelink_types::{CommandKind, Waypoint};
//!
//! # tokio_test_block(async {
//! let vehicle = SimVehicle::new().reach_after_polls(1);
//! let mut link = vehicle.command_link("sim-link");
//! let mut telemetry = vehicle.telemetry();
//!
//! link.send_waypoint(&Waypoint::new(0, 47.39, 8.54, 30.0)).await.unwrap();
//! assert_eq!(telemetry.latest().unwrap().reached_waypoint, Some(0));
//! assert_eq!(vehicle.command_kinds(), vec![CommandKind::Waypoint]);
//! # });
//! # fn tokio_test_block<F: std::future::Future>(f: F) {
//! #     tokio::runtime::Builder::new_current_thread()
//! #         .enable_time()
//! #         .build()
//! #         .unwrap()
//! #         .block_on(f);
//! # }
//! ```

use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rescuelink_types::{
    CommandKind, HazardEvent, Position, RescueError, VehicleTelemetry, Waypoint,
};
use tracing::debug;

use crate::camera::{CameraFrame, FrameSource};
use crate::detector::Detector;
use crate::link::CommandLink;
use crate::telemetry::TelemetrySource;

/// Shared count of `release()` calls on a simulated driver.
pub type ReleaseCounter = Arc<AtomicUsize>;

// ────────────────────────────────────────────────────────────────────────────
// Simulated vehicle
// ────────────────────────────────────────────────────────────────────────────

/// A command the simulated flight controller accepted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SentCommand {
    pub kind: CommandKind,
    /// Waypoint index for [`CommandKind::Waypoint`].
    pub waypoint: Option<usize>,
}

#[derive(Debug)]
struct VehicleState {
    sent: Vec<SentCommand>,
    attempts: usize,
    fail_next: usize,
    latency: Duration,
    link_healthy: bool,
    battery_pct: f32,
    drain_per_poll: f32,
    reach_after_polls: u32,
    home: Position,
    position: Position,
    target: Option<Waypoint>,
    polls_on_target: u32,
    reached: Option<usize>,
    releases: usize,
}

/// Cloneable handle onto one simulated airframe.
#[derive(Debug, Clone)]
pub struct SimVehicle {
    state: Arc<Mutex<VehicleState>>,
}

impl Default for SimVehicle {
    fn default() -> Self {
        Self::new()
    }
}

impl SimVehicle {
    /// A healthy vehicle on full battery, parked at (0, 0).
    pub fn new() -> Self {
        let home = Position {
            latitude: 0.0,
            longitude: 0.0,
            altitude: 0.0,
        };
        Self {
            state: Arc::new(Mutex::new(VehicleState {
                sent: Vec::new(),
                attempts: 0,
                fail_next: 0,
                latency: Duration::ZERO,
                link_healthy: true,
                battery_pct: 100.0,
                drain_per_poll: 0.0,
                reach_after_polls: 3,
                home,
                position: home,
                target: None,
                polls_on_target: 0,
                reached: None,
                releases: 0,
            })),
        }
    }

    /// Polls of the telemetry feed before a sent waypoint counts as reached.
    pub fn reach_after_polls(self, polls: u32) -> Self {
        self.lock().reach_after_polls = polls;
        self
    }

    pub fn with_battery(self, pct: f32) -> Self {
        self.lock().battery_pct = pct;
        self
    }

    /// Battery percentage lost per telemetry poll.
    pub fn with_drain(self, pct_per_poll: f32) -> Self {
        self.lock().drain_per_poll = pct_per_poll;
        self
    }

    pub fn with_home(self, home: Position) -> Self {
        {
            let mut state = self.lock();
            state.home = home;
            state.position = home;
        }
        self
    }

    /// Delay every command acknowledgement by `latency`.
    pub fn with_latency(self, latency: Duration) -> Self {
        self.lock().latency = latency;
        self
    }

    /// Make the next `n` command attempts fail.
    pub fn fail_next(&self, n: usize) {
        self.lock().fail_next = n;
    }

    pub fn set_link_healthy(&self, healthy: bool) {
        self.lock().link_healthy = healthy;
    }

    pub fn set_battery(&self, pct: f32) {
        self.lock().battery_pct = pct;
    }

    /// Every command the vehicle acknowledged, in order.
    pub fn commands(&self) -> Vec<SentCommand> {
        self.lock().sent.clone()
    }

    pub fn command_kinds(&self) -> Vec<CommandKind> {
        self.lock().sent.iter().map(|c| c.kind).collect()
    }

    /// Indices of every waypoint command acknowledged, in order.
    pub fn waypoints_sent(&self) -> Vec<usize> {
        self.lock().sent.iter().filter_map(|c| c.waypoint).collect()
    }

    /// Command attempts including failed ones.
    pub fn attempts(&self) -> usize {
        self.lock().attempts
    }

    /// Number of times the command link was released.
    pub fn link_releases(&self) -> usize {
        self.lock().releases
    }

    pub fn command_link(&self, id: impl Into<String>) -> SimCommandLink {
        SimCommandLink {
            id: id.into(),
            vehicle: self.clone(),
        }
    }

    pub fn telemetry(&self) -> SimTelemetry {
        SimTelemetry {
            id: "sim-telemetry".to_string(),
            vehicle: self.clone(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VehicleState> {
        // A panicking test thread must not wedge the other handles.
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Simulated command link
// ────────────────────────────────────────────────────────────────────────────

/// [`CommandLink`] backed by a [`SimVehicle`].
#[derive(Debug)]
pub struct SimCommandLink {
    id: String,
    vehicle: SimVehicle,
}

impl SimCommandLink {
    async fn execute(
        &mut self,
        kind: CommandKind,
        waypoint: Option<&Waypoint>,
    ) -> Result<(), RescueError> {
        let latency = {
            let mut state = self.vehicle.lock();
            state.attempts += 1;
            state.latency
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.vehicle.lock();
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(RescueError::LinkFailure {
                command: kind,
                details: "simulated link drop".to_string(),
            });
        }
        if !state.link_healthy {
            return Err(RescueError::LinkFailure {
                command: kind,
                details: "link unhealthy".to_string(),
            });
        }

        match kind {
            CommandKind::Waypoint => {
                if state.target.map(|t| t.index) != waypoint.map(|w| w.index) {
                    state.polls_on_target = 0;
                    state.reached = None;
                }
                state.target = waypoint.copied();
            }
            CommandKind::ReturnHome => {
                state.target = None;
                state.reached = None;
                state.position = state.home;
            }
            CommandKind::Loiter | CommandKind::Stop => {}
        }
        state.sent.push(SentCommand {
            kind,
            waypoint: waypoint.map(|w| w.index),
        });
        debug!(link = %self.id, command = %kind, "sim vehicle acknowledged command");
        Ok(())
    }
}

#[async_trait]
impl CommandLink for SimCommandLink {
    fn id(&self) -> &str {
        &self.id
    }

    async fn open(&mut self) -> Result<(), RescueError> {
        Ok(())
    }

    async fn loiter(&mut self) -> Result<(), RescueError> {
        self.execute(CommandKind::Loiter, None).await
    }

    async fn send_waypoint(&mut self, waypoint: &Waypoint) -> Result<(), RescueError> {
        self.execute(CommandKind::Waypoint, Some(waypoint)).await
    }

    async fn return_home(&mut self) -> Result<(), RescueError> {
        self.execute(CommandKind::ReturnHome, None).await
    }

    async fn stop(&mut self) -> Result<(), RescueError> {
        self.execute(CommandKind::Stop, None).await
    }

    async fn release(&mut self) {
        self.vehicle.lock().releases += 1;
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Simulated telemetry
// ────────────────────────────────────────────────────────────────────────────

/// [`TelemetrySource`] backed by a [`SimVehicle`].
///
/// Each poll drains the battery and moves the vehicle one step closer to the
/// current target; after `reach_after_polls` polls the target is reported as
/// reached and the vehicle sits on it.
#[derive(Debug)]
pub struct SimTelemetry {
    id: String,
    vehicle: SimVehicle,
}

impl TelemetrySource for SimTelemetry {
    fn id(&self) -> &str {
        &self.id
    }

    fn latest(&mut self) -> Result<VehicleTelemetry, RescueError> {
        let mut state = self.vehicle.lock();
        state.battery_pct = (state.battery_pct - state.drain_per_poll).max(0.0);

        if let Some(target) = state.target {
            if state.reached != Some(target.index) {
                state.polls_on_target += 1;
                if state.polls_on_target >= state.reach_after_polls {
                    state.reached = Some(target.index);
                    state.position = target.position();
                }
            }
        }

        let mut telemetry = VehicleTelemetry::new(state.battery_pct, state.link_healthy)
            .with_position(state.position);
        telemetry.reached_waypoint = state.reached;
        Ok(telemetry)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Simulated camera & detector
// ────────────────────────────────────────────────────────────────────────────

/// A camera producing blank 4×4 greyscale frames, optionally failing on
/// every `n`th capture.
#[derive(Debug)]
pub struct SimCamera {
    id: String,
    seq: u64,
    fail_every: Option<u64>,
    open: bool,
    releases: ReleaseCounter,
}

impl SimCamera {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            seq: 0,
            fail_every: None,
            open: false,
            releases: ReleaseCounter::default(),
        }
    }

    /// Fail every `n`th capture with a sensor fault.
    pub fn failing_every(mut self, n: u64) -> Self {
        self.fail_every = (n > 0).then_some(n);
        self
    }

    pub fn release_counter(&self) -> ReleaseCounter {
        Arc::clone(&self.releases)
    }
}

impl FrameSource for SimCamera {
    fn id(&self) -> &str {
        &self.id
    }

    fn open(&mut self) -> Result<(), RescueError> {
        self.open = true;
        Ok(())
    }

    fn capture(&mut self) -> Result<CameraFrame, RescueError> {
        if !self.open {
            return Err(RescueError::SensorFault {
                component: self.id.clone(),
                details: "capture on closed device".to_string(),
            });
        }
        self.seq += 1;
        if self.fail_every.is_some_and(|n| self.seq % n == 0) {
            return Err(RescueError::SensorFault {
                component: self.id.clone(),
                details: format!("simulated read miss on frame {}", self.seq),
            });
        }
        Ok(CameraFrame {
            width: 4,
            height: 4,
            data: vec![0u8; 16],
            seq: self.seq,
            captured_at: Utc::now(),
        })
    }

    fn release(&mut self) {
        self.open = false;
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

/// A detector that sees a person on a scripted range of frame numbers and
/// nothing elsewhere.
#[derive(Debug)]
pub struct SimDetector {
    id: String,
    hazard_frames: Range<u64>,
    confidence: f32,
    releases: ReleaseCounter,
}

impl SimDetector {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            hazard_frames: 0..0,
            confidence: 0.85,
            releases: ReleaseCounter::default(),
        }
    }

    /// Report a person on frames whose `seq` falls in `frames`.
    pub fn with_hazard_frames(mut self, frames: Range<u64>) -> Self {
        self.hazard_frames = frames;
        self
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn release_counter(&self) -> ReleaseCounter {
        Arc::clone(&self.releases)
    }
}

impl Detector for SimDetector {
    fn id(&self) -> &str {
        &self.id
    }

    fn open(&mut self) -> Result<(), RescueError> {
        Ok(())
    }

    fn detect(&mut self, frame: &CameraFrame) -> Result<Vec<HazardEvent>, RescueError> {
        if !self.hazard_frames.contains(&frame.seq) {
            return Ok(Vec::new());
        }
        Ok(vec![
            HazardEvent::new(0, self.confidence, frame.captured_at).with_label("person"),
        ])
    }

    fn release(&mut self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}
