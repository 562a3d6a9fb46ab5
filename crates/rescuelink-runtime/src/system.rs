//! [`RescueSystem`] – startup, supervision and the single finalization path.
//!
//! # Lifecycle
//!
//! 1. [`RescueSystem::start`] validates the configuration and opens the
//!    camera, the detector and the command link, in that order.  If any of
//!    them fails to open, the ones already opened are released and the
//!    startup error is returned; no loop is started.
//! 2. [`RescueSystem::run`] spawns the frame grabber, the perception loop and
//!    the control loop, waits for all three to finish, and releases every
//!    collaborator it got back.  Loops return collaborators by value, so no
//!    collaborator can be released twice.
//!
//! The loops finish when the [`RunFlag`] clears: on operator shutdown, or
//! when the mission reaches a terminal state.

use std::sync::Arc;
use std::time::Duration;

use rescuelink_hal::{CameraFrame, CommandLink, Detector, FrameSource, TelemetrySource};
use rescuelink_kernel::{
    CommandDispatcher, MissionConfig, MissionController, RetryPolicy, WaypointSequencer,
};
use rescuelink_middleware::TelemetrySink;
use rescuelink_perception::{HazardPolicy, MonitorStats, ObstacleMonitor, frame_slot};
use rescuelink_types::{MissionPlan, MissionState, RescueError};
use tracing::{error, info};

use crate::control_loop::ControlLoop;
use crate::perception_loop::{PerceptionLoop, run_frame_grabber};
use crate::shutdown::{EmergencyLatch, RecallLatch, RunFlag};

/// Complete runtime configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct SystemConfig {
    pub hazard: HazardPolicy,
    pub mission: MissionConfig,
    pub retry: RetryPolicy,
    /// Control loop rate.
    pub tick_rate_hz: f64,
    /// Frame grabber capture period.
    pub frame_interval: Duration,
    /// Longest the perception loop waits for a frame before re-checking the
    /// hazard clear timer.
    pub idle_poll: Duration,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            hazard: HazardPolicy::default(),
            mission: MissionConfig::default(),
            retry: RetryPolicy::default(),
            tick_rate_hz: 10.0,
            frame_interval: Duration::from_millis(33),
            idle_poll: Duration::from_millis(100),
        }
    }
}

impl SystemConfig {
    /// # Errors
    ///
    /// Returns [`RescueError::Config`] for a non-positive tick rate, zero
    /// intervals, an invalid hazard policy, or a mission clear period that
    /// differs from the hazard policy's.
    pub fn validate(&self) -> Result<(), RescueError> {
        self.hazard.validate()?;
        if !self.tick_rate_hz.is_finite() || self.tick_rate_hz <= 0.0 {
            return Err(RescueError::Config(format!(
                "tick_rate_hz must be positive, got {}",
                self.tick_rate_hz
            )));
        }
        if self.frame_interval.is_zero() || self.idle_poll.is_zero() {
            return Err(RescueError::Config(
                "frame_interval and idle_poll must be non-zero".to_string(),
            ));
        }
        if self.retry.timeout.is_zero() {
            return Err(RescueError::Config("command timeout must be non-zero".to_string()));
        }
        if self.mission.clear_after != self.hazard.clear_after {
            return Err(RescueError::Config(
                "mission clear_after must match hazard clear_after".to_string(),
            ));
        }
        Ok(())
    }

    pub fn tick_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_rate_hz)
    }
}

/// The external collaborators, unopened.
pub struct Collaborators {
    pub camera: Box<dyn FrameSource>,
    pub detector: Box<dyn Detector>,
    pub link: Box<dyn CommandLink>,
    pub telemetry: Box<dyn TelemetrySource>,
}

/// Summary of a finished run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunSummary {
    /// `None` if the control task was lost.
    pub final_state: Option<MissionState>,
    pub monitor: MonitorStats,
    pub frames_skipped: u64,
}

/// A started system: collaborators open, loops not yet running.
pub struct RescueSystem {
    config: SystemConfig,
    plan: MissionPlan,
    sink: Arc<dyn TelemetrySink>,
    camera: Box<dyn FrameSource>,
    detector: Box<dyn Detector>,
    link: Box<dyn CommandLink>,
    telemetry: Box<dyn TelemetrySource>,
    run: RunFlag,
    latch: EmergencyLatch,
    recall: RecallLatch,
}

impl RescueSystem {
    /// Validate `config` and open every collaborator.
    ///
    /// # Errors
    ///
    /// - [`RescueError::Config`] for an invalid configuration; nothing is
    ///   opened.
    /// - [`RescueError::Startup`] naming the collaborator that failed to
    ///   open; collaborators opened before it have been released.
    pub async fn start(
        config: SystemConfig,
        plan: MissionPlan,
        collaborators: Collaborators,
        sink: Arc<dyn TelemetrySink>,
    ) -> Result<Self, RescueError> {
        config.validate()?;
        let Collaborators {
            mut camera,
            mut detector,
            mut link,
            telemetry,
        } = collaborators;

        if let Err(e) = camera.open() {
            return Err(startup_error(camera.id(), e));
        }
        info!(camera = camera.id(), "camera opened");

        if let Err(e) = detector.open() {
            let err = startup_error(detector.id(), e);
            camera.release();
            return Err(err);
        }
        info!(detector = detector.id(), "detector loaded");

        if let Err(e) = link.open().await {
            let err = startup_error(link.id(), e);
            detector.release();
            camera.release();
            return Err(err);
        }
        info!(link = link.id(), waypoints = plan.len(), "command link connected");

        Ok(Self {
            config,
            plan,
            sink,
            camera,
            detector,
            link,
            telemetry,
            run: RunFlag::new(),
            latch: EmergencyLatch::new(),
            recall: RecallLatch::new(),
        })
    }

    /// Handle for requesting shutdown from outside.
    pub fn run_flag(&self) -> RunFlag {
        self.run.clone()
    }

    /// Handle for latching an operator emergency stop from outside.
    pub fn emergency_latch(&self) -> EmergencyLatch {
        self.latch.clone()
    }

    /// Handle for recalling the vehicle home from outside.
    pub fn recall_latch(&self) -> RecallLatch {
        self.recall.clone()
    }

    /// Run until the run flag clears, then release every collaborator.
    pub async fn run(self) -> RunSummary {
        let RescueSystem {
            config,
            plan,
            sink,
            camera,
            detector,
            link,
            telemetry,
            run,
            latch,
            recall,
        } = self;

        let monitor = ObstacleMonitor::new(config.hazard.clone());
        let hazard = monitor.reader();
        let (publisher, subscriber) = frame_slot::<CameraFrame>();

        let controller = MissionController::new(
            WaypointSequencer::new(plan),
            CommandDispatcher::new(link, config.retry.clone()),
            sink,
            config.mission.clone(),
        );
        let control = ControlLoop::new(
            controller,
            hazard,
            telemetry,
            latch,
            run.clone(),
            config.tick_period(),
        )
        .with_recall(recall);
        let perception = PerceptionLoop::new(monitor, subscriber, run.clone(), config.idle_poll);

        info!(tick_rate_hz = config.tick_rate_hz, "rescue system running");
        let grabber_task = tokio::spawn(run_frame_grabber(
            camera,
            publisher,
            run.clone(),
            config.frame_interval,
        ));
        let perception_task = tokio::spawn(perception.run(detector));
        let control_task = tokio::spawn(control.run());

        let (grabber, perception, control) =
            tokio::join!(grabber_task, perception_task, control_task);
        // Any exit path winds the others down too.
        run.stop();

        let camera = grabber.unwrap_or_else(|e| {
            error!(error = %e, "frame grabber task failed");
            None
        });
        let (detector, monitor, frames_skipped) = match perception {
            Ok(outcome) => (outcome.detector, outcome.stats, outcome.frames_skipped),
            Err(e) => {
                error!(error = %e, "perception task failed");
                (None, MonitorStats::default(), 0)
            }
        };
        let (link, final_state) = match control {
            Ok(controller) => {
                let state = controller.state();
                (Some(controller.into_dispatcher().into_link()), Some(state))
            }
            Err(e) => {
                error!(error = %e, "control task failed");
                (None, None)
            }
        };

        finalize(camera, detector, link).await;

        RunSummary {
            final_state,
            monitor,
            frames_skipped,
        }
    }
}

fn startup_error(resource: &str, cause: RescueError) -> RescueError {
    let err = match cause {
        RescueError::Startup { .. } => cause,
        other => RescueError::Startup {
            resource: resource.to_string(),
            details: other.to_string(),
        },
    };
    error!(resource, error = %err, "startup failed");
    err
}

/// The one place collaborators are released.
async fn finalize(
    camera: Option<Box<dyn FrameSource>>,
    detector: Option<Box<dyn Detector>>,
    link: Option<Box<dyn CommandLink>>,
) {
    if let Some(mut camera) = camera {
        camera.release();
        info!(camera = camera.id(), "camera released");
    }
    if let Some(mut detector) = detector {
        detector.release();
        info!(detector = detector.id(), "detector released");
    }
    if let Some(mut link) = link {
        link.release().await;
        info!(link = link.id(), "command link released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = SystemConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.tick_period(), Duration::from_millis(100));
    }

    #[test]
    fn rejects_bad_tick_rate_and_mismatched_clear() {
        let config = SystemConfig {
            tick_rate_hz: 0.0,
            ..SystemConfig::default()
        };
        assert!(matches!(config.validate(), Err(RescueError::Config(_))));

        let mut config = SystemConfig::default();
        config.mission.clear_after = Duration::from_millis(10);
        assert!(config.validate().is_err());
    }

    #[test]
    fn startup_error_wraps_other_causes() {
        let err = startup_error(
            "cam",
            RescueError::SensorFault {
                component: "cam".to_string(),
                details: "no device".to_string(),
            },
        );
        assert!(matches!(err, RescueError::Startup { ref resource, .. } if resource == "cam"));
        assert!(err.is_fatal());
    }
}
