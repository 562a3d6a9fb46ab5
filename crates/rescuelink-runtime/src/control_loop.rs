//! [`ControlLoop`] – fixed-rate driver of the mission controller.
//!
//! Each tick reads the hazard snapshot once, reads telemetry once and calls
//! [`MissionController::tick`].  The loop never touches the obstacle monitor
//! itself; its only view of perception is the [`HazardReader`].
//!
//! The emergency latch is read before telemetry: if the telemetry source is
//! failing, a latched stop is still delivered.
//!
//! When the controller reaches a terminal state the loop clears the
//! [`RunFlag`] so the rest of the system winds down with it.

use std::time::Duration;

use chrono::Utc;
use futures_util::FutureExt;
use rescuelink_hal::TelemetrySource;
use rescuelink_kernel::{MissionController, TickInputs, TickReport};
use rescuelink_perception::HazardReader;
use rescuelink_types::RescueError;
use std::panic::AssertUnwindSafe;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::shutdown::{EmergencyLatch, RecallLatch, RunFlag};

pub struct ControlLoop {
    controller: MissionController,
    hazard: HazardReader,
    telemetry: Box<dyn TelemetrySource>,
    latch: EmergencyLatch,
    recall: RecallLatch,
    run: RunFlag,
    period: Duration,
}

impl ControlLoop {
    pub fn new(
        controller: MissionController,
        hazard: HazardReader,
        telemetry: Box<dyn TelemetrySource>,
        latch: EmergencyLatch,
        run: RunFlag,
        period: Duration,
    ) -> Self {
        Self {
            controller,
            hazard,
            telemetry,
            latch,
            recall: RecallLatch::new(),
            run,
            period,
        }
    }

    /// Watch `recall` for an operator return-home request.
    pub fn with_recall(mut self, recall: RecallLatch) -> Self {
        self.recall = recall;
        self
    }

    pub fn controller(&self) -> &MissionController {
        &self.controller
    }

    /// Tick at the configured rate until the run flag clears, then hand the
    /// controller back.
    pub async fn run(mut self) -> MissionController {
        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.run.stopped() => break,
            }
            if !self.run.is_running() {
                break;
            }
            self.tick_once().await;
        }

        info!(state = %self.controller.state(), "control loop stopped");
        self.controller
    }

    /// Run exactly one control tick.  Returns `None` when the tick was
    /// skipped or failed; the failure has already been logged.
    pub async fn tick_once(&mut self) -> Option<TickReport> {
        let outcome = AssertUnwindSafe(self.step()).catch_unwind().await;

        let report = match outcome {
            Ok(Ok(report)) => Some(report),
            Ok(Err(e)) if e.is_fatal() => {
                error!(error = %e, "control tick failed");
                None
            }
            Ok(Err(e)) => {
                warn!(error = %e, "control tick skipped");
                None
            }
            Err(_) => {
                error!("control tick panicked; treated as a no-op");
                None
            }
        };

        if self.controller.state().is_terminal() && self.run.stop() {
            info!(state = %self.controller.state(), "mission reached a terminal state");
        }
        report
    }

    async fn step(&mut self) -> Result<TickReport, RescueError> {
        let now = Utc::now();
        let emergency = self.latch.is_triggered();
        let telemetry = match self.telemetry.latest() {
            Ok(telemetry) => telemetry,
            Err(e) if emergency => {
                warn!(error = %e, "telemetry unavailable, stopping without it");
                return Ok(self.controller.emergency_stop_now(now).await);
            }
            Err(e) => return Err(e),
        };
        let inputs = TickInputs::new(now, self.hazard.snapshot(), telemetry)
            .with_emergency_stop(emergency)
            .with_return_home(self.recall.is_triggered());
        self.controller.tick(inputs).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use rescuelink_hal::sim::SimVehicle;
    use rescuelink_kernel::{
        CommandDispatcher, MissionConfig, RetryPolicy, WaypointSequencer,
    };
    use rescuelink_middleware::RecordingSink;
    use rescuelink_perception::{HazardPolicy, ObstacleMonitor};
    use rescuelink_types::{CommandKind, MissionPlan, MissionState, VehicleTelemetry};

    struct FaultyTelemetry;

    impl TelemetrySource for FaultyTelemetry {
        fn id(&self) -> &str {
            "faulty"
        }

        fn latest(&mut self) -> Result<VehicleTelemetry, RescueError> {
            Err(RescueError::SensorFault {
                component: "faulty".to_string(),
                details: "no reading".to_string(),
            })
        }
    }

    fn control_loop(
        vehicle: &SimVehicle,
        telemetry: Box<dyn TelemetrySource>,
    ) -> (ControlLoop, ObstacleMonitor, EmergencyLatch, RunFlag) {
        let plan = MissionPlan::from_coordinates([(28.61, 77.20, 30.0), (28.62, 77.21, 30.0)]).unwrap();
        let dispatcher = CommandDispatcher::new(
            Box::new(vehicle.command_link("sim")),
            RetryPolicy {
                backoff_base: Duration::from_millis(1),
                backoff_cap: Duration::from_millis(2),
                ..RetryPolicy::default()
            },
        );
        let controller = MissionController::new(
            WaypointSequencer::new(plan),
            dispatcher,
            Arc::new(RecordingSink::new()),
            MissionConfig::default(),
        );
        let monitor = ObstacleMonitor::new(HazardPolicy::default());
        let latch = EmergencyLatch::new();
        let run = RunFlag::new();
        let cl = ControlLoop::new(
            controller,
            monitor.reader(),
            telemetry,
            latch.clone(),
            run.clone(),
            Duration::from_millis(10),
        );
        (cl, monitor, latch, run)
    }

    #[tokio::test]
    async fn tick_once_drives_the_controller() {
        let vehicle = SimVehicle::new().reach_after_polls(1);
        let (mut cl, _monitor, _latch, run) = control_loop(&vehicle, Box::new(vehicle.telemetry()));

        let r = cl.tick_once().await.unwrap();
        assert_eq!(r.command, Some(CommandKind::Waypoint));
        let r = cl.tick_once().await.unwrap();
        assert_eq!(r.command, Some(CommandKind::Waypoint));
        assert_eq!(vehicle.waypoints_sent(), vec![0, 1]);
        assert!(run.is_running());
    }

    #[tokio::test]
    async fn telemetry_fault_skips_the_tick() {
        let vehicle = SimVehicle::new();
        let (mut cl, _monitor, _latch, _run) = control_loop(&vehicle, Box::new(FaultyTelemetry));
        assert!(cl.tick_once().await.is_none());
        assert!(vehicle.commands().is_empty());
        assert_eq!(cl.controller().state(), MissionState::Nominal);
    }

    #[tokio::test]
    async fn emergency_latch_stops_vehicle_and_clears_run_flag() {
        let vehicle = SimVehicle::new();
        let (mut cl, _monitor, latch, run) = control_loop(&vehicle, Box::new(vehicle.telemetry()));
        latch.trigger();

        let r = cl.tick_once().await.unwrap();
        assert_eq!(r.to, MissionState::EmergencyStop);
        assert_eq!(vehicle.command_kinds(), vec![CommandKind::Stop]);
        assert!(!run.is_running());
    }

    #[tokio::test]
    async fn emergency_latch_is_honoured_when_telemetry_fails() {
        let vehicle = SimVehicle::new();
        let (mut cl, _monitor, latch, run) = control_loop(&vehicle, Box::new(FaultyTelemetry));
        latch.trigger();

        let r = cl.tick_once().await.unwrap();
        assert_eq!((r.to, r.command), (MissionState::EmergencyStop, Some(CommandKind::Stop)));
        assert!(!run.is_running());

        // Terminal: further ticks send nothing.
        for _ in 0..3 {
            cl.tick_once().await;
        }
        assert_eq!(vehicle.command_kinds(), vec![CommandKind::Stop]);
    }

    #[tokio::test]
    async fn recall_latch_returns_the_vehicle_home() {
        let vehicle = SimVehicle::new();
        let (cl, _monitor, _latch, run) = control_loop(&vehicle, Box::new(vehicle.telemetry()));
        let recall = RecallLatch::new();
        let mut cl = cl.with_recall(recall.clone());

        cl.tick_once().await.unwrap();
        recall.trigger();
        let r = cl.tick_once().await.unwrap();
        assert_eq!((r.to, r.command), (MissionState::LowBatteryRth, Some(CommandKind::ReturnHome)));
        let r = cl.tick_once().await.unwrap();
        assert_eq!(r.to, MissionState::Terminated);
        assert!(!run.is_running());
        assert_eq!(vehicle.command_kinds(), vec![CommandKind::Waypoint, CommandKind::ReturnHome]);
    }

    #[tokio::test]
    async fn run_exits_on_stop_and_returns_controller() {
        let vehicle = SimVehicle::new();
        let (cl, _monitor, _latch, run) = control_loop(&vehicle, Box::new(vehicle.telemetry()));
        let handle = tokio::spawn(cl.run());
        tokio::time::sleep(Duration::from_millis(50)).await;
        run.stop();
        let controller = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop exits")
            .unwrap();
        assert_eq!(controller.state(), MissionState::Nominal);
        assert!(!vehicle.commands().is_empty());
    }

    #[tokio::test]
    async fn hazard_snapshot_reaches_the_controller() {
        let vehicle = SimVehicle::new();
        let (mut cl, mut monitor, _latch, _run) = control_loop(&vehicle, Box::new(vehicle.telemetry()));
        let now = Utc::now();
        for ms in [0, 50, 100] {
            monitor.ingest(rescuelink_types::HazardEvent::new(
                0,
                0.9,
                now - chrono::Duration::milliseconds(200 - ms),
            ));
        }
        let r = cl.tick_once().await.unwrap();
        assert_eq!((r.to, r.command), (MissionState::Avoiding, Some(CommandKind::Loiter)));
    }
}
