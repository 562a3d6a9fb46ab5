//! [`MissionController`] – the mission state machine.
//!
//! One call to [`MissionController::tick`] reads one hazard snapshot and one
//! telemetry reading (both carried in [`TickInputs`]), takes at most one
//! transition and issues at most one command.
//!
//! # Transitions
//!
//! | From | Condition | To | Command |
//! |---|---|---|---|
//! | NOMINAL | hazard active | AVOIDING | loiter |
//! | NOMINAL | battery ≤ low threshold | LOW_BATTERY_RTH | return home |
//! | NOMINAL | waypoint reached / not yet sent | NOMINAL | next / current waypoint |
//! | NOMINAL | plan complete | NOMINAL | loiter, repeated every idle interval |
//! | AVOIDING | hazard inactive and unseen for `clear_after` | RESUMING | – |
//! | AVOIDING | link unhealthy for `max_retries` ticks | EMERGENCY_STOP | stop |
//! | RESUMING | hazard active | AVOIDING | loiter |
//! | RESUMING | current waypoint acknowledged | NOMINAL | same waypoint |
//! | NOMINAL / AVOIDING / RESUMING | operator return-home input | LOW_BATTERY_RTH | return home |
//! | LOW_BATTERY_RTH | next tick | TERMINATED | – |
//! | any non-terminal | emergency-stop input | EMERGENCY_STOP | stop |
//! | any non-terminal | command retries exhausted | EMERGENCY_STOP | – |
//!
//! The emergency-stop input is honoured before telemetry is validated; a
//! vehicle with a broken battery reading still stops.  Within NOMINAL the
//! hazard rule wins over the battery rule, which wins over progress.
//! EMERGENCY_STOP and TERMINATED never issue another command.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rescuelink_middleware::TelemetrySink;
use rescuelink_types::{
    CommandKind, HazardSignal, MissionState, Position, RescueError, TelemetryEvent,
    TelemetryPayload, VehicleTelemetry,
};
use tracing::{error, info, instrument, warn};

use crate::dispatcher::{Command, CommandDispatcher};
use crate::sequencer::WaypointSequencer;

const SOURCE: &str = "rescuelink-kernel::mission_controller";

/// Mission-level thresholds.
#[derive(Debug, Clone, PartialEq)]
pub struct MissionConfig {
    /// Battery percentage at or below which the vehicle returns home.
    pub low_battery_pct: f32,
    /// Consecutive unhealthy-link ticks tolerated while avoiding.
    pub max_retries: u32,
    /// Quiet period required before resuming after a hazard.
    pub clear_after: Duration,
    /// Loiter re-send interval once the plan is complete.
    pub idle_loiter_interval: Duration,
    /// Reported in emergency telemetry.
    pub device_id: String,
}

impl Default for MissionConfig {
    fn default() -> Self {
        Self {
            low_battery_pct: 20.0,
            max_retries: 3,
            clear_after: Duration::from_millis(1000),
            idle_loiter_interval: Duration::from_secs(5),
            device_id: "rescuelink-01".to_string(),
        }
    }
}

/// Everything one tick is allowed to look at.
#[derive(Debug, Clone, Copy)]
pub struct TickInputs {
    pub now: DateTime<Utc>,
    pub hazard: HazardSignal,
    pub telemetry: VehicleTelemetry,
    pub emergency_stop: bool,
    /// Operator recall: return home and end the mission.
    pub return_home: bool,
}

impl TickInputs {
    pub fn new(now: DateTime<Utc>, hazard: HazardSignal, telemetry: VehicleTelemetry) -> Self {
        Self {
            now,
            hazard,
            telemetry,
            emergency_stop: false,
            return_home: false,
        }
    }

    pub fn with_emergency_stop(mut self, requested: bool) -> Self {
        self.emergency_stop = requested;
        self
    }

    pub fn with_return_home(mut self, requested: bool) -> Self {
        self.return_home = requested;
        self
    }
}

/// What a tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub from: MissionState,
    pub to: MissionState,
    /// The command acknowledged during this tick, if any.
    pub command: Option<CommandKind>,
}

impl TickReport {
    fn stay(state: MissionState) -> Self {
        Self {
            from: state,
            to: state,
            command: None,
        }
    }

    pub fn transitioned(&self) -> bool {
        self.from != self.to
    }
}

/// Why the controller entered EMERGENCY_STOP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopCause {
    Operator,
    LinkLost,
    RetriesExhausted,
}

impl StopCause {
    fn as_str(self) -> &'static str {
        match self {
            StopCause::Operator => "operator_stop",
            StopCause::LinkLost => "link_lost",
            StopCause::RetriesExhausted => "retries_exhausted",
        }
    }
}

pub struct MissionController {
    state: MissionState,
    sequencer: WaypointSequencer,
    dispatcher: CommandDispatcher,
    sink: Arc<dyn TelemetrySink>,
    config: MissionConfig,
    unhealthy_ticks: u32,
    last_idle_loiter: Option<DateTime<Utc>>,
    last_battery_pct: Option<i32>,
    last_position: Option<Position>,
}

impl MissionController {
    pub fn new(
        sequencer: WaypointSequencer,
        dispatcher: CommandDispatcher,
        sink: Arc<dyn TelemetrySink>,
        config: MissionConfig,
    ) -> Self {
        Self {
            state: MissionState::Nominal,
            sequencer,
            dispatcher,
            sink,
            config,
            unhealthy_ticks: 0,
            last_idle_loiter: None,
            last_battery_pct: None,
            last_position: None,
        }
    }

    pub fn state(&self) -> MissionState {
        self.state
    }

    pub fn sequencer(&self) -> &WaypointSequencer {
        &self.sequencer
    }

    pub fn config(&self) -> &MissionConfig {
        &self.config
    }

    /// Give up the controller and hand the command link back for release.
    pub fn into_dispatcher(self) -> CommandDispatcher {
        self.dispatcher
    }

    /// Run one decision cycle.
    ///
    /// # Errors
    ///
    /// - [`RescueError::InvalidTelemetry`]: the tick was a no-op.
    /// - [`RescueError::RetriesExhausted`]: a command could not be delivered
    ///   and the controller is now in EMERGENCY_STOP.
    #[instrument(skip_all, fields(state = %self.state))]
    pub async fn tick(&mut self, inputs: TickInputs) -> Result<TickReport, RescueError> {
        let from = self.state;
        if from.is_terminal() {
            return Ok(TickReport::stay(from));
        }

        if inputs.emergency_stop {
            if inputs.telemetry.validate().is_ok() {
                self.observe_vehicle(&inputs);
            }
            let command = self
                .emergency_stop(StopCause::Operator, inputs.now, inputs.telemetry.position)
                .await;
            return Ok(TickReport {
                from,
                to: self.state,
                command,
            });
        }

        if let Err(e) = inputs.telemetry.validate() {
            warn!(error = %e, "skipping tick on invalid telemetry");
            return Err(e);
        }
        self.observe_vehicle(&inputs);

        let recall = inputs.return_home
            && matches!(
                from,
                MissionState::Nominal | MissionState::Avoiding | MissionState::Resuming
            );

        let outcome = match from {
            _ if recall => self.operator_recall(inputs.now).await,
            MissionState::Nominal => self.tick_nominal(&inputs).await,
            MissionState::Avoiding => self.tick_avoiding(&inputs).await,
            MissionState::Resuming => self.tick_resuming(&inputs).await,
            MissionState::LowBatteryRth => {
                self.log(inputs.now, "Return-home acknowledged, mission terminated");
                self.transition(MissionState::Terminated, inputs.now);
                Ok(None)
            }
            MissionState::EmergencyStop | MissionState::Terminated => Ok(None),
        };

        match outcome {
            Ok(command) => Ok(TickReport {
                from,
                to: self.state,
                command,
            }),
            Err(e) => {
                error!(error = %e, "command link failed, forcing emergency stop");
                self.emergency_stop(StopCause::RetriesExhausted, inputs.now, inputs.telemetry.position)
                    .await;
                Err(e)
            }
        }
    }

    /// Enter EMERGENCY_STOP without a telemetry reading, for when the
    /// telemetry source itself has failed.  Location falls back to the last
    /// reported position.
    pub async fn emergency_stop_now(&mut self, now: DateTime<Utc>) -> TickReport {
        let from = self.state;
        if from.is_terminal() {
            return TickReport::stay(from);
        }
        let command = self.emergency_stop(StopCause::Operator, now, None).await;
        TickReport {
            from,
            to: self.state,
            command,
        }
    }

    // ------------------------------------------------------------------ rules

    async fn operator_recall(&mut self, now: DateTime<Utc>) -> Result<Option<CommandKind>, RescueError> {
        self.dispatcher.dispatch(&Command::ReturnHome).await?;
        warn!(waypoint = self.sequencer.current_index(), "operator recall, returning home");
        self.log(now, "Operator requested return home");
        self.transition_as(MissionState::LowBatteryRth, now, "Operator Recall - Returning Home");
        Ok(Some(CommandKind::ReturnHome))
    }

    async fn tick_nominal(&mut self, inputs: &TickInputs) -> Result<Option<CommandKind>, RescueError> {
        if inputs.hazard.active {
            self.dispatcher.dispatch(&Command::Loiter).await?;
            self.sequencer.reset_to_current();
            self.unhealthy_ticks = 0;
            info!(
                waypoint = self.sequencer.current_index(),
                confidence = inputs.hazard.confidence,
                "hazard active, holding position"
            );
            self.log(inputs.now, "Obstacle detected, holding position");
            self.transition(MissionState::Avoiding, inputs.now);
            return Ok(Some(CommandKind::Loiter));
        }

        if inputs.telemetry.battery_pct <= self.config.low_battery_pct {
            self.dispatcher.dispatch(&Command::ReturnHome).await?;
            warn!(
                battery_pct = inputs.telemetry.battery_pct,
                threshold = self.config.low_battery_pct,
                "battery low, returning home"
            );
            self.log(
                inputs.now,
                format!(
                    "Battery at {:.0}%, returning home",
                    inputs.telemetry.battery_pct
                ),
            );
            self.transition(MissionState::LowBatteryRth, inputs.now);
            return Ok(Some(CommandKind::ReturnHome));
        }

        self.progress(inputs).await
    }

    async fn progress(&mut self, inputs: &TickInputs) -> Result<Option<CommandKind>, RescueError> {
        let reached_current = self.sequencer.is_dispatched()
            && inputs.telemetry.reached_waypoint == Some(self.sequencer.current_index());

        if reached_current {
            let reached = self.sequencer.current_index();
            match self.sequencer.advance() {
                Some(next) => {
                    info!(reached, next = next.index, "waypoint reached");
                    self.log(
                        inputs.now,
                        format!("Waypoint {reached} reached, heading to waypoint {}", next.index),
                    );
                }
                None => {
                    info!(reached, "final waypoint reached, mission plan complete");
                    self.log(inputs.now, "All waypoints reached, loitering");
                    return self.idle_loiter(inputs.now).await;
                }
            }
        }

        if let Some(waypoint) = self.sequencer.current().copied() {
            if self.sequencer.is_dispatched() {
                return Ok(None);
            }
            self.dispatcher.dispatch(&Command::Waypoint(waypoint)).await?;
            self.sequencer.mark_dispatched();
            info!(waypoint = waypoint.index, lat = waypoint.latitude, lon = waypoint.longitude, "waypoint sent");
            return Ok(Some(CommandKind::Waypoint));
        }

        let due = self.last_idle_loiter.is_none_or(|last| {
            (inputs.now - last)
                .to_std()
                .is_ok_and(|elapsed| elapsed >= self.config.idle_loiter_interval)
        });
        if due {
            return self.idle_loiter(inputs.now).await;
        }
        Ok(None)
    }

    async fn idle_loiter(&mut self, now: DateTime<Utc>) -> Result<Option<CommandKind>, RescueError> {
        self.dispatcher.dispatch(&Command::Loiter).await?;
        self.last_idle_loiter = Some(now);
        Ok(Some(CommandKind::Loiter))
    }

    async fn tick_avoiding(&mut self, inputs: &TickInputs) -> Result<Option<CommandKind>, RescueError> {
        if inputs.hazard.cleared_for(inputs.now, self.config.clear_after) {
            self.unhealthy_ticks = 0;
            info!("hazard clear, resuming mission");
            self.log(inputs.now, "Hazard cleared, resuming mission");
            self.transition(MissionState::Resuming, inputs.now);
            return Ok(None);
        }

        if inputs.telemetry.link_healthy {
            self.unhealthy_ticks = 0;
            return Ok(None);
        }

        self.unhealthy_ticks += 1;
        warn!(
            unhealthy_ticks = self.unhealthy_ticks,
            budget = self.config.max_retries,
            "link unhealthy while holding"
        );
        if self.unhealthy_ticks >= self.config.max_retries.max(1) {
            return Ok(self
                .emergency_stop(StopCause::LinkLost, inputs.now, inputs.telemetry.position)
                .await);
        }
        Ok(None)
    }

    async fn tick_resuming(&mut self, inputs: &TickInputs) -> Result<Option<CommandKind>, RescueError> {
        if inputs.hazard.active {
            self.dispatcher.dispatch(&Command::Loiter).await?;
            self.sequencer.reset_to_current();
            info!("hazard returned while resuming, holding position");
            self.log(inputs.now, "Obstacle detected, holding position");
            self.transition(MissionState::Avoiding, inputs.now);
            return Ok(Some(CommandKind::Loiter));
        }

        let Some(waypoint) = self.sequencer.current().copied() else {
            self.transition(MissionState::Nominal, inputs.now);
            return Ok(None);
        };
        self.dispatcher.dispatch(&Command::Waypoint(waypoint)).await?;
        self.sequencer.mark_dispatched();
        info!(waypoint = waypoint.index, "mission resumed");
        self.log(inputs.now, format!("Resuming mission at waypoint {}", waypoint.index));
        self.transition(MissionState::Nominal, inputs.now);
        Ok(Some(CommandKind::Waypoint))
    }

    /// Enter EMERGENCY_STOP.  The stop command is sent for every cause except
    /// retry exhaustion, where the link is presumed dead.
    async fn emergency_stop(
        &mut self,
        cause: StopCause,
        now: DateTime<Utc>,
        position: Option<Position>,
    ) -> Option<CommandKind> {
        let command = if cause == StopCause::RetriesExhausted {
            None
        } else {
            match self.dispatcher.dispatch(&Command::Stop).await {
                Ok(_) => Some(CommandKind::Stop),
                Err(e) => {
                    error!(error = %e, "stop command not acknowledged");
                    None
                }
            }
        };

        error!(cause = cause.as_str(), "emergency stop");
        let location = position
            .or(self.last_position)
            .map(|p| p.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        self.emit(
            now,
            TelemetryPayload::Emergency {
                kind: cause.as_str().to_string(),
                location,
                device_id: self.config.device_id.clone(),
            },
        );
        self.transition(MissionState::EmergencyStop, now);
        command
    }

    // ------------------------------------------------------------------ telemetry

    fn transition(&mut self, to: MissionState, now: DateTime<Utc>) {
        self.transition_as(to, now, to.status_text());
    }

    fn transition_as(&mut self, to: MissionState, now: DateTime<Utc>, status: &str) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        info!(%from, %to, "mission state transition");
        self.emit(
            now,
            TelemetryPayload::Status {
                status: status.to_string(),
            },
        );
        self.log(now, format!("Status changed to: {status}"));
    }

    fn observe_vehicle(&mut self, inputs: &TickInputs) {
        let whole = inputs.telemetry.battery_pct.floor() as i32;
        if self.last_battery_pct != Some(whole) {
            self.last_battery_pct = Some(whole);
            self.emit(
                inputs.now,
                TelemetryPayload::Battery {
                    level: inputs.telemetry.battery_pct,
                },
            );
        }

        if let Some(position) = inputs.telemetry.position {
            if self.last_position != Some(position) {
                self.last_position = Some(position);
                self.emit(
                    inputs.now,
                    TelemetryPayload::Location {
                        lat: position.latitude,
                        lng: position.longitude,
                    },
                );
            }
        }
    }

    fn log(&self, now: DateTime<Utc>, message: impl Into<String>) {
        self.emit(
            now,
            TelemetryPayload::Log {
                message: message.into(),
            },
        );
    }

    fn emit(&self, now: DateTime<Utc>, payload: TelemetryPayload) {
        self.sink.publish(TelemetryEvent::at(SOURCE, payload, now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::RetryPolicy;
    use chrono::TimeZone;
    use rescuelink_hal::sim::SimVehicle;
    use rescuelink_middleware::RecordingSink;
    use rescuelink_types::MissionPlan;

    fn t(ms: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 9, 1, 12, 0, 0).unwrap() + chrono::Duration::milliseconds(ms)
    }

    fn plan(n: usize) -> MissionPlan {
        MissionPlan::from_coordinates((0..n).map(|i| (28.6139 + i as f64 * 0.001, 77.2090, 30.0)))
            .unwrap()
    }

    fn controller(vehicle: &SimVehicle, waypoints: usize) -> (MissionController, RecordingSink) {
        let sink = RecordingSink::new();
        let dispatcher = CommandDispatcher::new(
            Box::new(vehicle.command_link("sim")),
            RetryPolicy {
                max_attempts: 3,
                timeout: Duration::from_millis(500),
                backoff_base: Duration::from_millis(10),
                backoff_cap: Duration::from_millis(40),
            },
        );
        let controller = MissionController::new(
            WaypointSequencer::new(plan(waypoints)),
            dispatcher,
            Arc::new(sink.clone()),
            MissionConfig::default(),
        );
        (controller, sink)
    }

    fn healthy() -> VehicleTelemetry {
        VehicleTelemetry::new(90.0, true)
    }

    fn reached(index: usize) -> VehicleTelemetry {
        healthy().with_reached_waypoint(index)
    }

    fn clear() -> HazardSignal {
        HazardSignal::default()
    }

    fn hazard(last_seen_ms: i64) -> HazardSignal {
        HazardSignal {
            active: true,
            confidence: 0.8,
            last_seen: Some(t(last_seen_ms)),
        }
    }

    fn cleared_at(last_seen_ms: i64) -> HazardSignal {
        HazardSignal {
            active: false,
            ..hazard(last_seen_ms)
        }
    }

    // ------------------------------------------------------------------ nominal

    #[tokio::test(start_paused = true)]
    async fn three_waypoints_visited_in_order_then_idle_loiter() {
        let vehicle = SimVehicle::new();
        let (mut mc, _sink) = controller(&vehicle, 3);

        let r = mc.tick(TickInputs::new(t(0), clear(), healthy())).await.unwrap();
        assert_eq!(r.command, Some(CommandKind::Waypoint));
        // Not reached yet: nothing to send.
        let r = mc.tick(TickInputs::new(t(100), clear(), healthy())).await.unwrap();
        assert_eq!(r.command, None);

        mc.tick(TickInputs::new(t(200), clear(), reached(0))).await.unwrap();
        mc.tick(TickInputs::new(t(300), clear(), reached(1))).await.unwrap();
        let r = mc.tick(TickInputs::new(t(400), clear(), reached(2))).await.unwrap();
        assert_eq!(r.command, Some(CommandKind::Loiter));
        assert!(mc.sequencer().is_complete());

        // Idle: next loiter only after the idle interval.
        let r = mc.tick(TickInputs::new(t(4_000), clear(), reached(2))).await.unwrap();
        assert_eq!(r.command, None);
        let r = mc.tick(TickInputs::new(t(5_400), clear(), reached(2))).await.unwrap();
        assert_eq!(r.command, Some(CommandKind::Loiter));

        assert_eq!(vehicle.waypoints_sent(), vec![0, 1, 2]);
        assert_eq!(
            vehicle.command_kinds(),
            vec![
                CommandKind::Waypoint,
                CommandKind::Waypoint,
                CommandKind::Waypoint,
                CommandKind::Loiter,
                CommandKind::Loiter
            ]
        );
        assert_eq!(mc.state(), MissionState::Nominal);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_reached_report_does_not_advance() {
        let vehicle = SimVehicle::new();
        let (mut mc, _sink) = controller(&vehicle, 3);
        mc.tick(TickInputs::new(t(0), clear(), healthy())).await.unwrap();
        mc.tick(TickInputs::new(t(100), clear(), reached(0))).await.unwrap();
        // Telemetry still reports waypoint 0; current is 1.
        mc.tick(TickInputs::new(t(200), clear(), reached(0))).await.unwrap();
        assert_eq!(mc.sequencer().current_index(), 1);
        assert_eq!(vehicle.waypoints_sent(), vec![0, 1]);
    }

    // ------------------------------------------------------------------ avoidance

    #[tokio::test(start_paused = true)]
    async fn resume_resends_waypoint_active_when_avoidance_began() {
        let vehicle = SimVehicle::new();
        let (mut mc, sink) = controller(&vehicle, 3);

        mc.tick(TickInputs::new(t(0), clear(), healthy())).await.unwrap();
        mc.tick(TickInputs::new(t(100), clear(), reached(0))).await.unwrap();
        assert_eq!(mc.sequencer().current_index(), 1);

        let r = mc.tick(TickInputs::new(t(200), hazard(200), healthy())).await.unwrap();
        assert_eq!((r.to, r.command), (MissionState::Avoiding, Some(CommandKind::Loiter)));

        // Inactive but seen 500 ms ago: keep holding.
        let r = mc.tick(TickInputs::new(t(700), cleared_at(200), healthy())).await.unwrap();
        assert_eq!(r.to, MissionState::Avoiding);

        let r = mc.tick(TickInputs::new(t(1_200), cleared_at(200), healthy())).await.unwrap();
        assert_eq!((r.to, r.command), (MissionState::Resuming, None));

        let r = mc.tick(TickInputs::new(t(1_300), clear(), healthy())).await.unwrap();
        assert_eq!((r.to, r.command), (MissionState::Nominal, Some(CommandKind::Waypoint)));

        assert_eq!(vehicle.waypoints_sent(), vec![0, 1, 1]);
        assert_eq!(mc.sequencer().current_index(), 1);

        let statuses: Vec<String> = sink
            .events()
            .into_iter()
            .filter_map(|e| match e.payload {
                TelemetryPayload::Status { status } => Some(status),
                _ => None,
            })
            .collect();
        assert_eq!(
            statuses,
            vec![
                MissionState::Avoiding.status_text(),
                MissionState::Resuming.status_text(),
                MissionState::Nominal.status_text()
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn hazard_during_resume_returns_to_avoiding() {
        let vehicle = SimVehicle::new();
        let (mut mc, _sink) = controller(&vehicle, 2);
        mc.tick(TickInputs::new(t(0), hazard(0), healthy())).await.unwrap();
        mc.tick(TickInputs::new(t(1_000), cleared_at(0), healthy())).await.unwrap();
        assert_eq!(mc.state(), MissionState::Resuming);

        let r = mc.tick(TickInputs::new(t(1_100), hazard(1_100), healthy())).await.unwrap();
        assert_eq!((r.to, r.command), (MissionState::Avoiding, Some(CommandKind::Loiter)));
        assert!(vehicle.waypoints_sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn hazard_takes_precedence_over_low_battery() {
        let vehicle = SimVehicle::new();
        let (mut mc, _sink) = controller(&vehicle, 2);
        let low = VehicleTelemetry::new(5.0, true);
        let r = mc.tick(TickInputs::new(t(0), hazard(0), low)).await.unwrap();
        assert_eq!(r.to, MissionState::Avoiding);
    }

    #[tokio::test(start_paused = true)]
    async fn unhealthy_link_while_avoiding_escalates_to_emergency_stop() {
        let vehicle = SimVehicle::new();
        let (mut mc, sink) = controller(&vehicle, 2);
        mc.tick(TickInputs::new(t(0), hazard(0), healthy())).await.unwrap();

        let unhealthy = VehicleTelemetry::new(90.0, false);
        mc.tick(TickInputs::new(t(100), hazard(100), unhealthy)).await.unwrap();
        // A healthy tick resets the count.
        mc.tick(TickInputs::new(t(200), hazard(200), healthy())).await.unwrap();
        mc.tick(TickInputs::new(t(300), hazard(300), unhealthy)).await.unwrap();
        mc.tick(TickInputs::new(t(400), hazard(400), unhealthy)).await.unwrap();
        assert_eq!(mc.state(), MissionState::Avoiding);

        let r = mc.tick(TickInputs::new(t(500), hazard(500), unhealthy)).await.unwrap();
        assert_eq!((r.to, r.command), (MissionState::EmergencyStop, Some(CommandKind::Stop)));
        assert!(sink.kinds().contains(&"emergency"));
    }

    // ------------------------------------------------------------------ battery

    #[tokio::test(start_paused = true)]
    async fn low_battery_returns_home_once_then_terminates() {
        let vehicle = SimVehicle::new();
        let (mut mc, sink) = controller(&vehicle, 3);
        mc.tick(TickInputs::new(t(0), clear(), healthy())).await.unwrap();

        let low = VehicleTelemetry::new(20.0, true);
        let r = mc.tick(TickInputs::new(t(100), clear(), low)).await.unwrap();
        assert_eq!((r.to, r.command), (MissionState::LowBatteryRth, Some(CommandKind::ReturnHome)));

        let r = mc.tick(TickInputs::new(t(200), clear(), low)).await.unwrap();
        assert_eq!(r.to, MissionState::Terminated);

        for ms in [300, 400, 500] {
            let r = mc.tick(TickInputs::new(t(ms), hazard(ms), low)).await.unwrap();
            assert_eq!(r, TickReport::stay(MissionState::Terminated));
        }
        let rth = vehicle
            .command_kinds()
            .into_iter()
            .filter(|k| *k == CommandKind::ReturnHome)
            .count();
        assert_eq!(rth, 1);
        assert!(sink.kinds().contains(&"battery"));
    }

    // ------------------------------------------------------------------ failures

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_force_permanent_emergency_stop() {
        let vehicle = SimVehicle::new();
        let (mut mc, sink) = controller(&vehicle, 2);
        vehicle.fail_next(100);

        let err = mc.tick(TickInputs::new(t(0), clear(), healthy())).await.unwrap_err();
        assert!(matches!(err, RescueError::RetriesExhausted { command: CommandKind::Waypoint, .. }));
        assert_eq!(mc.state(), MissionState::EmergencyStop);
        assert_eq!(vehicle.attempts(), 3);

        vehicle.fail_next(0);
        let low = VehicleTelemetry::new(5.0, true);
        let later = [
            TickInputs::new(t(100), clear(), healthy()).with_emergency_stop(true),
            TickInputs::new(t(200), hazard(200), healthy()),
            TickInputs::new(t(300), clear(), low),
            TickInputs::new(t(400), hazard(400), low),
            TickInputs::new(t(2_000), cleared_at(400), healthy()).with_return_home(true),
        ];
        for inputs in later {
            let r = mc.tick(inputs).await.unwrap();
            assert_eq!(r, TickReport::stay(MissionState::EmergencyStop));
        }
        // No stop was attempted on a dead link, and nothing after.
        assert_eq!(vehicle.attempts(), 3);
        assert!(vehicle.commands().is_empty());
        assert!(sink.kinds().contains(&"emergency"));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_within_budget_keeps_state() {
        let vehicle = SimVehicle::new();
        let (mut mc, _sink) = controller(&vehicle, 2);
        vehicle.fail_next(2);
        let r = mc.tick(TickInputs::new(t(0), clear(), healthy())).await.unwrap();
        assert_eq!((r.to, r.command), (MissionState::Nominal, Some(CommandKind::Waypoint)));
        assert_eq!(vehicle.attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn operator_emergency_stop_sends_stop_and_reports_location() {
        let vehicle = SimVehicle::new();
        let (mut mc, sink) = controller(&vehicle, 2);
        let position = Position {
            latitude: 28.6139,
            longitude: 77.209,
            altitude: 30.0,
        };
        let telemetry = healthy().with_position(position);
        let r = mc
            .tick(TickInputs::new(t(0), clear(), telemetry).with_emergency_stop(true))
            .await
            .unwrap();
        assert_eq!((r.to, r.command), (MissionState::EmergencyStop, Some(CommandKind::Stop)));

        let emergency = sink
            .events()
            .into_iter()
            .find_map(|e| match e.payload {
                TelemetryPayload::Emergency {
                    kind,
                    location,
                    device_id,
                } => Some((kind, location, device_id)),
                _ => None,
            })
            .expect("emergency event");
        assert_eq!(emergency.0, "operator_stop");
        assert_eq!(emergency.1, position.to_string());
        assert_eq!(emergency.2, "rescuelink-01");
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_telemetry_is_a_noop() {
        let vehicle = SimVehicle::new();
        let (mut mc, sink) = controller(&vehicle, 2);
        let bad = VehicleTelemetry::new(f32::NAN, true);
        let err = mc.tick(TickInputs::new(t(0), hazard(0), bad)).await.unwrap_err();
        assert!(matches!(err, RescueError::InvalidTelemetry(_)));
        assert!(!err.is_fatal());
        assert_eq!(mc.state(), MissionState::Nominal);
        assert!(vehicle.commands().is_empty());
        assert!(sink.events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn emergency_stop_overrides_invalid_telemetry() {
        let vehicle = SimVehicle::new();
        let (mut mc, sink) = controller(&vehicle, 2);
        let bad = VehicleTelemetry::new(f32::NAN, true);
        let r = mc
            .tick(TickInputs::new(t(0), clear(), bad).with_emergency_stop(true))
            .await
            .unwrap();
        assert_eq!((r.to, r.command), (MissionState::EmergencyStop, Some(CommandKind::Stop)));
        assert_eq!(vehicle.command_kinds(), vec![CommandKind::Stop]);
        // The broken reading is not reported as a battery level.
        assert!(!sink.kinds().contains(&"battery"));

        let out_of_range = VehicleTelemetry::new(140.0, true);
        let r = mc
            .tick(TickInputs::new(t(100), clear(), out_of_range).with_emergency_stop(true))
            .await
            .unwrap();
        assert_eq!(r, TickReport::stay(MissionState::EmergencyStop));
        assert_eq!(vehicle.command_kinds(), vec![CommandKind::Stop]);
    }

    #[tokio::test(start_paused = true)]
    async fn emergency_stop_now_uses_last_known_position() {
        let vehicle = SimVehicle::new();
        let (mut mc, sink) = controller(&vehicle, 2);
        let position = Position {
            latitude: 28.61,
            longitude: 77.2,
            altitude: 30.0,
        };
        mc.tick(TickInputs::new(t(0), clear(), healthy().with_position(position)))
            .await
            .unwrap();

        let r = mc.emergency_stop_now(t(100)).await;
        assert_eq!((r.from, r.to), (MissionState::Nominal, MissionState::EmergencyStop));
        assert_eq!(r.command, Some(CommandKind::Stop));
        let location = sink.events().into_iter().find_map(|e| match e.payload {
            TelemetryPayload::Emergency { location, .. } => Some(location),
            _ => None,
        });
        assert_eq!(location, Some(position.to_string()));

        let again = mc.emergency_stop_now(t(200)).await;
        assert_eq!(again, TickReport::stay(MissionState::EmergencyStop));
        assert_eq!(vehicle.command_kinds(), vec![CommandKind::Waypoint, CommandKind::Stop]);
    }

    // ------------------------------------------------------------------ recall

    #[tokio::test(start_paused = true)]
    async fn operator_recall_while_avoiding_returns_home_then_terminates() {
        let vehicle = SimVehicle::new();
        let (mut mc, sink) = controller(&vehicle, 3);
        mc.tick(TickInputs::new(t(0), hazard(0), healthy())).await.unwrap();
        assert_eq!(mc.state(), MissionState::Avoiding);

        let r = mc
            .tick(TickInputs::new(t(100), hazard(100), healthy()).with_return_home(true))
            .await
            .unwrap();
        assert_eq!((r.to, r.command), (MissionState::LowBatteryRth, Some(CommandKind::ReturnHome)));

        let r = mc
            .tick(TickInputs::new(t(200), hazard(200), healthy()).with_return_home(true))
            .await
            .unwrap();
        assert_eq!((r.to, r.command), (MissionState::Terminated, None));

        let statuses: Vec<String> = sink
            .events()
            .into_iter()
            .filter_map(|e| match e.payload {
                TelemetryPayload::Status { status } => Some(status),
                _ => None,
            })
            .collect();
        assert_eq!(
            statuses,
            vec![
                MissionState::Avoiding.status_text().to_string(),
                "Operator Recall - Returning Home".to_string(),
                MissionState::Terminated.status_text().to_string(),
            ]
        );
        assert_eq!(vehicle.command_kinds(), vec![CommandKind::Loiter, CommandKind::ReturnHome]);
    }

    #[tokio::test(start_paused = true)]
    async fn emergency_stop_wins_over_recall() {
        let vehicle = SimVehicle::new();
        let (mut mc, _sink) = controller(&vehicle, 2);
        let r = mc
            .tick(
                TickInputs::new(t(0), clear(), healthy())
                    .with_return_home(true)
                    .with_emergency_stop(true),
            )
            .await
            .unwrap();
        assert_eq!((r.to, r.command), (MissionState::EmergencyStop, Some(CommandKind::Stop)));
        assert!(!vehicle.command_kinds().contains(&CommandKind::ReturnHome));
    }

    // ------------------------------------------------------------------ telemetry

    #[tokio::test(start_paused = true)]
    async fn battery_and_location_emitted_on_change_only() {
        let vehicle = SimVehicle::new();
        let (mut mc, sink) = controller(&vehicle, 0);
        let at = |lat: f64| Position {
            latitude: lat,
            longitude: 77.2,
            altitude: 30.0,
        };

        mc.tick(TickInputs::new(t(0), clear(), VehicleTelemetry::new(90.4, true).with_position(at(28.6))))
            .await
            .unwrap();
        mc.tick(TickInputs::new(t(100), clear(), VehicleTelemetry::new(90.1, true).with_position(at(28.6))))
            .await
            .unwrap();
        mc.tick(TickInputs::new(t(200), clear(), VehicleTelemetry::new(89.9, true).with_position(at(28.7))))
            .await
            .unwrap();

        let kinds = sink.kinds();
        assert_eq!(kinds.iter().filter(|k| **k == "battery").count(), 2);
        assert_eq!(kinds.iter().filter(|k| **k == "location").count(), 2);
    }
}
