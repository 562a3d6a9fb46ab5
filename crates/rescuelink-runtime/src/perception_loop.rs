//! Frame grabber and perception loop.
//!
//! ```text
//!  FrameSource ──capture──▶ FrameSlot ──newest──▶ Detector ──events──▶ ObstacleMonitor
//!   (grabber task)          (1 slot)            (perception loop)        (HazardSignal)
//! ```
//!
//! Capture and inference are blocking calls.  Each one runs on the Tokio
//! blocking pool with the collaborator moved in and handed back out, and
//! with panics caught, so a misbehaving driver costs one frame and never
//! takes the loop down.  Both loops return their collaborator by value so
//! the supervisor can release it exactly once.
//!
//! The hazard clear timer keeps running every `idle_poll` while an
//! inference call is in flight, so a slow or hung model cannot hold the
//! hazard raised past its clear period.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rescuelink_hal::{CameraFrame, Detector, FrameSource};
use rescuelink_perception::{FramePublisher, FrameSubscriber, MonitorStats, ObstacleMonitor};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::shutdown::RunFlag;

/// Capture frames at `period` until the run flag clears, publishing each
/// into the slot.
///
/// Returns the source for release, or `None` if it was lost to a cancelled
/// blocking task.
pub async fn run_frame_grabber(
    mut camera: Box<dyn FrameSource>,
    publisher: FramePublisher<CameraFrame>,
    run: RunFlag,
    period: Duration,
) -> Option<Box<dyn FrameSource>> {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut misses: u64 = 0;

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = run.stopped() => break,
        }
        if !run.is_running() || publisher.is_closed() {
            break;
        }

        let joined = tokio::task::spawn_blocking(move || {
            let result = catch_unwind(AssertUnwindSafe(|| camera.capture()));
            (camera, result)
        })
        .await;

        let (returned, result) = match joined {
            Ok(pair) => pair,
            Err(e) => {
                error!(error = %e, "frame capture task lost; camera cannot be released");
                return None;
            }
        };
        camera = returned;

        match result {
            Ok(Ok(frame)) => {
                publisher.publish(frame);
            }
            Ok(Err(e)) => {
                misses += 1;
                warn!(camera = camera.id(), error = %e, "frame capture failed");
            }
            Err(_) => {
                misses += 1;
                error!(camera = camera.id(), "frame capture panicked");
            }
        }
    }

    info!(camera = camera.id(), misses, "frame grabber stopped");
    Some(camera)
}

/// What the perception loop hands back when it exits.
pub struct PerceptionOutcome {
    /// `None` if the detector was lost to a cancelled blocking task.
    pub detector: Option<Box<dyn Detector>>,
    pub stats: MonitorStats,
    pub frames_skipped: u64,
}

/// Owns the [`ObstacleMonitor`] and drives it from the frame slot.
pub struct PerceptionLoop {
    monitor: ObstacleMonitor,
    frames: FrameSubscriber<CameraFrame>,
    run: RunFlag,
    idle_poll: Duration,
}

impl PerceptionLoop {
    /// `idle_poll` bounds how long the loop waits for a frame before it
    /// re-checks the hazard clear timer.
    pub fn new(
        monitor: ObstacleMonitor,
        frames: FrameSubscriber<CameraFrame>,
        run: RunFlag,
        idle_poll: Duration,
    ) -> Self {
        Self {
            monitor,
            frames,
            run,
            idle_poll,
        }
    }

    pub async fn run(mut self, detector: Box<dyn Detector>) -> PerceptionOutcome {
        let mut detector = Some(detector);

        while self.run.is_running() {
            let next = tokio::select! {
                next = tokio::time::timeout(self.idle_poll, self.frames.next()) => next,
                _ = self.run.stopped() => break,
            };

            match next {
                Ok(Some(latest)) => {
                    if latest.skipped > 0 {
                        debug!(skipped = latest.skipped, seq = latest.seq, "frames overwritten before inference");
                    }
                    let Some(d) = detector.take() else { break };
                    detector = self.detect(d, latest.frame).await;
                    if detector.is_none() {
                        break;
                    }
                }
                // Grabber gone.
                Ok(None) => break,
                // No frame this round.
                Err(_) => {}
            }

            self.monitor.expire(Utc::now());
        }

        let stats = self.monitor.stats();
        let frames_skipped = self.frames.skipped();
        info!(
            ingested = stats.ingested,
            eligible = stats.eligible,
            filtered = stats.filtered,
            dropped = stats.dropped,
            frames_skipped,
            "perception loop stopped"
        );
        PerceptionOutcome {
            detector,
            stats,
            frames_skipped,
        }
    }

    /// Run inference on one frame and feed the results to the monitor,
    /// expiring the hazard on schedule while the call runs.
    async fn detect(
        &mut self,
        mut detector: Box<dyn Detector>,
        frame: Arc<CameraFrame>,
    ) -> Option<Box<dyn Detector>> {
        let started = Instant::now();
        let mut inference = tokio::task::spawn_blocking(move || {
            let result = catch_unwind(AssertUnwindSafe(|| detector.detect(&frame)));
            (detector, result)
        });

        let mut clear_timer = tokio::time::interval(self.idle_poll);
        clear_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let joined = loop {
            tokio::select! {
                joined = &mut inference => break joined,
                _ = clear_timer.tick() => {
                    self.monitor.expire(Utc::now());
                }
            }
        };

        let elapsed = started.elapsed();
        if elapsed > self.idle_poll {
            debug!(elapsed_ms = elapsed.as_millis() as u64, "slow inference");
        }

        let (detector, result) = match joined {
            Ok(pair) => pair,
            Err(e) => {
                error!(error = %e, "inference task lost; detector cannot be released");
                return None;
            }
        };

        match result {
            Ok(Ok(events)) => {
                for event in events {
                    self.monitor.ingest(event);
                }
            }
            Ok(Err(e)) => warn!(detector = detector.id(), error = %e, "inference failed"),
            Err(_) => error!(detector = detector.id(), "inference panicked"),
        }
        Some(detector)
    }
}
