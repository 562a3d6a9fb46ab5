//! [`ObstacleMonitor`] – debounced hazard aggregator.
//!
//! The perception loop owns the monitor and feeds it every detection through
//! [`ObstacleMonitor::ingest`].  The monitor commits its conclusion to a
//! `tokio::sync::watch` cell; any number of [`HazardReader`] handles read the
//! latest committed [`HazardSignal`] without waiting on `ingest`.
//!
//! # Hysteresis
//!
//! | Edge | Condition |
//! |---|---|
//! | raise | `raise_count` eligible events whose span is ≤ `raise_window` |
//! | clear | `clear_after` elapsed since the newest eligible event |
//!
//! An event is *eligible* when its class is in the hazard allow-list and its
//! confidence is at or above the threshold.  Malformed and stale events are
//! dropped and never touch the signal.
//!
//! # Example
//!
//! ```rust
//! use chrono::{Duration, Utc};
//! use rescuelink_perception::obstacle_monitor::{HazardPolicy, ObstacleMonitor};
//! use rescuelink_types::HazardEvent;
//!
//! let mut monitor = ObstacleMonitor::new(HazardPolicy::default());
//! let reader = monitor.reader();
//! let t0 = Utc::now();
//!
//! for i in 0..3 {
//!     monitor.ingest(HazardEvent::new(0, 0.9, t0 + Duration::milliseconds(100 * i)));
//! }
//! assert!(reader.snapshot().active);
//!
//! monitor.expire(t0 + Duration::milliseconds(1200));
//! assert!(!reader.snapshot().active);
//! ```

use std::collections::{BTreeSet, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rescuelink_types::{HazardEvent, HazardSignal, RescueError};
use tokio::sync::watch;
use tracing::{debug, info, warn};

// ────────────────────────────────────────────────────────────────────────────
// Policy
// ────────────────────────────────────────────────────────────────────────────

/// COCO class ids treated as hazards by default: person, bicycle, car,
/// motorcycle, bus, truck.
pub const DEFAULT_HAZARD_CLASSES: [u32; 6] = [0, 1, 2, 3, 5, 7];

/// Filtering and hysteresis parameters for [`ObstacleMonitor`].
#[derive(Debug, Clone, PartialEq)]
pub struct HazardPolicy {
    /// Detector class ids that count as hazards.
    pub hazard_classes: BTreeSet<u32>,
    /// Minimum confidence (inclusive) for an event to be eligible.
    pub confidence_threshold: f32,
    /// `N_raise`: eligible events needed to raise the signal.
    pub raise_count: usize,
    /// `W_raise`: maximum span of those events.
    pub raise_window: Duration,
    /// `T_clear`: silence required before the signal clears.
    pub clear_after: Duration,
}

impl Default for HazardPolicy {
    fn default() -> Self {
        Self {
            hazard_classes: DEFAULT_HAZARD_CLASSES.into_iter().collect(),
            confidence_threshold: 0.6,
            raise_count: 3,
            raise_window: Duration::from_millis(500),
            clear_after: Duration::from_millis(1000),
        }
    }
}

impl HazardPolicy {
    /// # Errors
    ///
    /// Returns [`RescueError::Config`] when the threshold is outside `[0, 1]`,
    /// `raise_count` is zero, or `clear_after` is zero.
    pub fn validate(&self) -> Result<(), RescueError> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(RescueError::Config(format!(
                "confidence_threshold {} outside [0, 1]",
                self.confidence_threshold
            )));
        }
        if self.raise_count == 0 {
            return Err(RescueError::Config("raise_count must be at least 1".to_string()));
        }
        if self.clear_after.is_zero() {
            return Err(RescueError::Config("clear_after must be non-zero".to_string()));
        }
        Ok(())
    }

    /// `true` when `event` passes the class and confidence filters.
    pub fn is_eligible(&self, event: &HazardEvent) -> bool {
        self.hazard_classes.contains(&event.class_id)
            && event.confidence >= self.confidence_threshold
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Outcome & counters
// ────────────────────────────────────────────────────────────────────────────

/// What [`ObstacleMonitor::ingest`] did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// The event completed the raise condition; the signal is now active.
    Raised,
    /// Eligible; `last_seen` was refreshed but the active flag did not change.
    Eligible,
    /// Valid but below the hazard policy (wrong class or low confidence).
    Filtered,
    /// Malformed or stale; the signal was not touched.
    Dropped,
}

/// Running counters, exposed for periodic logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorStats {
    pub ingested: u64,
    pub eligible: u64,
    pub filtered: u64,
    pub dropped: u64,
}

// ────────────────────────────────────────────────────────────────────────────
// ObstacleMonitor
// ────────────────────────────────────────────────────────────────────────────

/// Sole owner and writer of the [`HazardSignal`].
pub struct ObstacleMonitor {
    policy: HazardPolicy,
    /// Timestamps of recent eligible events, oldest first.
    window: VecDeque<DateTime<Utc>>,
    newest: Option<DateTime<Utc>>,
    publisher: watch::Sender<HazardSignal>,
    stats: MonitorStats,
}

impl ObstacleMonitor {
    /// Create a monitor with an inactive signal.
    pub fn new(policy: HazardPolicy) -> Self {
        let (publisher, _) = watch::channel(HazardSignal::default());
        Self {
            window: VecDeque::with_capacity(policy.raise_count),
            policy,
            newest: None,
            publisher,
            stats: MonitorStats::default(),
        }
    }

    /// Hand out a read-only handle to the committed signal.
    pub fn reader(&self) -> HazardReader {
        HazardReader {
            receiver: self.publisher.subscribe(),
        }
    }

    /// Latest committed signal.
    pub fn snapshot(&self) -> HazardSignal {
        *self.publisher.borrow()
    }

    pub fn policy(&self) -> &HazardPolicy {
        &self.policy
    }

    pub fn stats(&self) -> MonitorStats {
        self.stats
    }

    /// Feed one detection into the debounce window.
    pub fn ingest(&mut self, event: HazardEvent) -> IngestOutcome {
        self.stats.ingested += 1;

        if let Err(e) = event.validate() {
            self.stats.dropped += 1;
            warn!(error = %e, class_id = event.class_id, "dropping malformed hazard event");
            return IngestOutcome::Dropped;
        }

        if !self.policy.is_eligible(&event) {
            self.stats.filtered += 1;
            debug!(
                class_id = event.class_id,
                confidence = event.confidence,
                "detection filtered by hazard policy"
            );
            return IngestOutcome::Filtered;
        }

        let at = event.detected_at;
        if self.newest.is_some_and(|newest| at < newest) {
            self.stats.dropped += 1;
            warn!(
                class_id = event.class_id,
                detected_at = %at,
                "dropping stale hazard event"
            );
            return IngestOutcome::Dropped;
        }

        self.stats.eligible += 1;
        self.newest = Some(at);
        self.window.push_back(at);
        while let Some(&oldest) = self.window.front() {
            if exceeds(at - oldest, self.policy.raise_window) {
                self.window.pop_front();
            } else {
                break;
            }
        }
        while self.window.len() > self.policy.raise_count {
            self.window.pop_front();
        }

        let mut signal = self.snapshot();
        signal.last_seen = Some(at);
        signal.confidence = event.confidence;
        let raised = !signal.active && self.window.len() >= self.policy.raise_count;
        if raised {
            signal.active = true;
            info!(
                class_id = event.class_id,
                label = event.label.as_deref().unwrap_or("unknown"),
                confidence = event.confidence,
                "hazard raised"
            );
        }
        self.publisher.send_replace(signal);

        if raised {
            IngestOutcome::Raised
        } else {
            IngestOutcome::Eligible
        }
    }

    /// Parse a detection in the detector wire schema and ingest it.
    ///
    /// Unparseable input counts as a malformed event.
    pub fn ingest_json(&mut self, raw: &str) -> IngestOutcome {
        match serde_json::from_str::<HazardEvent>(raw) {
            Ok(event) => self.ingest(event),
            Err(e) => {
                self.stats.ingested += 1;
                self.stats.dropped += 1;
                warn!(error = %e, "dropping unparseable hazard event");
                IngestOutcome::Dropped
            }
        }
    }

    /// Commit the time-based clear.  Returns `true` when the signal flipped
    /// from active to inactive.
    pub fn expire(&mut self, now: DateTime<Utc>) -> bool {
        let signal = self.snapshot();
        if !signal.active {
            return false;
        }
        let Some(seen) = signal.last_seen else {
            return false;
        };
        let silence = (now - seen).to_std().unwrap_or_default();
        if silence < self.policy.clear_after {
            return false;
        }

        self.window.clear();
        self.publisher.send_replace(HazardSignal {
            active: false,
            ..signal
        });
        info!(silence_ms = silence.as_millis() as u64, "hazard cleared");
        true
    }
}

fn exceeds(span: chrono::Duration, limit: Duration) -> bool {
    span.to_std().map(|s| s > limit).unwrap_or(false)
}

// ────────────────────────────────────────────────────────────────────────────
// HazardReader
// ────────────────────────────────────────────────────────────────────────────

/// Cloneable read-only view of the committed [`HazardSignal`].
///
/// The read takes the watch cell's read lock for the duration of a copy.
#[derive(Clone, Debug)]
pub struct HazardReader {
    receiver: watch::Receiver<HazardSignal>,
}

impl HazardReader {
    pub fn snapshot(&self) -> HazardSignal {
        *self.receiver.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 9, 1, 12, 0, 0).unwrap()
    }

    fn at(ms: i64) -> DateTime<Utc> {
        t0() + chrono::Duration::milliseconds(ms)
    }

    fn person(ms: i64) -> HazardEvent {
        HazardEvent::new(0, 0.7, at(ms)).with_label("person")
    }

    // ------------------------------------------------------------------ raise

    #[test]
    fn two_events_then_silence_stays_inactive() {
        let mut monitor = ObstacleMonitor::new(HazardPolicy::default());
        assert_eq!(monitor.ingest(person(0)), IngestOutcome::Eligible);
        assert_eq!(monitor.ingest(person(100)), IngestOutcome::Eligible);
        monitor.expire(at(2000));
        let signal = monitor.snapshot();
        assert!(!signal.active);
        assert_eq!(signal.last_seen, Some(at(100)));
    }

    #[test]
    fn three_events_within_window_raise_then_clear_after_silence() {
        let mut monitor = ObstacleMonitor::new(HazardPolicy::default());
        let reader = monitor.reader();
        monitor.ingest(person(0));
        monitor.ingest(person(200));
        assert_eq!(monitor.ingest(person(400)), IngestOutcome::Raised);
        assert!(reader.snapshot().active);

        assert!(!monitor.expire(at(1399)));
        assert!(reader.snapshot().active);

        assert!(monitor.expire(at(1400)));
        assert!(!reader.snapshot().active);
    }

    #[test]
    fn events_spanning_more_than_window_do_not_raise() {
        let mut monitor = ObstacleMonitor::new(HazardPolicy::default());
        monitor.ingest(person(0));
        monitor.ingest(person(300));
        monitor.ingest(person(600));
        assert!(!monitor.snapshot().active);
        // A fourth event close to the last two completes a fresh window.
        assert_eq!(monitor.ingest(person(700)), IngestOutcome::Raised);
    }

    #[test]
    fn span_equal_to_window_still_raises() {
        let mut monitor = ObstacleMonitor::new(HazardPolicy::default());
        monitor.ingest(person(0));
        monitor.ingest(person(250));
        assert_eq!(monitor.ingest(person(500)), IngestOutcome::Raised);
    }

    #[test]
    fn raise_count_of_one_raises_on_first_event() {
        let policy = HazardPolicy {
            raise_count: 1,
            ..HazardPolicy::default()
        };
        let mut monitor = ObstacleMonitor::new(policy);
        assert_eq!(monitor.ingest(person(0)), IngestOutcome::Raised);
    }

    // ------------------------------------------------------------------ clear

    #[test]
    fn fresh_events_while_active_postpone_clear() {
        let mut monitor = ObstacleMonitor::new(HazardPolicy::default());
        for ms in [0, 100, 200] {
            monitor.ingest(person(ms));
        }
        monitor.ingest(person(900));
        assert!(!monitor.expire(at(1300)));
        assert!(monitor.snapshot().active);
        assert!(monitor.expire(at(1900)));
    }

    #[test]
    fn cleared_signal_needs_a_full_window_to_raise_again() {
        let mut monitor = ObstacleMonitor::new(HazardPolicy::default());
        for ms in [0, 100, 200] {
            monitor.ingest(person(ms));
        }
        monitor.expire(at(1200));
        assert_eq!(monitor.ingest(person(1300)), IngestOutcome::Eligible);
        assert!(!monitor.snapshot().active);
    }

    #[test]
    fn expire_on_inactive_signal_is_noop() {
        let mut monitor = ObstacleMonitor::new(HazardPolicy::default());
        assert!(!monitor.expire(at(10_000)));
        assert_eq!(monitor.snapshot(), HazardSignal::default());
    }

    // ------------------------------------------------------------------ filters

    #[test]
    fn non_hazard_class_is_filtered() {
        let mut monitor = ObstacleMonitor::new(HazardPolicy::default());
        for ms in [0, 100, 200] {
            // class 56 is "chair" in COCO
            assert_eq!(
                monitor.ingest(HazardEvent::new(56, 0.95, at(ms))),
                IngestOutcome::Filtered
            );
        }
        assert!(!monitor.snapshot().active);
        assert_eq!(monitor.snapshot().last_seen, None);
        assert_eq!(monitor.stats().filtered, 3);
    }

    #[test]
    fn low_confidence_is_filtered_and_threshold_is_inclusive() {
        let mut monitor = ObstacleMonitor::new(HazardPolicy::default());
        assert_eq!(
            monitor.ingest(HazardEvent::new(0, 0.59, at(0))),
            IngestOutcome::Filtered
        );
        assert_eq!(
            monitor.ingest(HazardEvent::new(0, 0.6, at(10))),
            IngestOutcome::Eligible
        );
    }

    // ------------------------------------------------------------------ malformed

    #[test]
    fn malformed_events_never_touch_the_signal() {
        let mut monitor = ObstacleMonitor::new(HazardPolicy::default());
        for ms in [0, 100, 200] {
            assert_eq!(
                monitor.ingest(HazardEvent::new(0, 1.7, at(ms))),
                IngestOutcome::Dropped
            );
        }
        assert_eq!(monitor.snapshot(), HazardSignal::default());
        assert_eq!(monitor.stats().dropped, 3);
    }

    #[test]
    fn malformed_event_does_not_clear_active_signal() {
        let mut monitor = ObstacleMonitor::new(HazardPolicy::default());
        for ms in [0, 100, 200] {
            monitor.ingest(person(ms));
        }
        monitor.ingest(HazardEvent::new(0, f32::NAN, at(300)));
        assert!(monitor.snapshot().active);
        assert_eq!(monitor.snapshot().last_seen, Some(at(200)));
    }

    #[test]
    fn stale_event_is_dropped() {
        let mut monitor = ObstacleMonitor::new(HazardPolicy::default());
        monitor.ingest(person(500));
        assert_eq!(monitor.ingest(person(100)), IngestOutcome::Dropped);
        assert_eq!(monitor.snapshot().last_seen, Some(at(500)));
    }

    #[test]
    fn ingest_json_accepts_wire_schema_and_drops_garbage() {
        let mut monitor = ObstacleMonitor::new(HazardPolicy::default());
        let outcome = monitor.ingest_json(
            r#"{"class_id": 2, "confidence": 0.88, "timestamp": "2025-09-01T12:00:00Z"}"#,
        );
        assert_eq!(outcome, IngestOutcome::Eligible);
        assert_eq!(monitor.ingest_json(r#"{"class_id": "car"}"#), IngestOutcome::Dropped);
        assert_eq!(monitor.ingest_json("not json"), IngestOutcome::Dropped);
        assert_eq!(monitor.stats().ingested, 3);
        assert_eq!(monitor.stats().dropped, 2);
    }

    #[test]
    fn policy_validation() {
        assert!(HazardPolicy::default().validate().is_ok());
        let bad = HazardPolicy {
            confidence_threshold: 1.5,
            ..HazardPolicy::default()
        };
        assert!(matches!(bad.validate(), Err(RescueError::Config(_))));
        let zero = HazardPolicy {
            raise_count: 0,
            ..HazardPolicy::default()
        };
        assert!(zero.validate().is_err());
    }

    // ------------------------------------------------------------------ concurrency

    #[test]
    fn concurrent_ingest_and_snapshot_never_observe_torn_signal() {
        let mut monitor = ObstacleMonitor::new(HazardPolicy::default());
        let reader = monitor.reader();

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for i in 0..5_000i64 {
                    monitor.ingest(HazardEvent::new(0, 0.75, at(i * 50)));
                    if i % 40 == 0 {
                        monitor.expire(at(i * 50 + 5_000));
                    }
                }
            });

            for _ in 0..5_000 {
                let snapshot = reader.snapshot();
                if snapshot.active {
                    assert!(snapshot.last_seen.is_some());
                    assert!((snapshot.confidence - 0.75).abs() < f32::EPSILON);
                }
                if snapshot.last_seen.is_some() {
                    assert!((snapshot.confidence - 0.75).abs() < f32::EPSILON);
                }
            }
        });
    }
}
