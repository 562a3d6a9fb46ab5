//! Topic-based publish/subscribe telemetry bus.
//!
//! Uses [`tokio::sync::broadcast`] channels under the hood so that every
//! subscriber receives every event without any single subscriber blocking
//! the publisher.  A slow subscriber lags and loses the oldest events; the
//! control loop never waits on it.
//!
//! # Topics
//!
//! Each event goes to the lane matching its payload type, and also to the
//! global channel:
//!
//! | Topic | Traffic |
//! |---|---|
//! | [`Topic::Status`] | Mission state transitions |
//! | [`Topic::Battery`] | Battery level changes |
//! | [`Topic::Location`] | Position changes |
//! | [`Topic::Emergency`] | Emergency-stop alerts |
//! | [`Topic::Log`] | Operator log lines |

use rescuelink_types::{RescueError, TelemetryEvent, TelemetryPayload};
use tokio::sync::broadcast;
use tracing::warn;

/// Default channel capacity (number of buffered events before old ones are
/// dropped for slow subscribers).
const DEFAULT_CAPACITY: usize = 256;

/// Routing lanes on the telemetry bus, one per payload type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Status,
    Battery,
    Location,
    Emergency,
    Log,
}

impl Topic {
    /// The lane an event with `payload` is routed to.
    pub fn of(payload: &TelemetryPayload) -> Self {
        match payload {
            TelemetryPayload::Status { .. } => Topic::Status,
            TelemetryPayload::Battery { .. } => Topic::Battery,
            TelemetryPayload::Location { .. } => Topic::Location,
            TelemetryPayload::Emergency { .. } => Topic::Emergency,
            TelemetryPayload::Log { .. } => Topic::Log,
        }
    }
}

/// Shared telemetry bus. Clone it cheaply – all clones share the same
/// underlying broadcast channels.
#[derive(Clone, Debug)]
pub struct TelemetryBus {
    all: broadcast::Sender<TelemetryEvent>,
    status: broadcast::Sender<TelemetryEvent>,
    battery: broadcast::Sender<TelemetryEvent>,
    location: broadcast::Sender<TelemetryEvent>,
    emergency: broadcast::Sender<TelemetryEvent>,
    log: broadcast::Sender<TelemetryEvent>,
}

impl TelemetryBus {
    /// Create a new bus with the given channel capacity.
    ///
    /// The `capacity` is applied to every channel independently.
    pub fn new(capacity: usize) -> Self {
        let (all, _) = broadcast::channel(capacity);
        let (status, _) = broadcast::channel(capacity);
        let (battery, _) = broadcast::channel(capacity);
        let (location, _) = broadcast::channel(capacity);
        let (emergency, _) = broadcast::channel(capacity);
        let (log, _) = broadcast::channel(capacity);
        Self {
            all,
            status,
            battery,
            location,
            emergency,
            log,
        }
    }

    /// Publish `event` to its topic lane and to the global channel.
    ///
    /// Returns the total number of receivers handed the event.
    ///
    /// # Errors
    ///
    /// Returns [`RescueError::Channel`] when nobody is listening on either
    /// channel.
    pub fn publish(&self, event: TelemetryEvent) -> Result<usize, RescueError> {
        let topic = Topic::of(&event.payload);
        let on_topic = self.topic_sender(topic).send(event.clone()).unwrap_or(0);
        let on_all = self.all.send(event).unwrap_or(0);
        match on_topic + on_all {
            0 => Err(RescueError::Channel(format!(
                "no subscribers for topic {topic:?}"
            ))),
            n => Ok(n),
        }
    }

    /// Subscribe to one [`Topic`] lane.
    pub fn subscribe_to(&self, topic: Topic) -> TopicReceiver {
        TopicReceiver {
            topic: Some(topic),
            receiver: self.topic_sender(topic).subscribe(),
        }
    }

    /// Subscribe to every event regardless of topic.
    pub fn subscribe_all(&self) -> TopicReceiver {
        TopicReceiver {
            topic: None,
            receiver: self.all.subscribe(),
        }
    }

    fn topic_sender(&self, topic: Topic) -> &broadcast::Sender<TelemetryEvent> {
        match topic {
            Topic::Status => &self.status,
            Topic::Battery => &self.battery,
            Topic::Location => &self.location,
            Topic::Emergency => &self.emergency,
            Topic::Log => &self.log,
        }
    }
}

impl Default for TelemetryBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// An async receiver bound to one lane, or to the global channel.
pub struct TopicReceiver {
    topic: Option<Topic>,
    receiver: broadcast::Receiver<TelemetryEvent>,
}

impl TopicReceiver {
    /// Wait for the next event, skipping over lag.
    ///
    /// Returns `None` when the bus has shut down.
    pub async fn recv(&mut self) -> Option<TelemetryEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(topic = ?self.topic, lagged_by = n, "telemetry subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Take an already-buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<TelemetryEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!(topic = ?self.topic, lagged_by = n, "telemetry subscriber lagged");
                }
                Err(_) => return None,
            }
        }
    }

    /// `None` for a global subscriber.
    pub fn topic(&self) -> Option<Topic> {
        self.topic
    }
}
