//! Dashboard frame encoding.
//!
//! The operator dashboard listens for five named events.  [`dashboard_frame`]
//! renders a [`TelemetryEvent`] as `{"event": <name>, "data": {...}}` where
//! `data` carries the payload fields plus an ISO-8601 `timestamp`.

use rescuelink_types::{TelemetryEvent, TelemetryPayload};
use serde_json::{Value, json};

/// Dashboard event name for a payload.
pub fn event_name(payload: &TelemetryPayload) -> &'static str {
    match payload {
        TelemetryPayload::Status { .. } => "status_update",
        TelemetryPayload::Battery { .. } => "battery_update",
        TelemetryPayload::Location { .. } => "location_update",
        TelemetryPayload::Emergency { .. } => "emergency_alert",
        TelemetryPayload::Log { .. } => "log_update",
    }
}

/// Render `event` as a dashboard frame.
pub fn dashboard_frame(event: &TelemetryEvent) -> Value {
    let timestamp = event.timestamp.to_rfc3339();
    let data = match &event.payload {
        TelemetryPayload::Status { status } => json!({
            "status": status,
            "timestamp": timestamp,
        }),
        TelemetryPayload::Battery { level } => json!({
            "level": level,
            "timestamp": timestamp,
        }),
        TelemetryPayload::Location { lat, lng } => json!({
            "lat": lat,
            "lng": lng,
            "timestamp": timestamp,
        }),
        TelemetryPayload::Emergency {
            kind,
            location,
            device_id,
        } => json!({
            "type": kind,
            "location": location,
            "device_id": device_id,
            "timestamp": timestamp,
        }),
        TelemetryPayload::Log { message } => json!({
            "message": message,
            "timestamp": timestamp,
        }),
    };
    json!({
        "event": event_name(&event.payload),
        "data": data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn at(payload: TelemetryPayload) -> TelemetryEvent {
        let ts = Utc.with_ymd_and_hms(2025, 9, 1, 12, 0, 0).unwrap();
        TelemetryEvent::at("rescuelink-kernel::mission_controller", payload, ts)
    }

    #[test]
    fn status_frame() {
        let frame = dashboard_frame(&at(TelemetryPayload::Status {
            status: "Mission Active".to_string(),
        }));
        assert_eq!(frame["event"], "status_update");
        assert_eq!(frame["data"]["status"], "Mission Active");
        assert_eq!(frame["data"]["timestamp"], "2025-09-01T12:00:00+00:00");
    }

    #[test]
    fn emergency_frame_uses_type_key() {
        let frame = dashboard_frame(&at(TelemetryPayload::Emergency {
            kind: "emergency_stop".to_string(),
            location: "28.613900, 77.209000".to_string(),
            device_id: "rescuelink-01".to_string(),
        }));
        assert_eq!(frame["event"], "emergency_alert");
        assert_eq!(frame["data"]["type"], "emergency_stop");
        assert_eq!(frame["data"]["device_id"], "rescuelink-01");
    }

    #[test]
    fn location_and_log_frames() {
        let frame = dashboard_frame(&at(TelemetryPayload::Location {
            lat: 28.6139,
            lng: 77.209,
        }));
        assert_eq!(frame["event"], "location_update");
        assert_eq!(frame["data"]["lng"], 77.209);

        let frame = dashboard_frame(&at(TelemetryPayload::Log {
            message: "hazard cleared".to_string(),
        }));
        assert_eq!(frame["event"], "log_update");
        assert_eq!(frame["data"]["message"], "hazard cleared");
    }
}
