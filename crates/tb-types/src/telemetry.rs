use serde::{Deserialize, Serialize};

/// One telemetry frame reported by the plant
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Telemetry {
    /// Plant-side uptime in milliseconds
    pub timestamp_ms: u64,
    /// Pitch angle in degrees, zero when upright
    pub pitch_deg: f64,
    /// Wheel speed in firmware units
    pub speed: f64,
    /// Control loop execution time in milliseconds
    pub loop_time_ms: f64,
}

impl Telemetry {
    pub fn new(timestamp_ms: u64, pitch_deg: f64, speed: f64, loop_time_ms: f64) -> Self {
        Self {
            timestamp_ms,
            pitch_deg,
            speed,
            loop_time_ms,
        }
    }
}

/// Events pushed by the plant over its link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PlantEvent {
    /// Periodic state frame
    Telemetry(Telemetry),
    /// Safety abort raised by the plant (fall, motor fault, kill switch)
    Emergency { reason: String },
    /// Plant-side completion signal for a relay experiment
    RelayDone,
}

impl PlantEvent {
    pub fn is_emergency(&self) -> bool {
        matches!(self, PlantEvent::Emergency { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_telemetry_construction() {
        let t = Telemetry::new(1500, -1.25, 0.4, 9.8);
        assert_eq!(t.timestamp_ms, 1500);
        assert_eq!(t.pitch_deg, -1.25);
        assert_eq!(t.speed, 0.4);
        assert_eq!(t.loop_time_ms, 9.8);
    }

    #[test]
    fn test_event_classification() {
        let frame = PlantEvent::Telemetry(Telemetry::new(0, 0.0, 0.0, 10.0));
        assert!(!frame.is_emergency());

        let alert = PlantEvent::Emergency {
            reason: "pitch limit exceeded".to_string(),
        };
        assert!(alert.is_emergency());
        assert!(!PlantEvent::RelayDone.is_emergency());
    }

    #[test]
    fn test_event_serde_round_trip() {
        let event = PlantEvent::Telemetry(Telemetry::new(20, 2.0, 0.1, 10.0));
        let json = serde_json::to_string(&event).unwrap();
        let back: PlantEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(event, back);
    }
}
