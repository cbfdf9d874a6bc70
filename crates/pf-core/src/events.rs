//! Ball tracking events and the bus they are posted on
//!
//! Every observable step of ball movement (arrivals, eject attempts and
//! their outcome, captures, missing and found balls, ball search progress)
//! is a [`BallEvent`]. Consumers such as game logic, displays or the
//! simulator subscribe through an [`EventBus`]; the core never depends on
//! what they do with the events.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Count inconsistency detected at runtime.
///
/// Anomalies are never fatal: they are logged, posted and the affected
/// counter is clamped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Anomaly {
    /// A count would have gone below zero
    NegativeCount { device: String },
    /// A ball turned up with no missing ball to account for it
    FoundWithoutDeficit { device: String },
    /// An incoming-ball promise expired while its source still had no outcome
    UnknownIncomingExpired { device: String, source: String },
    /// A counter saw more balls than the device can hold
    CountOverCapacity { device: String, capacity: u32 },
    /// A capture was reported while the playfield believed it held no balls
    PlayfieldUnderflow { playfield: String },
}

/// Observable ball tracking event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BallEvent {
    BallEnter {
        device: String,
        new_balls: u32,
        unclaimed_balls: u32,
    },
    BallCountChanged {
        device: String,
        balls: u32,
    },
    EjectAttempt {
        device: String,
        target: String,
        attempt: u32,
        mechanical: bool,
    },
    EjectSuccess {
        device: String,
        target: String,
    },
    EjectFailed {
        device: String,
        target: String,
        attempt: u32,
        retry: bool,
    },
    EjectBroken {
        device: String,
    },
    BallMissing {
        device: String,
        balls: u32,
    },
    CapturedFromPlayfield {
        device: String,
        playfield: String,
    },
    BallDrain {
        device: String,
        balls: u32,
    },
    BallFound {
        device: String,
        num_balls_known: u32,
    },
    BallCountAnomaly {
        anomaly: Anomaly,
    },
    PlayfieldBallCountChange {
        playfield: String,
        balls: u32,
        change: i32,
    },
    PlayfieldActive {
        playfield: String,
    },
    UnexpectedBallOnPlayfield {
        playfield: String,
    },
    BallSearchStarted {
        playfield: String,
    },
    BallSearchPhase {
        playfield: String,
        phase: u8,
        iteration: u32,
    },
    BallSearchStopped {
        playfield: String,
    },
    BallSearchFailed {
        playfield: String,
        lost_balls: u32,
    },
    DiverterActivating {
        diverter: String,
    },
    DiverterDeactivating {
        diverter: String,
    },
    CollectingBalls,
    CollectingBallsComplete,
}

impl BallEvent {
    /// Event name as seen by subscribers
    pub fn name(&self) -> String {
        match self {
            BallEvent::BallEnter { device, .. } => format!("balldevice_{device}_ball_enter"),
            BallEvent::BallCountChanged { device, .. } => {
                format!("balldevice_{device}_ball_count_changed")
            }
            BallEvent::EjectAttempt { device, .. } => {
                format!("balldevice_{device}_ball_eject_attempt")
            }
            BallEvent::EjectSuccess { device, .. } => {
                format!("balldevice_{device}_ball_eject_success")
            }
            BallEvent::EjectFailed { device, .. } => {
                format!("balldevice_{device}_ball_eject_failed")
            }
            BallEvent::EjectBroken { device } => format!("balldevice_{device}_eject_broken"),
            BallEvent::BallMissing { balls, .. } => format!("balldevice_{balls}_ball_missing"),
            BallEvent::CapturedFromPlayfield { playfield, .. } => {
                format!("balldevice_captured_from_{playfield}")
            }
            BallEvent::BallDrain { .. } => "ball_drain".to_string(),
            BallEvent::BallFound { .. } => "ball_found".to_string(),
            BallEvent::BallCountAnomaly { .. } => "ball_count_anomaly".to_string(),
            BallEvent::PlayfieldBallCountChange { playfield, .. } => {
                format!("{playfield}_ball_count_change")
            }
            BallEvent::PlayfieldActive { playfield } => format!("{playfield}_active"),
            BallEvent::UnexpectedBallOnPlayfield { playfield } => {
                format!("unexpected_ball_on_{playfield}")
            }
            BallEvent::BallSearchStarted { .. } => "ball_search_started".to_string(),
            BallEvent::BallSearchPhase { phase, .. } => format!("ball_search_phase_{phase}"),
            BallEvent::BallSearchStopped { .. } => "ball_search_stopped".to_string(),
            BallEvent::BallSearchFailed { .. } => "ball_search_failed".to_string(),
            BallEvent::DiverterActivating { diverter } => format!("diverter_{diverter}_activating"),
            BallEvent::DiverterDeactivating { diverter } => {
                format!("diverter_{diverter}_deactivating")
            }
            BallEvent::CollectingBalls => "collecting_balls".to_string(),
            BallEvent::CollectingBallsComplete => "collecting_balls_complete".to_string(),
        }
    }

    /// Device or playfield the event is about
    pub fn subject(&self) -> Option<&str> {
        match self {
            BallEvent::BallEnter { device, .. }
            | BallEvent::BallCountChanged { device, .. }
            | BallEvent::EjectAttempt { device, .. }
            | BallEvent::EjectSuccess { device, .. }
            | BallEvent::EjectFailed { device, .. }
            | BallEvent::EjectBroken { device }
            | BallEvent::BallMissing { device, .. }
            | BallEvent::CapturedFromPlayfield { device, .. }
            | BallEvent::BallDrain { device, .. }
            | BallEvent::BallFound { device, .. } => Some(device),
            BallEvent::PlayfieldBallCountChange { playfield, .. }
            | BallEvent::PlayfieldActive { playfield }
            | BallEvent::UnexpectedBallOnPlayfield { playfield }
            | BallEvent::BallSearchStarted { playfield }
            | BallEvent::BallSearchPhase { playfield, .. }
            | BallEvent::BallSearchStopped { playfield }
            | BallEvent::BallSearchFailed { playfield, .. } => Some(playfield),
            BallEvent::DiverterActivating { diverter }
            | BallEvent::DiverterDeactivating { diverter } => Some(diverter),
            BallEvent::BallCountAnomaly { .. }
            | BallEvent::CollectingBalls
            | BallEvent::CollectingBallsComplete => None,
        }
    }

    /// Change in the subject's ball count carried by this event
    pub fn ball_delta(&self) -> i32 {
        match self {
            BallEvent::BallEnter { new_balls, .. } => *new_balls as i32,
            BallEvent::EjectSuccess { .. } => -1,
            BallEvent::BallMissing { balls, .. } => -(*balls as i32),
            BallEvent::PlayfieldBallCountChange { change, .. } => *change,
            BallEvent::BallSearchFailed { lost_balls, .. } => -(*lost_balls as i32),
            _ => 0,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// EVENT BUS
// ═══════════════════════════════════════════════════════════════════════════════

/// Sink for ball events
pub trait EventBus: Send {
    fn post(&mut self, event: BallEvent);
}

/// Forwards every event to the `log` facade
#[derive(Debug, Default, Clone, Copy)]
pub struct LogEventBus;

impl EventBus for LogEventBus {
    fn post(&mut self, event: BallEvent) {
        log::info!("[event] {} {:?}", event.name(), event);
    }
}

/// Keeps every posted event. Clones share the same record.
#[derive(Debug, Default, Clone)]
pub struct RecordingEventBus {
    events: Arc<Mutex<Vec<BallEvent>>>,
}

impl RecordingEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<BallEvent> {
        self.events.lock().clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.events.lock().iter().map(BallEvent::name).collect()
    }

    /// Number of events posted under `name`
    pub fn count(&self, name: &str) -> usize {
        self.events.lock().iter().filter(|e| e.name() == name).count()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventBus for RecordingEventBus {
    fn post(&mut self, event: BallEvent) {
        log::debug!("[event] {}", event.name());
        self.events.lock().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names() {
        let enter = BallEvent::BallEnter {
            device: "lock".into(),
            new_balls: 1,
            unclaimed_balls: 0,
        };
        assert_eq!(enter.name(), "balldevice_lock_ball_enter");
        assert_eq!(enter.ball_delta(), 1);

        let missing = BallEvent::BallMissing {
            device: "trough".into(),
            balls: 1,
        };
        assert_eq!(missing.name(), "balldevice_1_ball_missing");
        assert_eq!(missing.subject(), Some("trough"));

        let captured = BallEvent::CapturedFromPlayfield {
            device: "lock".into(),
            playfield: "playfield".into(),
        };
        assert_eq!(captured.name(), "balldevice_captured_from_playfield");
    }

    #[test]
    fn test_recording_bus_shared_between_clones() {
        let bus = RecordingEventBus::new();
        let mut writer = bus.clone();
        writer.post(BallEvent::CollectingBalls);
        writer.post(BallEvent::CollectingBallsComplete);
        assert_eq!(bus.len(), 2);
        assert_eq!(bus.count("collecting_balls"), 1);
        bus.clear();
        assert!(writer.events().is_empty());
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = BallEvent::BallCountAnomaly {
            anomaly: Anomaly::PlayfieldUnderflow {
                playfield: "playfield".into(),
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "ball_count_anomaly");
        assert_eq!(json["anomaly"]["kind"], "playfield_underflow");
    }

    #[test]
    fn test_log_bus_accepts_events() {
        let mut bus: Box<dyn EventBus> = Box::new(LogEventBus);
        bus.post(BallEvent::CollectingBalls);
    }
}
