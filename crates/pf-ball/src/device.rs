//! Ball device
//!
//! Holds the per-device bookkeeping: counted balls, the eject queue, the
//! eject in progress and the balls other devices promised to send here.
//! The transitions that involve other devices live on [`BallMachine`]
//! (see `eject.rs` and `incoming.rs`).
//!
//! [`BallMachine`]: crate::BallMachine

use crate::config::{DeviceConfig, TAG_DRAIN, TAG_TROUGH};
use crate::counter::BallCounter;
use crate::eject::{AttemptPhase, EjectAttempt, EjectRequest};
use crate::incoming::IncomingBalls;
use crate::router::NodeId;
use pf_core::{HoldSettings, Millis, PulseSettings, TimerHandle};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Ball device state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    #[default]
    Idle,
    /// Expecting a ball from another device, or holding a queued eject without a ball
    WaitingForBall,
    /// Coil fired, ball not yet seen leaving
    Ejecting,
    /// Ball left, target has not confirmed
    BallLeft,
    /// Target did not confirm in time
    FailedConfirm,
    /// Out of retries, waiting for the ball to turn up before declaring it missing
    MissingBallCheck,
    /// Ball would not leave after every allowed attempt
    EjectBroken,
}

impl From<AttemptPhase> for DeviceState {
    fn from(phase: AttemptPhase) -> Self {
        match phase {
            AttemptPhase::Ejecting => DeviceState::Ejecting,
            AttemptPhase::BallLeft => DeviceState::BallLeft,
            AttemptPhase::FailedConfirm => DeviceState::FailedConfirm,
            AttemptPhase::MissingBallCheck => DeviceState::MissingBallCheck,
        }
    }
}

/// How the device gets a ball out
#[derive(Debug, Clone)]
pub enum Ejector {
    Pulse {
        coil: String,
        pulse: PulseSettings,
    },
    Hold {
        coil: String,
        pulse: PulseSettings,
        hold: HoldSettings,
        release_ms: Millis,
    },
    /// Only a player mechanism (plunger) ejects
    Mechanical,
}

impl Ejector {
    pub fn coil(&self) -> Option<&str> {
        match self {
            Ejector::Pulse { coil, .. } | Ejector::Hold { coil, .. } => Some(coil),
            Ejector::Mechanical => None,
        }
    }
}

/// A ball device and its tracking state
#[derive(Debug, Clone)]
pub struct BallDevice {
    pub(crate) id: NodeId,
    pub(crate) config: DeviceConfig,
    pub(crate) counter: BallCounter,
    pub(crate) ejector: Ejector,
    pub(crate) targets: Vec<NodeId>,
    pub(crate) captures_from: NodeId,
    pub(crate) unexpected_target: NodeId,

    /// Balls this device is accountable for, including one that left but is unconfirmed
    pub(crate) balls: u32,
    /// Last settled count reported by the counter
    pub(crate) physical: u32,
    /// Balls seen leaving with no eject running, not yet declared missing
    pub(crate) unaccounted_losses: u32,
    /// Ejects confirmed at the target before the switches here settled
    pub(crate) expected_exits: u32,

    pub(crate) state: DeviceState,
    pub(crate) broken: bool,
    pub(crate) eject_queue: VecDeque<EjectRequest>,
    pub(crate) attempt: Option<EjectAttempt>,
    pub(crate) incoming: IncomingBalls,
    pub(crate) hold_engaged: bool,

    pub(crate) settle_timer: Option<TimerHandle>,
    pub(crate) full_timer: Option<TimerHandle>,
    pub(crate) idle_missing_timer: Option<TimerHandle>,
    pub(crate) hold_timer: Option<TimerHandle>,
}

impl BallDevice {
    pub(crate) fn new(
        id: NodeId,
        config: DeviceConfig,
        counter: BallCounter,
        ejector: Ejector,
        targets: Vec<NodeId>,
        captures_from: NodeId,
        unexpected_target: NodeId,
    ) -> Self {
        Self {
            id,
            config,
            counter,
            ejector,
            targets,
            captures_from,
            unexpected_target,
            balls: 0,
            physical: 0,
            unaccounted_losses: 0,
            expected_exits: 0,
            state: DeviceState::Idle,
            broken: false,
            eject_queue: VecDeque::new(),
            attempt: None,
            incoming: IncomingBalls::default(),
            hold_engaged: false,
            settle_timer: None,
            full_timer: None,
            idle_missing_timer: None,
            hold_timer: None,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn balls(&self) -> u32 {
        self.balls
    }

    pub fn capacity(&self) -> u32 {
        self.config.capacity()
    }

    pub fn is_trough(&self) -> bool {
        self.config.has_tag(TAG_TROUGH)
    }

    pub fn is_drain(&self) -> bool {
        self.config.has_tag(TAG_DRAIN)
    }

    /// Balls not yet claimed by a queued or running eject
    pub fn available_balls(&self) -> u32 {
        let claimed = self.eject_queue.len() as u32 + u32::from(self.attempt.is_some());
        self.balls.saturating_sub(claimed)
    }

    /// Room for more balls, counting the ones already promised
    pub fn free_space(&self) -> u32 {
        let occupied = self.balls.max(self.physical) + self.incoming.len() as u32;
        self.capacity().saturating_sub(occupied)
    }

    pub fn is_full(&self) -> bool {
        self.free_space() == 0
    }

    /// Balls physically here and not already handed over
    pub(crate) fn balls_present(&self) -> u32 {
        self.physical.saturating_sub(self.expected_exits)
    }

    pub fn eject_queue(&self) -> impl Iterator<Item = &EjectRequest> {
        self.eject_queue.iter()
    }

    pub fn attempt(&self) -> Option<&EjectAttempt> {
        self.attempt.as_ref()
    }

    pub fn incoming_count(&self) -> usize {
        self.incoming.len()
    }

    pub(crate) fn eject_timeout(&self, target: &str) -> Millis {
        self.config.eject_timeout_for(target)
    }

    pub(crate) fn missing_timeout(&self, target: &str) -> Millis {
        self.config.ball_missing_timeout_for(target)
    }

    /// Recompute `state`. Returns the old state if it changed.
    pub(crate) fn refresh_state(&mut self) -> Option<DeviceState> {
        let next = if self.broken {
            DeviceState::EjectBroken
        } else if let Some(attempt) = &self.attempt {
            attempt.phase.into()
        } else if !self.incoming.is_empty()
            || self
                .eject_queue
                .front()
                .is_some_and(|r| !r.already_left && self.balls_present() == 0)
        {
            DeviceState::WaitingForBall
        } else {
            DeviceState::Idle
        };
        if next == self.state {
            return None;
        }
        let previous = self.state;
        self.state = next;
        log::debug!("[{}] {:?} -> {:?}", self.name(), previous, next);
        Some(previous)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// STATUS
// ═══════════════════════════════════════════════════════════════════════════════

/// Diagnostic snapshot of one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub name: String,
    pub state: DeviceState,
    pub balls: u32,
    pub available_balls: u32,
    pub capacity: u32,
    pub counted: u32,
    /// Targets of queued ejects
    pub queued_ejects: Vec<String>,
    /// Sources of promised balls
    pub incoming_from: Vec<String>,
    pub attempt: Option<AttemptStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptStatus {
    pub target: String,
    pub phase: AttemptPhase,
    pub attempts: u32,
    pub pulse_issued_at: Millis,
    pub timeout_at: Option<Millis>,
    /// `None` when retries are unbounded
    pub retries_remaining: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::SwitchCounter;
    use crate::incoming::IncomingBall;

    fn device(capacity: usize) -> BallDevice {
        let switches: Vec<String> = (0..capacity).map(|i| format!("s_{i}")).collect();
        let names: Vec<&str> = switches.iter().map(String::as_str).collect();
        let config = DeviceConfig::new("lock", &names, "c_lock", &["playfield"]);
        BallDevice::new(
            NodeId(1),
            config,
            BallCounter::Switches(SwitchCounter::new(&switches, 500, 500)),
            Ejector::Pulse {
                coil: "c_lock".into(),
                pulse: PulseSettings::default(),
            },
            vec![NodeId(0)],
            NodeId(0),
            NodeId(0),
        )
    }

    fn request(seq: u64) -> EjectRequest {
        EjectRequest {
            seq,
            target: NodeId(0),
            route: Vec::new(),
            destination: None,
            player_controlled: false,
            already_left: false,
        }
    }

    #[test]
    fn test_available_balls_excludes_claims() {
        let mut dev = device(3);
        dev.balls = 2;
        dev.physical = 2;
        assert_eq!(dev.available_balls(), 2);
        dev.eject_queue.push_back(request(1));
        assert_eq!(dev.available_balls(), 1);
        dev.eject_queue.push_back(request(2));
        dev.eject_queue.push_back(request(3));
        assert_eq!(dev.available_balls(), 0);
    }

    #[test]
    fn test_free_space_counts_promises() {
        let mut dev = device(2);
        dev.balls = 1;
        dev.physical = 1;
        assert_eq!(dev.free_space(), 1);
        dev.incoming.push(IncomingBall {
            id: 7,
            source: NodeId(2),
            attempt: 3,
            created_at: 0,
            expires_at: None,
            timer: None,
        });
        assert!(dev.is_full());
    }

    #[test]
    fn test_state_from_queue_and_promises() {
        let mut dev = device(1);
        assert_eq!(dev.refresh_state(), None);

        dev.eject_queue.push_back(request(1));
        assert_eq!(dev.refresh_state(), Some(DeviceState::Idle));
        assert_eq!(dev.state(), DeviceState::WaitingForBall);

        dev.balls = 1;
        dev.physical = 1;
        dev.refresh_state();
        assert_eq!(dev.state(), DeviceState::Idle);

        dev.broken = true;
        dev.refresh_state();
        assert_eq!(dev.state(), DeviceState::EjectBroken);
    }
}
