//! Ball controller
//!
//! Owns the number of balls known to exist in the machine. The count is
//! set once when the machine starts and afterwards only moves through
//! missing and found reports. Also hosts the machine-wide helpers game
//! logic uses around it: collecting balls home and the game start check.

use crate::config::{ControllerConfig, TAG_DRAIN, TAG_HOME, TAG_TROUGH};
use crate::machine::{BallMachine, Node};
use pf_core::{Anomaly, BallEvent};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a game cannot start right now
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StartRefusal {
    #[error("Ball search is running")]
    BallSearchRunning,

    #[error("Only {counted} of {required} balls are counted")]
    NotEnoughBalls { counted: u32, required: u32 },

    #[error("{0} balls are still in play")]
    LooseBalls(u32),

    #[error("Ball in drain {0}")]
    BallInDrain(String),

    #[error("Balls are not home: {0}")]
    NotHome(String),
}

/// Result of a found ball
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FoundBall {
    /// Balances an earlier missing report
    Recovered,
    /// Nothing was missing: the machine has more balls than it knew about
    Unaccounted,
}

/// Machine-wide ball count
#[derive(Debug, Clone)]
pub struct BallController {
    config: ControllerConfig,
    num_balls_known: u32,
    missing: u32,
    initial: u32,
    found_new: u32,
    initialized: bool,
    pub(crate) collecting: Option<Vec<String>>,
}

impl BallController {
    pub fn new(config: ControllerConfig) -> Self {
        Self {
            config,
            num_balls_known: 0,
            missing: 0,
            initial: 0,
            found_new: 0,
            initialized: false,
            collecting: None,
        }
    }

    /// Set the count from the start-up switch readings
    pub fn initialize(&mut self, count: u32) {
        log::info!("[ball_controller] {} balls known", count);
        self.num_balls_known = count;
        self.initial = count;
        self.missing = 0;
        self.found_new = 0;
        self.initialized = true;
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn num_balls_known(&self) -> u32 {
        self.num_balls_known
    }

    pub fn missing_balls(&self) -> u32 {
        self.missing
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// One ball is gone. False if the count was already zero.
    pub fn ball_missing(&mut self) -> bool {
        if self.num_balls_known == 0 {
            return false;
        }
        self.num_balls_known -= 1;
        self.missing += 1;
        true
    }

    pub fn ball_found(&mut self) -> FoundBall {
        self.num_balls_known += 1;
        if self.missing > 0 {
            self.missing -= 1;
            FoundBall::Recovered
        } else {
            self.found_new += 1;
            FoundBall::Unaccounted
        }
    }

    /// `known + missing` only moves when a ball nobody knew about shows up
    pub fn ledger_balanced(&self) -> bool {
        self.num_balls_known + self.missing == self.initial + self.found_new
    }
}

/// Snapshot of the machine-wide ball accounting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conservation {
    pub device_balls: u32,
    pub playfield_balls: u32,
    pub num_balls_known: u32,
    pub missing_balls: u32,
    /// Devices plus playfields account for every known ball
    pub balanced: bool,
}

impl BallMachine {
    pub(crate) fn controller_ball_missing(&mut self) {
        if !self.controller.ball_missing() {
            self.anomaly(Anomaly::NegativeCount {
                device: "ball_controller".into(),
            });
        }
        log::info!(
            "[ball_controller] Ball missing, {} known, {} missing",
            self.controller.num_balls_known(),
            self.controller.missing_balls()
        );
    }

    pub(crate) fn controller_ball_found(&mut self, device: &str) {
        let outcome = self.controller.ball_found();
        if outcome == FoundBall::Unaccounted {
            self.anomaly(Anomaly::FoundWithoutDeficit {
                device: device.to_string(),
            });
        }
        log::info!(
            "[ball_controller] Ball found in {}, {} known",
            device,
            self.controller.num_balls_known()
        );
        self.post(BallEvent::BallFound {
            device: device.to_string(),
            num_balls_known: self.controller.num_balls_known(),
        });
    }

    pub fn num_balls_known(&self) -> u32 {
        self.controller.num_balls_known()
    }

    pub fn controller(&self) -> &BallController {
        &self.controller
    }

    pub fn conservation(&self) -> Conservation {
        let mut device_balls = 0;
        let mut playfield_balls = 0;
        for node in &self.nodes {
            match node {
                Node::Device(d) => device_balls += d.balls,
                Node::Playfield(p) => playfield_balls += p.balls,
            }
        }
        let known = self.controller.num_balls_known();
        Conservation {
            device_balls,
            playfield_balls,
            num_balls_known: known,
            missing_balls: self.controller.missing_balls(),
            balanced: device_balls + playfield_balls == known && self.controller.ledger_balanced(),
        }
    }

    /// Every known ball sits in a device tagged with one of `tags`
    pub fn are_balls_collected(&self, tags: &[&str]) -> bool {
        let collected: u32 = self
            .devices()
            .filter(|d| tags.iter().any(|t| d.config.has_tag(t)))
            .map(|d| d.balls)
            .sum();
        let in_flight = self.devices().any(|d| d.attempt.is_some());
        !in_flight && collected >= self.controller.num_balls_known()
    }

    /// Send every ball to the devices tagged with `tags` (default: home and trough)
    pub fn collect_balls(&mut self, tags: &[&str]) {
        let tags: Vec<String> = if tags.is_empty() {
            vec![TAG_HOME.to_string(), TAG_TROUGH.to_string()]
        } else {
            tags.iter().map(|t| t.to_string()).collect()
        };
        let tag_refs: Vec<&str> = tags.iter().map(String::as_str).collect();
        log::info!("[ball_controller] Collecting balls to {:?}", tags);
        self.post(BallEvent::CollectingBalls);

        if self.are_balls_collected(&tag_refs) {
            self.post(BallEvent::CollectingBallsComplete);
            return;
        }

        let holders: Vec<_> = self
            .devices()
            .filter(|d| !tag_refs.iter().any(|t| d.config.has_tag(t)))
            .filter(|d| d.available_balls() > 0 && !d.broken)
            .map(|d| d.id)
            .collect();
        for id in holders {
            let count = self.device(id).map(|d| d.available_balls()).unwrap_or(0);
            let home = self.topology.nearest(id, |n| {
                matches!(self.nodes.get(n.0), Some(Node::Device(d)) if tag_refs.iter().any(|t| d.config.has_tag(t)))
            });
            let target = match home.and_then(|p| p.last().copied()) {
                Some(home) => home,
                None => match self.device(id) {
                    Some(d) => d.unexpected_target,
                    None => continue,
                },
            };
            for _ in 0..count {
                self.eject_towards(id, target, false);
            }
        }
        self.controller.collecting = Some(tags);
        self.settle();
    }

    pub(crate) fn check_collecting(&mut self) {
        let Some(tags) = self.controller.collecting.clone() else {
            return;
        };
        let tag_refs: Vec<&str> = tags.iter().map(String::as_str).collect();
        if self.are_balls_collected(&tag_refs) {
            self.controller.collecting = None;
            log::info!("[ball_controller] Balls collected");
            self.post(BallEvent::CollectingBallsComplete);
        }
    }

    /// Whether a game may start now
    pub fn request_to_start_game(&self) -> Result<(), StartRefusal> {
        let config = self.controller.config();
        if self.ball_search_running() {
            return Err(StartRefusal::BallSearchRunning);
        }
        let counted: u32 = self.devices().map(|d| d.balls).sum();
        if counted < config.min_balls {
            return Err(StartRefusal::NotEnoughBalls {
                counted,
                required: config.min_balls,
            });
        }
        if !config.allow_start_with_loose_balls {
            let loose: u32 = self.playfields().map(|p| p.balls).sum::<u32>()
                + self.devices().filter(|d| d.attempt.is_some()).count() as u32;
            if loose > 0 {
                return Err(StartRefusal::LooseBalls(loose));
            }
        }
        for dev in self.devices().filter(|d| d.balls > 0) {
            let home = dev.config.has_tag(TAG_HOME) || dev.config.has_tag(TAG_TROUGH);
            if home {
                continue;
            }
            if dev.config.has_tag(TAG_DRAIN) {
                if config.allow_start_with_ball_in_drain {
                    continue;
                }
                return Err(StartRefusal::BallInDrain(dev.name().to_string()));
            }
            if !config.allow_start_with_loose_balls {
                return Err(StartRefusal::NotHome(dev.name().to_string()));
            }
        }
        Ok(())
    }

    /// Log and return the count of every device and playfield
    pub fn dump_ball_counts(&self) -> Vec<(String, u32)> {
        let counts: Vec<(String, u32)> = self
            .nodes
            .iter()
            .map(|node| match node {
                Node::Device(d) => (d.name().to_string(), d.balls),
                Node::Playfield(p) => (p.name().to_string(), p.balls),
            })
            .collect();
        for (name, balls) in &counts {
            log::info!("[ball_controller] {}: {} balls", name, balls);
        }
        log::info!(
            "[ball_controller] {} known, {} missing",
            self.controller.num_balls_known(),
            self.controller.missing_balls()
        );
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_then_found() {
        let mut c = BallController::new(ControllerConfig::default());
        c.initialize(4);
        assert!(c.ball_missing());
        assert_eq!(c.num_balls_known(), 3);
        assert_eq!(c.missing_balls(), 1);
        assert_eq!(c.ball_found(), FoundBall::Recovered);
        assert_eq!(c.num_balls_known(), 4);
        assert_eq!(c.missing_balls(), 0);
        assert!(c.ledger_balanced());
    }

    #[test]
    fn test_found_without_deficit_grows_count() {
        let mut c = BallController::new(ControllerConfig::default());
        c.initialize(2);
        assert_eq!(c.ball_found(), FoundBall::Unaccounted);
        assert_eq!(c.num_balls_known(), 3);
        assert!(c.ledger_balanced());
    }

    #[test]
    fn test_never_negative() {
        let mut c = BallController::new(ControllerConfig::default());
        c.initialize(1);
        assert!(c.ball_missing());
        assert!(!c.ball_missing());
        assert_eq!(c.num_balls_known(), 0);
        assert_eq!(c.missing_balls(), 1);
    }

    #[test]
    fn test_refusal_messages() {
        let refusal = StartRefusal::NotEnoughBalls {
            counted: 1,
            required: 3,
        };
        assert_eq!(refusal.to_string(), "Only 1 of 3 balls are counted");
    }
}
