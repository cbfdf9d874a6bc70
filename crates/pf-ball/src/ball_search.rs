//! Ball search
//!
//! When balls are in play (or an eject is stuck) and the playfield has been
//! quiet for `timeout_ms`, pulse coils one at a time to shake a stuck ball
//! loose. Three phases of increasing force:
//!
//! 1. empty devices at reduced power
//! 2. empty devices, plus the playfield's search coils at full power
//! 3. every participant at full power
//!
//! Any playfield activity or captured ball stops the search and restarts
//! the inactivity timer. When the last phase finishes without a result the
//! balls on the playfield are declared missing.

use crate::config::BallSearchConfig;
use crate::device::Ejector;
use crate::eject::AttemptPhase;
use crate::machine::{BallMachine, MachineTimer, Node};
use crate::router::NodeId;
use pf_core::{BallEvent, PfResult, PulseSettings, TimerHandle};

/// Something the search can fire
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchParticipant {
    Device(NodeId),
    Coil(String),
}

/// Next thing the search does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SearchStep {
    Fire(usize),
    NextIteration,
    NextPhase(u8),
    GiveUp,
}

/// Per-playfield search state
#[derive(Debug, Clone)]
pub struct BallSearch {
    pub(crate) config: BallSearchConfig,
    pub(crate) participants: Vec<SearchParticipant>,
    pub(crate) enabled: bool,
    pub(crate) blocked: bool,
    pub(crate) running: bool,
    pub(crate) phase: u8,
    pub(crate) iteration: u32,
    cursor: usize,
    pub(crate) start_timer: Option<TimerHandle>,
    pub(crate) tick_timer: Option<TimerHandle>,
}

impl BallSearch {
    pub fn new(config: BallSearchConfig, participants: Vec<SearchParticipant>) -> Self {
        Self {
            config,
            participants,
            enabled: false,
            blocked: false,
            running: false,
            phase: 0,
            iteration: 0,
            cursor: 0,
            start_timer: None,
            tick_timer: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Current phase, 0 when not running
    pub fn phase(&self) -> u8 {
        self.phase
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    pub fn participants(&self) -> &[SearchParticipant] {
        &self.participants
    }

    pub(crate) fn begin(&mut self) {
        self.running = true;
        self.phase = 1;
        self.iteration = 1;
        self.cursor = 0;
    }

    pub(crate) fn reset(&mut self) {
        self.running = false;
        self.phase = 0;
        self.iteration = 0;
        self.cursor = 0;
    }

    pub(crate) fn advance(&mut self) -> SearchStep {
        if self.cursor < self.participants.len() {
            let index = self.cursor;
            self.cursor += 1;
            return SearchStep::Fire(index);
        }
        self.cursor = 0;
        self.iteration += 1;
        let limit = self
            .config
            .phase_iterations
            .get(usize::from(self.phase.saturating_sub(1)))
            .copied()
            .unwrap_or(0);
        if self.iteration <= limit {
            return SearchStep::NextIteration;
        }
        if usize::from(self.phase) >= self.config.phase_iterations.len() {
            return SearchStep::GiveUp;
        }
        self.phase += 1;
        self.iteration = 1;
        SearchStep::NextPhase(self.phase)
    }
}

impl BallMachine {
    /// Enable or disable each playfield's search from the current state
    pub(crate) fn update_ball_search(&mut self) {
        let playfields: Vec<NodeId> = self.playfields().map(|p| p.id).collect();
        for pf in playfields {
            let stuck = self.devices().any(|d| {
                d.captures_from == pf
                    && d.attempt.as_ref().is_some_and(|a| {
                        a.is_stuck() || a.phase == AttemptPhase::MissingBallCheck
                    })
            });
            let Some(playfield) = self.playfield(pf) else {
                continue;
            };
            let should = playfield.search.config.enabled && (playfield.balls > 0 || stuck);
            match (should, playfield.search.enabled) {
                (true, false) => self.enable_ball_search(pf),
                (false, true) => self.disable_ball_search(pf),
                _ => {}
            }
        }
    }

    fn enable_ball_search(&mut self, pf: NodeId) {
        if let Some(playfield) = self.playfield_mut(pf) {
            log::debug!("[{}] Ball search enabled", playfield.config.name);
            playfield.search.enabled = true;
        }
        self.restart_search_timer(pf);
    }

    fn disable_ball_search(&mut self, pf: NodeId) {
        self.stop_ball_search(pf);
        let old = self.playfield_mut(pf).and_then(|p| {
            log::debug!("[{}] Ball search disabled", p.config.name);
            p.search.enabled = false;
            p.search.start_timer.take()
        });
        if let Some(handle) = old {
            self.timers.cancel(handle);
        }
    }

    fn restart_search_timer(&mut self, pf: NodeId) {
        let now = self.now;
        let Some(playfield) = self.playfield(pf) else {
            return;
        };
        let timeout = playfield.search.config.timeout_ms;
        let armed = playfield.search.enabled;
        let handle = armed.then(|| {
            self.timers
                .schedule_once(now, timeout, MachineTimer::BallSearchStart { playfield: pf })
        });
        let old = self.playfield_mut(pf).and_then(|p| match handle {
            Some(handle) => p.search.start_timer.replace(handle),
            None => p.search.start_timer.take(),
        });
        if let Some(old) = old {
            self.timers.cancel(old);
        }
    }

    /// Something moved: stop searching and start the inactivity timer over
    pub(crate) fn ball_search_activity(&mut self, pf: NodeId) {
        self.stop_ball_search(pf);
        self.restart_search_timer(pf);
    }

    fn stop_ball_search(&mut self, pf: NodeId) {
        let Some(playfield) = self.playfield_mut(pf) else {
            return;
        };
        if !playfield.search.running {
            return;
        }
        playfield.search.reset();
        let tick = playfield.search.tick_timer.take();
        let name = playfield.config.name.clone();
        if let Some(handle) = tick {
            self.timers.cancel(handle);
        }
        log::info!("[{}] Ball search stopped", name);
        self.post(BallEvent::BallSearchStopped { playfield: name });
    }

    pub(crate) fn handle_ball_search_start(&mut self, pf: NodeId) {
        let now = self.now;
        let Some(playfield) = self.playfield_mut(pf) else {
            return;
        };
        playfield.search.start_timer = None;
        if !playfield.search.enabled || playfield.search.running {
            return;
        }
        let name = playfield.config.name.clone();
        if playfield.search.blocked {
            log::debug!("[{}] Ball search due but blocked", name);
            return;
        }
        playfield.search.begin();
        let interval = playfield.search.config.interval_ms;
        log::warn!("[{}] No activity, starting ball search", name);
        let handle =
            self.timers
                .schedule_interval(now, interval, MachineTimer::BallSearchTick { playfield: pf });
        if let Some(playfield) = self.playfield_mut(pf) {
            playfield.search.tick_timer = Some(handle);
        }
        self.post(BallEvent::BallSearchStarted {
            playfield: name.clone(),
        });
        self.post(BallEvent::BallSearchPhase {
            playfield: name,
            phase: 1,
            iteration: 1,
        });
        self.ball_search_tick(pf);
    }

    /// Fire the next eligible participant
    pub(crate) fn ball_search_tick(&mut self, pf: NodeId) {
        let budget = self
            .playfield(pf)
            .map(|p| p.search.participants.len() + 1)
            .unwrap_or(0);
        for _ in 0..budget {
            let Some(playfield) = self.playfield_mut(pf) else {
                return;
            };
            if !playfield.search.running {
                return;
            }
            let step = playfield.search.advance();
            let phase = playfield.search.phase;
            let iteration = playfield.search.iteration;
            let name = playfield.config.name.clone();
            match step {
                SearchStep::Fire(index) => {
                    if self.search_fire(pf, index, phase) {
                        return;
                    }
                }
                SearchStep::NextIteration => {
                    log::debug!("[{}] Ball search phase {} iteration {}", name, phase, iteration);
                }
                SearchStep::NextPhase(phase) => {
                    log::warn!("[{}] Ball search phase {}", name, phase);
                    self.post(BallEvent::BallSearchPhase {
                        playfield: name,
                        phase,
                        iteration,
                    });
                }
                SearchStep::GiveUp => {
                    self.ball_search_failed(pf);
                    return;
                }
            }
        }
    }

    /// Pulse one participant if the phase allows it
    fn search_fire(&mut self, pf: NodeId, index: usize, phase: u8) -> bool {
        let Some(playfield) = self.playfield(pf) else {
            return false;
        };
        let reduced = playfield.search.config.reduced_power;
        let Some(participant) = playfield.search.participants.get(index).cloned() else {
            return false;
        };
        match participant {
            SearchParticipant::Coil(coil) => {
                if phase < 2 {
                    return false;
                }
                log::debug!("[{}] Ball search pulses {}", playfield.config.name, coil);
                self.drivers.pulse(&coil, PulseSettings::default());
                true
            }
            SearchParticipant::Device(id) => {
                let Some(dev) = self.device(id) else {
                    return false;
                };
                let empty = dev.balls == 0 && dev.balls_present() == 0;
                if dev.attempt.is_some() || (!empty && phase < 3) {
                    return false;
                }
                let (coil, pulse) = match &dev.ejector {
                    Ejector::Pulse { coil, pulse } => (coil.clone(), *pulse),
                    // A held ball would be released
                    Ejector::Hold { coil, pulse, .. } if empty => (coil.clone(), *pulse),
                    _ => return false,
                };
                let power = if phase == 3 { 1.0 } else { reduced };
                log::debug!(
                    "[{}] Ball search pulses {} at {:.0}%",
                    dev.name(),
                    coil,
                    power * 100.0
                );
                self.drivers.pulse(&coil, pulse.scaled(power));
                true
            }
        }
    }

    fn ball_search_failed(&mut self, pf: NodeId) {
        let Some(playfield) = self.playfield_mut(pf) else {
            return;
        };
        let lost = playfield.balls;
        let name = playfield.config.name.clone();
        log::error!("[{}] Ball search failed, {} ball(s) lost", name, lost);
        self.stop_ball_search(pf);
        self.playfield_remove(pf, lost);
        for _ in 0..lost {
            self.controller_ball_missing();
        }
        self.post(BallEvent::BallSearchFailed {
            playfield: name,
            lost_balls: lost,
        });
        self.restart_search_timer(pf);
    }

    /// Keep the search from starting (e.g. while a mode holds balls on purpose)
    pub fn block_ball_search(&mut self, playfield: &str) -> PfResult<()> {
        let id = self.playfield_node(playfield)?;
        self.stop_ball_search(id);
        if let Some(pf) = self.playfield_mut(id) {
            pf.search.blocked = true;
        }
        Ok(())
    }

    pub fn unblock_ball_search(&mut self, playfield: &str) -> PfResult<()> {
        let id = self.playfield_node(playfield)?;
        if let Some(pf) = self.playfield_mut(id) {
            pf.search.blocked = false;
        }
        self.restart_search_timer(id);
        Ok(())
    }

    pub fn ball_search_running(&self) -> bool {
        self.nodes
            .iter()
            .any(|n| matches!(n, Node::Playfield(p) if p.search.running))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn search(participants: usize) -> BallSearch {
        let config = BallSearchConfig {
            phase_iterations: [1, 1, 2],
            ..BallSearchConfig::default()
        };
        let list = (0..participants)
            .map(|i| SearchParticipant::Coil(format!("c_{i}")))
            .collect();
        BallSearch::new(config, list)
    }

    #[test]
    fn test_walks_participants_then_phases() {
        let mut s = search(2);
        s.begin();
        assert_eq!(s.advance(), SearchStep::Fire(0));
        assert_eq!(s.advance(), SearchStep::Fire(1));
        assert_eq!(s.advance(), SearchStep::NextPhase(2));
        assert_eq!(s.advance(), SearchStep::Fire(0));
        assert_eq!(s.advance(), SearchStep::Fire(1));
        assert_eq!(s.advance(), SearchStep::NextPhase(3));
        assert_eq!(s.advance(), SearchStep::Fire(0));
        assert_eq!(s.advance(), SearchStep::Fire(1));
        assert_eq!(s.advance(), SearchStep::NextIteration);
        assert_eq!(s.iteration(), 2);
        assert_eq!(s.advance(), SearchStep::Fire(0));
        assert_eq!(s.advance(), SearchStep::Fire(1));
        assert_eq!(s.advance(), SearchStep::GiveUp);
    }

    #[test]
    fn test_without_participants_still_ends() {
        let mut s = search(0);
        s.begin();
        let steps: Vec<SearchStep> = (0..4).map(|_| s.advance()).collect();
        assert_eq!(
            steps,
            vec![
                SearchStep::NextPhase(2),
                SearchStep::NextPhase(3),
                SearchStep::NextIteration,
                SearchStep::GiveUp
            ]
        );
    }

    #[test]
    fn test_reset_clears_progress() {
        let mut s = search(1);
        s.begin();
        s.advance();
        s.reset();
        assert!(!s.is_running());
        assert_eq!(s.phase(), 0);
    }
}
