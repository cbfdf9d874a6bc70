//! Diverters
//!
//! A diverter is a junction on the eject path of one or more feeder
//! devices. Before a feeder ejects towards a target behind the diverter it
//! claims the diverter in the position that target needs. While claimed,
//! ejects that need the other position wait. When the last claim is
//! released the diverter returns to the position game logic asked for.
//! A disabled diverter is pinned inactive: ejects that need it active wait
//! until it is enabled again.

use crate::config::{DiverterConfig, DiverterType};
use crate::machine::{BallMachine, MachineTimer};
use crate::router::NodeId;
use pf_core::{BallEvent, HoldSettings, PfError, PfResult, PulseSettings, TimerHandle};

#[derive(Debug, Clone)]
pub struct Diverter {
    pub(crate) config: DiverterConfig,
    pub(crate) feeders: Vec<NodeId>,
    pub(crate) active_targets: Vec<NodeId>,
    pub(crate) inactive_targets: Vec<NodeId>,
    pub(crate) activation_pulse: PulseSettings,
    pub(crate) deactivation_pulse: PulseSettings,
    /// Current position
    pub(crate) active: bool,
    /// Position to return to when nothing is passing
    pub(crate) resting_active: bool,
    pub(crate) enabled: bool,
    /// Ejects in progress that need the current position
    pub(crate) claims: u32,
    pub(crate) release_timer: Option<TimerHandle>,
}

impl Diverter {
    pub(crate) fn new(
        config: DiverterConfig,
        feeders: Vec<NodeId>,
        active_targets: Vec<NodeId>,
        inactive_targets: Vec<NodeId>,
        activation_pulse: PulseSettings,
        deactivation_pulse: PulseSettings,
    ) -> Self {
        Self {
            config,
            feeders,
            active_targets,
            inactive_targets,
            activation_pulse,
            deactivation_pulse,
            active: false,
            resting_active: false,
            enabled: true,
            claims: 0,
            release_timer: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn claims(&self) -> u32 {
        self.claims
    }

    /// Position an eject from `feeder` to `target` needs, if this diverter is on its path
    pub(crate) fn position_for(&self, feeder: NodeId, target: NodeId) -> Option<bool> {
        if !self.feeders.contains(&feeder) {
            return None;
        }
        if self.active_targets.contains(&target) {
            Some(true)
        } else if self.inactive_targets.contains(&target) {
            Some(false)
        } else {
            None
        }
    }
}

impl BallMachine {
    /// No diverter on the way is held in the wrong position
    pub(crate) fn diverters_allow(&self, feeder: NodeId, target: NodeId) -> bool {
        self.diverters.iter().all(|d| match d.position_for(feeder, target) {
            Some(needed) if !d.enabled => !needed,
            Some(needed) => d.claims == 0 || d.active == needed,
            None => true,
        })
    }

    /// Set every diverter on the way and hold it there. Returns the claimed diverters.
    pub(crate) fn claim_diverters(&mut self, feeder: NodeId, target: NodeId) -> Vec<usize> {
        let needed: Vec<(usize, bool)> = self
            .diverters
            .iter()
            .enumerate()
            .filter_map(|(i, d)| d.position_for(feeder, target).map(|p| (i, p)))
            .collect();
        for &(index, position) in &needed {
            if let Some(diverter) = self.diverters.get_mut(index) {
                diverter.claims += 1;
            }
            self.set_diverter(index, position);
        }
        needed.into_iter().map(|(i, _)| i).collect()
    }

    pub(crate) fn release_diverters(&mut self, claimed: &[usize]) {
        for &index in claimed {
            let Some(diverter) = self.diverters.get_mut(index) else {
                continue;
            };
            diverter.claims = diverter.claims.saturating_sub(1);
            let resting = diverter.resting_active && diverter.enabled;
            if diverter.claims == 0 && diverter.active != resting {
                self.set_diverter(index, resting);
            }
        }
    }

    fn set_diverter(&mut self, index: usize, active: bool) {
        let now = self.now;
        let Some(diverter) = self.diverters.get_mut(index) else {
            return;
        };
        if diverter.active == active {
            return;
        }
        diverter.active = active;
        let name = diverter.config.name.clone();
        let kind = diverter.config.diverter_type;
        let activation = diverter.config.activation_coil.clone();
        let deactivation = diverter.config.deactivation_coil.clone();
        let activation_pulse = diverter.activation_pulse;
        let deactivation_pulse = diverter.deactivation_pulse;
        let auto_release = diverter.config.activation_time_ms.filter(|_| active);
        let old_timer = diverter.release_timer.take();
        if let Some(handle) = old_timer {
            self.timers.cancel(handle);
        }

        if active {
            log::info!("[{}] Activating", name);
            self.post(BallEvent::DiverterActivating { diverter: name });
            match kind {
                DiverterType::Hold => {
                    self.drivers
                        .enable(&activation, activation_pulse, HoldSettings::default())
                }
                DiverterType::Pulse => self.drivers.pulse(&activation, activation_pulse),
            }
        } else {
            log::info!("[{}] Deactivating", name);
            self.post(BallEvent::DiverterDeactivating { diverter: name });
            match (kind, deactivation) {
                (DiverterType::Hold, _) => self.drivers.disable(&activation),
                (DiverterType::Pulse, Some(coil)) => self.drivers.pulse(&coil, deactivation_pulse),
                (DiverterType::Pulse, None) => {}
            }
        }

        if let Some(delay) = auto_release {
            let handle =
                self.timers
                    .schedule_once(now, delay, MachineTimer::DiverterRelease { diverter: index });
            if let Some(diverter) = self.diverters.get_mut(index) {
                diverter.release_timer = Some(handle);
            }
        }
    }

    /// Activation time ran out
    pub(crate) fn handle_diverter_release(&mut self, index: usize) {
        let Some(diverter) = self.diverters.get_mut(index) else {
            return;
        };
        diverter.release_timer = None;
        diverter.resting_active = false;
        if diverter.claims == 0 {
            self.set_diverter(index, false);
        }
    }

    fn diverter_index(&self, name: &str) -> PfResult<usize> {
        self.diverters
            .iter()
            .position(|d| d.config.name == name)
            .ok_or_else(|| PfError::UnknownDevice(name.to_string()))
    }

    /// Move a diverter to its active position when no eject needs it
    pub fn activate_diverter(&mut self, name: &str) -> PfResult<()> {
        let index = self.diverter_index(name)?;
        self.rest_diverter(index, true);
        Ok(())
    }

    pub fn deactivate_diverter(&mut self, name: &str) -> PfResult<()> {
        let index = self.diverter_index(name)?;
        self.rest_diverter(index, false);
        Ok(())
    }

    fn rest_diverter(&mut self, index: usize, active: bool) {
        let Some(diverter) = self.diverters.get_mut(index) else {
            return;
        };
        diverter.resting_active = active;
        if diverter.claims == 0 && diverter.enabled {
            self.set_diverter(index, active);
        }
        self.settle();
    }

    /// Let feeder ejects and game logic move the diverter again
    pub fn enable_diverter(&mut self, name: &str) -> PfResult<()> {
        let index = self.diverter_index(name)?;
        let resting = match self.diverters.get_mut(index) {
            Some(diverter) => {
                diverter.enabled = true;
                log::debug!("[{}] Enabled", diverter.config.name);
                (diverter.claims == 0).then_some(diverter.resting_active)
            }
            None => None,
        };
        if let Some(active) = resting {
            self.set_diverter(index, active);
        }
        self.settle();
        Ok(())
    }

    /// Deactivate and keep the diverter inactive until enabled
    pub fn disable_diverter(&mut self, name: &str) -> PfResult<()> {
        let index = self.diverter_index(name)?;
        let idle = match self.diverters.get_mut(index) {
            Some(diverter) => {
                diverter.enabled = false;
                log::debug!("[{}] Disabled", diverter.config.name);
                diverter.claims == 0
            }
            None => false,
        };
        if idle {
            self.set_diverter(index, false);
        }
        Ok(())
    }

    pub fn diverter_active(&self, name: &str) -> PfResult<bool> {
        let index = self.diverter_index(name)?;
        Ok(self.diverters.get(index).is_some_and(|d| d.active))
    }

    pub fn diverters(&self) -> &[Diverter] {
        &self.diverters
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diverter() -> Diverter {
        let config = DiverterConfig {
            name: "d_lock".into(),
            activation_coil: "c_div".into(),
            deactivation_coil: None,
            diverter_type: DiverterType::Hold,
            activation_time_ms: None,
            feeder_devices: vec!["plunger".into()],
            targets_when_active: vec!["lock".into()],
            targets_when_inactive: vec!["playfield".into()],
        };
        Diverter::new(
            config,
            vec![NodeId(2)],
            vec![NodeId(3)],
            vec![NodeId(0)],
            PulseSettings::default(),
            PulseSettings::default(),
        )
    }

    #[test]
    fn test_disabled_diverter_stays_inactive() {
        let mut d = diverter();
        d.enabled = false;
        assert!(!d.is_enabled());
        assert!(!d.is_active());
        assert_eq!(d.claims(), 0);
    }

    #[test]
    fn test_position_for_feeder_targets() {
        let d = diverter();
        assert_eq!(d.position_for(NodeId(2), NodeId(3)), Some(true));
        assert_eq!(d.position_for(NodeId(2), NodeId(0)), Some(false));
        assert_eq!(d.position_for(NodeId(4), NodeId(3)), None);
        assert_eq!(d.position_for(NodeId(2), NodeId(5)), None);
    }
}
