//! In-memory hardware platform
//!
//! Switches are flipped by the caller and coil commands are recorded, so a
//! machine can run without hardware. Both halves are cheap handles: the
//! machine owns one clone, a test or the simulator keeps another.

use crate::error::{PfError, PfResult};
use crate::hardware::{DriverSink, HoldSettings, PulseSettings, SwitchChange, SwitchSource};
use crate::time::Millis;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

// ═══════════════════════════════════════════════════════════════════════════════
// SWITCHES
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
struct SwitchBoard {
    states: HashMap<String, bool>,
    subscribed: HashSet<String>,
    pending: VecDeque<SwitchChange>,
}

/// Virtual switch matrix
#[derive(Debug, Clone, Default)]
pub struct VirtualSwitches {
    board: Arc<Mutex<SwitchBoard>>,
}

impl VirtualSwitches {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a switch with its initial raw state
    pub fn add_switch(&self, name: &str, active: bool) {
        self.board.lock().states.insert(name.to_string(), active);
    }

    /// Set the raw state of a switch.
    ///
    /// A change on a subscribed switch is queued for `poll`. Setting a
    /// switch to its current state does nothing.
    pub fn set(&self, name: &str, active: bool, timestamp_ms: Millis) {
        let mut board = self.board.lock();
        let previous = board.states.insert(name.to_string(), active);
        if previous == Some(active) {
            return;
        }
        if board.subscribed.contains(name) {
            board.pending.push_back(SwitchChange {
                switch: name.to_string(),
                active,
                timestamp_ms,
            });
        }
    }

    pub fn state(&self, name: &str) -> Option<bool> {
        self.board.lock().states.get(name).copied()
    }

    pub fn has_pending(&self) -> bool {
        !self.board.lock().pending.is_empty()
    }
}

impl SwitchSource for VirtualSwitches {
    fn subscribe(&mut self, switch: &str) -> PfResult<()> {
        let mut board = self.board.lock();
        if !board.states.contains_key(switch) {
            return Err(PfError::UnknownSwitch(switch.to_string()));
        }
        board.subscribed.insert(switch.to_string());
        Ok(())
    }

    fn is_active(&self, switch: &str) -> bool {
        self.state(switch).unwrap_or(false)
    }

    fn poll(&mut self) -> Option<SwitchChange> {
        self.board.lock().pending.pop_front()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DRIVERS
// ═══════════════════════════════════════════════════════════════════════════════

/// Recorded coil command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum DriverCommand {
    Pulse {
        driver: String,
        settings: PulseSettings,
    },
    Enable {
        driver: String,
        pulse: PulseSettings,
        hold: HoldSettings,
    },
    Disable {
        driver: String,
    },
}

impl DriverCommand {
    pub fn driver(&self) -> &str {
        match self {
            DriverCommand::Pulse { driver, .. }
            | DriverCommand::Enable { driver, .. }
            | DriverCommand::Disable { driver } => driver,
        }
    }
}

/// Virtual coil drivers recording every command
#[derive(Debug, Clone, Default)]
pub struct VirtualDrivers {
    log: Arc<Mutex<Vec<DriverCommand>>>,
}

impl VirtualDrivers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commands(&self) -> Vec<DriverCommand> {
        self.log.lock().clone()
    }

    /// Number of pulses fired on `driver`
    pub fn pulses(&self, driver: &str) -> usize {
        self.log
            .lock()
            .iter()
            .filter(|c| matches!(c, DriverCommand::Pulse { driver: d, .. } if d == driver))
            .count()
    }

    /// Whether the last enable/disable left `driver` enabled
    pub fn is_enabled(&self, driver: &str) -> bool {
        self.log
            .lock()
            .iter()
            .rev()
            .find_map(|c| match c {
                DriverCommand::Enable { driver: d, .. } if d == driver => Some(true),
                DriverCommand::Disable { driver: d } if d == driver => Some(false),
                _ => None,
            })
            .unwrap_or(false)
    }

    pub fn clear(&self) {
        self.log.lock().clear();
    }
}

impl DriverSink for VirtualDrivers {
    fn pulse(&mut self, driver: &str, settings: PulseSettings) {
        log::trace!("[virtual] pulse {} {:?}", driver, settings);
        self.log.lock().push(DriverCommand::Pulse {
            driver: driver.to_string(),
            settings,
        });
    }

    fn enable(&mut self, driver: &str, pulse: PulseSettings, hold: HoldSettings) {
        log::trace!("[virtual] enable {}", driver);
        self.log.lock().push(DriverCommand::Enable {
            driver: driver.to_string(),
            pulse,
            hold,
        });
    }

    fn disable(&mut self, driver: &str) {
        log::trace!("[virtual] disable {}", driver);
        self.log.lock().push(DriverCommand::Disable {
            driver: driver.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_subscribed_changes_are_queued() {
        let mut sw = VirtualSwitches::new();
        sw.add_switch("s_trough_1", true);
        sw.add_switch("s_shooter", false);
        sw.subscribe("s_trough_1").unwrap();

        sw.set("s_shooter", true, 5);
        sw.set("s_trough_1", false, 10);
        sw.set("s_trough_1", false, 11);

        let change = sw.poll().unwrap();
        assert_eq!(change.switch, "s_trough_1");
        assert!(!change.active);
        assert_eq!(change.timestamp_ms, 10);
        assert!(sw.poll().is_none());
        assert!(sw.is_active("s_shooter"));
    }

    #[test]
    fn test_subscribe_unknown_switch_fails() {
        let mut sw = VirtualSwitches::new();
        assert!(matches!(
            sw.subscribe("s_nope"),
            Err(PfError::UnknownSwitch(_))
        ));
    }

    #[test]
    fn test_driver_log() {
        let drivers = VirtualDrivers::new();
        let mut sink = drivers.clone();
        sink.pulse("c_eject", PulseSettings::default());
        sink.enable("c_hold", PulseSettings::default(), HoldSettings::default());
        sink.pulse("c_eject", PulseSettings::default());
        assert_eq!(drivers.pulses("c_eject"), 2);
        assert!(drivers.is_enabled("c_hold"));
        sink.disable("c_hold");
        assert!(!drivers.is_enabled("c_hold"));
        assert_eq!(drivers.commands().len(), 4);
    }
}
