//! In-memory machine for tests and the simulator CLI
//!
//! Wires a [`BallMachine`] to virtual switches, recording drivers, a
//! recording event bus and a manual clock. Switch states given to the
//! simulator are logical: inverted switches are flipped before they reach
//! the virtual board.

use crate::config::MachineConfig;
use crate::machine::{BallMachine, Platform};
use pf_core::virtual_platform::{VirtualDrivers, VirtualSwitches};
use pf_core::{Clock, ManualClock, Millis, PfResult, RecordingEventBus};
use std::collections::HashSet;

pub struct Simulator {
    machine: BallMachine,
    clock: ManualClock,
    switches: VirtualSwitches,
    drivers: VirtualDrivers,
    events: RecordingEventBus,
    inverted: HashSet<String>,
}

impl Simulator {
    pub fn new(config: MachineConfig) -> PfResult<Self> {
        let clock = ManualClock::new();
        let switches = VirtualSwitches::new();
        let drivers = VirtualDrivers::new();
        let events = RecordingEventBus::new();

        let inverted: HashSet<String> = config
            .switches
            .iter()
            .filter(|s| s.invert)
            .map(|s| s.name.clone())
            .collect();
        for sw in &config.switches {
            switches.add_switch(&sw.name, sw.invert);
        }

        let platform = Platform {
            switches: Box::new(switches.clone()),
            drivers: Box::new(drivers.clone()),
            clock: Box::new(clock.clone()),
            events: Box::new(events.clone()),
        };
        let machine = BallMachine::new(config, platform)?;
        Ok(Self {
            machine,
            clock,
            switches,
            drivers,
            events,
            inverted,
        })
    }

    fn raw(&self, switch: &str, active: bool) -> bool {
        active ^ self.inverted.contains(switch)
    }

    /// Set a switch before [`start`](Self::start)
    pub fn set_initial(&mut self, switch: &str, active: bool) {
        let raw = self.raw(switch, active);
        self.switches.set(switch, raw, self.clock.now_ms());
    }

    pub fn start(&mut self) {
        self.machine.start();
    }

    /// Change a switch now and let the machine react
    pub fn set_switch(&mut self, switch: &str, active: bool) {
        let raw = self.raw(switch, active);
        self.switches.set(switch, raw, self.clock.now_ms());
        self.machine.process();
    }

    /// Momentary hit (playfield switches)
    pub fn hit(&mut self, switch: &str) {
        self.set_switch(switch, true);
        self.set_switch(switch, false);
    }

    /// Run the clock forward, firing every timer at its own deadline
    pub fn advance(&mut self, ms: Millis) {
        let target = self.clock.now_ms().saturating_add(ms);
        if !self.machine.is_started() {
            self.clock.set(target);
            return;
        }
        while let Some(deadline) = self.machine.next_deadline() {
            if deadline > target {
                break;
            }
            self.clock.set(deadline);
            self.machine.process();
        }
        self.clock.set(target);
        self.machine.process();
    }

    pub fn now(&self) -> Millis {
        self.clock.now_ms()
    }

    pub fn machine(&self) -> &BallMachine {
        &self.machine
    }

    pub fn machine_mut(&mut self) -> &mut BallMachine {
        &mut self.machine
    }

    pub fn events(&self) -> &RecordingEventBus {
        &self.events
    }

    pub fn drivers(&self) -> &VirtualDrivers {
        &self.drivers
    }

    /// Logical state of a switch
    pub fn switch_state(&self, switch: &str) -> bool {
        let raw = self.switches.state(switch).unwrap_or(false);
        raw ^ self.inverted.contains(switch)
    }
}
