//! Ball counters
//!
//! Two counting strategies:
//! - [`SwitchCounter`]: one switch per ball slot. The count is the number of
//!   active switches once they have been stable for the entrance or exit
//!   delay. Sees balls leave.
//! - [`EntranceCounter`]: entrance switch activations are counted in
//!   software up to the capacity. Cannot see balls leave, so ejects
//!   decrement the count when the coil fires.

use pf_core::Millis;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Switch-per-slot counter
#[derive(Debug, Clone)]
pub struct SwitchCounter {
    states: BTreeMap<String, bool>,
    entrance_delay_ms: Millis,
    exit_delay_ms: Millis,
}

impl SwitchCounter {
    pub fn new(switches: &[String], entrance_delay_ms: Millis, exit_delay_ms: Millis) -> Self {
        Self {
            states: switches.iter().map(|s| (s.clone(), false)).collect(),
            entrance_delay_ms,
            exit_delay_ms,
        }
    }

    /// Record a logical transition. Returns how long the switches must stay
    /// stable before the count is read.
    pub fn on_switch(&mut self, switch: &str, active: bool) -> Option<Millis> {
        let state = self.states.get_mut(switch)?;
        if *state == active {
            return None;
        }
        *state = active;
        Some(if active {
            self.entrance_delay_ms
        } else {
            self.exit_delay_ms
        })
    }

    pub fn count(&self) -> u32 {
        self.states.values().filter(|active| **active).count() as u32
    }
}

/// What an entrance switch transition meant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntranceOutcome {
    Counted(u32),
    /// Re-activation inside the ignore window
    Ignored,
    /// The device already holds `capacity` balls
    OverCapacity,
    Released,
    Unrelated,
}

/// Software counter fed by entrance switches
#[derive(Debug, Clone)]
pub struct EntranceCounter {
    switches: HashSet<String>,
    capacity: u32,
    count: u32,
    ignore_window_ms: Millis,
    last_counted: HashMap<String, Millis>,
    active: HashSet<String>,
}

impl EntranceCounter {
    pub fn new(switches: &[String], capacity: u32, ignore_window_ms: Millis) -> Self {
        Self {
            switches: switches.iter().cloned().collect(),
            capacity,
            count: 0,
            ignore_window_ms,
            last_counted: HashMap::new(),
            active: HashSet::new(),
        }
    }

    pub fn on_switch(&mut self, switch: &str, active: bool, now: Millis) -> EntranceOutcome {
        if !self.switches.contains(switch) {
            return EntranceOutcome::Unrelated;
        }
        if !active {
            self.active.remove(switch);
            return EntranceOutcome::Released;
        }
        if !self.active.insert(switch.to_string()) {
            return EntranceOutcome::Ignored;
        }
        if let Some(last) = self.last_counted.get(switch) {
            if now < last.saturating_add(self.ignore_window_ms) {
                return EntranceOutcome::Ignored;
            }
        }
        if self.count >= self.capacity {
            return EntranceOutcome::OverCapacity;
        }
        self.last_counted.insert(switch.to_string(), now);
        self.count += 1;
        EntranceOutcome::Counted(self.count)
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn any_active(&self) -> bool {
        !self.active.is_empty()
    }

    /// Entrance held active long enough: the device is full
    pub fn set_full(&mut self) {
        self.count = self.capacity;
    }

    /// The coil fired, one ball is assumed gone
    pub fn ball_left(&mut self) {
        self.count = self.count.saturating_sub(1);
    }

    pub fn reset(&mut self, count: u32) {
        self.count = count.min(self.capacity);
        self.last_counted.clear();
    }
}

/// Counting strategy of one device
#[derive(Debug, Clone)]
pub enum BallCounter {
    Switches(SwitchCounter),
    Entrance(EntranceCounter),
}

impl BallCounter {
    pub fn count(&self) -> u32 {
        match self {
            BallCounter::Switches(c) => c.count(),
            BallCounter::Entrance(c) => c.count(),
        }
    }

    /// Whether balls leaving are observed by switches
    pub fn observes_exit(&self) -> bool {
        matches!(self, BallCounter::Switches(_))
    }

    /// A ball may be sent here right now
    pub fn is_ready_to_receive(&self) -> bool {
        match self {
            BallCounter::Switches(_) => true,
            BallCounter::Entrance(c) => !c.any_active(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_switch_counter_delays() {
        let mut c = SwitchCounter::new(&names(&["s1", "s2"]), 300, 500);
        assert_eq!(c.on_switch("s1", true), Some(300));
        assert_eq!(c.on_switch("s1", true), None);
        assert_eq!(c.on_switch("s2", true), Some(300));
        assert_eq!(c.count(), 2);
        assert_eq!(c.on_switch("s1", false), Some(500));
        assert_eq!(c.count(), 1);
        assert_eq!(c.on_switch("s_other", true), None);
    }

    #[test]
    fn test_entrance_counts_up_to_capacity() {
        let mut c = EntranceCounter::new(&names(&["s_ent"]), 2, 0);
        assert_eq!(c.on_switch("s_ent", true, 0), EntranceOutcome::Counted(1));
        assert_eq!(c.on_switch("s_ent", false, 10), EntranceOutcome::Released);
        assert_eq!(c.on_switch("s_ent", true, 20), EntranceOutcome::Counted(2));
        c.on_switch("s_ent", false, 30);
        assert_eq!(
            c.on_switch("s_ent", true, 40),
            EntranceOutcome::OverCapacity
        );
        assert_eq!(c.count(), 2);
    }

    #[test]
    fn test_entrance_ignore_window() {
        let mut c = EntranceCounter::new(&names(&["s_ent"]), 3, 100);
        assert_eq!(c.on_switch("s_ent", true, 0), EntranceOutcome::Counted(1));
        c.on_switch("s_ent", false, 20);
        assert_eq!(c.on_switch("s_ent", true, 50), EntranceOutcome::Ignored);
        c.on_switch("s_ent", false, 60);
        assert_eq!(c.on_switch("s_ent", true, 150), EntranceOutcome::Counted(2));
    }

    #[test]
    fn test_entrance_ball_left_and_full() {
        let mut c = EntranceCounter::new(&names(&["s_ent"]), 3, 0);
        c.ball_left();
        assert_eq!(c.count(), 0);
        c.set_full();
        assert_eq!(c.count(), 3);
        c.ball_left();
        assert_eq!(c.count(), 2);
        c.reset(7);
        assert_eq!(c.count(), 3);
    }

    #[test]
    fn test_ready_to_receive() {
        let mut entrance = EntranceCounter::new(&names(&["s_ent"]), 1, 0);
        entrance.on_switch("s_ent", true, 0);
        let counter = BallCounter::Entrance(entrance);
        assert!(!counter.is_ready_to_receive());
        assert!(!counter.observes_exit());

        let counter = BallCounter::Switches(SwitchCounter::new(&names(&["s1"]), 0, 0));
        assert!(counter.is_ready_to_receive());
        assert!(counter.observes_exit());
    }
}
