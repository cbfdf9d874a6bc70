//! Hardware capability interfaces
//!
//! The ball-tracking core never talks to a platform directly. It reads
//! switches through a [`SwitchSource`] and fires coils through a
//! [`DriverSink`]; a real platform, a virtual one, or a test double can
//! sit behind either trait.

use crate::error::PfResult;
use crate::time::Millis;
use serde::{Deserialize, Serialize};

/// Raw switch transition reported by a switch source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchChange {
    pub switch: String,
    /// Raw electrical state (before any inversion)
    pub active: bool,
    pub timestamp_ms: Millis,
}

/// Source of switch state and switch change notifications
pub trait SwitchSource: Send {
    /// Ask for change notifications on `switch`
    fn subscribe(&mut self, switch: &str) -> PfResult<()>;

    /// Current raw state
    fn is_active(&self, switch: &str) -> bool;

    /// Next pending change for a subscribed switch
    fn poll(&mut self) -> Option<SwitchChange>;
}

/// Coil pulse parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PulseSettings {
    #[serde(default = "default_pulse_ms")]
    pub duration_ms: u32,
    /// 0.0 - 1.0
    #[serde(default = "default_power")]
    pub power: f32,
}

fn default_pulse_ms() -> u32 {
    10
}
fn default_power() -> f32 {
    1.0
}

impl Default for PulseSettings {
    fn default() -> Self {
        Self {
            duration_ms: 10,
            power: 1.0,
        }
    }
}

impl PulseSettings {
    pub fn new(duration_ms: u32, power: f32) -> Self {
        Self {
            duration_ms,
            power: power.clamp(0.0, 1.0),
        }
    }

    /// Same pulse at a fraction of its power
    pub fn scaled(self, factor: f32) -> Self {
        Self::new(self.duration_ms, self.power * factor)
    }
}

/// Coil hold parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HoldSettings {
    /// 0.0 - 1.0
    #[serde(default = "default_hold_power")]
    pub power: f32,
}

fn default_hold_power() -> f32 {
    0.25
}

impl Default for HoldSettings {
    fn default() -> Self {
        Self { power: 0.25 }
    }
}

/// Sink for coil commands
pub trait DriverSink: Send {
    fn pulse(&mut self, driver: &str, settings: PulseSettings);

    /// Pulse then hold until disabled
    fn enable(&mut self, driver: &str, pulse: PulseSettings, hold: HoldSettings);

    fn disable(&mut self, driver: &str);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scaled_pulse_clamps_power() {
        let p = PulseSettings::new(20, 0.8).scaled(2.0);
        assert_eq!(p.duration_ms, 20);
        assert_eq!(p.power, 1.0);
        let p = PulseSettings::default().scaled(0.5);
        assert!((p.power - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn test_pulse_settings_yaml_defaults() {
        let p: PulseSettings = serde_yml::from_str("duration_ms: 25").unwrap();
        assert_eq!(p.duration_ms, 25);
        assert_eq!(p.power, 1.0);
    }
}
