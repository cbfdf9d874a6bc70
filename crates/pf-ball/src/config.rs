//! Machine configuration
//!
//! A machine is described by its switches, drivers, playfields, ball devices
//! and diverters. Everything is validated up front: a machine with an invalid
//! configuration never starts.

use pf_core::{HoldSettings, Millis, PfError, PfResult, PulseSettings};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::Path;

pub const TAG_TROUGH: &str = "trough";
pub const TAG_DRAIN: &str = "drain";
pub const TAG_HOME: &str = "home";
pub const TAG_BALL_ADD_LIVE: &str = "ball_add_live";

// ═══════════════════════════════════════════════════════════════════════════════
// MACHINE
// ═══════════════════════════════════════════════════════════════════════════════

/// Complete machine description
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MachineConfig {
    #[serde(default)]
    pub switches: Vec<SwitchConfig>,
    #[serde(default)]
    pub drivers: Vec<DriverConfig>,
    #[serde(default)]
    pub playfields: Vec<PlayfieldConfig>,
    #[serde(default)]
    pub ball_devices: Vec<DeviceConfig>,
    #[serde(default)]
    pub diverters: Vec<DiverterConfig>,
    #[serde(default)]
    pub controller: ControllerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchConfig {
    pub name: String,
    /// Logical state is the inverse of the electrical state
    #[serde(default)]
    pub invert: bool,
}

impl SwitchConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            invert: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    pub name: String,
    #[serde(default)]
    pub default_pulse: PulseSettings,
}

impl DriverConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            default_pulse: PulseSettings::default(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// BALL DEVICE
// ═══════════════════════════════════════════════════════════════════════════════

/// How an eject to a playfield is confirmed
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationMode {
    /// Target reports arrival (or, for a playfield, activity / timeout without return)
    #[default]
    Target,
    /// A dedicated switch between device and playfield
    Switch(String),
    /// The device's own switches showing the ball gone
    SourceLeft,
}

/// Ball device configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// One switch per ball slot
    #[serde(default)]
    pub ball_switches: Vec<String>,
    /// Counted on activation, used together with `capacity`
    #[serde(default)]
    pub entrance_switches: Vec<String>,
    #[serde(default)]
    pub capacity: Option<u32>,
    #[serde(default)]
    pub eject_coil: Option<String>,
    #[serde(default)]
    pub eject_pulse: Option<PulseSettings>,
    /// Holds the ball while enabled, releases it while disabled
    #[serde(default)]
    pub hold_coil: Option<String>,
    #[serde(default)]
    pub hold: HoldSettings,
    /// How long the hold coil stays released for one eject (ms)
    #[serde(default = "default_hold_release")]
    pub hold_release_ms: Millis,
    /// A plunger or other player mechanism can eject the ball
    #[serde(default)]
    pub mechanical_eject: bool,
    /// Ordered; the first is the default target
    pub eject_targets: Vec<String>,
    #[serde(default = "default_eject_timeout")]
    pub eject_timeout_ms: Millis,
    /// Per target overrides of `eject_timeout_ms`
    #[serde(default)]
    pub eject_timeouts_ms: BTreeMap<String, Millis>,
    #[serde(default = "default_ball_missing_timeout")]
    pub ball_missing_timeout_ms: Millis,
    /// Per target overrides of `ball_missing_timeout_ms`
    #[serde(default)]
    pub ball_missing_timeouts_ms: BTreeMap<String, Millis>,
    /// Pulses per eject before giving up. `None` retries until the ball is missing.
    #[serde(default)]
    pub max_eject_attempts: Option<u32>,
    #[serde(default)]
    pub confirmation: ConfirmationMode,
    #[serde(default = "default_count_delay")]
    pub entrance_count_delay_ms: Millis,
    #[serde(default = "default_count_delay")]
    pub exit_count_delay_ms: Millis,
    #[serde(default)]
    pub entrance_ignore_window_ms: Millis,
    #[serde(default)]
    pub entrance_full_timeout_ms: Option<Millis>,
    #[serde(default = "default_idle_missing")]
    pub idle_missing_ball_timeout_ms: Millis,
    /// Playfield unexpected balls are captured from (default: first playfield)
    #[serde(default)]
    pub captures_from: Option<String>,
    /// Where unclaimed balls go (default: `captures_from`)
    #[serde(default)]
    pub target_on_unexpected_ball: Option<String>,
    /// Participates in ball search in this order, `None` or 0 opts out
    #[serde(default = "default_ball_search_order")]
    pub ball_search_order: Option<u32>,
}

fn default_hold_release() -> Millis {
    300
}
fn default_eject_timeout() -> Millis {
    10_000
}
fn default_ball_missing_timeout() -> Millis {
    20_000
}
fn default_count_delay() -> Millis {
    500
}
fn default_idle_missing() -> Millis {
    5_000
}
fn default_ball_search_order() -> Option<u32> {
    Some(200)
}

impl DeviceConfig {
    /// Minimal switch-counted device with an eject coil
    pub fn new(name: &str, ball_switches: &[&str], eject_coil: &str, targets: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            tags: Vec::new(),
            ball_switches: ball_switches.iter().map(|s| s.to_string()).collect(),
            entrance_switches: Vec::new(),
            capacity: None,
            eject_coil: Some(eject_coil.to_string()),
            eject_pulse: None,
            hold_coil: None,
            hold: HoldSettings::default(),
            hold_release_ms: default_hold_release(),
            mechanical_eject: false,
            eject_targets: targets.iter().map(|s| s.to_string()).collect(),
            eject_timeout_ms: default_eject_timeout(),
            eject_timeouts_ms: BTreeMap::new(),
            ball_missing_timeout_ms: default_ball_missing_timeout(),
            ball_missing_timeouts_ms: BTreeMap::new(),
            max_eject_attempts: None,
            confirmation: ConfirmationMode::Target,
            entrance_count_delay_ms: default_count_delay(),
            exit_count_delay_ms: default_count_delay(),
            entrance_ignore_window_ms: 0,
            entrance_full_timeout_ms: None,
            idle_missing_ball_timeout_ms: default_idle_missing(),
            captures_from: None,
            target_on_unexpected_ball: None,
            ball_search_order: default_ball_search_order(),
        }
    }

    /// Minimal entrance-counted device with an eject coil
    pub fn with_entrance(
        name: &str,
        entrance_switch: &str,
        capacity: u32,
        eject_coil: &str,
        targets: &[&str],
    ) -> Self {
        let mut config = Self::new(name, &[], eject_coil, targets);
        config.entrance_switches = vec![entrance_switch.to_string()];
        config.capacity = Some(capacity);
        config
    }

    pub fn tagged(mut self, tag: &str) -> Self {
        self.tags.push(tag.to_string());
        self
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    pub fn uses_entrance_counter(&self) -> bool {
        self.ball_switches.is_empty()
    }

    /// Maximum number of balls the device holds
    pub fn capacity(&self) -> u32 {
        if self.uses_entrance_counter() {
            self.capacity.unwrap_or(0)
        } else {
            self.ball_switches.len() as u32
        }
    }

    /// Switches the counter listens to
    pub fn counting_switches(&self) -> &[String] {
        if self.uses_entrance_counter() {
            &self.entrance_switches
        } else {
            &self.ball_switches
        }
    }

    pub fn eject_timeout_for(&self, target: &str) -> Millis {
        self.eject_timeouts_ms
            .get(target)
            .copied()
            .unwrap_or(self.eject_timeout_ms)
    }

    pub fn ball_missing_timeout_for(&self, target: &str) -> Millis {
        self.ball_missing_timeouts_ms
            .get(target)
            .copied()
            .unwrap_or(self.ball_missing_timeout_ms)
    }

    fn coils(&self) -> impl Iterator<Item = &String> {
        self.eject_coil.iter().chain(self.hold_coil.iter())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PLAYFIELD
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayfieldConfig {
    pub name: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Any switch a ball in play hits
    #[serde(default)]
    pub activity_switches: Vec<String>,
    #[serde(default)]
    pub ball_search: BallSearchConfig,
}

impl PlayfieldConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            tags: Vec::new(),
            activity_switches: Vec::new(),
            ball_search: BallSearchConfig::default(),
        }
    }
}

/// Ball search configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BallSearchConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Playfield inactivity before searching (ms)
    #[serde(default = "default_search_timeout")]
    pub timeout_ms: Millis,
    /// Time between coil pulses (ms)
    #[serde(default = "default_search_interval")]
    pub interval_ms: Millis,
    /// Iterations per phase
    #[serde(default = "default_phase_iterations")]
    pub phase_iterations: [u32; 3],
    /// Extra coils pulsed from phase 2 on (slingshots, kickers)
    #[serde(default)]
    pub search_coils: Vec<String>,
    /// Power used in phase 1
    #[serde(default = "default_reduced_power")]
    pub reduced_power: f32,
}

fn default_true() -> bool {
    true
}
fn default_search_timeout() -> Millis {
    20_000
}
fn default_search_interval() -> Millis {
    150
}
fn default_phase_iterations() -> [u32; 3] {
    [3, 3, 4]
}
fn default_reduced_power() -> f32 {
    0.5
}

impl Default for BallSearchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_ms: 20_000,
            interval_ms: 150,
            phase_iterations: [3, 3, 4],
            search_coils: Vec::new(),
            reduced_power: 0.5,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DIVERTER
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiverterType {
    /// Activation coil stays enabled while active
    #[default]
    Hold,
    /// Activation and deactivation coils are pulsed
    Pulse,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiverterConfig {
    pub name: String,
    pub activation_coil: String,
    #[serde(default)]
    pub deactivation_coil: Option<String>,
    #[serde(default, rename = "type")]
    pub diverter_type: DiverterType,
    /// Deactivate automatically after this long (ms)
    #[serde(default)]
    pub activation_time_ms: Option<Millis>,
    /// Devices whose ejects pass the diverter
    pub feeder_devices: Vec<String>,
    #[serde(default)]
    pub targets_when_active: Vec<String>,
    #[serde(default)]
    pub targets_when_inactive: Vec<String>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// CONTROLLER
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Balls that must be counted to start a game
    #[serde(default = "default_min_balls")]
    pub min_balls: u32,
    #[serde(default)]
    pub allow_start_with_ball_in_drain: bool,
    #[serde(default)]
    pub allow_start_with_loose_balls: bool,
}

fn default_min_balls() -> u32 {
    1
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            min_balls: 1,
            allow_start_with_ball_in_drain: false,
            allow_start_with_loose_balls: false,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// LOADING & VALIDATION
// ═══════════════════════════════════════════════════════════════════════════════

impl MachineConfig {
    /// Parse and validate a YAML machine description
    pub fn from_yaml_str(yaml: &str) -> PfResult<Self> {
        let config: MachineConfig = serde_yml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> PfResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    pub fn to_yaml(&self) -> PfResult<String> {
        Ok(serde_yml::to_string(self)?)
    }

    pub fn device(&self, name: &str) -> Option<&DeviceConfig> {
        self.ball_devices.iter().find(|d| d.name == name)
    }

    pub fn is_playfield(&self, name: &str) -> bool {
        self.playfields.iter().any(|p| p.name == name)
    }

    /// Check the whole description. Every error here is fatal.
    pub fn validate(&self) -> PfResult<()> {
        let switches: HashSet<&str> = self.switches.iter().map(|s| s.name.as_str()).collect();
        let drivers: HashSet<&str> = self.drivers.iter().map(|d| d.name.as_str()).collect();

        if switches.len() != self.switches.len() {
            return Err(PfError::DuplicateName("switch".into()));
        }
        if drivers.len() != self.drivers.len() {
            return Err(PfError::DuplicateName("driver".into()));
        }
        if self.playfields.is_empty() && !self.ball_devices.is_empty() {
            return Err(PfError::Config("at least one playfield is required".into()));
        }

        let mut nodes = HashSet::new();
        for name in self
            .playfields
            .iter()
            .map(|p| &p.name)
            .chain(self.ball_devices.iter().map(|d| &d.name))
        {
            if !nodes.insert(name.as_str()) {
                return Err(PfError::DuplicateName(name.clone()));
            }
        }

        let check_switch = |name: &str| -> PfResult<()> {
            if switches.contains(name) {
                Ok(())
            } else {
                Err(PfError::UnknownSwitch(name.to_string()))
            }
        };
        let check_driver = |name: &str| -> PfResult<()> {
            if drivers.contains(name) {
                Ok(())
            } else {
                Err(PfError::UnknownDriver(name.to_string()))
            }
        };

        let mut coil_owner: HashMap<String, String> = HashMap::new();
        let mut claim_coil = |coil: &str, owner: &str| -> PfResult<()> {
            if let Some(first) = coil_owner.get(coil) {
                return Err(PfError::CoilConflict {
                    driver: coil.to_string(),
                    first: first.clone(),
                    second: owner.to_string(),
                });
            }
            coil_owner.insert(coil.to_string(), owner.to_string());
            Ok(())
        };

        let activity: HashSet<&str> = self
            .playfields
            .iter()
            .flat_map(|p| p.activity_switches.iter().map(String::as_str))
            .collect();

        for pf in &self.playfields {
            for sw in &pf.activity_switches {
                check_switch(sw)?;
            }
            for coil in &pf.ball_search.search_coils {
                check_driver(coil)?;
            }
        }

        let mut counting_owner: HashMap<&str, &str> = HashMap::new();
        for device in &self.ball_devices {
            self.validate_device(device, &nodes, &check_switch, &check_driver)?;
            for sw in device.counting_switches() {
                if activity.contains(sw.as_str()) {
                    return Err(PfError::Config(format!(
                        "{}: switch {} is also a playfield activity switch",
                        device.name, sw
                    )));
                }
                if let Some(other) = counting_owner.insert(sw.as_str(), device.name.as_str()) {
                    return Err(PfError::Config(format!(
                        "switch {} counts balls for both {} and {}",
                        sw, other, device.name
                    )));
                }
            }
            for coil in device.coils() {
                claim_coil(coil, &device.name)?;
            }
        }

        for diverter in &self.diverters {
            check_driver(&diverter.activation_coil)?;
            claim_coil(&diverter.activation_coil, &diverter.name)?;
            if let Some(coil) = &diverter.deactivation_coil {
                check_driver(coil)?;
                claim_coil(coil, &diverter.name)?;
            }
            for feeder in &diverter.feeder_devices {
                if self.device(feeder).is_none() {
                    return Err(PfError::UnknownDevice(feeder.clone()));
                }
            }
            for target in diverter
                .targets_when_active
                .iter()
                .chain(&diverter.targets_when_inactive)
            {
                if !nodes.contains(target.as_str()) {
                    return Err(PfError::UnknownDevice(target.clone()));
                }
            }
        }

        self.validate_drains()?;
        Ok(())
    }

    fn validate_device(
        &self,
        device: &DeviceConfig,
        nodes: &HashSet<&str>,
        check_switch: &dyn Fn(&str) -> PfResult<()>,
        check_driver: &dyn Fn(&str) -> PfResult<()>,
    ) -> PfResult<()> {
        let name = &device.name;

        match (device.ball_switches.is_empty(), device.capacity) {
            (false, Some(_)) => {
                return Err(PfError::Config(format!(
                    "{name}: ball_switches and capacity are mutually exclusive"
                )));
            }
            (false, None) if !device.entrance_switches.is_empty() => {
                return Err(PfError::Config(format!(
                    "{name}: entrance_switches require capacity instead of ball_switches"
                )));
            }
            (true, None) => {
                return Err(PfError::Config(format!(
                    "{name}: either ball_switches or capacity is required"
                )));
            }
            (true, Some(0)) => {
                return Err(PfError::Config(format!("{name}: capacity must be positive")));
            }
            (true, Some(_)) if device.entrance_switches.is_empty() => {
                return Err(PfError::Config(format!(
                    "{name}: capacity requires at least one entrance switch"
                )));
            }
            _ => {}
        }
        for sw in device.counting_switches() {
            check_switch(sw)?;
        }

        match (&device.eject_coil, &device.hold_coil) {
            (Some(_), Some(_)) => {
                return Err(PfError::Config(format!(
                    "{name}: eject_coil and hold_coil are mutually exclusive"
                )));
            }
            (None, None) if !device.mechanical_eject => {
                return Err(PfError::Config(format!(
                    "{name}: needs an eject_coil, a hold_coil or mechanical_eject"
                )));
            }
            _ => {}
        }
        for coil in device.coils() {
            check_driver(coil)?;
        }

        if device.eject_targets.is_empty() {
            return Err(PfError::Topology(format!("{name}: no eject targets")));
        }
        for target in &device.eject_targets {
            if target == name {
                return Err(PfError::Topology(format!("{name}: ejects to itself")));
            }
            if !nodes.contains(target.as_str()) {
                return Err(PfError::UnknownDevice(target.clone()));
            }
        }
        for target in device
            .eject_timeouts_ms
            .keys()
            .chain(device.ball_missing_timeouts_ms.keys())
        {
            if !device.eject_targets.contains(target) {
                return Err(PfError::Timeout(format!(
                    "{name}: timeout given for {target}, which is not an eject target"
                )));
            }
        }

        for target in &device.eject_targets {
            let eject = device.eject_timeout_for(target);
            let missing = device.ball_missing_timeout_for(target);
            let settle = device
                .entrance_count_delay_ms
                .max(device.exit_count_delay_ms);
            if settle >= eject {
                return Err(PfError::Timeout(format!(
                    "{name}: count delay {settle} ms must be below the eject timeout {eject} ms to {target}"
                )));
            }
            if eject >= missing {
                return Err(PfError::Timeout(format!(
                    "{name}: eject timeout {eject} ms must be below the ball missing timeout {missing} ms to {target}"
                )));
            }
        }

        match &device.confirmation {
            ConfirmationMode::Target => {}
            mode => {
                if let ConfirmationMode::Switch(sw) = mode {
                    check_switch(sw)?;
                }
                if let Some(target) = device.eject_targets.iter().find(|t| !self.is_playfield(t)) {
                    return Err(PfError::Config(format!(
                        "{name}: {mode:?} confirmation is only possible towards a playfield, not {target}"
                    )));
                }
            }
        }

        if device.max_eject_attempts == Some(0) {
            return Err(PfError::Config(format!(
                "{name}: max_eject_attempts must be at least 1"
            )));
        }

        if let Some(pf) = &device.captures_from {
            if !self.is_playfield(pf) {
                return Err(PfError::Config(format!(
                    "{name}: captures_from {pf} is not a playfield"
                )));
            }
        }
        if let Some(target) = &device.target_on_unexpected_ball {
            if !nodes.contains(target.as_str()) {
                return Err(PfError::UnknownDevice(target.clone()));
            }
        }
        Ok(())
    }

    /// Every drain must be able to pass its balls on to some trough
    fn validate_drains(&self) -> PfResult<()> {
        for drain in self.ball_devices.iter().filter(|d| d.has_tag(TAG_DRAIN)) {
            if drain.has_tag(TAG_TROUGH) {
                continue;
            }
            let mut seen: HashSet<&str> = HashSet::new();
            let mut queue: VecDeque<&str> = VecDeque::from([drain.name.as_str()]);
            let mut reached = false;
            while let Some(current) = queue.pop_front() {
                if !seen.insert(current) {
                    continue;
                }
                let Some(device) = self.device(current) else {
                    continue;
                };
                if current != drain.name && device.has_tag(TAG_TROUGH) {
                    reached = true;
                    break;
                }
                queue.extend(device.eject_targets.iter().map(String::as_str));
            }
            if !reached {
                return Err(PfError::Topology(format!(
                    "drain {} cannot reach a trough",
                    drain.name
                )));
            }
        }
        Ok(())
    }
}
