//! Shared machine descriptions for the integration tests

#![allow(dead_code)]

use pf_ball::{
    ControllerConfig, DeviceConfig, DriverConfig, MachineConfig, PlayfieldConfig, Simulator,
    SwitchConfig, TAG_BALL_ADD_LIVE, TAG_DRAIN, TAG_HOME, TAG_TROUGH,
};
use pf_core::Millis;

/// Longer than the default entrance and exit count delays
pub const SETTLE_MS: Millis = 600;

pub const TROUGH: [&str; 3] = ["s_trough_1", "s_trough_2", "s_trough_3"];
pub const LOCK: [&str; 2] = ["s_lock_1", "s_lock_2"];

fn switches(names: &[&str]) -> Vec<SwitchConfig> {
    names.iter().map(|n| SwitchConfig::new(n)).collect()
}

fn drivers(names: &[&str]) -> Vec<DriverConfig> {
    names.iter().map(|n| DriverConfig::new(n)).collect()
}

fn quiet_playfield() -> PlayfieldConfig {
    let mut pf = PlayfieldConfig::new("playfield");
    pf.activity_switches = vec!["s_pf".into()];
    pf.ball_search.enabled = false;
    pf
}

/// trough (3) -> plunger -> playfield, lock (2) -> playfield
pub fn standard_config() -> MachineConfig {
    MachineConfig {
        switches: switches(&[
            "s_trough_1",
            "s_trough_2",
            "s_trough_3",
            "s_plunger",
            "s_lock_1",
            "s_lock_2",
            "s_pf",
        ]),
        drivers: drivers(&["c_trough", "c_plunger", "c_lock"]),
        playfields: vec![quiet_playfield()],
        ball_devices: vec![
            DeviceConfig::new("trough", &TROUGH, "c_trough", &["plunger"])
                .tagged(TAG_TROUGH)
                .tagged(TAG_HOME),
            DeviceConfig::new("plunger", &["s_plunger"], "c_plunger", &["playfield"])
                .tagged(TAG_BALL_ADD_LIVE),
            DeviceConfig::new("lock", &LOCK, "c_lock", &["playfield"]),
        ],
        diverters: Vec::new(),
        controller: ControllerConfig::default(),
    }
}

/// Standard machine plus a drain that feeds the trough
pub fn drain_config() -> MachineConfig {
    let mut config = standard_config();
    config.switches.push(SwitchConfig::new("s_drain"));
    config.drivers.push(DriverConfig::new("c_drain"));
    config.ball_devices.push(
        DeviceConfig::new("drain", &["s_drain"], "c_drain", &["trough"]).tagged(TAG_DRAIN),
    );
    config
}

/// `a` (one ball switch) ejects into `b` (entrance switch, capacity 1), `b` ejects to the playfield
pub fn pair_config() -> MachineConfig {
    MachineConfig {
        switches: switches(&["s_a", "s_b_entrance", "s_pf"]),
        drivers: drivers(&["c_a", "c_b"]),
        playfields: vec![quiet_playfield()],
        ball_devices: vec![
            DeviceConfig::new("a", &["s_a"], "c_a", &["b"]),
            DeviceConfig::with_entrance("b", "s_b_entrance", 1, "c_b", &["playfield"]),
        ],
        diverters: Vec::new(),
        controller: ControllerConfig::default(),
    }
}

/// Start `config` with the given switches active
pub fn started(config: MachineConfig, active: &[&str]) -> Simulator {
    let mut sim = Simulator::new(config).unwrap();
    for sw in active {
        sim.set_initial(sw, true);
    }
    sim.start();
    sim
}

/// Standard machine with `trough` balls in the trough and `lock` in the lock
pub fn standard(trough: usize, lock: usize) -> Simulator {
    let active: Vec<&str> = TROUGH[..trough]
        .iter()
        .chain(&LOCK[..lock])
        .copied()
        .collect();
    started(standard_config(), &active)
}

/// Ball rolls off a switch and the count settles
pub fn leave(sim: &mut Simulator, switch: &str) {
    sim.set_switch(switch, false);
    sim.advance(SETTLE_MS);
}

/// Ball settles on a switch
pub fn arrive(sim: &mut Simulator, switch: &str) {
    sim.set_switch(switch, true);
    sim.advance(SETTLE_MS);
}

/// Last occupied slot of a switch-counted device
pub fn top_ball(sim: &Simulator, slots: &[&'static str]) -> Option<&'static str> {
    slots.iter().rev().copied().find(|s| sim.switch_state(s))
}

/// First empty slot of a switch-counted device
pub fn free_slot(sim: &Simulator, slots: &[&'static str]) -> Option<&'static str> {
    slots.iter().copied().find(|s| !sim.switch_state(s))
}

/// Put one ball from the trough into play through the plunger
pub fn launch_ball(sim: &mut Simulator) {
    sim.machine_mut()
        .add_ball("playfield", 1, None, false)
        .unwrap();
    let slot = top_ball(sim, &TROUGH).expect("trough is empty");
    leave(sim, slot);
    arrive(sim, "s_plunger");
    leave(sim, "s_plunger");
    sim.hit("s_pf");
}
