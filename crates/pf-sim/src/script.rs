//! Scripted switch and game-logic input
//!
//! A script is a list of timed steps. The runner advances the simulated
//! clock to each step's time (firing every timer on the way), applies the
//! step and records what the machine posted.

use anyhow::{Context, Result, bail};
use pf_ball::{Conservation, DeviceStatus, Simulator};
use pf_core::{BallEvent, Millis};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Script {
    /// Switches active before the machine starts
    #[serde(default)]
    pub initial: Vec<String>,
    #[serde(default)]
    pub steps: Vec<Step>,
    /// Keep running until this time after the last step
    #[serde(default)]
    pub end_ms: Option<Millis>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub at_ms: Millis,
    #[serde(flatten)]
    pub action: Action,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    Switch {
        switch: String,
        active: bool,
    },
    /// Momentary playfield switch
    Hit {
        switch: String,
    },
    AddBall {
        #[serde(default = "default_playfield")]
        playfield: String,
        #[serde(default = "default_one")]
        balls: u32,
        #[serde(default)]
        source: Option<String>,
        #[serde(default)]
        player_controlled: bool,
    },
    RequestBall {
        destination: String,
    },
    Eject {
        device: String,
        #[serde(default = "default_one")]
        balls: u32,
        #[serde(default)]
        target: Option<String>,
    },
    EjectAll {
        device: String,
        #[serde(default)]
        target: Option<String>,
    },
    ResetDevice {
        device: String,
    },
    CollectBalls {
        #[serde(default)]
        tags: Vec<String>,
    },
    ActivateDiverter {
        diverter: String,
    },
    DeactivateDiverter {
        diverter: String,
    },
    EnableDiverter {
        diverter: String,
    },
    DisableDiverter {
        diverter: String,
    },
    BlockBallSearch {
        playfield: String,
    },
    UnblockBallSearch {
        playfield: String,
    },
    /// Print every device's status
    Status,
}

fn default_playfield() -> String {
    "playfield".into()
}
fn default_one() -> u32 {
    1
}

impl Script {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let script: Script = serde_yml::from_str(yaml).context("Failed to parse script")?;
        script.validate()?;
        Ok(script)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_yaml_str(&text)
    }

    fn validate(&self) -> Result<()> {
        for pair in self.steps.windows(2) {
            if pair[1].at_ms < pair[0].at_ms {
                bail!(
                    "Steps out of order: {} ms comes after {} ms",
                    pair[1].at_ms,
                    pair[0].at_ms
                );
            }
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RUNNER
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize)]
pub struct TimedEvent {
    pub at_ms: Millis,
    pub event: BallEvent,
}

/// Everything a run produced
#[derive(Debug, Clone, Default, Serialize)]
pub struct Report {
    pub events: Vec<TimedEvent>,
    pub snapshots: Vec<Snapshot>,
    pub counts: Vec<(String, u32)>,
    pub conservation: Option<Conservation>,
    /// Steps naming things the machine does not have
    pub errors: Vec<String>,
    /// Valid steps the machine declined
    pub refusals: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub at_ms: Millis,
    pub devices: Vec<DeviceStatus>,
}

pub struct Runner {
    sim: Simulator,
    seen_events: usize,
    report: Report,
}

impl Runner {
    pub fn new(sim: Simulator) -> Self {
        Self {
            sim,
            seen_events: 0,
            report: Report::default(),
        }
    }

    pub fn run(mut self, script: &Script) -> Report {
        for switch in &script.initial {
            self.sim.set_initial(switch, true);
        }
        self.sim.start();
        self.collect_events();

        for step in &script.steps {
            let wait = step.at_ms.saturating_sub(self.sim.now());
            self.sim.advance(wait);
            self.collect_events();
            if let Err(e) = self.apply(&step.action) {
                log::warn!("[pf-sim] {} ms: {:?} failed: {e}", step.at_ms, step.action);
                let line = format!("{} ms: {e}", step.at_ms);
                if e.is_config() {
                    self.report.errors.push(line);
                } else {
                    self.report.refusals.push(line);
                }
            }
            self.collect_events();
        }

        if let Some(end) = script.end_ms {
            let wait = end.saturating_sub(self.sim.now());
            self.sim.advance(wait);
            self.collect_events();
        }

        let machine = self.sim.machine();
        self.report.counts = machine.dump_ball_counts();
        self.report.conservation = Some(machine.conservation());
        self.report
    }

    fn apply(&mut self, action: &Action) -> pf_core::PfResult<()> {
        match action {
            Action::Switch { switch, active } => {
                self.sim.set_switch(switch, *active);
                return Ok(());
            }
            Action::Hit { switch } => {
                self.sim.hit(switch);
                return Ok(());
            }
            Action::Status => return self.snapshot(),
            _ => {}
        }

        let machine = self.sim.machine_mut();
        match action {
            Action::AddBall {
                playfield,
                balls,
                source,
                player_controlled,
            } => machine.add_ball(playfield, *balls, source.as_deref(), *player_controlled)?,
            Action::RequestBall { destination } => machine.request_ball(destination)?,
            Action::Eject {
                device,
                balls,
                target,
            } => {
                machine.eject(device, *balls, target.as_deref())?;
            }
            Action::EjectAll { device, target } => {
                machine.eject_all(device, target.as_deref())?;
            }
            Action::ResetDevice { device } => machine.reset_device(device)?,
            Action::CollectBalls { tags } => {
                let tags: Vec<&str> = tags.iter().map(String::as_str).collect();
                machine.collect_balls(&tags);
            }
            Action::ActivateDiverter { diverter } => machine.activate_diverter(diverter)?,
            Action::DeactivateDiverter { diverter } => machine.deactivate_diverter(diverter)?,
            Action::EnableDiverter { diverter } => machine.enable_diverter(diverter)?,
            Action::DisableDiverter { diverter } => machine.disable_diverter(diverter)?,
            Action::BlockBallSearch { playfield } => machine.block_ball_search(playfield)?,
            Action::UnblockBallSearch { playfield } => machine.unblock_ball_search(playfield)?,
            Action::Switch { .. } | Action::Hit { .. } | Action::Status => {}
        }
        Ok(())
    }

    fn snapshot(&mut self) -> pf_core::PfResult<()> {
        let machine = self.sim.machine();
        let devices = machine
            .config()
            .ball_devices
            .iter()
            .map(|d| machine.device_status(&d.name))
            .collect::<pf_core::PfResult<Vec<_>>>()?;
        self.report.snapshots.push(Snapshot {
            at_ms: self.sim.now(),
            devices,
        });
        Ok(())
    }

    fn collect_events(&mut self) {
        let events = self.sim.events().events();
        let now = self.sim.now();
        for event in events.into_iter().skip(self.seen_events) {
            self.report.events.push(TimedEvent { at_ms: now, event });
        }
        self.seen_events = self.report.events.len();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pf_ball::MachineConfig;

    fn demo() -> Simulator {
        let config =
            MachineConfig::from_yaml_str(include_str!("../../../demos/machine.yaml")).unwrap();
        Simulator::new(config).unwrap()
    }

    #[test]
    fn test_parse_steps() {
        let script = Script::from_yaml_str(
            r#"
initial: [s_trough_1]
steps:
  - at_ms: 0
    action: add_ball
  - at_ms: 100
    action: switch
    switch: s_trough_1
    active: false
  - at_ms: 200
    action: status
"#,
        )
        .unwrap();
        assert_eq!(script.initial, vec!["s_trough_1".to_string()]);
        assert_eq!(script.steps.len(), 3);
        assert_eq!(
            script.steps[0].action,
            Action::AddBall {
                playfield: "playfield".into(),
                balls: 1,
                source: None,
                player_controlled: false,
            }
        );
        assert_eq!(script.steps[2].action, Action::Status);
    }

    #[test]
    fn test_steps_must_be_ordered() {
        let result = Script::from_yaml_str(
            r#"
steps:
  - at_ms: 500
    action: status
  - at_ms: 100
    action: status
"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_failed_action_is_reported() {
        let script = Script::from_yaml_str(
            r#"
steps:
  - at_ms: 0
    action: eject
    device: nowhere
"#,
        )
        .unwrap();
        let report = Runner::new(demo()).run(&script);
        assert_eq!(report.errors.len(), 1);
        assert!(report.refusals.is_empty());
    }

    #[test]
    fn test_refused_action_is_not_an_error() {
        let script = Script::from_yaml_str(
            r#"
initial: [s_trough_1]
steps:
  - at_ms: 0
    action: reset_device
    device: trough
"#,
        )
        .unwrap();
        let report = Runner::new(demo()).run(&script);
        assert!(report.errors.is_empty());
        assert_eq!(report.refusals.len(), 1);
        assert!(report.refusals[0].contains("trough"));
    }

    #[test]
    fn test_demo_script_runs_balanced() {
        let script = Script::from_yaml_str(include_str!("../../../demos/script.yaml")).unwrap();
        let report = Runner::new(demo()).run(&script);
        assert!(report.errors.is_empty(), "{:?}", report.errors);
        assert!(report.conservation.is_some_and(|c| c.balanced));
        assert!(!report.events.is_empty());
        assert!(!report.snapshots.is_empty());
    }
}
