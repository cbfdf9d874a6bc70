//! pf-ball: Ball tracking for pinball machines
//!
//! Tracks where every ball is while it moves between ball devices
//! (troughs, plungers, locks, saucers) and the playfield:
//!
//! - **Ball devices**: count balls from switches, eject them with coils,
//!   confirm arrival at the target or report the ball missing
//! - **Router**: resolves "deliver a ball here" into a chain of ejects along
//!   the fewest-hop path from a device that has one
//! - **Ball controller**: owns the machine-wide count of known balls
//! - **Playfield**: heuristic count of balls in play, ball search
//! - **Diverters**: shared junctions set before a ball transits them
//!
//! All of it runs on one logical thread inside [`BallMachine`]: switch
//! changes and timer expirations are handled one at a time, and every
//! reaction (including cascades into other devices) completes before the
//! next one is looked at.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use pf_ball::{MachineConfig, Simulator};
//!
//! let config = MachineConfig::load("machine.yaml")?;
//! let mut sim = Simulator::new(config)?;
//! sim.set_initial("s_trough_1", true);
//! sim.start();
//! sim.machine_mut().request_ball("plunger")?;
//! sim.advance(1_000);
//! ```

pub mod ball_search;
pub mod config;
pub mod controller;
pub mod counter;
pub mod device;
pub mod diverter;
pub mod eject;
pub mod incoming;
pub mod machine;
pub mod playfield;
pub mod router;
pub mod sim;

pub use ball_search::{BallSearch, SearchParticipant};
pub use config::*;
pub use controller::{BallController, Conservation, StartRefusal};
pub use device::{AttemptStatus, BallDevice, DeviceState, DeviceStatus};
pub use diverter::Diverter;
pub use eject::{AttemptPhase, EjectAttempt, EjectRequest};
pub use incoming::IncomingBall;
pub use machine::{BallMachine, MachineTimer, Node, Platform};
pub use playfield::Playfield;
pub use router::{NodeId, PendingRequest, Topology};
pub use sim::Simulator;
