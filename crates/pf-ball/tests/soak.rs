//! Randomized soak test
//!
//! A seeded world moves balls the way the hardware would: a pulsed coil
//! usually (not always) kicks its top ball out, the ball lands where the
//! device was aiming, and balls on the playfield wander into the trough
//! or the lock. Whatever happens, the machine's books must balance.

mod common;

use common::*;
use pf_ball::Simulator;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::HashMap;

enum Target {
    Playfield,
    Device(&'static [&'static str]),
}

const PLUNGER: [&str; 1] = ["s_plunger"];

/// (coil, slots the coil empties, where the ball goes)
fn mechanics() -> Vec<(&'static str, &'static [&'static str], Target)> {
    let trough: &'static [&'static str] = &TROUGH;
    let plunger: &'static [&'static str] = &PLUNGER;
    let lock: &'static [&'static str] = &LOCK;
    vec![
        ("c_trough", trough, Target::Device(plunger)),
        ("c_plunger", plunger, Target::Playfield),
        ("c_lock", lock, Target::Playfield),
    ]
}

struct World {
    rng: ChaCha8Rng,
    on_playfield: u32,
    seen_pulses: HashMap<&'static str, usize>,
}

impl World {
    fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            on_playfield: 0,
            seen_pulses: HashMap::new(),
        }
    }

    /// Let every pulsed coil move at most one ball per round until nothing moves
    fn respond(&mut self, sim: &mut Simulator) {
        for _ in 0..16 {
            let mut moved = false;
            for (coil, slots, target) in mechanics() {
                let pulses = sim.drivers().pulses(coil);
                let seen = self.seen_pulses.entry(coil).or_insert(0);
                if pulses <= *seen {
                    continue;
                }
                *seen = pulses;
                if !self.rng.random_bool(0.9) {
                    continue;
                }
                let Some(slot) = top_ball(sim, slots) else {
                    continue;
                };
                let landing = match target {
                    Target::Playfield => None,
                    Target::Device(dest) => match free_slot(sim, dest) {
                        Some(free) => Some(free),
                        None => continue,
                    },
                };
                leave(sim, slot);
                match landing {
                    Some(free) => arrive(sim, free),
                    None => {
                        self.on_playfield += 1;
                        sim.hit("s_pf");
                    }
                }
                moved = true;
            }
            if !moved {
                break;
            }
        }
    }

    fn step(&mut self, sim: &mut Simulator) {
        match self.rng.random_range(0..6) {
            0 => {
                let _ = sim.machine_mut().add_ball("playfield", 1, None, false);
            }
            1 if self.on_playfield > 0 => sim.hit("s_pf"),
            2 if self.on_playfield > 0 => {
                if let Some(slot) = free_slot(sim, &TROUGH) {
                    self.on_playfield -= 1;
                    arrive(sim, slot);
                }
            }
            3 if self.on_playfield > 0 => {
                if let Some(slot) = free_slot(sim, &LOCK) {
                    self.on_playfield -= 1;
                    arrive(sim, slot);
                }
            }
            4 => {
                let ms = self.rng.random_range(100..15_000);
                sim.advance(ms);
            }
            5 => {
                let _ = sim.machine_mut().eject("lock", 1, None);
            }
            _ => sim.advance(SETTLE_MS),
        }
        self.respond(sim);
    }
}

fn physical_balls(sim: &Simulator, world: &World) -> u32 {
    let in_switches = TROUGH
        .iter()
        .chain(&LOCK)
        .chain(&PLUNGER)
        .filter(|s| sim.switch_state(s))
        .count() as u32;
    in_switches + world.on_playfield
}

fn check_books(sim: &Simulator, seed: u64, step: usize) {
    let books = sim.machine().conservation();
    assert!(books.balanced, "seed {seed} step {step}: {books:?}");
    for device in ["trough", "plunger", "lock"] {
        let status = sim.machine().device_status(device).unwrap();
        assert!(
            status.balls <= status.capacity,
            "seed {seed} step {step}: {device} holds {} of {}",
            status.balls,
            status.capacity
        );
    }
}

#[test]
fn test_random_play_keeps_books_balanced() {
    for seed in 0..8 {
        let mut sim = standard(3, 0);
        let mut world = World::new(seed);
        check_books(&sim, seed, 0);

        for step in 1..=200 {
            world.step(&mut sim);
            assert_eq!(physical_balls(&sim, &world), 3, "seed {seed} step {step}");
            check_books(&sim, seed, step);
        }
    }
}

#[test]
fn test_draining_every_ball_keeps_books_balanced() {
    let mut sim = standard(3, 0);
    let mut world = World::new(42);
    sim.machine_mut().add_ball("playfield", 3, None, false).unwrap();
    for _ in 0..10 {
        world.respond(&mut sim);
        sim.advance(SETTLE_MS);
    }
    world.respond(&mut sim);
    check_books(&sim, 42, 0);

    while world.on_playfield > 0 {
        let Some(slot) = free_slot(&sim, &TROUGH) else {
            break;
        };
        world.on_playfield -= 1;
        arrive(&mut sim, slot);
        world.respond(&mut sim);
        check_books(&sim, 42, 0);
    }
    sim.advance(30_000);
    world.respond(&mut sim);
    check_books(&sim, 42, 0);
}
