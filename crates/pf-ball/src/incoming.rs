//! Incoming balls and arrival reconciliation
//!
//! When a device starts an eject it registers a promise at the target. A
//! counted arrival at the target consumes the oldest promise whose ball has
//! left its source and confirms that eject in the same step. An arrival without a promise is
//! first matched against balls in flight anywhere in the machine and only
//! then treated as a capture from the playfield.

use crate::counter::BallCounter;
use crate::device::Ejector;
use crate::eject::EjectRequest;
use crate::machine::{BallMachine, MachineTimer, Node};
use crate::router::NodeId;
use pf_core::{Anomaly, BallEvent, Millis, TimerHandle};
use serde::{Deserialize, Serialize};

/// Promise: one ball is on its way here from `source`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingBall {
    pub id: u64,
    pub source: NodeId,
    /// Eject attempt at the source
    pub attempt: u64,
    pub created_at: Millis,
    /// `None` while a player-controlled eject has not left yet
    pub expires_at: Option<Millis>,
    pub(crate) timer: Option<TimerHandle>,
}

/// Promises in creation order
#[derive(Debug, Clone, Default)]
pub struct IncomingBalls {
    balls: Vec<IncomingBall>,
}

impl IncomingBalls {
    pub fn push(&mut self, ball: IncomingBall) {
        self.balls.push(ball);
    }

    pub fn remove(&mut self, id: u64) -> Option<IncomingBall> {
        let index = self.balls.iter().position(|b| b.id == id)?;
        Some(self.balls.remove(index))
    }

    pub fn oldest(&self) -> Option<&IncomingBall> {
        self.balls.first()
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut IncomingBall> {
        self.balls.iter_mut().find(|b| b.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &IncomingBall> {
        self.balls.iter()
    }

    pub fn len(&self) -> usize {
        self.balls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.balls.is_empty()
    }
}

impl BallMachine {
    // ═══════════════════════════════════════════════════════════════════════════
    // PROMISES
    // ═══════════════════════════════════════════════════════════════════════════

    pub(crate) fn add_promise(
        &mut self,
        target: NodeId,
        source: NodeId,
        attempt: u64,
        expires_at: Option<Millis>,
    ) -> u64 {
        let now = self.now;
        let id = self.next_id();
        let timer = expires_at.map(|at| {
            self.timers.schedule_once(
                now,
                at.saturating_sub(now),
                MachineTimer::IncomingExpired {
                    node: target,
                    promise: id,
                },
            )
        });
        if let Some(incoming) = self.incoming_mut(target) {
            incoming.push(IncomingBall {
                id,
                source,
                attempt,
                created_at: now,
                expires_at,
                timer,
            });
        }
        id
    }

    /// Push a promise's expiry out to `expires_at`
    pub(crate) fn extend_promise(&mut self, target: NodeId, promise: u64, expires_at: Millis) {
        let now = self.now;
        let handle = self.timers.schedule_once(
            now,
            expires_at.saturating_sub(now),
            MachineTimer::IncomingExpired {
                node: target,
                promise,
            },
        );
        let mut replaced = None;
        let mut found = false;
        if let Some(ball) = self.incoming_mut(target).and_then(|i| i.get_mut(promise)) {
            found = true;
            ball.expires_at = Some(expires_at);
            replaced = ball.timer.replace(handle);
        }
        if let Some(old) = replaced {
            self.timers.cancel(old);
        }
        if !found {
            self.timers.cancel(handle);
        }
    }

    pub(crate) fn drop_promise(&mut self, target: NodeId, promise: Option<u64>) {
        let Some(promise) = promise else {
            return;
        };
        let removed = self.incoming_mut(target).and_then(|i| i.remove(promise));
        if let Some(handle) = removed.and_then(|b| b.timer) {
            self.timers.cancel(handle);
        }
    }

    /// The promise outlived its source's own missing deadline
    pub(crate) fn handle_promise_expired(&mut self, node: NodeId, promise: u64) {
        let Some(ball) = self.incoming_mut(node).and_then(|i| i.remove(promise)) else {
            return;
        };
        let device = self.name_of(node);
        let source = self.name_of(ball.source);
        log::warn!(
            "[{}] Expected ball from {} never arrived, dropping the promise",
            device,
            source
        );
        if let Some(attempt) = self
            .device_mut(ball.source)
            .and_then(|d| d.attempt.as_mut())
            .filter(|a| a.id == ball.attempt)
        {
            attempt.promise = None;
        }
        self.anomaly(Anomaly::UnknownIncomingExpired { device, source });
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // COUNT CHANGES
    // ═══════════════════════════════════════════════════════════════════════════

    /// A device counter settled on a new value
    pub(crate) fn on_count_changed(&mut self, id: NodeId, counted: u32) {
        let Some(dev) = self.device_mut(id) else {
            return;
        };
        let previous = dev.physical;
        dev.physical = counted;
        if counted != previous {
            log::debug!("[{}] Counted {} -> {}", dev.name(), previous, counted);
        }
        if counted > previous {
            for _ in previous..counted {
                self.ball_appeared(id);
            }
        } else {
            for _ in counted..previous {
                self.ball_disappeared(id);
            }
        }
    }

    fn ball_appeared(&mut self, id: NodeId) {
        let Some(dev) = self.device_mut(id) else {
            return;
        };
        if dev.unaccounted_losses > 0 {
            dev.unaccounted_losses -= 1;
            log::debug!("[{}] Lost ball reappeared", dev.name());
            if dev.unaccounted_losses == 0 {
                if let Some(handle) = dev.idle_missing_timer.take() {
                    self.timers.cancel(handle);
                }
            }
            return;
        }
        let returned = dev.incoming.is_empty() && dev.attempt.as_ref().is_some_and(|a| a.has_left());
        let promises: Vec<(u64, NodeId, u64)> = dev
            .incoming
            .iter()
            .map(|b| (b.id, b.source, b.attempt))
            .collect();
        let expected = promises
            .into_iter()
            .find(|&(_, source, attempt)| self.may_be_arriving(source, attempt));

        if returned {
            self.ball_returned(id);
        } else if let Some((promise, source, attempt)) = expected {
            self.expected_arrival(id, promise, source, attempt);
        } else {
            self.reconcile_unexpected(id);
        }
    }

    fn ball_disappeared(&mut self, id: NodeId) {
        let now = self.now;
        let Some(dev) = self.device_mut(id) else {
            return;
        };
        if dev.expected_exits > 0 {
            dev.expected_exits -= 1;
            return;
        }
        if dev.attempt.as_ref().is_some_and(|a| !a.has_left()) {
            self.mark_left(id);
            return;
        }
        if dev.attempt.is_none() && dev.config.mechanical_eject && dev.balls > 0 {
            let queued = dev.eject_queue.pop_front();
            let default_target = dev.targets.first().copied();
            let request = match (queued, default_target) {
                (Some(mut queued), _) => {
                    queued.already_left = true;
                    queued
                }
                (None, Some(target)) => EjectRequest {
                    seq: self.next_seq(),
                    target,
                    route: Vec::new(),
                    destination: None,
                    player_controlled: true,
                    already_left: true,
                },
                (None, None) => return,
            };
            self.begin_attempt(id, request);
            return;
        }

        let Some(dev) = self.device_mut(id) else {
            return;
        };
        dev.unaccounted_losses += 1;
        log::info!("[{}] Ball left with no eject in progress", dev.name());
        if dev.idle_missing_timer.is_none() {
            let delay = dev.config.idle_missing_ball_timeout_ms;
            let handle =
                self.timers
                    .schedule_once(now, delay, MachineTimer::IdleMissing { device: id });
            if let Some(dev) = self.device_mut(id) {
                dev.idle_missing_timer = Some(handle);
            }
        }
    }

    /// Balls that left a device on their own and never came back
    pub(crate) fn handle_idle_missing(&mut self, id: NodeId) {
        let Some(dev) = self.device_mut(id) else {
            return;
        };
        dev.idle_missing_timer = None;
        let lost = std::mem::take(&mut dev.unaccounted_losses);
        for _ in 0..lost {
            self.lose_ball(id);
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // ARRIVALS
    // ═══════════════════════════════════════════════════════════════════════════

    /// Oldest first, a promise can account for an arrival once its ball is
    /// out of the source or its switches already read one short. Promises
    /// with no eject behind them are taken too so they get cleaned up.
    fn may_be_arriving(&self, source: NodeId, attempt: u64) -> bool {
        let Some(dev) = self.device(source) else {
            return true;
        };
        match dev.attempt.as_ref().filter(|a| a.id == attempt) {
            Some(a) => a.has_left() || dev.counter.count() < dev.physical,
            None => true,
        }
    }

    fn expected_arrival(&mut self, id: NodeId, promise: u64, source: NodeId, attempt: u64) {
        let matches_source = self
            .device(source)
            .and_then(|d| d.attempt.as_ref())
            .is_some_and(|a| a.id == attempt);
        if matches_source {
            self.complete_transfer(source);
        } else {
            log::warn!(
                "[{}] Promise from {} has no eject behind it",
                self.name_of(id),
                self.name_of(source)
            );
            self.drop_promise(id, Some(promise));
            self.reconcile_unexpected(id);
        }
    }

    /// Target side of a confirmed transfer
    pub(crate) fn receive_ball(&mut self, target: NodeId, request: &EjectRequest) {
        if self.is_playfield(target) {
            self.playfield_add(target, 1);
            return;
        }
        self.device_gains_ball(target, 0);
        if let Some((&next, rest)) = request.route.split_first() {
            let continuation = EjectRequest {
                seq: request.seq,
                target: next,
                route: rest.to_vec(),
                destination: request.destination,
                player_controlled: request.player_controlled,
                already_left: false,
            };
            self.enqueue_eject(target, continuation);
        } else if request.destination == Some(target) {
            log::debug!("[{}] Requested ball delivered", self.name_of(target));
        }
    }

    /// Count one more ball in a device and post the arrival
    fn device_gains_ball(&mut self, id: NodeId, unclaimed: u32) {
        let name = self.name_of(id);
        let Some(dev) = self.device_mut(id) else {
            return;
        };
        dev.balls += 1;
        let balls = dev.balls;
        let capacity = dev.capacity();
        let engage_hold = match &dev.ejector {
            Ejector::Hold {
                coil, pulse, hold, ..
            } if !dev.hold_engaged && dev.hold_timer.is_none() => {
                Some((coil.clone(), *pulse, *hold))
            }
            _ => None,
        };
        if engage_hold.is_some() {
            dev.hold_engaged = true;
        }
        if let Some((coil, pulse, hold)) = engage_hold {
            self.drivers.enable(&coil, pulse, hold);
        }
        if balls > capacity {
            self.anomaly(Anomaly::CountOverCapacity {
                device: name.clone(),
                capacity,
            });
        }
        self.post(BallEvent::BallEnter {
            device: name.clone(),
            new_balls: 1,
            unclaimed_balls: unclaimed,
        });
        self.post(BallEvent::BallCountChanged {
            device: name,
            balls,
        });
    }

    /// A ball turned up with no promise for it
    fn reconcile_unexpected(&mut self, id: NodeId) {
        if let Some(source) = self.find_stray_ball(id) {
            let Some(original) = self
                .device(source)
                .and_then(|d| d.attempt.as_ref())
                .map(|a| a.request.target)
            else {
                return;
            };
            if original == id {
                // Its promise expired but this is the ball
                self.complete_transfer(source);
                return;
            }
            if self.is_playfield(original) {
                // Reached the playfield, then came straight here
                self.complete_transfer(source);
            } else {
                self.redirect_stray(source, id);
                return;
            }
        }
        self.capture_from_playfield(id);
    }

    /// Earliest ball in flight from another device that has not been confirmed
    fn find_stray_ball(&self, id: NodeId) -> Option<NodeId> {
        self.nodes
            .iter()
            .filter_map(|node| match node {
                Node::Device(d) if d.id != id => d
                    .attempt
                    .as_ref()
                    .and_then(|a| a.left_at)
                    .map(|left_at| (left_at, d.id)),
                _ => None,
            })
            .min()
            .map(|(_, source)| source)
    }

    /// The ball from `source` landed in `id` instead of its target
    fn redirect_stray(&mut self, source: NodeId, id: NodeId) {
        let Some(attempt) = self.take_attempt(source) else {
            return;
        };
        let request = attempt.request;
        self.drop_promise(request.target, attempt.promise);
        self.release_diverters(&attempt.diverters);

        let source_name = self.name_of(source);
        let here = self.name_of(id);
        log::warn!(
            "[{}] Ball from {} meant for {} arrived here instead",
            here,
            source_name,
            self.name_of(request.target)
        );
        let mut balls = 0;
        if let Some(dev) = self.device_mut(source) {
            dev.balls = dev.balls.saturating_sub(1);
            balls = dev.balls;
        }
        self.post(BallEvent::EjectSuccess {
            device: source_name.clone(),
            target: here,
        });
        self.post(BallEvent::BallCountChanged {
            device: source_name,
            balls,
        });
        self.device_gains_ball(id, 1);

        if let Some(position) = request.route.iter().position(|n| *n == id) {
            // Skipped ahead along its own route
            let rest = &request.route[position + 1..];
            if let Some((&next, tail)) = rest.split_first() {
                self.enqueue_eject(
                    id,
                    EjectRequest {
                        seq: request.seq,
                        target: next,
                        route: tail.to_vec(),
                        destination: request.destination,
                        player_controlled: request.player_controlled,
                        already_left: false,
                    },
                );
            }
        } else if request.destination != Some(id) {
            self.reroute(&request);
        }
        self.route_unclaimed(id);
    }

    /// Nothing in flight explains the ball: it came from the playfield
    fn capture_from_playfield(&mut self, id: NodeId) {
        let Some(dev) = self.device(id) else {
            return;
        };
        let playfield = dev.captures_from;
        let is_drain = dev.is_drain();
        let name = self.name_of(id);
        let pf_name = self.name_of(playfield);
        let pf_balls = self.playfield(playfield).map(|p| p.balls).unwrap_or(0);

        log::info!("[{}] Captured ball from {}", name, pf_name);
        self.post(BallEvent::CapturedFromPlayfield {
            device: name.clone(),
            playfield: pf_name.clone(),
        });
        if pf_balls > 0 {
            self.playfield_remove(playfield, 1);
        } else {
            if self.controller.missing_balls() == 0 {
                self.anomaly(Anomaly::PlayfieldUnderflow { playfield: pf_name });
            }
            self.controller_ball_found(&name);
        }
        self.device_gains_ball(id, 1);
        if is_drain {
            self.post(BallEvent::BallDrain {
                device: name,
                balls: 1,
            });
        }
        self.ball_search_activity(playfield);
        self.route_unclaimed(id);
    }

    /// Decide what to do with a ball nobody asked for
    pub(crate) fn route_unclaimed(&mut self, id: NodeId) {
        if !self.has_available_ball(id) {
            return;
        }
        self.retry_pending();
        if !self.has_available_ball(id) {
            return;
        }
        let Some(dev) = self.device(id) else {
            return;
        };
        if dev.is_trough() {
            log::debug!("[{}] Keeping unclaimed ball", dev.name());
            return;
        }
        if dev.is_drain() {
            let trough = self.topology.nearest(id, |n| {
                matches!(self.nodes.get(n.0), Some(Node::Device(d)) if d.is_trough())
            });
            if let Some(path) = trough {
                if let Some(&last) = path.last() {
                    self.eject_towards(id, last, false);
                }
            }
            return;
        }
        let target = dev.unexpected_target;
        self.eject_towards(id, target, false);
    }

    /// Start-up count, no arrival processing
    pub(crate) fn adopt_count(&mut self, id: NodeId) {
        if let Some(dev) = self.device_mut(id) {
            let counted = dev.counter.count();
            dev.physical = counted;
            dev.balls = counted;
            if let BallCounter::Entrance(_) = dev.counter {
                log::debug!("[{}] Entrance counter starts at {}", dev.config.name, counted);
            }
        }
    }
}
