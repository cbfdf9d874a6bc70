//! Eject cycle
//!
//! One eject at a time per device. A queued request starts once the device
//! has a ball, the target has room and every diverter on the way agrees.
//! Each attempt fires the coil and arms a confirmation timeout:
//!
//! ```text
//! ejecting ──ball seen leaving──▶ ball_left ──target confirms──▶ (done)
//!    │                              │
//!    │ timeout, ball still here     │ timeout
//!    ▼                              ▼
//! retry or eject_broken        failed_confirm ──retry──▶ ejecting
//!                                   │ out of retries
//!                                   ▼
//!                          missing_ball_check ──missing deadline──▶ ball missing
//! ```
//!
//! A confirmation from the target is accepted in any phase. The missing
//! deadline runs from the moment the ball left and fires in any phase.

use crate::config::ConfirmationMode;
use crate::counter::BallCounter;
use crate::device::Ejector;
use crate::machine::{BallMachine, MachineTimer, Node};
use crate::router::NodeId;
use pf_core::{Anomaly, BallEvent, Millis, PfError, PfResult, TimerHandle};
use serde::{Deserialize, Serialize};

/// Request to send one ball from a device to `target`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EjectRequest {
    /// Global arrival order, used for first-come-first-served arbitration
    pub seq: u64,
    pub target: NodeId,
    /// Hops still to go after `target`
    pub route: Vec<NodeId>,
    /// Where a routed request ultimately wants the ball
    pub destination: Option<NodeId>,
    pub player_controlled: bool,
    /// The ball already left on its own (mechanical eject)
    pub already_left: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptPhase {
    Ejecting,
    BallLeft,
    FailedConfirm,
    MissingBallCheck,
}

/// The eject currently in progress on a device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EjectAttempt {
    pub id: u64,
    pub request: EjectRequest,
    pub phase: AttemptPhase,
    /// Waits for the player instead of firing a coil
    pub mechanical: bool,
    /// Coil pulses so far
    pub attempts: u32,
    /// Confirmation timeouts so far
    pub failures: u32,
    pub pulse_issued_at: Millis,
    pub timeout_at: Option<Millis>,
    pub left_at: Option<Millis>,
    /// Promise registered at the target
    pub promise: Option<u64>,
    pub(crate) timeout_timer: Option<TimerHandle>,
    pub(crate) missing_timer: Option<TimerHandle>,
    pub(crate) diverters: Vec<usize>,
}

impl EjectAttempt {
    /// `None` when retries are unbounded
    pub fn retries_remaining(&self, max_attempts: Option<u32>) -> Option<u32> {
        max_attempts.map(|max| max.saturating_sub(self.attempts))
    }

    pub fn can_retry(&self, max_attempts: Option<u32>) -> bool {
        self.retries_remaining(max_attempts).is_none_or(|n| n > 0)
    }

    pub fn has_left(&self) -> bool {
        self.left_at.is_some()
    }

    /// Confirmation overdue at least once
    pub fn is_stuck(&self) -> bool {
        self.failures > 0 && self.has_left()
    }
}

impl BallMachine {
    pub(crate) fn enqueue_eject(&mut self, device: NodeId, request: EjectRequest) {
        let target = self.name_of(request.target);
        if let Some(dev) = self.device_mut(device) {
            log::debug!(
                "[{}] Queued eject to {} (seq {})",
                dev.name(),
                target,
                request.seq
            );
            dev.eject_queue.push_back(request);
        }
    }

    /// Whether `target` can take one more ball now
    pub(crate) fn can_receive(&self, target: NodeId) -> bool {
        match self.nodes.get(target.0) {
            Some(Node::Playfield(_)) => true,
            Some(Node::Device(d)) => d.counter.is_ready_to_receive() && d.free_space() > 0,
            None => false,
        }
    }

    /// Start every queued eject that may go, oldest request first.
    /// Returns true if any started.
    pub(crate) fn service_ejects(&mut self) -> bool {
        let mut started_any = false;
        loop {
            let mut candidates: Vec<(u64, NodeId)> = self
                .nodes
                .iter()
                .filter_map(|node| match node {
                    Node::Device(d) if d.attempt.is_none() && !d.broken => {
                        d.eject_queue.front().map(|r| (r.seq, d.id))
                    }
                    _ => None,
                })
                .collect();
            candidates.sort();

            let mut progressed = false;
            for (_, id) in candidates {
                if self.try_start_eject(id) {
                    progressed = true;
                    started_any = true;
                }
            }
            if !progressed {
                return started_any;
            }
        }
    }

    fn try_start_eject(&mut self, id: NodeId) -> bool {
        let Some(dev) = self.device(id) else {
            return false;
        };
        if dev.attempt.is_some() || dev.broken {
            return false;
        }
        let Some(request) = dev.eject_queue.front() else {
            return false;
        };
        if !request.already_left && dev.balls_present() == 0 {
            return false;
        }
        let target = request.target;
        if !self.can_receive(target) {
            log::trace!(
                "[{}] Eject to {} deferred, target has no room",
                dev.name(),
                self.name_of(target)
            );
            return false;
        }
        if !self.diverters_allow(id, target) {
            log::debug!(
                "[{}] Eject to {} deferred, diverter busy",
                dev.name(),
                self.name_of(target)
            );
            return false;
        }
        let Some(request) = self.device_mut(id).and_then(|d| d.eject_queue.pop_front()) else {
            return false;
        };
        self.begin_attempt(id, request);
        true
    }

    /// Create the attempt record, reserve the target and fire
    pub(crate) fn begin_attempt(&mut self, id: NodeId, request: EjectRequest) {
        let now = self.now;
        let attempt_id = self.next_id();
        let target = request.target;
        let target_name = self.name_of(target);
        let Some(dev) = self.device(id) else {
            return;
        };
        let mechanical = matches!(dev.ejector, Ejector::Mechanical)
            || (request.player_controlled && request.route.is_empty() && dev.config.mechanical_eject);
        let eject_timeout = dev.eject_timeout(&target_name);
        let missing_timeout = dev.missing_timeout(&target_name);
        let already_left = request.already_left;

        let diverters = self.claim_diverters(id, target);
        let expires = (!mechanical || already_left).then(|| now + missing_timeout + eject_timeout);
        let promise = self.add_promise(target, id, attempt_id, expires);

        let mut attempt = EjectAttempt {
            id: attempt_id,
            request,
            phase: AttemptPhase::Ejecting,
            mechanical,
            attempts: 0,
            failures: 0,
            pulse_issued_at: now,
            timeout_at: None,
            left_at: None,
            promise: Some(promise),
            timeout_timer: None,
            missing_timer: None,
            diverters,
        };

        if already_left {
            attempt.attempts = 1;
            attempt.left_at = Some(now);
            attempt.phase = AttemptPhase::BallLeft;
            attempt.timeout_at = Some(now + eject_timeout);
            attempt.timeout_timer = Some(self.timers.schedule_once(
                now,
                eject_timeout,
                MachineTimer::EjectTimeout {
                    device: id,
                    attempt: attempt_id,
                },
            ));
            attempt.missing_timer = Some(self.timers.schedule_once(
                now,
                missing_timeout,
                MachineTimer::BallMissing {
                    device: id,
                    attempt: attempt_id,
                },
            ));
            let name = self.name_of(id);
            log::info!("[{}] Ball left on its own towards {}", name, target_name);
            self.post(BallEvent::EjectAttempt {
                device: name,
                target: target_name,
                attempt: 1,
                mechanical: true,
            });
            if let Some(dev) = self.device_mut(id) {
                dev.attempt = Some(attempt);
            }
            return;
        }

        if let Some(dev) = self.device_mut(id) {
            dev.attempt = Some(attempt);
        }
        self.fire_eject(id);
    }

    /// Fire the coil (or arm the wait for the player) for the current attempt
    pub(crate) fn fire_eject(&mut self, id: NodeId) {
        let now = self.now;
        let Some(dev) = self.device_mut(id) else {
            return;
        };
        let name = dev.config.name.clone();
        let ejector = dev.ejector.clone();
        let observes_exit = dev.counter.observes_exit();
        let Some(attempt) = dev.attempt.as_mut() else {
            return;
        };
        attempt.attempts += 1;
        attempt.pulse_issued_at = now;
        attempt.phase = AttemptPhase::Ejecting;
        let attempt_id = attempt.id;
        let attempt_no = attempt.attempts;
        let mechanical = attempt.mechanical;
        let target = attempt.request.target;
        let target_name = self.name_of(target);

        log::info!(
            "[{}] Ejecting ball to {} (attempt {}{})",
            name,
            target_name,
            attempt_no,
            if mechanical { ", mechanical" } else { "" }
        );
        self.post(BallEvent::EjectAttempt {
            device: name.clone(),
            target: target_name.clone(),
            attempt: attempt_no,
            mechanical,
        });

        if mechanical {
            return;
        }

        match &ejector {
            Ejector::Pulse { coil, pulse } => self.drivers.pulse(coil, *pulse),
            Ejector::Hold {
                coil, release_ms, ..
            } => {
                self.drivers.disable(coil);
                let handle = self.timers.schedule_once(
                    now,
                    *release_ms,
                    MachineTimer::HoldReenable { device: id },
                );
                let old = self.device_mut(id).and_then(|dev| {
                    dev.hold_engaged = false;
                    dev.hold_timer.replace(handle)
                });
                if let Some(old) = old {
                    self.timers.cancel(old);
                }
            }
            Ejector::Mechanical => {}
        }

        let eject_timeout = self
            .device(id)
            .map(|d| d.eject_timeout(&target_name))
            .unwrap_or_default();
        let handle = self.timers.schedule_once(
            now,
            eject_timeout,
            MachineTimer::EjectTimeout {
                device: id,
                attempt: attempt_id,
            },
        );
        let mut left_now = false;
        let mut replaced = None;
        if let Some(attempt) = self.device_mut(id).and_then(|d| d.attempt.as_mut()) {
            replaced = attempt.timeout_timer.replace(handle);
            attempt.timeout_at = Some(now + eject_timeout);
            left_now = !observes_exit && !attempt.has_left();
        }
        if let Some(old) = replaced {
            self.timers.cancel(old);
        }

        // Entrance counters cannot see the ball go: assume it left now
        if left_now {
            if let Some(dev) = self.device_mut(id) {
                if let BallCounter::Entrance(counter) = &mut dev.counter {
                    counter.ball_left();
                }
                dev.physical = dev.counter.count();
            }
            self.mark_left(id);
        }
    }

    /// The ball was seen leaving (or is assumed to have left)
    pub(crate) fn mark_left(&mut self, id: NodeId) {
        let now = self.now;
        let Some(dev) = self.device(id) else {
            return;
        };
        let Some(attempt) = dev.attempt.as_ref() else {
            return;
        };
        let target = attempt.request.target;
        let target_name = self.name_of(target);
        let eject_timeout = dev.eject_timeout(&target_name);
        let missing_timeout = dev.missing_timeout(&target_name);
        let source_left_confirms = matches!(
            dev.config.confirmation,
            ConfirmationMode::SourceLeft
        ) && self.is_playfield(target);
        let attempt_id = attempt.id;
        let promise = attempt.promise;
        let needs_timeout = attempt.timeout_timer.is_none();
        log::debug!("[{}] Ball left towards {}", dev.name(), target_name);

        let missing = self.timers.schedule_once(
            now,
            missing_timeout,
            MachineTimer::BallMissing {
                device: id,
                attempt: attempt_id,
            },
        );
        let timeout = needs_timeout.then(|| {
            self.timers.schedule_once(
                now,
                eject_timeout,
                MachineTimer::EjectTimeout {
                    device: id,
                    attempt: attempt_id,
                },
            )
        });
        let mut replaced = None;
        if let Some(attempt) = self.device_mut(id).and_then(|d| d.attempt.as_mut()) {
            attempt.left_at = Some(now);
            attempt.phase = AttemptPhase::BallLeft;
            replaced = attempt.missing_timer.replace(missing);
            if let Some(handle) = timeout {
                attempt.timeout_timer = Some(handle);
                attempt.timeout_at = Some(now + eject_timeout);
            }
        }
        if let Some(old) = replaced {
            self.timers.cancel(old);
        }
        if let Some(promise) = promise {
            self.extend_promise(target, promise, now + missing_timeout + eject_timeout);
        }
        if source_left_confirms {
            self.complete_transfer(id);
        }
    }

    /// Confirmation timeout of the current attempt
    pub(crate) fn handle_eject_timeout(&mut self, id: NodeId, attempt_id: u64) {
        let Some(dev) = self.device_mut(id) else {
            return;
        };
        let confirmation_is_target =
            matches!(dev.config.confirmation, ConfirmationMode::Target);
        let Some(attempt) = dev.attempt.as_mut().filter(|a| a.id == attempt_id) else {
            return;
        };
        attempt.timeout_timer = None;
        attempt.timeout_at = None;
        let target = attempt.request.target;
        let has_left = attempt.has_left();

        if !has_left {
            self.eject_failed(id, true);
        } else if self.is_playfield(target) && confirmation_is_target {
            // Left and did not come back: it is on the playfield
            log::debug!(
                "[{}] No return within timeout, confirming eject to {}",
                self.name_of(id),
                self.name_of(target)
            );
            self.complete_transfer(id);
        } else {
            self.eject_failed(id, false);
        }
    }

    /// The attempt did not get confirmed. Retry, give up on the device, or
    /// wait for the missing deadline.
    pub(crate) fn eject_failed(&mut self, id: NodeId, ball_present: bool) {
        let Some(dev) = self.device_mut(id) else {
            return;
        };
        let max = dev.config.max_eject_attempts;
        let name = dev.config.name.clone();
        let Some(attempt) = dev.attempt.as_mut() else {
            return;
        };
        attempt.failures += 1;
        let retry = attempt.can_retry(max);
        let attempt_no = attempt.attempts;
        let target = attempt.request.target;
        if !ball_present {
            attempt.phase = AttemptPhase::FailedConfirm;
        }
        let target_name = self.name_of(target);

        log::warn!(
            "[{}] Eject to {} not confirmed (attempt {}, {})",
            name,
            target_name,
            attempt_no,
            if retry { "retrying" } else { "no retries left" }
        );
        self.post(BallEvent::EjectFailed {
            device: name.clone(),
            target: target_name,
            attempt: attempt_no,
            retry,
        });

        if retry {
            self.fire_eject(id);
        } else if ball_present {
            self.eject_broken(id);
        } else {
            log::warn!("[{}] Waiting for the ball before declaring it missing", name);
            if let Some(attempt) = self.device_mut(id).and_then(|d| d.attempt.as_mut()) {
                attempt.phase = AttemptPhase::MissingBallCheck;
            }
        }
    }

    /// The ball came back into the device it was ejected from
    pub(crate) fn ball_returned(&mut self, id: NodeId) {
        let Some(dev) = self.device_mut(id) else {
            return;
        };
        let Some(attempt) = dev.attempt.as_mut() else {
            return;
        };
        attempt.left_at = None;
        let missing = attempt.missing_timer.take();
        let timeout = attempt.timeout_timer.take();
        attempt.timeout_at = None;
        let mechanical = attempt.mechanical;
        if let Some(handle) = missing {
            self.timers.cancel(handle);
        }
        if let Some(handle) = timeout {
            self.timers.cancel(handle);
        }
        log::info!("[{}] Ball returned", self.name_of(id));

        if mechanical {
            // Weak plunge: wait for the player again
            if let Some(attempt) = self.device_mut(id).and_then(|d| d.attempt.as_mut()) {
                attempt.phase = AttemptPhase::Ejecting;
            }
            return;
        }
        self.eject_failed(id, true);
    }

    /// Out of attempts with the ball still here: stop using this device
    pub(crate) fn eject_broken(&mut self, id: NodeId) {
        let Some(attempt) = self.take_attempt(id) else {
            return;
        };
        let name = self.name_of(id);
        log::error!(
            "[{}] Eject broken: ball would not leave after {} attempts",
            name,
            attempt.attempts
        );
        self.drop_promise(attempt.request.target, attempt.promise);
        self.release_diverters(&attempt.diverters);

        let mut rerouted = vec![attempt.request];
        if let Some(dev) = self.device_mut(id) {
            dev.broken = true;
            let (routed, local): (Vec<_>, Vec<_>) = dev
                .eject_queue
                .drain(..)
                .partition(|r| r.destination.is_some());
            dev.eject_queue.extend(local);
            rerouted.extend(routed);
        }
        self.post(BallEvent::EjectBroken { device: name });
        for request in rerouted {
            self.reroute(&request);
        }
    }

    /// Target confirmed: move the ball from the source to the target
    pub(crate) fn complete_transfer(&mut self, source: NodeId) {
        let Some(attempt) = self.take_attempt(source) else {
            return;
        };
        let target = attempt.request.target;
        self.drop_promise(target, attempt.promise);
        self.release_diverters(&attempt.diverters);

        let source_name = self.name_of(source);
        let target_name = self.name_of(target);
        let mut balls = 0;
        if let Some(dev) = self.device_mut(source) {
            if !attempt.has_left() && dev.counter.observes_exit() {
                dev.expected_exits += 1;
            }
            if dev.balls == 0 {
                log::warn!("[{}] Eject confirmed with no ball counted", source_name);
            }
            dev.balls = dev.balls.saturating_sub(1);
            balls = dev.balls;
        }
        log::info!("[{}] Eject to {} confirmed", source_name, target_name);
        self.post(BallEvent::EjectSuccess {
            device: source_name.clone(),
            target: target_name,
        });
        self.post(BallEvent::BallCountChanged {
            device: source_name,
            balls,
        });
        self.receive_ball(target, &attempt.request);
    }

    /// The in-flight ball is gone
    pub(crate) fn declare_missing(&mut self, id: NodeId, attempt_id: u64) {
        if self
            .device(id)
            .and_then(|d| d.attempt.as_ref())
            .is_none_or(|a| a.id != attempt_id)
        {
            return;
        }
        let Some(attempt) = self.take_attempt(id) else {
            return;
        };
        let name = self.name_of(id);
        log::warn!(
            "[{}] Ball missing after eject to {}",
            name,
            self.name_of(attempt.request.target)
        );
        self.drop_promise(attempt.request.target, attempt.promise);
        self.release_diverters(&attempt.diverters);
        self.lose_ball(id);
        self.reroute(&attempt.request);
    }

    /// Remove one ball from a device and from the known total
    pub(crate) fn lose_ball(&mut self, id: NodeId) {
        let name = self.name_of(id);
        let mut balls = 0;
        let mut underflow = false;
        if let Some(dev) = self.device_mut(id) {
            underflow = dev.balls == 0;
            dev.balls = dev.balls.saturating_sub(1);
            balls = dev.balls;
        }
        if underflow {
            self.anomaly(Anomaly::NegativeCount {
                device: name.clone(),
            });
        }
        self.controller_ball_missing();
        self.post(BallEvent::BallMissing {
            device: name.clone(),
            balls: 1,
        });
        self.post(BallEvent::BallCountChanged {
            device: name,
            balls,
        });
        self.shed_unbacked_requests(id);
    }

    /// Hand routed requests a device can no longer serve back to the router
    pub(crate) fn shed_unbacked_requests(&mut self, id: NodeId) {
        let mut shed = Vec::new();
        if let Some(dev) = self.device_mut(id) {
            let backed = dev.balls.saturating_sub(u32::from(dev.attempt.is_some())) as usize;
            while dev.eject_queue.len() > backed {
                match dev.eject_queue.iter().rposition(|r| r.destination.is_some()) {
                    Some(index) => {
                        if let Some(request) = dev.eject_queue.remove(index) {
                            shed.push(request);
                        }
                    }
                    None => break,
                }
            }
        }
        for request in shed.into_iter().rev() {
            self.reroute(&request);
        }
    }

    /// Take the attempt off a device, cancelling its timers
    pub(crate) fn take_attempt(&mut self, id: NodeId) -> Option<EjectAttempt> {
        let attempt = self.device_mut(id)?.attempt.take()?;
        for handle in [attempt.timeout_timer, attempt.missing_timer]
            .into_iter()
            .flatten()
        {
            self.timers.cancel(handle);
        }
        Some(attempt)
    }

    /// Queue ejects of up to `balls` available balls
    pub fn eject(&mut self, device: &str, balls: u32, target: Option<&str>) -> PfResult<u32> {
        let id = self.device_id(device)?;
        let target = match target {
            Some(name) => self.node_id(name)?,
            None => self
                .device(id)
                .and_then(|d| d.targets.first().copied())
                .ok_or_else(|| PfError::Topology(format!("{device} has no eject target")))?,
        };
        let available = self.device(id).map(|d| d.available_balls()).unwrap_or(0);
        let count = balls.min(available);
        let mut queued = 0;
        for _ in 0..count {
            if self.eject_towards(id, target, false) {
                queued += 1;
            }
        }
        self.settle();
        Ok(queued)
    }

    /// Queue ejects of every available ball
    pub fn eject_all(&mut self, device: &str, target: Option<&str>) -> PfResult<u32> {
        self.eject(device, u32::MAX, target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attempt(attempts: u32) -> EjectAttempt {
        EjectAttempt {
            id: 1,
            request: EjectRequest {
                seq: 1,
                target: NodeId(0),
                route: Vec::new(),
                destination: None,
                player_controlled: false,
                already_left: false,
            },
            phase: AttemptPhase::Ejecting,
            mechanical: false,
            attempts,
            failures: 0,
            pulse_issued_at: 0,
            timeout_at: None,
            left_at: None,
            promise: None,
            timeout_timer: None,
            missing_timer: None,
            diverters: Vec::new(),
        }
    }

    #[test]
    fn test_retry_budget() {
        assert_eq!(attempt(1).retries_remaining(Some(3)), Some(2));
        assert!(attempt(2).can_retry(Some(3)));
        assert!(!attempt(3).can_retry(Some(3)));
        assert_eq!(attempt(50).retries_remaining(None), None);
        assert!(attempt(50).can_retry(None));
    }

    #[test]
    fn test_stuck_needs_failure_after_leaving() {
        let mut a = attempt(1);
        a.failures = 1;
        assert!(!a.is_stuck());
        a.left_at = Some(100);
        assert!(a.is_stuck());
    }
}
