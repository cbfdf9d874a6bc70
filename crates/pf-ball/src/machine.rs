//! Ball machine
//!
//! Owns every device and playfield, the router, the ball controller and
//! the diverters, and drives them from switch changes and timers. Nodes
//! live in one arena indexed by [`NodeId`]: playfields first, then ball
//! devices in configuration order.
//!
//! Everything runs on the caller's thread. [`BallMachine::process`] handles
//! due timers and queued switch changes one at a time; after each one the
//! machine settles (deferred requests are retried, queued ejects start)
//! before the next input is looked at.

use crate::ball_search::{BallSearch, SearchParticipant};
use crate::config::{ConfirmationMode, DeviceConfig, MachineConfig, TAG_DRAIN};
use crate::controller::BallController;
use crate::counter::{BallCounter, EntranceCounter, EntranceOutcome, SwitchCounter};
use crate::device::{AttemptStatus, BallDevice, DeviceStatus, Ejector};
use crate::diverter::Diverter;
use crate::incoming::IncomingBalls;
use crate::playfield::Playfield;
use crate::router::{NodeId, Router, Topology};
use pf_core::{
    Anomaly, BallEvent, Clock, DriverSink, EventBus, Millis, PfError, PfResult, PulseSettings,
    SwitchChange, SwitchSource, TimerQueue,
};
use std::collections::{HashMap, HashSet};

/// Hardware and event plumbing the machine runs against
pub struct Platform {
    pub switches: Box<dyn SwitchSource>,
    pub drivers: Box<dyn DriverSink>,
    pub clock: Box<dyn Clock>,
    pub events: Box<dyn EventBus>,
}

#[derive(Debug, Clone)]
pub enum Node {
    Device(BallDevice),
    Playfield(Playfield),
}

impl Node {
    pub fn name(&self) -> &str {
        match self {
            Node::Device(d) => d.name(),
            Node::Playfield(p) => p.name(),
        }
    }
}

/// Everything the machine schedules
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineTimer {
    /// Ball switches stable, read the count
    Recount { device: NodeId },
    /// Entrance switch held long enough to mean "full"
    EntranceFull { device: NodeId },
    EjectTimeout { device: NodeId, attempt: u64 },
    BallMissing { device: NodeId, attempt: u64 },
    IncomingExpired { node: NodeId, promise: u64 },
    IdleMissing { device: NodeId },
    HoldReenable { device: NodeId },
    BallSearchStart { playfield: NodeId },
    BallSearchTick { playfield: NodeId },
    DiverterRelease { diverter: usize },
}

/// What a switch means to the machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SwitchRole {
    Counter(NodeId),
    EjectConfirm(NodeId),
    PlayfieldActivity(NodeId),
}

pub struct BallMachine {
    pub(crate) config: MachineConfig,
    switches: Box<dyn SwitchSource>,
    pub(crate) drivers: Box<dyn DriverSink>,
    clock: Box<dyn Clock>,
    bus: Box<dyn EventBus>,
    pub(crate) timers: TimerQueue<MachineTimer>,
    pub(crate) nodes: Vec<Node>,
    names: HashMap<String, NodeId>,
    pub(crate) topology: Topology,
    switch_roles: HashMap<String, Vec<SwitchRole>>,
    inverted: HashSet<String>,
    pub(crate) router: Router,
    pub(crate) controller: BallController,
    pub(crate) diverters: Vec<Diverter>,
    pub(crate) now: Millis,
    seq: u64,
    ids: u64,
    started: bool,
}

impl BallMachine {
    // ═══════════════════════════════════════════════════════════════════════════
    // CONSTRUCTION
    // ═══════════════════════════════════════════════════════════════════════════

    /// Validate the configuration and wire up every node
    pub fn new(config: MachineConfig, platform: Platform) -> PfResult<Self> {
        config.validate()?;
        let Platform {
            mut switches,
            drivers,
            clock,
            events,
        } = platform;

        let mut names = HashMap::new();
        for (index, name) in config
            .playfields
            .iter()
            .map(|p| &p.name)
            .chain(config.ball_devices.iter().map(|d| &d.name))
            .enumerate()
        {
            names.insert(name.clone(), NodeId(index));
        }
        let lookup = |name: &str| -> PfResult<NodeId> {
            names
                .get(name)
                .copied()
                .ok_or_else(|| PfError::UnknownDevice(name.to_string()))
        };
        let default_pulse = |driver: &str| -> PulseSettings {
            config
                .drivers
                .iter()
                .find(|d| d.name == driver)
                .map(|d| d.default_pulse)
                .unwrap_or_default()
        };
        let first_playfield = NodeId(0);

        let mut targets: Vec<Vec<NodeId>> = vec![Vec::new(); config.playfields.len()];
        let mut devices = Vec::with_capacity(config.ball_devices.len());
        for (offset, dc) in config.ball_devices.iter().enumerate() {
            let id = NodeId(config.playfields.len() + offset);
            let device_targets = dc
                .eject_targets
                .iter()
                .map(|t| lookup(t))
                .collect::<PfResult<Vec<_>>>()?;
            let captures_from = match &dc.captures_from {
                Some(pf) => lookup(pf)?,
                None => first_playfield,
            };
            let unexpected_target = match &dc.target_on_unexpected_ball {
                Some(target) => lookup(target)?,
                None => captures_from,
            };
            let ejector = build_ejector(dc, &default_pulse);
            targets.push(device_targets.clone());
            devices.push(BallDevice::new(
                id,
                dc.clone(),
                build_counter(dc),
                ejector,
                device_targets,
                captures_from,
                unexpected_target,
            ));
        }
        let topology = Topology::new(targets);

        let mut nodes = Vec::with_capacity(names.len());
        for (index, pc) in config.playfields.iter().enumerate() {
            let id = NodeId(index);
            let mut ordered: Vec<(u32, usize, NodeId)> = devices
                .iter()
                .enumerate()
                .filter(|(_, d)| d.captures_from == id && d.ejector.coil().is_some())
                .filter_map(|(i, d)| d.config.ball_search_order.map(|order| (order, i, d.id)))
                .filter(|(order, _, _)| *order > 0)
                .collect();
            ordered.sort();
            let participants = ordered
                .into_iter()
                .map(|(_, _, dev)| SearchParticipant::Device(dev))
                .chain(
                    pc.ball_search
                        .search_coils
                        .iter()
                        .map(|c| SearchParticipant::Coil(c.clone())),
                )
                .collect();
            let search = BallSearch::new(pc.ball_search.clone(), participants);
            nodes.push(Node::Playfield(Playfield::new(id, pc.clone(), search)));
        }
        nodes.extend(devices.into_iter().map(Node::Device));

        let mut switch_roles: HashMap<String, Vec<SwitchRole>> = HashMap::new();
        for node in &nodes {
            match node {
                Node::Device(d) => {
                    for sw in d.config.counting_switches() {
                        switch_roles
                            .entry(sw.clone())
                            .or_default()
                            .push(SwitchRole::Counter(d.id));
                    }
                    if let ConfirmationMode::Switch(sw) = &d.config.confirmation {
                        switch_roles
                            .entry(sw.clone())
                            .or_default()
                            .push(SwitchRole::EjectConfirm(d.id));
                    }
                }
                Node::Playfield(p) => {
                    for sw in &p.config.activity_switches {
                        switch_roles
                            .entry(sw.clone())
                            .or_default()
                            .push(SwitchRole::PlayfieldActivity(p.id));
                    }
                }
            }
        }
        for sw in switch_roles.keys() {
            switches.subscribe(sw)?;
        }
        let inverted = config
            .switches
            .iter()
            .filter(|s| s.invert)
            .map(|s| s.name.clone())
            .collect();

        let mut diverters = Vec::with_capacity(config.diverters.len());
        for dc in &config.diverters {
            let feeders = dc
                .feeder_devices
                .iter()
                .map(|f| lookup(f))
                .collect::<PfResult<Vec<_>>>()?;
            let active = dc
                .targets_when_active
                .iter()
                .map(|t| lookup(t))
                .collect::<PfResult<Vec<_>>>()?;
            let inactive = dc
                .targets_when_inactive
                .iter()
                .map(|t| lookup(t))
                .collect::<PfResult<Vec<_>>>()?;
            let activation_pulse = default_pulse(&dc.activation_coil);
            let deactivation_pulse = dc
                .deactivation_coil
                .as_deref()
                .map(&default_pulse)
                .unwrap_or_default();
            diverters.push(Diverter::new(
                dc.clone(),
                feeders,
                active,
                inactive,
                activation_pulse,
                deactivation_pulse,
            ));
        }

        let now = clock.now_ms();
        log::info!(
            "[ball_machine] {} playfield(s), {} device(s), {} diverter(s)",
            config.playfields.len(),
            config.ball_devices.len(),
            diverters.len()
        );
        Ok(Self {
            controller: BallController::new(config.controller.clone()),
            config,
            switches,
            drivers,
            clock,
            bus: events,
            timers: TimerQueue::new(),
            nodes,
            names,
            topology,
            switch_roles,
            inverted,
            router: Router::new(),
            diverters,
            now,
            seq: 0,
            ids: 0,
            started: false,
        })
    }

    /// Read the switches, count every device and set the known ball count
    pub fn start(&mut self) {
        if self.started {
            return;
        }
        self.now = self.clock.now_ms().max(self.now);
        while self.switches.poll().is_some() {}

        let ids: Vec<NodeId> = self.devices().map(|d| d.id).collect();
        for id in &ids {
            self.read_initial_switches(*id);
            self.adopt_count(*id);
        }
        let total: u32 = self.devices().map(|d| d.balls).sum();
        self.controller.initialize(total);
        self.started = true;

        for id in &ids {
            let Some(dev) = self.device(*id) else {
                continue;
            };
            let (name, balls, hold) = (
                dev.config.name.clone(),
                dev.balls,
                matches!(dev.ejector, Ejector::Hold { .. }),
            );
            if balls > 0 {
                log::info!("[{}] {} ball(s) at start", name, balls);
                if hold {
                    self.engage_hold(*id);
                }
            }
            self.post(BallEvent::BallCountChanged {
                device: name,
                balls,
            });
        }
        for id in ids {
            if self.device(id).is_some_and(|d| d.config.has_tag(TAG_DRAIN) && d.balls > 0) {
                let count = self.device(id).map(|d| d.balls).unwrap_or(0);
                for _ in 0..count {
                    self.route_unclaimed(id);
                }
            }
        }
        self.settle();
    }

    fn read_initial_switches(&mut self, id: NodeId) {
        let now = self.now;
        let Some(Node::Device(dev)) = self.nodes.get(id.0) else {
            return;
        };
        let states: Vec<(String, bool)> = dev
            .config
            .counting_switches()
            .iter()
            .map(|sw| (sw.clone(), self.logical_state(sw)))
            .collect();
        let full_timeout = dev.config.entrance_full_timeout_ms;
        let mut schedule_full = false;
        if let Some(dev) = self.device_mut(id) {
            for (sw, active) in states.into_iter().filter(|(_, active)| *active) {
                match &mut dev.counter {
                    BallCounter::Switches(c) => {
                        c.on_switch(&sw, active);
                    }
                    BallCounter::Entrance(c) => {
                        c.on_switch(&sw, active, now);
                        schedule_full = full_timeout.is_some();
                    }
                }
            }
        }
        if schedule_full {
            self.arm_entrance_full(id);
        }
    }

    fn logical_state(&self, switch: &str) -> bool {
        self.switches.is_active(switch) ^ self.inverted.contains(switch)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // INPUT
    // ═══════════════════════════════════════════════════════════════════════════

    /// Handle every due timer and queued switch change
    pub fn process(&mut self) {
        if !self.started {
            return;
        }
        self.now = self.clock.now_ms().max(self.now);
        loop {
            if let Some((_, timer)) = self.timers.pop_due(self.now) {
                self.handle_timer(timer);
                self.settle();
                continue;
            }
            if let Some(change) = self.switches.poll() {
                self.handle_switch_change(change);
                self.settle();
                continue;
            }
            break;
        }
    }

    /// When `process` next has timer work to do
    pub fn next_deadline(&self) -> Option<Millis> {
        self.timers.next_deadline()
    }

    fn handle_switch_change(&mut self, change: SwitchChange) {
        let active = change.active ^ self.inverted.contains(&change.switch);
        log::trace!(
            "[switch] {} {}",
            change.switch,
            if active { "active" } else { "inactive" }
        );
        let roles = self
            .switch_roles
            .get(&change.switch)
            .cloned()
            .unwrap_or_default();
        for role in roles {
            match role {
                SwitchRole::Counter(id) => self.counter_switch(id, &change.switch, active),
                SwitchRole::EjectConfirm(id) if active => self.confirm_switch(id),
                SwitchRole::PlayfieldActivity(pf) if active => self.playfield_activity(pf),
                _ => {}
            }
        }
    }

    fn counter_switch(&mut self, id: NodeId, switch: &str, active: bool) {
        let now = self.now;
        let Some(dev) = self.device_mut(id) else {
            return;
        };
        match &mut dev.counter {
            BallCounter::Switches(counter) => {
                let Some(delay) = counter.on_switch(switch, active) else {
                    return;
                };
                let old = dev.settle_timer.take();
                if let Some(old) = old {
                    self.timers.cancel(old);
                }
                let handle =
                    self.timers
                        .schedule_once(now, delay, MachineTimer::Recount { device: id });
                if let Some(dev) = self.device_mut(id) {
                    dev.settle_timer = Some(handle);
                }
            }
            BallCounter::Entrance(counter) => {
                let outcome = counter.on_switch(switch, active, now);
                let capacity = counter.capacity();
                let name = dev.config.name.clone();
                let full_timeout = dev.config.entrance_full_timeout_ms;
                match outcome {
                    EntranceOutcome::Counted(count) => {
                        if full_timeout.is_some() {
                            self.arm_entrance_full(id);
                        }
                        self.on_count_changed(id, count);
                    }
                    EntranceOutcome::OverCapacity => {
                        log::warn!("[{}] Entrance hit while full", name);
                        self.anomaly(Anomaly::CountOverCapacity {
                            device: name,
                            capacity,
                        });
                    }
                    EntranceOutcome::Released => {
                        let old = self.device_mut(id).and_then(|d| d.full_timer.take());
                        if let Some(old) = old {
                            self.timers.cancel(old);
                        }
                    }
                    EntranceOutcome::Ignored | EntranceOutcome::Unrelated => {}
                }
            }
        }
    }

    fn arm_entrance_full(&mut self, id: NodeId) {
        let now = self.now;
        let Some(delay) = self.device(id).and_then(|d| d.config.entrance_full_timeout_ms) else {
            return;
        };
        let handle = self
            .timers
            .schedule_once(now, delay, MachineTimer::EntranceFull { device: id });
        let old = self
            .device_mut(id)
            .and_then(|d| d.full_timer.replace(handle));
        if let Some(old) = old {
            self.timers.cancel(old);
        }
    }

    /// Dedicated confirmation switch between a device and the playfield
    fn confirm_switch(&mut self, id: NodeId) {
        let target = self
            .device(id)
            .and_then(|d| d.attempt.as_ref())
            .filter(|a| !a.mechanical || a.has_left())
            .map(|a| a.request.target);
        match target {
            Some(target) if self.is_playfield(target) => {
                log::debug!("[{}] Confirm switch hit", self.name_of(id));
                self.complete_transfer(id);
            }
            _ => log::debug!(
                "[{}] Confirm switch hit with no eject running",
                self.name_of(id)
            ),
        }
    }

    fn handle_timer(&mut self, timer: MachineTimer) {
        log::trace!("[timer] {:?}", timer);
        match timer {
            MachineTimer::Recount { device } => {
                let count = self.device_mut(device).map(|d| {
                    d.settle_timer = None;
                    d.counter.count()
                });
                if let Some(count) = count {
                    self.on_count_changed(device, count);
                }
            }
            MachineTimer::EntranceFull { device } => {
                let count = self.device_mut(device).map(|d| {
                    d.full_timer = None;
                    if let BallCounter::Entrance(counter) = &mut d.counter {
                        counter.set_full();
                    }
                    d.counter.count()
                });
                if let Some(count) = count {
                    log::info!("[{}] Entrance held, device full", self.name_of(device));
                    self.on_count_changed(device, count);
                }
            }
            MachineTimer::EjectTimeout { device, attempt } => {
                self.handle_eject_timeout(device, attempt)
            }
            MachineTimer::BallMissing { device, attempt } => self.declare_missing(device, attempt),
            MachineTimer::IncomingExpired { node, promise } => {
                self.handle_promise_expired(node, promise)
            }
            MachineTimer::IdleMissing { device } => self.handle_idle_missing(device),
            MachineTimer::HoldReenable { device } => self.hold_reenable(device),
            MachineTimer::BallSearchStart { playfield } => {
                self.handle_ball_search_start(playfield)
            }
            MachineTimer::BallSearchTick { playfield } => self.ball_search_tick(playfield),
            MachineTimer::DiverterRelease { diverter } => self.handle_diverter_release(diverter),
        }
    }

    /// Hold coil released long enough for one ball: grab the rest again
    fn hold_reenable(&mut self, id: NodeId) {
        let Some(dev) = self.device_mut(id) else {
            return;
        };
        dev.hold_timer = None;
        let remaining = dev.balls.saturating_sub(u32::from(dev.attempt.is_some()));
        if remaining > 0 {
            self.engage_hold(id);
        }
    }

    pub(crate) fn engage_hold(&mut self, id: NodeId) {
        let Some(dev) = self.device_mut(id) else {
            return;
        };
        if let Ejector::Hold {
            coil, pulse, hold, ..
        } = &dev.ejector
        {
            let (coil, pulse, hold) = (coil.clone(), *pulse, *hold);
            dev.hold_engaged = true;
            self.drivers.enable(&coil, pulse, hold);
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // SETTLING
    // ═══════════════════════════════════════════════════════════════════════════

    /// Run deferred work until nothing else can move
    pub(crate) fn settle(&mut self) {
        loop {
            let routed = self.retry_pending();
            let started = self.service_ejects();
            if !routed && !started {
                break;
            }
        }
        self.update_ball_search();
        self.check_collecting();
        for node in &mut self.nodes {
            if let Node::Device(dev) = node {
                dev.refresh_state();
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // LOOKUP
    // ═══════════════════════════════════════════════════════════════════════════

    pub(crate) fn device(&self, id: NodeId) -> Option<&BallDevice> {
        match self.nodes.get(id.0) {
            Some(Node::Device(d)) => Some(d),
            _ => None,
        }
    }

    pub(crate) fn device_mut(&mut self, id: NodeId) -> Option<&mut BallDevice> {
        match self.nodes.get_mut(id.0) {
            Some(Node::Device(d)) => Some(d),
            _ => None,
        }
    }

    pub(crate) fn playfield(&self, id: NodeId) -> Option<&Playfield> {
        match self.nodes.get(id.0) {
            Some(Node::Playfield(p)) => Some(p),
            _ => None,
        }
    }

    pub(crate) fn playfield_mut(&mut self, id: NodeId) -> Option<&mut Playfield> {
        match self.nodes.get_mut(id.0) {
            Some(Node::Playfield(p)) => Some(p),
            _ => None,
        }
    }

    pub(crate) fn incoming_mut(&mut self, id: NodeId) -> Option<&mut IncomingBalls> {
        match self.nodes.get_mut(id.0) {
            Some(Node::Device(d)) => Some(&mut d.incoming),
            Some(Node::Playfield(p)) => Some(&mut p.incoming),
            None => None,
        }
    }

    pub(crate) fn is_playfield(&self, id: NodeId) -> bool {
        matches!(self.nodes.get(id.0), Some(Node::Playfield(_)))
    }

    pub(crate) fn name_of(&self, id: NodeId) -> String {
        self.nodes
            .get(id.0)
            .map(|n| n.name().to_string())
            .unwrap_or_else(|| id.to_string())
    }

    pub fn node_id(&self, name: &str) -> PfResult<NodeId> {
        self.names
            .get(name)
            .copied()
            .ok_or_else(|| PfError::UnknownDevice(name.to_string()))
    }

    pub(crate) fn device_id(&self, name: &str) -> PfResult<NodeId> {
        let id = self.node_id(name)?;
        if self.device(id).is_none() {
            return Err(PfError::Config(format!("{name} is not a ball device")));
        }
        Ok(id)
    }

    pub(crate) fn playfield_node(&self, name: &str) -> PfResult<NodeId> {
        let id = self.node_id(name)?;
        if !self.is_playfield(id) {
            return Err(PfError::Config(format!("{name} is not a playfield")));
        }
        Ok(id)
    }

    pub(crate) fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    pub(crate) fn next_id(&mut self) -> u64 {
        self.ids += 1;
        self.ids
    }

    pub(crate) fn post(&mut self, event: BallEvent) {
        log::debug!("[event] {}", event.name());
        self.bus.post(event);
    }

    pub(crate) fn anomaly(&mut self, anomaly: Anomaly) {
        log::warn!("[ball_count] Anomaly: {:?}", anomaly);
        self.post(BallEvent::BallCountAnomaly { anomaly });
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // PUBLIC STATE
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    pub fn now(&self) -> Millis {
        self.now
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn devices(&self) -> impl Iterator<Item = &BallDevice> {
        self.nodes.iter().filter_map(|n| match n {
            Node::Device(d) => Some(d),
            Node::Playfield(_) => None,
        })
    }

    pub fn playfields(&self) -> impl Iterator<Item = &Playfield> {
        self.nodes.iter().filter_map(|n| match n {
            Node::Playfield(p) => Some(p),
            Node::Device(_) => None,
        })
    }

    pub fn device_by_name(&self, name: &str) -> PfResult<&BallDevice> {
        let id = self.device_id(name)?;
        self.device(id)
            .ok_or_else(|| PfError::UnknownDevice(name.to_string()))
    }

    pub fn playfield_by_name(&self, name: &str) -> PfResult<&Playfield> {
        let id = self.playfield_node(name)?;
        self.playfield(id)
            .ok_or_else(|| PfError::UnknownDevice(name.to_string()))
    }

    /// Diagnostic snapshot of one device
    pub fn device_status(&self, name: &str) -> PfResult<DeviceStatus> {
        let dev = self.device_by_name(name)?;
        let attempt = dev.attempt.as_ref().map(|a| AttemptStatus {
            target: self.name_of(a.request.target),
            phase: a.phase,
            attempts: a.attempts,
            pulse_issued_at: a.pulse_issued_at,
            timeout_at: a.timeout_at,
            retries_remaining: a.retries_remaining(dev.config.max_eject_attempts),
        });
        Ok(DeviceStatus {
            name: dev.name().to_string(),
            state: dev.state,
            balls: dev.balls,
            available_balls: dev.available_balls(),
            capacity: dev.capacity(),
            counted: dev.physical,
            queued_ejects: dev
                .eject_queue
                .iter()
                .map(|r| self.name_of(r.target))
                .collect(),
            incoming_from: dev.incoming.iter().map(|b| self.name_of(b.source)).collect(),
            attempt,
        })
    }

    /// Put a device back into service: clear the broken flag, drop the
    /// eject in progress (its request goes back to the front of the queue)
    /// and re-read the counter. Refused for a device with nothing to reset.
    pub fn reset_device(&mut self, name: &str) -> PfResult<()> {
        let id = self.device_id(name)?;
        if self
            .device(id)
            .is_some_and(|d| !d.broken && d.attempt.is_none())
        {
            return Err(PfError::Refused(format!("{name} is not ejecting or broken")));
        }
        if let Some(attempt) = self.take_attempt(id) {
            self.drop_promise(attempt.request.target, attempt.promise);
            self.release_diverters(&attempt.diverters);
            let mut request = attempt.request;
            request.already_left = false;
            if let Some(dev) = self.device_mut(id) {
                dev.eject_queue.push_front(request);
            }
        }
        let Some(dev) = self.device_mut(id) else {
            return Err(PfError::UnknownDevice(name.to_string()));
        };
        dev.broken = false;
        if let BallCounter::Entrance(counter) = &mut dev.counter {
            counter.reset(dev.balls);
        }
        dev.physical = dev.counter.count();
        if dev.physical != dev.balls {
            log::warn!(
                "[{}] Reset with {} ball(s) tracked but {} counted",
                name,
                dev.balls,
                dev.physical
            );
        }
        log::info!("[{}] Reset, {} ball(s)", name, dev.balls);
        self.route_unclaimed(id);
        self.settle();
        Ok(())
    }
}

fn build_counter(config: &DeviceConfig) -> BallCounter {
    if config.uses_entrance_counter() {
        BallCounter::Entrance(EntranceCounter::new(
            &config.entrance_switches,
            config.capacity(),
            config.entrance_ignore_window_ms,
        ))
    } else {
        BallCounter::Switches(SwitchCounter::new(
            &config.ball_switches,
            config.entrance_count_delay_ms,
            config.exit_count_delay_ms,
        ))
    }
}

fn build_ejector(config: &DeviceConfig, default_pulse: &dyn Fn(&str) -> PulseSettings) -> Ejector {
    match (&config.eject_coil, &config.hold_coil) {
        (Some(coil), _) => Ejector::Pulse {
            coil: coil.clone(),
            pulse: config.eject_pulse.unwrap_or_else(|| default_pulse(coil)),
        },
        (None, Some(coil)) => Ejector::Hold {
            coil: coil.clone(),
            pulse: config.eject_pulse.unwrap_or_else(|| default_pulse(coil)),
            hold: config.hold,
            release_ms: config.hold_release_ms,
        },
        (None, None) => Ejector::Mechanical,
    }
}
