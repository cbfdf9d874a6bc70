//! Ball routing
//!
//! The device graph is static: every device lists the nodes it can eject
//! to. A request for a ball at some destination is resolved by searching
//! the graph backwards from the destination for the nearest device with an
//! available ball. Only the first hop is queued immediately; each later hop
//! is queued on the intermediate device once the ball has arrived there.
//!
//! Requests that cannot be resolved wait in arrival order and are retried
//! whenever the machine settles.

use crate::eject::EjectRequest;
use crate::machine::{BallMachine, Node};
use pf_core::{PfError, PfResult};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

/// Index of a device or playfield in the machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TOPOLOGY
// ═══════════════════════════════════════════════════════════════════════════════

/// Static eject graph
#[derive(Debug, Clone)]
pub struct Topology {
    targets: Vec<Vec<NodeId>>,
    sources: Vec<Vec<NodeId>>,
}

impl Topology {
    /// `targets[n]` lists the eject targets of node `n` in configuration order
    pub fn new(targets: Vec<Vec<NodeId>>) -> Self {
        let mut sources = vec![Vec::new(); targets.len()];
        for (index, list) in targets.iter().enumerate() {
            for target in list {
                if let Some(entry) = sources.get_mut(target.0) {
                    entry.push(NodeId(index));
                }
            }
        }
        Self { targets, sources }
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn targets(&self, node: NodeId) -> &[NodeId] {
        self.targets.get(node.0).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn sources(&self, node: NodeId) -> &[NodeId] {
        self.sources.get(node.0).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Fewest-hop path `[source, .., destination]` from a node for which
    /// `has_ball` holds. Equal-length paths are decided by configuration order.
    pub fn path_from_available(
        &self,
        destination: NodeId,
        has_ball: impl Fn(NodeId) -> bool,
    ) -> Option<Vec<NodeId>> {
        let mut next_hop: HashMap<NodeId, NodeId> = HashMap::new();
        let mut seen: HashSet<NodeId> = HashSet::from([destination]);
        let mut queue = VecDeque::from([destination]);

        while let Some(node) = queue.pop_front() {
            for &source in self.sources(node) {
                if !seen.insert(source) {
                    continue;
                }
                next_hop.insert(source, node);
                if has_ball(source) {
                    let mut path = vec![source];
                    let mut current = source;
                    while let Some(&next) = next_hop.get(&current) {
                        path.push(next);
                        current = next;
                    }
                    return Some(path);
                }
                queue.push_back(source);
            }
        }
        None
    }

    /// Fewest-hop path `[from, .., to]`
    pub fn path_between(&self, from: NodeId, to: NodeId) -> Option<Vec<NodeId>> {
        self.nearest(from, |n| n == to)
    }

    /// Fewest-hop path from `from` to the first node matching `accept`
    pub fn nearest(&self, from: NodeId, accept: impl Fn(NodeId) -> bool) -> Option<Vec<NodeId>> {
        let mut previous: HashMap<NodeId, NodeId> = HashMap::new();
        let mut seen: HashSet<NodeId> = HashSet::from([from]);
        let mut queue = VecDeque::from([from]);

        while let Some(node) = queue.pop_front() {
            for &target in self.targets(node) {
                if !seen.insert(target) {
                    continue;
                }
                previous.insert(target, node);
                if accept(target) {
                    let mut path = vec![target];
                    let mut current = target;
                    while let Some(&prev) = previous.get(&current) {
                        path.push(prev);
                        current = prev;
                    }
                    path.reverse();
                    return Some(path);
                }
                queue.push_back(target);
            }
        }
        None
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ROUTER
// ═══════════════════════════════════════════════════════════════════════════════

/// A ball request waiting for an available ball
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRequest {
    pub seq: u64,
    pub destination: NodeId,
    /// Device the ball has to pass through last
    pub via: Option<NodeId>,
    pub player_controlled: bool,
}

/// Unresolved requests in arrival order
#[derive(Debug, Clone, Default)]
pub struct Router {
    pending: VecDeque<PendingRequest>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> impl Iterator<Item = &PendingRequest> {
        self.pending.iter()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Keep the queue ordered by request sequence
    pub(crate) fn defer(&mut self, request: PendingRequest) {
        let index = self
            .pending
            .iter()
            .position(|p| p.seq > request.seq)
            .unwrap_or(self.pending.len());
        self.pending.insert(index, request);
    }

    pub(crate) fn take_all(&mut self) -> VecDeque<PendingRequest> {
        std::mem::take(&mut self.pending)
    }

    pub(crate) fn restore(&mut self, remaining: VecDeque<PendingRequest>) {
        for request in remaining {
            self.defer(request);
        }
    }
}

impl BallMachine {
    /// Devices that can hand out a ball right now
    pub(crate) fn has_available_ball(&self, node: NodeId) -> bool {
        matches!(self.nodes.get(node.0), Some(Node::Device(d)) if !d.broken && d.available_balls() > 0)
    }

    /// Devices with a ball in them, even if it is already spoken for
    fn holds_ball(&self, node: NodeId) -> bool {
        matches!(self.nodes.get(node.0), Some(Node::Device(d)) if d.balls() > 0)
    }

    /// Full path `[source, .., destination]` for a request, if a ball is available
    pub(crate) fn resolve_request(&self, request: &PendingRequest) -> Option<Vec<NodeId>> {
        let has_ball = |n: NodeId| self.has_available_ball(n);
        match request.via {
            None => self
                .topology
                .path_from_available(request.destination, has_ball),
            Some(via) => {
                let tail = self.topology.path_between(via, request.destination)?;
                if has_ball(via) {
                    return Some(tail);
                }
                let mut head = self.topology.path_from_available(via, has_ball)?;
                head.pop();
                head.extend(tail);
                Some(head)
            }
        }
    }

    /// Ask for a ball to be delivered to `destination`
    pub fn request_ball(&mut self, destination: &str) -> PfResult<()> {
        let id = self.node_id(destination)?;
        self.request_ball_to(id, None, false)?;
        self.settle();
        Ok(())
    }

    pub(crate) fn request_ball_to(
        &mut self,
        destination: NodeId,
        via: Option<NodeId>,
        player_controlled: bool,
    ) -> PfResult<()> {
        if let Some(via) = via {
            if self.topology.path_between(via, destination).is_none() {
                return Err(PfError::Topology(format!(
                    "{} cannot reach {}",
                    self.name_of(via),
                    self.name_of(destination)
                )));
            }
        }
        // `via` holding a ball is a valid source on its own
        let upstream = match via {
            Some(via) if self.holds_ball(via) => None,
            Some(via) => Some(via),
            None => Some(destination),
        };
        if let Some(node) = upstream {
            if self.topology.sources(node).is_empty() {
                return Err(PfError::Topology(format!(
                    "no device can deliver a ball to {}",
                    self.name_of(node)
                )));
            }
        }
        let request = PendingRequest {
            seq: self.next_seq(),
            destination,
            via,
            player_controlled,
        };
        if !self.route_request(&request) {
            log::info!(
                "[router] No ball available for {}, request deferred",
                self.name_of(destination)
            );
            self.router.defer(request);
        }
        Ok(())
    }

    /// Queue the first hop of a request. False if no ball is available.
    pub(crate) fn route_request(&mut self, request: &PendingRequest) -> bool {
        let Some(path) = self.resolve_request(request) else {
            return false;
        };
        if path.len() < 2 {
            return false;
        }
        log::info!(
            "[router] Routing ball for {}: {}",
            self.name_of(request.destination),
            path.iter()
                .map(|n| self.name_of(*n))
                .collect::<Vec<_>>()
                .join(" -> ")
        );
        let eject = EjectRequest {
            seq: request.seq,
            target: path[1],
            route: path[2..].to_vec(),
            destination: Some(request.destination),
            player_controlled: request.player_controlled,
            already_left: false,
        };
        self.enqueue_eject(path[0], eject);
        true
    }

    /// Retry deferred requests in arrival order. True if any was routed.
    pub(crate) fn retry_pending(&mut self) -> bool {
        if self.router.pending_len() == 0 {
            return false;
        }
        let mut waiting = self.router.take_all();
        let mut remaining = VecDeque::new();
        let mut routed = false;
        while let Some(request) = waiting.pop_front() {
            if self.route_request(&request) {
                routed = true;
            } else {
                remaining.push_back(request);
            }
        }
        self.router.restore(remaining);
        routed
    }

    /// Re-issue the request an eject was serving, keeping its place in line
    pub(crate) fn reroute(&mut self, request: &EjectRequest) {
        let Some(destination) = request.destination else {
            return;
        };
        log::info!(
            "[router] Re-requesting ball for {}",
            self.name_of(destination)
        );
        let pending = PendingRequest {
            seq: request.seq,
            destination,
            via: None,
            player_controlled: request.player_controlled,
        };
        if !self.route_request(&pending) {
            self.router.defer(pending);
        }
    }

    /// Queue an eject from `source` to `target`, routing through
    /// intermediate devices when `target` is not a direct neighbour
    pub(crate) fn eject_towards(
        &mut self,
        source: NodeId,
        target: NodeId,
        player_controlled: bool,
    ) -> bool {
        let Some(path) = self.topology.path_between(source, target) else {
            log::warn!(
                "[{}] No path to {}",
                self.name_of(source),
                self.name_of(target)
            );
            return false;
        };
        let eject = EjectRequest {
            seq: self.next_seq(),
            target: path[1],
            route: path[2..].to_vec(),
            destination: None,
            player_controlled,
            already_left: false,
        };
        self.enqueue_eject(source, eject);
        true
    }

    pub fn pending_requests(&self) -> usize {
        self.router.pending_len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(list: &[usize]) -> Vec<NodeId> {
        list.iter().map(|i| NodeId(*i)).collect()
    }

    // 0 = playfield, 1 = trough, 2 = plunger, 3 = lock, 4 = vuk, 5 = saucer
    fn chain() -> Topology {
        Topology::new(vec![
            vec![],
            ids(&[2]),
            ids(&[0]),
            ids(&[0]),
            ids(&[3, 0]),
            ids(&[3]),
        ])
    }

    #[test]
    fn test_sources_follow_config_order() {
        let topo = chain();
        assert_eq!(topo.sources(NodeId(3)), ids(&[4, 5]).as_slice());
        assert_eq!(topo.sources(NodeId(0)), ids(&[2, 3, 4]).as_slice());
    }

    #[test]
    fn test_direct_source_preferred() {
        let topo = chain();
        let path = topo
            .path_from_available(NodeId(0), |n| n == NodeId(1) || n == NodeId(2))
            .unwrap();
        assert_eq!(path, ids(&[2, 0]));
    }

    #[test]
    fn test_multi_hop_path() {
        let topo = chain();
        let path = topo
            .path_from_available(NodeId(0), |n| n == NodeId(1))
            .unwrap();
        assert_eq!(path, ids(&[1, 2, 0]));
    }

    #[test]
    fn test_tie_broken_by_config_order() {
        let topo = chain();
        let path = topo
            .path_from_available(NodeId(3), |n| n == NodeId(4) || n == NodeId(5))
            .unwrap();
        assert_eq!(path, ids(&[4, 3]));
    }

    #[test]
    fn test_no_source_available() {
        let topo = chain();
        assert!(topo.path_from_available(NodeId(0), |_| false).is_none());
    }

    #[test]
    fn test_forward_paths() {
        let topo = chain();
        assert_eq!(topo.path_between(NodeId(1), NodeId(0)).unwrap(), ids(&[1, 2, 0]));
        assert_eq!(topo.path_between(NodeId(5), NodeId(0)).unwrap(), ids(&[5, 3, 0]));
        assert!(topo.path_between(NodeId(0), NodeId(1)).is_none());
        let to_lock = topo.nearest(NodeId(4), |n| n == NodeId(3)).unwrap();
        assert_eq!(to_lock, ids(&[4, 3]));
    }

    #[test]
    fn test_router_keeps_sequence_order() {
        let mut router = Router::new();
        for seq in [5, 2, 9] {
            router.defer(PendingRequest {
                seq,
                destination: NodeId(0),
                via: None,
                player_controlled: false,
            });
        }
        let order: Vec<u64> = router.pending().map(|p| p.seq).collect();
        assert_eq!(order, vec![2, 5, 9]);
    }
}
