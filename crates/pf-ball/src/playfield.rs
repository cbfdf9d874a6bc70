//! Playfield
//!
//! The playfield has no switches that count balls. Its count is kept from
//! the transfers the devices report: confirmed ejects add, captures
//! subtract. Activity switches only prove that some ball is in play.

use crate::ball_search::BallSearch;
use crate::config::{PlayfieldConfig, TAG_BALL_ADD_LIVE};
use crate::incoming::IncomingBalls;
use crate::machine::{BallMachine, Node};
use crate::router::NodeId;
use pf_core::{Anomaly, BallEvent, PfError, PfResult};

#[derive(Debug, Clone)]
pub struct Playfield {
    pub(crate) id: NodeId,
    pub(crate) config: PlayfieldConfig,
    pub(crate) balls: u32,
    pub(crate) incoming: IncomingBalls,
    pub(crate) search: BallSearch,
}

impl Playfield {
    pub(crate) fn new(id: NodeId, config: PlayfieldConfig, search: BallSearch) -> Self {
        Self {
            id,
            config,
            balls: 0,
            incoming: IncomingBalls::default(),
            search,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &PlayfieldConfig {
        &self.config
    }

    pub fn balls(&self) -> u32 {
        self.balls
    }

    /// Ejects on their way here
    pub fn incoming_count(&self) -> usize {
        self.incoming.len()
    }

    pub fn ball_search(&self) -> &BallSearch {
        &self.search
    }
}

impl BallMachine {
    pub(crate) fn playfield_add(&mut self, id: NodeId, balls: u32) {
        let Some(pf) = self.playfield_mut(id) else {
            return;
        };
        pf.balls += balls;
        let total = pf.balls;
        let name = pf.config.name.clone();
        log::info!("[{}] Ball count {} (+{})", name, total, balls);
        self.post(BallEvent::PlayfieldBallCountChange {
            playfield: name,
            balls: total,
            change: balls as i32,
        });
    }

    pub(crate) fn playfield_remove(&mut self, id: NodeId, balls: u32) {
        let Some(pf) = self.playfield_mut(id) else {
            return;
        };
        let removed = balls.min(pf.balls);
        let underflow = removed < balls;
        pf.balls -= removed;
        let total = pf.balls;
        let name = pf.config.name.clone();
        if underflow {
            self.anomaly(Anomaly::PlayfieldUnderflow {
                playfield: name.clone(),
            });
        }
        if removed == 0 {
            return;
        }
        log::info!("[{}] Ball count {} (-{})", name, total, removed);
        self.post(BallEvent::PlayfieldBallCountChange {
            playfield: name,
            balls: total,
            change: -(removed as i32),
        });
    }

    /// A playfield switch was hit
    pub(crate) fn playfield_activity(&mut self, id: NodeId) {
        let Some(pf) = self.playfield(id) else {
            return;
        };
        let name = pf.config.name.clone();
        let pf_balls = pf.balls;
        let arriving = pf.incoming.iter().find_map(|promise| {
            let attempt = self.device(promise.source)?.attempt.as_ref()?;
            let confirms = attempt.id == promise.attempt
                && (attempt.has_left() || (pf_balls == 0 && !attempt.mechanical));
            confirms.then_some(promise.source)
        });

        self.post(BallEvent::PlayfieldActive {
            playfield: name.clone(),
        });
        self.ball_search_activity(id);

        if let Some(source) = arriving {
            log::debug!(
                "[{}] Activity confirms eject from {}",
                name,
                self.name_of(source)
            );
            self.complete_transfer(source);
            return;
        }
        if pf_balls == 0 {
            log::warn!("[{}] Activity with no ball in play", name);
            self.post(BallEvent::UnexpectedBallOnPlayfield {
                playfield: name.clone(),
            });
            self.playfield_add(id, 1);
            self.controller_ball_found(&name);
        }
    }

    /// Put `balls` into play on a playfield, optionally through `source`
    pub fn add_ball(
        &mut self,
        playfield: &str,
        balls: u32,
        source: Option<&str>,
        player_controlled: bool,
    ) -> PfResult<()> {
        let id = self.node_id(playfield)?;
        if !self.is_playfield(id) {
            return Err(PfError::Config(format!("{playfield} is not a playfield")));
        }
        let via = match source {
            Some(name) => self.device_id(name)?,
            None => self.default_ball_source(id).ok_or_else(|| {
                PfError::Topology(format!("no device adds balls to {playfield}"))
            })?,
        };
        log::info!(
            "[{}] Adding {} ball(s) via {}",
            playfield,
            balls,
            self.name_of(via)
        );
        for _ in 0..balls {
            self.request_ball_to(id, Some(via), player_controlled)?;
        }
        self.settle();
        Ok(())
    }

    /// Device tagged for live ball adds, else the first device that feeds the playfield
    fn default_ball_source(&self, playfield: NodeId) -> Option<NodeId> {
        let feeders = self.topology.sources(playfield);
        let tagged = feeders.iter().copied().find(|n| {
            matches!(self.nodes.get(n.0), Some(Node::Device(d)) if d.config.has_tag(TAG_BALL_ADD_LIVE))
        });
        tagged.or_else(|| feeders.first().copied())
    }

    pub fn playfield_balls(&self, playfield: &str) -> PfResult<u32> {
        let id = self.node_id(playfield)?;
        self.playfield(id)
            .map(|p| p.balls)
            .ok_or_else(|| PfError::Config(format!("{playfield} is not a playfield")))
    }
}
