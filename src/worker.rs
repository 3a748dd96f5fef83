//! The per-thread worker: one reactor, a ramping population of peers, and
//! the event loop that keeps them cycling until the run ends.

use std::sync::Arc;

use anyhow::Result;
use log::debug;
use rustls::ClientConfig;

use crate::config::RunConfig;
use crate::peer::Peer;
use crate::reactor::Reactor;
use crate::stats::{GlobalStats, LatencyRing, MergedLatency};

/// Initial number of peers a worker starts with; the rest of the target is
/// granted one peer per completed handshake cycle, so concurrency against
/// the server ramps up instead of arriving all at once.
pub const PEERS_SLOW_START: usize = 10;

pub struct Worker {
    cfg: Arc<RunConfig>,
    stats: Arc<GlobalStats>,
    merged: Arc<MergedLatency>,
    reactor: Reactor,
    peers: Vec<Peer>,
    latency: LatencyRing,
}

impl Worker {
    pub fn new(
        cfg: Arc<RunConfig>,
        stats: Arc<GlobalStats>,
        merged: Arc<MergedLatency>,
        tls_config: Arc<ClientConfig>,
    ) -> Result<Self> {
        let reactor = Reactor::new(cfg.endpoint, tls_config)?;
        Ok(Self {
            peers: Vec::with_capacity(cfg.peers_per_worker),
            latency: LatencyRing::new(),
            cfg,
            stats,
            merged,
            reactor,
        })
    }

    /// Runs the event loop until the handshake budget is exhausted or
    /// termination is requested, then flushes this worker's latency samples
    /// and releases every peer.
    pub fn run(&mut self) -> Result<()> {
        let result = self.run_loop();

        self.latency.flush_into(&self.merged);
        for i in 0..self.peers.len() {
            self.peers[i].disconnect(&mut self.reactor);
        }

        result
    }

    fn run_loop(&mut self) -> Result<()> {
        let target = self.cfg.peers_per_worker;
        let mut new_peers = target.min(PEERS_SLOW_START);

        while !self.end_of_work() {
            // Grow the peer population within the current slow-start grant.
            while self.peers.len() < target && new_peers > 0 {
                new_peers -= 1;
                let id = self.peers.len();
                self.peers.push(Peer::new(id, self.cfg.endpoint));
                if self.drive(id)? && self.peers.len() + new_peers < target {
                    new_peers += 1;
                }
            }

            self.reactor.wait()?;
            while let Some(id) = self.reactor.next_ready() {
                if self.drive(id)? && self.peers.len() + new_peers < target {
                    new_peers += 1;
                }
            }

            // Reconnect peers that completed a cycle.  Skipped entirely once
            // termination is requested, so a shutting-down worker does not
            // open fresh sockets.
            self.reactor.rotate_backlog();
            while !self.stats.terminate_requested() {
                let Some(id) = self.reactor.next_backlog() else {
                    break;
                };
                if self.drive(id)? && self.peers.len() + new_peers < target {
                    new_peers += 1;
                }
            }

            if self.peers.len() == target && self.stats.mark_all_peers_active() {
                println!("( All peers are active, start to gather statistics )");
            }
        }
        debug!("worker drained, exiting");
        Ok(())
    }

    fn drive(&mut self, id: usize) -> Result<bool> {
        self.peers[id].advance(&mut self.reactor, &self.stats, &mut self.latency, &self.cfg)
    }

    fn end_of_work(&self) -> bool {
        self.stats.end_of_work(self.cfg.handshake_budget)
    }
}
