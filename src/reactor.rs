//! Per-worker readiness multiplexer.
//!
//! One reactor serves one worker thread: it owns the mio poller all of the
//! worker's sockets are registered with, holds the shared TLS context
//! template that fresh sessions are cloned from, and buffers peers that have
//! finished a handshake cycle until the worker reconnects them.

use std::collections::VecDeque;
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::warn;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection};

/// How many readiness events one wait may harvest.
const EVENT_BATCH: usize = 128;

/// Upper bound on one poller wait.  Bounds how stale the termination check
/// can get when no socket turns ready.
const WAIT_TIMEOUT: Duration = Duration::from_millis(5);

pub struct Reactor {
    poll: Poll,
    events: Events,
    /// Peer slots reported ready by the last `wait`, in no particular order.
    ready: Vec<usize>,
    /// Peers that completed a cycle and want a fresh connection.
    reconnect_q: VecDeque<usize>,
    /// Snapshot of `reconnect_q` currently being drained.
    backlog: VecDeque<usize>,
    tls_config: Arc<ClientConfig>,
    server_name: ServerName<'static>,
}

impl Reactor {
    pub fn new(endpoint: SocketAddr, tls_config: Arc<ClientConfig>) -> Result<Self> {
        Ok(Self {
            poll: Poll::new().context("cannot create poller")?,
            events: Events::with_capacity(EVENT_BATCH),
            ready: Vec::with_capacity(EVENT_BATCH),
            reconnect_q: VecDeque::new(),
            backlog: VecDeque::new(),
            tls_config,
            server_name: ServerName::IpAddress(endpoint.ip().into()),
        })
    }

    /// Adds a peer's socket to the readiness set.  Failure here means the
    /// worker cannot make progress and is fatal.
    pub fn register(&mut self, slot: usize, socket: &mut TcpStream) -> Result<()> {
        self.poll
            .registry()
            .register(socket, Token(slot), Interest::READABLE | Interest::WRITABLE)
            .context("cannot add socket to poller")
    }

    /// Removes a peer's socket.  Only called while tearing a connection
    /// down, where the socket is about to be closed anyway, so a failure is
    /// logged rather than propagated.
    pub fn unregister(&mut self, socket: &mut TcpStream) {
        if let Err(e) = self.poll.registry().deregister(socket) {
            warn!("cannot delete socket from poller: {e}");
        }
    }

    /// Blocks up to the wait timeout and harvests readiness events.
    /// Interrupted waits are retried transparently.
    pub fn wait(&mut self) -> Result<()> {
        loop {
            match self.poll.poll(&mut self.events, Some(WAIT_TIMEOUT)) {
                Ok(()) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context("poller wait error"),
            }
        }
        self.ready.clear();
        for event in self.events.iter() {
            self.ready.push(event.token().0);
        }
        Ok(())
    }

    /// Next peer slot that turned ready since the last `wait`, or `None`
    /// once the batch is drained.
    pub fn next_ready(&mut self) -> Option<usize> {
        self.ready.pop()
    }

    pub fn queue_reconnect(&mut self, slot: usize) {
        self.reconnect_q.push_back(slot);
    }

    /// Swaps the reconnect queue into the drain list, so peers queued while
    /// draining wait for the next iteration instead of starving the event
    /// loop.
    pub fn rotate_backlog(&mut self) {
        mem::swap(&mut self.backlog, &mut self.reconnect_q);
    }

    pub fn next_backlog(&mut self) -> Option<usize> {
        self.backlog.pop_front()
    }

    /// Clones a fresh TLS client session off the shared context template.
    pub fn new_tls_session(&self) -> Result<ClientConnection> {
        ClientConnection::new(Arc::clone(&self.tls_config), self.server_name.clone())
            .context("cannot create TLS session")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LatencyScope, RunConfig, TlsVersion};

    fn reactor() -> Reactor {
        let cfg = RunConfig {
            endpoint: "127.0.0.1:443".parse().unwrap(),
            peers_per_worker: 1,
            workers: 1,
            handshake_budget: u64::MAX,
            duration_secs: 0,
            tls_version: TlsVersion::Any,
            cipher: None,
            use_tickets: false,
            latency_scope: LatencyScope::Drive,
            verify: false,
            cafile: None,
            debug: false,
        };
        Reactor::new(cfg.endpoint, cfg.tls_client_config().unwrap()).unwrap()
    }

    #[test]
    fn wait_with_no_sockets_returns_empty_batch() {
        let mut reactor = reactor();
        reactor.wait().unwrap();
        assert_eq!(reactor.next_ready(), None);
    }

    #[test]
    fn backlog_rotation_snapshots_the_queue() {
        let mut reactor = reactor();

        reactor.queue_reconnect(3);
        reactor.queue_reconnect(5);
        assert_eq!(reactor.next_backlog(), None, "nothing drained before rotation");

        reactor.rotate_backlog();
        assert_eq!(reactor.next_backlog(), Some(3));

        // Reconnects queued mid-drain belong to the next rotation.
        reactor.queue_reconnect(7);
        assert_eq!(reactor.next_backlog(), Some(5));
        assert_eq!(reactor.next_backlog(), None);

        reactor.rotate_backlog();
        assert_eq!(reactor.next_backlog(), Some(7));
        assert_eq!(reactor.next_backlog(), None);
    }

    #[test]
    fn empty_rotation_is_idempotent() {
        let mut reactor = reactor();
        reactor.queue_reconnect(1);
        reactor.rotate_backlog();
        assert_eq!(reactor.next_backlog(), Some(1));

        reactor.rotate_backlog();
        assert_eq!(reactor.next_backlog(), None);
        reactor.rotate_backlog();
        assert_eq!(reactor.next_backlog(), None);
    }

    #[test]
    fn sessions_come_from_the_template() {
        let reactor = reactor();
        let session = reactor.new_tls_session().unwrap();
        assert!(session.is_handshaking());
    }
}
