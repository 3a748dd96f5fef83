//! The per-slot connection state machine.
//!
//! A peer cycles through TCP connect, TLS handshake and teardown forever.
//! It owns its socket and TLS session exclusively; the reactor only keeps
//! the slot number for event dispatch.  All I/O is non-blocking, so a peer
//! never holds up its worker: whenever an operation cannot finish now the
//! peer registers for readiness and yields.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::Ordering::Relaxed;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use log::{debug, warn};
use mio::net::TcpStream;
use rustls::ClientConnection;
use socket2::{Domain, Protocol, SockRef, Socket, Type};

use crate::config::{LatencyScope, RunConfig};
use crate::reactor::Reactor;
use crate::stats::{GlobalStats, LatencyRing};

/// Where a peer is in its connect/handshake cycle.
///
/// The owned resources follow the state: `Connect` holds neither socket nor
/// session, `Connecting` holds only the socket, `Handshaking` holds both.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Connect,
    Connecting,
    Handshaking,
}

/// Outcome of one drive of the non-blocking handshake.
enum HandshakeStatus {
    Done,
    WantRead,
    WantWrite,
    Fatal(anyhow::Error),
}

pub struct Peer {
    id: usize,
    state: State,
    socket: Option<TcpStream>,
    tls: Option<ClientConnection>,
    endpoint: SocketAddr,
    /// Mirrors whether the socket is registered with the reactor.
    polled: bool,
    /// When the current handshake started; the meaning depends on the
    /// configured latency scope.
    hs_started: Option<Instant>,
    /// Whether the current handshake ever had to wait for readiness.
    waited: bool,
}

impl Peer {
    pub fn new(id: usize, endpoint: SocketAddr) -> Self {
        debug!("peer {id} created");
        Self {
            id,
            state: State::Connect,
            socket: None,
            tls: None,
            endpoint,
            polled: false,
            hs_started: None,
            waited: false,
        }
    }

    /// Drives the state machine one step.  Returns true when this step
    /// completed a full handshake cycle; the worker uses that to pace its
    /// slow-start ramp.
    pub fn advance(
        &mut self,
        reactor: &mut Reactor,
        stats: &GlobalStats,
        latency: &mut LatencyRing,
        cfg: &RunConfig,
    ) -> Result<bool> {
        match self.state {
            State::Connect => self.tcp_connect(reactor, stats, latency, cfg),
            State::Connecting => self.tcp_connect_try_finish(reactor, stats, latency, cfg),
            State::Handshaking => self.tls_handshake(reactor, stats, latency, cfg),
        }
    }

    fn tcp_connect(
        &mut self,
        reactor: &mut Reactor,
        stats: &GlobalStats,
        latency: &mut LatencyRing,
        cfg: &RunConfig,
    ) -> Result<bool> {
        let domain = match self.endpoint {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
            .context("cannot create a socket")?;
        socket
            .set_nonblocking(true)
            .context("cannot make the socket non-blocking")?;

        let connected = socket.connect(&self.endpoint.into());
        self.socket = Some(TcpStream::from_std(socket.into()));
        self.state = State::Connecting;
        stats.tcp_handshakes.fetch_add(1, Relaxed);

        match connected {
            // Localhost targets can finish the TCP handshake synchronously
            // even on a non-blocking socket.
            Ok(()) => self.tcp_established(reactor, stats, latency, cfg),
            Err(e) => {
                self.handle_connect_error(e, reactor, stats)?;
                Ok(false)
            }
        }
    }

    fn tcp_connect_try_finish(
        &mut self,
        reactor: &mut Reactor,
        stats: &GlobalStats,
        latency: &mut LatencyRing,
        cfg: &RunConfig,
    ) -> Result<bool> {
        let Some(socket) = self.socket.as_ref() else {
            bail!("peer {} is connecting without a socket", self.id);
        };
        match socket
            .take_error()
            .context("cannot get a socket connect() status")?
        {
            None => self.tcp_established(reactor, stats, latency, cfg),
            Some(e) => {
                self.handle_connect_error(e, reactor, stats)?;
                Ok(false)
            }
        }
    }

    fn tcp_established(
        &mut self,
        reactor: &mut Reactor,
        stats: &GlobalStats,
        latency: &mut LatencyRing,
        cfg: &RunConfig,
    ) -> Result<bool> {
        debug!("peer {} has established TCP connection", self.id);
        stats.tcp_handshakes.fetch_sub(1, Relaxed);
        stats.tcp_connections.fetch_add(1, Relaxed);
        stats.tcp_ever_connected.store(true, Relaxed);

        self.state = State::Handshaking;
        self.tls = Some(reactor.new_tls_session()?);
        stats.tls_handshakes.fetch_add(1, Relaxed);
        self.waited = false;
        if cfg.latency_scope == LatencyScope::Cycle {
            self.hs_started = Some(Instant::now());
        }

        self.tls_handshake(reactor, stats, latency, cfg)
    }

    fn tls_handshake(
        &mut self,
        reactor: &mut Reactor,
        stats: &GlobalStats,
        latency: &mut LatencyRing,
        cfg: &RunConfig,
    ) -> Result<bool> {
        if cfg.latency_scope == LatencyScope::Drive {
            self.hs_started = Some(Instant::now());
        }
        let (Some(socket), Some(tls)) = (self.socket.as_mut(), self.tls.as_mut()) else {
            bail!("peer {} is handshaking without a connection", self.id);
        };

        match drive_handshake(tls, socket) {
            HandshakeStatus::Done => {
                // With drive scope only handshakes that never waited for
                // readiness are sampled, so the distribution measures the
                // server's immediate handshake turnaround.
                let sample = match cfg.latency_scope {
                    LatencyScope::Drive if self.waited => None,
                    _ => self.hs_started.map(|started| started.elapsed()),
                };
                if let Some(elapsed) = sample {
                    latency.record(elapsed.as_micros() as u64);
                }

                debug!("peer {} has completed TLS handshake", self.id);
                stats.tls_handshakes.fetch_sub(1, Relaxed);
                stats.tls_connections.fetch_add(1, Relaxed);
                stats.tls_ever_connected.store(true, Relaxed);
                stats.tot_tls_handshakes.fetch_add(1, Relaxed);
                self.disconnect(reactor);
                stats.tcp_connections.fetch_sub(1, Relaxed);
                reactor.queue_reconnect(self.id);
                Ok(true)
            }
            HandshakeStatus::WantRead | HandshakeStatus::WantWrite => {
                self.waited = true;
                self.add_to_poll(reactor)?;
                Ok(false)
            }
            HandshakeStatus::Fatal(e) => {
                // A failure before the first-ever TLS success is a startup
                // failure, not a transient.
                if !stats.tls_ever_connected.load(Relaxed) {
                    return Err(e).context("cannot establish even one TLS connection");
                }
                debug!("peer {} handshake failed: {e:#}", self.id);
                stats.tls_handshakes.fetch_sub(1, Relaxed);
                stats.error_count.fetch_add(1, Relaxed);
                self.disconnect(reactor);
                stats.tcp_connections.fetch_sub(1, Relaxed);
                // Retry on the next backlog drain, without backoff.
                reactor.queue_reconnect(self.id);
                Ok(false)
            }
        }
    }

    fn handle_connect_error(
        &mut self,
        e: io::Error,
        reactor: &mut Reactor,
        stats: &GlobalStats,
    ) -> Result<()> {
        if connect_pending(&e) {
            // The TCP handshake is still in flight; wait for writability.
            return self.add_to_poll(reactor);
        }

        if !stats.tcp_ever_connected.load(Relaxed) {
            return Err(e).context("cannot establish even one TCP connection");
        }

        debug!("peer {} TCP connect failed: {e}", self.id);
        stats.tcp_handshakes.fetch_sub(1, Relaxed);
        stats.error_count.fetch_add(1, Relaxed);
        self.disconnect(reactor);
        // Retry on the next backlog drain, without backoff.
        reactor.queue_reconnect(self.id);
        Ok(())
    }

    /// Tears the connection down and re-arms the peer.  Dropping the TLS
    /// session discards any resumption state it acquired, and the socket is
    /// closed with lingering disabled so the port skips TIME_WAIT.  A no-op
    /// for a peer that holds nothing.
    pub fn disconnect(&mut self, reactor: &mut Reactor) {
        self.tls = None;
        if let Some(mut socket) = self.socket.take() {
            if self.polled {
                reactor.unregister(&mut socket);
                self.polled = false;
            }
            if let Err(e) = SockRef::from(&socket).set_linger(Some(Duration::ZERO)) {
                warn!("peer {}: cannot disable lingering: {e}", self.id);
            }
        }
        self.state = State::Connect;
    }

    fn add_to_poll(&mut self, reactor: &mut Reactor) -> Result<()> {
        if !self.polled {
            let Some(socket) = self.socket.as_mut() else {
                bail!("peer {} has no socket to poll", self.id);
            };
            reactor.register(self.id, socket)?;
            self.polled = true;
        }
        Ok(())
    }
}

/// Pumps the TLS state machine against the socket until it either completes,
/// needs the socket to turn ready, or fails.
fn drive_handshake(tls: &mut ClientConnection, socket: &mut TcpStream) -> HandshakeStatus {
    loop {
        while tls.wants_write() {
            match tls.write_tls(socket) {
                Ok(0) => return HandshakeStatus::WantWrite,
                Ok(_) => {}
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return HandshakeStatus::WantWrite;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return HandshakeStatus::Fatal(e.into()),
            }
        }

        if !tls.is_handshaking() {
            return HandshakeStatus::Done;
        }

        match tls.read_tls(socket) {
            Ok(0) => {
                return HandshakeStatus::Fatal(anyhow!("peer closed the connection mid-handshake"));
            }
            Ok(_) => {
                if let Err(e) = tls.process_new_packets() {
                    // Flush any alert rustls queued before reporting.
                    let _ = tls.write_tls(socket);
                    return HandshakeStatus::Fatal(e.into());
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                return HandshakeStatus::WantRead;
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return HandshakeStatus::Fatal(e.into()),
        }
    }
}

/// Errors from `connect(2)` that mean "still in progress" rather than
/// failure.
fn connect_pending(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EINPROGRESS) | Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK)
    ) || e.kind() == io::ErrorKind::WouldBlock
}
