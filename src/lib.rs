//! # tls-perf - a TLS handshake load generator
//!
//! tls-perf measures how many TLS handshakes per second a server can sustain,
//! and how long each handshake takes.  It deliberately exercises only the
//! handshake path: every connection is torn down the moment the handshake
//! completes, without exchanging application data, so the numbers reflect the
//! target's ability to absorb new sessions rather than to move bytes.
//!
//! Each worker thread runs a [`reactor::Reactor`] (a thin wrapper over a mio
//! poller) driving a fixed population of [`peer::Peer`] state machines through
//! TCP connect, TLS handshake and teardown cycles.  Workers ramp their peer
//! count up gradually so a cold target is not hit with the full connection
//! load at once.  Aggregate counters live in [`stats::GlobalStats`]; the main
//! thread samples them once per second and renders the final report.
//!
//! TLS is provided by [rustls] with the aws-lc-rs provider.  Handshake
//! latencies are recorded per worker in a fixed-size ring with a strided
//! overwrite pattern, so long runs retain a blend of early and late samples.
//!
//! [rustls]: https://docs.rs/rustls/latest/rustls/

pub mod config;
pub mod peer;
pub mod reactor;
pub mod stats;
pub mod worker;
