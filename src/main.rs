//! Command-line entry point: parses options, prepares the process, spawns
//! the workers and runs the once-per-second supervisor until the run ends.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use log::{debug, warn};
use tls_perf::config::{LatencyScope, RunConfig, TlsVersion};
use tls_perf::stats::{GlobalStats, MergedLatency, RateStats};
use tls_perf::worker::Worker;

/// Measures TLS handshake throughput and latency against a live endpoint.
///
/// Opens TCP connections, performs a TLS handshake on each, and tears the
/// connection down immediately: no application data is ever exchanged, so
/// the target's handshake path is the only thing being loaded.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Limit of parallel connections for each thread
    #[arg(short = 'l', value_name = "N", default_value_t = 1)]
    peers: usize,

    /// Total number of handshakes to establish
    #[arg(short = 'n', value_name = "N")]
    handshakes: Option<u64>,

    /// Number of threads
    #[arg(short = 't', value_name = "N", default_value_t = 1)]
    threads: usize,

    /// Duration of the test (in seconds)
    #[arg(short = 'T', long = "to", value_name = "SECONDS", default_value_t = 0)]
    duration: u64,

    /// Force cipher choice; 'any' disables ciphersuite restrictions
    #[arg(short = 'c', value_name = "CIPHER")]
    cipher: Option<String>,

    /// TLS version for the handshake
    #[arg(long = "tls", value_enum, default_value_t = TlsVersion::V12)]
    tls_version: TlsVersion,

    /// Enable TLS session tickets
    #[arg(long = "use-tickets")]
    use_tickets: bool,

    /// Which completed handshakes contribute latency samples
    #[arg(long, value_enum, default_value_t = LatencyScope::Drive)]
    latency_scope: LatencyScope,

    /// Verify the server certificate chain (the default is to accept any
    /// certificate, since load targets usually run self-signed ones)
    #[arg(long)]
    verify: bool,

    /// Read extra trust anchors from this PEM file; implies --verify
    #[arg(long, value_name = "FILE")]
    cafile: Option<PathBuf>,

    /// Log every peer state transition
    #[arg(short = 'd', long)]
    debug: bool,

    /// Target IP address (IPv4 or IPv6 literal; no name resolution)
    #[arg(default_value = "127.0.0.1")]
    ip: IpAddr,

    /// Target port
    #[arg(default_value_t = 443)]
    port: u16,
}

impl Args {
    fn into_config(self) -> RunConfig {
        RunConfig {
            endpoint: SocketAddr::new(self.ip, self.port),
            peers_per_worker: self.peers,
            workers: self.threads,
            handshake_budget: self.handshakes.unwrap_or(u64::MAX),
            duration_secs: self.duration,
            tls_version: self.tls_version,
            cipher: self.cipher,
            use_tickets: self.use_tickets,
            latency_scope: self.latency_scope,
            verify: self.verify,
            cafile: self.cafile,
            debug: self.debug,
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(if args.debug {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .target(env_logger::Target::Stdout)
        .init();

    let mut cfg = args.into_config();
    cfg.validate()?;
    let tls_config = cfg.tls_client_config()?;

    print_settings(&cfg);
    update_open_file_limit(&mut cfg)?;
    let cfg = Arc::new(cfg);

    let stats = Arc::new(GlobalStats::new());
    let merged = Arc::new(MergedLatency::new());

    {
        let stats = Arc::clone(&stats);
        ctrlc::set_handler(move || stats.request_terminate())
            .context("cannot install termination signal handler")?;
    }

    let mut handles = Vec::with_capacity(cfg.workers);
    for i in 0..cfg.workers {
        debug!("spawn thread {}", i + 1);
        let cfg = Arc::clone(&cfg);
        let stats = Arc::clone(&stats);
        let merged = Arc::clone(&merged);
        let tls_config = Arc::clone(&tls_config);
        let handle = thread::Builder::new()
            .name(format!("worker-{i}"))
            .spawn(move || {
                let result =
                    Worker::new(cfg, Arc::clone(&stats), merged, tls_config)
                        .and_then(|mut worker| worker.run());
                if result.is_err() {
                    // Take the siblings down so the process can report.
                    stats.request_terminate();
                }
                result
            })
            .context("cannot spawn worker thread")?;
        handles.push(handle);
    }

    let rates = supervise(&cfg, &stats);

    let mut failures = Vec::new();
    for handle in handles {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => failures.push(e),
            Err(_) => failures.push(anyhow!("worker thread panicked")),
        }
    }

    if !failures.is_empty() {
        let first = failures.remove(0);
        for other in failures {
            eprintln!("ERROR: {other:#}");
        }
        return Err(first);
    }

    print_report(&stats, &rates, &merged);
    Ok(())
}

/// Ticks once per second until the run ends: drains the per-interval
/// handshake counter into a rate sample, prints the live line, and enforces
/// the duration cap.  Returns the collected rate history for the report.
fn supervise(cfg: &RunConfig, stats: &GlobalStats) -> RateStats {
    let start = Instant::now();
    let mut last_tick = start;
    let mut rates = RateStats::new();

    while !stats.end_of_work(cfg.handshake_budget) {
        thread::sleep(Duration::from_secs(1));
        tick(stats, &mut rates, start, &mut last_tick);

        if cfg.duration_secs != 0 && start.elapsed().as_secs() >= cfg.duration_secs {
            stats.request_terminate();
        }
    }

    rates
}

fn tick(stats: &GlobalStats, rates: &mut RateStats, start: Instant, last_tick: &mut Instant) {
    let completed = stats.tls_connections.load(Relaxed);

    let now = Instant::now();
    let interval_ms = now.duration_since(*last_tick).as_millis().max(1) as i64;
    *last_tick = now;
    stats.tls_connections.fetch_sub(completed, Relaxed);

    let per_second = 1000 * completed / interval_ms;
    println!(
        "TLS hs in progress {} [{} h/s], TCP open conns {} [{} hs in progress], Errors {}",
        stats.tls_handshakes.load(Relaxed),
        per_second,
        stats.tcp_connections.load(Relaxed),
        stats.tcp_handshakes.load(Relaxed),
        stats.error_count.load(Relaxed),
    );

    // The ramp-up period would skew the aggregates; only record once every
    // worker runs its full peer complement.
    if stats.start_stats.load(Relaxed) {
        rates.record(start.elapsed(), per_second);
    }
}

fn print_report(stats: &GlobalStats, rates: &RateStats, merged: &MergedLatency) {
    println!("========================================");
    println!(
        " TOTAL:                  SECONDS {}; HANDSHAKES {}",
        rates.summary().map_or(0, |s| s.seconds),
        stats.tot_tls_handshakes.load(Relaxed),
    );

    match rates.summary() {
        Some(s) => println!(
            " MEASURES (seconds):     MAX h/s {}; AVG h/s {}; 95P h/s {}; MIN h/s {}",
            s.max, s.avg, s.p95, s.min
        ),
        // The run ended before any full-concurrency second elapsed.
        None => warn!("not enough rate measurements collected"),
    }

    match merged.summary() {
        Some(s) => println!(
            " LATENCY (microseconds): MIN {}; AVG {}; 95P {}; MAX {}",
            s.min, s.avg, s.p95, s.max
        ),
        None => warn!("no handshake latency samples collected"),
    }
}

fn print_settings(cfg: &RunConfig) {
    println!("Running TLS benchmark with following settings:");
    println!("Host:        {}", cfg.endpoint);
    println!("TLS version: {}", cfg.tls_version);
    println!(
        "Cipher:      {}",
        cfg.effective_cipher().as_deref().unwrap_or("any")
    );
    println!(
        "TLS tickets: {}",
        if cfg.use_tickets { "on" } else { "off" }
    );
    println!("Duration:    {}", cfg.duration_secs);
    println!();
}

/// Raises the open-file soft limit to cover every peer socket plus a poller
/// descriptor and the standard streams per worker.  When raising fails, the
/// peer count is shrunk to what the current limit allows.
fn update_open_file_limit(cfg: &mut RunConfig) -> Result<()> {
    let required = ((cfg.peers_per_worker + 4) * cfg.workers) as libc::rlim_t;

    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) } != 0 {
        return Err(io::Error::last_os_error()).context("cannot read the open file limit");
    }
    if limit.rlim_cur > required {
        return Ok(());
    }

    println!("set open files limit to {required}");
    let raised = libc::rlimit {
        rlim_cur: required,
        rlim_max: limit.rlim_max.max(required),
    };
    if unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &raised) } != 0 {
        let available = limit.rlim_cur as usize;
        let fallback = (available / cfg.workers).saturating_sub(4);
        warn!(
            "required {required} open files (peers * threads) but setrlimit(2) fails for \
             this limit; try to run as root or decrease the numbers, continuing with \
             {fallback} peers"
        );
        if fallback == 0 {
            bail!("cannot run with no peers");
        }
        cfg.peers_per_worker = fallback;
    }
    Ok(())
}
