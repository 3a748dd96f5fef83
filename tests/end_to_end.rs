//! Whole-engine tests: real workers handshaking against an in-process
//! rustls server on a loopback listener.

use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rustls::pki_types::PrivateKeyDer;
use rustls::{ServerConfig, ServerConnection};

use tls_perf::config::{LatencyScope, RunConfig, TlsVersion};
use tls_perf::stats::{GlobalStats, MergedLatency};
use tls_perf::worker::Worker;

fn server_config() -> Arc<ServerConfig> {
    let signed = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert = signed.cert.der().clone();
    let key = PrivateKeyDer::Pkcs8(signed.key_pair.serialize_der().into());
    Arc::new(
        ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert], key)
            .unwrap(),
    )
}

/// Starts a TLS server that handshakes every accepted connection.  The
/// thread runs until the test binary exits.
fn spawn_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let endpoint = listener.local_addr().unwrap();
    let config = server_config();

    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { break };
            let config = Arc::clone(&config);
            thread::spawn(move || {
                let mut conn = ServerConnection::new(config).unwrap();
                // The client resets the connection right after its Finished,
                // so errors past handshake completion are expected.
                let _ = conn.complete_io(&mut stream);
            });
        }
    });

    endpoint
}

fn run_config(endpoint: SocketAddr, peers: usize, budget: u64) -> RunConfig {
    RunConfig {
        endpoint,
        peers_per_worker: peers,
        workers: 1,
        handshake_budget: budget,
        duration_secs: 0,
        tls_version: TlsVersion::Any,
        cipher: None,
        use_tickets: false,
        latency_scope: LatencyScope::Drive,
        verify: false,
        cafile: None,
        debug: false,
    }
}

fn run_worker(
    cfg: RunConfig,
    stats: &Arc<GlobalStats>,
    merged: &Arc<MergedLatency>,
) -> anyhow::Result<()> {
    let cfg = Arc::new(cfg);
    let tls_config = cfg.tls_client_config()?;
    let mut worker = Worker::new(cfg, Arc::clone(stats), Arc::clone(merged), tls_config)?;
    worker.run()
}

#[test]
fn single_handshake_records_one_latency_sample() {
    let endpoint = spawn_server();
    let mut cfg = run_config(endpoint, 1, 1);
    cfg.latency_scope = LatencyScope::Cycle;

    let stats = Arc::new(GlobalStats::new());
    let merged = Arc::new(MergedLatency::new());
    run_worker(cfg, &stats, &merged).unwrap();

    assert_eq!(stats.tot_tls_handshakes.load(Relaxed), 1);
    assert_eq!(stats.error_count.load(Relaxed), 0);
    assert_eq!(merged.len(), 1);
    assert!(merged.summary().unwrap().min >= 1, "latency is at least 1us");
}

#[test]
fn budget_is_reached_across_concurrent_peers() {
    let endpoint = spawn_server();
    let stats = Arc::new(GlobalStats::new());
    let merged = Arc::new(MergedLatency::new());

    run_worker(run_config(endpoint, 4, 20), &stats, &merged).unwrap();

    assert!(stats.tot_tls_handshakes.load(Relaxed) >= 20);
    assert_eq!(stats.error_count.load(Relaxed), 0);
    // Four peers fit inside the initial slow-start grant, so the full
    // complement was live and the statistics latch must have flipped.
    assert!(stats.start_stats.load(Relaxed));
}

#[test]
fn slow_start_ramps_past_the_initial_grant() {
    let endpoint = spawn_server();
    let stats = Arc::new(GlobalStats::new());
    let merged = Arc::new(MergedLatency::new());

    // More peers than the slow-start grant: the worker must earn the rest
    // one per completed handshake before the latch can flip.
    run_worker(run_config(endpoint, 16, 200), &stats, &merged).unwrap();

    assert!(stats.tot_tls_handshakes.load(Relaxed) >= 200);
    assert!(stats.start_stats.load(Relaxed));
}

#[test]
fn two_workers_share_one_budget() {
    let endpoint = spawn_server();
    let stats = Arc::new(GlobalStats::new());
    let merged = Arc::new(MergedLatency::new());

    let mut handles = Vec::new();
    for _ in 0..2 {
        let stats = Arc::clone(&stats);
        let merged = Arc::clone(&merged);
        handles.push(thread::spawn(move || {
            run_worker(run_config(endpoint, 2, 40), &stats, &merged)
        }));
    }
    for handle in handles {
        handle.join().unwrap().unwrap();
    }

    assert!(stats.tot_tls_handshakes.load(Relaxed) >= 40);
}

#[test]
fn session_tickets_do_not_break_the_cycle() {
    let endpoint = spawn_server();
    let mut cfg = run_config(endpoint, 2, 10);
    cfg.use_tickets = true;

    let stats = Arc::new(GlobalStats::new());
    let merged = Arc::new(MergedLatency::new());
    run_worker(cfg, &stats, &merged).unwrap();

    assert!(stats.tot_tls_handshakes.load(Relaxed) >= 10);
}

#[test]
fn refused_target_is_fatal_before_any_success() {
    // Grab a loopback port and close it again, so connects are refused.
    let endpoint = TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap();

    let stats = Arc::new(GlobalStats::new());
    let merged = Arc::new(MergedLatency::new());
    let err = run_worker(run_config(endpoint, 1, 1), &stats, &merged).unwrap_err();

    let message = format!("{err:#}");
    assert!(
        message.contains("cannot establish even one TCP connection"),
        "unexpected error: {message}"
    );
    assert_eq!(stats.tot_tls_handshakes.load(Relaxed), 0);
}

#[test]
fn termination_request_stops_a_worker_promptly() {
    let endpoint = spawn_server();
    let stats = Arc::new(GlobalStats::new());
    let merged = Arc::new(MergedLatency::new());

    {
        let stats = Arc::clone(&stats);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(300));
            stats.request_terminate();
        });
    }

    let started = Instant::now();
    run_worker(run_config(endpoint, 2, u64::MAX), &stats, &merged).unwrap();

    assert!(
        started.elapsed() < Duration::from_secs(2),
        "worker kept running after termination"
    );
    assert!(stats.tot_tls_handshakes.load(Relaxed) > 0);
}

#[test]
fn termination_before_start_is_a_clean_noop() {
    let endpoint = spawn_server();
    let stats = Arc::new(GlobalStats::new());
    let merged = Arc::new(MergedLatency::new());

    stats.request_terminate();
    run_worker(run_config(endpoint, 4, u64::MAX), &stats, &merged).unwrap();

    assert_eq!(stats.tot_tls_handshakes.load(Relaxed), 0);
    assert!(merged.is_empty());
}
