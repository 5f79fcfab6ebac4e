#![forbid(unsafe_code)]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::float_cmp)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use relay_core::attestation::{self, AttestationProof};
use relay_core::{now_ms, Score, Stamp, ValidatedRelay};
use relay_node::config::{self, RelayNodeConfig};
use relay_node::feed::build_feed;
use relay_node::http_server::{self, AppState};
use relay_node::scheduler::DistributionScheduler;
use relay_node::wiring::{build_services, Collaborators, LedgerMode, Services};
use relay_storage::WorkflowStorage;
use serde::Serialize;
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Relay rewards node")]
struct Args {
    /// Path to a TOML config file. If omitted, uses `RELAY_NODE_CONFIG`.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Ledger mode:
    /// - mock: offline in-memory collaborators (default)
    /// - http: real HTTP adapters (requires config and the `ledger-http` feature)
    #[arg(long, value_enum, default_value_t = LedgerMode::Mock)]
    ledger_mode: LedgerMode,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Long-running service: scheduler (when enabled) plus health/status/metrics.
    Run,

    /// Run one distribution epoch to a terminal result.
    Distribute {
        /// Epoch stamp; defaults to the current time in milliseconds.
        #[arg(long)]
        stamp: Option<Stamp>,
        /// JSON array of scores.
        #[arg(long)]
        scores: PathBuf,
    },

    /// Evaluate claims and reconcile families for validated relays.
    Claim {
        /// JSON array of validated relays.
        #[arg(long)]
        relays: PathBuf,
    },

    /// Check one hardware attestation signature (no uniqueness checks).
    VerifyAttestation(VerifyAttestationArgs),

    /// Epoch checkpoints and results.
    Epoch {
        #[command(subcommand)]
        cmd: EpochCommand,
    },

    /// Verified hardware utilities.
    Hardware {
        #[command(subcommand)]
        cmd: HardwareCommand,
    },
}

#[derive(Debug, clap::Args)]
struct VerifyAttestationArgs {
    #[arg(long)]
    node_id: String,
    #[arg(long)]
    nft_id: u16,
    #[arg(long)]
    device_serial: String,
    #[arg(long)]
    atec_serial: String,
    #[arg(long)]
    fingerprint: String,
    #[arg(long)]
    address: String,
    /// Raw X || Y public key, hex.
    #[arg(long)]
    public_key: String,
    /// Raw r || s signature, hex.
    #[arg(long)]
    signature: String,
}

#[derive(Debug, Subcommand)]
enum EpochCommand {
    /// Result of a finished epoch, or the checkpoint of one in flight.
    Status {
        #[arg(long)]
        stamp: Stamp,
    },
    /// Recent results (newest first) and every in-flight checkpoint.
    List {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[derive(Debug, Subcommand)]
enum HardwareCommand {
    /// Recent attestation failures, newest first.
    Failures {
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// The verified record holding a device serial.
    Lookup {
        #[arg(long)]
        device_serial: String,
    },
}

#[derive(Debug, Serialize)]
struct EpochListing {
    in_flight: Vec<relay_core::EpochCheckpoint>,
    finished: Vec<relay_core::EpochResult>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let cfg_path = resolve_config_path(args.config.as_deref());
    let cfg = cfg_path
        .as_deref()
        .map(config::load_config)
        .transpose()
        .unwrap_or_else(|e| exit_err(&e))
        .unwrap_or_default();

    init_logging(&cfg);

    let command = args.command.unwrap_or(Command::Run);
    if let Command::VerifyAttestation(a) = &command {
        print_json(&verify_attestation(a));
        return;
    }

    info!(node = %cfg.node.label, ledger_mode = ?args.ledger_mode, "starting relay-node");

    let storage = WorkflowStorage::open(&cfg.storage.db_dir).unwrap_or_else(|e| exit_err(&e.to_string()));

    match command {
        Command::Run => run(&cfg, args.ledger_mode, storage).await,
        Command::Distribute { stamp, scores } => {
            let scores: Vec<Score> = read_json(&scores);
            let services = services(&cfg, args.ledger_mode, storage);
            let stamp = stamp.unwrap_or_else(now_ms);
            let result = services
                .coordinator
                .start_epoch(stamp, scores)
                .await
                .unwrap_or_else(|e| exit_err(&e.to_string()));
            flush(&services.storage);
            print_json(&result);
        }
        Command::Claim { relays } => {
            let relays: Vec<ValidatedRelay> = read_json(&relays);
            let services = services(&cfg, args.ledger_mode, storage);
            let outcome = services.claim_gate.process(&relays).await;
            flush(&services.storage);
            print_json(&outcome);
        }
        Command::Epoch { cmd } => match cmd {
            EpochCommand::Status { stamp } => {
                if let Some(result) = storage
                    .epochs
                    .load_result(stamp)
                    .unwrap_or_else(|e| exit_err(&e.to_string()))
                {
                    print_json(&result);
                } else if let Some(cp) = storage
                    .epochs
                    .load_checkpoint(stamp)
                    .unwrap_or_else(|e| exit_err(&e.to_string()))
                {
                    print_json(&cp);
                } else {
                    exit_err(&format!("no epoch recorded for stamp {stamp}"));
                }
            }
            EpochCommand::List { limit } => {
                let listing = EpochListing {
                    in_flight: storage
                        .epochs
                        .list_checkpoints()
                        .unwrap_or_else(|e| exit_err(&e.to_string())),
                    finished: storage
                        .epochs
                        .list_results(limit)
                        .unwrap_or_else(|e| exit_err(&e.to_string())),
                };
                print_json(&listing);
            }
        },
        Command::Hardware { cmd } => match cmd {
            HardwareCommand::Failures { limit } => {
                let failures = storage
                    .hardware
                    .list_failures(limit)
                    .unwrap_or_else(|e| exit_err(&e.to_string()));
                print_json(&failures);
            }
            HardwareCommand::Lookup { device_serial } => {
                match storage
                    .hardware
                    .get_by_device_serial(&device_serial)
                    .unwrap_or_else(|e| exit_err(&e.to_string()))
                {
                    Some(record) => print_json(&record),
                    None => exit_err(&format!("device serial {device_serial} is not verified")),
                }
            }
        },
        Command::VerifyAttestation(_) => {}
    }
}

async fn run(cfg: &RelayNodeConfig, mode: LedgerMode, storage: WorkflowStorage) {
    let addr: SocketAddr = cfg
        .server
        .bind_address
        .parse()
        .unwrap_or_else(|e| exit_err(&format!("invalid server.bind_address: {e}")));
    let ownership = storage
        .task_ownership(cfg.node.holder_id(), cfg.scheduler.lease_ms)
        .unwrap_or_else(|e| exit_err(&e.to_string()));

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown requested");
        let _ = stop_tx.send(true);
    });

    let scheduler = if cfg.scheduler.enabled {
        let feed_cfg = cfg.scheduler.feed.as_ref().unwrap_or_else(|| {
            exit_err("scheduler.enabled requires a [scheduler.feed] section")
        });
        let feed = build_feed(feed_cfg).unwrap_or_else(|e| exit_err(&format!("{e:#}")));
        let services = services(cfg, mode, storage.clone());
        let scheduler = DistributionScheduler::new(
            services.coordinator,
            ownership.clone(),
            feed,
            Duration::from_secs(cfg.scheduler.interval_secs),
        );
        let tick = Duration::from_millis(cfg.scheduler.tick_ms.max(1));
        Some(tokio::spawn(scheduler.run(tick, stopped(stop_rx.clone()))))
    } else {
        info!("scheduler disabled; serving status endpoints only");
        None
    };

    let state = AppState {
        node_label: cfg.node.label.clone(),
        storage: storage.clone(),
        ownership,
        metrics_enabled: cfg.server.metrics_enabled,
        start_instant: Instant::now(),
    };
    if let Err(e) = http_server::serve(addr, state, stopped(stop_rx)).await {
        exit_err(&format!("http server failed: {e}"));
    }

    if let Some(handle) = scheduler {
        if let Err(e) = handle.await {
            warn!(error = %e, "scheduler task ended abnormally");
        }
    }
    flush(&storage);
    info!("relay-node stopped");
}

fn services(cfg: &RelayNodeConfig, mode: LedgerMode, storage: WorkflowStorage) -> Services {
    let collab = Collaborators::for_mode(mode, cfg).unwrap_or_else(|e| exit_err(&e));
    build_services(cfg, &collab, storage)
}

fn verify_attestation(a: &VerifyAttestationArgs) -> bool {
    let proof = AttestationProof {
        node_id: a.node_id.clone(),
        nft_id: a.nft_id,
        device_serial: a.device_serial.clone(),
        atec_serial: a.atec_serial.clone(),
        fingerprint: a.fingerprint.clone(),
        address: a.address.clone(),
        public_key: a.public_key.clone(),
        signature: a.signature.clone(),
    };
    attestation::verify(&proof)
}

async fn stopped(mut rx: watch::Receiver<bool>) {
    loop {
        let done = *rx.borrow();
        if done || rx.changed().await.is_err() {
            return;
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> T {
    let raw = std::fs::read_to_string(path)
        .unwrap_or_else(|e| exit_err(&format!("failed to read {}: {e}", path.display())));
    serde_json::from_str(&raw)
        .unwrap_or_else(|e| exit_err(&format!("invalid json in {}: {e}", path.display())))
}

fn print_json<T: Serialize>(v: &T) {
    match serde_json::to_string_pretty(v) {
        Ok(s) => println!("{s}"),
        Err(e) => exit_err(&format!("failed to encode output: {e}")),
    }
}

fn flush(storage: &WorkflowStorage) {
    if let Err(e) = storage.flush() {
        warn!(error = %e, "storage flush failed");
    }
}

fn resolve_config_path(cli: Option<&Path>) -> Option<String> {
    if let Some(p) = cli {
        return Some(p.to_string_lossy().to_string());
    }
    std::env::var("RELAY_NODE_CONFIG").ok()
}

fn init_logging(cfg: &RelayNodeConfig) {
    // Prefer explicit config logging.level unless user set RUST_LOG.
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cfg.logging.level.clone()));

    if cfg.logging.format.eq_ignore_ascii_case("json") {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

fn exit_err(msg: &str) -> ! {
    eprintln!("{msg}");
    std::process::exit(2);
}
