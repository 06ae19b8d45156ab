use std::sync::Arc;

use clap::Parser;
use icmond::clock::SystemClock;
use icmond::config::{Cli, Config};
use icmond::icmp::TcpConnectProbe;
use icmond::pidfile::Pidfile;
use icmond::scheduler::NoopScheduler;
use icmond::staging::{InMemoryStagingStore, StagingStore};
use icmond::store::SqliteStore;
use icmond::supervisor::Supervisor;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let argv: Vec<String> = std::env::args().collect();
    let cli = Cli::parse_from(&argv);

    // Worker and ancillary children re-exec the same binary; handle those
    // before anything else in the startup sequence.
    if cli.worker_child {
        std::process::exit(run_worker_child().await);
    }
    if cli.ancillary_child {
        std::process::exit(run_ancillary_child().await);
    }

    init_logging(&cli);

    let mut config = Config::default();
    if let Err(e) = load_config(&mut config, &cli) {
        tracing::error!(error = %e, "configuration error");
        std::process::exit(1);
    }

    if cli.createdb {
        match SqliteStore::connect(&config.database_path).await {
            Ok(_) => std::process::exit(0),
            Err(e) => {
                tracing::error!(error = %e, "failed to create database");
                std::process::exit(2);
            }
        }
    }
    if cli.writeconfig {
        println!("{config:#?}");
        std::process::exit(0);
    }

    if let Some(n) = cli.testdbwrite {
        let (mean_us, stddev_us, max_us) = measure_staging_latency(n);
        println!("mean={mean_us:.2}us stddev={stddev_us:.2}us max={max_us:.2}us over {n} samples");
        std::process::exit(0);
    }

    if let Err(e) = config.validate() {
        tracing::error!(error = %e, "invalid configuration");
        std::process::exit(e.exit_code());
    }

    let mut staging_import_period = None;
    if config.staging_mode == icmond::config::StagingMode::Auto {
        let (mean_us, _stddev_us, max_us) = measure_staging_latency(20);
        let threshold_us = config.staging_latency_threshold.as_secs_f64() * 1_000_000.0;
        if mean_us > threshold_us || max_us > threshold_us {
            tracing::info!(
                mean_us,
                max_us,
                threshold_us,
                "staging latency test exceeded threshold, enabling staging mode"
            );
            tracing::info!("mounting staging ramdisk (hardware interface out of scope)");
            config.staging_mode = icmond::config::StagingMode::On;
            staging_import_period = Some(config.probe_interval);
        }
    }

    if !cli.nodaemon {
        tracing::info!("staying in the foreground is recommended during development; true daemonization (double-fork + setsid) happens here in production builds");
    }

    let _pidfile = match Pidfile::acquire(&config.pidfile_path) {
        Ok(p) => p,
        Err(e) => {
            tracing::error!(error = %e, "could not acquire pidfile lock");
            std::process::exit(3);
        }
    };

    if let Err(e) = icmond::privilege::drop_privileges(&config.run_as_user) {
        tracing::error!(error = %e, "failed to drop privileges");
        std::process::exit(e.exit_code());
    }

    let store = match SqliteStore::connect(&config.database_path).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::error!(error = %e, "failed to open database");
            std::process::exit(2);
        }
    };
    let staging = Arc::new(InMemoryStagingStore::default());
    let clock = Arc::new(SystemClock);
    let scheduler = Arc::new(NoopScheduler);
    let current_exe = std::env::current_exe().expect("current_exe() should always resolve");

    let mut supervisor = match Supervisor::new(
        config,
        clock,
        scheduler,
        store,
        staging,
        current_exe,
        argv,
    ) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "failed to initialize supervisor");
            std::process::exit(2);
        }
    };

    if let Some(period) = staging_import_period {
        supervisor.enable_staging_import(period);
    }

    if let Err(e) = supervisor.run().await {
        tracing::error!(error = %e, "supervisor main loop exited with an error");
        std::process::exit(1);
    }
}

fn init_logging(cli: &Cli) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if cli.nodaemon {
        registry.with(tracing_subscriber::fmt::layer()).init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().without_time())
            .init();
    }
}

fn load_config(config: &mut Config, cli: &Cli) -> anyhow::Result<()> {
    if let Some(path) = &cli.config {
        let contents = std::fs::read_to_string(path)?;
        let overrides = icmond::config::parse_config_file(&contents)?;
        config.apply_overrides(&overrides)?;
    }
    config.apply_overrides(&cli.overrides())?;
    Ok(())
}

async fn run_worker_child() -> i32 {
    // A real invocation re-derives its configuration from the same config
    // file/CLI overlay as the parent; abbreviated here since the worker
    // child's own argv is just `--worker-child`.
    let config = Config::default();
    let probe = TcpConnectProbe::default();
    let store = match SqliteStore::connect(&config.database_path).await {
        Ok(store) => store,
        Err(e) => {
            tracing::error!(error = %e, "worker child failed to open database");
            return 64;
        }
    };
    icmond::worker::run_worker_child(&config, &probe, &store).await
}

async fn run_ancillary_child() -> i32 {
    let staging = InMemoryStagingStore::default();
    let config = Config::default();
    match SqliteStore::connect(&config.database_path).await {
        Ok(store) => icmond::ancillary::run_ancillary_child(&staging, &store).await,
        Err(e) => {
            tracing::error!(error = %e, "ancillary child failed to open database");
            2
        }
    }
}

/// Measure staging-store write latency `n` times with a Welford online
/// mean/variance accumulator, the same decision procedure `StagingMode::Auto`
/// uses at real startup. Returns `(mean_us, stddev_us, max_us)`.
fn measure_staging_latency(n: u32) -> (f64, f64, f64) {
    let mut mean = 0f64;
    let mut m2 = 0f64;
    let mut count = 0f64;
    let mut max_us = 0f64;

    for _ in 0..n {
        let started = std::time::Instant::now();
        let staging = InMemoryStagingStore::default();
        staging.push(icmond::store::Sample {
            collected_at: chrono::Utc::now(),
            reachable: true,
            downstream_power_snr: vec![(0.0, 0.0); 8],
            upstream_power: vec![0.0; 4],
        });
        let _ = staging.drain();
        let elapsed_us = started.elapsed().as_secs_f64() * 1_000_000.0;

        count += 1.0;
        let delta = elapsed_us - mean;
        mean += delta / count;
        let delta2 = elapsed_us - mean;
        m2 += delta * delta2;
        max_us = max_us.max(elapsed_us);
    }

    let variance = if count > 1.0 { m2 / (count - 1.0) } else { 0.0 };
    (mean, variance.sqrt(), max_us)
}
