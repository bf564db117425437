//! metlb - a sticky, rate-aware load balancer for metric-ingest servers
//!
//! Usage:
//!     metlb --config <path>
//!
//! See --help for more options.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

use metlb::backend::BalancedHost;
use metlb::config::{load_config, Config};
use metlb::frontend::RelayListener;
use metlb::health::HealthChecker;
use metlb::metrics::{MetricsCollector, MetricsServer};
use metlb::relay::{ClientPool, RelayHandler};
use metlb::resolver::BalancedResolver;
use metlb::util::{init_logging, ShutdownSignal};

/// A sticky, rate-aware load balancer for metric-ingest servers.
#[derive(Parser, Debug)]
#[command(name = "metlb")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(&cli.config).with_context(|| {
        format!(
            "failed to load configuration from '{}'",
            cli.config.display()
        )
    })?;

    let log_level = cli
        .log_level
        .as_deref()
        .unwrap_or(&config.global.log_level);
    init_logging(log_level, &config.global.log_format);

    if cli.validate {
        println!("Configuration is valid.");
        println!("  Listen: {}", config.listen);
        println!("  Assignment file: {}", config.assignment_file.display());
        println!("  Hosts: {}", config.hosts.len());
        for host in &config.hosts {
            println!("    - {}:{}", host.host, host.tcp_port);
        }
        return Ok(());
    }

    info!(
        config_path = %cli.config.display(),
        listen = %config.listen,
        hosts = config.hosts.len(),
        "metlb starting"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    runtime.block_on(run(config))
}

/// Wire up and run the balancer until interrupted.
async fn run(config: Config) -> Result<()> {
    let shutdown = ShutdownSignal::new();
    let metrics = MetricsCollector::new();

    let hosts: Vec<Arc<BalancedHost>> = config
        .hosts
        .iter()
        .map(|host| Arc::new(BalancedHost::from_config(host)))
        .collect();

    let resolver = Arc::new(BalancedResolver::new(
        hosts.clone(),
        config.assignment_file.clone(),
        config.balance.clone(),
        metrics.clone(),
    ));
    resolver.spawn_maintenance(&shutdown);

    let checker = Arc::new(HealthChecker::new(
        hosts,
        config.health_check.clone(),
        metrics.clone(),
    ));
    tokio::spawn(Arc::clone(&checker).run(shutdown.subscribe()));

    let pool = Arc::new(ClientPool::new(config.pool.clone(), metrics.clone()));
    let handler = Arc::new(RelayHandler::new(
        Arc::clone(&resolver),
        pool,
        config.relay.clone(),
        metrics.clone(),
    ));

    let listener = RelayListener::bind(config.listen, handler, shutdown.clone())
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    tokio::spawn(listener.run());

    if config.global.metrics.enabled {
        let server = MetricsServer::new(
            config.global.metrics.address,
            config.global.metrics.path.clone(),
            metrics,
        );
        tokio::spawn(server.run(shutdown.subscribe()));
    }

    info!("metlb is running");
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received shutdown signal"),
        Err(error) => error!(%error, "failed to listen for shutdown signal"),
    }

    shutdown.shutdown();
    // One final snapshot so a clean restart resumes from the current pins.
    resolver.save_assignments();
    info!("metlb shutting down");
    Ok(())
}
