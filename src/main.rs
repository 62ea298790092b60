//! gatelb - An HTTP reverse-proxy load balancer
//!
//! Usage:
//!     gatelb --config <path>
//!
//! See --help for more options.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use gatelb::config::{load_config, Config};
use gatelb::frontend::{FrontendListener, SessionCookie};
use gatelb::metrics::AdminServer;
use gatelb::util::{init_logging, wait_for_signal, ShutdownSignal};
use gatelb::LoadBalancer;

/// An HTTP reverse-proxy load balancer written in Rust.
#[derive(Parser, Debug)]
#[command(name = "gatelb")]
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

    // CLI overrides config
    let log_level = cli
        .log_level
        .as_deref()
        .unwrap_or(&config.global.log_level);

    init_logging(log_level, &config.global.log_format);

    if cli.validate {
        info!("Configuration is valid");
        println!("Configuration is valid.");
        println!("  Listen: {}", config.listen);
        println!("  Algorithm: {}", config.algorithm);
        println!("  Servers: {}", config.servers.len());
        for server in &config.servers {
            println!(
                "    - {} {}://{}:{} (weight {})",
                server.id, server.scheme, server.host, server.port, server.weight
            );
        }
        return Ok(());
    }

    info!(
        config_path = %cli.config.display(),
        listen = %config.listen,
        algorithm = %config.algorithm,
        servers = config.servers.len(),
        "gatelb starting"
    );

    for server in &config.servers {
        info!(
            id = %server.id,
            host = %server.host,
            port = server.port,
            weight = server.weight,
            "configured server"
        );
    }

    run(config)
}

/// Run the load balancer with the given configuration.
fn run(config: Config) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    runtime.block_on(async { run_async(config).await })
}

async fn run_async(config: Config) -> Result<()> {
    let shutdown = ShutdownSignal::new();

    let balancer = Arc::new(
        LoadBalancer::new(&config, shutdown.clone()).context("failed to build load balancer")?,
    );

    let mut handles = Vec::new();
    if let Some(handle) = balancer.start() {
        handles.push(handle);
    }

    let listener = FrontendListener::bind(
        config.listen,
        Arc::clone(&balancer),
        SessionCookie::from_config(&config.session_affinity),
    )
    .await
    .with_context(|| format!("failed to bind proxy listener on {}", config.listen))?;

    let shutdown_rx = shutdown.subscribe();
    handles.push(tokio::spawn(async move {
        listener.run(shutdown_rx).await;
    }));

    if config.admin.enabled {
        let admin = AdminServer::bind(
            config.admin.address,
            &config.admin.metrics_path,
            Arc::clone(&balancer),
        )
        .await
        .with_context(|| format!("failed to bind admin server on {}", config.admin.address))?;

        let shutdown_rx = shutdown.subscribe();
        handles.push(tokio::spawn(async move {
            admin.run(shutdown_rx).await;
        }));
    }

    info!("gatelb is running");
    info!("press Ctrl+C to stop");

    wait_for_signal().await;
    info!("received shutdown signal");

    shutdown.shutdown();

    for handle in handles {
        let _ = handle.await;
    }

    info!("gatelb shut down complete");
    Ok(())
}
