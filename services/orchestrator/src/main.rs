//! chainboxd
//!
//! Runs the tenant gateway by default. The hidden `relay` subcommand is what
//! relayer workers execute: the supervisor re-launches this binary inside the
//! relayer's sandbox with the two node ports.

use std::sync::Arc;

use anyhow::{Context, Result};
use chainbox_evm::{ChainClient, ReceiptPolicy, RpcChainClient, RpcClient};
use chainbox_orchestrator::{
    config::{Config, RelaySettings},
    gateway::{BalanceBelowCheck, Gateway},
    http,
    proxy::{NodeProxy, NodeTransport},
    registry::InstanceRegistry,
    relay::{RelayConfig, RelayPair},
    sandbox::{SandboxRuntime, WorkerRuntime},
    supervisor::{ProcessSupervisor, SupervisorConfig},
};
use clap::{Parser, Subcommand};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Sandboxed per-tenant chain nodes with a bridge relayer.
#[derive(Debug, Parser)]
#[command(name = "chainboxd")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the tenant gateway (default).
    Serve,

    /// Relay bridge messages between two local nodes.
    #[command(hide = true)]
    Relay {
        /// Port of the L1 node.
        #[arg(long)]
        l1_port: u16,

        /// Port of the L2 node.
        #[arg(long)]
        l2_port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve().await,
        Commands::Relay { l1_port, l2_port } => relay(l1_port, l2_port).await,
    }
}

fn init_tracing(log_level: &str) {
    // prefer RUST_LOG, fall back to CHAINBOX_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| log_level.into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

async fn serve() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config.log_level);

    info!("Starting chainbox orchestrator");
    info!(
        listen_addr = %config.listen_addr,
        workdir = %config.workdir.display(),
        ports = ?config.port_range,
        "Configuration loaded"
    );
    if !config.secret_pinned {
        warn!("CHAINBOX_SECRET_KEY not set, instance identities change on every restart");
    }
    if config.relay.relayer_key.is_none() {
        warn!("CHAINBOX_RELAYER_KEY not set, relayer workers will exit immediately");
    }
    if config.solve.token.is_none() {
        warn!("CHAINBOX_SOLVE_TOKEN not set, completion checks will fail");
    }

    let registry = Arc::new(InstanceRegistry::new(
        config.workdir.clone(),
        config.secret.clone(),
        config.port_range.clone(),
    ));
    if config.wipe_on_start {
        registry.wipe().context("Failed to wipe workspaces")?;
    }

    let transport = NodeTransport::new(config.relay.node_host.clone())?;
    let runtime: Arc<dyn WorkerRuntime> = Arc::new(SandboxRuntime::new(transport.clone()));
    let supervisor_config =
        SupervisorConfig::from_config(&config).context("Failed to resolve own executable")?;
    let supervisor = Arc::new(ProcessSupervisor::new(
        Arc::clone(&registry),
        runtime,
        supervisor_config,
    ));
    let proxy = Arc::new(NodeProxy::new(
        registry,
        transport,
        config.cast_binary.clone(),
    ));
    let solve = Arc::new(BalanceBelowCheck::from(config.solve.clone()));
    let gateway = Arc::new(Gateway::new(supervisor, proxy, solve));

    let app = http::router(gateway);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, "Listening for connections");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);
    info!("Orchestrator shutdown complete");
    Ok(())
}

async fn relay(l1_port: u16, l2_port: u16) -> Result<()> {
    init_tracing("info");

    let settings = RelaySettings::from_env()?;
    let signer = Arc::new(settings.signer()?);
    info!(l1_port, l2_port, relayer = ?signer.address(), "Starting relay worker");

    let receipts = ReceiptPolicy {
        timeout: settings.receipt_timeout,
        ..ReceiptPolicy::default()
    };
    let client = |port: u16| -> Result<Arc<dyn ChainClient>> {
        let rpc = RpcClient::new(format!("http://{}:{}/", settings.node_host, port))?;
        Ok(Arc::new(
            RpcChainClient::new(rpc)
                .with_signer(Arc::clone(&signer))
                .with_receipt_policy(receipts),
        ))
    };

    let pair = RelayPair::spawn(
        client(l1_port)?,
        client(l2_port)?,
        RelayConfig {
            bridge: settings.bridge,
            poll_interval: settings.poll_interval,
            dispatch_pause: settings.dispatch_pause,
        },
    );

    let mut terminate = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }

    info!("Stopping relay worker");
    pair.stop();
    pair.join().await;
    Ok(())
}
