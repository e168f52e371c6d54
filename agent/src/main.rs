use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use culvert_agent::config::AgentConfig;
use culvert_agent::executor::ExecutorRegistry;
use culvert_agent::tunnel;
use culvert_wire::TransactionRegistry;

/// culvert agent: connects out to the controller and serves tunneled
/// requests against local endpoints.
#[derive(Parser)]
#[command(name = "culvert-agent", version)]
struct Cli {
    /// Agent configuration file.
    #[arg(long = "configFile", default_value = "/app/config/agent.yaml")]
    config_file: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(version = env!("CARGO_PKG_VERSION"), "agent starting");

    // reqwest's rustls build enables a second crypto provider; pin the
    // process-level default before any TLS config is assembled.
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let config = match AgentConfig::load(&cli.config_file) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!(error = %e, "cannot load configuration");
            std::process::exit(1);
        }
    };

    let registry = Arc::new(TransactionRegistry::new());
    let executors = Arc::new(ExecutorRegistry::from_config(&config.endpoints, registry.clone()).await);
    let shutdown = CancellationToken::new();

    let client = tokio::spawn(tunnel::run(
        config,
        executors,
        registry,
        shutdown.clone(),
    ));

    wait_for_shutdown_signal().await;
    info!("shutting down");
    shutdown.cancel();
    let _ = client.await;
    info!("exiting cleanly");
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM");
        tokio::select! {
            _ = ctrl_c => info!("received SIGINT"),
            _ = sigterm.recv() => info!("received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("received SIGINT");
    }
}
