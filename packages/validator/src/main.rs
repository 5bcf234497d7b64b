mod bus;
mod cli;
mod config;
mod consensus;
mod db;
mod finalizer;
mod metrics;
mod observers;
mod party;
mod session;
mod signing;
mod tss;

use clap::Parser;
use cli::{Cli, Command};
use config::Config;
use party::Party;

fn main() -> eyre::Result<()> {
    // Install color-eyre for better error reporting
    color_eyre::install()?;

    // Run the async main
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> eyre::Result<()> {
    init_logging();

    let cli = Cli::parse();
    let config = Config::load()?;
    tracing::info!(
        party_id = config.party.party_id,
        total_parties = config.party.total_parties,
        threshold = config.party.threshold,
        "Configuration loaded"
    );

    match cli.command {
        Command::Keygen => cli::keygen(config).await,
        Command::Party => run_party(config).await,
        Command::DepositEvm {
            amount,
            receiver,
            native,
        } => cli::deposit_evm(config, &amount, &receiver, native).await,
        Command::DepositAsset { amount, receiver } => {
            cli::deposit_asset(config, &amount, &receiver).await
        }
    }
}

async fn run_party(config: Config) -> eyre::Result<()> {
    let party = Party::new(config).await?;

    // Shutdown channel wired to SIGINT/SIGTERM
    let (shutdown_tx, shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        let _ = shutdown_tx.send(()).await;
    });

    party.run(shutdown_rx).await?;
    tracing::info!("Validator stopped");
    Ok(())
}

/// Initialize tracing/logging with structured output
fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tss_validator=debug"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(filter)
        .init();
}

/// Wait for shutdown signals (SIGINT/SIGTERM)
async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
