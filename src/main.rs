// =============================================================================
// meridian — run one pipeline service
// =============================================================================

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use meridian::bus::EventBus;
use meridian::config::Settings;
use meridian::services::{
    data::DataService, execution::ExecutionService, monitor::MonitorService,
    reconciliation::ReconciliationService, risk::RiskService, shutdown_channel,
    strategy::StrategyService,
};
use meridian::store::TradingStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ServiceName {
    Data,
    Strategy,
    Risk,
    Execution,
    Reconciliation,
    Monitor,
}

#[derive(Parser, Debug)]
#[command(name = "meridian")]
#[command(about = "Run one service of the trading pipeline")]
struct Cli {
    /// Service to launch.
    #[arg(value_enum)]
    service: ServiceName,

    /// Path to the YAML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Logging level when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv::dotenv();
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone())),
        )
        .init();

    // Setup-phase failures (config, bus, store) terminate the process;
    // everything after this point is handled inside the service loops.
    let settings = Settings::load(cli.config.as_deref())?;
    let bus = EventBus::connect(&settings.redis)
        .await
        .map_err(|e| anyhow::anyhow!("bus connect failed: {e}"))?;

    let (handle, shutdown) = shutdown_channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("shutdown signal received; stopping");
            handle.stop();
        }
    });

    info!(service = ?cli.service, "service starting");
    match cli.service {
        ServiceName::Data => {
            DataService::new(settings, bus, shutdown)?.run().await?;
        }
        ServiceName::Strategy => {
            StrategyService::new(settings, bus, shutdown).run().await?;
        }
        ServiceName::Risk => {
            let store = TradingStore::connect(&settings.database).await?;
            RiskService::new(settings, bus, store, shutdown)
                .run()
                .await?;
        }
        ServiceName::Execution => {
            let store = TradingStore::connect(&settings.database).await?;
            ExecutionService::new(settings, bus, store, shutdown)?
                .run()
                .await?;
        }
        ServiceName::Reconciliation => {
            let store = TradingStore::connect(&settings.database).await?;
            ReconciliationService::new(settings, bus, store, shutdown)?
                .run()
                .await?;
        }
        ServiceName::Monitor => {
            MonitorService::new(settings, shutdown).run().await?;
        }
    }

    info!("service exited cleanly");
    Ok(())
}
