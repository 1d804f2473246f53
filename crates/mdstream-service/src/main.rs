//! mdstream - cross-exchange market data streaming.

use anyhow::Result;
use clap::Parser;
use tracing::info;

/// Stream Binance and KuCoin market data and aggregate tickers.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path (can also be set via MDSTREAM_CONFIG env var)
    #[arg(short, long)]
    config: Option<String>,

    /// Subscribe every configured symbol and timeframe on start
    #[arg(long)]
    major_pairs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Must run before any TLS connection.
    mdstream_ws::init_crypto();

    let args = Args::parse();
    mdstream_telemetry::init_logging()?;

    info!("Starting mdstream v{}", env!("CARGO_PKG_VERSION"));

    // CLI arg > MDSTREAM_CONFIG > default
    let config_path = args
        .config
        .or_else(|| std::env::var("MDSTREAM_CONFIG").ok())
        .unwrap_or_else(|| "config/default.toml".to_string());

    info!(config_path = %config_path, "Loading configuration");
    let config = mdstream_service::ServiceConfig::load(&config_path)?;
    config.validate()?;
    info!(exchanges = ?config.enabled_exchanges(), "Configuration loaded");

    let service = mdstream_service::UnifiedService::new(&config)?;
    service.start().await;

    if args.major_pairs {
        let added = service.subscribe_major_pairs()?;
        info!(added, "Major pairs subscribed");
    }

    let mut report = tokio::time::interval(config.health_check_interval());
    report.tick().await;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Shutdown requested");
                break;
            }
            _ = report.tick() => {
                for t in service.aggregated_tickers() {
                    info!(
                        symbol = %t.symbol,
                        average_price = t.average_price,
                        spread = t.price_spread,
                        volume = t.total_volume_24h,
                        exchanges = ?t.exchanges(),
                        "Aggregated ticker"
                    );
                }
                info!(healthy = service.is_healthy(), "Health");
            }
        }
    }

    service.stop().await;
    Ok(())
}
