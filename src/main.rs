use anyhow::{Context, Result};
use autotrader::alpaca::{AlpacaClient, AlpacaSettings};
use autotrader::config::{settings_from_env, BrokerKind, TraderConfig};
use autotrader::engine::Engine;
use autotrader::ledger::TradeLedger;
use autotrader::ports::{AccountPort, MarketDataPort, OrderPort};
use autotrader::trading212::{Trading212Client, Trading212Settings};
use clap::Parser;
use log::info;
use reqwest::Client;
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "autotrader")]
#[command(about = "Single-instrument trading loop with an adaptive take-profit target")]
struct Cli {
    /// Load settings from this dotenv file before reading the environment
    #[arg(long = "env-file", value_name = "PATH")]
    env_file: Option<PathBuf>,
    /// Run a single tick and exit
    #[arg(long)]
    once: bool,
}

type Ports = (
    Box<dyn MarketDataPort>,
    Box<dyn AccountPort>,
    Box<dyn OrderPort>,
);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.env_file.as_deref() {
        Some(path) => {
            dotenvy::from_path(path)
                .with_context(|| format!("failed to load env file {}", path.display()))?;
        }
        None => {
            dotenvy::dotenv().ok();
        }
    }
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("Starting autotrader. Not financial advice. Use at your own risk.");

    let settings = settings_from_env();
    let config = TraderConfig::from_settings_map(&settings)?;
    let http = Client::builder()
        .timeout(config.port_timeout)
        .build()
        .context("failed to construct HTTP client")?;
    let (market, account, orders) = build_ports(config.broker, &settings, http)?;
    info!(
        "Trading {} via {} (ledger {})",
        config.symbol,
        config.broker.label(),
        config.ledger_path.display()
    );

    let ledger = TradeLedger::new(config.ledger_path.clone());
    let mut engine = Engine::new(config, market, account, orders, ledger);

    if cli.once {
        let outcome = engine.tick().await;
        info!("Tick finished: {:?}", outcome);
        return Ok(());
    }

    tokio::select! {
        _ = engine.run() => {}
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for shutdown signal")?;
            info!("Shutdown signal received; stopping trading loop");
        }
    }

    Ok(())
}

fn build_ports(
    broker: BrokerKind,
    settings: &HashMap<String, String>,
    http: Client,
) -> Result<Ports> {
    // Candles always come from the Alpaca data API.
    let alpaca_settings = AlpacaSettings::from_settings_map(settings)
        .context("Alpaca credentials are required for market data")?;
    let alpaca = AlpacaClient::new(http.clone(), &alpaca_settings)?;

    match broker {
        BrokerKind::Alpaca => Ok((
            Box::new(alpaca.clone()),
            Box::new(alpaca.clone()),
            Box::new(alpaca),
        )),
        BrokerKind::Trading212 => {
            let t212_settings = Trading212Settings::from_settings_map(settings)?;
            let trading212 = Trading212Client::new(http, &t212_settings)?;
            Ok((
                Box::new(alpaca),
                Box::new(trading212.clone()),
                Box::new(trading212),
            ))
        }
    }
}
