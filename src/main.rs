// =============================================================================
// perp-live-core — Main Entry Point
// =============================================================================
//
// Thin binary shell around the library: load config, build the exchange
// client, hand both to `Engine` along with the strategy this binary was built
// to run, and save config back on a clean shutdown. The engine always starts
// in Demo + Paused mode; switching to Live trading is an explicit operator
// action outside this crate's scope.
// =============================================================================

mod audit;
mod binance;
mod config;
mod engine;
mod errors;
mod idempotency;
mod indicators;
mod market_data;
mod portfolio;
mod risk;
mod strategy;
mod symbol_context;
mod types;
mod user_stream;

use anyhow::{bail, Context, Result};
use tracing_subscriber::EnvFilter;

use crate::binance::client::ExchangeClient;
use crate::config::RuntimeConfig;
use crate::engine::Engine;
use crate::errors::ConfigError;
use crate::strategy::{Bar, Strategy, StreamBoundStrategyContext};

const CONFIG_PATH: &str = "runtime_config.json";

/// Placeholder strategy this binary ships with: never trades. Strategy
/// authoring is outside this crate's scope (see the crate's design notes) —
/// operators supply their own `Strategy` implementation and link it in place
/// of this one.
struct NoopStrategy;

impl Strategy for NoopStrategy {
    fn initialize(&mut self, ctx: &StreamBoundStrategyContext) {
        tracing::info!(symbol = %ctx.symbol, interval = %ctx.interval, "NoopStrategy initialized, no trades will be placed");
    }

    fn on_bar(&mut self, _ctx: &StreamBoundStrategyContext, _bar: &Bar) {}
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    tracing::info!("perp-live-core starting up");

    let mut config = RuntimeConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        RuntimeConfig::default()
    });
    config.force_safe_startup();

    if let Ok(syms) = std::env::var("PERP_SYMBOLS") {
        config.symbols = syms.split(',').map(|s| s.trim().to_uppercase()).filter(|s| !s.is_empty()).collect();
    }

    let api_key = std::env::var("BINANCE_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("BINANCE_API_SECRET").unwrap_or_default();
    if api_key.is_empty() || api_secret.is_empty() {
        bail!(ConfigError::MissingCredentials);
    }
    let exchange = ExchangeClient::new(api_key, api_secret);

    tracing::info!(
        symbols = ?config.symbols,
        trading_mode = %config.trading_mode,
        account_mode = %config.account_mode,
        "engine starting in SAFE mode (Demo + Paused)"
    );

    let engine = Engine::new(exchange, config.clone(), Box::new(NoopStrategy));
    let result = engine.run().await;

    if let Err(e) = config.save(CONFIG_PATH) {
        tracing::error!(error = %e, "failed to save runtime config on shutdown");
    }

    result.context("engine run failed")?;
    tracing::info!("perp-live-core shut down complete");
    Ok(())
}
