// =============================================================================
// Engine — ties every subsystem together and drives the tick dispatch loop
// =============================================================================
//
// Owns one `ExchangeClient`, one `UserStreamHub`, one `PortfolioContext` and a
// `SymbolContext`/`IndicatorContext`/`PriceFeed`/`BookTickerFeed` quartet per
// tradable symbol. `start` runs the eight-step bring-up sequence; `run` then
// drains a single merged tick channel until `stop()` is called.
// =============================================================================

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::audit::AuditLog;
use crate::binance::client::ExchangeClient;
use crate::config::RuntimeConfig;
use crate::indicators::IndicatorContext;
use crate::market_data::candle_buffer::{CandleBuffer, CandleKey};
use crate::market_data::price_feed::{PriceFeed, PriceTick};
use crate::market_data::BookTickerFeed;
use crate::portfolio::PortfolioContext;
use crate::strategy::{Bar, Strategy, StreamBoundStrategyContext};
use crate::symbol_context::{PortfolioGate, SymbolContext};
use crate::user_stream::UserStreamHub;

struct SymbolRuntime {
    ctx: Arc<SymbolContext>,
    indicators: Arc<IndicatorContext>,
    book_ticker: Arc<BookTickerFeed>,
}

pub struct Engine {
    exchange: ExchangeClient,
    config: RuntimeConfig,
    strategy: Box<dyn Strategy>,
    symbols: HashMap<String, SymbolRuntime>,
    portfolio: Option<Arc<PortfolioContext>>,
    hub: Option<Arc<UserStreamHub>>,
    pub audit: AuditLog,
}

impl Engine {
    pub fn new(exchange: ExchangeClient, config: RuntimeConfig, strategy: Box<dyn Strategy>) -> Self {
        Self {
            exchange,
            config,
            strategy,
            symbols: HashMap::new(),
            portfolio: None,
            hub: None,
            audit: AuditLog::default(),
        }
    }

    /// Marks every `SymbolContext` stopped (pre-trade checks then reject new
    /// orders) and stops the user-stream hub. Idempotent.
    fn request_stop(&self) {
        if let Some(hub) = &self.hub {
            hub.stop();
        }
        for runtime in self.symbols.values() {
            runtime.ctx.request_stop();
        }
    }

    /// Runs the engine's eight-step bring-up sequence (SymbolContext init,
    /// hub wiring, history seeding, strategy init, feed subscription) then
    /// the dispatch loop, until `request_stop` is called or a feed-seeding
    /// failure aborts start-up outright.
    pub async fn run(mut self) -> Result<()> {
        info!("JOB_STARTED");
        self.audit.record("JOB_STARTED", "engine bring-up beginning");

        let symbol_configs = self.config.resolved_symbol_configs();
        if symbol_configs.is_empty() {
            bail!("no tradable symbols configured");
        }

        // ── 1. SymbolContext.initialize for every tradable symbol ──────────
        let mut symbol_ctxs: HashMap<String, Arc<SymbolContext>> = HashMap::new();
        let mut buffers: HashMap<String, Arc<CandleBuffer>> = HashMap::new();

        for sc in &symbol_configs {
            let book_ticker = BookTickerFeed::new(sc.symbol.clone());
            let ctx = Arc::new(SymbolContext::new(sc.clone(), self.exchange.clone(), Arc::clone(&book_ticker), self.config.chase));
            ctx.set_self_ref(Arc::downgrade(&ctx));
            ctx.initialize().await.with_context(|| format!("failed to initialize SymbolContext for {}", sc.symbol))?;

            let buffer = Arc::new(CandleBuffer::new(self.config.indicator_buffer_bars.max(self.config.history_seed_bars)));
            let key = CandleKey { symbol: sc.symbol.clone(), interval: sc.trade_interval.clone() };
            let indicators = Arc::new(IndicatorContext::new(key, Arc::clone(&buffer), self.config.indicator_buffer_bars));

            symbol_ctxs.insert(sc.symbol.clone(), Arc::clone(&ctx));
            buffers.insert(sc.symbol.clone(), Arc::clone(&buffer));
            self.symbols.insert(sc.symbol.clone(), SymbolRuntime { ctx, indicators, book_ticker });
        }

        // ── 2 & 3. Wire PortfolioContext and attach to the UserStreamHub ────
        let primary_symbol = symbol_configs[0].symbol.clone();
        let portfolio = Arc::new(PortfolioContext::new(primary_symbol, symbol_ctxs.clone(), self.config.portfolio_risk));
        for runtime in self.symbols.values() {
            runtime.ctx.set_portfolio_gate(Arc::clone(&portfolio) as Arc<dyn PortfolioGate>);
        }
        self.portfolio = Some(Arc::clone(&portfolio));

        let hub = UserStreamHub::new(self.exchange.clone(), symbol_ctxs.clone());
        let hub_handle = Arc::clone(&hub);
        tokio::spawn(async move { hub_handle.run().await });
        self.hub = Some(hub);

        // ── 4. Seed history into every stream's IndicatorContext ───────────
        let (tx, mut rx) = mpsc::channel::<PriceTick>(4096);

        for sc in &symbol_configs {
            let buffer = Arc::clone(&buffers[&sc.symbol]);
            let feed = PriceFeed::new(sc.symbol.clone(), sc.trade_interval.clone(), buffer, self.exchange.clone());
            feed.seed_history(self.config.history_seed_bars)
                .await
                .with_context(|| format!("failed to seed history for {}@{}", sc.symbol, sc.trade_interval))?;

            let tx = tx.clone();
            tokio::spawn(async move { feed.run(tx).await });

            let runtime = &self.symbols[&sc.symbol];
            tokio::spawn({
                let book_ticker = Arc::clone(&runtime.book_ticker);
                async move { book_ticker.run().await }
            });
        }
        drop(tx);

        info!(symbols = symbol_configs.len(), "EXCHANGE_INFO_LOADED symbols initialized, feeds subscribed");

        // ── 5. strategy.initialize on the first stream's bound context ─────
        let first = &symbol_configs[0];
        let first_runtime = &self.symbols[&first.symbol];
        let first_ctx = StreamBoundStrategyContext::new(
            first.symbol.clone(),
            first.trade_interval.clone(),
            Arc::clone(&first_runtime.ctx),
            Arc::clone(&first_runtime.indicators),
        );
        self.strategy.initialize(&first_ctx);

        // ── 6-7. steady-state dispatch loop ─────────────────────────────────
        info!("All subsystems running. Press Ctrl+C to stop.");
        loop {
            tokio::select! {
                tick = rx.recv() => {
                    match tick {
                        Some(tick) => self.on_price_update(tick).await,
                        None => break,
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    warn!("Shutdown signal received — stopping gracefully");
                    break;
                }
            }
        }

        // ── 8. graceful shutdown ─────────────────────────────────────────────
        self.request_stop();
        info!("JOB_STOPPED");
        self.audit.record("JOB_STOPPED", "dispatch loop exited");
        Ok(())
    }

    /// Per-tick dispatch: mark the indicator window and (if applicable)
    /// symbol state, then hand a `Bar` to the strategy when the bar closed or
    /// the strategy opted into tick-level callbacks.
    async fn on_price_update(&mut self, tick: PriceTick) {
        let Some(runtime) = self.symbols.get(&tick.symbol) else {
            return;
        };

        runtime.indicators.mark_price(tick.price);
        runtime.ctx.on_mark_price(tick.price).await;

        if tick.is_new_bar && tick.interval == runtime.ctx.interval() {
            runtime.ctx.on_new_bar(tick.bar_timestamp);
        }

        let should_dispatch = tick.is_new_bar || self.strategy.run_on_tick();
        if !should_dispatch {
            return;
        }

        let bar = Bar {
            symbol: tick.symbol.clone(),
            interval: tick.interval.clone(),
            open: tick.bar_open,
            high: tick.bar_high,
            low: tick.bar_low,
            close: tick.bar_close,
            volume: tick.volume,
            bar_timestamp: tick.bar_timestamp,
            timestamp: tick.timestamp,
            is_new_bar: tick.is_new_bar,
        };

        let ctx = StreamBoundStrategyContext::new(
            tick.symbol.clone(),
            tick.interval.clone(),
            Arc::clone(&runtime.ctx),
            Arc::clone(&runtime.indicators),
        );

        let strategy = &mut self.strategy;
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| strategy.on_bar(&ctx, &bar)));
        if result.is_err() {
            error!(symbol = %tick.symbol, "STRATEGY_ERROR: on_bar panicked");
            self.audit.record("STRATEGY_ERROR", format!("symbol={} on_bar panicked", tick.symbol));
        }
    }
}

/// Upper bound on how long shutdown waits for in-flight order tasks before
/// proceeding regardless, matching the 5s order-task cancellation budget.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
