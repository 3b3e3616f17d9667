// =============================================================================
// Strategy contract — StreamBoundStrategyContext + the Strategy trait
// =============================================================================
//
// The engine owns every `SymbolContext`/`IndicatorContext` pair; strategy code
// never touches them directly. Each callback receives a fresh, cheap-to-clone
// `StreamBoundStrategyContext` bound to the `(symbol, interval)` stream that
// produced the bar. Read accessors are plain synchronous calls; write
// accessors (`buy`/`sell`/`close_position`) return immediately and run the
// actual exchange round-trip off the dispatch path, so a strategy callback
// can never block the tick loop it was called from.
// =============================================================================

use std::sync::Arc;

use tracing::warn;

use crate::indicators::{IndicatorContext, IndicatorFn};
use crate::symbol_context::SymbolContext;
use crate::types::Order;

/// One closed (or, for `run_on_tick` strategies, in-progress) bar delivered to
/// `Strategy::on_bar`.
#[derive(Debug, Clone)]
pub struct Bar {
    pub symbol: String,
    pub interval: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub bar_timestamp: i64,
    pub timestamp: i64,
    pub is_new_bar: bool,
}

/// Thin facade passed by value into every strategy callback. Must not be
/// retained past the call it was given to — it borrows nothing, but the
/// `SymbolContext`/`IndicatorContext` it wraps reflect only the state as of
/// construction time.
#[derive(Clone)]
pub struct StreamBoundStrategyContext {
    pub symbol: String,
    pub interval: String,
    ctx: Arc<SymbolContext>,
    indicators: Arc<IndicatorContext>,
}

impl StreamBoundStrategyContext {
    pub fn new(symbol: impl Into<String>, interval: impl Into<String>, ctx: Arc<SymbolContext>, indicators: Arc<IndicatorContext>) -> Self {
        Self { symbol: symbol.into(), interval: interval.into(), ctx, indicators }
    }

    // -------------------------------------------------------------------
    // Read-only
    // -------------------------------------------------------------------

    pub fn current_price(&self) -> f64 {
        self.ctx.current_price()
    }

    pub fn position_size(&self) -> f64 {
        self.ctx.position_snapshot().size
    }

    pub fn position_entry_price(&self) -> f64 {
        self.ctx.position_snapshot().entry_price
    }

    pub fn position_entry_balance(&self) -> f64 {
        self.ctx.position_snapshot().entry_balance
    }

    pub fn unrealized_pnl(&self) -> f64 {
        self.ctx.position_snapshot().unrealized_pnl
    }

    pub fn balance(&self) -> f64 {
        self.ctx.balance()
    }

    pub fn total_equity(&self) -> f64 {
        self.ctx.total_equity()
    }

    pub fn leverage(&self) -> f64 {
        self.ctx.leverage()
    }

    pub fn get_open_orders(&self) -> Vec<Order> {
        self.ctx.get_open_orders()
    }

    pub fn get_indicator(&self, name: &str, params: &[f64]) -> Option<f64> {
        self.indicators.get_indicator(name, params)
    }

    pub fn register_indicator(&self, name: &str, arity: usize, f: IndicatorFn) {
        self.indicators.register(name, arity, f);
    }

    pub fn calc_entry_quantity(&self, entry_pct: Option<f64>, price: Option<f64>) -> f64 {
        let price = price.unwrap_or_else(|| self.ctx.current_price());
        self.ctx.calc_entry_quantity(entry_pct, price)
    }

    // -------------------------------------------------------------------
    // Write — fire-and-forget, the symbol's own order_lock/inflight guard
    // gives these the FIFO-per-symbol ordering a dedicated mailbox would.
    // -------------------------------------------------------------------

    pub fn buy(&self, qty: f64, price: Option<f64>, reason: &str, use_chase: bool) {
        let ctx = Arc::clone(&self.ctx);
        let reason = reason.to_string();
        tokio::spawn(async move {
            if let Err(e) = ctx.buy(qty, price, &reason, use_chase).await {
                warn!(symbol = %ctx.symbol, reason = %reason, error = %e, "ORDER_REJECTED on buy");
            }
        });
    }

    pub fn sell(&self, qty: f64, price: Option<f64>, reason: &str, use_chase: bool) {
        let ctx = Arc::clone(&self.ctx);
        let reason = reason.to_string();
        tokio::spawn(async move {
            if let Err(e) = ctx.sell(qty, price, &reason, use_chase).await {
                warn!(symbol = %ctx.symbol, reason = %reason, error = %e, "ORDER_REJECTED on sell");
            }
        });
    }

    pub fn close_position(&self, reason: &str, use_chase: bool) {
        let ctx = Arc::clone(&self.ctx);
        let reason = reason.to_string();
        let price = self.ctx.current_price();
        tokio::spawn(async move {
            if let Err(e) = ctx.close_position(&reason, use_chase, price).await {
                warn!(symbol = %ctx.symbol, reason = %reason, error = %e, "ORDER_REJECTED on close_position");
            }
        });
    }

    pub fn enter_long(&self, reason: &str, entry_pct: Option<f64>) {
        let price = self.ctx.current_price();
        let qty = self.ctx.calc_entry_quantity(entry_pct, price);
        if qty <= 0.0 {
            return;
        }
        self.buy(qty, None, reason, true);
    }

    pub fn enter_short(&self, reason: &str, entry_pct: Option<f64>) {
        let price = self.ctx.current_price();
        let qty = self.ctx.calc_entry_quantity(entry_pct, price);
        if qty <= 0.0 {
            return;
        }
        self.sell(qty, None, reason, true);
    }
}

/// Implemented by user strategy code. `initialize` runs once per job, on the
/// context bound to the tradable symbol's first stream; `on_bar` runs on every
/// closed bar of every stream the engine subscribes (plus every tick when
/// `run_on_tick` returns true). Both are synchronous and must not block —
/// panics here are not caught by the engine, only `Result`-returning paths are
/// (there are none on this trait, so a strategy that wants to fail loudly
/// should log and return rather than panic).
pub trait Strategy: Send + Sync {
    fn initialize(&mut self, ctx: &StreamBoundStrategyContext);
    fn on_bar(&mut self, ctx: &StreamBoundStrategyContext, bar: &Bar);

    fn run_on_tick(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binance::client::ExchangeClient;
    use crate::config::{ChaseConfig, SymbolConfig};
    use crate::market_data::candle_buffer::{CandleBuffer, CandleKey};
    use crate::market_data::BookTickerFeed;

    /// Minimal illustrative strategy used only to exercise the `Strategy`
    /// trait's calling convention in tests: buys once on the first flat bar,
    /// otherwise holds.
    struct BuyAndHoldFixture {
        entered: bool,
    }

    impl Strategy for BuyAndHoldFixture {
        fn initialize(&mut self, _ctx: &StreamBoundStrategyContext) {
            self.entered = false;
        }

        fn on_bar(&mut self, ctx: &StreamBoundStrategyContext, bar: &Bar) {
            if !self.entered && bar.is_new_bar && ctx.position_size().abs() < 1e-12 {
                ctx.enter_long("BuyAndHoldFixture entry", None);
                self.entered = true;
            }
        }
    }

    fn make_ctx(symbol: &str) -> StreamBoundStrategyContext {
        let cfg = SymbolConfig {
            symbol: symbol.to_string(),
            trade_interval: "5m".to_string(),
            leverage: 3.0,
            entry_pct: 0.1,
            risk_override: None,
        };
        let exchange = ExchangeClient::new("key", "secret");
        let book_ticker = BookTickerFeed::new(symbol);
        let symbol_ctx = Arc::new(SymbolContext::new(cfg, exchange, book_ticker, ChaseConfig::default()));

        let key = CandleKey { symbol: symbol.to_string(), interval: "5m".to_string() };
        let buffer = Arc::new(CandleBuffer::new(500));
        let indicators = Arc::new(IndicatorContext::new(key, buffer, 500));

        StreamBoundStrategyContext::new(symbol, "5m", symbol_ctx, indicators)
    }

    #[test]
    fn enter_long_is_a_noop_with_zero_equity() {
        // Balance/equity are zero before `initialize()` fetches the account,
        // so `calc_entry_quantity` returns 0 and no order is spawned.
        let ctx = make_ctx("BTCUSDT");
        let mut strat = BuyAndHoldFixture { entered: false };
        strat.initialize(&ctx);

        let bar = Bar {
            symbol: "BTCUSDT".to_string(),
            interval: "5m".to_string(),
            open: 100.0,
            high: 101.0,
            low: 99.0,
            close: 100.5,
            volume: 10.0,
            bar_timestamp: 0,
            timestamp: 0,
            is_new_bar: true,
        };
        strat.on_bar(&ctx, &bar);
        assert!(strat.entered);
        assert!(ctx.get_open_orders().is_empty());
    }

    #[test]
    fn get_indicator_reaches_through_to_indicator_context() {
        let ctx = make_ctx("ETHUSDT");
        // No candles seeded, so every built-in indicator is None rather than
        // panicking on an empty window.
        assert_eq!(ctx.get_indicator("ema", &[9.0]), None);
    }
}
