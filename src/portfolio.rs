// =============================================================================
// PortfolioContext — aggregate pre-trade risk gate across symbols
// =============================================================================
//
// Sits above every `SymbolContext` as the `PortfolioGate` each one calls into
// for growing orders. Exit orders never reach this: `SymbolContext::close_position`
// bypasses the gate entirely, matching the "exits are always allowed" rule.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use crate::risk::RiskManager;
use crate::symbol_context::{PortfolioGate, SymbolContext};
use crate::types::RiskConfig;

pub struct PortfolioContext {
    primary_symbol: String,
    symbols: HashMap<String, Arc<SymbolContext>>,
    risk: RiskManager,
    multiplier: f64,
}

impl PortfolioContext {
    pub fn new(primary_symbol: impl Into<String>, symbols: HashMap<String, Arc<SymbolContext>>, risk_config: RiskConfig) -> Self {
        let multiplier = (symbols.len() as f64).max(1.0);
        Self {
            primary_symbol: primary_symbol.into(),
            symbols,
            risk: RiskManager::new(risk_config),
            multiplier,
        }
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn symbol_contexts(&self) -> &HashMap<String, Arc<SymbolContext>> {
        &self.symbols
    }

    pub fn risk(&self) -> &RiskManager {
        &self.risk
    }

    /// `primary_symbol`'s balance plus unrealized PnL summed across every
    /// symbol — the shared futures wallet balance is reported identically by
    /// each symbol's own account fetch, so only one copy is counted.
    pub fn total_equity(&self) -> f64 {
        let balance = self.symbols.get(&self.primary_symbol).map(|ctx| ctx.balance()).unwrap_or(0.0);
        let unrealized: f64 = self.symbols.values().map(|ctx| ctx.position_snapshot().unrealized_pnl).sum();
        balance + unrealized
    }

    fn position_value(&self) -> f64 {
        self.symbols
            .values()
            .map(|ctx| {
                let price = ctx.current_price();
                if price <= 0.0 {
                    0.0
                } else {
                    ctx.position_snapshot().size.abs() * price
                }
            })
            .sum()
    }

    fn max_leverage(&self) -> f64 {
        self.symbols.values().map(|ctx| ctx.leverage()).fold(0.0_f64, f64::max)
    }

    pub fn record_trade(&self, pnl: f64) {
        self.risk.record_trade(pnl);
    }
}

impl PortfolioGate for PortfolioContext {
    fn check_pre_trade(&self, symbol: &str, signed_qty_delta: f64, price: f64) -> Result<(), String> {
        if price <= 0.0 || signed_qty_delta.abs() <= 0.0 {
            return Ok(());
        }

        let (ok, reason) = self.risk.can_trade(true);
        if !ok {
            return Err(reason.unwrap_or_else(|| "portfolio risk denied".to_string()));
        }

        let Some(ctx) = self.symbols.get(symbol) else {
            warn!(symbol, "pre-trade check requested for unknown symbol");
            return Ok(());
        };

        let total_equity = self.total_equity();
        let leverage = self.max_leverage();
        let cfg = ctx.risk.config();

        let order_value = signed_qty_delta.abs() * price;
        let max_order_value = total_equity * leverage * cfg.max_order_size * self.multiplier;
        if order_value > max_order_value {
            return Err(format!("portfolio order size exceeded (max ${max_order_value:.2})"));
        }

        let before_pos = ctx.position_snapshot().size;
        let after_pos = before_pos + signed_qty_delta;
        let before_total = self.position_value();
        let before_symbol_value = before_pos.abs() * price;
        let after_symbol_value = after_pos.abs() * price;
        let after_total = before_total - before_symbol_value + after_symbol_value;

        let max_total_value = total_equity * leverage * cfg.max_position_size * self.multiplier;
        if after_total > max_total_value {
            return Err(format!("portfolio total exposure exceeded (max ${max_total_value:.2})"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binance::client::ExchangeClient;
    use crate::config::{ChaseConfig, SymbolConfig};
    use crate::market_data::BookTickerFeed;

    fn make_symbol_ctx(symbol: &str, leverage: f64) -> Arc<SymbolContext> {
        let cfg = SymbolConfig {
            symbol: symbol.to_string(),
            trade_interval: "5m".to_string(),
            leverage,
            entry_pct: 0.1,
            risk_override: None,
        };
        let exchange = ExchangeClient::new("key", "secret");
        let book_ticker = BookTickerFeed::new(symbol);
        Arc::new(SymbolContext::new(cfg, exchange, book_ticker, ChaseConfig::default()))
    }

    #[tokio::test]
    async fn oversized_order_is_rejected() {
        let ctx = make_symbol_ctx("BTCUSDT", 2.0);
        ctx.on_mark_price(50_000.0).await;

        let mut symbols = HashMap::new();
        symbols.insert("BTCUSDT".to_string(), ctx);
        let portfolio = PortfolioContext::new("BTCUSDT", symbols, RiskConfig { max_order_size: 0.01, ..RiskConfig::default() });

        // Zero balance/equity means any nonzero order value exceeds the cap.
        let result = portfolio.check_pre_trade("BTCUSDT", 1.0, 50_000.0);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn unknown_symbol_is_allowed_through() {
        let ctx = make_symbol_ctx("BTCUSDT", 2.0);
        let mut symbols = HashMap::new();
        symbols.insert("BTCUSDT".to_string(), ctx);
        let portfolio = PortfolioContext::new("BTCUSDT", symbols, RiskConfig::default());

        let result = portfolio.check_pre_trade("ETHUSDT", 1.0, 3_000.0);
        assert!(result.is_ok());
    }
}
