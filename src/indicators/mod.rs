// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Pure, side-effect-free implementations of the core technical indicators used
// by the trading engine, plus `IndicatorContext`: the per-stream sliding
// window and name-keyed registry that `SymbolContext`/strategy code queries
// through `get_indicator(name, params)`.

pub mod ema;
pub mod rsi;
pub mod adx;
pub mod bollinger;
pub mod atr;
pub mod roc;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

use crate::market_data::candle_buffer::{CandleBuffer, CandleKey};
use crate::market_data::Candle;

/// A registered indicator function: takes the closed-candle window (oldest
/// first) and a params list, returns the latest computed value. Pure with
/// respect to the candle buffer — no hidden state.
pub type IndicatorFn = Arc<dyn Fn(&[Candle], &[f64]) -> Option<f64> + Send + Sync>;

struct RegisteredIndicator {
    arity: usize,
    f: IndicatorFn,
}

/// Sliding window of OHLCV for one `(symbol, interval)` stream, plus the
/// indicator registry consulted by strategy code. `mark_price` updates the
/// last-known tick price without touching the closed series; only a closed
/// bar mutates the window itself (via the shared `CandleBuffer`).
pub struct IndicatorContext {
    key: CandleKey,
    buffer: Arc<CandleBuffer>,
    window: usize,
    last_tick_price: RwLock<f64>,
    registry: RwLock<HashMap<String, RegisteredIndicator>>,
    cache: RwLock<HashMap<String, (i64, f64)>>,
}

impl IndicatorContext {
    pub fn new(key: CandleKey, buffer: Arc<CandleBuffer>, window: usize) -> Self {
        let ctx = Self {
            key,
            buffer,
            window,
            last_tick_price: RwLock::new(0.0),
            registry: RwLock::new(HashMap::new()),
            cache: RwLock::new(HashMap::new()),
        };
        ctx.register_builtins();
        ctx
    }

    fn register_builtins(&self) {
        self.register("ema", 1, Arc::new(|candles, params| {
            let period = *params.first()? as usize;
            let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
            ema::calculate_ema(&closes, period).last().copied()
        }));

        self.register("rsi", 1, Arc::new(|candles, params| {
            let period = *params.first()? as usize;
            let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
            rsi::calculate_rsi(&closes, period).last().copied()
        }));

        self.register("atr", 1, Arc::new(|candles, params| {
            let period = *params.first()? as usize;
            atr::calculate_atr(candles, period)
        }));

        self.register("adx", 1, Arc::new(|candles, params| {
            let period = *params.first()? as usize;
            adx::calculate_adx(candles, period)
        }));

        self.register("bollinger_width", 2, Arc::new(|candles, params| {
            let period = *params.first()? as usize;
            let num_std = *params.get(1)?;
            let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
            bollinger::calculate_bollinger(&closes, period, num_std).map(|b| b.width)
        }));

        self.register("roc", 1, Arc::new(|candles, params| {
            let period = *params.first()? as usize;
            let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
            roc::current_roc(&closes, period)
        }));
    }

    /// Register a new indicator under `name` with a fixed `arity` (number of
    /// f64 params `get_indicator` must supply). Overwrites any existing
    /// registration under the same name.
    pub fn register(&self, name: &str, arity: usize, f: IndicatorFn) {
        self.registry.write().insert(name.to_string(), RegisteredIndicator { arity, f });
    }

    /// Update the last-known tick price. Does not affect the closed series or
    /// any cached indicator value.
    pub fn mark_price(&self, price: f64) {
        *self.last_tick_price.write() = price;
    }

    pub fn last_tick_price(&self) -> f64 {
        *self.last_tick_price.read()
    }

    /// Dispatch to a registered indicator. Caches by `(name, params, last
    /// close_time)` so repeated calls within a single tick don't recompute.
    pub fn get_indicator(&self, name: &str, params: &[f64]) -> Option<f64> {
        let registry = self.registry.read();
        let entry = registry.get(name)?;
        if params.len() != entry.arity {
            warn!(name, expected = entry.arity, got = params.len(), "indicator arity mismatch");
            return None;
        }

        let candles = self.buffer.get_closed(&self.key, self.window);
        let last_close_time = candles.last().map(|c| c.close_time).unwrap_or(0);
        let cache_key = format!("{name}:{params:?}");

        if let Some((cached_ts, value)) = self.cache.read().get(&cache_key) {
            if *cached_ts == last_close_time {
                return Some(*value);
            }
        }

        let value = (entry.f)(&candles, params)?;
        self.cache.write().insert(cache_key, (last_close_time, value));
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::candle_buffer::Candle as WsCandle;

    fn seed(buffer: &CandleBuffer, key: &CandleKey, n: usize) {
        for i in 0..n {
            let close = 100.0 + i as f64;
            buffer.update(
                key.clone(),
                WsCandle {
                    open_time: i as i64 * 60_000,
                    close_time: i as i64 * 60_000 + 59_999,
                    open: close,
                    high: close + 1.0,
                    low: close - 1.0,
                    close,
                    volume: 10.0,
                    quote_volume: 20.0,
                    trades_count: 5,
                    taker_buy_volume: 1.0,
                    taker_buy_quote_volume: 2.0,
                    is_closed: true,
                },
            );
        }
    }

    #[test]
    fn get_indicator_dispatches_ema() {
        let buffer = Arc::new(CandleBuffer::new(500));
        let key = CandleKey { symbol: "BTCUSDT".to_string(), interval: "1m".to_string() };
        seed(&buffer, &key, 30);

        let ctx = IndicatorContext::new(key, buffer, 500);
        let value = ctx.get_indicator("ema", &[9.0]);
        assert!(value.is_some());
    }

    #[test]
    fn get_indicator_rejects_wrong_arity() {
        let buffer = Arc::new(CandleBuffer::new(500));
        let key = CandleKey { symbol: "BTCUSDT".to_string(), interval: "1m".to_string() };
        seed(&buffer, &key, 30);

        let ctx = IndicatorContext::new(key, buffer, 500);
        assert!(ctx.get_indicator("ema", &[9.0, 1.0]).is_none());
    }

    #[test]
    fn mark_price_does_not_affect_closed_series() {
        let buffer = Arc::new(CandleBuffer::new(500));
        let key = CandleKey { symbol: "BTCUSDT".to_string(), interval: "1m".to_string() };
        seed(&buffer, &key, 30);

        let ctx = IndicatorContext::new(key, buffer, 500);
        let before = ctx.get_indicator("ema", &[9.0]);
        ctx.mark_price(999.0);
        let after = ctx.get_indicator("ema", &[9.0]);
        assert_eq!(before, after);
        assert_eq!(ctx.last_tick_price(), 999.0);
    }
}
