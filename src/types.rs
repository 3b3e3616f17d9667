// =============================================================================
// Core Data Model — Position / Order / Candle / PrecisionFilters / RiskConfig
// =============================================================================
//
// Shared value types owned by the per-symbol trading state. Position size is
// signed (+long / -short / 0 flat); entry_price and entry_balance are only
// meaningful while size != 0 and are cleared together on the nonzero->0
// transition (see `Position::apply_fill`).
// =============================================================================

use serde::{Deserialize, Serialize};

/// Balance snapshot for a single asset from the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceInfo {
    pub asset: String,
    #[serde(default)]
    pub free: f64,
    #[serde(default)]
    pub locked: f64,
}

/// Whether the engine is actively trading, paused, or killed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradingMode {
    Live,
    Paused,
    Killed,
}

impl Default for TradingMode {
    fn default() -> Self {
        Self::Paused
    }
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "Live"),
            Self::Paused => write!(f, "Paused"),
            Self::Killed => write!(f, "Killed"),
        }
    }
}

/// Whether we are running against real funds or simulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountMode {
    Demo,
    Live,
}

impl Default for AccountMode {
    fn default() -> Self {
        Self::Demo
    }
}

impl std::fmt::Display for AccountMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Demo => write!(f, "Demo"),
            Self::Live => write!(f, "Live"),
        }
    }
}

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// +1.0 for BUY, -1.0 for SELL — the sign convention used throughout the
    /// position arithmetic.
    pub fn sign(self) -> f64 {
        match self {
            Side::Buy => 1.0,
            Side::Sell => -1.0,
        }
    }

    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Order type as understood by the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    Market,
    Limit,
}

/// Exchange-reported order status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Expired,
    Rejected,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Expired | OrderStatus::Rejected
        )
    }
}

/// A transient exchange order record. Lives in `open_orders_by_id` while
/// `status` is non-terminal; removed once a terminal status is observed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: u64,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub quantity: f64,
    pub price: f64,
    pub executed_qty: f64,
    pub avg_price: f64,
    pub reduce_only: bool,
    pub post_only: bool,
}

/// One OHLCV bar for a `(symbol, interval)` stream.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Candle {
    pub open_time: i64,
    pub close_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Exchange precision/notional filters for a symbol — loaded once at start
/// and required before any order is placed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PrecisionFilters {
    pub step_size: f64,
    pub tick_size: f64,
    pub min_notional: f64,
    pub min_qty: f64,
    pub max_qty: f64,
}

impl PrecisionFilters {
    /// Round `qty` down to the nearest multiple of `step_size`.
    pub fn round_qty_down(&self, qty: f64) -> f64 {
        if self.step_size <= 0.0 {
            return qty;
        }
        let steps = (qty / self.step_size).floor();
        round_to_step_precision(steps * self.step_size, self.step_size)
    }

    /// Round `price` to the nearest multiple of `tick_size`.
    pub fn round_price(&self, price: f64) -> f64 {
        if self.tick_size <= 0.0 {
            return price;
        }
        let ticks = (price / self.tick_size).round();
        round_to_step_precision(ticks * self.tick_size, self.tick_size)
    }

    /// Clamp `qty` into `[min_qty, max_qty]` at `step_size` granularity,
    /// returning `0.0` if it would fall below `min_qty` or the notional
    /// requirement at `price`.
    pub fn clamp_order(&self, qty: f64, price: f64) -> f64 {
        let rounded = self.round_qty_down(qty).min(self.max_qty);
        if rounded < self.min_qty || rounded * price < self.min_notional {
            return 0.0;
        }
        rounded
    }
}

/// Rounds `value` to the number of decimal places implied by `step`, which
/// avoids floating point artefacts such as `0.1 + 0.2` surviving the
/// multiply-then-divide used by `round_qty_down`/`round_price`.
fn round_to_step_precision(value: f64, step: f64) -> f64 {
    let decimals = decimal_places(step);
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

fn decimal_places(step: f64) -> u32 {
    if step <= 0.0 || !step.is_finite() {
        return 8;
    }
    let s = format!("{:.10}", step);
    match s.find('.') {
        Some(dot) => s[dot + 1..].trim_end_matches('0').len() as u32,
        None => 0,
    }
}

/// Per-symbol risk configuration; a portfolio-wide instance is constructed
/// the same way and used by the aggregate pre-trade check.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RiskConfig {
    #[serde(default = "default_max_leverage")]
    pub max_leverage: f64,
    #[serde(default = "default_max_position_size")]
    pub max_position_size: f64,
    #[serde(default = "default_max_order_size")]
    pub max_order_size: f64,
    #[serde(default = "default_daily_loss_limit")]
    pub daily_loss_limit: f64,
    #[serde(default = "default_max_consecutive_losses")]
    pub max_consecutive_losses: u32,
    #[serde(default = "default_stoploss_cooldown_candles")]
    pub stoploss_cooldown_candles: u32,
    #[serde(default = "default_stop_loss_pct")]
    pub stop_loss_pct: f64,
}

fn default_max_leverage() -> f64 {
    5.0
}
fn default_max_position_size() -> f64 {
    0.5
}
fn default_max_order_size() -> f64 {
    0.2
}
fn default_daily_loss_limit() -> f64 {
    100.0
}
fn default_max_consecutive_losses() -> u32 {
    5
}
fn default_stoploss_cooldown_candles() -> u32 {
    3
}
fn default_stop_loss_pct() -> f64 {
    0.05
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_leverage: default_max_leverage(),
            max_position_size: default_max_position_size(),
            max_order_size: default_max_order_size(),
            daily_loss_limit: default_daily_loss_limit(),
            max_consecutive_losses: default_max_consecutive_losses(),
            stoploss_cooldown_candles: default_stoploss_cooldown_candles(),
            stop_loss_pct: default_stop_loss_pct(),
        }
    }
}

/// Per-symbol counters consulted by `RiskManager::can_trade`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Counters {
    pub consecutive_losses: u32,
    pub daily_realized_pnl: f64,
    pub cooldown_until_bar_ts: Option<i64>,
}

/// Signed per-symbol position. `size == 0.0` is the canonical flat state;
/// `entry_price`/`entry_balance` are meaningless (and kept at 0.0) while flat.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Position {
    pub size: f64,
    pub entry_price: f64,
    pub entry_balance: f64,
    pub unrealized_pnl: f64,
}

impl Default for Position {
    fn default() -> Self {
        Self {
            size: 0.0,
            entry_price: 0.0,
            entry_balance: 0.0,
            unrealized_pnl: 0.0,
        }
    }
}

impl Position {
    pub fn is_flat(&self) -> bool {
        self.size.abs() < 1e-12
    }

    /// Recompute `unrealized_pnl` for a new mark price; does not mutate size.
    pub fn mark(&mut self, price: f64) {
        self.unrealized_pnl = if self.is_flat() {
            0.0
        } else {
            self.size * (price - self.entry_price)
        };
    }

    /// Apply a fill of `signed_qty` (positive = bought, negative = sold) at
    /// `fill_price`, given the wallet `balance_on_entry` observed at the time
    /// (only consulted on a 0->nonzero transition). Returns realized PnL
    /// booked by this fill, nonzero only when the fill reduces, closes, or
    /// flips the position.
    pub fn apply_fill(&mut self, signed_qty: f64, fill_price: f64, balance_on_entry: f64) -> f64 {
        let before = self.size;
        let after = before + signed_qty;

        if before.abs() < 1e-12 {
            self.size = after;
            self.entry_price = fill_price;
            self.entry_balance = balance_on_entry;
            return 0.0;
        }

        if before.signum() == signed_qty.signum() {
            let total = before.abs() + signed_qty.abs();
            self.entry_price = (self.entry_price * before.abs() + fill_price * signed_qty.abs()) / total;
            self.size = after;
            return 0.0;
        }

        let closing_qty = before.abs().min(signed_qty.abs());
        let realized = before.signum() * closing_qty * (fill_price - self.entry_price);

        if after.abs() < 1e-12 {
            self.size = 0.0;
            self.entry_price = 0.0;
            self.entry_balance = 0.0;
            self.unrealized_pnl = 0.0;
        } else if after.signum() == before.signum() {
            // Partial reduction: entry_price/entry_balance preserved.
            self.size = after;
        } else {
            // Flip through zero: the residual opens a new position.
            self.size = after;
            self.entry_price = fill_price;
            self.entry_balance = balance_on_entry;
        }

        realized
    }
}

/// Realized PnL booked by a fill, split gross vs. commission per the spec's
/// open-question decision: risk counters operate on gross.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RealizedPnl {
    pub gross: f64,
    pub commission: f64,
}

impl RealizedPnl {
    pub fn net(&self) -> f64 {
        self.gross - self.commission
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_opens_from_flat() {
        let mut p = Position::default();
        let realized = p.apply_fill(0.01, 50_000.0, 1000.0);
        assert_eq!(realized, 0.0);
        assert_eq!(p.size, 0.01);
        assert_eq!(p.entry_price, 50_000.0);
        assert_eq!(p.entry_balance, 1000.0);
    }

    #[test]
    fn position_full_close_realizes_pnl_and_clears_entry() {
        let mut p = Position {
            size: 0.01,
            entry_price: 50_000.0,
            entry_balance: 1000.0,
            unrealized_pnl: 0.0,
        };
        let realized = p.apply_fill(-0.01, 45_000.0, 1000.0);
        assert!((realized - (-50.0)).abs() < 1e-9);
        assert!(p.is_flat());
        assert_eq!(p.entry_price, 0.0);
        assert_eq!(p.entry_balance, 0.0);
    }

    #[test]
    fn position_partial_reduction_preserves_entry() {
        let mut p = Position {
            size: 0.02,
            entry_price: 50_000.0,
            entry_balance: 1000.0,
            unrealized_pnl: 0.0,
        };
        let realized = p.apply_fill(-0.01, 51_000.0, 1000.0);
        assert!((realized - 10.0).abs() < 1e-9);
        assert_eq!(p.size, 0.01);
        assert_eq!(p.entry_price, 50_000.0);
        assert_eq!(p.entry_balance, 1000.0);
    }

    #[test]
    fn precision_filters_round_down_qty_and_round_price() {
        let f = PrecisionFilters {
            step_size: 0.001,
            tick_size: 0.1,
            min_notional: 5.0,
            min_qty: 0.001,
            max_qty: 1000.0,
        };
        assert_eq!(f.round_qty_down(0.001_234_56), 0.001);
        assert_eq!(f.round_price(42_123.456), 42_123.5);
    }

    #[test]
    fn precision_filters_reject_below_min_notional() {
        let f = PrecisionFilters {
            step_size: 0.001,
            tick_size: 0.1,
            min_notional: 5.0,
            min_qty: 0.001,
            max_qty: 1000.0,
        };
        assert_eq!(f.clamp_order(0.0001, 49_900.0), 0.0);
        assert!(f.clamp_order(0.0002, 49_900.0) > 0.0);
    }
}
