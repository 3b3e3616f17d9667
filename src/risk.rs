// =============================================================================
// RiskManager — generic circuit breaker shared by symbol and portfolio scopes
// =============================================================================
//
// A single implementation parameterized by the `RiskConfig`/`Counters` pair it
// is bound to; both a per-symbol `RiskManager` and the portfolio-wide instance
// are plain instances of this type. The daily window rolls over automatically
// on UTC date change using the same double-checked-locking pattern as the
// original daily-reset logic.
// =============================================================================

use chrono::Utc;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::types::{Counters, RiskConfig};

pub struct RiskManager {
    config: RwLock<RiskConfig>,
    counters: RwLock<Counters>,
    current_date: RwLock<String>,
}

impl RiskManager {
    pub fn new(config: RiskConfig) -> Self {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        Self {
            config: RwLock::new(config),
            counters: RwLock::new(Counters::default()),
            current_date: RwLock::new(today),
        }
    }

    /// Replace the bound config (e.g. a symbol's `risk_override`).
    pub fn set_config(&self, config: RiskConfig) {
        *self.config.write() = config;
    }

    pub fn config(&self) -> RiskConfig {
        *self.config.read()
    }

    pub fn counters(&self) -> Counters {
        self.maybe_reset_daily();
        self.counters.read().clone()
    }

    // -------------------------------------------------------------------------
    // Pre-trade gate
    // -------------------------------------------------------------------------

    /// `is_entry` is true when the hypothetical fill would grow position
    /// magnitude from zero (or beyond); cooldown only blocks entry-growing
    /// orders, never exits.
    pub fn can_trade(&self, is_entry: bool) -> (bool, Option<String>) {
        self.maybe_reset_daily();
        let cfg = self.config.read();
        let counters = self.counters.read();

        if cfg.max_consecutive_losses > 0 && counters.consecutive_losses >= cfg.max_consecutive_losses {
            let msg = format!(
                "consecutive losses breaker tripped: {} (limit {})",
                counters.consecutive_losses, cfg.max_consecutive_losses
            );
            warn!("{msg}");
            return (false, Some(msg));
        }

        if counters.daily_realized_pnl <= -cfg.daily_loss_limit {
            let msg = format!(
                "daily loss breaker tripped: {:.4} (limit -{:.4})",
                counters.daily_realized_pnl, cfg.daily_loss_limit
            );
            warn!("{msg}");
            return (false, Some(msg));
        }

        if is_entry && counters.cooldown_until_bar_ts.is_some() {
            return (false, Some("stoploss cooldown active".to_string()));
        }

        (true, None)
    }

    pub fn validate_leverage(&self, leverage: f64) -> bool {
        leverage > 0.0 && leverage <= self.config.read().max_leverage
    }

    /// `qty * price` must not exceed `equity * leverage * max_order_size`.
    pub fn validate_order_size(&self, qty: f64, price: f64, equity: f64, leverage: f64) -> bool {
        let cfg = self.config.read();
        qty * price <= equity * leverage * cfg.max_order_size
    }

    /// `|new_size| * price` must not exceed `equity * leverage * max_position_size`.
    pub fn validate_position_size(&self, new_size: f64, price: f64, equity: f64, leverage: f64) -> bool {
        let cfg = self.config.read();
        new_size.abs() * price <= equity * leverage * cfg.max_position_size
    }

    // -------------------------------------------------------------------------
    // Trade recording
    // -------------------------------------------------------------------------

    /// Record the realized PnL of a finalized trade. A win resets
    /// `consecutive_losses`; a loss increments it.
    pub fn record_trade(&self, pnl: f64) {
        self.maybe_reset_daily();
        let mut counters = self.counters.write();
        counters.daily_realized_pnl += pnl;
        if pnl >= 0.0 {
            counters.consecutive_losses = 0;
        } else {
            counters.consecutive_losses += 1;
        }
        debug!(
            pnl,
            daily_realized_pnl = counters.daily_realized_pnl,
            consecutive_losses = counters.consecutive_losses,
            "trade result recorded"
        );
    }

    // -------------------------------------------------------------------------
    // Stop-loss cooldown
    // -------------------------------------------------------------------------

    pub fn is_in_stoploss_cooldown(&self) -> bool {
        self.counters.read().cooldown_until_bar_ts.is_some()
    }

    /// Start a cooldown lasting `cooldown_candles * interval_ms` from
    /// `last_bar_ts`. A no-op when `cooldown_candles == 0`.
    pub fn start_stoploss_cooldown(&self, last_bar_ts: i64, interval_ms: i64) {
        let cooldown_candles = self.config.read().stoploss_cooldown_candles;
        if cooldown_candles == 0 {
            return;
        }
        let until = last_bar_ts + cooldown_candles as i64 * interval_ms;
        self.counters.write().cooldown_until_bar_ts = Some(until);
        info!(until_bar_ts = until, "STOPLOSS_COOLDOWN_STARTED");
    }

    /// Called on every new bar; clears the cooldown once `bar_ts` reaches the
    /// stored deadline. Returns `true` exactly when the cooldown just ended.
    pub fn on_new_bar(&self, bar_ts: i64) -> bool {
        let mut counters = self.counters.write();
        if let Some(until) = counters.cooldown_until_bar_ts {
            if bar_ts >= until {
                counters.cooldown_until_bar_ts = None;
                info!("STOPLOSS_COOLDOWN_ENDED");
                return true;
            }
        }
        false
    }

    // -------------------------------------------------------------------------
    // Daily rollover
    // -------------------------------------------------------------------------

    fn maybe_reset_daily(&self) {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        {
            let current = self.current_date.read();
            if *current == today {
                return;
            }
        }
        let mut current = self.current_date.write();
        if *current != today {
            info!(old_date = %*current, new_date = %today, "date rolled — resetting daily risk counters");
            let mut counters = self.counters.write();
            counters.daily_realized_pnl = 0.0;
            *current = today;
        }
    }
}

impl std::fmt::Debug for RiskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskManager")
            .field("config", &self.config())
            .field("counters", &self.counters())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_with(max_consecutive_losses: u32, daily_loss_limit: f64) -> RiskManager {
        RiskManager::new(RiskConfig {
            max_consecutive_losses,
            daily_loss_limit,
            ..RiskConfig::default()
        })
    }

    #[test]
    fn can_trade_denies_after_consecutive_losses() {
        let rm = manager_with(2, 1_000.0);
        rm.record_trade(-10.0);
        rm.record_trade(-10.0);
        let (ok, reason) = rm.can_trade(true);
        assert!(!ok);
        assert!(reason.unwrap().contains("consecutive losses"));
    }

    #[test]
    fn can_trade_denies_after_daily_loss_limit() {
        let rm = manager_with(0, 50.0);
        rm.record_trade(-60.0);
        let (ok, _) = rm.can_trade(true);
        assert!(!ok);
    }

    #[test]
    fn win_resets_consecutive_losses() {
        let rm = manager_with(2, 1_000.0);
        rm.record_trade(-10.0);
        rm.record_trade(10.0);
        assert_eq!(rm.counters().consecutive_losses, 0);
    }

    #[test]
    fn cooldown_blocks_entry_not_exit() {
        let rm = RiskManager::new(RiskConfig { stoploss_cooldown_candles: 3, ..RiskConfig::default() });
        rm.start_stoploss_cooldown(1_000, 60_000);
        assert!(rm.is_in_stoploss_cooldown());

        let (entry_ok, _) = rm.can_trade(true);
        assert!(!entry_ok);

        let (exit_ok, _) = rm.can_trade(false);
        assert!(exit_ok);
    }

    #[test]
    fn on_new_bar_ends_cooldown_at_deadline() {
        let rm = RiskManager::new(RiskConfig { stoploss_cooldown_candles: 2, ..RiskConfig::default() });
        rm.start_stoploss_cooldown(0, 60_000);
        assert!(!rm.on_new_bar(60_000));
        assert!(rm.on_new_bar(120_000));
        assert!(!rm.is_in_stoploss_cooldown());
    }

    #[test]
    fn zero_cooldown_candles_never_blocks() {
        let rm = RiskManager::new(RiskConfig { stoploss_cooldown_candles: 0, ..RiskConfig::default() });
        rm.start_stoploss_cooldown(0, 60_000);
        assert!(!rm.is_in_stoploss_cooldown());
    }
}
