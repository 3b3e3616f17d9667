// =============================================================================
// Runtime Configuration — engine settings with atomic save
// =============================================================================
//
// Central configuration for the live trading core. Every field carries
// `#[serde(default = "...")]` so adding a field never breaks loading an older
// config file. Persistence uses the atomic tmp + rename pattern to prevent
// corruption on crash.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::{AccountMode, RiskConfig, TradingMode};

fn default_symbols() -> Vec<String> {
    vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]
}

fn default_trade_interval() -> String {
    "5m".to_string()
}

fn default_leverage() -> f64 {
    3.0
}

fn default_entry_pct() -> f64 {
    0.1
}

fn default_history_seed_bars() -> usize {
    1000
}

fn default_indicator_buffer_bars() -> usize {
    500
}

fn default_chase_max_attempts() -> u32 {
    5
}

fn default_chase_interval_ms() -> u64 {
    1000
}

fn default_chase_slippage_bps() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

fn default_recv_window_ms() -> i64 {
    60_000
}

/// Per-symbol trading configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolConfig {
    pub symbol: String,
    #[serde(default = "default_trade_interval")]
    pub trade_interval: String,
    #[serde(default = "default_leverage")]
    pub leverage: f64,
    #[serde(default = "default_entry_pct")]
    pub entry_pct: f64,
    #[serde(default)]
    pub risk_override: Option<RiskConfig>,
}

/// Chase-limit order tuning, shared by every `SymbolContext`'s order router.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ChaseConfig {
    #[serde(default = "default_chase_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_chase_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_chase_slippage_bps")]
    pub slippage_bps: f64,
    #[serde(default = "default_true")]
    pub fallback_to_market: bool,
}

impl Default for ChaseConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_chase_max_attempts(),
            interval_ms: default_chase_interval_ms(),
            slippage_bps: default_chase_slippage_bps(),
            fallback_to_market: true,
        }
    }
}

/// Top-level runtime configuration, loaded once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,
    #[serde(default)]
    pub symbol_configs: Vec<SymbolConfig>,
    #[serde(default)]
    pub portfolio_risk: RiskConfig,
    #[serde(default)]
    pub chase: ChaseConfig,
    #[serde(default = "default_history_seed_bars")]
    pub history_seed_bars: usize,
    #[serde(default = "default_indicator_buffer_bars")]
    pub indicator_buffer_bars: usize,
    #[serde(default = "default_recv_window_ms")]
    pub recv_window_ms: i64,
    #[serde(default)]
    pub trading_mode: TradingMode,
    #[serde(default)]
    pub account_mode: AccountMode,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            symbol_configs: Vec::new(),
            portfolio_risk: RiskConfig::default(),
            chase: ChaseConfig::default(),
            history_seed_bars: default_history_seed_bars(),
            indicator_buffer_bars: default_indicator_buffer_bars(),
            recv_window_ms: default_recv_window_ms(),
            trading_mode: TradingMode::default(),
            account_mode: AccountMode::default(),
        }
    }
}

impl RuntimeConfig {
    /// Load config from `path`; falls back to `Self::default()` with a
    /// logged warning on any error (missing file, bad JSON).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(path = %path.display(), symbols = ?config.symbols, "runtime config loaded");
        Ok(config)
    }

    /// Resolve the symbols list into concrete `SymbolConfig`s, synthesizing
    /// defaults for any symbol in `symbols` with no explicit entry.
    pub fn resolved_symbol_configs(&self) -> Vec<SymbolConfig> {
        self.symbols
            .iter()
            .map(|sym| {
                self.symbol_configs
                    .iter()
                    .find(|sc| &sc.symbol == sym)
                    .cloned()
                    .unwrap_or_else(|| SymbolConfig {
                        symbol: sym.clone(),
                        trade_interval: default_trade_interval(),
                        leverage: default_leverage(),
                        entry_pct: default_entry_pct(),
                        risk_override: None,
                    })
            })
            .collect()
    }

    /// Persist config atomically (write to `.tmp`, then rename) so a crash
    /// mid-write never corrupts the on-disk file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self).context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    /// Force the safe startup posture: paused trading, demo account. Called
    /// unconditionally by `main` regardless of what was persisted.
    pub fn force_safe_startup(&mut self) {
        if self.trading_mode != TradingMode::Paused || self.account_mode != AccountMode::Demo {
            warn!("overriding persisted trading/account mode to Paused/Demo for safe startup");
        }
        self.trading_mode = TradingMode::Paused;
        self.account_mode = AccountMode::Demo;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_starts_paused_and_demo() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.trading_mode, TradingMode::Paused);
        assert_eq!(cfg.account_mode, AccountMode::Demo);
    }

    #[test]
    fn resolved_symbol_configs_synthesizes_defaults() {
        let mut cfg = RuntimeConfig::default();
        cfg.symbols = vec!["BTCUSDT".to_string()];
        cfg.symbol_configs = Vec::new();
        let resolved = cfg.resolved_symbol_configs();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].symbol, "BTCUSDT");
        assert_eq!(resolved[0].leverage, default_leverage());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = std::env::temp_dir().join(format!("perp_live_core_cfg_test_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("runtime_config.json");

        let mut cfg = RuntimeConfig::default();
        cfg.symbols = vec!["ETHUSDT".to_string()];
        cfg.save(&path).unwrap();

        let loaded = RuntimeConfig::load(&path).unwrap();
        assert_eq!(loaded.symbols, vec!["ETHUSDT".to_string()]);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
