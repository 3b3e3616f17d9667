// =============================================================================
// BookTickerFeed — best-bid / best-ask per symbol
// =============================================================================
//
// One connection per tradable symbol. `OrderRouter` reads the latest pair
// atomically when composing a chase-limit price; if the feed has gone stale
// (no update within `freshness` — default 3s) the router falls back to
// current_price +/- slippage instead.
// =============================================================================

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use futures_util::StreamExt;
use tokio_tungstenite::connect_async;
use tracing::{error, info, warn};

const DEFAULT_FRESHNESS_MS: i64 = 3_000;

fn reconnect_backoff(attempt: u32) -> Duration {
    let secs = 5.0 * (1.0 + (attempt % 5) as f64);
    Duration::from_secs_f64(secs.min(30.0))
}

/// Bit-packed atomic pair: best_bid/best_ask stored as raw f64 bits so readers
/// never observe a torn update, plus a last-update timestamp for staleness.
pub struct BookTickerFeed {
    symbol: String,
    best_bid_bits: AtomicU64,
    best_ask_bits: AtomicU64,
    last_update_ms: AtomicI64,
    freshness_ms: i64,
}

impl BookTickerFeed {
    pub fn new(symbol: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            symbol: symbol.into(),
            best_bid_bits: AtomicU64::new(0),
            best_ask_bits: AtomicU64::new(0),
            last_update_ms: AtomicI64::new(0),
            freshness_ms: DEFAULT_FRESHNESS_MS,
        })
    }

    fn set(&self, bid: f64, ask: f64) {
        self.best_bid_bits.store(bid.to_bits(), Ordering::Relaxed);
        self.best_ask_bits.store(ask.to_bits(), Ordering::Relaxed);
        self.last_update_ms.store(chrono::Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Returns `Some((bid, ask))` if a value has been observed within the
    /// freshness window, `None` if stale or never populated.
    pub fn latest(&self) -> Option<(f64, f64)> {
        let last = self.last_update_ms.load(Ordering::Relaxed);
        if last == 0 {
            return None;
        }
        let age = chrono::Utc::now().timestamp_millis() - last;
        if age > self.freshness_ms {
            return None;
        }
        let bid = f64::from_bits(self.best_bid_bits.load(Ordering::Relaxed));
        let ask = f64::from_bits(self.best_ask_bits.load(Ordering::Relaxed));
        Some((bid, ask))
    }

    pub async fn run(self: &Arc<Self>) {
        let mut attempt: u32 = 0;
        loop {
            match self.run_once().await {
                Ok(()) => warn!(symbol = %self.symbol, "book ticker stream ended, reconnecting"),
                Err(e) => error!(symbol = %self.symbol, error = %e, "book ticker stream error, reconnecting"),
            }
            let backoff = reconnect_backoff(attempt);
            attempt = attempt.wrapping_add(1);
            tokio::time::sleep(backoff).await;
        }
    }

    async fn run_once(self: &Arc<Self>) -> Result<()> {
        let lower = self.symbol.to_lowercase();
        let url = format!("wss://fstream.binance.com/ws/{lower}@bookTicker");
        info!(url = %url, "connecting to book ticker feed");

        let (ws_stream, _) = connect_async(&url).await.context("failed to connect to book ticker websocket")?;
        let (_write, mut read) = ws_stream.split();

        loop {
            match read.next().await {
                Some(Ok(tokio_tungstenite::tungstenite::Message::Text(text))) => {
                    if let Some((bid, ask)) = parse_book_ticker(&text) {
                        self.set(bid, ask);
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => bail!("book ticker websocket read error: {e}"),
                None => return Ok(()),
            }
        }
    }
}

fn parse_book_ticker(text: &str) -> Option<(f64, f64)> {
    let root: serde_json::Value = serde_json::from_str(text).ok()?;
    let data = if root.get("data").is_some() { &root["data"] } else { &root };
    let parse = |v: &serde_json::Value| -> Option<f64> { v.as_str().and_then(|s| s.parse().ok()) };
    let bid = parse(&data["b"])?;
    let ask = parse(&data["a"])?;
    Some((bid, ask))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latest_is_none_before_any_update() {
        let feed = BookTickerFeed::new("BTCUSDT");
        assert!(feed.latest().is_none());
    }

    #[test]
    fn latest_returns_set_value_when_fresh() {
        let feed = BookTickerFeed::new("BTCUSDT");
        feed.set(100.0, 100.5);
        assert_eq!(feed.latest(), Some((100.0, 100.5)));
    }

    #[test]
    fn parse_book_ticker_reads_bid_ask() {
        let json = r#"{"u":1,"s":"BTCUSDT","b":"99.5","B":"1","a":"100.5","A":"1"}"#;
        assert_eq!(parse_book_ticker(json), Some((99.5, 100.5)));
    }
}
