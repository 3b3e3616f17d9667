// =============================================================================
// PriceFeed — authoritative candle series + normalized tick stream
// =============================================================================
//
// Wraps a `CandleBuffer` for one `(symbol, interval)` stream: seeds it with
// historic closed candles before opening the live kline websocket, then
// converts every inbound message into a `PriceTick` the engine dispatches to
// `IndicatorContext` and `SymbolContext`. Reconnects on error with the same
// backoff schedule as `UserStreamHub` (see §4.D).
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};

use crate::binance::client::ExchangeClient;
use crate::market_data::candle_buffer::{Candle as WsCandle, CandleBuffer, CandleKey};

/// Normalized tick emitted to the engine's dispatch loop.
#[derive(Debug, Clone)]
pub struct PriceTick {
    pub symbol: String,
    pub interval: String,
    pub timestamp: i64,
    pub price: f64,
    pub bar_timestamp: i64,
    pub bar_open: f64,
    pub bar_high: f64,
    pub bar_low: f64,
    pub bar_close: f64,
    pub volume: f64,
    pub is_new_bar: bool,
}

/// Reconnect backoff shared with `UserStreamHub`: `min(5*(1+n mod 5), 30)s`.
fn reconnect_backoff(attempt: u32) -> Duration {
    let secs = 5.0 * (1.0 + (attempt % 5) as f64);
    Duration::from_secs_f64(secs.min(30.0))
}

pub struct PriceFeed {
    symbol: String,
    interval: String,
    key: CandleKey,
    buffer: Arc<CandleBuffer>,
    exchange: ExchangeClient,
}

impl PriceFeed {
    pub fn new(symbol: impl Into<String>, interval: impl Into<String>, buffer: Arc<CandleBuffer>, exchange: ExchangeClient) -> Self {
        let symbol = symbol.into();
        let interval = interval.into();
        let key = CandleKey { symbol: symbol.clone(), interval: interval.clone() };
        Self { symbol, interval, key, buffer, exchange }
    }

    /// Fetch the most recent `count` closed candles and apply them to the
    /// buffer in chronological order. Failure here is fatal to engine
    /// startup — the engine must never run on an empty indicator buffer.
    pub async fn seed_history(&self, count: usize) -> Result<()> {
        let candles = self
            .exchange
            .get_klines(&self.symbol, &self.interval, count)
            .await
            .with_context(|| format!("failed to seed history for {}@{}", self.symbol, self.interval))?;

        if candles.is_empty() {
            bail!("exchange returned no history for {}@{}", self.symbol, self.interval);
        }

        for c in candles {
            self.buffer.update(
                self.key.clone(),
                WsCandle {
                    open_time: c.open_time,
                    close_time: c.close_time,
                    open: c.open,
                    high: c.high,
                    low: c.low,
                    close: c.close,
                    volume: c.volume,
                    quote_volume: 0.0,
                    trades_count: 0,
                    taker_buy_volume: 0.0,
                    taker_buy_quote_volume: 0.0,
                    is_closed: true,
                },
            );
        }

        info!(symbol = %self.symbol, interval = %self.interval, "history seeded");
        Ok(())
    }

    /// Run the live stream forever, reconnecting with backoff on error.
    /// Every normalized tick is sent on `tx`; the receiver end is read by the
    /// engine's dispatch loop.
    pub async fn run(&self, tx: mpsc::Sender<PriceTick>) {
        let mut attempt: u32 = 0;
        loop {
            match self.run_once(&tx).await {
                Ok(()) => {
                    warn!(symbol = %self.symbol, interval = %self.interval, "kline stream ended, reconnecting");
                }
                Err(e) => {
                    error!(symbol = %self.symbol, interval = %self.interval, error = %e, "kline stream error, reconnecting");
                }
            }
            let backoff = reconnect_backoff(attempt);
            attempt = attempt.wrapping_add(1);
            tokio::time::sleep(backoff).await;
        }
    }

    async fn run_once(&self, tx: &mpsc::Sender<PriceTick>) -> Result<()> {
        let lower = self.symbol.to_lowercase();
        let url = format!("wss://fstream.binance.com/ws/{lower}@kline_{}", self.interval);
        info!(url = %url, "connecting to price feed");

        let (ws_stream, _) = connect_async(&url).await.context("failed to connect to kline websocket")?;
        let (_write, mut read) = ws_stream.split();

        let mut last_emitted_open_time: i64 = i64::MIN;

        loop {
            match read.next().await {
                Some(Ok(tokio_tungstenite::tungstenite::Message::Text(text))) => {
                    match parse_tick(&text) {
                        Ok(Some((open_time, candle))) => {
                            if open_time < last_emitted_open_time {
                                debug!(open_time, "dropping late-arriving candle");
                                continue;
                            }

                            let is_new_bar = candle.is_closed && open_time > last_emitted_open_time;
                            if is_new_bar {
                                last_emitted_open_time = open_time;
                            }

                            let tick = PriceTick {
                                symbol: self.symbol.clone(),
                                interval: self.interval.clone(),
                                timestamp: chrono::Utc::now().timestamp_millis(),
                                price: candle.close,
                                bar_timestamp: open_time,
                                bar_open: candle.open,
                                bar_high: candle.high,
                                bar_low: candle.low,
                                bar_close: candle.close,
                                volume: candle.volume,
                                is_new_bar,
                            };

                            self.buffer.update(self.key.clone(), candle);

                            if tx.send(tick).await.is_err() {
                                return Ok(());
                            }
                        }
                        Ok(None) => {}
                        Err(e) => warn!(error = %e, "failed to parse kline message"),
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => bail!("kline websocket read error: {e}"),
                None => return Ok(()),
            }
        }
    }
}

fn parse_tick(text: &str) -> Result<Option<(i64, WsCandle)>> {
    let root: serde_json::Value = serde_json::from_str(text).context("invalid kline JSON")?;
    let data = if root.get("data").is_some() { &root["data"] } else { &root };
    let k = &data["k"];

    if k.is_null() {
        return Ok(None);
    }

    let open_time = k["t"].as_i64().context("missing k.t")?;
    let close_time = k["T"].as_i64().context("missing k.T")?;
    let is_closed = k["x"].as_bool().unwrap_or(false);

    let parse = |v: &serde_json::Value| -> f64 {
        v.as_str().and_then(|s| s.parse().ok()).or_else(|| v.as_f64()).unwrap_or(0.0)
    };

    let candle = WsCandle {
        open_time,
        close_time,
        open: parse(&k["o"]),
        high: parse(&k["h"]),
        low: parse(&k["l"]),
        close: parse(&k["c"]),
        volume: parse(&k["v"]),
        quote_volume: parse(&k["q"]),
        trades_count: k["n"].as_u64().unwrap_or(0),
        taker_buy_volume: parse(&k["V"]),
        taker_buy_quote_volume: parse(&k["Q"]),
        is_closed,
    };

    Ok(Some((open_time, candle)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_tick_reads_closed_flag_and_times() {
        let json = r#"{"e":"kline","s":"BTCUSDT","k":{"t":1000,"T":1059,"o":"10","h":"11","l":"9","c":"10.5","v":"100","q":"1000","n":5,"V":"50","Q":"500","x":true}}"#;
        let (open_time, candle) = parse_tick(json).unwrap().unwrap();
        assert_eq!(open_time, 1000);
        assert!(candle.is_closed);
        assert_eq!(candle.close, 10.5);
    }

    #[test]
    fn reconnect_backoff_caps_at_30s() {
        assert_eq!(reconnect_backoff(0), Duration::from_secs_f64(5.0));
        assert_eq!(reconnect_backoff(4), Duration::from_secs_f64(25.0));
        assert_eq!(reconnect_backoff(9), Duration::from_secs_f64(25.0));
        for n in 0..20 {
            assert!(reconnect_backoff(n).as_secs_f64() <= 30.0);
        }
    }
}
