// =============================================================================
// SymbolContext — per-symbol mutable trading state, Chase-Limit OrderRouter
// =============================================================================
//
// Owns `Position`, open orders, counters, inflight guard, and audit log for
// one tradable symbol. All mutations are serialized through `order_lock`: an
// async mutex held for the duration of any state-changing call, which gives
// the same FIFO-per-symbol guarantee the mailbox model in the concurrency
// design calls for, without a dedicated channel-reader task per symbol.
// =============================================================================

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use tokio::sync::Mutex as AsyncMutex;
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::audit::AuditLog;
use crate::binance::client::ExchangeClient;
use crate::config::{ChaseConfig, SymbolConfig};
use crate::errors::{OrderError, RejectKind};
use crate::idempotency::BoundedIdSet;
use crate::market_data::BookTickerFeed;
use crate::risk::RiskManager;
use crate::types::{Order, OrderStatus, OrderType, Position, PrecisionFilters, RealizedPnl, Side};

const INFLIGHT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);
const USER_STREAM_WAIT: Duration = Duration::from_millis(500);
const PROCESSED_ID_CAPACITY: usize = 10_000;

/// The inflight order state machine. `entered_at` marks when the slot left
/// `Idle`; a call that finds it occupied past `INFLIGHT_LOCK_TIMEOUT` force-
/// releases it and takes the slot itself, so one stuck call can never wedge
/// the symbol forever.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InflightState {
    Idle,
    Placing,
    Settling(u64),
}

#[derive(Debug, Clone, Copy)]
struct Inflight {
    state: InflightState,
    entered_at: Instant,
}

impl Inflight {
    fn idle() -> Self {
        Self { state: InflightState::Idle, entered_at: Instant::now() }
    }
}

/// Seam the portfolio layer implements so `SymbolContext` can run a pre-trade
/// check without owning a reference back into `PortfolioContext` (would be a
/// cycle: portfolio owns every symbol context). Wired in after construction
/// via `set_portfolio_gate`.
pub trait PortfolioGate: Send + Sync {
    /// `signed_qty_delta` is the would-be change in signed position size
    /// (positive for a growing buy, negative for a growing sell); the caller
    /// has already established the order grows position magnitude before
    /// calling this.
    fn check_pre_trade(&self, symbol: &str, signed_qty_delta: f64, price: f64) -> Result<(), String>;
}

/// Outcome of a fill, used to route counter updates and cooldown activation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FillEvent {
    Entry,
    Exit,
    Adjust,
}

pub struct SymbolContext {
    pub symbol: String,
    interval: String,
    interval_ms: i64,
    exchange: ExchangeClient,
    book_ticker: Arc<BookTickerFeed>,
    filters: RwLock<PrecisionFilters>,
    position: RwLock<Position>,
    balance: RwLock<f64>,
    leverage: RwLock<f64>,
    entry_pct: f64,
    pub risk: RiskManager,
    open_orders: RwLock<HashMap<u64, Order>>,
    processed_order_ids: RwLock<BoundedIdSet>,
    processed_trade_ids: RwLock<BoundedIdSet>,
    inflight: AsyncMutex<Inflight>,
    order_lock: AsyncMutex<()>,
    pub audit: AuditLog,
    chase: ChaseConfig,
    last_bar_ts: RwLock<i64>,
    last_price: RwLock<f64>,
    portfolio_gate: RwLock<Option<Arc<dyn PortfolioGate>>>,
    stopped: RwLock<bool>,
    self_ref: RwLock<Option<Weak<SymbolContext>>>,
}

impl SymbolContext {
    pub fn new(
        cfg: SymbolConfig,
        exchange: ExchangeClient,
        book_ticker: Arc<BookTickerFeed>,
        chase: ChaseConfig,
    ) -> Self {
        let interval_ms = interval_to_ms(&cfg.trade_interval);
        Self {
            symbol: cfg.symbol,
            interval: cfg.trade_interval,
            interval_ms,
            exchange,
            book_ticker,
            filters: RwLock::new(PrecisionFilters { step_size: 0.001, tick_size: 0.1, min_notional: 5.0, min_qty: 0.001, max_qty: f64::MAX }),
            position: RwLock::new(Position::default()),
            balance: RwLock::new(0.0),
            leverage: RwLock::new(cfg.leverage),
            entry_pct: cfg.entry_pct,
            risk: RiskManager::new(cfg.risk_override.unwrap_or_default()),
            open_orders: RwLock::new(HashMap::new()),
            processed_order_ids: RwLock::new(BoundedIdSet::new(PROCESSED_ID_CAPACITY)),
            processed_trade_ids: RwLock::new(BoundedIdSet::new(PROCESSED_ID_CAPACITY)),
            inflight: AsyncMutex::new(Inflight::idle()),
            order_lock: AsyncMutex::new(()),
            audit: AuditLog::default(),
            chase,
            last_bar_ts: RwLock::new(0),
            last_price: RwLock::new(0.0),
            portfolio_gate: RwLock::new(None),
            stopped: RwLock::new(false),
            self_ref: RwLock::new(None),
        }
    }

    /// Lets the context spawn tasks that own an `Arc` back to itself (e.g. a
    /// stop-loss close running off the tick-dispatch path). Call once, right
    /// after wrapping the freshly constructed context in an `Arc`.
    pub fn set_self_ref(&self, weak: Weak<SymbolContext>) {
        *self.self_ref.write() = Some(weak);
    }

    pub fn set_portfolio_gate(&self, gate: Arc<dyn PortfolioGate>) {
        *self.portfolio_gate.write() = Some(gate);
    }

    pub fn request_stop(&self) {
        *self.stopped.write() = true;
    }

    // -------------------------------------------------------------------------
    // Startup
    // -------------------------------------------------------------------------

    /// Sync time, fetch exchange-info filters, set leverage (skipped with a
    /// logged event if an existing position is already open), fetch the
    /// initial wallet balance.
    pub async fn initialize(&self) -> anyhow::Result<()> {
        self.exchange.sync_time().await?;

        let filters = self.exchange.get_exchange_info(&self.symbol).await?;
        *self.filters.write() = filters;
        info!(symbol = %self.symbol, "EXCHANGE_INFO_LOADED");
        self.audit.record("EXCHANGE_INFO_LOADED", format!("{:?}", filters));

        if self.position.read().is_flat() {
            let leverage = *self.leverage.read();
            self.exchange.set_leverage(&self.symbol, leverage as u32).await?;
            info!(symbol = %self.symbol, leverage, "LEVERAGE_SET");
            self.audit.record("LEVERAGE_SET", format!("leverage={leverage}"));
        } else {
            info!(symbol = %self.symbol, "LEVERAGE_SET_SKIPPED");
            self.audit.record("LEVERAGE_SET_SKIPPED", "existing position is non-zero");
        }

        let bal = self.exchange.get_balance("USDT").await.unwrap_or(0.0);
        *self.balance.write() = bal;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Read-only strategy surface
    // -------------------------------------------------------------------------

    pub fn position_snapshot(&self) -> Position {
        *self.position.read()
    }

    pub fn balance(&self) -> f64 {
        *self.balance.read()
    }

    pub fn total_equity(&self) -> f64 {
        self.balance() + self.position.read().unrealized_pnl
    }

    pub fn leverage(&self) -> f64 {
        *self.leverage.read()
    }

    pub fn interval(&self) -> &str {
        &self.interval
    }

    pub fn current_price(&self) -> f64 {
        *self.last_price.read()
    }

    pub fn get_open_orders(&self) -> Vec<Order> {
        self.open_orders.read().values().cloned().collect()
    }

    // -------------------------------------------------------------------------
    // Mark price / stop loss
    // -------------------------------------------------------------------------

    /// Called on every price update. Marks the position and evaluates the
    /// risk-config stop-loss.
    pub async fn on_mark_price(&self, price: f64) {
        *self.last_price.write() = price;
        {
            let mut pos = self.position.write();
            pos.mark(price);
        }
        self.evaluate_stop_loss(price).await;
    }

    async fn evaluate_stop_loss(&self, price: f64) {
        let (size, entry_balance, unrealized_pnl) = {
            let pos = self.position.read();
            (pos.size, pos.entry_balance, pos.unrealized_pnl)
        };
        if size.abs() < 1e-12 || entry_balance <= 0.0 {
            return;
        }

        let pnl_pct = unrealized_pnl / entry_balance;
        let stop_loss_pct = self.risk.config().stop_loss_pct;

        if pnl_pct <= -stop_loss_pct {
            warn!(symbol = %self.symbol, pnl_pct, "stop-loss triggered");
            let Some(arc_self) = self.self_ref.read().clone().and_then(|weak| weak.upgrade()) else {
                warn!(symbol = %self.symbol, "stop-loss triggered but self_ref unset, cannot spawn close");
                return;
            };
            // Off the dispatch path: a chase-limit close can run for several
            // seconds and must not block ticks for every other symbol.
            tokio::spawn(async move {
                if let Err(e) = arc_self.close_position("StopLoss", true, price).await {
                    warn!(symbol = %arc_self.symbol, error = %e, "ORDER_REJECTED on stop-loss close");
                }
            });
        }
    }

    /// Called on every new closed bar of the symbol's trading interval:
    /// advances the cooldown timer and records `bar_ts` for future cooldown
    /// windows started by a stop-loss exit.
    pub fn on_new_bar(&self, bar_ts: i64) {
        *self.last_bar_ts.write() = bar_ts;
        self.risk.on_new_bar(bar_ts);
    }

    // -------------------------------------------------------------------------
    // Inflight guard
    // -------------------------------------------------------------------------

    async fn acquire_inflight(&self) -> bool {
        let mut slot = self.inflight.lock().await;
        let occupied = slot.state != InflightState::Idle;
        if occupied && slot.entered_at.elapsed() <= INFLIGHT_LOCK_TIMEOUT {
            return false;
        }
        if occupied {
            let stale_state = slot.state;
            warn!(symbol = %self.symbol, ?stale_state, "order_inflight timeout: releasing lock");
        }
        *slot = Inflight { state: InflightState::Placing, entered_at: Instant::now() };
        true
    }

    async fn release_inflight(&self) {
        *self.inflight.lock().await = Inflight::idle();
    }

    // -------------------------------------------------------------------------
    // Sizing
    // -------------------------------------------------------------------------

    /// `target_notional = equity * leverage * min(entry_pct, max_position)`,
    /// divided by price, rounded down to step_size, clamped to
    /// `[min_qty, max_qty]`, `0.0` if below `min_notional`.
    pub fn calc_entry_quantity(&self, entry_pct: Option<f64>, price: f64) -> f64 {
        if price <= 0.0 {
            return 0.0;
        }
        let cfg = self.risk.config();
        let pct = entry_pct.unwrap_or(self.entry_pct).min(cfg.max_position_size);
        let equity = self.total_equity();
        let leverage = self.leverage();
        let target_notional = equity * leverage * pct;
        let qty = target_notional / price;
        self.filters.read().clamp_order(qty, price)
    }

    // -------------------------------------------------------------------------
    // Order intents
    // -------------------------------------------------------------------------

    pub async fn buy(&self, qty: f64, price: Option<f64>, reason: &str, use_chase: bool) -> Result<(), OrderError> {
        self.place(Side::Buy, qty, price, reason, use_chase).await
    }

    pub async fn sell(&self, qty: f64, price: Option<f64>, reason: &str, use_chase: bool) -> Result<(), OrderError> {
        self.place(Side::Sell, qty, price, reason, use_chase).await
    }

    pub async fn close_position(&self, reason: &str, use_chase: bool, mark_price: f64) -> Result<(), OrderError> {
        let size = self.position.read().size;
        if size.abs() < 1e-12 {
            return Ok(());
        }
        let side = if size > 0.0 { Side::Sell } else { Side::Buy };
        self.place_with_price_hint(side, size.abs(), None, reason, use_chase, mark_price).await
    }

    async fn place(&self, side: Side, qty: f64, price: Option<f64>, reason: &str, use_chase: bool) -> Result<(), OrderError> {
        let current_price = price.unwrap_or_else(|| self.book_ticker.latest().map(|(b, a)| (b + a) / 2.0).unwrap_or(0.0));
        self.place_with_price_hint(side, qty, price, reason, use_chase, current_price).await
    }

    async fn place_with_price_hint(
        &self,
        side: Side,
        qty: f64,
        price: Option<f64>,
        reason: &str,
        use_chase: bool,
        current_price: f64,
    ) -> Result<(), OrderError> {
        if *self.stopped.read() {
            return Err(OrderError::Rejected(RejectKind::Stopped));
        }

        if !self.acquire_inflight().await {
            return Err(OrderError::Rejected(RejectKind::OrderInflight));
        }

        let result = self.execute_order(side, qty, price, reason, use_chase, current_price).await;
        self.release_inflight().await;
        result
    }

    async fn execute_order(
        &self,
        side: Side,
        qty: f64,
        price: Option<f64>,
        reason: &str,
        use_chase: bool,
        current_price: f64,
    ) -> Result<(), OrderError> {
        let _guard = self.order_lock.lock().await;

        let filters = *self.filters.read();
        let qty = filters.round_qty_down(qty);
        let reference_price = price.or_else(|| self.book_ticker.latest().map(|(b, a)| (b + a) / 2.0)).unwrap_or(current_price).max(1e-9);

        self.check_preconditions(qty, filters, side, reference_price)?;

        info!(symbol = %self.symbol, %side, qty, reason, "ORDER_PLACED");
        self.audit.record("ORDER_PLACED", format!("{side} {qty} reason={reason}"));

        let outcome = if use_chase && price.is_none() {
            self.run_chase(side, qty, reason, filters).await
        } else {
            self.place_single_order(side, qty, price, false).await
        };

        match &outcome {
            Ok(executed_qty) => {
                self.after_order_filled(side, *executed_qty, reference_price, reason).await;
                Ok(())
            }
            Err(e) => Err(e.clone()),
        }
    }

    /// Precision, min-notional, and risk checks. Re-run on every chase
    /// attempt (not just the order's first pass), since position state,
    /// cooldowns, and portfolio exposure can all shift between attempts.
    fn check_preconditions(&self, qty: f64, filters: PrecisionFilters, side: Side, reference_price: f64) -> Result<(), OrderError> {
        if qty < filters.min_qty {
            self.audit.record("ORDER_REJECTED", RejectKind::BelowMinQty.to_string());
            return Err(OrderError::Rejected(RejectKind::BelowMinQty));
        }
        if qty * reference_price < filters.min_notional {
            self.audit.record("ORDER_REJECTED", RejectKind::BelowMinNotional.to_string());
            return Err(OrderError::Rejected(RejectKind::BelowMinNotional));
        }

        let before_size = self.position.read().size;
        let signed_delta = side.sign() * qty;
        let after_size = before_size + signed_delta;
        let is_growing = after_size.abs() > before_size.abs();
        if !is_growing {
            return Ok(());
        }

        if before_size.abs() < 1e-12 && self.risk.is_in_stoploss_cooldown() {
            self.audit.record("ORDER_REJECTED", RejectKind::StoplossCooldown.to_string());
            return Err(OrderError::Rejected(RejectKind::StoplossCooldown));
        }

        let (ok, deny_reason) = self.risk.can_trade(true);
        if !ok {
            let kind = RejectKind::SymbolRiskDenied(deny_reason.unwrap_or_default());
            self.audit.record("ORDER_REJECTED", kind.to_string());
            return Err(OrderError::Rejected(kind));
        }

        if let Some(gate) = self.portfolio_gate.read().clone() {
            if let Err(reason) = gate.check_pre_trade(&self.symbol, signed_delta, reference_price) {
                let kind = RejectKind::PortfolioRiskDenied(reason);
                self.audit.record("ORDER_REJECTED", kind.to_string());
                return Err(OrderError::Rejected(kind));
            }
        }

        Ok(())
    }

    // -------------------------------------------------------------------------
    // Order placement primitives
    // -------------------------------------------------------------------------

    async fn place_single_order(&self, side: Side, qty: f64, price: Option<f64>, reduce_only: bool) -> Result<f64, OrderError> {
        let order_type = if price.is_some() { "LIMIT" } else { "MARKET" };
        let tif = if price.is_some() { Some("GTX") } else { None };

        let resp = self
            .exchange
            .place_order(&self.symbol, side.as_str(), order_type, qty, price, tif, reduce_only)
            .await
            .map_err(OrderError::from)?;

        let status = resp["status"].as_str().unwrap_or("NEW");
        let executed_qty: f64 = resp["executedQty"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0);

        if let Some(order_id) = resp["orderId"].as_u64() {
            self.track_order(order_id, side, qty, price, status, executed_qty);
        }

        if status == "FILLED" {
            Ok(executed_qty)
        } else if status == "EXPIRED" {
            Err(OrderError::Exchange(format!("order expired unfilled (executed_qty={executed_qty})")))
        } else {
            Ok(executed_qty)
        }
    }

    fn track_order(&self, order_id: u64, side: Side, qty: f64, price: Option<f64>, status: &str, executed_qty: f64) {
        let parsed_status = match status {
            "FILLED" => OrderStatus::Filled,
            "PARTIALLY_FILLED" => OrderStatus::PartiallyFilled,
            "CANCELED" => OrderStatus::Canceled,
            "EXPIRED" => OrderStatus::Expired,
            "REJECTED" => OrderStatus::Rejected,
            _ => OrderStatus::New,
        };
        if parsed_status.is_terminal() {
            self.processed_order_ids.write().insert(order_id);
        }

        let mut orders = self.open_orders.write();
        if parsed_status.is_terminal() {
            orders.remove(&order_id);
        } else {
            orders.insert(
                order_id,
                Order {
                    order_id,
                    symbol: self.symbol.clone(),
                    side,
                    order_type: if price.is_some() { OrderType::Limit } else { OrderType::Market },
                    status: parsed_status,
                    quantity: qty,
                    price: price.unwrap_or(0.0),
                    executed_qty,
                    avg_price: price.unwrap_or(0.0),
                    reduce_only: false,
                    post_only: price.is_some(),
                },
            );
        }
    }

    // -------------------------------------------------------------------------
    // Chase-Limit order router
    // -------------------------------------------------------------------------

    /// Runs the Chase-Limit algorithm: `max_attempts` tries at a post-only
    /// price tracking the top of book, falling back to a market order for the
    /// unfilled residual when exhausted.
    async fn run_chase(&self, side: Side, qty: f64, reason: &str, filters: PrecisionFilters) -> Result<f64, OrderError> {
        let initial_size = self.position.read().size;
        let target_size = initial_size + side.sign() * qty;

        if chase_already_filled(side, self.position.read().size, target_size) {
            return Ok(qty);
        }

        let mut remaining = qty;
        let mut chase_order_ids = Vec::new();

        for attempt in 0..self.chase.max_attempts {
            if chase_already_filled(side, self.position.read().size, target_size) {
                return Ok(qty);
            }

            let tick = filters.tick_size;
            let price = match self.book_ticker.latest() {
                Some((bid, ask)) => match side {
                    Side::Buy => ask - tick,
                    Side::Sell => bid + tick,
                },
                None => {
                    let current = self.position.read().entry_price.max(1e-9);
                    let slip = self.chase.slippage_bps / 10_000.0;
                    match side {
                        Side::Buy => current * (1.0 - slip),
                        Side::Sell => current * (1.0 + slip),
                    }
                }
            };
            let price = filters.round_price(price);

            // Re-validate precision/risk/portfolio preconditions on every
            // attempt: position, cooldown, and exposure can all have moved
            // since the last pass through this loop.
            self.check_preconditions(remaining, filters, side, price)?;

            self.audit.record("CHASE_ORDER_ATTEMPT", format!("attempt={} side={side} qty={remaining} price={price}", attempt + 1));

            let resp = self
                .exchange
                .place_order(&self.symbol, side.as_str(), "LIMIT", remaining, Some(price), Some("GTX"), false)
                .await
                .map_err(OrderError::from)?;

            let status = resp["status"].as_str().unwrap_or("NEW").to_string();
            let order_id = resp["orderId"].as_u64();
            if let Some(id) = order_id {
                chase_order_ids.push(id);
            }

            if status == "FILLED" {
                if let Some(id) = order_id {
                    self.processed_order_ids.write().insert(id);
                }
                self.audit.record("CHASE_ORDER_FILLED", format!("order_id={:?} attempts={}", order_id, attempt + 1));
                return Ok(qty);
            }

            if status == "EXPIRED" {
                self.audit.record("CHASE_ORDER_EXPIRED_GTX", format!("attempt={}", attempt + 1));
                continue;
            }

            if status == "NEW" || status == "PARTIALLY_FILLED" {
                tokio::time::sleep(Duration::from_millis(self.chase.interval_ms)).await;

                if let Some(id) = order_id {
                    if let Ok(info) = self.exchange.get_order(&self.symbol, id).await {
                        let now_status = info["status"].as_str().unwrap_or("");
                        let executed: f64 = info["executedQty"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0);
                        if now_status == "FILLED" {
                            self.processed_order_ids.write().insert(id);
                            self.audit.record("CHASE_ORDER_FILLED", format!("order_id={id} attempts={}", attempt + 1));
                            return Ok(qty);
                        }
                        if executed > 0.0 {
                            remaining = filters.round_qty_down(remaining - executed);
                        }
                        let _ = self.exchange.cancel_order(&self.symbol, id).await;
                        self.audit.record("CHASE_ORDER_CANCELLED", format!("order_id={id}"));
                    }
                }
            }
        }

        let pos_change = (self.position.read().size - initial_size).abs();
        if pos_change >= qty * 0.99 {
            return Ok(qty);
        }

        let residual = filters.round_qty_down(qty - pos_change);
        if residual < filters.min_qty {
            return Ok(qty);
        }

        self.audit.record(
            "CHASE_ORDER_EXHAUSTED",
            format!("attempts={:?} residual={residual} reason={reason}", chase_order_ids),
        );

        if self.chase.fallback_to_market {
            self.audit.record("CHASE_ORDER_FALLBACK_MARKET", format!("residual={residual} reason={reason}"));
            match self.place_single_order(side, residual, None, false).await {
                Ok(_) => Ok(qty),
                Err(e) => Err(e),
            }
        } else {
            Err(OrderError::ChaseFailed { remaining_qty: residual })
        }
    }

    // -------------------------------------------------------------------------
    // Fill reconciliation
    // -------------------------------------------------------------------------

    async fn after_order_filled(&self, side: Side, executed_qty: f64, fill_price: f64, reason: &str) {
        if executed_qty.abs() < 1e-12 {
            return;
        }

        let (before_size, before_entry_price) = {
            let pos = self.position.read();
            (pos.size, pos.entry_price)
        };
        let calculated_after = before_size + side.sign() * executed_qty;

        // Grace period for the user-stream hub's ACCOUNT_UPDATE to land before we
        // fall back to arithmetic-only reconciliation; the hub marks the trade id
        // processed itself when it wins the race, making this wait idempotent.
        tokio::time::sleep(USER_STREAM_WAIT).await;

        let after_api_size = self.position.read().size;
        let already_reconciled =
            (after_api_size - before_size).abs() > 1e-12 && (after_api_size - calculated_after).abs() < 1e-9;

        // If ACCOUNT_UPDATE already advanced the position to the post-fill
        // value while we were waiting, the fill is already booked against
        // exchange-authoritative state; applying it again here would double
        // the position and double-count realized PnL.
        let (event, realized) = if already_reconciled {
            let event = classify_fill(before_size, after_api_size);
            let closing_qty = before_size.abs().min(executed_qty.abs());
            let realized = if before_size.abs() > 1e-12 { before_size.signum() * closing_qty * (fill_price - before_entry_price) } else { 0.0 };
            (event, realized)
        } else {
            let balance_snapshot = self.balance();
            let realized = {
                let mut pos = self.position.write();
                pos.apply_fill(side.sign() * executed_qty, fill_price, balance_snapshot)
            };
            let after_size = self.position.read().size;
            (classify_fill(before_size, after_size), realized)
        };

        if event == FillEvent::Exit {
            let realized_pnl = RealizedPnl { gross: realized, commission: 0.0 };
            self.risk.record_trade(realized_pnl.gross);
            info!(symbol = %self.symbol, realized = realized_pnl.gross, "ORDER_FILLED");
            self.audit.record("ORDER_FILLED", format!("EXIT realized={:.6} reason={reason}", realized_pnl.gross));

            if reason.contains("StopLoss") {
                let last_bar_ts = *self.last_bar_ts.read();
                self.risk.start_stoploss_cooldown(last_bar_ts, self.interval_ms);
            }
        } else {
            self.audit.record("ORDER_FILLED", format!("{event:?} qty={executed_qty} reason={reason}"));
        }
    }

    /// Verify fills against recent user trades, ingesting any the hub or
    /// normal fill path hasn't already marked processed. Discrepancies are
    /// logged, never auto-corrected.
    pub async fn reconcile_missed_trades(&self, start_time: i64) {
        let trades = match self.exchange.get_user_trades(&self.symbol, Some(start_time), 1000).await {
            Ok(t) => t,
            Err(e) => {
                warn!(symbol = %self.symbol, error = %e, "reconcile_missed_trades: fetch failed");
                return;
            }
        };

        for trade in trades {
            let Some(id) = trade["id"].as_u64() else { continue };
            let is_new = self.processed_trade_ids.write().insert(id);
            if !is_new {
                continue;
            }

            let side = if trade["buyer"].as_bool().unwrap_or(false) { Side::Buy } else { Side::Sell };
            let qty: f64 = trade["qty"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0);
            let price: f64 = trade["price"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0);

            if qty <= 0.0 {
                continue;
            }

            self.after_order_filled(side, qty, price, "Reconciled").await;
        }
    }

    pub fn mark_order_processed(&self, order_id: u64) -> bool {
        self.processed_order_ids.write().insert(order_id)
    }

    // -------------------------------------------------------------------------
    // User-stream push handlers
    // -------------------------------------------------------------------------

    /// Apply an `ACCOUNT_UPDATE` push directly, the way the user-stream hub
    /// observes it: wallet balance and position snapshot are authoritative
    /// telemetry, not derived from our own fill arithmetic. `entry_balance` is
    /// captured on a flat->open transition and cleared on open->flat, mirroring
    /// `Position::apply_fill`'s own bookkeeping.
    pub fn apply_account_update(&self, balance: Option<f64>, position_size: Option<f64>, entry_price: Option<f64>, unrealized_pnl: Option<f64>) {
        if let Some(b) = balance {
            *self.balance.write() = b;
        }
        if let Some(size) = position_size {
            let mut pos = self.position.write();
            let prev_size = pos.size;
            pos.size = size;
            if size.abs() > 1e-12 {
                if let Some(ep) = entry_price {
                    pos.entry_price = ep;
                }
            } else {
                pos.entry_price = 0.0;
            }
            if let Some(u) = unrealized_pnl {
                pos.unrealized_pnl = u;
            }
            if prev_size.abs() < 1e-12 && size.abs() > 1e-12 {
                pos.entry_balance = *self.balance.read();
            } else if prev_size.abs() > 1e-12 && size.abs() < 1e-12 {
                pos.entry_balance = 0.0;
            }
        }
    }

    /// Apply an `ORDER_TRADE_UPDATE` push for a fill this symbol hasn't
    /// already booked through its own REST placement path. A no-op if
    /// `order_id` was already marked processed (the common case: the order
    /// that triggered this push was placed by `buy`/`sell`/chase and already
    /// ran through `after_order_filled`).
    pub async fn handle_external_order_update(&self, order_id: u64, status: &str, side: Side, executed_qty: f64, avg_price: f64) {
        if status != "FILLED" && status != "PARTIALLY_FILLED" {
            return;
        }
        if !self.mark_order_processed(order_id) {
            return;
        }
        if executed_qty <= 0.0 {
            return;
        }
        self.audit.record("ORDER_TRADE_UPDATE", format!("order_id={order_id} status={status} qty={executed_qty}"));
        self.after_order_filled(side, executed_qty, avg_price, "UserStream").await;
    }
}

fn classify_fill(before: f64, after: f64) -> FillEvent {
    if before.abs() < 1e-12 && after.abs() >= 1e-12 {
        FillEvent::Entry
    } else if before.abs() >= 1e-12 && after.abs() < 1e-12 {
        FillEvent::Exit
    } else {
        FillEvent::Adjust
    }
}

fn chase_already_filled(side: Side, current: f64, target: f64) -> bool {
    match side {
        Side::Buy => current >= target - 1e-9,
        Side::Sell => current <= target + 1e-9,
    }
}

fn interval_to_ms(interval: &str) -> i64 {
    let (num_str, unit) = interval.split_at(interval.len().saturating_sub(1));
    let n: i64 = num_str.parse().unwrap_or(1);
    match unit {
        "m" => n * 60_000,
        "h" => n * 3_600_000,
        "d" => n * 86_400_000,
        _ => n * 60_000,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_fill_detects_entry_and_exit() {
        assert_eq!(classify_fill(0.0, 0.01), FillEvent::Entry);
        assert_eq!(classify_fill(0.01, 0.0), FillEvent::Exit);
        assert_eq!(classify_fill(0.01, 0.02), FillEvent::Adjust);
    }

    #[test]
    fn chase_already_filled_checks_direction() {
        assert!(chase_already_filled(Side::Buy, 0.02, 0.01));
        assert!(!chase_already_filled(Side::Buy, 0.0, 0.02));
        assert!(chase_already_filled(Side::Sell, -0.02, -0.01));
    }

    #[test]
    fn interval_to_ms_parses_common_units() {
        assert_eq!(interval_to_ms("5m"), 300_000);
        assert_eq!(interval_to_ms("1h"), 3_600_000);
        assert_eq!(interval_to_ms("1d"), 86_400_000);
    }
}
