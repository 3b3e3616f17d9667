// =============================================================================
// Typed errors — one enum per subsystem boundary the error taxonomy branches on
// =============================================================================
//
// Everything else (startup glue, fire-and-forget tasks, reconciliation sweeps)
// keeps using `anyhow::Result` the way the rest of this codebase does. These
// types exist only where a caller must match on the *kind* of failure to pick
// a policy: the exchange retry loop, the order router's rejection handling,
// and config loading.
// =============================================================================

use std::fmt;

/// Failure classes returned by `ExchangeClient`'s signed-request path.
/// Mirrors the retry-policy table: callers match on this to decide whether to
/// resync, back off, or fail fast.
#[derive(Debug)]
pub enum ExchangeError {
    /// `-1021` — local clock drifted outside the exchange's recvWindow.
    TimestampOutOfWindow,
    /// HTTP 418 with an embedded `banned until <ms>` epoch timestamp.
    Banned { until_ms: i64 },
    /// HTTP 429 or API code `-1003` — weight/order-rate limit exceeded.
    RateLimited,
    /// Any other non-2xx response; carries the exchange's own error code and
    /// message when the body could be parsed as `{code, msg}`.
    Rejected { code: i64, message: String },
    /// Transport-level failure (timeout, connection reset, DNS, TLS).
    Transport(String),
    /// Retries exhausted without a successful response.
    RetriesExhausted,
}

impl fmt::Display for ExchangeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TimestampOutOfWindow => write!(f, "timestamp outside recvWindow (-1021)"),
            Self::Banned { until_ms } => write!(f, "IP banned until {until_ms}"),
            Self::RateLimited => write!(f, "rate limited (429/-1003)"),
            Self::Rejected { code, message } => write!(f, "exchange rejected request: {code} {message}"),
            Self::Transport(msg) => write!(f, "transport error: {msg}"),
            Self::RetriesExhausted => write!(f, "retries exhausted"),
        }
    }
}

impl std::error::Error for ExchangeError {}

impl From<reqwest::Error> for ExchangeError {
    fn from(e: reqwest::Error) -> Self {
        ExchangeError::Transport(e.to_string())
    }
}

/// Rejection reasons the order router surfaces instead of placing an order.
/// Matches SPEC_FULL §7's "pre-trade rejection" class: no retry, the strategy
/// is notified by return value, the engine keeps running.
#[derive(Debug, Clone, PartialEq)]
pub enum RejectKind {
    BelowMinQty,
    BelowMinNotional,
    StoplossCooldown,
    PortfolioRiskDenied(String),
    SymbolRiskDenied(String),
    OrderInflight,
    Stopped,
}

impl fmt::Display for RejectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BelowMinQty => write!(f, "ORDER_REJECTED_MIN_QTY"),
            Self::BelowMinNotional => write!(f, "ORDER_REJECTED_MIN_NOTIONAL"),
            Self::StoplossCooldown => write!(f, "ORDER_REJECTED_STOPLOSS_COOLDOWN"),
            Self::PortfolioRiskDenied(reason) => write!(f, "ORDER_REJECTED_PORTFOLIO_RISK: {reason}"),
            Self::SymbolRiskDenied(reason) => write!(f, "ORDER_REJECTED_SYMBOL_RISK: {reason}"),
            Self::OrderInflight => write!(f, "ORDER_REJECTED_INFLIGHT"),
            Self::Stopped => write!(f, "ORDER_REJECTED_STOPPED"),
        }
    }
}

/// Order routing outcome. Strategy code receives this as a plain return
/// value — never a thrown error — per SPEC_FULL §9's typed-result-variant
/// replacement for the source's exception-based rejection.
#[derive(Debug, Clone)]
pub enum OrderError {
    Rejected(RejectKind),
    /// The chase algorithm exhausted its attempts with `fallback_to_market`
    /// disabled, or the final residual was impossible to fill.
    ChaseFailed { remaining_qty: f64 },
    /// An I/O failure while placing/polling/canceling an order.
    Exchange(String),
}

impl fmt::Display for OrderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected(kind) => write!(f, "{kind}"),
            Self::ChaseFailed { remaining_qty } => {
                write!(f, "CHASE_FAILED: {remaining_qty} remaining unfilled")
            }
            Self::Exchange(msg) => write!(f, "exchange error: {msg}"),
        }
    }
}

impl std::error::Error for OrderError {}

impl From<ExchangeError> for OrderError {
    fn from(e: ExchangeError) -> Self {
        OrderError::Exchange(e.to_string())
    }
}

/// Startup/config failures — always fatal per SPEC_FULL §7's "Fatal" class.
#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    MissingCredentials,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(msg) => write!(f, "config io error: {msg}"),
            Self::Parse(msg) => write!(f, "config parse error: {msg}"),
            Self::MissingCredentials => write!(f, "missing API credentials"),
        }
    }
}

impl std::error::Error for ConfigError {}
