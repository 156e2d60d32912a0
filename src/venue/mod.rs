//! Venue adapter layer
//!
//! Uniform async facade over each exchange: ticker/book feeds, balances,
//! order lifecycle, withdrawals and deposit addresses. Everything above this
//! module talks to a `dyn VenueAdapter`; the registry owns the handles.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

mod paper;
mod registry;

pub use paper::{FillMode, PaperVenue};
pub use registry::VenueRegistry;

/// An ordered (base, quote) currency pair, written `BASE/QUOTE`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Pair {
    pub base: String,
    pub quote: String,
}

impl Pair {
    pub fn new(base: impl Into<String>, quote: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            quote: quote.into(),
        }
    }

    /// True if `currency` is either side of the pair.
    pub fn mentions(&self, currency: &str) -> bool {
        self.base == currency || self.quote == currency
    }
}

impl FromStr for Pair {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((base, quote)) if !base.is_empty() && !quote.is_empty() => {
                Ok(Pair::new(base, quote))
            }
            _ => Err(format!("invalid pair symbol: {s:?}")),
        }
    }
}

impl TryFrom<String> for Pair {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Pair> for String {
    fn from(p: Pair) -> String {
        p.to_string()
    }
}

impl fmt::Display for Pair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.quote)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "buy"),
            Side::Sell => write!(f, "sell"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Limit,
    Market,
}

/// Order lifecycle as reported by the venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Open,
    Closed,
    Canceled,
    Expired,
    Rejected,
    Unknown,
}

impl OrderStatus {
    /// Terminal failure states; `Closed` is the terminal success.
    pub fn is_terminal_failure(&self) -> bool {
        matches!(
            self,
            OrderStatus::Canceled | OrderStatus::Expired | OrderStatus::Rejected
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker {
    pub bid: f64,
    pub ask: f64,
    /// Source timestamp, epoch seconds.
    pub ts: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBook {
    /// (price, size), best first.
    pub bids: Vec<(f64, f64)>,
    pub asks: Vec<(f64, f64)>,
    pub ts: f64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Balance {
    pub free: f64,
    pub used: f64,
    pub total: f64,
}

#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub pair: Pair,
    pub side: Side,
    pub order_type: OrderType,
    pub amount: f64,
    /// Required for limit orders.
    pub price: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct Order {
    pub id: String,
    pub status: OrderStatus,
    pub filled: f64,
    pub fee: f64,
}

#[derive(Debug, Clone)]
pub struct WithdrawalReceipt {
    pub tx_id: String,
}

/// Terminal disposition of a withdrawal as reported by the source venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WithdrawalStatus {
    Pending,
    Ok,
    Failed,
    Canceled,
    Rejected,
}

#[derive(Debug, Clone)]
pub struct Withdrawal {
    pub tx_id: String,
    pub currency: String,
    pub amount: f64,
    pub status: WithdrawalStatus,
    pub ts: f64,
}

#[derive(Debug, Clone)]
pub struct DepositAddress {
    pub address: String,
    pub tag: Option<String>,
    pub network: Option<String>,
}

/// Failure taxonomy for adapter calls. Callers dispatch on the kind, not the
/// message: transient and rate-limited errors count toward the per-venue
/// error budget, auth errors disable the venue.
#[derive(Debug, Error)]
pub enum VenueError {
    #[error("transient: {0}")]
    Transient(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("rate limited")]
    RateLimited,
    #[error("operation not supported: {0}")]
    NotSupported(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("venue error: {0}")]
    Unknown(String),
}

impl VenueError {
    pub fn is_transient(&self) -> bool {
        matches!(self, VenueError::Transient(_) | VenueError::RateLimited)
    }
}

/// Uniform async facade over one exchange.
///
/// Implementations enforce their own request pacing; callers may assume
/// bounded throughput and never add their own rate limiting.
#[async_trait]
pub trait VenueAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the venue lists this pair. Pairs that fail this check are
    /// skipped by the fanout rather than producing not-supported errors.
    fn supports(&self, pair: &Pair) -> bool;

    async fn fetch_ticker(&self, pair: &Pair) -> Result<Ticker, VenueError>;

    async fn fetch_order_book(&self, pair: &Pair, depth: usize) -> Result<OrderBook, VenueError>;

    async fn fetch_balance(&self, currency: &str) -> Result<Balance, VenueError>;

    async fn place_order(&self, request: &OrderRequest) -> Result<Order, VenueError>;

    async fn fetch_order(&self, order_id: &str) -> Result<Order, VenueError>;

    async fn cancel_order(&self, order_id: &str) -> Result<(), VenueError>;

    /// Withdrawal fee for a currency/network, if the venue publishes one.
    async fn fetch_withdrawal_fee(
        &self,
        currency: &str,
        network: Option<&str>,
    ) -> Result<Option<f64>, VenueError>;

    async fn withdraw(
        &self,
        currency: &str,
        amount: f64,
        address: &str,
        network: Option<&str>,
    ) -> Result<WithdrawalReceipt, VenueError>;

    async fn deposit_address(
        &self,
        currency: &str,
        network: Option<&str>,
    ) -> Result<DepositAddress, VenueError>;

    /// Withdrawals for `currency` since the given epoch-seconds timestamp.
    async fn fetch_withdrawals(
        &self,
        currency: &str,
        since: f64,
    ) -> Result<Vec<Withdrawal>, VenueError>;

    /// Tear the connection down. Idempotent.
    async fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_parses_symbol() {
        let pair: Pair = "BTC/USDT".parse().unwrap();
        assert_eq!(pair.base, "BTC");
        assert_eq!(pair.quote, "USDT");
        assert_eq!(pair.to_string(), "BTC/USDT");
    }

    #[test]
    fn pair_rejects_garbage() {
        assert!("BTCUSDT".parse::<Pair>().is_err());
        assert!("/USDT".parse::<Pair>().is_err());
        assert!("BTC/".parse::<Pair>().is_err());
    }

    #[test]
    fn pair_mentions_either_side() {
        let pair = Pair::new("ETH", "BTC");
        assert!(pair.mentions("ETH"));
        assert!(pair.mentions("BTC"));
        assert!(!pair.mentions("USDT"));
    }

    #[test]
    fn terminal_failure_statuses() {
        assert!(OrderStatus::Canceled.is_terminal_failure());
        assert!(OrderStatus::Rejected.is_terminal_failure());
        assert!(!OrderStatus::Closed.is_terminal_failure());
        assert!(!OrderStatus::Open.is_terminal_failure());
    }
}
