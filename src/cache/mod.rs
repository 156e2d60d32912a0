//! Market cache
//!
//! The process-external key-value store every service reads and writes:
//! per-(venue, pair) tickers and books, venue liveness records, opportunity
//! blobs, metric series and the single-flight transfer locks. `RedisCache`
//! talks to a real server; `MemoryCache` is the in-process twin used by the
//! paper mode and the test suite.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::venue::{OrderBook, Pair, Ticker};

mod memory;
mod redis_cache;

pub use memory::MemoryCache;
pub use redis_cache::RedisCache;

/// Wall time as epoch seconds. All cache timestamps use this clock.
pub fn now_ts() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Venue connection state as published to `exchange:status:{venue}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VenueState {
    Connected,
    Degraded,
    Error,
    Unknown,
}

impl fmt::Display for VenueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VenueState::Connected => write!(f, "connected"),
            VenueState::Degraded => write!(f, "degraded"),
            VenueState::Error => write!(f, "error"),
            VenueState::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VenueStatusRecord {
    pub state: VenueState,
    pub ts: f64,
    pub message: Option<String>,
}

impl VenueStatusRecord {
    fn unknown() -> Self {
        Self {
            state: VenueState::Unknown,
            ts: 0.0,
            message: None,
        }
    }
}

/// Entry TTL for market data; stale entries age out rather than accumulate.
pub const MARKET_TTL: Duration = Duration::from_secs(3600);

/// Capped length of each metric series.
pub const METRIC_SERIES_LEN: usize = 100;

pub fn ticker_key(venue: &str, pair: &Pair) -> String {
    format!("market:{venue}:{pair}:ticker")
}

pub fn book_key(venue: &str, pair: &Pair) -> String {
    format!("market:{venue}:{pair}:book")
}

pub fn status_key(venue: &str) -> String {
    format!("exchange:status:{venue}")
}

pub fn opportunity_key(id: i64) -> String {
    format!("arbitrage:opportunity:{id}")
}

pub fn metric_key(service: &str, name: &str) -> String {
    format!("metrics:{service}:{name}")
}

pub fn lock_key(name: &str) -> String {
    format!("lock:{name}")
}

/// The cache surface the core depends on. Hash writes are atomic: readers
/// always see a coherent {bid, ask, timestamp} triple.
#[async_trait]
pub trait MarketCache: Send + Sync {
    async fn put_ticker(
        &self,
        venue: &str,
        pair: &Pair,
        ticker: &Ticker,
    ) -> Result<(), CacheError>;

    async fn ticker(&self, venue: &str, pair: &Pair) -> Result<Option<Ticker>, CacheError>;

    /// Tickers for one pair across the given venues, keyed by venue.
    async fn tickers_for_pair(
        &self,
        venues: &[String],
        pair: &Pair,
    ) -> Result<Vec<(String, Ticker)>, CacheError>;

    async fn put_book(&self, venue: &str, pair: &Pair, book: &OrderBook)
        -> Result<(), CacheError>;

    async fn put_venue_status(
        &self,
        venue: &str,
        state: VenueState,
        message: Option<&str>,
    ) -> Result<(), CacheError>;

    async fn venue_status(&self, venue: &str) -> Result<VenueStatusRecord, CacheError>;

    /// Store an opportunity blob with a TTL; expiry cancels execution lookup.
    async fn put_opportunity(
        &self,
        id: i64,
        blob: &str,
        ttl: Duration,
    ) -> Result<(), CacheError>;

    async fn opportunity(&self, id: i64) -> Result<Option<String>, CacheError>;

    /// Push onto the capped metric series, newest first.
    async fn push_metric(&self, service: &str, name: &str, value: f64) -> Result<(), CacheError>;

    /// SETNX-style lock; returns the holder token when acquired.
    async fn acquire_lock(&self, name: &str, ttl: Duration)
        -> Result<Option<String>, CacheError>;

    /// Compare-and-delete release: only the token's holder can release.
    /// Returns false when the lock expired or belongs to someone else.
    async fn release_lock(&self, name: &str, token: &str) -> Result<bool, CacheError>;
}

/// Fresh random holder token for a lock acquisition.
pub(crate) fn lock_token() -> String {
    format!("{:016x}", rand::random::<u64>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_shapes() {
        let pair = Pair::new("BTC", "USDT");
        assert_eq!(ticker_key("okx", &pair), "market:okx:BTC/USDT:ticker");
        assert_eq!(book_key("okx", &pair), "market:okx:BTC/USDT:book");
        assert_eq!(status_key("bybit"), "exchange:status:bybit");
        assert_eq!(opportunity_key(42), "arbitrage:opportunity:42");
        assert_eq!(
            metric_key("market_data", "latency_okx"),
            "metrics:market_data:latency_okx"
        );
        assert_eq!(lock_key("transfer:okx:USDT"), "lock:transfer:okx:USDT");
    }
}
