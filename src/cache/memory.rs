//! In-process cache with the same TTL and lock semantics as the Redis
//! backend. Backs the paper run mode and the test suite.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::venue::{OrderBook, Pair, Ticker};

use super::{
    lock_token, CacheError, MarketCache, VenueState, VenueStatusRecord, METRIC_SERIES_LEN,
};

struct Expiring<T> {
    value: T,
    expires_at: Option<Instant>,
}

impl<T> Expiring<T> {
    fn live(&self) -> bool {
        self.expires_at.map_or(true, |t| Instant::now() < t)
    }
}

#[derive(Default)]
struct Inner {
    tickers: HashMap<(String, Pair), Expiring<Ticker>>,
    books: HashMap<(String, Pair), Expiring<OrderBook>>,
    statuses: HashMap<String, VenueStatusRecord>,
    opportunities: HashMap<i64, Expiring<String>>,
    metrics: HashMap<String, VecDeque<(f64, f64)>>,
    locks: HashMap<String, Expiring<String>>,
}

#[derive(Default)]
pub struct MemoryCache {
    inner: Mutex<Inner>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Metric series (value, timestamp), newest first. Test hook.
    pub fn metric_series(&self, service: &str, name: &str) -> Vec<(f64, f64)> {
        let inner = self.inner.lock();
        inner
            .metrics
            .get(&super::metric_key(service, name))
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl MarketCache for MemoryCache {
    async fn put_ticker(
        &self,
        venue: &str,
        pair: &Pair,
        ticker: &Ticker,
    ) -> Result<(), CacheError> {
        self.inner.lock().tickers.insert(
            (venue.to_string(), pair.clone()),
            Expiring {
                value: ticker.clone(),
                expires_at: Some(Instant::now() + super::MARKET_TTL),
            },
        );
        Ok(())
    }

    async fn ticker(&self, venue: &str, pair: &Pair) -> Result<Option<Ticker>, CacheError> {
        let inner = self.inner.lock();
        Ok(inner
            .tickers
            .get(&(venue.to_string(), pair.clone()))
            .filter(|e| e.live())
            .map(|e| e.value.clone()))
    }

    async fn tickers_for_pair(
        &self,
        venues: &[String],
        pair: &Pair,
    ) -> Result<Vec<(String, Ticker)>, CacheError> {
        let inner = self.inner.lock();
        Ok(venues
            .iter()
            .filter_map(|v| {
                inner
                    .tickers
                    .get(&(v.clone(), pair.clone()))
                    .filter(|e| e.live())
                    .map(|e| (v.clone(), e.value.clone()))
            })
            .collect())
    }

    async fn put_book(
        &self,
        venue: &str,
        pair: &Pair,
        book: &OrderBook,
    ) -> Result<(), CacheError> {
        self.inner.lock().books.insert(
            (venue.to_string(), pair.clone()),
            Expiring {
                value: book.clone(),
                expires_at: Some(Instant::now() + super::MARKET_TTL),
            },
        );
        Ok(())
    }

    async fn put_venue_status(
        &self,
        venue: &str,
        state: VenueState,
        message: Option<&str>,
    ) -> Result<(), CacheError> {
        self.inner.lock().statuses.insert(
            venue.to_string(),
            VenueStatusRecord {
                state,
                ts: super::now_ts(),
                message: message.map(str::to_string),
            },
        );
        Ok(())
    }

    async fn venue_status(&self, venue: &str) -> Result<VenueStatusRecord, CacheError> {
        Ok(self
            .inner
            .lock()
            .statuses
            .get(venue)
            .cloned()
            .unwrap_or_else(VenueStatusRecord::unknown))
    }

    async fn put_opportunity(
        &self,
        id: i64,
        blob: &str,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        self.inner.lock().opportunities.insert(
            id,
            Expiring {
                value: blob.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn opportunity(&self, id: i64) -> Result<Option<String>, CacheError> {
        let inner = self.inner.lock();
        Ok(inner
            .opportunities
            .get(&id)
            .filter(|e| e.live())
            .map(|e| e.value.clone()))
    }

    async fn push_metric(&self, service: &str, name: &str, value: f64) -> Result<(), CacheError> {
        let mut inner = self.inner.lock();
        let series = inner
            .metrics
            .entry(super::metric_key(service, name))
            .or_default();
        series.push_front((value, super::now_ts()));
        series.truncate(METRIC_SERIES_LEN);
        Ok(())
    }

    async fn acquire_lock(
        &self,
        name: &str,
        ttl: Duration,
    ) -> Result<Option<String>, CacheError> {
        let mut inner = self.inner.lock();
        let key = super::lock_key(name);
        if inner.locks.get(&key).map_or(false, |e| e.live()) {
            return Ok(None);
        }
        let token = lock_token();
        inner.locks.insert(
            key,
            Expiring {
                value: token.clone(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(Some(token))
    }

    async fn release_lock(&self, name: &str, token: &str) -> Result<bool, CacheError> {
        let mut inner = self.inner.lock();
        let key = super::lock_key(name);
        match inner.locks.get(&key) {
            Some(entry) if entry.live() && entry.value == token => {
                inner.locks.remove(&key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ticker_round_trip_and_absence() {
        let cache = MemoryCache::new();
        let pair = Pair::new("BTC", "USDT");
        assert!(cache.ticker("okx", &pair).await.unwrap().is_none());

        cache
            .put_ticker(
                "okx",
                &pair,
                &Ticker {
                    bid: 29_990.0,
                    ask: 30_000.0,
                    ts: super::super::now_ts(),
                },
            )
            .await
            .unwrap();
        let got = cache.ticker("okx", &pair).await.unwrap().unwrap();
        assert_eq!(got.bid, 29_990.0);
        assert_eq!(got.ask, 30_000.0);
    }

    #[tokio::test]
    async fn lock_is_single_holder_and_release_checks_token() {
        let cache = MemoryCache::new();
        let ttl = Duration::from_secs(10);

        let token = cache.acquire_lock("transfer:okx:USDT", ttl).await.unwrap();
        assert!(token.is_some());
        // Second acquisition is refused while held.
        assert!(cache
            .acquire_lock("transfer:okx:USDT", ttl)
            .await
            .unwrap()
            .is_none());
        // A stranger's token cannot release it.
        assert!(!cache
            .release_lock("transfer:okx:USDT", "deadbeef")
            .await
            .unwrap());
        assert!(cache
            .release_lock("transfer:okx:USDT", &token.unwrap())
            .await
            .unwrap());
        // Released: can be taken again.
        assert!(cache
            .acquire_lock("transfer:okx:USDT", ttl)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn expired_lock_can_be_reacquired_but_not_released() {
        let cache = MemoryCache::new();
        let token = cache
            .acquire_lock("transfer:okx:USDT", Duration::from_millis(0))
            .await
            .unwrap()
            .unwrap();
        // TTL elapsed: the old holder's release is a no-op...
        assert!(!cache
            .release_lock("transfer:okx:USDT", &token)
            .await
            .unwrap());
        // ...and a new holder can acquire.
        assert!(cache
            .acquire_lock("transfer:okx:USDT", Duration::from_secs(10))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn metric_series_is_capped_newest_first() {
        let cache = MemoryCache::new();
        for i in 0..120 {
            cache
                .push_metric("market_data", "ticker_cycle_time", i as f64)
                .await
                .unwrap();
        }
        let series = cache.metric_series("market_data", "ticker_cycle_time");
        assert_eq!(series.len(), METRIC_SERIES_LEN);
        assert_eq!(series[0].0, 119.0);
    }

    #[tokio::test]
    async fn opportunity_blob_expires() {
        let cache = MemoryCache::new();
        cache
            .put_opportunity(7, "{}", Duration::from_millis(0))
            .await
            .unwrap();
        assert!(cache.opportunity(7).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn status_defaults_to_unknown() {
        let cache = MemoryCache::new();
        let status = cache.venue_status("okx").await.unwrap();
        assert_eq!(status.state, VenueState::Unknown);

        cache
            .put_venue_status("okx", VenueState::Connected, None)
            .await
            .unwrap();
        assert_eq!(
            cache.venue_status("okx").await.unwrap().state,
            VenueState::Connected
        );
    }
}
