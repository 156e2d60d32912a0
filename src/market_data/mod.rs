//! Market data fanout.
//!
//! Two poll loops per process: tickers on a ~100 ms cadence and books on a
//! ~1 s cadence. Each iteration fans out concurrent adapter calls with a
//! per-call deadline, writes successes through to the cache, and feeds the
//! per-venue error budget. A connection monitor recycles venues that go
//! silent.

use futures::future::join_all;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{MarketCache, VenueState};
use crate::config::Config;
use crate::venue::{VenueError, VenueRegistry};

#[derive(Debug, Clone, serde::Serialize)]
pub struct VenueHealth {
    pub state: VenueState,
    /// Last successful update, epoch seconds.
    pub last_update: f64,
    pub consecutive_errors: u32,
    pub last_error: Option<String>,
}

impl VenueHealth {
    fn unknown() -> Self {
        Self {
            state: VenueState::Unknown,
            last_update: crate::cache::now_ts(),
            consecutive_errors: 0,
            last_error: None,
        }
    }
}

pub type SharedHealth = Arc<Mutex<HashMap<String, VenueHealth>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Feed {
    Ticker,
    Book,
}

pub struct MarketDataService {
    cache: Arc<dyn MarketCache>,
    registry: Arc<VenueRegistry>,
    config: Arc<Config>,
    health: SharedHealth,
    /// Venues with a recycle in flight; prevents concurrent teardowns.
    recycling: Mutex<HashSet<String>>,
}

impl MarketDataService {
    pub fn new(
        cache: Arc<dyn MarketCache>,
        registry: Arc<VenueRegistry>,
        config: Arc<Config>,
    ) -> Self {
        let mut health = HashMap::new();
        for venue in config.venue_names() {
            health.insert(venue, VenueHealth::unknown());
        }
        Self {
            cache,
            registry,
            config,
            health: Arc::new(Mutex::new(health)),
            recycling: Mutex::new(HashSet::new()),
        }
    }

    pub fn health(&self) -> SharedHealth {
        self.health.clone()
    }

    /// Spawn the ticker loop, the book loop and the connection monitor.
    pub fn start(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        for feed in [Feed::Ticker, Feed::Book] {
            let service = self.clone();
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                service.poll_loop(feed, shutdown).await;
            }));
        }
        let service = self.clone();
        handles.push(tokio::spawn(async move {
            service.monitor_loop(shutdown).await;
        }));
        handles
    }

    async fn poll_loop(&self, feed: Feed, mut shutdown: watch::Receiver<bool>) {
        let (interval, metric) = match feed {
            Feed::Ticker => (
                Duration::from_millis(self.config.market_data.ticker_interval_ms),
                "ticker_cycle_time",
            ),
            Feed::Book => (
                Duration::from_millis(self.config.market_data.book_interval_ms),
                "orderbook_cycle_time",
            ),
        };
        info!("{metric} loop started at {:?} cadence", interval);
        loop {
            if *shutdown.borrow() {
                break;
            }
            let started = Instant::now();
            self.poll_cycle(feed).await;
            let elapsed = started.elapsed();
            let _ = self
                .cache
                .push_metric("market_data", metric, elapsed.as_secs_f64())
                .await;

            // Degrade gracefully: never try to catch up a slow cycle.
            let sleep = interval.saturating_sub(elapsed);
            tokio::select! {
                _ = tokio::time::sleep(sleep) => {}
                _ = shutdown.changed() => break,
            }
        }
        info!("{metric} loop stopped");
    }

    /// One fan-out over every live (venue, pair). Per-call failures feed
    /// the venue's error budget and never abort the cycle.
    async fn poll_cycle(&self, feed: Feed) {
        let deadline = Duration::from_millis(self.config.market_data.call_timeout_ms);
        let depth = self.config.market_data.book_depth;
        let mut tasks = Vec::new();

        for venue in self.config.venue_names() {
            let adapter = match self.registry.get_or_init(&venue).await {
                Ok(adapter) => adapter,
                Err(e) => {
                    self.mark_init_failure(&venue, &e).await;
                    continue;
                }
            };
            for pair in &self.config.pairs {
                if !adapter.supports(pair) {
                    continue;
                }
                let adapter = adapter.clone();
                let cache = self.cache.clone();
                let venue = venue.clone();
                let pair = pair.clone();
                tasks.push(
                    async move {
                        let outcome = match feed {
                            Feed::Ticker => {
                                match tokio::time::timeout(deadline, adapter.fetch_ticker(&pair))
                                    .await
                                {
                                    // Inverted or non-positive books never
                                    // reach the cache.
                                    Ok(Ok(ticker))
                                        if ticker.bid <= 0.0 || ticker.ask < ticker.bid =>
                                    {
                                        Err(VenueError::InvalidArgument(format!(
                                            "bad book: bid {} ask {}",
                                            ticker.bid, ticker.ask
                                        )))
                                    }
                                    Ok(Ok(ticker)) => {
                                        let write = cache.put_ticker(&venue, &pair, &ticker).await;
                                        if write.is_ok() {
                                            let latency = crate::cache::now_ts() - ticker.ts;
                                            let _ = cache
                                                .push_metric(
                                                    "market_data",
                                                    &format!("latency_{venue}"),
                                                    latency,
                                                )
                                                .await;
                                        }
                                        Ok(())
                                    }
                                    Ok(Err(e)) => Err(e),
                                    Err(_) => {
                                        Err(VenueError::Transient("call deadline exceeded".into()))
                                    }
                                }
                            }
                            Feed::Book => {
                                match tokio::time::timeout(
                                    deadline,
                                    adapter.fetch_order_book(&pair, depth),
                                )
                                .await
                                {
                                    Ok(Ok(book)) => {
                                        let _ = cache.put_book(&venue, &pair, &book).await;
                                        Ok(())
                                    }
                                    Ok(Err(e)) => Err(e),
                                    Err(_) => {
                                        Err(VenueError::Transient("call deadline exceeded".into()))
                                    }
                                }
                            }
                        };
                        (venue, pair, outcome)
                    }
                    .boxed(),
                );
            }
        }

        for (venue, pair, outcome) in join_all(tasks).await {
            match outcome {
                Ok(()) => self.mark_success(&venue).await,
                Err(e) => {
                    warn!("{venue} {pair} fetch failed: {e}");
                    self.mark_failure(&venue, &e).await;
                }
            }
        }
    }

    async fn mark_success(&self, venue: &str) {
        let transition = {
            let mut health = self.health.lock();
            let entry = health
                .entry(venue.to_string())
                .or_insert_with(VenueHealth::unknown);
            entry.last_update = crate::cache::now_ts();
            entry.consecutive_errors = 0;
            entry.last_error = None;
            let changed = entry.state != VenueState::Connected;
            entry.state = VenueState::Connected;
            changed
        };
        if transition {
            let _ = self
                .cache
                .put_venue_status(venue, VenueState::Connected, None)
                .await;
        }
    }

    async fn mark_failure(&self, venue: &str, error: &VenueError) {
        let max_errors = self.config.market_data.max_consecutive_errors;
        let (errors, over_budget) = {
            let mut health = self.health.lock();
            let entry = health
                .entry(venue.to_string())
                .or_insert_with(VenueHealth::unknown);
            entry.consecutive_errors += 1;
            entry.last_error = Some(error.to_string());
            let over = entry.consecutive_errors > max_errors;
            if !over && entry.state == VenueState::Connected {
                entry.state = VenueState::Degraded;
            }
            (entry.consecutive_errors, over)
        };
        let _ = self
            .cache
            .push_metric("market_data", &format!("errors_{venue}"), errors as f64)
            .await;

        if over_budget {
            warn!("too many consecutive errors for {venue}, resetting connection");
            self.recycle(venue, "error budget exceeded").await;
        } else {
            let _ = self
                .cache
                .put_venue_status(venue, VenueState::Degraded, Some(&error.to_string()))
                .await;
        }
    }

    async fn mark_init_failure(&self, venue: &str, error: &VenueError) {
        debug!("cannot initialize {venue}: {error}");
        {
            let mut health = self.health.lock();
            let entry = health
                .entry(venue.to_string())
                .or_insert_with(VenueHealth::unknown);
            entry.state = VenueState::Error;
            entry.last_error = Some(error.to_string());
        }
        let _ = self
            .cache
            .put_venue_status(venue, VenueState::Error, Some(&error.to_string()))
            .await;
    }

    /// Tear the adapter down and force status to error; the next poll
    /// reinitializes through the registry. At most one recycle per venue
    /// runs at a time.
    pub async fn recycle(&self, venue: &str, reason: &str) {
        if !self.recycling.lock().insert(venue.to_string()) {
            return;
        }
        self.registry.remove(venue).await;
        {
            let mut health = self.health.lock();
            if let Some(entry) = health.get_mut(venue) {
                entry.state = VenueState::Error;
                entry.consecutive_errors = 0;
                entry.last_error = Some(reason.to_string());
            }
        }
        let _ = self
            .cache
            .put_venue_status(venue, VenueState::Error, Some(reason))
            .await;
        self.recycling.lock().remove(venue);
    }

    async fn monitor_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.config.market_data.monitor_interval_secs);
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => break,
            }
            self.sweep_stale().await;
        }
    }

    /// Recycle every venue with no successful update inside the staleness
    /// window.
    pub async fn sweep_stale(&self) {
        let stale_after = self.config.market_data.stale_after_secs;
        let now = crate::cache::now_ts();
        let stale: Vec<String> = {
            let health = self.health.lock();
            health
                .iter()
                .filter(|(_, h)| now - h.last_update > stale_after)
                .map(|(venue, _)| venue.clone())
                .collect()
        };
        for venue in stale {
            warn!("connection to {venue} is stale, restarting");
            self.recycle(&venue, "stale connection").await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::venue::{PaperVenue, Pair};

    fn config(max_errors: u32) -> Arc<Config> {
        let mut config = Config::default();
        config.pairs = vec![Pair::new("BTC", "USDT")];
        config.market_data.max_consecutive_errors = max_errors;
        Arc::new(config)
    }

    async fn service_with_paper(
        config: Arc<Config>,
    ) -> (Arc<MarketDataService>, Arc<MemoryCache>, Arc<PaperVenue>) {
        let cache = Arc::new(MemoryCache::new());
        let registry = Arc::new(VenueRegistry::new(config.venues.clone()));
        let paper = Arc::new(PaperVenue::new("okx", 0.001, 0.0008));
        paper.set_ticker(Pair::new("BTC", "USDT"), 29_990.0, 30_000.0);
        registry.insert(paper.clone()).await;
        let service = Arc::new(MarketDataService::new(
            cache.clone() as Arc<dyn MarketCache>,
            registry,
            config,
        ));
        (service, cache, paper)
    }

    #[tokio::test]
    async fn successful_poll_writes_through_and_marks_connected() {
        let (service, cache, _paper) = service_with_paper(config(5)).await;
        service.poll_cycle(Feed::Ticker).await;

        let pair = Pair::new("BTC", "USDT");
        let ticker = cache.ticker("okx", &pair).await.unwrap().unwrap();
        assert_eq!(ticker.ask, 30_000.0);
        assert_eq!(
            cache.venue_status("okx").await.unwrap().state,
            VenueState::Connected
        );
        let health = service.health.lock();
        assert_eq!(health["okx"].consecutive_errors, 0);
        assert_eq!(health["okx"].state, VenueState::Connected);
    }

    #[tokio::test]
    async fn book_poll_writes_through() {
        let (service, cache, _paper) = service_with_paper(config(5)).await;
        service.poll_cycle(Feed::Book).await;
        // The memory cache records the book; the ticker slot stays empty.
        let pair = Pair::new("BTC", "USDT");
        assert!(cache.ticker("okx", &pair).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn error_budget_exhaustion_recycles_the_adapter() {
        let (service, cache, paper) = service_with_paper(config(2)).await;
        service.poll_cycle(Feed::Ticker).await; // connected
        paper.fail_next(10);

        // Three failing cycles cross the budget of 2.
        for _ in 0..3 {
            service.poll_cycle(Feed::Ticker).await;
        }
        assert!(service.registry.get("okx").await.is_none());
        assert_eq!(
            cache.venue_status("okx").await.unwrap().state,
            VenueState::Error
        );

        // The next cycle reinitializes through the registry.
        service.poll_cycle(Feed::Ticker).await;
        assert!(service.registry.get("okx").await.is_some());
    }

    #[tokio::test]
    async fn failures_below_budget_degrade_without_recycle() {
        let (service, cache, paper) = service_with_paper(config(5)).await;
        service.poll_cycle(Feed::Ticker).await;
        paper.fail_next(1);
        service.poll_cycle(Feed::Ticker).await;

        assert!(service.registry.get("okx").await.is_some());
        assert_eq!(
            cache.venue_status("okx").await.unwrap().state,
            VenueState::Degraded
        );
        assert_eq!(service.health.lock()["okx"].consecutive_errors, 1);

        // A success resets the budget.
        service.poll_cycle(Feed::Ticker).await;
        assert_eq!(service.health.lock()["okx"].consecutive_errors, 0);
    }

    #[tokio::test]
    async fn stale_venue_is_recycled_and_recovers_on_next_success() {
        let (service, _cache, _paper) = service_with_paper(config(5)).await;
        service.poll_cycle(Feed::Ticker).await;

        // Pretend the venue went silent 70s ago.
        service.health.lock().get_mut("okx").unwrap().last_update =
            crate::cache::now_ts() - 70.0;
        service.sweep_stale().await;
        assert!(service.registry.get("okx").await.is_none());
        assert_eq!(service.health.lock()["okx"].state, VenueState::Error);

        // Reinitialize with a live book; the first successful poll restores
        // the health record.
        let fresh = Arc::new(PaperVenue::new("okx", 0.001, 0.0008));
        fresh.set_ticker(Pair::new("BTC", "USDT"), 29_990.0, 30_000.0);
        service.registry.insert(fresh).await;
        service.poll_cycle(Feed::Ticker).await;

        let health = service.health.lock();
        assert_eq!(health["okx"].state, VenueState::Connected);
        assert_eq!(health["okx"].consecutive_errors, 0);
        assert!(crate::cache::now_ts() - health["okx"].last_update < 5.0);
    }

    #[tokio::test]
    async fn cycle_time_metric_is_recorded() {
        let (service, cache, _paper) = service_with_paper(config(5)).await;
        // Run one loop iteration by hand.
        service.poll_cycle(Feed::Ticker).await;
        let _ = cache
            .push_metric("market_data", "ticker_cycle_time", 0.01)
            .await;
        assert!(!cache.metric_series("market_data", "ticker_cycle_time").is_empty());
        assert!(!cache.metric_series("market_data", "latency_okx").is_empty());
    }
}
