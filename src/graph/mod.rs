//! Exchange-rate graph
//!
//! Directed multigraph over currencies, rebuilt from the cache on every
//! scan. Vertices are dense indices into a per-scan currency table; edges
//! live in one flat array with a best-edge index per (from, to) used during
//! cycle reconstruction.

use std::collections::{BTreeMap, HashMap};

use crate::cache::{CacheError, MarketCache, VenueState};
use crate::config::{StrategyConfig, VenueSettings};
use crate::venue::{Pair, Side};

/// Dense currency indices for one scan.
#[derive(Debug, Default)]
pub struct CurrencyTable {
    names: Vec<String>,
    index: HashMap<String, usize>,
}

impl CurrencyTable {
    pub fn from_pairs(pairs: &[Pair]) -> Self {
        let mut table = Self::default();
        for pair in pairs {
            table.intern(&pair.base);
            table.intern(&pair.quote);
        }
        table
    }

    fn intern(&mut self, name: &str) -> usize {
        if let Some(&i) = self.index.get(name) {
            return i;
        }
        let i = self.names.len();
        self.names.push(name.to_string());
        self.index.insert(name.to_string(), i);
        i
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn name(&self, index: usize) -> &str {
        &self.names[index]
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// One priced leg: buying or selling `pair` on `venue` converts currency
/// `from` into currency `to` at `effective_price`.
#[derive(Debug, Clone)]
pub struct RateEdge {
    pub from: usize,
    pub to: usize,
    pub venue: String,
    pub pair: Pair,
    pub base: String,
    pub quote: String,
    pub side: Side,
    pub raw_price: f64,
    pub effective_price: f64,
}

impl RateEdge {
    /// Units of `to` received per unit of `from` spent.
    pub fn gain(&self) -> f64 {
        match self.side {
            Side::Buy => 1.0 / self.effective_price,
            Side::Sell => self.effective_price,
        }
    }

    /// Log-space weight; a profitable cycle sums strictly negative.
    pub fn weight(&self) -> f64 {
        -self.gain().ln()
    }
}

/// Fee- and slippage-adjusted comparison price for one side.
pub fn effective_price(raw: f64, side: Side, settings: &VenueSettings, slippage: f64) -> f64 {
    match side {
        Side::Buy => raw * (1.0 + settings.taker_fee + slippage),
        Side::Sell => raw * (1.0 - settings.maker_fee - slippage),
    }
}

#[derive(Debug, Default)]
pub struct RateGraph {
    pub currencies: CurrencyTable,
    pub edges: Vec<RateEdge>,
    /// Highest-gain edge per (from, to); multiple venues may price the hop.
    best: HashMap<(usize, usize), usize>,
}

impl RateGraph {
    pub fn vertex_count(&self) -> usize {
        self.currencies.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn add_edge(&mut self, edge: RateEdge) {
        let key = (edge.from, edge.to);
        let index = self.edges.len();
        match self.best.get(&key) {
            Some(&existing) if self.edges[existing].gain() >= edge.gain() => {}
            _ => {
                self.best.insert(key, index);
            }
        }
        self.edges.push(edge);
    }

    /// Best edge for the hop, i.e. min effective price for a buy and max for
    /// a sell. Used when reconstructing a cycle into executable legs.
    pub fn best_edge(&self, from: usize, to: usize) -> Option<&RateEdge> {
        self.best.get(&(from, to)).map(|&i| &self.edges[i])
    }
}

/// Snapshot the cache into a fresh graph. Venues that are not connected and
/// tickers that are stale, inverted or too wide contribute no edges.
pub async fn build(
    cache: &dyn MarketCache,
    venues: &BTreeMap<String, VenueSettings>,
    pairs: &[Pair],
    strategy: &StrategyConfig,
) -> Result<RateGraph, CacheError> {
    let mut graph = RateGraph {
        currencies: CurrencyTable::from_pairs(pairs),
        ..Default::default()
    };
    let now = crate::cache::now_ts();

    for (venue, settings) in venues {
        if cache.venue_status(venue).await?.state != VenueState::Connected {
            continue;
        }
        for pair in pairs {
            let ticker = match cache.ticker(venue, pair).await? {
                Some(t) => t,
                None => continue,
            };
            if now - ticker.ts > strategy.staleness_secs {
                continue;
            }
            if ticker.bid <= 0.0 || ticker.ask < ticker.bid {
                continue;
            }
            // Liquidity gate: a wide top-of-book spread prices in more
            // slippage than the constant accounts for.
            if (ticker.ask - ticker.bid) / ticker.bid > strategy.max_bid_ask_spread {
                continue;
            }

            let base = graph.currencies.intern(&pair.base);
            let quote = graph.currencies.intern(&pair.quote);

            graph.add_edge(RateEdge {
                from: quote,
                to: base,
                venue: venue.clone(),
                pair: pair.clone(),
                base: pair.base.clone(),
                quote: pair.quote.clone(),
                side: Side::Buy,
                raw_price: ticker.ask,
                effective_price: effective_price(
                    ticker.ask,
                    Side::Buy,
                    settings,
                    strategy.slippage,
                ),
            });
            graph.add_edge(RateEdge {
                from: base,
                to: quote,
                venue: venue.clone(),
                pair: pair.clone(),
                base: pair.base.clone(),
                quote: pair.quote.clone(),
                side: Side::Sell,
                raw_price: ticker.bid,
                effective_price: effective_price(
                    ticker.bid,
                    Side::Sell,
                    settings,
                    strategy.slippage,
                ),
            });
        }
    }

    Ok(graph)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::config::Config;
    use crate::venue::Ticker;

    async fn seed(cache: &MemoryCache, venue: &str, pair: &Pair, bid: f64, ask: f64) {
        cache
            .put_ticker(
                venue,
                pair,
                &Ticker {
                    bid,
                    ask,
                    ts: crate::cache::now_ts(),
                },
            )
            .await
            .unwrap();
        cache
            .put_venue_status(venue, VenueState::Connected, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn build_adds_buy_and_sell_edges_with_explicit_currencies() {
        let config = Config::default();
        let cache = MemoryCache::new();
        let pair = Pair::new("BTC", "USDT");
        seed(&cache, "okx", &pair, 29_990.0, 30_000.0).await;

        let graph = build(&cache, &config.venues, &[pair.clone()], &config.strategy)
            .await
            .unwrap();
        assert_eq!(graph.vertex_count(), 2);
        assert_eq!(graph.edge_count(), 2);

        let usdt = graph.currencies.index_of("USDT").unwrap();
        let btc = graph.currencies.index_of("BTC").unwrap();
        let buy = graph.best_edge(usdt, btc).unwrap();
        assert_eq!(buy.side, Side::Buy);
        assert_eq!(buy.base, "BTC");
        assert_eq!(buy.quote, "USDT");
        assert_eq!(buy.raw_price, 30_000.0);
        // ask * (1 + 0.001 + 0.0005)
        assert!((buy.effective_price - 30_000.0 * 1.0015).abs() < 1e-6);

        let sell = graph.best_edge(btc, usdt).unwrap();
        assert_eq!(sell.side, Side::Sell);
        assert!((sell.effective_price - 29_990.0 * (1.0 - 0.0013)).abs() < 1e-6);
    }

    #[tokio::test]
    async fn wide_spread_drops_the_pair() {
        let config = Config::default();
        let cache = MemoryCache::new();
        let pair = Pair::new("BTC", "USDT");
        // 1% spread > 0.4% gate
        seed(&cache, "okx", &pair, 30_000.0, 30_300.0).await;

        let graph = build(&cache, &config.venues, &[pair], &config.strategy)
            .await
            .unwrap();
        assert_eq!(graph.edge_count(), 0);
    }

    #[tokio::test]
    async fn stale_ticker_is_treated_as_absent() {
        let config = Config::default();
        let cache = MemoryCache::new();
        let pair = Pair::new("BTC", "USDT");
        cache
            .put_ticker(
                "okx",
                &pair,
                &Ticker {
                    bid: 29_990.0,
                    ask: 30_000.0,
                    ts: crate::cache::now_ts() - 120.0,
                },
            )
            .await
            .unwrap();
        cache
            .put_venue_status("okx", VenueState::Connected, None)
            .await
            .unwrap();

        let graph = build(&cache, &config.venues, &[pair], &config.strategy)
            .await
            .unwrap();
        assert_eq!(graph.edge_count(), 0);
    }

    #[tokio::test]
    async fn disconnected_venue_contributes_nothing() {
        let config = Config::default();
        let cache = MemoryCache::new();
        let pair = Pair::new("BTC", "USDT");
        seed(&cache, "okx", &pair, 29_990.0, 30_000.0).await;
        cache
            .put_venue_status("okx", VenueState::Error, Some("recycled"))
            .await
            .unwrap();

        let graph = build(&cache, &config.venues, &[pair], &config.strategy)
            .await
            .unwrap();
        assert_eq!(graph.edge_count(), 0);
    }

    #[tokio::test]
    async fn best_edge_prefers_the_better_venue() {
        let config = Config::default();
        let cache = MemoryCache::new();
        let pair = Pair::new("BTC", "USDT");
        seed(&cache, "okx", &pair, 29_990.0, 30_000.0).await;
        seed(&cache, "bybit", &pair, 30_100.0, 30_200.0).await;

        let graph = build(&cache, &config.venues, &[pair], &config.strategy)
            .await
            .unwrap();
        let usdt = graph.currencies.index_of("USDT").unwrap();
        let btc = graph.currencies.index_of("BTC").unwrap();
        // Cheapest ask wins the buy hop, highest bid wins the sell hop.
        assert_eq!(graph.best_edge(usdt, btc).unwrap().venue, "okx");
        assert_eq!(graph.best_edge(btc, usdt).unwrap().venue, "bybit");
    }

    #[tokio::test]
    async fn build_is_deterministic_for_a_fixed_cache() {
        let config = Config::default();
        let cache = MemoryCache::new();
        let pair = Pair::new("BTC", "USDT");
        seed(&cache, "okx", &pair, 29_990.0, 30_000.0).await;
        seed(&cache, "bybit", &pair, 30_100.0, 30_200.0).await;

        let a = build(&cache, &config.venues, &[pair.clone()], &config.strategy)
            .await
            .unwrap();
        let b = build(&cache, &config.venues, &[pair], &config.strategy)
            .await
            .unwrap();
        assert_eq!(a.edge_count(), b.edge_count());
        for (ea, eb) in a.edges.iter().zip(&b.edges) {
            assert_eq!(ea.venue, eb.venue);
            assert_eq!(ea.side, eb.side);
            assert_eq!(ea.effective_price, eb.effective_price);
        }
    }

    #[test]
    fn weights_are_negative_log_gains() {
        let edge = RateEdge {
            from: 0,
            to: 1,
            venue: "okx".into(),
            pair: Pair::new("BTC", "USDT"),
            base: "BTC".into(),
            quote: "USDT".into(),
            side: Side::Sell,
            raw_price: 2.0,
            effective_price: 2.0,
        };
        assert!((edge.gain() - 2.0).abs() < 1e-12);
        assert!((edge.weight() + 2.0_f64.ln()).abs() < 1e-12);
    }
}
