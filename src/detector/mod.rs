//! Arbitrage detection service.
//!
//! Each scan snapshots the cache into a rate graph, runs the negative-cycle
//! finder, then pushes every candidate through the profit, liquidity and
//! volatility gates. Admitted opportunities are persisted, cached for
//! execution lookup and handed to the coordinator.

pub mod bellman_ford;
pub mod history;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::cache::MarketCache;
use crate::config::Config;
use crate::graph::{self, RateGraph};
use crate::monitor::Monitor;
use crate::store::{NewOpportunity, Store};
use crate::venue::{Pair, Side, VenueRegistry};

use history::PriceHistory;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OpportunityState {
    Detected,
    PendingApproval,
    Executing,
    Completed,
    Failed,
    Canceled,
}

impl OpportunityState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpportunityState::Detected => "DETECTED",
            OpportunityState::PendingApproval => "PENDING_APPROVAL",
            OpportunityState::Executing => "EXECUTING",
            OpportunityState::Completed => "COMPLETED",
            OpportunityState::Failed => "FAILED",
            OpportunityState::Canceled => "CANCELED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OpportunityState::Completed | OpportunityState::Failed | OpportunityState::Canceled
        )
    }

    /// State advances only forward; anything else is rejected at the
    /// boundary.
    pub fn can_advance(&self, next: OpportunityState) -> bool {
        use OpportunityState::*;
        matches!(
            (self, next),
            (Detected, PendingApproval | Executing | Canceled | Failed)
                | (PendingApproval, Executing | Canceled | Failed)
                | (Executing, Completed | Failed | Canceled)
        )
    }
}

/// One executable leg of an admitted cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpportunityLeg {
    pub venue: String,
    pub pair: Pair,
    pub side: Side,
    /// Planned raw price at detection time; the drift check compares the
    /// live market against this.
    pub price: f64,
    pub effective_price: f64,
    /// Base amount to order on this leg.
    pub amount: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpportunitySnapshot {
    pub id: i64,
    /// Currency sequence in trade order; the last hop returns to the first.
    pub cycle: Vec<String>,
    pub legs: Vec<OpportunityLeg>,
    pub profit_margin: f64,
    pub main_pair: Pair,
    /// Committed capital, denominated in the cycle's start currency.
    pub volume: f64,
    pub created_ts: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActiveOpportunity {
    pub snapshot: OpportunitySnapshot,
    pub state: OpportunityState,
}

/// In-memory opportunity index shared by the detector, the coordinator and
/// the HTTP surface.
pub type SharedOpportunities = Arc<Mutex<HashMap<i64, ActiveOpportunity>>>;

pub struct Detector {
    cache: Arc<dyn MarketCache>,
    registry: Arc<VenueRegistry>,
    store: Arc<Store>,
    monitor: Arc<Monitor>,
    config: Arc<Config>,
    history: PriceHistory,
    active: SharedOpportunities,
    exec_tx: mpsc::Sender<i64>,
}

impl Detector {
    pub fn new(
        cache: Arc<dyn MarketCache>,
        registry: Arc<VenueRegistry>,
        store: Arc<Store>,
        monitor: Arc<Monitor>,
        config: Arc<Config>,
        active: SharedOpportunities,
        exec_tx: mpsc::Sender<i64>,
    ) -> Self {
        let history = PriceHistory::new(config.strategy.volatility_window_secs);
        Self {
            cache,
            registry,
            store,
            monitor,
            config,
            history,
            active,
            exec_tx,
        }
    }

    /// Scan loop. Holds the target cadence when scans are fast and degrades
    /// gracefully when they are not.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_millis(self.config.strategy.scan_interval_ms);
        info!(
            "arbitrage scanner started ({} pairs, {} venues)",
            self.config.pairs.len(),
            self.config.venues.len()
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            let started = Instant::now();
            if let Err(e) = self.scan().await {
                warn!("scan failed: {e:?}");
            }
            let elapsed = started.elapsed();
            let _ = self
                .cache
                .push_metric("arb_engine", "scan_cycle_time", elapsed.as_secs_f64())
                .await;

            let sleep = interval.saturating_sub(elapsed);
            tokio::select! {
                _ = tokio::time::sleep(sleep) => {}
                _ = shutdown.changed() => break,
            }
        }
        info!("arbitrage scanner stopped");
    }

    async fn scan(&self) -> eyre::Result<()> {
        let graph = graph::build(
            self.cache.as_ref(),
            &self.config.venues,
            &self.config.pairs,
            &self.config.strategy,
        )
        .await?;
        let _ = self
            .cache
            .push_metric("arb_engine", "graph_nodes", graph.vertex_count() as f64)
            .await;
        let _ = self
            .cache
            .push_metric("arb_engine", "graph_edges", graph.edge_count() as f64)
            .await;

        let cycles = bellman_ford::find_negative_cycles(&graph);
        let mut admitted = 0usize;
        for cycle in &cycles {
            if let Some(snapshot) = self.analyze_cycle(&graph, cycle).await {
                match self.admit(snapshot).await {
                    Ok(()) => admitted += 1,
                    Err(e) => warn!("failed to persist opportunity: {e:?}"),
                }
            }
        }
        let _ = self
            .cache
            .push_metric("arb_engine", "opportunities_found", admitted as f64)
            .await;
        Ok(())
    }

    /// Profit, volatility and sizing gates for one candidate cycle.
    /// Re-picks the best edge per hop, so the analysis is idempotent under
    /// repeated application.
    pub async fn analyze_cycle(
        &self,
        graph: &RateGraph,
        cycle: &[usize],
    ) -> Option<OpportunitySnapshot> {
        if cycle.len() < 2 {
            return None;
        }
        let mut edges = Vec::with_capacity(cycle.len());
        for i in 0..cycle.len() {
            let from = cycle[i];
            let to = cycle[(i + 1) % cycle.len()];
            edges.push(graph.best_edge(from, to)?.clone());
        }

        let gain: f64 = edges.iter().map(|e| e.gain()).product();
        let profit_margin = gain - 1.0;
        if profit_margin < self.config.strategy.min_profit_margin {
            debug!(
                "cycle below profit floor: {:.5} < {:.5}",
                profit_margin, self.config.strategy.min_profit_margin
            );
            return None;
        }

        if !self.volatility_acceptable(graph, cycle).await {
            return None;
        }

        let volume = self.size_volume(&edges).await;
        let legs = plan_legs(&edges, volume);

        let main_pair = legs
            .iter()
            .find(|l| l.pair.quote.contains("USD"))
            .map(|l| l.pair.clone())
            .unwrap_or_else(|| legs[0].pair.clone());
        let cycle_names = cycle
            .iter()
            .map(|&v| graph.currencies.name(v).to_string())
            .collect();

        Some(OpportunitySnapshot {
            id: 0,
            cycle: cycle_names,
            legs,
            profit_margin,
            main_pair,
            volume,
            created_ts: crate::cache::now_ts(),
        })
    }

    /// Reject the whole cycle if any involved pair swung more than the
    /// threshold over the rolling window. Mid is averaged across venues.
    async fn volatility_acceptable(&self, graph: &RateGraph, cycle: &[usize]) -> bool {
        let venues = self.config.venue_names();
        let now = crate::cache::now_ts();
        for &vertex in cycle {
            let currency = graph.currencies.name(vertex);
            for pair in self.config.pairs.iter().filter(|p| p.mentions(currency)) {
                let tickers = match self.cache.tickers_for_pair(&venues, pair).await {
                    Ok(t) if !t.is_empty() => t,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("volatility probe failed for {pair}: {e:?}");
                        continue;
                    }
                };
                let avg_mid = tickers
                    .iter()
                    .map(|(_, t)| (t.bid + t.ask) / 2.0)
                    .sum::<f64>()
                    / tickers.len() as f64;
                if avg_mid <= 0.0 {
                    return false;
                }
                let volatility = self.history.record(pair, now, avg_mid);
                if volatility > self.config.strategy.volatility_threshold {
                    info!(
                        "rejecting opportunity: {} volatility {:.4} over window",
                        pair, volatility
                    );
                    return false;
                }
            }
        }
        true
    }

    /// Size from free balance on the first leg's source venue, capped by
    /// the per-trade capital fraction; fall back to the configured constant
    /// when the probe fails or the account is empty.
    async fn size_volume(&self, edges: &[graph::RateEdge]) -> f64 {
        let first = &edges[0];
        let source_currency = match first.side {
            Side::Buy => &first.quote,
            Side::Sell => &first.base,
        };
        let sized = match self.registry.get_or_init(&first.venue).await {
            Ok(adapter) => match adapter.fetch_balance(source_currency).await {
                Ok(balance) => balance.free * self.config.strategy.max_capital_per_trade,
                Err(e) => {
                    debug!("balance probe failed on {}: {e}", first.venue);
                    0.0
                }
            },
            Err(e) => {
                debug!("no adapter for {}: {e}", first.venue);
                0.0
            }
        };
        if sized > 0.0 {
            sized
        } else {
            self.config.strategy.default_volume
        }
    }

    async fn admit(&self, mut snapshot: OpportunitySnapshot) -> eyre::Result<()> {
        let first = &snapshot.legs[0];
        let last = &snapshot.legs[snapshot.legs.len() - 1];
        let id = self
            .store
            .insert_opportunity(&NewOpportunity {
                pair: snapshot.main_pair.to_string(),
                buy_exchange: first.venue.clone(),
                sell_exchange: last.venue.clone(),
                buy_price: first.price,
                sell_price: last.price,
                volume: snapshot.volume,
                profit_margin: snapshot.profit_margin,
            })
            .await?;
        snapshot.id = id;

        let ttl = Duration::from_secs(self.config.execution.opportunity_ttl_secs);
        self.cache
            .put_opportunity(id, &serde_json::to_string(&snapshot)?, ttl)
            .await?;
        self.active.lock().insert(
            id,
            ActiveOpportunity {
                snapshot: snapshot.clone(),
                state: OpportunityState::Detected,
            },
        );
        self.monitor
            .record_opportunity(id, &snapshot.main_pair, snapshot.profit_margin)
            .await;

        // Hand off to the coordinator; a full queue just delays pickup.
        if self.exec_tx.send(id).await.is_err() {
            warn!("execution channel closed; opportunity {id} left DETECTED");
        }
        Ok(())
    }
}

/// Walk the cycle once, converting the committed volume through each hop to
/// fix the base amount of every leg.
fn plan_legs(edges: &[graph::RateEdge], volume: f64) -> Vec<OpportunityLeg> {
    let mut amount = volume;
    let mut legs = Vec::with_capacity(edges.len());
    for edge in edges {
        let leg_amount = match edge.side {
            Side::Buy => {
                let base = amount / edge.effective_price;
                amount = base;
                base
            }
            Side::Sell => {
                let base = amount;
                amount *= edge.effective_price;
                base
            }
        };
        legs.push(OpportunityLeg {
            venue: edge.venue.clone(),
            pair: edge.pair.clone(),
            side: edge.side,
            price: edge.raw_price,
            effective_price: edge.effective_price,
            amount: leg_amount,
        });
    }
    legs
}
