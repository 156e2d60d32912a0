//! Execution coordinator.
//!
//! Drives an approved opportunity through its legs strictly in order: price
//! revalidation against the cache, limit order placement, a 1 Hz fill wait,
//! and rollback of still-open orders when any leg aborts. Fills that already
//! happened are reported, never reversed; inventory imbalance is the funds
//! router's problem.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::cache::MarketCache;
use crate::config::Config;
use crate::detector::{OpportunitySnapshot, OpportunityState, SharedOpportunities};
use crate::monitor::{ApprovalGate, ApprovalRequest, Monitor};
use crate::store::{NewTrade, Store};
use crate::venue::{
    OrderRequest, OrderStatus, OrderType, Pair, Side, VenueAdapter, VenueRegistry,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeState {
    Open,
    Filled,
    PartiallyFilled,
    Canceled,
    Failed,
}

impl TradeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeState::Open => "OPEN",
            TradeState::Filled => "FILLED",
            TradeState::PartiallyFilled => "PARTIALLY_FILLED",
            TradeState::Canceled => "CANCELED",
            TradeState::Failed => "FAILED",
        }
    }
}

/// Live order index entry, keyed by the venue's order id.
#[derive(Debug, Clone, Serialize)]
pub struct OrderRecord {
    pub trade_id: i64,
    pub opportunity_id: i64,
    pub venue: String,
    pub pair: Pair,
    pub side: Side,
    pub price: f64,
    pub amount: f64,
    pub status: TradeState,
    pub created_ts: f64,
}

pub type SharedOrders = Arc<Mutex<HashMap<String, OrderRecord>>>;

enum FillOutcome {
    Filled(f64),
    Terminal(OrderStatus),
    TimedOut,
}

struct PlacedLeg {
    adapter: Arc<dyn VenueAdapter>,
    order_id: String,
    trade_id: i64,
    filled: bool,
}

pub struct ExecutionCoordinator {
    cache: Arc<dyn MarketCache>,
    registry: Arc<VenueRegistry>,
    store: Arc<Store>,
    monitor: Arc<Monitor>,
    gate: Arc<ApprovalGate>,
    config: Arc<Config>,
    active: SharedOpportunities,
    orders: SharedOrders,
}

impl ExecutionCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cache: Arc<dyn MarketCache>,
        registry: Arc<VenueRegistry>,
        store: Arc<Store>,
        monitor: Arc<Monitor>,
        gate: Arc<ApprovalGate>,
        config: Arc<Config>,
        active: SharedOpportunities,
        orders: SharedOrders,
    ) -> Self {
        Self {
            cache,
            registry,
            store,
            monitor,
            gate,
            config,
            active,
            orders,
        }
    }

    /// Consume detected opportunity ids until shutdown.
    pub async fn run(&self, mut rx: mpsc::Receiver<i64>, mut shutdown: watch::Receiver<bool>) {
        info!("execution coordinator started");
        loop {
            tokio::select! {
                id = rx.recv() => match id {
                    Some(id) => {
                        if let Err(e) = self.handle(id).await {
                            warn!("execution of opportunity {id} errored: {e:?}");
                        }
                    }
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }
        info!("execution coordinator stopped");
    }

    /// Full lifecycle for one opportunity: approval, legs, terminal state.
    pub async fn handle(&self, id: i64) -> eyre::Result<()> {
        let snapshot = match self.cache.opportunity(id).await? {
            Some(blob) => serde_json::from_str::<OpportunitySnapshot>(&blob)?,
            None => {
                warn!("opportunity {id} not found in cache");
                self.advance(id, OpportunityState::Failed).await;
                self.monitor
                    .record_execution_failed(id, "not found in cache")
                    .await;
                return Ok(());
            }
        };

        if !self.approve(&snapshot).await {
            self.advance(id, OpportunityState::Canceled).await;
            self.monitor.record_execution_canceled(id).await;
            return Ok(());
        }

        // A refused transition means the opportunity already left the
        // executable states (canceled, replayed, or terminal); placing
        // orders for it would double-execute the cycle.
        if !self.advance(id, OpportunityState::Executing).await {
            warn!("opportunity {id} is no longer executable; dropping");
            self.monitor.record_execution_canceled(id).await;
            return Ok(());
        }
        match self.execute_legs(&snapshot).await {
            Ok(()) => {
                self.advance(id, OpportunityState::Completed).await;
                info!("successfully executed arbitrage opportunity {id}");
                self.monitor
                    .record_execution_completed(id, snapshot.profit_margin)
                    .await;
                let _ = self
                    .cache
                    .push_metric("execution", "profit_margin", snapshot.profit_margin)
                    .await;
            }
            Err(reason) => {
                self.advance(id, OpportunityState::Failed).await;
                self.monitor.record_execution_failed(id, &reason).await;
            }
        }
        Ok(())
    }

    /// Synchronous auto-approval below the capital threshold; otherwise wait
    /// on the operator channel until the opportunity TTL lapses.
    async fn approve(&self, snapshot: &OpportunitySnapshot) -> bool {
        let threshold = self.config.strategy.auto_approve_capital;
        if snapshot.volume <= threshold {
            info!(
                "auto-approving opportunity {} (capital {:.2} <= {:.2})",
                snapshot.id, snapshot.volume, threshold
            );
            return true;
        }

        if !self
            .advance(snapshot.id, OpportunityState::PendingApproval)
            .await
        {
            return false;
        }
        let additional_capital_pct = if threshold > 0.0 {
            (snapshot.volume - threshold) / threshold * 100.0
        } else {
            100.0
        };
        let request = ApprovalRequest {
            opportunity_id: snapshot.id,
            main_pair: snapshot.main_pair.clone(),
            venues: snapshot.legs.iter().map(|l| l.venue.clone()).collect(),
            profit_margin: snapshot.profit_margin,
            additional_capital_pct,
        };
        let rx = self.gate.request(&self.monitor, &request).await;
        let ttl = Duration::from_secs(self.config.execution.opportunity_ttl_secs);
        match tokio::time::timeout(ttl, rx).await {
            Ok(Ok(decision)) => decision,
            // Channel dropped (e.g. expired elsewhere).
            Ok(Err(_)) => false,
            Err(_) => {
                info!("approval wait for opportunity {} timed out", snapshot.id);
                self.gate.expire(snapshot.id);
                false
            }
        }
    }

    /// Legs run strictly sequentially; the first abort rolls back and
    /// reports the reason.
    async fn execute_legs(&self, snapshot: &OpportunitySnapshot) -> Result<(), String> {
        let tolerance = self.config.execution.price_drift_tolerance;
        let mut placed: Vec<PlacedLeg> = Vec::with_capacity(snapshot.legs.len());

        for leg in &snapshot.legs {
            let ticker = match self.cache.ticker(&leg.venue, &leg.pair).await {
                Ok(Some(t)) => t,
                Ok(None) => {
                    self.rollback(&mut placed).await;
                    return Err(format!("no ticker for {} {}", leg.venue, leg.pair));
                }
                Err(e) => {
                    self.rollback(&mut placed).await;
                    return Err(format!("cache read failed: {e}"));
                }
            };
            let current = match leg.side {
                Side::Buy => ticker.ask,
                Side::Sell => ticker.bid,
            };
            if current <= 0.0 {
                self.rollback(&mut placed).await;
                return Err(format!("invalid price for {} {}", leg.venue, leg.pair));
            }

            let drifted = match leg.side {
                Side::Buy => current > leg.price * (1.0 + tolerance),
                Side::Sell => current < leg.price * (1.0 - tolerance),
            };
            if drifted {
                self.rollback(&mut placed).await;
                return Err(format!(
                    "price moved unfavorably on {} {} ({} vs planned {})",
                    leg.venue, leg.pair, current, leg.price
                ));
            }

            let adapter = match self.registry.get_or_init(&leg.venue).await {
                Ok(a) => a,
                Err(e) => {
                    self.rollback(&mut placed).await;
                    return Err(format!("no adapter for {}: {e}", leg.venue));
                }
            };
            let order = match adapter
                .place_order(&OrderRequest {
                    pair: leg.pair.clone(),
                    side: leg.side,
                    order_type: OrderType::Limit,
                    amount: leg.amount,
                    price: Some(current),
                })
                .await
            {
                Ok(order) => order,
                Err(e) => {
                    self.rollback(&mut placed).await;
                    return Err(format!("order placement on {} failed: {e}", leg.venue));
                }
            };
            info!(
                "placed {} order on {} for {} {} at {}",
                leg.side, leg.venue, leg.amount, leg.pair, current
            );

            let trade_id = match self
                .store
                .insert_trade(&NewTrade {
                    opportunity_id: snapshot.id,
                    exchange: leg.venue.clone(),
                    pair: leg.pair.to_string(),
                    side: leg.side.to_string(),
                    price: current,
                    amount: leg.amount,
                    fee: 0.0,
                    order_id: order.id.clone(),
                })
                .await
            {
                Ok(id) => id,
                Err(e) => {
                    // The order is live but unrecorded: cancel it too.
                    let _ = adapter.cancel_order(&order.id).await;
                    self.rollback(&mut placed).await;
                    return Err(format!("failed to record trade: {e}"));
                }
            };
            self.orders.lock().insert(
                order.id.clone(),
                OrderRecord {
                    trade_id,
                    opportunity_id: snapshot.id,
                    venue: leg.venue.clone(),
                    pair: leg.pair.clone(),
                    side: leg.side,
                    price: current,
                    amount: leg.amount,
                    status: TradeState::Open,
                    created_ts: crate::cache::now_ts(),
                },
            );
            placed.push(PlacedLeg {
                adapter: adapter.clone(),
                order_id: order.id.clone(),
                trade_id,
                filled: false,
            });

            match self.await_fill(adapter.as_ref(), &order.id).await {
                FillOutcome::Filled(fee) => {
                    let _ = self
                        .store
                        .update_trade_status(trade_id, TradeState::Filled, Some(fee))
                        .await;
                    self.set_order_status(&order.id, TradeState::Filled);
                    if let Some(last) = placed.last_mut() {
                        last.filled = true;
                    }
                }
                FillOutcome::Terminal(status) => {
                    let _ = self
                        .store
                        .update_trade_status(trade_id, TradeState::Failed, None)
                        .await;
                    self.set_order_status(&order.id, TradeState::Failed);
                    // This leg is settled; only earlier legs roll back.
                    placed.pop();
                    self.rollback(&mut placed).await;
                    return Err(format!(
                        "order {} on {} ended {:?}",
                        order.id, leg.venue, status
                    ));
                }
                FillOutcome::TimedOut => {
                    if let Err(e) = adapter.cancel_order(&order.id).await {
                        warn!("cancel of timed-out order {} failed: {e}", order.id);
                    }
                    let _ = self
                        .store
                        .update_trade_status(trade_id, TradeState::Canceled, None)
                        .await;
                    self.set_order_status(&order.id, TradeState::Canceled);
                    placed.pop();
                    self.rollback(&mut placed).await;
                    return Err(format!("order {} on {} timed out", order.id, leg.venue));
                }
            }
        }
        Ok(())
    }

    /// Poll order status at 1 Hz until terminal or the fill window closes.
    async fn await_fill(&self, adapter: &dyn VenueAdapter, order_id: &str) -> FillOutcome {
        let poll = Duration::from_secs(self.config.execution.order_poll_interval_secs.max(1));
        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(self.config.execution.fill_timeout_secs);
        loop {
            match adapter.fetch_order(order_id).await {
                Ok(order) if order.status == OrderStatus::Closed => {
                    return FillOutcome::Filled(order.fee);
                }
                Ok(order) if order.status.is_terminal_failure() => {
                    return FillOutcome::Terminal(order.status);
                }
                Ok(_) => {}
                Err(e) => warn!("order status check for {order_id} failed: {e}"),
            }
            if tokio::time::Instant::now() + poll > deadline {
                return FillOutcome::TimedOut;
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Cancel still-open orders from earlier legs. Filled legs stay filled.
    async fn rollback(&self, placed: &mut Vec<PlacedLeg>) {
        for leg in placed.iter().filter(|p| !p.filled) {
            if let Err(e) = leg.adapter.cancel_order(&leg.order_id).await {
                warn!("rollback cancel of {} failed: {e}", leg.order_id);
            }
            let _ = self
                .store
                .update_trade_status(leg.trade_id, TradeState::Canceled, None)
                .await;
            self.set_order_status(&leg.order_id, TradeState::Canceled);
        }
    }

    fn set_order_status(&self, order_id: &str, status: TradeState) {
        if let Some(record) = self.orders.lock().get_mut(order_id) {
            record.status = status;
        }
    }

    /// Advance the opportunity in both the in-memory index and the durable
    /// log. Illegal transitions are rejected at this boundary.
    pub async fn advance(&self, id: i64, next: OpportunityState) -> bool {
        {
            let mut active = self.active.lock();
            if let Some(entry) = active.get_mut(&id) {
                if !entry.state.can_advance(next) {
                    warn!(
                        "refusing opportunity {id} transition {:?} -> {:?}",
                        entry.state, next
                    );
                    return false;
                }
                entry.state = next;
            }
        }
        match self.store.update_opportunity_status(id, next).await {
            Ok(changed) => changed,
            Err(e) => {
                warn!("status update for opportunity {id} failed: {e}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{MemoryCache, VenueState};
    use crate::detector::{ActiveOpportunity, OpportunityLeg};
    use crate::venue::{FillMode, PaperVenue, Ticker};

    struct Fixture {
        coordinator: ExecutionCoordinator,
        cache: Arc<MemoryCache>,
        store: Arc<Store>,
        active: SharedOpportunities,
        orders: SharedOrders,
        gate: Arc<ApprovalGate>,
    }

    async fn fixture(mut config: Config) -> Fixture {
        config.pairs = vec![Pair::new("BTC", "USDT")];
        let cache = Arc::new(MemoryCache::new());
        let store = Arc::new(Store::in_memory().unwrap());
        let active: SharedOpportunities = Arc::new(Mutex::new(HashMap::new()));
        let orders: SharedOrders = Arc::new(Mutex::new(HashMap::new()));
        let gate = Arc::new(ApprovalGate::new());
        let coordinator = ExecutionCoordinator::new(
            cache.clone() as Arc<dyn MarketCache>,
            Arc::new(VenueRegistry::new(config.venues.clone())),
            store.clone(),
            Arc::new(Monitor::new(None, None)),
            gate.clone(),
            Arc::new(config),
            active.clone(),
            orders.clone(),
        );
        Fixture {
            coordinator,
            cache,
            store,
            active,
            orders,
            gate,
        }
    }

    fn leg(venue: &str, side: Side, price: f64, amount: f64) -> OpportunityLeg {
        let effective = match side {
            Side::Buy => price * 1.0015,
            Side::Sell => price * 0.9987,
        };
        OpportunityLeg {
            venue: venue.into(),
            pair: Pair::new("BTC", "USDT"),
            side,
            price,
            effective_price: effective,
            amount,
        }
    }

    /// Persist + cache + index an opportunity the way the detector does.
    async fn admit(fx: &Fixture, legs: Vec<OpportunityLeg>, volume: f64) -> i64 {
        let id = fx
            .store
            .insert_opportunity(&crate::store::NewOpportunity {
                pair: "BTC/USDT".into(),
                buy_exchange: legs[0].venue.clone(),
                sell_exchange: legs[legs.len() - 1].venue.clone(),
                buy_price: legs[0].price,
                sell_price: legs[legs.len() - 1].price,
                volume,
                profit_margin: 0.004,
            })
            .await
            .unwrap();
        let snapshot = OpportunitySnapshot {
            id,
            cycle: vec!["USDT".into(), "BTC".into()],
            legs,
            profit_margin: 0.004,
            main_pair: Pair::new("BTC", "USDT"),
            volume,
            created_ts: crate::cache::now_ts(),
        };
        fx.cache
            .put_opportunity(id, &serde_json::to_string(&snapshot).unwrap(), Duration::from_secs(300))
            .await
            .unwrap();
        fx.active.lock().insert(
            id,
            ActiveOpportunity {
                snapshot,
                state: OpportunityState::Detected,
            },
        );
        id
    }

    async fn seed_ticker(fx: &Fixture, venue: &str, bid: f64, ask: f64) {
        fx.cache
            .put_ticker(
                venue,
                &Pair::new("BTC", "USDT"),
                &Ticker {
                    bid,
                    ask,
                    ts: crate::cache::now_ts(),
                },
            )
            .await
            .unwrap();
        fx.cache
            .put_venue_status(venue, VenueState::Connected, None)
            .await
            .unwrap();
    }

    fn paper(name: &str, mode: FillMode) -> Arc<PaperVenue> {
        let venue = Arc::new(PaperVenue::new(name, 0.001, 0.0008));
        venue.set_ticker(Pair::new("BTC", "USDT"), 29_990.0, 30_000.0);
        venue.set_fill_mode(mode);
        venue
    }

    /// Price drift beyond tolerance aborts before any order is placed.
    #[tokio::test]
    async fn price_drift_aborts_before_first_order() {
        let fx = fixture(Config::default()).await;
        let id = admit(&fx, vec![leg("okx", Side::Buy, 30_000.0, 0.01)], 50.0).await;
        // Ask moved to 30200 > 30000 * 1.005.
        seed_ticker(&fx, "okx", 29_990.0, 30_200.0).await;

        fx.coordinator.handle(id).await.unwrap();

        assert_eq!(
            fx.store.opportunity_status(id).await.unwrap().as_deref(),
            Some("FAILED")
        );
        assert!(fx.store.trades_for_opportunity(id).await.unwrap().is_empty());
        assert!(fx.orders.lock().is_empty());
    }

    /// Both legs fill: opportunity COMPLETED and every trade FILLED.
    #[tokio::test]
    async fn full_cycle_completes_with_all_trades_filled() {
        let fx = fixture(Config::default()).await;
        let id = admit(
            &fx,
            vec![
                leg("okx", Side::Buy, 30_000.0, 0.01),
                leg("bybit", Side::Sell, 30_100.0, 0.01),
            ],
            50.0,
        )
        .await;
        seed_ticker(&fx, "okx", 29_990.0, 30_000.0).await;
        seed_ticker(&fx, "bybit", 30_100.0, 30_150.0).await;

        let okx = paper("okx", FillMode::Immediate);
        okx.set_balance("USDT", 1_000.0);
        let bybit = paper("bybit", FillMode::Immediate);
        bybit.set_balance("BTC", 1.0);
        fx.coordinator.registry.insert(okx).await;
        fx.coordinator.registry.insert(bybit).await;

        fx.coordinator.handle(id).await.unwrap();

        assert_eq!(
            fx.store.opportunity_status(id).await.unwrap().as_deref(),
            Some("COMPLETED")
        );
        let trades = fx.store.trades_for_opportunity(id).await.unwrap();
        assert_eq!(trades.len(), 2);
        assert!(trades.iter().all(|t| t.status == "FILLED"));
    }

    /// Leg 1 fills, leg 2 never does: the order is canceled after the fill
    /// window, the trade ends CANCELED and the opportunity FAILED. The
    /// filled first leg stays filled.
    #[tokio::test(start_paused = true)]
    async fn mid_cycle_timeout_cancels_and_fails() {
        let mut config = Config::default();
        config.execution.fill_timeout_secs = 5;
        let fx = fixture(config).await;
        let id = admit(
            &fx,
            vec![
                leg("okx", Side::Buy, 30_000.0, 0.01),
                leg("bybit", Side::Sell, 30_100.0, 0.01),
            ],
            50.0,
        )
        .await;
        seed_ticker(&fx, "okx", 29_990.0, 30_000.0).await;
        seed_ticker(&fx, "bybit", 30_100.0, 30_150.0).await;

        let okx = paper("okx", FillMode::Immediate);
        okx.set_balance("USDT", 1_000.0);
        let bybit = paper("bybit", FillMode::Never);
        fx.coordinator.registry.insert(okx).await;
        fx.coordinator.registry.insert(bybit.clone()).await;

        fx.coordinator.handle(id).await.unwrap();

        assert_eq!(
            fx.store.opportunity_status(id).await.unwrap().as_deref(),
            Some("FAILED")
        );
        let trades = fx.store.trades_for_opportunity(id).await.unwrap();
        assert_eq!(trades.len(), 2);
        assert_eq!(trades[0].status, "FILLED");
        assert_eq!(trades[1].status, "CANCELED");
    }

    /// A replayed id must not re-run the legs once the opportunity has
    /// reached a terminal state: the refused transition drops it before any
    /// order is placed.
    #[tokio::test]
    async fn replayed_execution_after_terminal_state_places_no_orders() {
        let fx = fixture(Config::default()).await;
        let id = admit(
            &fx,
            vec![
                leg("okx", Side::Buy, 30_000.0, 0.01),
                leg("bybit", Side::Sell, 30_100.0, 0.01),
            ],
            50.0,
        )
        .await;
        seed_ticker(&fx, "okx", 29_990.0, 30_000.0).await;
        seed_ticker(&fx, "bybit", 30_100.0, 30_150.0).await;

        let okx = paper("okx", FillMode::Immediate);
        okx.set_balance("USDT", 1_000.0);
        let bybit = paper("bybit", FillMode::Immediate);
        bybit.set_balance("BTC", 1.0);
        fx.coordinator.registry.insert(okx).await;
        fx.coordinator.registry.insert(bybit).await;

        // First pass completes the cycle; the queued duplicate is dropped.
        fx.coordinator.handle(id).await.unwrap();
        fx.coordinator.handle(id).await.unwrap();

        assert_eq!(
            fx.store.opportunity_status(id).await.unwrap().as_deref(),
            Some("COMPLETED")
        );
        assert_eq!(fx.store.trades_for_opportunity(id).await.unwrap().len(), 2);
    }

    /// Terminal rejection from the venue fails the trade and the cycle.
    #[tokio::test]
    async fn rejected_order_fails_the_cycle() {
        let fx = fixture(Config::default()).await;
        let id = admit(&fx, vec![leg("okx", Side::Buy, 30_000.0, 0.01)], 50.0).await;
        seed_ticker(&fx, "okx", 29_990.0, 30_000.0).await;
        fx.coordinator
            .registry
            .insert(paper("okx", FillMode::Reject))
            .await;

        fx.coordinator.handle(id).await.unwrap();

        assert_eq!(
            fx.store.opportunity_status(id).await.unwrap().as_deref(),
            Some("FAILED")
        );
        let trades = fx.store.trades_for_opportunity(id).await.unwrap();
        assert_eq!(trades[0].status, "FAILED");
    }

    /// Above the auto-approve threshold the coordinator parks in
    /// PENDING_APPROVAL; a reject cancels.
    #[tokio::test]
    async fn rejection_via_approval_channel_cancels() {
        let mut config = Config::default();
        config.strategy.auto_approve_capital = 10.0;
        let fx = fixture(config).await;
        let id = admit(&fx, vec![leg("okx", Side::Buy, 30_000.0, 0.01)], 5_000.0).await;
        seed_ticker(&fx, "okx", 29_990.0, 30_000.0).await;

        let gate = fx.gate.clone();
        let store = fx.store.clone();
        let reject = tokio::spawn(async move {
            // Wait until the request is registered, then reject.
            for _ in 0..50 {
                if gate.pending_count() > 0 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            assert_eq!(
                store.opportunity_status(id).await.unwrap().as_deref(),
                Some("PENDING_APPROVAL")
            );
            assert!(gate.resolve(id, false));
        });

        fx.coordinator.handle(id).await.unwrap();
        reject.await.unwrap();

        assert_eq!(
            fx.store.opportunity_status(id).await.unwrap().as_deref(),
            Some("CANCELED")
        );
        assert!(fx.store.trades_for_opportunity(id).await.unwrap().is_empty());
    }

    /// Nobody answers: the TTL expires the wait and cancels.
    #[tokio::test(start_paused = true)]
    async fn approval_timeout_cancels() {
        let mut config = Config::default();
        config.strategy.auto_approve_capital = 10.0;
        config.execution.opportunity_ttl_secs = 3;
        let fx = fixture(config).await;
        let id = admit(&fx, vec![leg("okx", Side::Buy, 30_000.0, 0.01)], 5_000.0).await;
        seed_ticker(&fx, "okx", 29_990.0, 30_000.0).await;

        fx.coordinator.handle(id).await.unwrap();

        assert_eq!(
            fx.store.opportunity_status(id).await.unwrap().as_deref(),
            Some("CANCELED")
        );
        assert_eq!(fx.gate.pending_count(), 0);
    }

    #[tokio::test]
    async fn missing_cache_entry_fails_without_orders() {
        let fx = fixture(Config::default()).await;
        // Persist a row but skip the cache write: the TTL has "expired".
        let id = fx
            .store
            .insert_opportunity(&crate::store::NewOpportunity {
                pair: "BTC/USDT".into(),
                buy_exchange: "okx".into(),
                sell_exchange: "okx".into(),
                buy_price: 30_000.0,
                sell_price: 30_100.0,
                volume: 50.0,
                profit_margin: 0.004,
            })
            .await
            .unwrap();

        fx.coordinator.handle(id).await.unwrap();
        assert_eq!(
            fx.store.opportunity_status(id).await.unwrap().as_deref(),
            Some("FAILED")
        );
    }

    #[tokio::test]
    async fn illegal_transition_is_refused() {
        let fx = fixture(Config::default()).await;
        let id = admit(&fx, vec![leg("okx", Side::Buy, 30_000.0, 0.01)], 50.0).await;
        fx.active.lock().get_mut(&id).unwrap().state = OpportunityState::Completed;

        assert!(!fx.coordinator.advance(id, OpportunityState::Executing).await);
        assert_eq!(
            fx.active.lock().get(&id).unwrap().state,
            OpportunityState::Completed
        );
    }
}
