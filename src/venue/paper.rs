//! Deterministic in-memory venue used by the paper trading mode and the
//! test suite. Orders settle against a configurable book, balances move the
//! way a real spot venue moves them, and failures can be injected to
//! exercise the error budget and recycle paths.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

use async_trait::async_trait;

use super::{
    Balance, DepositAddress, Order, OrderBook, OrderRequest, OrderStatus, OrderType, Pair, Side,
    Ticker, VenueAdapter, VenueError, Withdrawal, WithdrawalReceipt, WithdrawalStatus,
};

/// How placed orders settle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillMode {
    /// Fill on the first status poll.
    Immediate,
    /// Stay open for N status polls, then fill.
    AfterPolls(u32),
    /// Never fill; the caller's timeout path takes over.
    Never,
    /// Report rejected on the first status poll.
    Reject,
}

struct PaperOrder {
    request: OrderRequest,
    price: f64,
    status: OrderStatus,
    filled: f64,
    fee: f64,
    polls_left: u32,
    reject: bool,
}

#[derive(Default)]
struct PaperState {
    tickers: HashMap<Pair, Ticker>,
    balances: HashMap<String, Balance>,
    orders: HashMap<String, PaperOrder>,
    withdrawals: Vec<Withdrawal>,
    withdrawal_fees: HashMap<String, f64>,
    /// Next N data-plane calls fail with a transient error.
    fail_next: u32,
    fill_mode: Option<FillMode>,
}

pub struct PaperVenue {
    name: String,
    taker_fee: f64,
    maker_fee: f64,
    min_request_interval: Duration,
    last_request: tokio::sync::Mutex<Instant>,
    state: Mutex<PaperState>,
}

impl PaperVenue {
    pub fn new(name: impl Into<String>, taker_fee: f64, maker_fee: f64) -> Self {
        Self {
            name: name.into(),
            taker_fee,
            maker_fee,
            min_request_interval: Duration::from_millis(0),
            last_request: tokio::sync::Mutex::new(Instant::now()),
            state: Mutex::new(PaperState::default()),
        }
    }

    /// Minimum spacing between requests, matching a live venue's rate limit.
    pub fn with_request_interval(mut self, interval: Duration) -> Self {
        self.min_request_interval = interval;
        self
    }

    pub fn set_ticker(&self, pair: Pair, bid: f64, ask: f64) {
        let ts = crate::cache::now_ts();
        self.state.lock().tickers.insert(pair, Ticker { bid, ask, ts });
    }

    pub fn set_balance(&self, currency: &str, free: f64) {
        self.state.lock().balances.insert(
            currency.to_string(),
            Balance {
                free,
                used: 0.0,
                total: free,
            },
        );
    }

    pub fn set_withdrawal_fee(&self, currency: &str, fee: f64) {
        self.state
            .lock()
            .withdrawal_fees
            .insert(currency.to_string(), fee);
    }

    pub fn set_fill_mode(&self, mode: FillMode) {
        self.state.lock().fill_mode = Some(mode);
    }

    /// Make the next `n` data-plane calls fail transiently.
    pub fn fail_next(&self, n: u32) {
        self.state.lock().fail_next = n;
    }

    /// Force every pending withdrawal to the given terminal status.
    pub fn settle_withdrawals(&self, status: WithdrawalStatus) {
        let mut state = self.state.lock();
        for w in &mut state.withdrawals {
            if w.status == WithdrawalStatus::Pending {
                w.status = status;
            }
        }
    }

    async fn pace(&self) {
        if self.min_request_interval.is_zero() {
            return;
        }
        let mut last = self.last_request.lock().await;
        let elapsed = last.elapsed();
        if elapsed < self.min_request_interval {
            tokio::time::sleep(self.min_request_interval - elapsed).await;
        }
        *last = Instant::now();
    }

    fn take_injected_failure(&self) -> Option<VenueError> {
        let mut state = self.state.lock();
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Some(VenueError::Transient("injected failure".into()));
        }
        None
    }

    /// Settle a filled order against the balance book.
    fn apply_fill(balances: &mut HashMap<String, Balance>, order: &PaperOrder) {
        let pair = &order.request.pair;
        let notional = order.filled * order.price;
        let (credit, credit_amt, debit, debit_amt) = match order.request.side {
            Side::Buy => (&pair.base, order.filled, &pair.quote, notional),
            Side::Sell => (&pair.quote, notional, &pair.base, order.filled),
        };
        let entry = balances.entry(credit.clone()).or_default();
        entry.free += credit_amt;
        entry.total += credit_amt;
        let entry = balances.entry(debit.clone()).or_default();
        entry.free -= debit_amt;
        entry.total -= debit_amt;
    }
}

#[async_trait]
impl VenueAdapter for PaperVenue {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports(&self, pair: &Pair) -> bool {
        self.state.lock().tickers.contains_key(pair)
    }

    async fn fetch_ticker(&self, pair: &Pair) -> Result<Ticker, VenueError> {
        self.pace().await;
        if let Some(err) = self.take_injected_failure() {
            return Err(err);
        }
        let state = self.state.lock();
        state
            .tickers
            .get(pair)
            .cloned()
            .ok_or_else(|| VenueError::NotSupported(format!("{} not listed", pair)))
    }

    async fn fetch_order_book(&self, pair: &Pair, depth: usize) -> Result<OrderBook, VenueError> {
        self.pace().await;
        if let Some(err) = self.take_injected_failure() {
            return Err(err);
        }
        let state = self.state.lock();
        let ticker = state
            .tickers
            .get(pair)
            .ok_or_else(|| VenueError::NotSupported(format!("{} not listed", pair)))?;
        // Synthetic ladder around the top of book, one size unit per level.
        let bids = (0..depth)
            .map(|i| (ticker.bid * (1.0 - 0.0001 * i as f64), 1.0))
            .collect();
        let asks = (0..depth)
            .map(|i| (ticker.ask * (1.0 + 0.0001 * i as f64), 1.0))
            .collect();
        Ok(OrderBook {
            bids,
            asks,
            ts: ticker.ts,
        })
    }

    async fn fetch_balance(&self, currency: &str) -> Result<Balance, VenueError> {
        self.pace().await;
        Ok(self
            .state
            .lock()
            .balances
            .get(currency)
            .copied()
            .unwrap_or_default())
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<Order, VenueError> {
        self.pace().await;
        let price = match (request.order_type, request.price) {
            (OrderType::Limit, Some(p)) => p,
            (OrderType::Limit, None) => {
                return Err(VenueError::InvalidArgument(
                    "limit order without a price".into(),
                ))
            }
            (OrderType::Market, _) => {
                let state = self.state.lock();
                let ticker = state.tickers.get(&request.pair).ok_or_else(|| {
                    VenueError::NotSupported(format!("{} not listed", request.pair))
                })?;
                match request.side {
                    Side::Buy => ticker.ask,
                    Side::Sell => ticker.bid,
                }
            }
        };
        if request.amount <= 0.0 {
            return Err(VenueError::InvalidArgument("non-positive amount".into()));
        }

        let mut state = self.state.lock();
        let mode = state.fill_mode.unwrap_or(FillMode::Immediate);
        let (polls_left, reject) = match mode {
            FillMode::Immediate => (0, false),
            FillMode::AfterPolls(n) => (n, false),
            FillMode::Never => (u32::MAX, false),
            FillMode::Reject => (0, true),
        };
        let id = Uuid::new_v4().to_string();
        state.orders.insert(
            id.clone(),
            PaperOrder {
                request: request.clone(),
                price,
                status: OrderStatus::Open,
                filled: 0.0,
                fee: 0.0,
                polls_left,
                reject,
            },
        );
        Ok(Order {
            id,
            status: OrderStatus::Open,
            filled: 0.0,
            fee: 0.0,
        })
    }

    async fn fetch_order(&self, order_id: &str) -> Result<Order, VenueError> {
        self.pace().await;
        let mut state = self.state.lock();
        let taker_fee = self.taker_fee;
        let maker_fee = self.maker_fee;

        let mut fill: Option<String> = None;
        {
            let order = state
                .orders
                .get_mut(order_id)
                .ok_or_else(|| VenueError::InvalidArgument(format!("unknown order {order_id}")))?;
            if order.status == OrderStatus::Open {
                if order.reject {
                    order.status = OrderStatus::Rejected;
                } else if order.polls_left == 0 {
                    order.status = OrderStatus::Closed;
                    order.filled = order.request.amount;
                    let rate = match order.request.order_type {
                        OrderType::Market => taker_fee,
                        OrderType::Limit => maker_fee,
                    };
                    order.fee = order.filled * order.price * rate;
                    fill = Some(order_id.to_string());
                } else if order.polls_left != u32::MAX {
                    order.polls_left -= 1;
                }
            }
        }
        if let Some(id) = fill {
            if let Some(order) = state.orders.remove(&id) {
                Self::apply_fill(&mut state.balances, &order);
                let result = Order {
                    id: id.clone(),
                    status: order.status,
                    filled: order.filled,
                    fee: order.fee,
                };
                state.orders.insert(id, order);
                return Ok(result);
            }
        }
        let order = state
            .orders
            .get(order_id)
            .ok_or_else(|| VenueError::InvalidArgument(format!("unknown order {order_id}")))?;
        Ok(Order {
            id: order_id.to_string(),
            status: order.status,
            filled: order.filled,
            fee: order.fee,
        })
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), VenueError> {
        self.pace().await;
        let mut state = self.state.lock();
        let order = state
            .orders
            .get_mut(order_id)
            .ok_or_else(|| VenueError::InvalidArgument(format!("unknown order {order_id}")))?;
        if order.status == OrderStatus::Open {
            order.status = OrderStatus::Canceled;
        }
        Ok(())
    }

    async fn fetch_withdrawal_fee(
        &self,
        currency: &str,
        _network: Option<&str>,
    ) -> Result<Option<f64>, VenueError> {
        self.pace().await;
        Ok(self.state.lock().withdrawal_fees.get(currency).copied())
    }

    async fn withdraw(
        &self,
        currency: &str,
        amount: f64,
        _address: &str,
        _network: Option<&str>,
    ) -> Result<WithdrawalReceipt, VenueError> {
        self.pace().await;
        let mut state = self.state.lock();
        let balance = state.balances.entry(currency.to_string()).or_default();
        if balance.free < amount {
            return Err(VenueError::InvalidArgument(format!(
                "insufficient {currency}: {} < {amount}",
                balance.free
            )));
        }
        balance.free -= amount;
        balance.total -= amount;
        let tx_id = Uuid::new_v4().to_string();
        state.withdrawals.push(Withdrawal {
            tx_id: tx_id.clone(),
            currency: currency.to_string(),
            amount,
            status: WithdrawalStatus::Pending,
            ts: crate::cache::now_ts(),
        });
        Ok(WithdrawalReceipt { tx_id })
    }

    async fn deposit_address(
        &self,
        currency: &str,
        network: Option<&str>,
    ) -> Result<DepositAddress, VenueError> {
        self.pace().await;
        Ok(DepositAddress {
            address: format!("paper:{}:{}", self.name, currency),
            tag: None,
            network: network.map(str::to_string),
        })
    }

    async fn fetch_withdrawals(
        &self,
        currency: &str,
        since: f64,
    ) -> Result<Vec<Withdrawal>, VenueError> {
        self.pace().await;
        Ok(self
            .state
            .lock()
            .withdrawals
            .iter()
            .filter(|w| w.currency == currency && w.ts >= since)
            .cloned()
            .collect())
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn venue() -> PaperVenue {
        let v = PaperVenue::new("paperx", 0.001, 0.0008);
        v.set_ticker(Pair::new("BTC", "USDT"), 29990.0, 30000.0);
        v.set_balance("USDT", 10_000.0);
        v
    }

    #[tokio::test]
    async fn limit_buy_settles_balances() {
        let v = venue();
        let order = v
            .place_order(&OrderRequest {
                pair: Pair::new("BTC", "USDT"),
                side: Side::Buy,
                order_type: OrderType::Limit,
                amount: 0.1,
                price: Some(30_000.0),
            })
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::Open);

        let filled = v.fetch_order(&order.id).await.unwrap();
        assert_eq!(filled.status, OrderStatus::Closed);
        assert!((filled.filled - 0.1).abs() < 1e-12);

        let btc = v.fetch_balance("BTC").await.unwrap();
        let usdt = v.fetch_balance("USDT").await.unwrap();
        assert!((btc.free - 0.1).abs() < 1e-12);
        assert!((usdt.free - 7_000.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn never_fill_stays_open_until_canceled() {
        let v = venue();
        v.set_fill_mode(FillMode::Never);
        let order = v
            .place_order(&OrderRequest {
                pair: Pair::new("BTC", "USDT"),
                side: Side::Buy,
                order_type: OrderType::Limit,
                amount: 0.1,
                price: Some(30_000.0),
            })
            .await
            .unwrap();
        for _ in 0..3 {
            assert_eq!(
                v.fetch_order(&order.id).await.unwrap().status,
                OrderStatus::Open
            );
        }
        v.cancel_order(&order.id).await.unwrap();
        assert_eq!(
            v.fetch_order(&order.id).await.unwrap().status,
            OrderStatus::Canceled
        );
    }

    #[tokio::test]
    async fn injected_failures_are_transient() {
        let v = venue();
        v.fail_next(2);
        let pair = Pair::new("BTC", "USDT");
        assert!(v.fetch_ticker(&pair).await.unwrap_err().is_transient());
        assert!(v.fetch_ticker(&pair).await.unwrap_err().is_transient());
        assert!(v.fetch_ticker(&pair).await.is_ok());
    }

    #[tokio::test]
    async fn withdrawal_debits_and_is_listed() {
        let v = venue();
        let receipt = v.withdraw("USDT", 1_000.0, "addr", Some("TRX")).await.unwrap();
        let listed = v.fetch_withdrawals("USDT", 0.0).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].tx_id, receipt.tx_id);
        assert_eq!(listed[0].status, WithdrawalStatus::Pending);
        assert!((v.fetch_balance("USDT").await.unwrap().free - 9_000.0).abs() < 1e-9);
    }
}
