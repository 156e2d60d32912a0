//! Cross-venue funds router.
//!
//! One withdrawal at a time per (source venue, currency), serialized by a
//! single-flight cache lock. Fee discovery asks the adapter first and falls
//! back to the static network fee table; the destination address honors the
//! per-currency preferred network when the caller does not pick one.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::cache::{CacheError, MarketCache};
use crate::config::Config;
use crate::monitor::{Monitor, TransferOutcome};
use crate::store::{NewTransfer, Store, StoreError};
use crate::venue::{VenueAdapter, VenueError, VenueRegistry, WithdrawalStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferState {
    Pending,
    Completed,
    Failed,
    Unknown,
}

impl TransferState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferState::Pending => "PENDING",
            TransferState::Completed => "COMPLETED",
            TransferState::Failed => "FAILED",
            TransferState::Unknown => "UNKNOWN",
        }
    }
}

/// Estimated withdrawal fees per currency and network, used when the venue
/// does not publish one.
static NETWORK_FEES: Lazy<HashMap<&'static str, Vec<(&'static str, f64)>>> = Lazy::new(|| {
    HashMap::from([
        ("BTC", vec![("BTC", 0.0001), ("BSC", 0.0001)]),
        ("ETH", vec![("ETH", 0.005), ("BSC", 0.0005), ("Arbitrum", 0.0001)]),
        (
            "USDT",
            vec![("ETH", 10.0), ("TRX", 1.0), ("BSC", 0.5), ("Arbitrum", 0.2)],
        ),
    ])
});

/// Fastest and cheapest network per currency.
static PREFERRED_NETWORKS: Lazy<HashMap<&'static str, &'static str>> =
    Lazy::new(|| HashMap::from([("BTC", "BSC"), ("ETH", "Arbitrum"), ("USDT", "TRX")]));

pub fn preferred_network(currency: &str) -> Option<String> {
    PREFERRED_NETWORKS.get(currency).map(|n| n.to_string())
}

/// Fee from the static table: the requested network when known, otherwise
/// the cheapest known network for the currency.
pub fn fee_from_table(currency: &str, network: Option<&str>) -> f64 {
    let Some(networks) = NETWORK_FEES.get(currency) else {
        return 0.0;
    };
    if let Some(requested) = network {
        if let Some((_, fee)) = networks.iter().find(|(n, _)| *n == requested) {
            return *fee;
        }
    }
    let cheapest = networks
        .iter()
        .map(|(_, fee)| *fee)
        .fold(f64::INFINITY, f64::min);
    if cheapest.is_finite() {
        cheapest
    } else {
        0.0
    }
}

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("a transfer of {currency} from {venue} is already in flight")]
    LockBusy { venue: String, currency: String },
    #[error("insufficient {currency} on {venue}: {free} < {amount}")]
    InsufficientBalance {
        venue: String,
        currency: String,
        free: f64,
        amount: f64,
    },
    #[error("no deposit address for {currency} on {venue}")]
    NoDepositAddress { venue: String, currency: String },
    #[error(transparent)]
    Venue(#[from] VenueError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub from_venue: String,
    pub to_venue: String,
    pub currency: String,
    pub amount: f64,
    pub network: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransferRecord {
    pub id: i64,
    pub from_venue: String,
    pub to_venue: String,
    pub currency: String,
    pub amount: f64,
    pub fee: f64,
    pub network: Option<String>,
    pub transaction_id: Option<String>,
    pub status: TransferState,
    pub created_ts: f64,
}

pub type SharedTransfers = Arc<Mutex<HashMap<i64, TransferRecord>>>;

pub struct FundsRouter {
    cache: Arc<dyn MarketCache>,
    registry: Arc<VenueRegistry>,
    store: Arc<Store>,
    monitor: Arc<Monitor>,
    config: Arc<Config>,
    active: SharedTransfers,
}

impl FundsRouter {
    pub fn new(
        cache: Arc<dyn MarketCache>,
        registry: Arc<VenueRegistry>,
        store: Arc<Store>,
        monitor: Arc<Monitor>,
        config: Arc<Config>,
        active: SharedTransfers,
    ) -> Self {
        Self {
            cache,
            registry,
            store,
            monitor,
            config,
            active,
        }
    }

    /// Move funds between venues. Holds the per-(source, currency) lock for
    /// the submission path; the lock is released on every exit, errors
    /// included.
    pub async fn transfer(self: &Arc<Self>, request: TransferRequest) -> Result<i64, RouterError> {
        let lock_name = format!("transfer:{}:{}", request.from_venue, request.currency);
        let ttl = Duration::from_secs(self.config.transfers.lock_ttl_secs);
        let token = self
            .cache
            .acquire_lock(&lock_name, ttl)
            .await?
            .ok_or_else(|| RouterError::LockBusy {
                venue: request.from_venue.clone(),
                currency: request.currency.clone(),
            })?;

        let result = self.transfer_locked(&request).await;
        match self.cache.release_lock(&lock_name, &token).await {
            Ok(false) => warn!("lock {lock_name} expired before release"),
            Ok(true) => {}
            Err(e) => warn!("failed to release {lock_name}: {e}"),
        }
        result
    }

    async fn transfer_locked(
        self: &Arc<Self>,
        request: &TransferRequest,
    ) -> Result<i64, RouterError> {
        let source = self.registry.get_or_init(&request.from_venue).await?;
        let balance = source.fetch_balance(&request.currency).await?;
        if balance.free < request.amount {
            self.monitor
                .send_alert(&format!(
                    "Transfer refused: insufficient {} on {} ({:.8} < {:.8})",
                    request.currency, request.from_venue, balance.free, request.amount
                ))
                .await;
            return Err(RouterError::InsufficientBalance {
                venue: request.from_venue.clone(),
                currency: request.currency.clone(),
                free: balance.free,
                amount: request.amount,
            });
        }

        let network = request
            .network
            .clone()
            .or_else(|| preferred_network(&request.currency));
        let fee = self
            .withdrawal_fee(source.as_ref(), &request.currency, network.as_deref())
            .await;

        let destination = self.registry.get_or_init(&request.to_venue).await?;
        let address = destination
            .deposit_address(&request.currency, network.as_deref())
            .await?;
        if address.address.is_empty() {
            return Err(RouterError::NoDepositAddress {
                venue: request.to_venue.clone(),
                currency: request.currency.clone(),
            });
        }

        let id = self
            .store
            .insert_transfer(&NewTransfer {
                from_exchange: request.from_venue.clone(),
                to_exchange: request.to_venue.clone(),
                currency: request.currency.clone(),
                amount: request.amount,
                fee,
            })
            .await?;
        self.active.lock().insert(
            id,
            TransferRecord {
                id,
                from_venue: request.from_venue.clone(),
                to_venue: request.to_venue.clone(),
                currency: request.currency.clone(),
                amount: request.amount,
                fee,
                network: network.clone(),
                transaction_id: None,
                status: TransferState::Pending,
                created_ts: crate::cache::now_ts(),
            },
        );
        self.monitor.record_transfer(TransferOutcome::Initiated).await;

        let receipt = match source
            .withdraw(
                &request.currency,
                request.amount,
                &address.address,
                network.as_deref(),
            )
            .await
        {
            Ok(receipt) => receipt,
            Err(e) => {
                error!(
                    "withdrawal of {} {} from {} failed: {e}",
                    request.amount, request.currency, request.from_venue
                );
                self.settle(id, TransferState::Failed, None).await;
                return Err(e.into());
            }
        };
        self.store
            .update_transfer_status(id, TransferState::Pending, Some(&receipt.tx_id))
            .await?;
        if let Some(record) = self.active.lock().get_mut(&id) {
            record.transaction_id = Some(receipt.tx_id.clone());
        }
        info!(
            "initiated transfer {} of {} {} from {} to {} via {:?}",
            id, request.amount, request.currency, request.from_venue, request.to_venue, network
        );

        let router = self.clone();
        let from_venue = request.from_venue.clone();
        let currency = request.currency.clone();
        tokio::spawn(async move {
            router
                .watch_transfer(id, &from_venue, &receipt.tx_id, &currency)
                .await;
        });
        Ok(id)
    }

    /// Fee quote for the HTTP surface.
    pub async fn quote_fee(
        &self,
        venue: &str,
        currency: &str,
        network: Option<&str>,
    ) -> Result<f64, RouterError> {
        let adapter = self.registry.get_or_init(venue).await?;
        Ok(self
            .withdrawal_fee(adapter.as_ref(), currency, network)
            .await)
    }

    /// Adapter-published fee, else the static table.
    async fn withdrawal_fee(
        &self,
        adapter: &dyn VenueAdapter,
        currency: &str,
        network: Option<&str>,
    ) -> f64 {
        match adapter.fetch_withdrawal_fee(currency, network).await {
            Ok(Some(fee)) => fee,
            Ok(None) => fee_from_table(currency, network),
            Err(e) => {
                warn!("withdrawal fee lookup failed for {currency}: {e}");
                fee_from_table(currency, network)
            }
        }
    }

    /// Poll the source's withdrawal list until a terminal status or the
    /// transfer deadline; an unobserved terminal goes to UNKNOWN for the
    /// operator.
    pub async fn watch_transfer(&self, id: i64, venue: &str, tx_id: &str, currency: &str) {
        let max_wait = Duration::from_secs(self.config.transfers.max_transfer_time_secs);
        let poll = Duration::from_secs(self.config.transfers.poll_interval_secs.max(1));
        let since = crate::cache::now_ts() - 86_400.0;
        let started = Instant::now();

        while started.elapsed() < max_wait {
            match self.check_withdrawal(venue, tx_id, currency, since).await {
                Ok(Some(WithdrawalStatus::Ok)) => {
                    self.settle(id, TransferState::Completed, None).await;
                    info!("transfer {id} completed");
                    return;
                }
                Ok(Some(
                    WithdrawalStatus::Failed
                    | WithdrawalStatus::Canceled
                    | WithdrawalStatus::Rejected,
                )) => {
                    self.settle(id, TransferState::Failed, None).await;
                    error!("transfer {id} failed at {venue}");
                    self.monitor
                        .send_alert(&format!("Transfer {id} failed at {venue}"))
                        .await;
                    return;
                }
                Ok(_) => {}
                Err(e) => warn!("transfer {id} status check failed: {e}"),
            }
            tokio::time::sleep(poll).await;
        }

        warn!(
            "transfer {id} unobserved after {}s",
            self.config.transfers.max_transfer_time_secs
        );
        self.settle(id, TransferState::Unknown, None).await;
        self.monitor
            .send_alert(&format!(
                "Transfer {id} status unknown after {}s, manual check required",
                self.config.transfers.max_transfer_time_secs
            ))
            .await;
    }

    async fn check_withdrawal(
        &self,
        venue: &str,
        tx_id: &str,
        currency: &str,
        since: f64,
    ) -> Result<Option<WithdrawalStatus>, RouterError> {
        let adapter = self.registry.get_or_init(venue).await?;
        let withdrawals = adapter.fetch_withdrawals(currency, since).await?;
        Ok(withdrawals
            .into_iter()
            .find(|w| w.tx_id == tx_id)
            .map(|w| w.status))
    }

    async fn settle(&self, id: i64, state: TransferState, tx_id: Option<&str>) {
        if let Err(e) = self.store.update_transfer_status(id, state, tx_id).await {
            error!("failed to persist transfer {id} status: {e}");
        }
        if let Some(record) = self.active.lock().get_mut(&id) {
            record.status = state;
        }
        let outcome = match state {
            TransferState::Completed => TransferOutcome::Completed,
            TransferState::Failed => TransferOutcome::Failed,
            TransferState::Unknown => TransferOutcome::Unknown,
            TransferState::Pending => return,
        };
        self.monitor.record_transfer(outcome).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::venue::PaperVenue;

    struct Fixture {
        router: Arc<FundsRouter>,
        cache: Arc<MemoryCache>,
        store: Arc<Store>,
        from: Arc<PaperVenue>,
    }

    async fn fixture() -> Fixture {
        let config = Arc::new(Config::default());
        let cache = Arc::new(MemoryCache::new());
        let store = Arc::new(Store::in_memory().unwrap());
        let registry = Arc::new(VenueRegistry::new(config.venues.clone()));
        let from = Arc::new(PaperVenue::new("okx", 0.001, 0.0008));
        from.set_balance("USDT", 10_000.0);
        registry.insert(from.clone()).await;
        registry
            .insert(Arc::new(PaperVenue::new("bybit", 0.001, 0.0008)))
            .await;
        let router = Arc::new(FundsRouter::new(
            cache.clone() as Arc<dyn MarketCache>,
            registry,
            store.clone(),
            Arc::new(Monitor::new(None, None)),
            config,
            Arc::new(Mutex::new(HashMap::new())),
        ));
        Fixture {
            router,
            cache,
            store,
            from,
        }
    }

    fn request(amount: f64) -> TransferRequest {
        TransferRequest {
            from_venue: "okx".into(),
            to_venue: "bybit".into(),
            currency: "USDT".into(),
            amount,
            network: None,
        }
    }

    #[tokio::test]
    async fn transfer_withdraws_and_goes_pending() {
        let fx = fixture().await;
        let id = fx.router.transfer(request(1_000.0)).await.unwrap();

        let transfers = fx.store.recent_transfers(10).await.unwrap();
        assert_eq!(transfers[0].id, id);
        assert_eq!(transfers[0].status, "PENDING");
        assert!(transfers[0].transaction_id.is_some());
        // TRC-20 is the preferred USDT network; its table fee applies.
        assert_eq!(transfers[0].fee, 1.0);
        // Balance left the source venue.
        assert!((fx.from.fetch_balance("USDT").await.unwrap().free - 9_000.0).abs() < 1e-9);
    }

    /// Exactly one of two competing transfers for the same (venue, currency)
    /// may hold the lock; the loser gets a lock-busy error and the lock is
    /// released on every exit path.
    #[tokio::test]
    async fn transfer_lock_is_single_flight() {
        let fx = fixture().await;
        // A competing holder owns the lock.
        let token = fx
            .cache
            .acquire_lock("transfer:okx:USDT", Duration::from_secs(10))
            .await
            .unwrap()
            .unwrap();
        match fx.router.transfer(request(1_000.0)).await {
            Err(RouterError::LockBusy { venue, currency }) => {
                assert_eq!(venue, "okx");
                assert_eq!(currency, "USDT");
            }
            other => panic!("expected LockBusy, got {other:?}"),
        }
        // Nothing was persisted or withdrawn.
        assert!(fx.store.recent_transfers(10).await.unwrap().is_empty());
        assert!((fx.from.fetch_balance("USDT").await.unwrap().free - 10_000.0).abs() < 1e-9);

        fx.cache
            .release_lock("transfer:okx:USDT", &token)
            .await
            .unwrap();
        fx.router.transfer(request(1_000.0)).await.unwrap();
    }

    #[tokio::test]
    async fn lock_released_after_error_path() {
        let fx = fixture().await;
        // More than the balance: the transfer aborts...
        let err = fx.router.transfer(request(50_000.0)).await.unwrap_err();
        assert!(matches!(err, RouterError::InsufficientBalance { .. }));
        // ...and the lock is free again immediately.
        assert!(fx
            .cache
            .acquire_lock("transfer:okx:USDT", Duration::from_secs(10))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn fee_table_honors_request_then_cheapest() {
        assert_eq!(fee_from_table("USDT", Some("ETH")), 10.0);
        assert_eq!(fee_from_table("USDT", Some("TRX")), 1.0);
        // Unknown requested network: cheapest known wins.
        assert_eq!(fee_from_table("USDT", Some("SOL")), 0.2);
        assert_eq!(fee_from_table("USDT", None), 0.2);
        assert_eq!(fee_from_table("DOGE", None), 0.0);
    }

    #[tokio::test]
    async fn adapter_fee_beats_the_table() {
        let fx = fixture().await;
        fx.from.set_withdrawal_fee("USDT", 0.7);
        fx.router.transfer(request(1_000.0)).await.unwrap();
        let transfers = fx.store.recent_transfers(1).await.unwrap();
        assert_eq!(transfers[0].fee, 0.7);
    }

    #[tokio::test]
    async fn watcher_observes_completion() {
        let fx = fixture().await;
        let id = fx.router.transfer(request(1_000.0)).await.unwrap();
        let tx_id = fx.store.recent_transfers(1).await.unwrap()[0]
            .transaction_id
            .clone()
            .unwrap();
        fx.from.settle_withdrawals(WithdrawalStatus::Ok);

        // Drive the watcher directly; the spawned copy is satisfied too.
        fx.router
            .watch_transfer(id, "okx", &tx_id, "USDT")
            .await;
        let transfers = fx.store.recent_transfers(1).await.unwrap();
        assert_eq!(transfers[0].status, "COMPLETED");
    }

    #[tokio::test]
    async fn watcher_marks_failure_terminal() {
        let fx = fixture().await;
        let id = fx.router.transfer(request(1_000.0)).await.unwrap();
        let tx_id = fx.store.recent_transfers(1).await.unwrap()[0]
            .transaction_id
            .clone()
            .unwrap();
        fx.from.settle_withdrawals(WithdrawalStatus::Rejected);

        fx.router
            .watch_transfer(id, "okx", &tx_id, "USDT")
            .await;
        assert_eq!(fx.store.recent_transfers(1).await.unwrap()[0].status, "FAILED");
    }

    #[tokio::test(start_paused = true)]
    async fn unobserved_transfer_ends_unknown() {
        let fx = fixture().await;
        let id = fx.router.transfer(request(1_000.0)).await.unwrap();
        let tx_id = fx.store.recent_transfers(1).await.unwrap()[0]
            .transaction_id
            .clone()
            .unwrap();
        // Withdrawal stays Pending past the transfer deadline.
        fx.router
            .watch_transfer(id, "okx", &tx_id, "USDT")
            .await;
        assert_eq!(
            fx.store.recent_transfers(1).await.unwrap()[0].status,
            "UNKNOWN"
        );
    }
}
