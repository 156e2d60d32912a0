//! Operator surface: run statistics, Telegram alerts and the
//! human-in-the-loop approval gate.

use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::{oneshot, RwLock};
use tracing::{info, warn};

use crate::venue::Pair;

#[derive(Debug, Clone, Default)]
pub struct Stats {
    pub opportunities_found: u64,
    pub approvals_requested: u64,
    pub executions_completed: u64,
    pub executions_failed: u64,
    pub executions_canceled: u64,
    pub transfers_initiated: u64,
    pub transfers_completed: u64,
    pub transfers_failed: u64,
    pub transfers_unknown: u64,
    pub start_time: Option<std::time::Instant>,
}

pub struct Monitor {
    stats: RwLock<Stats>,
    telegram_bot_token: Option<String>,
    telegram_chat_id: Option<String>,
    http_client: reqwest::Client,
}

impl Monitor {
    pub fn new(telegram_bot_token: Option<String>, telegram_chat_id: Option<String>) -> Self {
        Self {
            stats: RwLock::new(Stats {
                start_time: Some(std::time::Instant::now()),
                ..Default::default()
            }),
            telegram_bot_token,
            telegram_chat_id,
            http_client: reqwest::Client::new(),
        }
    }

    pub async fn record_opportunity(&self, id: i64, pair: &Pair, profit_margin: f64) {
        let mut stats = self.stats.write().await;
        stats.opportunities_found += 1;
        info!(
            "📊 Opportunity #{} ({}): {} | margin {:.4}%",
            stats.opportunities_found,
            id,
            pair,
            profit_margin * 100.0
        );
    }

    pub async fn record_execution_completed(&self, id: i64, profit_margin: f64) {
        {
            let mut stats = self.stats.write().await;
            stats.executions_completed += 1;
        }
        let msg = format!(
            "✅ EXECUTION COMPLETED\nOpportunity: {}\nMargin: {:.4}%",
            id,
            profit_margin * 100.0
        );
        info!("{}", msg);
        self.send_telegram(&msg).await;
    }

    pub async fn record_execution_failed(&self, id: i64, reason: &str) {
        {
            let mut stats = self.stats.write().await;
            stats.executions_failed += 1;
        }
        let msg = format!("❌ EXECUTION FAILED\nOpportunity: {}\nReason: {}", id, reason);
        warn!("{}", msg);
        self.send_telegram(&msg).await;
    }

    pub async fn record_execution_canceled(&self, id: i64) {
        let mut stats = self.stats.write().await;
        stats.executions_canceled += 1;
        info!("Opportunity {} canceled", id);
    }

    pub async fn record_transfer(&self, outcome: TransferOutcome) {
        let mut stats = self.stats.write().await;
        match outcome {
            TransferOutcome::Initiated => stats.transfers_initiated += 1,
            TransferOutcome::Completed => stats.transfers_completed += 1,
            TransferOutcome::Failed => stats.transfers_failed += 1,
            TransferOutcome::Unknown => stats.transfers_unknown += 1,
        }
    }

    pub async fn get_stats(&self) -> Stats {
        self.stats.read().await.clone()
    }

    pub async fn log_summary(&self) {
        let stats = self.stats.read().await;
        let uptime = stats.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0);
        info!("═══════════════════════════════════════════");
        info!("📊 ENGINE STATISTICS");
        info!("═══════════════════════════════════════════");
        info!("Uptime:              {}h {}m", uptime / 3600, (uptime % 3600) / 60);
        info!("Opportunities Found: {}", stats.opportunities_found);
        info!("Approvals Requested: {}", stats.approvals_requested);
        info!("Executions OK:       {}", stats.executions_completed);
        info!("Executions Failed:   {}", stats.executions_failed);
        info!("Executions Canceled: {}", stats.executions_canceled);
        info!(
            "Transfers:           {} initiated / {} completed / {} failed / {} unknown",
            stats.transfers_initiated,
            stats.transfers_completed,
            stats.transfers_failed,
            stats.transfers_unknown
        );
        info!("═══════════════════════════════════════════");
    }

    async fn send_telegram(&self, message: &str) {
        if let (Some(token), Some(chat_id)) = (&self.telegram_bot_token, &self.telegram_chat_id) {
            let url = format!("https://api.telegram.org/bot{}/sendMessage", token);
            let params = serde_json::json!({
                "chat_id": chat_id,
                "text": message,
                "parse_mode": "HTML"
            });
            if let Err(e) = self.http_client.post(&url).json(&params).send().await {
                warn!("Failed to send Telegram alert: {:?}", e);
            }
        }
    }

    pub async fn send_alert(&self, message: &str) {
        info!("🚨 ALERT: {}", message);
        self.send_telegram(&format!("🚨 {}", message)).await;
    }

    pub async fn send_startup_message(&self) {
        let msg = "🚀 Cross-Exchange Arbitrage Engine Started\n\nScanning for opportunities...";
        info!("{}", msg);
        self.send_telegram(msg).await;
    }
}

#[derive(Debug, Clone, Copy)]
pub enum TransferOutcome {
    Initiated,
    Completed,
    Failed,
    Unknown,
}

/// Outbound approval request content.
#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    pub opportunity_id: i64,
    pub main_pair: Pair,
    pub venues: Vec<String>,
    pub profit_margin: f64,
    pub additional_capital_pct: f64,
}

/// Pending operator confirmations, keyed by opportunity id. The outbound
/// message is best-effort; the coordinator owns the deadline and calls
/// `expire` when the opportunity's TTL lapses.
pub struct ApprovalGate {
    pending: Mutex<HashMap<i64, oneshot::Sender<bool>>>,
}

impl ApprovalGate {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Register the wait and send the operator message. The receiver yields
    /// the confirm/reject decision.
    pub async fn request(
        &self,
        monitor: &Monitor,
        request: &ApprovalRequest,
    ) -> oneshot::Receiver<bool> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request.opportunity_id, tx);

        {
            let mut stats = monitor.stats.write().await;
            stats.approvals_requested += 1;
        }
        let msg = format!(
            "🔔 <b>Trade Confirmation Required</b>\n\n\
             Opportunity: {}\n\
             Pair: {}\n\
             Venues: {}\n\
             Margin (after fees): {:.4}%\n\
             Additional capital: {:.1}%\n\n\
             Confirm via POST /opportunity/{}/confirm",
            request.opportunity_id,
            request.main_pair,
            request.venues.join(" → "),
            request.profit_margin * 100.0,
            request.additional_capital_pct,
            request.opportunity_id,
        );
        monitor.send_telegram(&msg).await;
        rx
    }

    /// Deliver an inbound confirm/reject. Returns false when nothing was
    /// waiting (expired, already executed, or unknown id).
    pub fn resolve(&self, opportunity_id: i64, approved: bool) -> bool {
        match self.pending.lock().remove(&opportunity_id) {
            Some(tx) => tx.send(approved).is_ok(),
            None => false,
        }
    }

    /// Drop the wait; the blocked receiver observes a closed channel.
    pub fn expire(&self, opportunity_id: i64) {
        self.pending.lock().remove(&opportunity_id);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

impl Default for ApprovalGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_delivers_decision_to_the_waiter() {
        let monitor = Monitor::new(None, None);
        let gate = ApprovalGate::new();
        let request = ApprovalRequest {
            opportunity_id: 7,
            main_pair: Pair::new("BTC", "USDT"),
            venues: vec!["okx".into(), "bybit".into()],
            profit_margin: 0.004,
            additional_capital_pct: 12.0,
        };
        let rx = gate.request(&monitor, &request).await;
        assert_eq!(gate.pending_count(), 1);

        assert!(gate.resolve(7, true));
        assert_eq!(rx.await, Ok(true));
        assert_eq!(gate.pending_count(), 0);
        // A second resolve finds nothing.
        assert!(!gate.resolve(7, true));
    }

    #[tokio::test]
    async fn expire_closes_the_channel() {
        let monitor = Monitor::new(None, None);
        let gate = ApprovalGate::new();
        let request = ApprovalRequest {
            opportunity_id: 9,
            main_pair: Pair::new("ETH", "USDT"),
            venues: vec!["okx".into()],
            profit_margin: 0.004,
            additional_capital_pct: 0.0,
        };
        let rx = gate.request(&monitor, &request).await;
        gate.expire(9);
        assert!(rx.await.is_err());
    }
}
