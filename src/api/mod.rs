//! HTTP service surface.
//!
//! One axum router covering status, opportunity lifecycle (including the
//! inbound half of the approval channel), order and transfer queries, and
//! balance/fee probes.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

use crate::detector::{OpportunityState, SharedOpportunities};
use crate::executor::{SharedOrders, TradeState};
use crate::market_data::SharedHealth;
use crate::monitor::ApprovalGate;
use crate::router::{FundsRouter, RouterError, SharedTransfers, TransferRequest};
use crate::store::Store;
use crate::venue::VenueRegistry;

pub struct AppState {
    pub registry: Arc<VenueRegistry>,
    pub store: Arc<Store>,
    pub gate: Arc<ApprovalGate>,
    pub funds_router: Arc<FundsRouter>,
    pub health: SharedHealth,
    pub opportunities: SharedOpportunities,
    pub orders: SharedOrders,
    pub transfers: SharedTransfers,
    pub exec_tx: mpsc::Sender<i64>,
}

type ApiResult = Result<Json<Value>, (StatusCode, Json<Value>)>;

fn not_found(what: &str) -> (StatusCode, Json<Value>) {
    (StatusCode::NOT_FOUND, Json(json!({ "detail": what })))
}

fn internal(err: impl std::fmt::Display) -> (StatusCode, Json<Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "detail": err.to_string() })),
    )
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .route("/opportunities", get(get_opportunities))
        .route("/opportunity/:id", get(get_opportunity))
        .route("/opportunity/:id/execute", post(execute_opportunity))
        .route("/opportunity/:id/cancel", post(cancel_opportunity))
        .route("/opportunity/:id/confirm", post(confirm_opportunity))
        .route("/opportunity/:id/reject", post(reject_opportunity))
        .route("/orders", get(get_orders))
        .route("/order/:id", get(get_order))
        .route("/order/:id/cancel", post(cancel_order))
        .route("/transfers", get(get_transfers))
        .route("/transfer/:id", get(get_transfer))
        .route("/transfer", post(post_transfer))
        .route("/balance/:venue/:currency", get(get_balance))
        .route("/fee/:venue/:currency", get(get_fee))
        .route("/pnl/daily", get(get_daily_pnl))
        .with_state(state)
}

async fn get_status(State(state): State<Arc<AppState>>) -> Json<Value> {
    let venues: Value = {
        let health = state.health.lock();
        serde_json::to_value(&*health).unwrap_or(Value::Null)
    };
    Json(json!({
        "status": "running",
        "exchanges": venues,
        "active_opportunities": state.opportunities.lock().len(),
        "active_orders": state.orders.lock().len(),
        "active_transfers": state.transfers.lock().len(),
        "pending_approvals": state.gate.pending_count(),
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

#[derive(Deserialize)]
struct LimitQuery {
    #[serde(default = "default_limit")]
    limit: u32,
}

fn default_limit() -> u32 {
    10
}

async fn get_opportunities(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> ApiResult {
    let rows = state
        .store
        .recent_opportunities(query.limit)
        .await
        .map_err(internal)?;
    Ok(Json(json!({
        "opportunities": rows,
        "timestamp": Utc::now().to_rfc3339(),
    })))
}

async fn get_opportunity(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult {
    let entry = state.opportunities.lock().get(&id).cloned();
    match entry {
        Some(entry) => Ok(Json(serde_json::to_value(&entry).map_err(internal)?)),
        None => Err(not_found("Opportunity not found")),
    }
}

async fn execute_opportunity(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult {
    {
        let opportunities = state.opportunities.lock();
        let Some(entry) = opportunities.get(&id) else {
            return Err(not_found("Opportunity not found"));
        };
        // Only DETECTED opportunities may be (re-)queued; anything further
        // along is already owned by the coordinator or terminal.
        if entry.state != OpportunityState::Detected {
            return Err((
                StatusCode::CONFLICT,
                Json(json!({ "detail": format!("cannot execute from {:?}", entry.state) })),
            ));
        }
    }
    state
        .exec_tx
        .send(id)
        .await
        .map_err(|_| internal("execution queue closed"))?;
    Ok(Json(json!({ "status": "executing", "opportunity_id": id })))
}

async fn cancel_opportunity(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult {
    {
        let mut opportunities = state.opportunities.lock();
        let Some(entry) = opportunities.get_mut(&id) else {
            return Err(not_found("Opportunity not found"));
        };
        if !entry.state.can_advance(OpportunityState::Canceled) {
            return Err((
                StatusCode::CONFLICT,
                Json(json!({ "detail": format!("cannot cancel from {:?}", entry.state) })),
            ));
        }
        entry.state = OpportunityState::Canceled;
    }
    state.gate.expire(id);
    state
        .store
        .update_opportunity_status(id, OpportunityState::Canceled)
        .await
        .map_err(internal)?;
    Ok(Json(json!({ "status": "canceled", "opportunity_id": id })))
}

async fn confirm_opportunity(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult {
    if state.gate.resolve(id, true) {
        Ok(Json(json!({ "status": "confirmed", "opportunity_id": id })))
    } else {
        Err(not_found("No pending confirmation for opportunity"))
    }
}

async fn reject_opportunity(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult {
    if state.gate.resolve(id, false) {
        Ok(Json(json!({ "status": "rejected", "opportunity_id": id })))
    } else {
        Err(not_found("No pending confirmation for opportunity"))
    }
}

async fn get_orders(State(state): State<Arc<AppState>>) -> Json<Value> {
    let orders = state.orders.lock().clone();
    Json(json!({
        "orders": orders,
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

async fn get_order(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult {
    let record = state.orders.lock().get(&id).cloned();
    match record {
        Some(record) => Ok(Json(serde_json::to_value(&record).map_err(internal)?)),
        None => Err(not_found("Order not found")),
    }
}

async fn cancel_order(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult {
    let record = state.orders.lock().get(&id).cloned();
    let Some(record) = record else {
        return Err(not_found("Order not found"));
    };
    let adapter = state
        .registry
        .get_or_init(&record.venue)
        .await
        .map_err(internal)?;
    adapter.cancel_order(&id).await.map_err(internal)?;
    if let Some(entry) = state.orders.lock().get_mut(&id) {
        entry.status = TradeState::Canceled;
    }
    let _ = state
        .store
        .update_trade_status(record.trade_id, TradeState::Canceled, None)
        .await;
    Ok(Json(json!({ "status": "canceled", "order_id": id })))
}

async fn get_transfers(State(state): State<Arc<AppState>>) -> Json<Value> {
    let transfers = state.transfers.lock().clone();
    Json(json!({
        "transfers": transfers,
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

async fn get_transfer(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> ApiResult {
    let record = state.transfers.lock().get(&id).cloned();
    match record {
        Some(record) => Ok(Json(serde_json::to_value(&record).map_err(internal)?)),
        None => Err(not_found("Transfer not found")),
    }
}

#[derive(Deserialize)]
struct TransferBody {
    from_exchange: String,
    to_exchange: String,
    currency: String,
    amount: f64,
    network: Option<String>,
}

async fn post_transfer(
    State(state): State<Arc<AppState>>,
    Json(body): Json<TransferBody>,
) -> ApiResult {
    let request = TransferRequest {
        from_venue: body.from_exchange,
        to_venue: body.to_exchange,
        currency: body.currency,
        amount: body.amount,
        network: body.network,
    };
    match state.funds_router.transfer(request).await {
        Ok(id) => Ok(Json(json!({
            "status": "pending",
            "transfer_id": id,
            "timestamp": Utc::now().to_rfc3339(),
        }))),
        Err(e @ RouterError::LockBusy { .. }) => Err((
            StatusCode::CONFLICT,
            Json(json!({ "detail": e.to_string() })),
        )),
        Err(e @ RouterError::InsufficientBalance { .. }) => Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "detail": e.to_string() })),
        )),
        Err(e) => {
            warn!("transfer failed: {e}");
            Err(internal(e))
        }
    }
}

async fn get_balance(
    State(state): State<Arc<AppState>>,
    Path((venue, currency)): Path<(String, String)>,
) -> ApiResult {
    let adapter = state.registry.get_or_init(&venue).await.map_err(internal)?;
    let balance = adapter.fetch_balance(&currency).await.map_err(internal)?;
    Ok(Json(json!({
        "exchange": venue,
        "currency": currency,
        "balance": balance,
        "timestamp": Utc::now().to_rfc3339(),
    })))
}

#[derive(Deserialize)]
struct FeeQuery {
    network: Option<String>,
}

async fn get_fee(
    State(state): State<Arc<AppState>>,
    Path((venue, currency)): Path<(String, String)>,
    Query(query): Query<FeeQuery>,
) -> ApiResult {
    let fee = state
        .funds_router
        .quote_fee(&venue, &currency, query.network.as_deref())
        .await
        .map_err(internal)?;
    Ok(Json(json!({
        "exchange": venue,
        "currency": currency,
        "network": query.network,
        "fee": fee,
        "timestamp": Utc::now().to_rfc3339(),
    })))
}

#[derive(Deserialize)]
struct DateQuery {
    date: Option<chrono::NaiveDate>,
}

async fn get_daily_pnl(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DateQuery>,
) -> ApiResult {
    let date = query.date.unwrap_or_else(|| Utc::now().date_naive());
    let pnl = state.store.daily_pnl(date).await.map_err(internal)?;
    Ok(Json(json!({
        "date": date.to_string(),
        "pnl": pnl,
    })))
}
