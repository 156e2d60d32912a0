//! Durable opportunity/trade/transfer log.
//!
//! SQLite behind an async mutex. Writes are row-granular; nothing in the
//! core relies on cross-row invariants or cascade deletes.

use chrono::{NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::detector::OpportunityState;
use crate::executor::TradeState;
use crate::router::TransferState;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database: {0}")]
    Db(#[from] rusqlite::Error),
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS arbitrage_opportunities (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    created_at    TEXT NOT NULL,
    pair          TEXT NOT NULL,
    buy_exchange  TEXT NOT NULL,
    sell_exchange TEXT NOT NULL,
    buy_price     REAL NOT NULL,
    sell_price    REAL NOT NULL,
    volume        REAL NOT NULL,
    profit_margin REAL NOT NULL,
    status        TEXT NOT NULL DEFAULT 'DETECTED'
);
CREATE TABLE IF NOT EXISTS trades (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    opportunity_id INTEGER NOT NULL,
    created_at     TEXT NOT NULL,
    exchange       TEXT NOT NULL,
    pair           TEXT NOT NULL,
    side           TEXT NOT NULL,
    price          REAL NOT NULL,
    amount         REAL NOT NULL,
    fee            REAL NOT NULL,
    order_id       TEXT NOT NULL,
    status         TEXT NOT NULL DEFAULT 'OPEN'
);
CREATE TABLE IF NOT EXISTS fund_transfers (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    created_at     TEXT NOT NULL,
    from_exchange  TEXT NOT NULL,
    to_exchange    TEXT NOT NULL,
    currency       TEXT NOT NULL,
    amount         REAL NOT NULL,
    fee            REAL NOT NULL,
    transaction_id TEXT,
    status         TEXT NOT NULL DEFAULT 'PENDING'
);
CREATE TABLE IF NOT EXISTS system_metrics (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    created_at   TEXT NOT NULL,
    service      TEXT NOT NULL,
    metric_name  TEXT NOT NULL,
    metric_value REAL NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_opportunities_created
    ON arbitrage_opportunities (created_at);
CREATE INDEX IF NOT EXISTS idx_trades_opportunity
    ON trades (opportunity_id);
"#;

#[derive(Debug, Clone)]
pub struct NewOpportunity {
    pub pair: String,
    pub buy_exchange: String,
    pub sell_exchange: String,
    pub buy_price: f64,
    pub sell_price: f64,
    pub volume: f64,
    pub profit_margin: f64,
}

#[derive(Debug, Clone)]
pub struct NewTrade {
    pub opportunity_id: i64,
    pub exchange: String,
    pub pair: String,
    pub side: String,
    pub price: f64,
    pub amount: f64,
    pub fee: f64,
    pub order_id: String,
}

#[derive(Debug, Clone)]
pub struct NewTransfer {
    pub from_exchange: String,
    pub to_exchange: String,
    pub currency: String,
    pub amount: f64,
    pub fee: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct OpportunityRow {
    pub id: i64,
    pub created_at: String,
    pub pair: String,
    pub buy_exchange: String,
    pub sell_exchange: String,
    pub buy_price: f64,
    pub sell_price: f64,
    pub volume: f64,
    pub profit_margin: f64,
    pub status: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TradeRow {
    pub id: i64,
    pub opportunity_id: i64,
    pub created_at: String,
    pub exchange: String,
    pub pair: String,
    pub side: String,
    pub price: f64,
    pub amount: f64,
    pub fee: f64,
    pub order_id: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransferRow {
    pub id: i64,
    pub created_at: String,
    pub from_exchange: String,
    pub to_exchange: String,
    pub currency: String,
    pub amount: f64,
    pub fee: f64,
    pub transaction_id: Option<String>,
    pub status: String,
}

pub struct Store {
    conn: Mutex<Connection>,
}

/// SQLite-friendly UTC timestamp; `date()` aggregation relies on this form.
fn now_iso() -> String {
    Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

impl Store {
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(path)?
        };
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::open(":memory:")
    }

    pub async fn insert_opportunity(&self, rec: &NewOpportunity) -> Result<i64, StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO arbitrage_opportunities
             (created_at, pair, buy_exchange, sell_exchange, buy_price, sell_price, volume, profit_margin, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'DETECTED')",
            params![
                now_iso(),
                rec.pair,
                rec.buy_exchange,
                rec.sell_exchange,
                rec.buy_price,
                rec.sell_price,
                rec.volume,
                rec.profit_margin,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn update_opportunity_status(
        &self,
        id: i64,
        status: OpportunityState,
    ) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE arbitrage_opportunities SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id],
        )?;
        Ok(changed > 0)
    }

    pub async fn opportunity_status(&self, id: i64) -> Result<Option<String>, StoreError> {
        let conn = self.conn.lock().await;
        let status = conn
            .query_row(
                "SELECT status FROM arbitrage_opportunities WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(status)
    }

    pub async fn insert_trade(&self, rec: &NewTrade) -> Result<i64, StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO trades
             (opportunity_id, created_at, exchange, pair, side, price, amount, fee, order_id, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'OPEN')",
            params![
                rec.opportunity_id,
                now_iso(),
                rec.exchange,
                rec.pair,
                rec.side,
                rec.price,
                rec.amount,
                rec.fee,
                rec.order_id,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Advance a trade; fills also record the venue-reported fee.
    pub async fn update_trade_status(
        &self,
        id: i64,
        status: TradeState,
        fee: Option<f64>,
    ) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let changed = match fee {
            Some(fee) => conn.execute(
                "UPDATE trades SET status = ?1, fee = ?2 WHERE id = ?3",
                params![status.as_str(), fee, id],
            )?,
            None => conn.execute(
                "UPDATE trades SET status = ?1 WHERE id = ?2",
                params![status.as_str(), id],
            )?,
        };
        Ok(changed > 0)
    }

    pub async fn trades_for_opportunity(&self, id: i64) -> Result<Vec<TradeRow>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, opportunity_id, created_at, exchange, pair, side, price, amount, fee, order_id, status
             FROM trades WHERE opportunity_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![id], trade_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub async fn insert_transfer(&self, rec: &NewTransfer) -> Result<i64, StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO fund_transfers
             (created_at, from_exchange, to_exchange, currency, amount, fee, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'PENDING')",
            params![
                now_iso(),
                rec.from_exchange,
                rec.to_exchange,
                rec.currency,
                rec.amount,
                rec.fee,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn update_transfer_status(
        &self,
        id: i64,
        status: TransferState,
        transaction_id: Option<&str>,
    ) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let changed = match transaction_id {
            Some(tx) => conn.execute(
                "UPDATE fund_transfers SET status = ?1, transaction_id = ?2 WHERE id = ?3",
                params![status.as_str(), tx, id],
            )?,
            None => conn.execute(
                "UPDATE fund_transfers SET status = ?1 WHERE id = ?2",
                params![status.as_str(), id],
            )?,
        };
        Ok(changed > 0)
    }

    pub async fn insert_metric(
        &self,
        service: &str,
        name: &str,
        value: f64,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO system_metrics (created_at, service, metric_name, metric_value)
             VALUES (?1, ?2, ?3, ?4)",
            params![now_iso(), service, name, value],
        )?;
        Ok(())
    }

    pub async fn recent_opportunities(&self, limit: u32) -> Result<Vec<OpportunityRow>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, created_at, pair, buy_exchange, sell_exchange, buy_price, sell_price, volume, profit_margin, status
             FROM arbitrage_opportunities ORDER BY created_at DESC, id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], opportunity_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub async fn recent_transfers(&self, limit: u32) -> Result<Vec<TransferRow>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, created_at, from_exchange, to_exchange, currency, amount, fee, transaction_id, status
             FROM fund_transfers ORDER BY created_at DESC, id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], transfer_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Realized PnL for one UTC day: filled sell value minus filled buy
    /// value minus trade fees on COMPLETED opportunities, minus completed
    /// transfer fees the same day.
    pub async fn daily_pnl(&self, date: NaiveDate) -> Result<f64, StoreError> {
        let day = date.format("%Y-%m-%d").to_string();
        let conn = self.conn.lock().await;
        let trade_pnl: f64 = conn.query_row(
            "SELECT IFNULL(SUM(
                 CASE WHEN t.side = 'sell' THEN t.price * t.amount
                      ELSE -(t.price * t.amount) END - t.fee), 0.0)
             FROM trades t
             JOIN arbitrage_opportunities o ON o.id = t.opportunity_id
             WHERE o.status = 'COMPLETED'
               AND t.status = 'FILLED'
               AND date(o.created_at) = ?1",
            params![day],
            |row| row.get(0),
        )?;
        let transfer_fees: f64 = conn.query_row(
            "SELECT IFNULL(SUM(fee), 0.0)
             FROM fund_transfers
             WHERE status = 'COMPLETED' AND date(created_at) = ?1",
            params![day],
            |row| row.get(0),
        )?;
        Ok(trade_pnl - transfer_fees)
    }
}

fn opportunity_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<OpportunityRow> {
    Ok(OpportunityRow {
        id: row.get(0)?,
        created_at: row.get(1)?,
        pair: row.get(2)?,
        buy_exchange: row.get(3)?,
        sell_exchange: row.get(4)?,
        buy_price: row.get(5)?,
        sell_price: row.get(6)?,
        volume: row.get(7)?,
        profit_margin: row.get(8)?,
        status: row.get(9)?,
    })
}

fn trade_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TradeRow> {
    Ok(TradeRow {
        id: row.get(0)?,
        opportunity_id: row.get(1)?,
        created_at: row.get(2)?,
        exchange: row.get(3)?,
        pair: row.get(4)?,
        side: row.get(5)?,
        price: row.get(6)?,
        amount: row.get(7)?,
        fee: row.get(8)?,
        order_id: row.get(9)?,
        status: row.get(10)?,
    })
}

fn transfer_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TransferRow> {
    Ok(TransferRow {
        id: row.get(0)?,
        created_at: row.get(1)?,
        from_exchange: row.get(2)?,
        to_exchange: row.get(3)?,
        currency: row.get(4)?,
        amount: row.get(5)?,
        fee: row.get(6)?,
        transaction_id: row.get(7)?,
        status: row.get(8)?,
    })
}
