//! Redis backend for the market cache.
//!
//! Hash writes go through a MULTI pipeline so readers always see the whole
//! {bid, ask, timestamp} set; lock release runs as a Lua compare-and-delete
//! so one holder can never delete another holder's lock.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::time::Duration;

use crate::venue::{OrderBook, Pair, Ticker};

use super::{
    lock_token, CacheError, MarketCache, VenueState, VenueStatusRecord, METRIC_SERIES_LEN,
};

static RELEASE_SCRIPT: Lazy<redis::Script> = Lazy::new(|| {
    redis::Script::new(
        r#"
        if redis.call("get", KEYS[1]) == ARGV[1] then
            return redis.call("del", KEYS[1])
        else
            return 0
        end
        "#,
    )
});

pub struct RedisCache {
    conn: ConnectionManager,
}

impl RedisCache {
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_tokio_connection_manager().await?;
        Ok(Self { conn })
    }

    fn parse_f64(map: &HashMap<String, String>, field: &str) -> Option<f64> {
        map.get(field).and_then(|v| v.parse().ok())
    }
}

#[async_trait]
impl MarketCache for RedisCache {
    async fn put_ticker(
        &self,
        venue: &str,
        pair: &Pair,
        ticker: &Ticker,
    ) -> Result<(), CacheError> {
        let key = super::ticker_key(venue, pair);
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .hset_multiple(
                &key,
                &[
                    ("bid", ticker.bid.to_string()),
                    ("ask", ticker.ask.to_string()),
                    ("timestamp", ticker.ts.to_string()),
                ],
            )
            .ignore()
            .expire(&key, super::MARKET_TTL.as_secs() as usize)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn ticker(&self, venue: &str, pair: &Pair) -> Result<Option<Ticker>, CacheError> {
        let mut conn = self.conn.clone();
        let map: HashMap<String, String> = conn.hgetall(super::ticker_key(venue, pair)).await?;
        if map.is_empty() {
            return Ok(None);
        }
        let (bid, ask, ts) = match (
            Self::parse_f64(&map, "bid"),
            Self::parse_f64(&map, "ask"),
            Self::parse_f64(&map, "timestamp"),
        ) {
            (Some(bid), Some(ask), Some(ts)) => (bid, ask, ts),
            _ => return Ok(None),
        };
        Ok(Some(Ticker { bid, ask, ts }))
    }

    async fn tickers_for_pair(
        &self,
        venues: &[String],
        pair: &Pair,
    ) -> Result<Vec<(String, Ticker)>, CacheError> {
        let mut out = Vec::with_capacity(venues.len());
        for venue in venues {
            if let Some(ticker) = self.ticker(venue, pair).await? {
                out.push((venue.clone(), ticker));
            }
        }
        Ok(out)
    }

    async fn put_book(
        &self,
        venue: &str,
        pair: &Pair,
        book: &OrderBook,
    ) -> Result<(), CacheError> {
        let key = super::book_key(venue, pair);
        let bids = serde_json::to_string(&book.bids)?;
        let asks = serde_json::to_string(&book.asks)?;
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .hset_multiple(
                &key,
                &[
                    ("bids", bids),
                    ("asks", asks),
                    ("timestamp", book.ts.to_string()),
                ],
            )
            .ignore()
            .expire(&key, super::MARKET_TTL.as_secs() as usize)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn put_venue_status(
        &self,
        venue: &str,
        state: VenueState,
        message: Option<&str>,
    ) -> Result<(), CacheError> {
        let key = super::status_key(venue);
        let mut fields = vec![
            ("status", state.to_string()),
            ("timestamp", super::now_ts().to_string()),
        ];
        if let Some(message) = message {
            fields.push(("message", message.to_string()));
        }
        let mut conn = self.conn.clone();
        let _: () = conn.hset_multiple(&key, &fields).await?;
        Ok(())
    }

    async fn venue_status(&self, venue: &str) -> Result<VenueStatusRecord, CacheError> {
        let mut conn = self.conn.clone();
        let map: HashMap<String, String> = conn.hgetall(super::status_key(venue)).await?;
        if map.is_empty() {
            return Ok(VenueStatusRecord::unknown());
        }
        let state = match map.get("status").map(String::as_str) {
            Some("connected") => VenueState::Connected,
            Some("degraded") => VenueState::Degraded,
            Some("error") => VenueState::Error,
            _ => VenueState::Unknown,
        };
        Ok(VenueStatusRecord {
            state,
            ts: Self::parse_f64(&map, "timestamp").unwrap_or(0.0),
            message: map.get("message").cloned(),
        })
    }

    async fn put_opportunity(
        &self,
        id: i64,
        blob: &str,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .set_ex(super::opportunity_key(id), blob, ttl.as_secs() as usize)
            .await?;
        Ok(())
    }

    async fn opportunity(&self, id: i64) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn.clone();
        let blob: Option<String> = conn.get(super::opportunity_key(id)).await?;
        Ok(blob)
    }

    async fn push_metric(&self, service: &str, name: &str, value: f64) -> Result<(), CacheError> {
        let key = super::metric_key(service, name);
        let entry = serde_json::to_string(&serde_json::json!({
            "value": value,
            "timestamp": super::now_ts(),
        }))?;
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .lpush(&key, entry)
            .ignore()
            .ltrim(&key, 0, METRIC_SERIES_LEN as isize - 1)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn acquire_lock(
        &self,
        name: &str,
        ttl: Duration,
    ) -> Result<Option<String>, CacheError> {
        let token = lock_token();
        let mut conn = self.conn.clone();
        let acquired: Option<String> = redis::cmd("SET")
            .arg(super::lock_key(name))
            .arg(&token)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        Ok(acquired.map(|_| token))
    }

    async fn release_lock(&self, name: &str, token: &str) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        let deleted: i64 = RELEASE_SCRIPT
            .key(super::lock_key(name))
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }
}
