use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;

use crate::venue::Pair;

fn env_str(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.into())
}

fn env_f64(name: &str, default: f64) -> f64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub service: ServiceConfig,
    /// Venue name -> settings. Names double as cache/status keys.
    pub venues: BTreeMap<String, VenueSettings>,
    pub pairs: Vec<Pair>,
    pub strategy: StrategyConfig,
    pub market_data: MarketDataConfig,
    pub execution: ExecutionConfig,
    pub transfers: TransferConfig,
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub bind_address: String,
    pub port: u16,
    /// "redis" or "memory".
    pub cache_backend: String,
    pub redis_url: String,
    pub database_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VenueSettings {
    /// Adapter backend; "paper" ships in-tree, live drivers plug in here.
    pub driver: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_secret: String,
    #[serde(default)]
    pub password: Option<String>,
    pub taker_fee: f64,
    pub maker_fee: f64,
    /// Minimum spacing between adapter requests, milliseconds.
    pub rate_limit_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StrategyConfig {
    pub min_profit_margin: f64,
    /// Fraction of free balance committed per trade.
    pub max_capital_per_trade: f64,
    pub max_bid_ask_spread: f64,
    pub volatility_threshold: f64,
    pub volatility_window_secs: u64,
    pub slippage: f64,
    /// Fallback volume when the balance probe fails.
    pub default_volume: f64,
    /// Opportunities at or below this capital skip the approval channel.
    pub auto_approve_capital: f64,
    pub scan_interval_ms: u64,
    /// Tickers older than this are treated as absent by the graph builder.
    pub staleness_secs: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MarketDataConfig {
    pub ticker_interval_ms: u64,
    pub book_interval_ms: u64,
    pub book_depth: usize,
    pub call_timeout_ms: u64,
    pub max_consecutive_errors: u32,
    pub monitor_interval_secs: u64,
    pub stale_after_secs: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionConfig {
    pub fill_timeout_secs: u64,
    pub order_poll_interval_secs: u64,
    /// Unfavorable move tolerated before a leg is abandoned (0.005 = 0.5%).
    pub price_drift_tolerance: f64,
    pub opportunity_ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransferConfig {
    pub lock_ttl_secs: u64,
    pub poll_interval_secs: u64,
    pub max_transfer_time_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitoringConfig {
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,
    pub log_level: String,
}

impl Config {
    pub fn load(path: &str) -> eyre::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    pub fn load_or_default() -> Self {
        Self::load("config.toml").unwrap_or_else(|_| Self::default())
    }

    /// Venue names in config order.
    pub fn venue_names(&self) -> Vec<String> {
        self.venues.keys().cloned().collect()
    }

    /// All currencies mentioned by the configured pair set.
    pub fn currencies(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for pair in &self.pairs {
            for c in [&pair.base, &pair.quote] {
                if !out.iter().any(|x| x == c) {
                    out.push(c.clone());
                }
            }
        }
        out
    }
}

fn default_venue(prefix: &str, with_password: bool) -> VenueSettings {
    VenueSettings {
        driver: env_str(&format!("{prefix}_DRIVER"), "paper"),
        api_key: env_str(&format!("{prefix}_API_KEY"), ""),
        api_secret: env_str(&format!("{prefix}_API_SECRET"), ""),
        password: with_password
            .then(|| std::env::var(format!("{prefix}_PASSWORD")).ok())
            .flatten(),
        taker_fee: env_f64(&format!("{prefix}_TAKER_FEE"), 0.001),
        maker_fee: env_f64(&format!("{prefix}_MAKER_FEE"), 0.0008),
        rate_limit_ms: env_u64(&format!("{prefix}_RATE_LIMIT_MS"), 50),
    }
}

impl Default for Config {
    fn default() -> Self {
        let mut venues = BTreeMap::new();
        venues.insert("okx".into(), default_venue("OKX", true));
        venues.insert("bybit".into(), default_venue("BYBIT", false));
        venues.insert("htx".into(), default_venue("HTX", false));

        let pairs = [
            "BTC/USDT", "ETH/USDT", "BNB/USDT", "XRP/USDT", "SOL/USDT", "ADA/USDT", "AVAX/USDT",
            "DOGE/USDT", "DOT/USDT", "LINK/USDT", "ETH/BTC", "SOL/BTC",
        ]
        .iter()
        .map(|s| s.parse().expect("static pair symbol"))
        .collect();

        Config {
            service: ServiceConfig {
                bind_address: env_str("BIND_ADDRESS", "0.0.0.0"),
                port: env_u64("PORT", 8000) as u16,
                cache_backend: env_str("CACHE_BACKEND", "redis"),
                redis_url: env_str("REDIS_URL", "redis://127.0.0.1:6379/0"),
                database_path: env_str("DATABASE_PATH", "crossarb.db"),
            },
            venues,
            pairs,
            strategy: StrategyConfig {
                min_profit_margin: env_f64("MIN_PROFIT_MARGIN", 0.003),
                max_capital_per_trade: env_f64("MAX_CAPITAL_PER_TRADE", 0.1),
                max_bid_ask_spread: env_f64("MAX_BID_ASK_SPREAD", 0.004),
                volatility_threshold: env_f64("VOLATILITY_THRESHOLD", 0.03),
                volatility_window_secs: env_u64("VOLATILITY_WINDOW", 300),
                slippage: env_f64("SLIPPAGE", 0.0005),
                default_volume: env_f64("DEFAULT_VOLUME", 1000.0),
                auto_approve_capital: env_f64("AUTO_APPROVE_CAPITAL", 100.0),
                scan_interval_ms: env_u64("SCAN_INTERVAL_MS", 200),
                staleness_secs: env_f64("TICKER_STALENESS_SECS", 10.0),
            },
            market_data: MarketDataConfig {
                ticker_interval_ms: env_u64("TICKER_INTERVAL_MS", 100),
                book_interval_ms: env_u64("BOOK_INTERVAL_MS", 1000),
                book_depth: env_u64("BOOK_DEPTH", 20) as usize,
                call_timeout_ms: env_u64("CALL_TIMEOUT_MS", 2000),
                max_consecutive_errors: env_u64("MAX_CONSECUTIVE_ERRORS", 5) as u32,
                monitor_interval_secs: env_u64("MONITOR_INTERVAL_SECS", 30),
                stale_after_secs: env_f64("STALE_AFTER_SECS", 60.0),
            },
            execution: ExecutionConfig {
                fill_timeout_secs: env_u64("FILL_TIMEOUT_SECS", 60),
                order_poll_interval_secs: env_u64("ORDER_POLL_INTERVAL_SECS", 1),
                price_drift_tolerance: env_f64("PRICE_DRIFT_TOLERANCE", 0.005),
                opportunity_ttl_secs: env_u64("OPPORTUNITY_TTL_SECS", 300),
            },
            transfers: TransferConfig {
                lock_ttl_secs: env_u64("TRANSFER_LOCK_TTL_SECS", 10),
                poll_interval_secs: env_u64("TRANSFER_POLL_INTERVAL_SECS", 30),
                max_transfer_time_secs: env_u64("MAX_TRANSFER_TIME", 60),
            },
            monitoring: MonitoringConfig {
                telegram_bot_token: std::env::var("TELEGRAM_BOT_TOKEN").ok(),
                telegram_chat_id: std::env::var("TELEGRAM_ADMIN_CHAT_ID").ok(),
                log_level: env_str("LOG_LEVEL", "info"),
            },
        }
    }
}
