use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Kind of payload carried on the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    StockRealtime,
    IndexRealtime,
    Historical,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::StockRealtime => "stock_realtime",
            DataType::IndexRealtime => "index_realtime",
            DataType::Historical => "historical",
        }
    }

    /// Short tag used in cache keys (`latest:<tag>:<symbol>`, `symbols:<tag>`).
    pub fn short(&self) -> &'static str {
        match self {
            DataType::StockRealtime => "stock",
            DataType::IndexRealtime => "index",
            DataType::Historical => "historical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "stock_realtime" => Some(DataType::StockRealtime),
            "index_realtime" => Some(DataType::IndexRealtime),
            "historical" => Some(DataType::Historical),
            _ => None,
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One level of the five-level order book.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: f64,
    /// Shares, not lots.
    pub volume: f64,
}

/// Canonical per-symbol snapshot.
///
/// Volume-denominated fields are in shares; monetary fields in CNY.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockData {
    /// 6-digit numeric symbol, exchange prefix stripped.
    pub symbol: String,
    pub name: String,
    pub price: f64,
    pub change: f64,
    pub change_percent: f64,
    /// Vendor market-classification code (field 0 of the Tencent record).
    pub market_code: i64,
    pub volume: f64,
    pub turnover: f64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub prev_close: f64,
    pub bids: [BookLevel; 5],
    pub asks: [BookLevel; 5],
    pub outer_disc: f64,
    pub inner_disc: f64,
    pub turnover_rate: f64,
    pub pe: f64,
    pub pb: f64,
    pub amplitude: f64,
    pub circulating_market_cap: f64,
    pub total_market_cap: f64,
    pub limit_up: f64,
    pub limit_down: f64,
    pub timestamp: DateTime<Utc>,
}

impl StockData {
    pub fn empty(symbol: &str, timestamp: DateTime<Utc>) -> Self {
        Self {
            symbol: symbol.to_string(),
            name: String::new(),
            price: 0.0,
            change: 0.0,
            change_percent: 0.0,
            market_code: 0,
            volume: 0.0,
            turnover: 0.0,
            open: 0.0,
            high: 0.0,
            low: 0.0,
            prev_close: 0.0,
            bids: [BookLevel::default(); 5],
            asks: [BookLevel::default(); 5],
            outer_disc: 0.0,
            inner_disc: 0.0,
            turnover_rate: 0.0,
            pe: 0.0,
            pb: 0.0,
            amplitude: 0.0,
            circulating_market_cap: 0.0,
            total_market_cap: 0.0,
            limit_up: 0.0,
            limit_down: 0.0,
            timestamp,
        }
    }

    /// Stability fingerprint: same symbol + last price + volume means the
    /// upstream has not produced a new tick.
    pub fn fingerprint(&self) -> String {
        format!("{}|{}|{}", self.symbol, self.price, self.volume)
    }

    /// Structural invariants every emitted record must satisfy.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !is_valid_symbol(&self.symbol) {
            return Err(ValidationError::BadSymbol(self.symbol.clone()));
        }
        for (field, v) in [
            ("price", self.price),
            ("volume", self.volume),
            ("turnover", self.turnover),
            ("open", self.open),
            ("high", self.high),
            ("low", self.low),
            ("prev_close", self.prev_close),
            ("outer_disc", self.outer_disc),
            ("inner_disc", self.inner_disc),
            ("circulating_market_cap", self.circulating_market_cap),
            ("total_market_cap", self.total_market_cap),
            ("limit_up", self.limit_up),
            ("limit_down", self.limit_down),
        ] {
            if v < 0.0 || !v.is_finite() {
                return Err(ValidationError::NegativeField(field));
            }
        }
        for level in self.bids.iter().chain(self.asks.iter()) {
            if level.price < 0.0 || level.volume < 0.0 {
                return Err(ValidationError::NegativeField("book"));
            }
        }
        // Price ordering only applies once the symbol has traded today.
        // The ceiling is max(high, prev_close * 1.1): a tick pinned at the
        // daily limit-up rail can sit above a high field the vendor has not
        // caught up yet.
        if self.high > 0.0 {
            const EPS: f64 = 1e-6;
            let ceiling = self.high.max(self.prev_close * 1.1);
            if self.low > self.open + EPS
                || self.low > self.price + EPS
                || self.low > self.prev_close + EPS
                || self.open > ceiling + EPS
                || self.price > ceiling + EPS
            {
                return Err(ValidationError::PriceOrder);
            }
            if (ceiling - self.low) + EPS < (self.price - self.open).abs() {
                return Err(ValidationError::PriceOrder);
            }
        }
        // Empty book levels report zero and are exempt from monotonicity.
        let mut last_bid = f64::MAX;
        for level in self.bids.iter().filter(|l| l.price > 0.0) {
            if level.price > last_bid + 1e-6 {
                return Err(ValidationError::BookOrder("bid"));
            }
            last_bid = level.price;
        }
        let mut last_ask = 0.0f64;
        for level in self.asks.iter().filter(|l| l.price > 0.0) {
            if level.price + 1e-6 < last_ask {
                return Err(ValidationError::BookOrder("ask"));
            }
            last_ask = level.price;
        }
        Ok(())
    }

    /// A producer timestamp more than 24h away from `now` is bogus vendor
    /// data; replace it with `now` so downstream TTLs stay sane.
    pub fn clamp_timestamp(&mut self, now: DateTime<Utc>) {
        if (self.timestamp - now).abs() > Duration::hours(24) {
            warn!(
                symbol = %self.symbol,
                reported = %self.timestamp,
                "vendor timestamp outside 24h window, substituting wall clock"
            );
            self.timestamp = now;
        }
    }
}

/// Canonical index snapshot (no order book).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexData {
    pub symbol: String,
    pub name: String,
    pub value: f64,
    pub change: f64,
    pub change_percent: f64,
    pub volume: f64,
    pub turnover: f64,
    pub timestamp: DateTime<Utc>,
}

impl IndexData {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !is_valid_symbol(&self.symbol) {
            return Err(ValidationError::BadSymbol(self.symbol.clone()));
        }
        if self.value < 0.0 || self.volume < 0.0 || self.turnover < 0.0 {
            return Err(ValidationError::NegativeField("value"));
        }
        Ok(())
    }

    pub fn fingerprint(&self) -> String {
        format!("{}|{}|{}", self.symbol, self.value, self.volume)
    }

    pub fn clamp_timestamp(&mut self, now: DateTime<Utc>) {
        if (self.timestamp - now).abs() > Duration::hours(24) {
            warn!(
                symbol = %self.symbol,
                reported = %self.timestamp,
                "vendor timestamp outside 24h window, substituting wall clock"
            );
            self.timestamp = now;
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ValidationError {
    #[error("symbol '{0}' is not a 6-digit code")]
    BadSymbol(String),
    #[error("field '{0}' is negative or non-finite")]
    NegativeField(&'static str),
    #[error("price fields violate low <= open,close <= high")]
    PriceOrder,
    #[error("{0} prices are not monotonic")]
    BookOrder(&'static str),
}

/// 6 ASCII digits, nothing else.
pub fn is_valid_symbol(symbol: &str) -> bool {
    symbol.len() == 6 && symbol.bytes().all(|b| b.is_ascii_digit())
}

/// Process configuration, environment-driven.
#[derive(Debug, Clone)]
pub struct Config {
    pub redis_url: String,
    pub influx_url: String,
    pub influx_token: String,
    pub influx_org: String,
    pub influx_bucket: String,
    pub consumer_group: String,
    pub consumer_name: String,
    pub streams: Vec<String>,
    pub jobs_path: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let redis_url = match std::env::var("QUOTEBUS_REDIS_PASSWORD") {
            Ok(password) if !password.is_empty() => {
                let host = env_or("QUOTEBUS_REDIS_ADDR", "127.0.0.1:6379");
                format!("redis://:{}@{}/", password, host)
            }
            _ => env_or("QUOTEBUS_REDIS_URL", "redis://127.0.0.1:6379/"),
        };

        let streams = env_or(
            "QUOTEBUS_STREAMS",
            "stream:stock:realtime,stream:index:realtime",
        )
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

        Ok(Self {
            redis_url,
            influx_url: env_or("QUOTEBUS_INFLUX_URL", "http://127.0.0.1:8086"),
            influx_token: env_or("QUOTEBUS_INFLUX_TOKEN", ""),
            influx_org: env_or("QUOTEBUS_INFLUX_ORG", "quotebus"),
            influx_bucket: env_or("QUOTEBUS_INFLUX_BUCKET", "market_data"),
            consumer_group: env_or("QUOTEBUS_CONSUMER_GROUP", "collectors"),
            consumer_name: env_or("QUOTEBUS_CONSUMER_NAME", "collector-1"),
            streams,
            jobs_path: env_or("QUOTEBUS_JOBS_PATH", "./jobs.toml"),
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}
