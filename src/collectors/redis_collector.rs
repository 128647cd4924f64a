//! Latest-quote cache projector.
//!
//! One hash per symbol under `latest:<type>:<symbol>` plus a per-type
//! symbol set, both refreshed to a 1h TTL. All writes for one envelope ride
//! a single pipeline; any pipeline error fails the projection so the entry
//! is redelivered.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use tracing::debug;

use super::Projector;
use crate::envelope::{Envelope, Payload};
use crate::models::{DataType, IndexData, StockData};

pub const CACHE_TTL_SECS: i64 = 3600;

pub fn cache_key(data_type: DataType, symbol: &str) -> String {
    format!("latest:{}:{}", data_type.short(), symbol)
}

pub fn symbol_set_key(data_type: DataType) -> String {
    format!("symbols:{}", data_type.short())
}

pub fn stock_hash_fields(
    record: &StockData,
    provider: &str,
    market: &str,
    updated_at: i64,
) -> Vec<(String, String)> {
    vec![
        ("symbol".to_string(), record.symbol.clone()),
        ("name".to_string(), record.name.clone()),
        ("price".to_string(), record.price.to_string()),
        ("change".to_string(), record.change.to_string()),
        (
            "change_percent".to_string(),
            record.change_percent.to_string(),
        ),
        ("volume".to_string(), record.volume.to_string()),
        ("provider".to_string(), provider.to_string()),
        ("market".to_string(), market.to_string()),
        (
            "timestamp".to_string(),
            record.timestamp.timestamp().to_string(),
        ),
        ("updated_at".to_string(), updated_at.to_string()),
    ]
}

pub fn index_hash_fields(
    record: &IndexData,
    provider: &str,
    market: &str,
    updated_at: i64,
) -> Vec<(String, String)> {
    vec![
        ("symbol".to_string(), record.symbol.clone()),
        ("name".to_string(), record.name.clone()),
        ("value".to_string(), record.value.to_string()),
        ("change".to_string(), record.change.to_string()),
        (
            "change_percent".to_string(),
            record.change_percent.to_string(),
        ),
        ("volume".to_string(), record.volume.to_string()),
        ("provider".to_string(), provider.to_string()),
        ("market".to_string(), market.to_string()),
        (
            "timestamp".to_string(),
            record.timestamp.timestamp().to_string(),
        ),
        ("updated_at".to_string(), updated_at.to_string()),
    ]
}

pub struct CacheProjector {
    conn: ConnectionManager,
    ttl_secs: i64,
}

impl CacheProjector {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            ttl_secs: CACHE_TTL_SECS,
        }
    }

    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("invalid redis url")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("connecting to redis")?;
        Ok(Self::new(conn))
    }
}

#[async_trait]
impl Projector for CacheProjector {
    fn name(&self) -> &str {
        "redis-cache"
    }

    async fn project(&self, envelope: &Envelope) -> Result<()> {
        let payload = envelope.typed_payload().context("decoding payload")?;
        let data_type = envelope.metadata.data_type;
        let provider = &envelope.metadata.provider;
        let market = &envelope.metadata.market;
        let now = Utc::now().timestamp();
        let set_key = symbol_set_key(data_type);

        let mut pipe = redis::pipe();
        let mut written = 0usize;
        match &payload {
            Payload::Stocks(records) => {
                for record in records {
                    let key = cache_key(data_type, &record.symbol);
                    pipe.hset_multiple(&key, &stock_hash_fields(record, provider, market, now))
                        .ignore();
                    pipe.expire(&key, self.ttl_secs).ignore();
                    pipe.sadd(&set_key, &record.symbol).ignore();
                    written += 1;
                }
            }
            Payload::Indices(records) => {
                for record in records {
                    let key = cache_key(data_type, &record.symbol);
                    pipe.hset_multiple(&key, &index_hash_fields(record, provider, market, now))
                        .ignore();
                    pipe.expire(&key, self.ttl_secs).ignore();
                    pipe.sadd(&set_key, &record.symbol).ignore();
                    written += 1;
                }
            }
            // No per-symbol latest semantics for historical batches.
            Payload::Historical(_) => {
                debug!("historical payload, cache projection skipped");
                return Ok(());
            }
        }
        if written == 0 {
            return Ok(());
        }
        pipe.expire(&set_key, self.ttl_secs).ignore();

        let mut conn = self.conn.clone();
        let _: () = pipe
            .query_async(&mut conn)
            .await
            .context("cache pipeline failed")?;
        debug!(symbols = written, "cache projection written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_cache_keys() {
        assert_eq!(
            cache_key(DataType::StockRealtime, "600000"),
            "latest:stock:600000"
        );
        assert_eq!(
            cache_key(DataType::IndexRealtime, "000001"),
            "latest:index:000001"
        );
        assert_eq!(symbol_set_key(DataType::StockRealtime), "symbols:stock");
    }

    #[test]
    fn test_stock_hash_fields() {
        let ts = Utc.with_ymd_and_hms(2025, 8, 21, 2, 0, 3).unwrap();
        let mut record = StockData::empty("600000", ts);
        record.name = "浦发银行".to_string();
        record.price = 10.5;
        record.change = 0.05;
        record.change_percent = 0.48;
        record.volume = 16_232_500.0;

        let fields = stock_hash_fields(&record, "tencent", "cn", 1_755_741_700);
        let get = |k: &str| {
            fields
                .iter()
                .find(|(key, _)| key == k)
                .map(|(_, v)| v.clone())
                .unwrap()
        };
        assert_eq!(get("symbol"), "600000");
        assert_eq!(get("price"), "10.5");
        assert_eq!(get("volume"), "16232500");
        assert_eq!(get("provider"), "tencent");
        assert_eq!(get("market"), "cn");
        assert_eq!(get("timestamp"), "1755741603");
        assert_eq!(get("updated_at"), "1755741700");
    }

    #[test]
    fn test_index_hash_fields_use_value() {
        let ts = Utc.with_ymd_and_hms(2025, 8, 21, 2, 0, 3).unwrap();
        let record = IndexData {
            symbol: "000001".to_string(),
            name: "上证指数".to_string(),
            value: 3501.23,
            change: 12.45,
            change_percent: 0.36,
            volume: 289_000_000.0,
            turnover: 3.421e11,
            timestamp: ts,
        };
        let fields = index_hash_fields(&record, "tencent", "cn", 0);
        assert!(fields.iter().any(|(k, v)| k == "value" && v == "3501.23"));
        assert!(!fields.iter().any(|(k, _)| k == "price"));
    }
}
