//! Sina quote API client and parser.
//!
//! Same contract as the Tencent provider, different wire shape: records are
//! `var hq_str_<prefix><symbol>="f0,f1,…";` with comma-separated fields,
//! GBK-encoded. Sina reports volume in shares already, so no lot conversion
//! happens here.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Asia::Shanghai;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{
    exchange_prefix, index_prefix, lenient_f64, read_vendor_response, FetchError, QuoteBatch,
    QuoteFetcher,
};
use crate::market::Clock;
use crate::models::{is_valid_symbol, DataType, IndexData, StockData};

const SINA_API_BASE: &str = "http://hq.sinajs.cn";

/// Stock records carry date and time at fields 30/31.
const MIN_STOCK_FIELDS: usize = 32;

/// Index records are `name,value,change,change_percent,volume,turnover`.
const MIN_INDEX_FIELDS: usize = 6;

pub struct SinaClient {
    client: reqwest::Client,
    base_url: String,
    data_type: DataType,
    clock: Arc<dyn Clock>,
}

impl SinaClient {
    pub fn new(data_type: DataType, clock: Arc<dyn Clock>) -> Result<Self, FetchError> {
        // Sina rejects referer-less requests.
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::REFERER,
            reqwest::header::HeaderValue::from_static("https://finance.sina.com.cn"),
        );
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .default_headers(headers)
            .build()?;
        Ok(Self {
            client,
            base_url: SINA_API_BASE.to_string(),
            data_type,
            clock,
        })
    }

    fn request_url(&self, symbols: &[String]) -> String {
        let joined = symbols
            .iter()
            .map(|s| match self.data_type {
                DataType::IndexRealtime => format!("s_{}{}", index_prefix(s), s),
                _ => format!("{}{}", exchange_prefix(s), s),
            })
            .collect::<Vec<_>>()
            .join(",");
        format!("{}/list={}", self.base_url, joined)
    }
}

#[async_trait]
impl QuoteFetcher for SinaClient {
    fn provider(&self) -> &str {
        "sina"
    }

    fn data_type(&self) -> DataType {
        self.data_type
    }

    async fn fetch(
        &self,
        cancel: &CancellationToken,
        symbols: &[String],
    ) -> Result<QuoteBatch, FetchError> {
        if symbols.is_empty() {
            return Ok(match self.data_type {
                DataType::IndexRealtime => QuoteBatch::Indices(vec![]),
                _ => QuoteBatch::Stocks(vec![]),
            });
        }
        let url = self.request_url(symbols);
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            r = self.client.get(&url).send() => r?,
        };
        let bytes = read_vendor_response(response).await?;
        let now = self.clock.now();
        match self.data_type {
            DataType::IndexRealtime => Ok(QuoteBatch::Indices(parse_index_response(&bytes, now)?)),
            _ => Ok(QuoteBatch::Stocks(parse_stock_response(&bytes, now)?)),
        }
    }
}

/// The `hq_str_s_sh000001` variable name ends in the bare symbol.
fn trailing_symbol(code: &str) -> String {
    let digits: Vec<char> = code
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.into_iter().rev().collect()
}

fn vendor_records(raw: &[u8]) -> Result<Vec<(String, Vec<String>)>, FetchError> {
    if raw.is_empty() {
        return Err(FetchError::EmptyResponse);
    }
    let (text, _, _) = encoding_rs::GBK.decode(raw);

    let mut records = Vec::new();
    for segment in text.split(';') {
        let segment = segment.trim();
        if segment.is_empty() {
            continue;
        }
        let Some(eq) = segment.find('=') else {
            debug!(segment, "vendor record without assignment, skipping");
            continue;
        };
        let (lhs, rhs) = segment.split_at(eq);
        if !lhs.trim().starts_with("var hq_str_") {
            debug!(segment, "unexpected vendor variable name, skipping");
            continue;
        }
        let symbol = trailing_symbol(lhs.trim());
        let payload = rhs[1..].trim().trim_matches('"');
        let fields: Vec<String> = payload.split(',').map(|f| f.to_string()).collect();
        records.push((symbol, fields));
    }
    Ok(records)
}

pub fn parse_stock_response(
    raw: &[u8],
    now: DateTime<Utc>,
) -> Result<Vec<StockData>, FetchError> {
    let records = vendor_records(raw)?;
    let mut out = Vec::with_capacity(records.len());
    for (symbol, fields) in records {
        if fields.len() < MIN_STOCK_FIELDS {
            debug!(
                symbol,
                fields = fields.len(),
                "short vendor record, skipping"
            );
            continue;
        }
        if !is_valid_symbol(&symbol) {
            debug!(symbol, "malformed symbol in vendor record, skipping");
            continue;
        }

        let timestamp = parse_sina_timestamp(&fields[30], &fields[31], now);
        let mut data = StockData::empty(&symbol, timestamp);
        data.name = fields[0].clone();
        data.open = lenient_f64(&fields[1], "open");
        data.prev_close = lenient_f64(&fields[2], "prev_close");
        data.price = lenient_f64(&fields[3], "price");
        data.high = lenient_f64(&fields[4], "high");
        data.low = lenient_f64(&fields[5], "low");
        data.volume = lenient_f64(&fields[8], "volume");
        data.turnover = lenient_f64(&fields[9], "turnover");
        for (i, level) in data.bids.iter_mut().enumerate() {
            level.volume = lenient_f64(&fields[10 + i * 2], "bid_volume");
            level.price = lenient_f64(&fields[11 + i * 2], "bid_price");
        }
        for (i, level) in data.asks.iter_mut().enumerate() {
            level.volume = lenient_f64(&fields[20 + i * 2], "ask_volume");
            level.price = lenient_f64(&fields[21 + i * 2], "ask_price");
        }
        data.change = data.price - data.prev_close;
        data.change_percent = if data.prev_close > 0.0 {
            data.change / data.prev_close * 100.0
        } else {
            0.0
        };
        data.clamp_timestamp(now);

        if let Err(e) = data.validate() {
            debug!(symbol = %data.symbol, error = %e, "invalid vendor record, skipping");
            continue;
        }
        out.push(data);
    }
    Ok(out)
}

pub fn parse_index_response(
    raw: &[u8],
    now: DateTime<Utc>,
) -> Result<Vec<IndexData>, FetchError> {
    let records = vendor_records(raw)?;
    let mut out = Vec::with_capacity(records.len());
    for (symbol, fields) in records {
        if fields.len() < MIN_INDEX_FIELDS {
            debug!(
                symbol,
                fields = fields.len(),
                "short vendor index record, skipping"
            );
            continue;
        }
        if !is_valid_symbol(&symbol) {
            debug!(symbol, "malformed symbol in vendor index record, skipping");
            continue;
        }
        let data = IndexData {
            symbol,
            name: fields[0].clone(),
            value: lenient_f64(&fields[1], "value"),
            change: lenient_f64(&fields[2], "change"),
            change_percent: lenient_f64(&fields[3], "change_percent"),
            // Lots and ten-thousands by vendor convention.
            volume: lenient_f64(&fields[4], "volume") * 100.0,
            turnover: lenient_f64(&fields[5], "turnover") * 1e4,
            timestamp: now,
        };
        if let Err(e) = data.validate() {
            debug!(symbol = %data.symbol, error = %e, "invalid vendor index record, skipping");
            continue;
        }
        out.push(data);
    }
    Ok(out)
}

fn parse_sina_timestamp(date: &str, time: &str, now: DateTime<Utc>) -> DateTime<Utc> {
    let combined = format!("{} {}", date.trim(), time.trim());
    NaiveDateTime::parse_from_str(&combined, "%Y-%m-%d %H:%M:%S")
        .ok()
        .and_then(|n| Shanghai.from_local_datetime(&n).single())
        .map(|local| local.with_timezone(&Utc))
        .unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_600000() -> String {
        let fields = [
            "浦发银行",
            "10.40",
            "10.45",
            "10.50",
            "10.62",
            "10.35",
            "10.49",
            "10.50",
            "16232500",
            "170313069.000",
            "120000",
            "10.49",
            "80000",
            "10.48",
            "50000",
            "10.47",
            "30000",
            "10.46",
            "10000",
            "10.45",
            "90000",
            "10.50",
            "70000",
            "10.51",
            "60000",
            "10.52",
            "40000",
            "10.53",
            "20000",
            "10.54",
            "2025-08-21",
            "10:00:03",
            "00",
        ];
        format!("var hq_str_sh600000=\"{}\";", fields.join(","))
    }

    fn gbk(text: &str) -> Vec<u8> {
        let (bytes, _, _) = encoding_rs::GBK.encode(text);
        bytes.into_owned()
    }

    #[test]
    fn test_stock_record_parses() {
        let now = Utc::now();
        let records = parse_stock_response(&gbk(&record_600000()), now).unwrap();
        assert_eq!(records.len(), 1);
        let r = &records[0];
        assert_eq!(r.symbol, "600000");
        assert_eq!(r.name, "浦发银行");
        assert_eq!(r.price, 10.50);
        assert_eq!(r.volume, 16_232_500.0); // already shares
        assert_eq!(r.turnover, 170_313_069.0);
        assert_eq!(r.bids[0].price, 10.49);
        assert_eq!(r.bids[0].volume, 120_000.0);
        assert_eq!(r.asks[0].price, 10.50);
        assert!((r.change - 0.05).abs() < 1e-9);
        let local = r.timestamp.with_timezone(&Shanghai);
        assert_eq!(
            local.format("%Y-%m-%d %H:%M:%S").to_string(),
            "2025-08-21 10:00:03"
        );
    }

    #[test]
    fn test_short_record_skipped() {
        let now = Utc::now();
        let body = gbk("var hq_str_sz000001=\"平安银行,11.2\";");
        let records = parse_stock_response(&body, now).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn test_empty_body_is_an_error() {
        assert!(matches!(
            parse_stock_response(b"", Utc::now()),
            Err(FetchError::EmptyResponse)
        ));
    }

    #[test]
    fn test_index_record_parses() {
        let now = Utc::now();
        let body = gbk("var hq_str_s_sh000001=\"上证指数,3501.23,12.45,0.36,2890000,34210000\";");
        let records = parse_index_response(&body, now).unwrap();
        assert_eq!(records.len(), 1);
        let r = &records[0];
        assert_eq!(r.symbol, "000001");
        assert_eq!(r.value, 3501.23);
        assert_eq!(r.volume, 289_000_000.0);
        assert_eq!(r.turnover, 342_100_000_000.0);
    }

    #[test]
    fn test_trailing_symbol_extraction() {
        assert_eq!(trailing_symbol("var hq_str_sh600000"), "600000");
        assert_eq!(trailing_symbol("var hq_str_s_sh000001"), "000001");
    }

    #[test]
    fn test_request_url_shapes() {
        let clock: Arc<dyn Clock> = Arc::new(crate::market::SystemClock);
        let stock = SinaClient::new(DataType::StockRealtime, clock.clone()).unwrap();
        assert_eq!(
            stock.request_url(&["600000".to_string(), "000001".to_string()]),
            "http://hq.sinajs.cn/list=sh600000,sz000001"
        );
        let index = SinaClient::new(DataType::IndexRealtime, clock).unwrap();
        assert_eq!(
            index.request_url(&["000001".to_string()]),
            "http://hq.sinajs.cn/list=s_sh000001"
        );
    }
}
