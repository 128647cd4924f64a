//! Tencent quote API client and wire-format parser.
//!
//! The endpoint returns `text/javascript; charset=GBK`: one assignment per
//! symbol, `v_<prefix><symbol>="f0~f1~…~fN";`, fields positional and
//! `~`-separated. Records below the minimum field count are skipped, never
//! fatal. Volume-denominated fields arrive in lots and are converted to
//! shares exactly once, here.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Asia::Shanghai;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{
    exchange_prefix, http_client, index_prefix, lenient_f64, lenient_i64, read_vendor_response,
    FetchError, QuoteBatch, QuoteFetcher,
};
use crate::market::Clock;
use crate::models::{is_valid_symbol, DataType, IndexData, StockData};

const TENCENT_API_BASE: &str = "http://qt.gtimg.cn";

/// A record needs the full positional layout through limit-down (field 48).
const MIN_FIELDS: usize = 49;

/// One lot is 100 shares on the mainland exchanges.
const LOT_SIZE: f64 = 100.0;

/// Field-0 classification codes that denote A-shares (Shanghai, Shenzhen,
/// Beijing). Only these are lot-denominated.
const A_SHARE_MARKET_CODES: [i64; 3] = [1, 51, 62];

fn is_a_share(market_code: i64) -> bool {
    A_SHARE_MARKET_CODES.contains(&market_code)
}

pub struct TencentClient {
    client: reqwest::Client,
    base_url: String,
    data_type: DataType,
    clock: Arc<dyn Clock>,
}

impl TencentClient {
    pub fn new(data_type: DataType, clock: Arc<dyn Clock>) -> Result<Self, FetchError> {
        Ok(Self {
            client: http_client()?,
            base_url: TENCENT_API_BASE.to_string(),
            data_type,
            clock,
        })
    }

    fn request_url(&self, symbols: &[String]) -> String {
        let joined = symbols
            .iter()
            .map(|s| {
                let prefix = match self.data_type {
                    DataType::IndexRealtime => index_prefix(s),
                    _ => exchange_prefix(s),
                };
                format!("{}{}", prefix, s)
            })
            .collect::<Vec<_>>()
            .join(",");
        format!("{}/q={}", self.base_url, joined)
    }
}

#[async_trait]
impl QuoteFetcher for TencentClient {
    fn provider(&self) -> &str {
        "tencent"
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

/// Split the GBK body into `v_…="…"` records; bad records are dropped with a
/// debug log and the good subset is returned.
fn vendor_records(raw: &[u8]) -> Result<Vec<(String, Vec<String>)>, FetchError> {
    if raw.is_empty() {
        return Err(FetchError::EmptyResponse);
    }
    // GBK throughout; undecodable name bytes become U+FFFD rather than
    // failing the record.
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
        let lhs = lhs.trim();
        if !lhs.starts_with("v_") {
            debug!(segment, "unexpected vendor variable name, skipping");
            continue;
        }
        let symbol: String = lhs[2..]
            .chars()
            .skip_while(|c| c.is_ascii_alphabetic())
            .collect();
        let payload = rhs[1..].trim().trim_matches('"');
        let fields: Vec<String> = payload.split('~').map(|f| f.to_string()).collect();
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
        if fields.len() < MIN_FIELDS {
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

        let market_code = lenient_i64(&fields[0], "market_code");
        // Lot-denominated only for A-shares; the toggle applies to every
        // volume field at once.
        let unit = if is_a_share(market_code) { LOT_SIZE } else { 1.0 };

        let mut data = StockData::empty(&symbol, parse_vendor_timestamp(&fields[30], now));
        data.market_code = market_code;
        data.name = fields[1].clone();
        data.price = lenient_f64(&fields[3], "price");
        data.prev_close = lenient_f64(&fields[4], "prev_close");
        data.open = lenient_f64(&fields[5], "open");
        data.volume = lenient_f64(&fields[6], "volume") * unit;
        data.outer_disc = lenient_f64(&fields[7], "outer_disc") * unit;
        data.inner_disc = lenient_f64(&fields[8], "inner_disc") * unit;
        for (i, level) in data.bids.iter_mut().enumerate() {
            level.price = lenient_f64(&fields[9 + i * 2], "bid_price");
            level.volume = lenient_f64(&fields[10 + i * 2], "bid_volume") * unit;
        }
        for (i, level) in data.asks.iter_mut().enumerate() {
            level.price = lenient_f64(&fields[19 + i * 2], "ask_price");
            level.volume = lenient_f64(&fields[20 + i * 2], "ask_volume") * unit;
        }
        data.change = lenient_f64(&fields[31], "change");
        data.change_percent = lenient_f64(&fields[32], "change_percent");
        data.high = lenient_f64(&fields[33], "high");
        data.low = lenient_f64(&fields[34], "low");
        // Field 35 is "price/volume/turnover"; turnover is the third part.
        data.turnover = fields[35]
            .split('/')
            .nth(2)
            .map(|t| lenient_f64(t, "turnover"))
            .unwrap_or(0.0);
        data.turnover_rate = lenient_f64(&fields[38], "turnover_rate");
        data.pe = lenient_f64(&fields[39], "pe");
        data.amplitude = lenient_f64(&fields[43], "amplitude");
        // Market caps arrive in hundred-millions.
        data.circulating_market_cap = lenient_f64(&fields[44], "circulating_cap") * 1e8;
        data.total_market_cap = lenient_f64(&fields[45], "total_cap") * 1e8;
        data.pb = lenient_f64(&fields[46], "pb");
        data.limit_up = lenient_f64(&fields[47], "limit_up");
        data.limit_down = lenient_f64(&fields[48], "limit_down");
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
        if fields.len() < 38 {
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
            name: fields[1].clone(),
            value: lenient_f64(&fields[3], "value"),
            change: lenient_f64(&fields[31], "change"),
            change_percent: lenient_f64(&fields[32], "change_percent"),
            volume: lenient_f64(&fields[6], "volume"),
            turnover: lenient_f64(&fields[37], "turnover") * 1e4,
            timestamp: parse_vendor_timestamp(&fields[30], now),
        };
        if let Err(e) = data.validate() {
            debug!(symbol = %data.symbol, error = %e, "invalid vendor index record, skipping");
            continue;
        }
        out.push(data);
    }
    Ok(out)
}

/// Field 30 arrives as `YYYYMMDDhhmmss`, `YYYYMMDDhhmm` or `YYYYMMDD`,
/// exchange-local. Anything else falls back to `now`.
pub fn parse_vendor_timestamp(raw: &str, now: DateTime<Utc>) -> DateTime<Utc> {
    let trimmed = raw.trim();
    let naive: Option<NaiveDateTime> = match trimmed.len() {
        14 => NaiveDateTime::parse_from_str(trimmed, "%Y%m%d%H%M%S").ok(),
        12 => NaiveDateTime::parse_from_str(trimmed, "%Y%m%d%H%M").ok(),
        8 => NaiveDate::parse_from_str(trimmed, "%Y%m%d")
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0)),
        _ => None,
    };
    naive
        .and_then(|n| Shanghai.from_local_datetime(&n).single())
        .map(|local| local.with_timezone(&Utc))
        .unwrap_or(now)
}
