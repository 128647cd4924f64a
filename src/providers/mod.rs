//! Vendor quote providers.
//!
//! Each provider turns a batch of bare 6-digit symbols into canonical
//! records: build the vendor URL, pull over HTTP, transcode from the vendor
//! encoding, and parse the positional wire format. Parsers are tolerant per
//! record (a malformed record is skipped, not fatal) and strict per call
//! (an empty body is an error the limiter can classify).

pub mod sina;
pub mod tencent;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::market::Clock;
use crate::models::{DataType, IndexData, StockData};

pub use sina::SinaClient;
pub use tencent::TencentClient;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("empty response body")]
    EmptyResponse,
    #[error("http {status}: {detail}")]
    Http { status: u16, detail: String },
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("vendor throttle: {0}")]
    Throttled(String),
    #[error("circuit breaker '{0}' is open")]
    BreakerOpen(String),
    #[error("fetch cancelled")]
    Cancelled,
}

/// One fetched batch, shaped by the job's data type.
#[derive(Debug, Clone)]
pub enum QuoteBatch {
    Stocks(Vec<StockData>),
    Indices(Vec<IndexData>),
}

impl QuoteBatch {
    pub fn len(&self) -> usize {
        match self {
            QuoteBatch::Stocks(v) => v.len(),
            QuoteBatch::Indices(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn data_type(&self) -> DataType {
        match self {
            QuoteBatch::Stocks(_) => DataType::StockRealtime,
            QuoteBatch::Indices(_) => DataType::IndexRealtime,
        }
    }

    /// Per-record stability fingerprints for the limiter.
    pub fn fingerprints(&self) -> Vec<String> {
        match self {
            QuoteBatch::Stocks(v) => v.iter().map(|r| r.fingerprint()).collect(),
            QuoteBatch::Indices(v) => v.iter().map(|r| r.fingerprint()).collect(),
        }
    }
}

/// The fetch seam the decorator chain wraps.
#[async_trait]
pub trait QuoteFetcher: Send + Sync {
    fn provider(&self) -> &str;
    fn data_type(&self) -> DataType;
    async fn fetch(
        &self,
        cancel: &CancellationToken,
        symbols: &[String],
    ) -> Result<QuoteBatch, FetchError>;
}

#[async_trait]
impl<T: QuoteFetcher + ?Sized> QuoteFetcher for Arc<T> {
    fn provider(&self) -> &str {
        (**self).provider()
    }

    fn data_type(&self) -> DataType {
        (**self).data_type()
    }

    async fn fetch(
        &self,
        cancel: &CancellationToken,
        symbols: &[String],
    ) -> Result<QuoteBatch, FetchError> {
        (**self).fetch(cancel, symbols).await
    }
}

/// Exchange prefix for stock request URLs, inferred from the symbol's
/// leading digit.
pub fn exchange_prefix(symbol: &str) -> &'static str {
    match symbol.as_bytes().first() {
        Some(b'6') => "sh",
        Some(b'0') | Some(b'3') => "sz",
        Some(b'4') | Some(b'8') => "bj",
        _ => "sh",
    }
}

/// Index symbols collide with the stock namespace (000001 is both an index
/// and a stock); the job's data type picks this table instead.
pub fn index_prefix(symbol: &str) -> &'static str {
    if symbol.starts_with("399") {
        "sz"
    } else {
        "sh"
    }
}

/// Vendor numeric fields are frequently blank or garbled; both become zero
/// so a single bad field never drops the record.
pub fn lenient_f64(raw: &str, field: &str) -> f64 {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return 0.0;
    }
    match trimmed.parse::<f64>() {
        Ok(v) => v,
        Err(_) => {
            debug!(field, raw = trimmed, "unparseable numeric field, using 0");
            0.0
        }
    }
}

pub fn lenient_i64(raw: &str, field: &str) -> i64 {
    lenient_f64(raw, field) as i64
}

/// Shared HTTP client shape: pooled, keep-alive, bounded per host.
pub fn http_client() -> Result<reqwest::Client, FetchError> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .pool_max_idle_per_host(10)
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Duration::from_secs(60))
        .build()?;
    Ok(client)
}

/// Resolve a job's provider reference. Unknown providers fail the job at
/// startup, nothing else.
pub fn build_provider(
    name: &str,
    data_type: DataType,
    clock: Arc<dyn Clock>,
) -> anyhow::Result<Arc<dyn QuoteFetcher>> {
    match name {
        "tencent" => Ok(Arc::new(TencentClient::new(data_type, clock)?)),
        "sina" => Ok(Arc::new(SinaClient::new(data_type, clock)?)),
        other => anyhow::bail!("unknown provider '{}'", other),
    }
}

pub(crate) async fn read_vendor_response(
    response: reqwest::Response,
) -> Result<Vec<u8>, FetchError> {
    let status = response.status();
    if status.as_u16() == 429 {
        return Err(FetchError::Throttled(format!("http 429 from {}", response.url())));
    }
    if !status.is_success() {
        let detail = response.text().await.unwrap_or_default();
        return Err(FetchError::Http {
            status: status.as_u16(),
            detail: detail.chars().take(200).collect(),
        });
    }
    let bytes = response.bytes().await?;
    if bytes.is_empty() {
        return Err(FetchError::EmptyResponse);
    }
    Ok(bytes.to_vec())
}
