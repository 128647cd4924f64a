//! InfluxDB v2 writer.
//!
//! Points ride a bounded channel into a single writer task that batches
//! them by size and by time and POSTs line protocol to the v2 write API.
//! Write failures surface on an error channel the owning collector drains;
//! an explicit flush empties the batch (used on shutdown).

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct InfluxConfig {
    pub url: String,
    pub token: String,
    pub org: String,
    pub bucket: String,
    pub batch_size: usize,
    pub flush_interval: Duration,
}

impl InfluxConfig {
    pub fn new(url: &str, token: &str, org: &str, bucket: &str) -> Self {
        Self {
            url: url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            org: org.to_string(),
            bucket: bucket.to_string(),
            batch_size: 500,
            flush_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Integer(i64),
    Text(String),
    Bool(bool),
}

/// One measurement point, second precision.
#[derive(Debug, Clone, PartialEq)]
pub struct DataPoint {
    pub measurement: String,
    pub tags: Vec<(String, String)>,
    pub fields: Vec<(String, FieldValue)>,
    pub timestamp: DateTime<Utc>,
}

impl DataPoint {
    /// Render as one line of line protocol.
    pub fn line(&self) -> String {
        let mut out = escape_measurement(&self.measurement);
        for (key, value) in &self.tags {
            out.push(',');
            out.push_str(&escape_tag(key));
            out.push('=');
            out.push_str(&escape_tag(value));
        }
        out.push(' ');
        let fields: Vec<String> = self
            .fields
            .iter()
            .map(|(key, value)| format!("{}={}", escape_tag(key), render_field(value)))
            .collect();
        out.push_str(&fields.join(","));
        out.push(' ');
        out.push_str(&self.timestamp.timestamp().to_string());
        out
    }
}

fn escape_measurement(s: &str) -> String {
    s.replace('\\', "\\\\").replace(',', "\\,").replace(' ', "\\ ")
}

fn escape_tag(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}

fn render_field(value: &FieldValue) -> String {
    match value {
        FieldValue::Float(v) => format!("{}", v),
        FieldValue::Integer(v) => format!("{}i", v),
        FieldValue::Text(v) => format!("\"{}\"", v.replace('\\', "\\\\").replace('"', "\\\"")),
        FieldValue::Bool(v) => format!("{}", v),
    }
}

enum WriterMsg {
    Point(Box<DataPoint>),
    Flush(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct InfluxWriter {
    tx: mpsc::Sender<WriterMsg>,
}

impl InfluxWriter {
    /// Spawn the background writer. Returns the handle used to submit
    /// points, the error channel, and the task handle.
    pub fn spawn(
        cfg: InfluxConfig,
    ) -> Result<(Self, mpsc::Receiver<String>, JoinHandle<()>)> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("building influx http client")?;
        let (tx, rx) = mpsc::channel(4096);
        let (err_tx, err_rx) = mpsc::channel(64);
        let task = tokio::spawn(writer_loop(cfg, client, rx, err_tx));
        Ok((Self { tx }, err_rx, task))
    }

    /// Enqueue one point. Applies backpressure when the writer lags.
    pub async fn write(&self, point: DataPoint) -> Result<()> {
        self.tx
            .send(WriterMsg::Point(Box::new(point)))
            .await
            .map_err(|_| anyhow::anyhow!("influx writer is gone"))
    }

    /// Push the current batch out and wait for the write to complete.
    pub async fn flush(&self) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(WriterMsg::Flush(done_tx))
            .await
            .map_err(|_| anyhow::anyhow!("influx writer is gone"))?;
        done_rx.await.context("influx writer dropped flush")
    }
}

async fn writer_loop(
    cfg: InfluxConfig,
    client: reqwest::Client,
    mut rx: mpsc::Receiver<WriterMsg>,
    err_tx: mpsc::Sender<String>,
) {
    let mut batch: Vec<String> = Vec::with_capacity(cfg.batch_size);
    let mut ticker = tokio::time::interval(cfg.flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(WriterMsg::Point(point)) => {
                    batch.push(point.line());
                    if batch.len() >= cfg.batch_size {
                        write_batch(&cfg, &client, &mut batch, &err_tx).await;
                    }
                }
                Some(WriterMsg::Flush(done)) => {
                    write_batch(&cfg, &client, &mut batch, &err_tx).await;
                    let _ = done.send(());
                }
                None => {
                    write_batch(&cfg, &client, &mut batch, &err_tx).await;
                    break;
                }
            },
            _ = ticker.tick() => {
                write_batch(&cfg, &client, &mut batch, &err_tx).await;
            }
        }
    }
}

async fn write_batch(
    cfg: &InfluxConfig,
    client: &reqwest::Client,
    batch: &mut Vec<String>,
    err_tx: &mpsc::Sender<String>,
) {
    if batch.is_empty() {
        return;
    }
    let body = batch.join("\n");
    let lines = batch.len();
    batch.clear();

    let url = format!("{}/api/v2/write", cfg.url);
    let result = client
        .post(&url)
        .query(&[
            ("org", cfg.org.as_str()),
            ("bucket", cfg.bucket.as_str()),
            ("precision", "s"),
        ])
        .header(reqwest::header::AUTHORIZATION, format!("Token {}", cfg.token))
        .header(reqwest::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(body)
        .send()
        .await;

    match result {
        Ok(resp) if resp.status().is_success() => {
            debug!(lines, "influx batch written");
        }
        Ok(resp) => {
            let detail = format!("influx write failed: http {}", resp.status());
            let _ = err_tx.try_send(detail);
        }
        Err(e) => {
            let _ = err_tx.try_send(format!("influx write failed: {}", e));
        }
    }
}

/// Startup probe against the instance's health endpoint.
pub async fn health_check(url: &str) -> Result<()> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .context("building influx http client")?;
    let endpoint = format!("{}/health", url.trim_end_matches('/'));
    let resp = client
        .get(&endpoint)
        .send()
        .await
        .with_context(|| format!("probing {}", endpoint))?;
    if !resp.status().is_success() {
        anyhow::bail!("influx health probe returned http {}", resp.status());
    }
    Ok(())
}
