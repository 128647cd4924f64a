//! Time-series projector.
//!
//! One point per record: measurement named after the data type, identity in
//! tags, quote values in fields, record timestamp as the point time. Writes
//! go through the batched async writer; its error channel is drained by a
//! background task so a slow or sick TSDB never blocks the consume loop.

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::error;

use super::Projector;
use crate::envelope::{Envelope, Payload};
use crate::models::{DataType, IndexData, StockData};
use crate::storage::{DataPoint, FieldValue, InfluxWriter};

pub fn stock_point(record: &StockData, provider: &str, market: &str) -> DataPoint {
    DataPoint {
        measurement: DataType::StockRealtime.as_str().to_string(),
        tags: vec![
            ("symbol".to_string(), record.symbol.clone()),
            ("name".to_string(), record.name.clone()),
            ("provider".to_string(), provider.to_string()),
            ("market".to_string(), market.to_string()),
        ],
        fields: vec![
            ("price".to_string(), FieldValue::Float(record.price)),
            ("change".to_string(), FieldValue::Float(record.change)),
            (
                "change_percent".to_string(),
                FieldValue::Float(record.change_percent),
            ),
            ("volume".to_string(), FieldValue::Float(record.volume)),
        ],
        timestamp: record.timestamp,
    }
}

pub fn index_point(record: &IndexData, provider: &str, market: &str) -> DataPoint {
    DataPoint {
        measurement: DataType::IndexRealtime.as_str().to_string(),
        tags: vec![
            ("symbol".to_string(), record.symbol.clone()),
            ("name".to_string(), record.name.clone()),
            ("provider".to_string(), provider.to_string()),
            ("market".to_string(), market.to_string()),
        ],
        fields: vec![
            ("value".to_string(), FieldValue::Float(record.value)),
            ("change".to_string(), FieldValue::Float(record.change)),
            (
                "change_percent".to_string(),
                FieldValue::Float(record.change_percent),
            ),
        ],
        timestamp: record.timestamp,
    }
}

pub struct InfluxProjector {
    writer: InfluxWriter,
}

impl InfluxProjector {
    pub fn new(writer: InfluxWriter) -> Self {
        Self { writer }
    }

    /// Drain the writer's error channel into the log until cancelled.
    pub fn spawn_error_drain(
        mut errors: mpsc::Receiver<String>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    err = errors.recv() => match err {
                        Some(e) => error!(error = %e, "tsdb write error"),
                        None => break,
                    },
                }
            }
        })
    }
}

#[async_trait]
impl Projector for InfluxProjector {
    fn name(&self) -> &str {
        "influxdb"
    }

    async fn project(&self, envelope: &Envelope) -> Result<()> {
        let provider = &envelope.metadata.provider;
        let market = &envelope.metadata.market;
        match envelope.typed_payload().context("decoding payload")? {
            Payload::Stocks(records) => {
                for record in &records {
                    self.writer
                        .write(stock_point(record, provider, market))
                        .await?;
                }
            }
            Payload::Indices(records) => {
                for record in &records {
                    self.writer
                        .write(index_point(record, provider, market))
                        .await?;
                }
            }
            // Historical rows carry no fixed field layout to project.
            Payload::Historical(_) => {}
        }
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        self.writer.flush().await
    }
}
