//! Durable stream bus adapter (Redis Streams).
//!
//! At-least-once delivery: entries stay in the group's pending set until
//! acked, and entries pending longer than a threshold can be claimed over
//! to a live consumer. Each entry carries a single `data` field holding the
//! JSON-encoded envelope.

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::streams::{StreamClaimReply, StreamId, StreamPendingCountReply, StreamReadOptions,
    StreamReadReply};
use redis::AsyncCommands;
use std::time::Duration;
use tracing::debug;

/// Conventional stream name for a data type: replace `_` with `:`, prefix
/// `stream:`. Unknown types park on `stream:unknown`.
pub fn stream_for(data_type: &str) -> String {
    match data_type {
        "stock_realtime" | "index_realtime" | "historical" => {
            format!("stream:{}", data_type.replace('_', ":"))
        }
        _ => "stream:unknown".to_string(),
    }
}

/// One entry read from a stream.
#[derive(Debug, Clone)]
pub struct BusEntry {
    pub stream: String,
    pub id: String,
    pub data: Vec<u8>,
}

/// Producer-side seam; lets tests and embedders swap the wire out.
#[async_trait]
pub trait StreamSink: Send + Sync {
    async fn append(&self, stream: &str, data: &[u8]) -> Result<String>;
}

#[derive(Clone)]
pub struct StreamBus {
    conn: ConnectionManager,
}

impl StreamBus {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("invalid redis url")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("connecting to redis")?;
        Ok(Self { conn })
    }

    /// Idempotent group creation; an existing group is not an error.
    pub async fn ensure_group(&self, stream: &str, group: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<()> =
            conn.xgroup_create_mkstream(stream, group, "$").await;
        match result {
            Ok(()) => {
                debug!(stream, group, "created consumer group");
                Ok(())
            }
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => {
                Err(e).with_context(|| format!("creating group {} on {}", group, stream))
            }
        }
    }

    /// Blocking group read across several streams. An empty return means
    /// the block timed out with no data.
    pub async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        streams: &[String],
        count: usize,
        block: Duration,
    ) -> Result<Vec<BusEntry>> {
        let mut conn = self.conn.clone();
        let opts = StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(block.as_millis() as usize);
        let ids: Vec<&str> = streams.iter().map(|_| ">").collect();
        let reply: StreamReadReply = conn
            .xread_options(streams, &ids, &opts)
            .await
            .context("reading from consumer group")?;

        let mut entries = Vec::new();
        for key in reply.keys {
            for id in key.ids {
                if let Some(entry) = bus_entry(&key.key, id) {
                    entries.push(entry);
                }
            }
        }
        Ok(entries)
    }

    pub async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .xack(stream, group, &[id])
            .await
            .with_context(|| format!("acking {} on {}", id, stream))?;
        Ok(())
    }

    /// Claim entries pending on any consumer for longer than `min_idle`,
    /// transferring them to `consumer`. Used by the periodic reclaim pass.
    pub async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<BusEntry>> {
        let mut conn = self.conn.clone();
        let pending: StreamPendingCountReply = conn
            .xpending_count(stream, group, "-", "+", count)
            .await
            .context("listing pending entries")?;
        let ids: Vec<String> = pending
            .ids
            .iter()
            .filter(|p| p.last_delivered_ms as u128 >= min_idle.as_millis())
            .map(|p| p.id.clone())
            .collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let reply: StreamClaimReply = conn
            .xclaim(stream, group, consumer, min_idle.as_millis() as usize, &ids)
            .await
            .context("claiming pending entries")?;
        Ok(reply
            .ids
            .into_iter()
            .filter_map(|id| bus_entry(stream, id))
            .collect())
    }

    /// Range scan for bootstrapping new consumers.
    pub async fn range(
        &self,
        stream: &str,
        start: &str,
        end: &str,
        count: usize,
    ) -> Result<Vec<BusEntry>> {
        let mut conn = self.conn.clone();
        let reply: redis::streams::StreamRangeReply = conn
            .xrange_count(stream, start, end, count)
            .await
            .with_context(|| format!("range scan on {}", stream))?;
        Ok(reply
            .ids
            .into_iter()
            .filter_map(|id| bus_entry(stream, id))
            .collect())
    }
}

#[async_trait]
impl StreamSink for StreamBus {
    async fn append(&self, stream: &str, data: &[u8]) -> Result<String> {
        let mut conn = self.conn.clone();
        let id: String = conn
            .xadd(stream, "*", &[("data", data)])
            .await
            .with_context(|| format!("appending to {}", stream))?;
        Ok(id)
    }
}

fn bus_entry(stream: &str, id: StreamId) -> Option<BusEntry> {
    let data: Vec<u8> = id.get("data")?;
    Some(BusEntry {
        stream: stream.to_string(),
        id: id.id,
        data,
    })
}

/// In-process sink capturing appends; for tests and embedding.
#[derive(Default)]
pub struct MemorySink {
    entries: Mutex<Vec<(String, Vec<u8>)>>,
    counter: Mutex<u64>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<(String, Vec<u8>)> {
        self.entries.lock().clone()
    }
}

#[async_trait]
impl StreamSink for MemorySink {
    async fn append(&self, stream: &str, data: &[u8]) -> Result<String> {
        let mut counter = self.counter.lock();
        *counter += 1;
        let id = format!("{}-0", counter);
        self.entries
            .lock()
            .push((stream.to_string(), data.to_vec()));
        Ok(id)
    }
}
