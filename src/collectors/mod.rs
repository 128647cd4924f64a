//! Stream consumers.
//!
//! A collector is a consumer-group member that reads envelopes off the bus,
//! verifies their checksums, deduplicates by entry id, and projects them
//! into downstream stores. Acks happen only after every projector succeeds;
//! a failed projection leaves the entry pending for redelivery. Poison
//! entries (undecodable, bad checksum, wrong version) are acked immediately
//! so they cannot cause redelivery storms.

pub mod influx_collector;
pub mod redis_collector;

pub use influx_collector::InfluxProjector;
pub use redis_collector::CacheProjector;

use anyhow::Result;
use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::{BusEntry, StreamBus};
use crate::envelope::Envelope;

/// Projects one verified envelope into a downstream store.
#[async_trait]
pub trait Projector: Send + Sync {
    fn name(&self) -> &str;
    async fn project(&self, envelope: &Envelope) -> Result<()>;
    /// Drain any buffered writes; called on shutdown.
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Bounded per-consumer dedup set. Purely an optimization: the bus's
/// pending tracking plus the checksum already guarantee correctness, so a
/// restart losing this set is fine.
pub struct ProcessedSet {
    order: VecDeque<String>,
    seen: HashSet<String>,
    high_water: usize,
}

impl ProcessedSet {
    pub fn new(high_water: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(high_water.min(4096)),
            seen: HashSet::with_capacity(high_water.min(4096)),
            high_water: high_water.max(2),
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    /// Record an id; crossing the high-water mark evicts the older half by
    /// insertion order.
    pub fn insert(&mut self, id: String) {
        if !self.seen.insert(id.clone()) {
            return;
        }
        self.order.push_back(id);
        if self.order.len() > self.high_water {
            let keep_from = self.order.len() / 2;
            for _ in 0..keep_from {
                if let Some(old) = self.order.pop_front() {
                    self.seen.remove(&old);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub group: String,
    pub consumer: String,
    pub streams: Vec<String>,
    pub read_count: usize,
    pub block: Duration,
    /// Entries pending on any consumer for at least this long are claimed
    /// over during the periodic reclaim pass.
    pub reclaim_min_idle: Duration,
    pub reclaim_interval: Duration,
    pub reclaim_batch: usize,
    pub dedup_high_water: usize,
}

impl CollectorConfig {
    pub fn new(group: &str, consumer: &str, streams: Vec<String>) -> Self {
        Self {
            group: group.to_string(),
            consumer: consumer.to_string(),
            streams,
            read_count: 64,
            block: Duration::from_secs(5),
            reclaim_min_idle: Duration::from_secs(60),
            reclaim_interval: Duration::from_secs(30),
            reclaim_batch: 100,
            dedup_high_water: 10_000,
        }
    }
}

pub struct Collector {
    bus: StreamBus,
    cfg: CollectorConfig,
    projectors: Vec<Arc<dyn Projector>>,
    processed: ProcessedSet,
}

impl Collector {
    pub fn new(bus: StreamBus, cfg: CollectorConfig, projectors: Vec<Arc<dyn Projector>>) -> Self {
        let processed = ProcessedSet::new(cfg.dedup_high_water);
        Self {
            bus,
            cfg,
            projectors,
            processed,
        }
    }

    pub async fn run(&mut self, cancel: CancellationToken) -> Result<()> {
        for stream in &self.cfg.streams {
            self.bus.ensure_group(stream, &self.cfg.group).await?;
        }
        info!(
            group = %self.cfg.group,
            consumer = %self.cfg.consumer,
            streams = ?self.cfg.streams,
            "collector started"
        );

        let mut reclaim_tick = tokio::time::interval(self.cfg.reclaim_interval);
        reclaim_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The immediate first tick would reclaim before reading anything.
        reclaim_tick.tick().await;

        loop {
            let read = {
                let bus = self.bus.clone();
                let group = self.cfg.group.clone();
                let consumer = self.cfg.consumer.clone();
                let streams = self.cfg.streams.clone();
                let count = self.cfg.read_count;
                let block = self.cfg.block;
                async move { bus.read_group(&group, &consumer, &streams, count, block).await }
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = reclaim_tick.tick() => self.reclaim().await,
                result = read => match result {
                    Ok(entries) => {
                        // In-flight entries finish before the next
                        // cancellation check.
                        for entry in entries {
                            self.handle_entry(entry).await;
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "stream read failed, backing off");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                },
            }
        }

        for projector in &self.projectors {
            if let Err(e) = projector.flush().await {
                warn!(projector = projector.name(), error = %e, "flush on shutdown failed");
            }
        }
        info!(group = %self.cfg.group, consumer = %self.cfg.consumer, "collector stopped");
        Ok(())
    }

    async fn handle_entry(&mut self, entry: BusEntry) {
        if self.processed.contains(&entry.id) {
            debug!(entry = %entry.id, "duplicate delivery, acking without projection");
            self.ack(&entry).await;
            return;
        }

        let envelope = match Envelope::decode(&entry.data) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(entry = %entry.id, stream = %entry.stream, error = %e,
                    "poison entry (undecodable), acking");
                self.ack(&entry).await;
                return;
            }
        };
        if let Err(e) = envelope.verify() {
            warn!(entry = %entry.id, stream = %entry.stream, error = %e,
                "poison entry (verification failed), acking");
            self.ack(&entry).await;
            return;
        }

        for projector in &self.projectors {
            if let Err(e) = projector.project(&envelope).await {
                error!(
                    projector = projector.name(),
                    entry = %entry.id,
                    error = %e,
                    "projection failed, leaving entry pending for redelivery"
                );
                return;
            }
        }

        self.ack(&entry).await;
        self.processed.insert(entry.id);
    }

    async fn ack(&self, entry: &BusEntry) {
        if let Err(e) = self
            .bus
            .ack(&entry.stream, &self.cfg.group, &entry.id)
            .await
        {
            warn!(entry = %entry.id, error = %e, "ack failed");
        }
    }

    /// Claim-and-reprocess pass for entries stuck pending on dead peers.
    async fn reclaim(&mut self) {
        let streams = self.cfg.streams.clone();
        for stream in streams {
            match self
                .bus
                .claim_stale(
                    &stream,
                    &self.cfg.group,
                    &self.cfg.consumer,
                    self.cfg.reclaim_min_idle,
                    self.cfg.reclaim_batch,
                )
                .await
            {
                Ok(entries) if !entries.is_empty() => {
                    info!(stream = %stream, count = entries.len(), "reclaimed stale pending entries");
                    for entry in entries {
                        self.handle_entry(entry).await;
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(stream = %stream, error = %e, "reclaim pass failed"),
            }
        }
    }
}
