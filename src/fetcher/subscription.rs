//! Thin in-process callback layer.
//!
//! Durability, replay and multi-consumer delivery all live on the bus; this
//! exists so an embedding process can observe quotes without running a
//! collector. Events ride a bounded channel with non-blocking sends: when
//! the channel is full the event is dropped and counted, never blocking the
//! fetch path.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::stats::FetcherStats;
use crate::models::StockData;

pub type QuoteCallback = Arc<dyn Fn(&StockData) + Send + Sync>;

pub const EVENT_CHANNEL_CAPACITY: usize = 1000;

pub struct Subscription {
    pub symbol: String,
    pub interval: Duration,
    pub callback: QuoteCallback,
    pub active: bool,
}

#[derive(Clone)]
pub struct QuoteEvent {
    pub symbol: String,
    pub data: StockData,
    pub at: DateTime<Utc>,
}

pub struct SubscriptionManager {
    /// Reader-dominated: dispatch iterates, subscribe/unsubscribe mutate.
    subs: RwLock<HashMap<String, Subscription>>,
    tx: mpsc::Sender<QuoteEvent>,
    stats: Arc<FetcherStats>,
}

impl SubscriptionManager {
    pub fn new(stats: Arc<FetcherStats>) -> (Arc<Self>, mpsc::Receiver<QuoteEvent>) {
        Self::with_capacity(stats, EVENT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(
        stats: Arc<FetcherStats>,
        capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<QuoteEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Arc::new(Self {
                subs: RwLock::new(HashMap::new()),
                tx,
                stats,
            }),
            rx,
        )
    }

    /// Register (or replace) the subscription for a symbol.
    pub fn subscribe(&self, symbol: &str, interval: Duration, callback: QuoteCallback) {
        info!(symbol, interval = ?interval, "subscribing");
        self.subs.write().insert(
            symbol.to_string(),
            Subscription {
                symbol: symbol.to_string(),
                interval,
                callback,
                active: true,
            },
        );
    }

    pub fn unsubscribe(&self, symbol: &str) -> bool {
        let removed = self.subs.write().remove(symbol).is_some();
        if removed {
            info!(symbol, "unsubscribed");
        }
        removed
    }

    /// Scheduler-side mutation: keep the record, stop delivery.
    pub fn deactivate(&self, symbol: &str) {
        if let Some(sub) = self.subs.write().get_mut(symbol) {
            sub.active = false;
        }
    }

    pub fn len(&self) -> usize {
        self.subs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subs.read().is_empty()
    }

    /// Fan records out to the event channel. Non-blocking; full channel
    /// drops the event in favor of liveness.
    pub fn dispatch(&self, records: &[StockData]) {
        let subs = self.subs.read();
        if subs.is_empty() {
            return;
        }
        let now = Utc::now();
        for record in records {
            let Some(sub) = subs.get(&record.symbol) else {
                continue;
            };
            if !sub.active {
                continue;
            }
            let event = QuoteEvent {
                symbol: record.symbol.clone(),
                data: record.clone(),
                at: now,
            };
            if let Err(mpsc::error::TrySendError::Full(_)) = self.tx.try_send(event) {
                self.stats.record_dropped_event();
                debug!(symbol = %record.symbol, "event channel full, dropping");
            }
        }
    }

    /// Deliver queued events to their callbacks until cancelled.
    pub async fn run_dispatcher(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<QuoteEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    let callback = self
                        .subs
                        .read()
                        .get(&event.symbol)
                        .filter(|s| s.active)
                        .map(|s| s.callback.clone());
                    if let Some(callback) = callback {
                        callback(&event.data);
                    }
                }
            }
        }
    }
}
