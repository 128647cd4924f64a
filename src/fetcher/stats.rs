//! Fetcher-side operational counters.
//!
//! Hot-path friendly: atomics for the scalar counters, a short write-locked
//! map update per completed call for the per-symbol records.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize)]
pub struct SymbolStats {
    pub fetches: u64,
    pub errors: u64,
    pub last_error: Option<String>,
    pub last_success: Option<DateTime<Utc>>,
}

#[derive(Default)]
pub struct FetcherStats {
    symbols: RwLock<HashMap<String, SymbolStats>>,
    calls: AtomicU64,
    total_latency_ms: AtomicU64,
    total_records: AtomicU64,
    published: AtomicU64,
    publish_errors: AtomicU64,
    dropped_events: AtomicU64,
    dropped_fires: AtomicU64,
}

impl FetcherStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Per-call performance record: latency and response size.
    pub fn record_call(&self, latency: Duration, records: usize) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.total_latency_ms
            .fetch_add(latency.as_millis() as u64, Ordering::Relaxed);
        self.total_records.fetch_add(records as u64, Ordering::Relaxed);
    }

    pub fn record_success(&self, symbols: &[String], at: DateTime<Utc>) {
        let mut map = self.symbols.write();
        for symbol in symbols {
            let entry = map.entry(symbol.clone()).or_default();
            entry.fetches += 1;
            entry.last_success = Some(at);
        }
    }

    pub fn record_error(&self, symbols: &[String], error: &str) {
        let mut map = self.symbols.write();
        for symbol in symbols {
            let entry = map.entry(symbol.clone()).or_default();
            entry.fetches += 1;
            entry.errors += 1;
            entry.last_error = Some(error.to_string());
        }
    }

    pub fn record_publish(&self, ok: bool) {
        if ok {
            self.published.fetch_add(1, Ordering::Relaxed);
        } else {
            self.publish_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_dropped_event(&self) {
        self.dropped_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped_fire(&self) {
        self.dropped_fires.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    pub fn dropped_fires(&self) -> u64 {
        self.dropped_fires.load(Ordering::Relaxed)
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn publish_errors(&self) -> u64 {
        self.publish_errors.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> HashMap<String, SymbolStats> {
        self.symbols.read().clone()
    }

    pub fn average_latency_ms(&self) -> f64 {
        let calls = self.calls.load(Ordering::Relaxed);
        if calls == 0 {
            return 0.0;
        }
        self.total_latency_ms.load(Ordering::Relaxed) as f64 / calls as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_symbol_counters() {
        let stats = FetcherStats::new();
        let symbols = vec!["600000".to_string(), "000001".to_string()];
        let now = Utc::now();

        stats.record_success(&symbols, now);
        stats.record_error(&symbols, "http 502");
        stats.record_success(&symbols, now);

        let snapshot = stats.snapshot();
        let s = &snapshot["600000"];
        assert_eq!(s.fetches, 3);
        assert_eq!(s.errors, 1);
        assert_eq!(s.last_error.as_deref(), Some("http 502"));
        assert_eq!(s.last_success, Some(now));
    }

    #[test]
    fn test_call_latency_average() {
        let stats = FetcherStats::new();
        stats.record_call(Duration::from_millis(10), 2);
        stats.record_call(Duration::from_millis(30), 2);
        assert_eq!(stats.average_latency_ms(), 20.0);
    }

    #[test]
    fn test_publish_and_drop_counters() {
        let stats = FetcherStats::new();
        stats.record_publish(true);
        stats.record_publish(false);
        stats.record_dropped_event();
        stats.record_dropped_fire();
        assert_eq!(stats.published(), 1);
        assert_eq!(stats.publish_errors(), 1);
        assert_eq!(stats.dropped_events(), 1);
        assert_eq!(stats.dropped_fires(), 1);
    }
}
