//! Scheduled fetch pipeline.
//!
//! One worker per job. A run is a loop: session gate, limiter gate, the
//! decorated vendor fetch, the limiter's verdict, and on success one
//! envelope appended to the job's output stream. Runs end on fatal upstream
//! errors, on stability (market presumed closed), or on cancellation; the
//! next cron fire starts a fresh one.

pub mod decorators;
pub mod jobs;
pub mod scheduler;
pub mod stats;
pub mod subscription;

pub use decorators::{decorate, BreakerConfig, CircuitBreaker, FrequencyConfig, FrequencyControl};
pub use jobs::{load_jobs, JobSpec};
pub use scheduler::{JobRunner, JobScheduler};
pub use stats::FetcherStats;
pub use subscription::SubscriptionManager;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::StreamSink;
use crate::envelope::{Envelope, Payload};
use crate::limiter::{IntelligentLimiter, LimiterConfig, LimiterError, RecordOutcome};
use crate::market::{Clock, MarketClock};
use crate::providers::{QuoteBatch, QuoteFetcher};

use decorators::cancellable_sleep;

pub struct FetcherWorker {
    job: JobSpec,
    producer: String,
    fetcher: Arc<dyn QuoteFetcher>,
    /// Single-owner per run; the scheduler's re-entrancy guard means this
    /// lock is never contended.
    limiter: Mutex<IntelligentLimiter>,
    bus: Arc<dyn StreamSink>,
    market: MarketClock,
    clock: Arc<dyn Clock>,
    stats: Arc<FetcherStats>,
    subscriptions: Arc<SubscriptionManager>,
}

impl FetcherWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        job: JobSpec,
        producer: &str,
        fetcher: Arc<dyn QuoteFetcher>,
        limiter_cfg: LimiterConfig,
        bus: Arc<dyn StreamSink>,
        clock: Arc<dyn Clock>,
        stats: Arc<FetcherStats>,
        subscriptions: Arc<SubscriptionManager>,
    ) -> Self {
        Self {
            job,
            producer: producer.to_string(),
            fetcher,
            limiter: Mutex::new(IntelligentLimiter::new(limiter_cfg, clock.clone())),
            bus,
            market: MarketClock,
            clock,
            stats,
            subscriptions,
        }
    }

    pub fn job(&self) -> &JobSpec {
        &self.job
    }

    async fn run_loop(&self, cancel: &CancellationToken) {
        let symbols = &self.job.params.symbols;
        if symbols.is_empty() {
            debug!(job = %self.job.name, "no symbols configured, nothing to do");
            return;
        }

        let mut limiter = self.limiter.lock().await;
        limiter.initialize_batch(symbols);

        while !cancel.is_cancelled() {
            match limiter.should_proceed() {
                Ok(()) => {}
                Err(LimiterError::OutsideTradingHours { next }) => {
                    let now = self.clock.now();
                    let wait = (next - now).to_std().unwrap_or_default();
                    info!(
                        job = %self.job.name,
                        until = %next,
                        "outside trading hours, sleeping until next transition"
                    );
                    if cancellable_sleep(cancel, wait).await.is_err() {
                        break;
                    }
                    limiter.initialize_batch(symbols);
                    continue;
                }
                Err(LimiterError::Cooldown { remaining }) => {
                    if cancellable_sleep(cancel, remaining).await.is_err() {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    warn!(job = %self.job.name, error = %e, "limiter refused, ending run");
                    break;
                }
            }

            let started = Instant::now();
            let result = self.fetcher.fetch(cancel, symbols).await;
            let latency = started.elapsed();

            // Per-call performance record: fire-and-forget bookkeeping.
            match &result {
                Ok(batch) => {
                    self.stats.record_call(latency, batch.len());
                    self.stats.record_success(symbols, self.clock.now());
                    debug!(
                        job = %self.job.name,
                        records = batch.len(),
                        latency_ms = latency.as_millis() as u64,
                        "fetch completed"
                    );
                }
                Err(e) => {
                    self.stats.record_call(latency, 0);
                    self.stats.record_error(symbols, &e.to_string());
                }
            }

            let outcome = match &result {
                Ok(batch) => limiter.record_result(None, &batch.fingerprints()),
                Err(e) => limiter.record_result(Some(e), &[]),
            };
            match outcome {
                RecordOutcome::Proceed => {}
                RecordOutcome::Backoff(wait) => {
                    if cancellable_sleep(cancel, wait).await.is_err() {
                        break;
                    }
                    continue;
                }
                RecordOutcome::Terminal(LimiterError::Stable { rounds }) => {
                    info!(
                        job = %self.job.name,
                        rounds,
                        "responses stable, ending run until next fire"
                    );
                    break;
                }
                RecordOutcome::Terminal(e) => {
                    warn!(job = %self.job.name, error = %e, "run aborted");
                    break;
                }
            }

            if let Ok(batch) = result {
                if batch.is_empty() {
                    debug!(job = %self.job.name, "empty batch, nothing to publish");
                    continue;
                }
                self.publish(&batch).await;
                if let QuoteBatch::Stocks(records) = &batch {
                    self.subscriptions.dispatch(records);
                }
            }
        }
    }

    /// Wrap one batch in an envelope and append it to the output stream.
    /// Publish failures are logged and counted; the run keeps going.
    async fn publish(&self, batch: &QuoteBatch) {
        let payload = match batch.clone() {
            QuoteBatch::Stocks(records) => Payload::Stocks(records),
            QuoteBatch::Indices(records) => Payload::Indices(records),
        };
        let data_type = batch.data_type();

        let mut envelope =
            match Envelope::new(&self.producer, self.fetcher.provider(), data_type, payload) {
                Ok(e) => e,
                Err(e) => {
                    error!(job = %self.job.name, error = %e, "building envelope failed");
                    self.stats.record_publish(false);
                    return;
                }
            };
        let session = self.market.session_tag(self.clock.now());
        if let Err(e) = envelope.set_market_info("cn", session) {
            error!(job = %self.job.name, error = %e, "stamping market info failed");
            self.stats.record_publish(false);
            return;
        }

        let bytes = match envelope.encode() {
            Ok(b) => b,
            Err(e) => {
                error!(job = %self.job.name, error = %e, "encoding envelope failed");
                self.stats.record_publish(false);
                return;
            }
        };

        let stream = self.job.output_stream();
        match self.bus.append(&stream, &bytes).await {
            Ok(id) => {
                self.stats.record_publish(true);
                debug!(
                    job = %self.job.name,
                    stream = %stream,
                    entry = %id,
                    batch = envelope.metadata.batch_size,
                    "envelope published"
                );
            }
            Err(e) => {
                self.stats.record_publish(false);
                error!(job = %self.job.name, stream = %stream, error = %e, "publish failed");
            }
        }
    }
}

#[async_trait]
impl JobRunner for FetcherWorker {
    fn name(&self) -> &str {
        &self.job.name
    }

    async fn run(&self, cancel: CancellationToken) {
        self.run_loop(&cancel).await;
    }
}
