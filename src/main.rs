//! quotebus fetcher service.
//!
//! Loads the job set, arms cron triggers, and runs one fetch worker per
//! enabled job until a shutdown signal drains everything.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use quotebus_backend::{
    bus::StreamBus,
    fetcher::{
        decorate, load_jobs, BreakerConfig, FetcherStats, FetcherWorker, FrequencyConfig,
        JobScheduler, SubscriptionManager,
    },
    limiter::LimiterConfig,
    market::SystemClock,
    models::Config,
    providers::{build_provider, QuoteFetcher},
};

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if std::env::var("QUOTEBUS_LOG_FORMAT").as_deref() == Ok("json") {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = Config::from_env()?;
    let jobs = load_jobs(&config.jobs_path)
        .with_context(|| format!("loading jobs from {}", config.jobs_path))?;
    if jobs.is_empty() {
        warn!("no enabled jobs in the job set");
    }
    info!(jobs = jobs.len(), "job set loaded");

    let bus = Arc::new(StreamBus::connect(&config.redis_url).await?);
    let clock = Arc::new(SystemClock);
    let stats = Arc::new(FetcherStats::new());
    let (subscriptions, events_rx) = SubscriptionManager::new(stats.clone());

    let cancel = CancellationToken::new();
    let dispatcher = tokio::spawn(
        subscriptions
            .clone()
            .run_dispatcher(events_rx, cancel.clone()),
    );

    let producer = format!("quotebus-{}", std::process::id());
    let mut scheduler = JobScheduler::new(cancel.clone());
    for job in jobs {
        let provider =
            match build_provider(&job.provider.name, job.provider.data_type, clock.clone()) {
                Ok(p) => p,
                Err(e) => {
                    error!(job = %job.name, error = %e, "provider setup failed, job disabled");
                    continue;
                }
            };

        let mut frequency = FrequencyConfig::default();
        if let Some(ms) = job.params.min_interval_ms {
            frequency.min_interval = frequency.min_interval.max(Duration::from_millis(ms));
        }
        if let Some(retries) = job.params.max_retries {
            frequency.max_retries = retries;
        }
        let breaker = BreakerConfig {
            name: job.name.clone(),
            ..BreakerConfig::default()
        };
        let limiter_cfg = LimiterConfig {
            min_interval: frequency.min_interval,
            ..LimiterConfig::default()
        };

        let fetcher: Arc<dyn QuoteFetcher> =
            Arc::new(decorate(provider, frequency, breaker));
        let worker = Arc::new(FetcherWorker::new(
            job.clone(),
            &producer,
            fetcher,
            limiter_cfg,
            bus.clone(),
            clock.clone(),
            stats.clone(),
            subscriptions.clone(),
        ));
        if let Err(e) = scheduler.add_job(&job, worker, stats.clone()) {
            error!(job = %job.name, error = %e, "arming job failed, job disabled");
        }
    }

    info!("fetcher service running");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown signal received, draining");

    cancel.cancel();
    scheduler.shutdown().await;
    let _ = dispatcher.await;
    info!("fetcher service stopped");
    Ok(())
}
