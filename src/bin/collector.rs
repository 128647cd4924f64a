//! quotebus collector service.
//!
//! Joins the consumer group on the configured streams and projects every
//! verified envelope into the latest-quote cache and the time-series store.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use quotebus_backend::{
    bus::StreamBus,
    collectors::{CacheProjector, Collector, CollectorConfig, InfluxProjector, Projector},
    models::Config,
    storage::{influx, InfluxConfig, InfluxWriter},
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

    influx::health_check(&config.influx_url)
        .await
        .context("influx health probe at startup")?;

    let bus = StreamBus::connect(&config.redis_url).await?;
    let cache = CacheProjector::connect(&config.redis_url).await?;

    let influx_cfg = InfluxConfig::new(
        &config.influx_url,
        &config.influx_token,
        &config.influx_org,
        &config.influx_bucket,
    );
    let (writer, errors, writer_task) = InfluxWriter::spawn(influx_cfg)?;

    let cancel = CancellationToken::new();
    let error_drain = InfluxProjector::spawn_error_drain(errors, cancel.clone());

    let projectors: Vec<Arc<dyn Projector>> = vec![
        Arc::new(cache),
        Arc::new(InfluxProjector::new(writer)),
    ];
    let collector_cfg = CollectorConfig::new(
        &config.consumer_group,
        &config.consumer_name,
        config.streams.clone(),
    );
    let mut collector = Collector::new(bus, collector_cfg, projectors);

    let run_cancel = cancel.clone();
    let collector_task = tokio::spawn(async move { collector.run(run_cancel).await });

    info!("collector service running");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown signal received, draining");

    cancel.cancel();
    collector_task
        .await
        .context("joining collector task")??;
    let _ = error_drain.await;
    let _ = writer_task.await;
    info!("collector service stopped");
    Ok(())
}
