//! Cron-armed job activation.
//!
//! One timer task per enabled job. A fire while the previous run is still
//! executing is dropped and counted rather than queued; runs are spawned on
//! a tracker so shutdown can drain everything in flight.

use async_trait::async_trait;
use chrono::Utc;
use chrono_tz::Asia::Shanghai;
use cron::Schedule;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::jobs::JobSpec;
use super::stats::FetcherStats;

/// One job activation. Implemented by the fetcher worker.
#[async_trait]
pub trait JobRunner: Send + Sync {
    fn name(&self) -> &str;
    async fn run(&self, cancel: CancellationToken);
}

pub struct JobScheduler {
    cancel: CancellationToken,
    timers: Vec<JoinHandle<()>>,
    runs: TaskTracker,
}

impl JobScheduler {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            timers: Vec::new(),
            runs: TaskTracker::new(),
        }
    }

    /// Arm a cron trigger for one job. Schedules evaluate in exchange-local
    /// time.
    pub fn add_job(
        &mut self,
        spec: &JobSpec,
        runner: Arc<dyn JobRunner>,
        stats: Arc<FetcherStats>,
    ) -> anyhow::Result<()> {
        let schedule = Schedule::from_str(&spec.schedule)?;
        let name = spec.name.clone();
        let cancel = self.cancel.clone();
        let runs = self.runs.clone();
        let running = Arc::new(AtomicBool::new(false));

        info!(job = %name, schedule = %spec.schedule, "arming job");
        self.timers.push(tokio::spawn(async move {
            loop {
                let now = Utc::now().with_timezone(&Shanghai);
                let Some(next) = schedule.after(&now).next() else {
                    warn!(job = %name, "schedule has no future fire times, disarming");
                    break;
                };
                let wait = (next - now).to_std().unwrap_or_default();
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }

                // Re-entrancy guard: a fire during an in-flight run is
                // dropped and counted.
                if running
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
                {
                    stats.record_dropped_fire();
                    debug!(job = %name, "previous run still executing, dropping fire");
                    continue;
                }

                let runner = runner.clone();
                let running = running.clone();
                let run_cancel = cancel.child_token();
                runs.spawn(async move {
                    runner.run(run_cancel).await;
                    running.store(false, Ordering::SeqCst);
                });
            }
        }));
        Ok(())
    }

    /// Cancel timers, then wait for in-flight runs to drain.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for timer in self.timers {
            let _ = timer.await;
        }
        self.runs.close();
        self.runs.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::jobs::parse_jobs;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    struct CountingRunner {
        starts: AtomicU32,
        hold: Duration,
    }

    #[async_trait]
    impl JobRunner for CountingRunner {
        fn name(&self) -> &str {
            "counting"
        }

        async fn run(&self, _cancel: CancellationToken) {
            self.starts.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.hold).await;
        }
    }

    fn every_second_job() -> JobSpec {
        parse_jobs(
            r#"
[[jobs]]
name = "tick"
schedule = "* * * * * *"
[jobs.provider]
name = "tencent"
type = "stock_realtime"
[jobs.params]
symbols = ["600000"]
"#,
        )
        .unwrap()
        .remove(0)
    }

    #[tokio::test]
    async fn test_overlapping_fires_are_dropped() {
        let cancel = CancellationToken::new();
        let mut scheduler = JobScheduler::new(cancel.clone());
        let stats = Arc::new(FetcherStats::new());
        let runner = Arc::new(CountingRunner {
            starts: AtomicU32::new(0),
            // Longer than the cron period, so subsequent fires overlap.
            hold: Duration::from_millis(3500),
        });

        scheduler
            .add_job(&every_second_job(), runner.clone(), stats.clone())
            .unwrap();

        tokio::time::sleep(Duration::from_millis(3200)).await;
        scheduler.shutdown().await;

        assert_eq!(runner.starts.load(Ordering::SeqCst), 1);
        assert!(stats.dropped_fires() >= 1);
    }

    #[tokio::test]
    async fn test_sequential_fires_all_run() {
        let cancel = CancellationToken::new();
        let mut scheduler = JobScheduler::new(cancel.clone());
        let stats = Arc::new(FetcherStats::new());
        let runner = Arc::new(CountingRunner {
            starts: AtomicU32::new(0),
            hold: Duration::from_millis(10),
        });

        scheduler
            .add_job(&every_second_job(), runner.clone(), stats.clone())
            .unwrap();

        tokio::time::sleep(Duration::from_millis(2500)).await;
        scheduler.shutdown().await;

        assert!(runner.starts.load(Ordering::SeqCst) >= 2);
        assert_eq!(stats.dropped_fires(), 0);
    }
}
