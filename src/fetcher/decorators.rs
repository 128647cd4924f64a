//! Composable wrappers around the fetch seam.
//!
//! Two decorators, composed breaker-outside-frequency so the breaker's
//! failure signal reflects upstream sickness rather than self-inflicted
//! bursts: the frequency wrapper spaces outbound calls and retries
//! transients, the breaker short-circuits a sick upstream entirely.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::limiter::{classify, ErrorClass};
use crate::models::DataType;
use crate::providers::{FetchError, QuoteBatch, QuoteFetcher};

pub(crate) async fn cancellable_sleep(
    cancel: &CancellationToken,
    duration: Duration,
) -> Result<(), FetchError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(FetchError::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

// ============================================================================
// FREQUENCY CONTROL
// ============================================================================

#[derive(Debug, Clone)]
pub struct FrequencyConfig {
    /// Minimum spacing between successive outbound calls. 200ms is the
    /// vendor's hard floor; production jobs run well above it.
    pub min_interval: Duration,
    /// Retries on transient errors, linear backoff between attempts.
    pub max_retries: u32,
    pub enabled: bool,
}

impl Default for FrequencyConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(200),
            max_retries: 3,
            enabled: true,
        }
    }
}

pub struct FrequencyControl<F> {
    inner: F,
    cfg: FrequencyConfig,
    /// Next allowed send instant. Locked only for the delta calculation,
    /// never across the sleep.
    next_slot: Mutex<Option<Instant>>,
}

impl<F> FrequencyControl<F> {
    pub fn new(cfg: FrequencyConfig, inner: F) -> Self {
        Self {
            inner,
            cfg,
            next_slot: Mutex::new(None),
        }
    }

    /// Reserve the next send slot and wait until it arrives.
    async fn pace(&self, cancel: &CancellationToken) -> Result<(), FetchError> {
        let wait = {
            let mut slot = self.next_slot.lock();
            let now = Instant::now();
            let at = match *slot {
                Some(s) if s > now => s,
                _ => now,
            };
            *slot = Some(at + self.cfg.min_interval);
            at.saturating_duration_since(now)
        };
        if !wait.is_zero() {
            cancellable_sleep(cancel, wait).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl<F: QuoteFetcher> QuoteFetcher for FrequencyControl<F> {
    fn provider(&self) -> &str {
        self.inner.provider()
    }

    fn data_type(&self) -> DataType {
        self.inner.data_type()
    }

    async fn fetch(
        &self,
        cancel: &CancellationToken,
        symbols: &[String],
    ) -> Result<QuoteBatch, FetchError> {
        if !self.cfg.enabled {
            return self.inner.fetch(cancel, symbols).await;
        }
        let mut attempt: u32 = 0;
        loop {
            self.pace(cancel).await?;
            match self.inner.fetch(cancel, symbols).await {
                Ok(batch) => return Ok(batch),
                Err(e) => {
                    attempt += 1;
                    if classify(&e) != ErrorClass::Transient || attempt > self.cfg.max_retries {
                        return Err(e);
                    }
                    let backoff = self.cfg.min_interval.saturating_mul(attempt);
                    warn!(
                        provider = self.inner.provider(),
                        attempt,
                        max = self.cfg.max_retries,
                        backoff = ?backoff,
                        error = %e,
                        "transient fetch failure, retrying"
                    );
                    cancellable_sleep(cancel, backoff).await?;
                }
            }
        }
    }
}

// ============================================================================
// CIRCUIT BREAKER
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub name: String,
    /// Probes admitted while half-open.
    pub max_requests: u32,
    /// Sliding window over which consecutive failures are counted while
    /// closed.
    pub interval: Duration,
    /// Open-state duration before probing again.
    pub timeout: Duration,
    /// Consecutive failures that trip the breaker.
    pub ready_to_trip: u32,
    pub enabled: bool,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            name: "fetch".to_string(),
            max_requests: 1,
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(30),
            ready_to_trip: 5,
            enabled: true,
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    window_start: Instant,
    opened_at: Instant,
    half_open_inflight: u32,
    half_open_successes: u32,
}

pub struct CircuitBreaker<F> {
    inner: F,
    cfg: BreakerConfig,
    state: Mutex<BreakerInner>,
}

impl<F> CircuitBreaker<F> {
    pub fn new(cfg: BreakerConfig, inner: F) -> Self {
        let now = Instant::now();
        Self {
            inner,
            cfg,
            state: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                window_start: now,
                opened_at: now,
                half_open_inflight: 0,
                half_open_successes: 0,
            }),
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state.lock().state
    }

    fn before_call(&self) -> Result<(), FetchError> {
        let mut s = self.state.lock();
        let now = Instant::now();
        match s.state {
            BreakerState::Closed => {
                if now.duration_since(s.window_start) >= self.cfg.interval {
                    s.window_start = now;
                    s.consecutive_failures = 0;
                }
                Ok(())
            }
            BreakerState::Open => {
                if now.duration_since(s.opened_at) >= self.cfg.timeout {
                    info!(breaker = %self.cfg.name, "breaker timeout elapsed, probing half-open");
                    s.state = BreakerState::HalfOpen;
                    s.half_open_inflight = 1;
                    s.half_open_successes = 0;
                    Ok(())
                } else {
                    Err(FetchError::BreakerOpen(self.cfg.name.clone()))
                }
            }
            BreakerState::HalfOpen => {
                if s.half_open_inflight >= self.cfg.max_requests {
                    Err(FetchError::BreakerOpen(self.cfg.name.clone()))
                } else {
                    s.half_open_inflight += 1;
                    Ok(())
                }
            }
        }
    }

    fn after_call(&self, ok: bool) {
        let mut s = self.state.lock();
        let now = Instant::now();
        match s.state {
            BreakerState::Closed => {
                if ok {
                    s.consecutive_failures = 0;
                } else {
                    s.consecutive_failures += 1;
                    if s.consecutive_failures >= self.cfg.ready_to_trip {
                        warn!(
                            breaker = %self.cfg.name,
                            failures = s.consecutive_failures,
                            "tripping circuit breaker"
                        );
                        s.state = BreakerState::Open;
                        s.opened_at = now;
                    }
                }
            }
            BreakerState::HalfOpen => {
                s.half_open_inflight = s.half_open_inflight.saturating_sub(1);
                if ok {
                    s.half_open_successes += 1;
                    if s.half_open_successes >= self.cfg.max_requests {
                        info!(breaker = %self.cfg.name, "probes succeeded, closing breaker");
                        s.state = BreakerState::Closed;
                        s.consecutive_failures = 0;
                        s.window_start = now;
                    }
                } else {
                    warn!(breaker = %self.cfg.name, "probe failed, reopening breaker");
                    s.state = BreakerState::Open;
                    s.opened_at = now;
                }
            }
            // A straggler finishing after the trip changes nothing.
            BreakerState::Open => {}
        }
    }
}

#[async_trait]
impl<F: QuoteFetcher> QuoteFetcher for CircuitBreaker<F> {
    fn provider(&self) -> &str {
        self.inner.provider()
    }

    fn data_type(&self) -> DataType {
        self.inner.data_type()
    }

    async fn fetch(
        &self,
        cancel: &CancellationToken,
        symbols: &[String],
    ) -> Result<QuoteBatch, FetchError> {
        if !self.cfg.enabled {
            return self.inner.fetch(cancel, symbols).await;
        }
        self.before_call()?;
        let result = self.inner.fetch(cancel, symbols).await;
        match &result {
            // Cancellation says nothing about upstream health.
            Err(FetchError::Cancelled) => {}
            r => self.after_call(r.is_ok()),
        }
        result
    }
}

/// Standard composition: breaker → frequency → base.
pub fn decorate<F: QuoteFetcher + 'static>(
    base: F,
    frequency: FrequencyConfig,
    breaker: BreakerConfig,
) -> CircuitBreaker<FrequencyControl<F>> {
    CircuitBreaker::new(breaker, FrequencyControl::new(frequency, base))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct ScriptedFetcher {
        script: Mutex<VecDeque<Result<(), FetchError>>>,
        calls: Arc<AtomicU32>,
    }

    impl ScriptedFetcher {
        fn new(script: Vec<Result<(), FetchError>>) -> (Self, Arc<AtomicU32>) {
            let calls = Arc::new(AtomicU32::new(0));
            (
                Self {
                    script: Mutex::new(script.into()),
                    calls: calls.clone(),
                },
                calls,
            )
        }
    }

    #[async_trait]
    impl QuoteFetcher for ScriptedFetcher {
        fn provider(&self) -> &str {
            "scripted"
        }

        fn data_type(&self) -> DataType {
            DataType::StockRealtime
        }

        async fn fetch(
            &self,
            _cancel: &CancellationToken,
            _symbols: &[String],
        ) -> Result<QuoteBatch, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.script.lock().pop_front() {
                Some(Ok(())) | None => Ok(QuoteBatch::Stocks(vec![])),
                Some(Err(e)) => Err(e),
            }
        }
    }

    fn reset() -> FetchError {
        FetchError::Http {
            status: 502,
            detail: "connection reset by peer".to_string(),
        }
    }

    fn symbols() -> Vec<String> {
        vec!["600000".to_string()]
    }

    #[tokio::test]
    async fn test_min_interval_enforced_between_calls() {
        let (base, _) = ScriptedFetcher::new(vec![Ok(()), Ok(())]);
        let fc = FrequencyControl::new(
            FrequencyConfig {
                min_interval: Duration::from_millis(80),
                max_retries: 0,
                enabled: true,
            },
            base,
        );
        let cancel = CancellationToken::new();
        let start = Instant::now();
        fc.fetch(&cancel, &symbols()).await.unwrap();
        fc.fetch(&cancel, &symbols()).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(80));
    }

    #[tokio::test]
    async fn test_transient_retry_then_success() {
        let (base, calls) = ScriptedFetcher::new(vec![Err(reset()), Ok(())]);
        let fc = FrequencyControl::new(
            FrequencyConfig {
                min_interval: Duration::from_millis(50),
                max_retries: 3,
                enabled: true,
            },
            base,
        );
        let cancel = CancellationToken::new();
        let start = Instant::now();
        fc.fetch(&cancel, &symbols()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_fatal_errors_are_not_retried() {
        let (base, calls) = ScriptedFetcher::new(vec![Err(FetchError::Http {
            status: 403,
            detail: "blocked".to_string(),
        })]);
        let fc = FrequencyControl::new(FrequencyConfig::default(), base);
        let cancel = CancellationToken::new();
        assert!(fc.fetch(&cancel, &symbols()).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let (base, calls) =
            ScriptedFetcher::new(vec![Err(reset()), Err(reset()), Err(reset())]);
        let fc = FrequencyControl::new(
            FrequencyConfig {
                min_interval: Duration::from_millis(10),
                max_retries: 2,
                enabled: true,
            },
            base,
        );
        let cancel = CancellationToken::new();
        assert!(fc.fetch(&cancel, &symbols()).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_disabled_frequency_is_passthrough() {
        let (base, calls) = ScriptedFetcher::new(vec![Err(reset())]);
        let fc = FrequencyControl::new(
            FrequencyConfig {
                min_interval: Duration::from_secs(60),
                max_retries: 5,
                enabled: false,
            },
            base,
        );
        let cancel = CancellationToken::new();
        assert!(fc.fetch(&cancel, &symbols()).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    fn test_breaker_cfg() -> BreakerConfig {
        BreakerConfig {
            name: "test".to_string(),
            max_requests: 1,
            interval: Duration::from_secs(60),
            timeout: Duration::from_millis(100),
            ready_to_trip: 3,
            enabled: true,
        }
    }

    #[tokio::test]
    async fn test_breaker_trips_and_short_circuits() {
        let (base, calls) =
            ScriptedFetcher::new(vec![Err(reset()), Err(reset()), Err(reset()), Ok(())]);
        let cb = CircuitBreaker::new(test_breaker_cfg(), base);
        let cancel = CancellationToken::new();

        for _ in 0..3 {
            assert!(cb.fetch(&cancel, &symbols()).await.is_err());
        }
        assert_eq!(cb.state(), BreakerState::Open);

        // Fourth call never reaches the upstream.
        match cb.fetch(&cancel, &symbols()).await {
            Err(FetchError::BreakerOpen(name)) => assert_eq!(name, "test"),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_breaker_half_open_probe_closes() {
        let (base, calls) =
            ScriptedFetcher::new(vec![Err(reset()), Err(reset()), Err(reset()), Ok(()), Ok(())]);
        let cb = CircuitBreaker::new(test_breaker_cfg(), base);
        let cancel = CancellationToken::new();

        for _ in 0..3 {
            let _ = cb.fetch(&cancel, &symbols()).await;
        }
        assert_eq!(cb.state(), BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(120)).await;
        cb.fetch(&cancel, &symbols()).await.unwrap();
        assert_eq!(cb.state(), BreakerState::Closed);
        cb.fetch(&cancel, &symbols()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_breaker_half_open_failure_reopens() {
        let (base, _) =
            ScriptedFetcher::new(vec![Err(reset()), Err(reset()), Err(reset()), Err(reset())]);
        let cb = CircuitBreaker::new(test_breaker_cfg(), base);
        let cancel = CancellationToken::new();

        for _ in 0..3 {
            let _ = cb.fetch(&cancel, &symbols()).await;
        }
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(cb.fetch(&cancel, &symbols()).await.is_err());
        assert_eq!(cb.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn test_composed_chain_happy_path() {
        let (base, calls) = ScriptedFetcher::new(vec![Err(reset()), Ok(())]);
        let chain = decorate(
            base,
            FrequencyConfig {
                min_interval: Duration::from_millis(20),
                max_retries: 3,
                enabled: true,
            },
            test_breaker_cfg(),
        );
        let cancel = CancellationToken::new();
        chain.fetch(&cancel, &symbols()).await.unwrap();
        // The inner retry absorbed the transient; the breaker saw a success.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(chain.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_pacing() {
        let (base, calls) = ScriptedFetcher::new(vec![Ok(()), Ok(())]);
        let fc = Arc::new(FrequencyControl::new(
            FrequencyConfig {
                min_interval: Duration::from_secs(30),
                max_retries: 0,
                enabled: true,
            },
            base,
        ));
        let cancel = CancellationToken::new();
        fc.fetch(&cancel, &symbols()).await.unwrap();

        // Second call would wait 30s; cancel instead.
        let fc2 = fc.clone();
        let cancel2 = cancel.clone();
        let handle =
            tokio::spawn(async move { fc2.fetch(&cancel2, &["600000".to_string()]).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        match handle.await.unwrap() {
            Err(FetchError::Cancelled) => {}
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
