//! Adaptive pacing between an inexhaustible cron ticker and an upstream
//! that must be treated gently.
//!
//! The limiter owns three judgments:
//! - may a tick proceed at all (session gate + cooldown),
//! - what a failed tick means (classification-driven backoff),
//! - whether a succeeding tick is still worth anything (stability: N
//!   identical responses outside exchange hours means the market is closed
//!   and the run should end).
//!
//! State is owned by exactly one fetcher task; there are no locks here.

pub mod classify;

pub use classify::{classify, ErrorClass};

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::market::{Clock, MarketClock};
use crate::providers::FetchError;

#[derive(Debug, Clone)]
pub struct LimiterConfig {
    /// Pacing floor at batch start; stretched on throttle signals.
    pub min_interval: Duration,
    /// Ceiling the stretched interval never exceeds.
    pub max_interval: Duration,
    /// Stretch factor applied per throttle signal.
    pub rate_limit_factor: f64,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Consecutive transient errors within `error_window` that open the
    /// internal circuit.
    pub circuit_threshold: u32,
    pub error_window: Duration,
    /// Identical responses required before declaring the data stable.
    pub stability_window: usize,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(5),
            max_interval: Duration::from_secs(60),
            rate_limit_factor: 1.5,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            circuit_threshold: 5,
            error_window: Duration::from_secs(60),
            stability_window: 5,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LimiterError {
    #[error("outside trading hours, next session at {next}")]
    OutsideTradingHours { next: DateTime<Utc> },
    #[error("cooling down for {remaining:?}")]
    Cooldown { remaining: Duration },
    #[error("responses identical for {rounds} rounds outside exchange hours, stopping")]
    Stable { rounds: usize },
    #[error("fatal upstream error: {0}")]
    Fatal(String),
}

impl LimiterError {
    /// Recoverable errors mean "wait and ask again"; the rest end the run.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            LimiterError::OutsideTradingHours { .. } | LimiterError::Cooldown { .. }
        )
    }
}

/// Verdict for one completed fetch attempt.
#[derive(Debug)]
pub enum RecordOutcome {
    /// Keep the run going.
    Proceed,
    /// Keep the run, but wait first.
    Backoff(Duration),
    /// End the run.
    Terminal(LimiterError),
}

pub struct IntelligentLimiter {
    cfg: LimiterConfig,
    clock: Arc<dyn Clock>,
    market: MarketClock,
    symbols: Vec<String>,
    min_interval: Duration,
    recent_errors: VecDeque<(DateTime<Utc>, ErrorClass)>,
    /// Last N fingerprints per symbol.
    fingerprints: HashMap<String, VecDeque<String>>,
    circuit_open: bool,
    next_allowed: Option<DateTime<Utc>>,
}

impl IntelligentLimiter {
    pub fn new(cfg: LimiterConfig, clock: Arc<dyn Clock>) -> Self {
        let min_interval = cfg.min_interval;
        Self {
            cfg,
            clock,
            market: MarketClock,
            symbols: Vec::new(),
            min_interval,
            recent_errors: VecDeque::new(),
            fingerprints: HashMap::new(),
            circuit_open: false,
            next_allowed: None,
        }
    }

    /// Reset for a fresh job activation: new symbol set, clean stability
    /// window, pacing back at the floor.
    pub fn initialize_batch(&mut self, symbols: &[String]) {
        self.symbols = symbols.to_vec();
        self.min_interval = self.cfg.min_interval;
        self.recent_errors.clear();
        self.fingerprints.clear();
        self.circuit_open = false;
        self.next_allowed = None;
    }

    /// Current pacing floor (grows under throttle pressure).
    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Gate for the next tick: session window plus any active cooldown.
    pub fn should_proceed(&self) -> Result<(), LimiterError> {
        let now = self.clock.now();
        if !self.market.is_trading_time(now) {
            return Err(LimiterError::OutsideTradingHours {
                next: self.market.next_transition(now),
            });
        }
        if let Some(until) = self.next_allowed {
            if until > now {
                let remaining = (until - now).to_std().unwrap_or_default();
                return Err(LimiterError::Cooldown { remaining });
            }
        }
        Ok(())
    }

    /// The decision function: classify the result of one fetch and decide
    /// whether the run continues, waits, or ends.
    pub fn record_result(
        &mut self,
        error: Option<&FetchError>,
        fingerprints: &[String],
    ) -> RecordOutcome {
        let now = self.clock.now();
        self.prune_errors(now);

        let Some(err) = error else {
            return self.record_success(now, fingerprints);
        };

        let class = classify(err);
        self.recent_errors.push_back((now, class));
        match class {
            ErrorClass::Fatal => {
                warn!(error = %err, "fatal upstream error, ending run");
                RecordOutcome::Terminal(LimiterError::Fatal(err.to_string()))
            }
            ErrorClass::RateLimited => {
                let stretched = self.min_interval.mul_f64(self.cfg.rate_limit_factor);
                self.min_interval = stretched.min(self.cfg.max_interval);
                let depth = self.recent_errors.len() as u32;
                let backoff = self.exponential_backoff(depth, self.cfg.max_backoff);
                info!(
                    interval = ?self.min_interval,
                    backoff = ?backoff,
                    "upstream throttling, stretching interval"
                );
                self.next_allowed = Some(now + chrono::Duration::from_std(backoff).unwrap_or_default());
                RecordOutcome::Backoff(backoff)
            }
            ErrorClass::Transient | ErrorClass::Unknown => {
                let consecutive = self.trailing_transients();
                let backoff = if consecutive >= self.cfg.circuit_threshold {
                    if !self.circuit_open {
                        warn!(
                            consecutive,
                            window = ?self.cfg.error_window,
                            "sustained transient failures, opening limiter circuit"
                        );
                    }
                    self.circuit_open = true;
                    self.cfg.max_backoff
                } else {
                    // Shorter ramp than the throttle path.
                    self.exponential_backoff(consecutive, self.cfg.max_backoff / 4)
                };
                debug!(error = %err, class = %class, backoff = ?backoff, "transient failure");
                self.next_allowed = Some(now + chrono::Duration::from_std(backoff).unwrap_or_default());
                RecordOutcome::Backoff(backoff)
            }
        }
    }

    fn record_success(&mut self, now: DateTime<Utc>, fingerprints: &[String]) -> RecordOutcome {
        self.recent_errors.clear();
        if self.circuit_open {
            info!("upstream recovered, closing limiter circuit");
            self.circuit_open = false;
        }

        for fp in fingerprints {
            let symbol = fp.split('|').next().unwrap_or_default().to_string();
            let window = self.fingerprints.entry(symbol).or_default();
            window.push_back(fp.clone());
            while window.len() > self.cfg.stability_window {
                window.pop_front();
            }
        }

        if !self.market.is_active_session(now) && self.all_symbols_stable() {
            info!(
                rounds = self.cfg.stability_window,
                "responses stable outside exchange hours, market presumed closed"
            );
            return RecordOutcome::Terminal(LimiterError::Stable {
                rounds: self.cfg.stability_window,
            });
        }
        // Success still paces: the next tick waits out the (possibly
        // stretched) interval.
        self.next_allowed =
            Some(now + chrono::Duration::from_std(self.min_interval).unwrap_or_default());
        RecordOutcome::Proceed
    }

    /// Every batch symbol has a full window and that window holds a single
    /// repeated fingerprint.
    fn all_symbols_stable(&self) -> bool {
        if self.symbols.is_empty() {
            return false;
        }
        self.symbols.iter().all(|symbol| {
            self.fingerprints
                .get(symbol)
                .map(|w| {
                    w.len() >= self.cfg.stability_window
                        && w.iter().all(|fp| fp == &w[0])
                })
                .unwrap_or(false)
        })
    }

    fn trailing_transients(&self) -> u32 {
        self.recent_errors
            .iter()
            .rev()
            .take_while(|(_, c)| matches!(c, ErrorClass::Transient | ErrorClass::Unknown))
            .count() as u32
    }

    fn prune_errors(&mut self, now: DateTime<Utc>) {
        let window = chrono::Duration::from_std(self.cfg.error_window).unwrap_or_default();
        while let Some((t, _)) = self.recent_errors.front() {
            if now - *t > window {
                self.recent_errors.pop_front();
            } else {
                break;
            }
        }
    }

    /// `base * 2^(depth-1)`, bounded.
    fn exponential_backoff(&self, depth: u32, cap: Duration) -> Duration {
        let exp = depth.saturating_sub(1).min(16);
        let backoff = self.cfg.base_backoff.saturating_mul(1u32 << exp);
        backoff.min(cap)
    }
}
