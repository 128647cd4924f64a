//! Trading-session clock for the mainland exchanges.
//!
//! Session windows are fixed in exchange-local time (Asia/Shanghai) and
//! padded a few minutes around the official auction times so the first and
//! last ticks of a session are never missed. Hosts are assumed to be NTP
//! disciplined to within ~2s; drift moves the polling window edges by the
//! same amount and nothing else.

use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Asia::Shanghai;
use parking_lot::Mutex;

/// Injectable time source so session logic is testable without waiting for
/// the Shanghai open.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Settable clock for tests.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(now) }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Clock that runs at real speed from a fixed anchor instant. Lets tests
/// pin the session while timeouts still expire naturally.
pub struct OffsetClock {
    anchor: DateTime<Utc>,
    started: std::time::Instant,
}

impl OffsetClock {
    pub fn anchored_at(anchor: DateTime<Utc>) -> Self {
        Self {
            anchor,
            started: std::time::Instant::now(),
        }
    }
}

impl Clock for OffsetClock {
    fn now(&self) -> DateTime<Utc> {
        self.anchor
            + Duration::from_std(self.started.elapsed()).unwrap_or_else(|_| Duration::zero())
    }
}

/// Predicate over wall-clock instants: in-session or not.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarketClock;

impl MarketClock {
    /// Intraday windows, inclusive at both ends, exchange-local.
    fn sessions() -> [(&'static str, NaiveTime, NaiveTime); 2] {
        [
            (
                "morning",
                NaiveTime::from_hms_opt(9, 13, 30).unwrap(),
                NaiveTime::from_hms_opt(11, 30, 10).unwrap(),
            ),
            (
                "afternoon",
                NaiveTime::from_hms_opt(12, 57, 30).unwrap(),
                NaiveTime::from_hms_opt(15, 0, 10).unwrap(),
            ),
        ]
    }

    /// Exchange hours proper, opening auction through close. The operating
    /// windows above are padded a couple of minutes around these; gating
    /// uses the padded windows, staleness reasoning uses this.
    fn active_sessions() -> [(NaiveTime, NaiveTime); 2] {
        [
            (
                NaiveTime::from_hms_opt(9, 15, 0).unwrap(),
                NaiveTime::from_hms_opt(11, 30, 0).unwrap(),
            ),
            (
                NaiveTime::from_hms_opt(13, 0, 0).unwrap(),
                NaiveTime::from_hms_opt(15, 0, 0).unwrap(),
            ),
        ]
    }

    pub fn is_trading_time(&self, t: DateTime<Utc>) -> bool {
        self.session_tag(t).is_some()
    }

    /// Whether the exchange itself is producing ticks at `t`.
    pub fn is_active_session(&self, t: DateTime<Utc>) -> bool {
        let local = t.with_timezone(&Shanghai);
        if is_weekend(local.weekday()) {
            return false;
        }
        let tod = local.time();
        Self::active_sessions()
            .into_iter()
            .any(|(start, end)| start <= tod && tod <= end)
    }

    /// Which window `t` falls into, if any.
    pub fn session_tag(&self, t: DateTime<Utc>) -> Option<&'static str> {
        let local = t.with_timezone(&Shanghai);
        if is_weekend(local.weekday()) {
            return None;
        }
        let tod = local.time();
        Self::sessions()
            .into_iter()
            .find(|(_, start, end)| *start <= tod && tod <= *end)
            .map(|(tag, _, _)| tag)
    }

    /// First instant strictly after `t` at which the predicate flips.
    /// For an in-session `t` that is the second after the window closes;
    /// otherwise the next weekday window open.
    pub fn next_transition(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        let local = t.with_timezone(&Shanghai);
        for day_offset in 0..8 {
            let date = (local + Duration::days(day_offset)).date_naive();
            if is_weekend(date.weekday()) {
                continue;
            }
            for (_, start, end) in Self::sessions() {
                for boundary in [start, end + Duration::seconds(1)] {
                    let naive = date.and_time(boundary);
                    if let Some(instant) = Shanghai.from_local_datetime(&naive).single() {
                        let instant = instant.with_timezone(&Utc);
                        if instant > t {
                            return instant;
                        }
                    }
                }
            }
        }
        // Eight calendar days always contain a weekday boundary.
        t + Duration::days(7)
    }
}

fn is_weekend(day: Weekday) -> bool {
    matches!(day, Weekday::Sat | Weekday::Sun)
}
