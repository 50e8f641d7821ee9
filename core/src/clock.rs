// Wall clock abstraction for online/retention checks
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::sync::Arc;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to. Used to test online windows and sweeps.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new(start),
        })
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

pub type SharedClock = Arc<dyn Clock>;

pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}

// chrono panics past i64::MAX milliseconds
const MAX_SPAN_SECS: i64 = i64::MAX / 1_000;

/// `Duration::seconds` that saturates instead of panicking
pub fn span_seconds(secs: i64) -> Duration {
    Duration::seconds(secs.clamp(-MAX_SPAN_SECS, MAX_SPAN_SECS))
}

pub fn span_hours(hours: i64) -> Duration {
    span_seconds(hours.saturating_mul(3_600))
}

/// Unsigned config values
pub fn span_secs_u64(secs: u64) -> Duration {
    span_seconds(i64::try_from(secs).unwrap_or(i64::MAX))
}

/// `now - span`, never earlier than the earliest representable instant.
/// Negative spans count as zero.
pub fn cutoff(now: DateTime<Utc>, span: Duration) -> DateTime<Utc> {
    now.checked_sub_signed(span.max(Duration::zero()))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
