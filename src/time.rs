use chrono::{DateTime, Duration, Utc};
use std::sync::atomic::{AtomicI64, Ordering};

pub type Timestamp = DateTime<Utc>;

/// Source of "now" for lease extension.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> Timestamp;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Utc::now()
    }
}

/// Clock pinned to a base instant that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    base: Timestamp,
    offset_ms: AtomicI64,
}

impl ManualClock {
    pub fn new(base: Timestamp) -> Self {
        Self {
            base,
            offset_ms: AtomicI64::new(0),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.offset_ms.fetch_add(by.num_milliseconds(), Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.base + Duration::milliseconds(self.offset_ms.load(Ordering::SeqCst))
    }
}

/// Render an expiration the way `VALID UNTIL` clauses expect it.
pub fn format_expiration(ts: &Timestamp) -> String {
    ts.format("%Y-%m-%d %H:%M:%S%z").to_string()
}
