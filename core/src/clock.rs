//! Wall clock abstraction. The engine never reads the system time directly,
//! so a cycle can be replayed for any date.

use chrono::{Duration, NaiveDate, NaiveDateTime, Utc};
use std::sync::{Arc, RwLock};

pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;

    fn today(&self) -> NaiveDate {
        self.now().date()
    }
}

/// Reads UTC system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Utc::now().naive_utc()
    }
}

/// A settable clock. Clones share the same instant, so a test can keep a
/// handle and advance time while the engine owns another.
#[derive(Debug, Clone)]
pub struct FixedClock {
    now: Arc<RwLock<NaiveDateTime>>,
}

impl FixedClock {
    pub fn at(now: NaiveDateTime) -> Self {
        Self {
            now: Arc::new(RwLock::new(now)),
        }
    }

    /// Noon on the given date.
    pub fn on(date: NaiveDate) -> Self {
        Self::at(date.and_hms_opt(12, 0, 0).unwrap_or_default())
    }

    pub fn set(&self, now: NaiveDateTime) {
        if let Ok(mut guard) = self.now.write() {
            *guard = now;
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut guard) = self.now.write() {
            *guard += by;
        }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> NaiveDateTime {
        self.now.read().map(|g| *g).unwrap_or_default()
    }
}
