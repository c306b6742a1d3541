//! Clock abstraction so that throttling, pruning intervals and record timestamps can be
//! controlled in tests.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::RwLock;

pub trait TimeProvider: std::fmt::Debug + Send + Sync + 'static {
    /// Returns the current time. No guarantees are made about monotonicity
    fn now(&self) -> DateTime<Utc>;
}

/// A [`TimeProvider`] that uses [`Utc::now`] as a clock source
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProvider {}

impl SystemProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TimeProvider for SystemProvider {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A [`TimeProvider`] that returns a fixed time that can be set by [`MockProvider::set`]
#[derive(Debug)]
pub struct MockProvider {
    now: RwLock<DateTime<Utc>>,
}

impl MockProvider {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: RwLock::new(start),
        }
    }

    pub fn set(&self, time: DateTime<Utc>) {
        *self.now.write() = time
    }

    pub fn inc(&self, delta: TimeDelta) -> DateTime<Utc> {
        let mut now = self.now.write();
        *now += delta;
        *now
    }
}

impl TimeProvider for MockProvider {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read()
    }
}

/// Time elapsed from `earlier` to `now`, zero if the clock went backwards.
pub fn elapsed(now: DateTime<Utc>, earlier: DateTime<Utc>) -> Duration {
    (now - earlier).to_std().unwrap_or(Duration::ZERO)
}
