use crate::backup::orchestrator::cancel::CancelToken;
use chrono::{DateTime, Utc};
use std::fmt::Debug;
use std::time::Duration;

/// Source of time for the orchestrator and scheduler.
///
/// Sleeping goes through the clock so backoff and schedule waits can be
/// observed and skipped in tests.
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> DateTime<Utc>;

    /// Sleeps for `duration` unless cancelled first. Returns true if cancelled.
    fn sleep(&self, duration: Duration, cancel: &CancelToken) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration, cancel: &CancelToken) -> bool {
        cancel.wait_timeout(duration)
    }
}
