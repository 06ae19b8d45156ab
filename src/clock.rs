//! Wall-clock abstraction used by the scheduler and the main loop.
//!
//! Production code talks to [`SystemClock`]. Tests inject a [`Clock`] that
//! returns controlled values so that schedule arithmetic (DAILY rollover,
//! suspend windows, worker deadlines) can be exercised without sleeping in
//! real time.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Controls the supervisor's view of time.
#[async_trait::async_trait]
pub trait Clock: Send + Sync {
    /// Current UTC time.
    fn now(&self) -> DateTime<Utc>;

    /// `now()` expressed as epoch seconds, the unit the scheduler works in.
    fn now_epoch(&self) -> i64 {
        self.now().timestamp()
    }

    /// Sleep until `duration` has elapsed.
    async fn sleep(&self, duration: Duration);
}

/// The default clock, backed by the real system clock and `tokio::time`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait::async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await
    }
}
