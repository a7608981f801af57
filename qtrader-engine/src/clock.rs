//! Time source abstraction for the simulation state machine.
//!
//! Backtests never consult a clock; simulation reads "now" through this
//! trait so integration tests can replay weekends and watchdog stalls
//! without sleeping.

use std::sync::Mutex;
use std::time::Duration;

use chrono::NaiveDateTime;

/// Source of wall-clock time for the simulation loop.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;

    /// Park the tick loop between iterations.
    fn sleep(&self, duration: Duration);
}

/// The real local clock.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        chrono::Local::now().naive_local()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// A scriptable clock. `sleep` advances time instead of blocking, so a
/// simulation loop driven by it runs as fast as the machine allows.
pub struct ManualClock {
    now: Mutex<NaiveDateTime>,
}

impl ManualClock {
    pub fn starting_at(start: NaiveDateTime) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, dt: NaiveDateTime) {
        *self.now.lock().expect("clock poisoned") = dt;
    }

    pub fn advance(&self, duration: chrono::Duration) {
        let mut now = self.now.lock().expect("clock poisoned");
        *now += duration;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> NaiveDateTime {
        *self.now.lock().expect("clock poisoned")
    }

    fn sleep(&self, duration: Duration) {
        self.advance(chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::seconds(1)));
    }
}
