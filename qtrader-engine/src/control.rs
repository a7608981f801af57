//! The control surface: pause/resume/stop commands and the read-only
//! monitor snapshot.
//!
//! Commands are absorbed by the scheduler thread at safe points only, never
//! mid-hook. The monitor side hands out immutable copies of the last
//! published state, so readers never touch live components.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::NaiveDateTime;
use qtrader_core::{MarketPhase, Price, RunStatus};
use rust_decimal::Decimal;
use serde::Serialize;

/// Cloneable handle used by CLIs and monitoring threads to steer a run.
#[derive(Clone, Default)]
pub struct ControlHandle {
    inner: Arc<ControlInner>,
}

#[derive(Default)]
struct ControlInner {
    pause: AtomicBool,
    resume: AtomicBool,
    stop: AtomicBool,
    monitor: Mutex<MonitorSnapshot>,
}

impl ControlHandle {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a pause; applied after the currently executing hook returns.
    pub fn request_pause(&self) {
        self.inner.pause.store(true, Ordering::SeqCst);
    }

    /// Request a resume from the paused state.
    pub fn request_resume(&self) {
        self.inner.resume.store(true, Ordering::SeqCst);
    }

    /// Request a stop; the run terminates at the next safe point.
    pub fn request_stop(&self) {
        self.inner.stop.store(true, Ordering::SeqCst);
    }

    pub(crate) fn take_pause(&self) -> bool {
        self.inner.pause.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn take_resume(&self) -> bool {
        self.inner.resume.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn take_stop(&self) -> bool {
        self.inner.stop.swap(false, Ordering::SeqCst)
    }

    /// Copy-out of the last published monitor state.
    #[must_use]
    pub fn monitor(&self) -> MonitorSnapshot {
        self.inner.monitor.lock().expect("monitor poisoned").clone()
    }

    pub(crate) fn publish(&self, snapshot: MonitorSnapshot) {
        *self.inner.monitor.lock().expect("monitor poisoned") = snapshot;
    }
}

/// Immutable view of the run published at every safe point.
#[derive(Clone, Debug, Serialize)]
pub struct MonitorSnapshot {
    pub status: RunStatus,
    pub market_phase: MarketPhase,
    pub current_dt: Option<NaiveDateTime>,
    pub net_worth: Price,
    pub cash: Price,
    pub available_cash: Price,
    pub margin: Price,
    pub open_orders: usize,
    pub positions: usize,
    pub strategy_error_today: bool,
}

impl Default for MonitorSnapshot {
    fn default() -> Self {
        Self {
            status: RunStatus::Running,
            market_phase: MarketPhase::Closed,
            current_dt: None,
            net_worth: Decimal::ZERO,
            cash: Decimal::ZERO,
            available_cash: Decimal::ZERO,
            margin: Decimal::ZERO,
            open_orders: 0,
            positions: 0,
            strategy_error_today: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_are_consumed_once() {
        let handle = ControlHandle::new();
        handle.request_stop();
        assert!(handle.take_stop());
        assert!(!handle.take_stop());
    }

    #[test]
    fn monitor_returns_the_latest_copy() {
        let handle = ControlHandle::new();
        let mut snapshot = MonitorSnapshot::default();
        snapshot.open_orders = 3;
        handle.publish(snapshot);
        assert_eq!(handle.monitor().open_orders, 3);
    }
}
