//! The scheduler: the deterministic backtest day loop and the real-clock
//! simulation state machine.
//!
//! Within a day the observable event order is fixed: `before_trading`, the
//! `(handle_bar, match_orders)` pairs in schedule-point order,
//! `after_trading`, `broker_settle`, then engine settlement. Control
//! requests are absorbed only between events.

use std::time::Duration as StdDuration;

use chrono::{Duration, NaiveDateTime, NaiveTime};
use qtrader_config::{AppConfig, ConfigResult};
use qtrader_core::{Frequency, MarketPhase, RunStatus};
use tracing::{info, warn};

use crate::sandbox::Hook;
use crate::{Engine, EngineError, EngineResult, PauseBehavior, SimDayFlags};

/// Build the per-day `handle_bar` schedule from configuration.
///
/// Daily frequency uses the configured hook time(s); minute and tick
/// frequencies step through every trading session.
pub fn build_schedule(config: &AppConfig) -> ConfigResult<Vec<NaiveTime>> {
    match config.engine.frequency {
        Frequency::Daily => config.handle_bar_points(),
        Frequency::Minute | Frequency::Tick => {
            let step = if config.engine.frequency == Frequency::Minute {
                Duration::seconds(60)
            } else {
                Duration::seconds(config.engine.tick_interval_seconds.max(1) as i64)
            };
            let mut points = Vec::new();
            for (open, close) in config.session_windows()? {
                let mut t = open;
                while t <= close {
                    points.push(t);
                    let next = t + step;
                    if next <= t {
                        break; // wrapped past midnight
                    }
                    t = next;
                }
            }
            points.sort_unstable();
            points.dedup();
            Ok(points)
        }
    }
}

impl Engine {
    pub(crate) fn set_now(&mut self, dt: NaiveDateTime, phase: MarketPhase) {
        self.ctx.current_dt = Some(dt);
        self.ctx.market_phase = phase;
    }

    /// Fold any user-registered schedule points into the base schedule.
    fn merge_custom_schedule(&mut self) {
        if self.ctx.custom_schedule_points.is_empty() {
            return;
        }
        let before = self.schedule_points.len();
        self.schedule_points
            .extend(self.ctx.custom_schedule_points.iter().copied());
        self.schedule_points.sort_unstable();
        self.schedule_points.dedup();
        if self.schedule_points.len() > before {
            info!(
                added = self.schedule_points.len() - before,
                total = self.schedule_points.len(),
                "custom schedule points merged"
            );
        }
    }

    fn run_matching(&mut self) -> EngineResult<()> {
        let dt = self.ctx.now();
        let provider = self.ctx.provider.clone();
        self.matching.match_orders(
            dt,
            &mut self.ctx.orders,
            &mut self.ctx.portfolio,
            &mut self.ctx.positions,
            provider.as_ref(),
        )?;
        Ok(())
    }

    fn run_settle(&mut self) {
        let dt = self.ctx.now();
        let provider = self.ctx.provider.clone();
        self.matching.settle(
            dt,
            &mut self.ctx.orders,
            &mut self.ctx.portfolio,
            &mut self.ctx.positions,
            provider.as_ref(),
        );
        self.benchmark.update_daily(dt, provider.as_ref());
    }

    fn absorb_control(&mut self) {
        if self.control.take_stop() {
            self.ctx.stop_requested = true;
        }
        if self.control.take_pause() {
            self.ctx.pause_requested = true;
        }
        if self.control.take_resume() && self.ctx.is_paused {
            self.ctx.is_paused = false;
        }
    }

    /// Absorb control commands at a safe point. Returns false when the
    /// loop must stop (stop request or a parked pause).
    pub(crate) fn check_requests(&mut self) -> EngineResult<bool> {
        self.absorb_control();
        if self.ctx.stop_requested {
            info!("stop request honored; terminating run");
            self.ctx.is_running = false;
            self.ctx.was_interrupted = true;
            return Ok(false);
        }
        if self.ctx.pause_requested {
            info!(current_dt = ?self.ctx.current_dt, "pause request honored");
            self.save_envelope("pause", RunStatus::Paused)?;
            self.ctx.pause_requested = false;
            self.ctx.is_paused = true;
            self.publish_monitor(RunStatus::Paused);
            match self.pause_behavior {
                PauseBehavior::Park => {
                    self.parked = true;
                    self.ctx.is_running = false;
                    return Ok(false);
                }
                PauseBehavior::Block => loop {
                    self.absorb_control();
                    if self.ctx.stop_requested {
                        info!("stop received while paused; terminating run");
                        self.ctx.is_running = false;
                        self.ctx.was_interrupted = true;
                        return Ok(false);
                    }
                    if !self.ctx.is_paused {
                        info!("run resumed");
                        self.publish_monitor(RunStatus::Running);
                        break;
                    }
                    self.clock.sleep(StdDuration::from_millis(100));
                },
            }
        }
        Ok(true)
    }

    /// Honor a `start_paused` launch right after initialization.
    fn maybe_start_paused(&mut self) -> EngineResult<bool> {
        if self.ctx.start_paused {
            self.ctx.start_paused = false;
            self.ctx.pause_requested = true;
            info!("run launched paused");
            return self.check_requests();
        }
        Ok(true)
    }

    // ---------------------------------------------------------------------
    // Backtest
    // ---------------------------------------------------------------------

    pub(crate) fn run_backtest_loop(&mut self) -> EngineResult<()> {
        let resume_dt = if self.skip_initialize {
            self.ctx.current_dt
        } else {
            None
        };
        if !self.skip_initialize {
            self.call_hook(Hook::Initialize)?;
        }
        self.merge_custom_schedule();
        if !self.maybe_start_paused()? {
            return Ok(());
        }

        let start = resume_dt
            .map(|dt| dt.date())
            .or(self.ctx.start_date)
            .ok_or_else(|| EngineError::Workspace("backtest has no start date".into()))?;
        let end = self
            .ctx
            .end_date
            .ok_or_else(|| EngineError::Workspace("backtest has no end date".into()))?;

        let days = self.calendar.trading_days(start, end);
        if days.is_empty() {
            warn!(%start, %end, "no trading days in range; backtest ends immediately");
            self.call_hook(Hook::OnEnd)?;
            return Ok(());
        }

        let total = days.len();
        info!(total, %start, %end, "backtest starting");

        'days: for (idx, day) in days.into_iter().enumerate() {
            if !self.ctx.is_running {
                break;
            }
            info!(%day, day_index = idx + 1, total, "trading day");

            let is_resume_day = resume_dt.map(|dt| dt.date() == day).unwrap_or(false);
            // Events at or before the snapshot instant count as executed.
            let resume_time = if is_resume_day {
                resume_dt.map(|dt| dt.time())
            } else {
                None
            };
            let points: Vec<NaiveTime> = if is_resume_day {
                let after = resume_time.unwrap_or_default();
                let remaining: Vec<NaiveTime> = self
                    .schedule_points
                    .iter()
                    .copied()
                    .filter(|point| *point > after)
                    .collect();
                info!(
                    remaining = remaining.len(),
                    "resume day: skipping events up to the snapshot instant"
                );
                remaining
            } else {
                self.matching.clear_day_cache();
                self.ctx.strategy_error_today = false;
                self.set_now(day.and_time(self.before_time), MarketPhase::BeforeTrading);
                self.call_hook(Hook::BeforeTrading)?;
                self.publish_monitor(RunStatus::Running);
                if !self.check_requests()? {
                    break 'days;
                }
                self.schedule_points.clone()
            };

            for point in points {
                self.set_now(day.and_time(point), MarketPhase::Trading);
                self.call_hook(Hook::HandleBar)?;
                self.run_matching()?;
                self.publish_monitor(RunStatus::Running);
                if !self.check_requests()? {
                    break 'days;
                }
            }

            if resume_time.map(|t| self.after_time > t).unwrap_or(true) {
                self.set_now(day.and_time(self.after_time), MarketPhase::AfterTrading);
                self.call_hook(Hook::AfterTrading)?;
                if !self.check_requests()? {
                    break 'days;
                }
            }

            if resume_time.map(|t| self.settle_time > t).unwrap_or(true) {
                self.set_now(day.and_time(self.settle_time), MarketPhase::Settlement);
                self.call_hook(Hook::BrokerSettle)?;
                self.run_settle();
                self.publish_monitor(RunStatus::Running);
                if !self.check_requests()? {
                    break 'days;
                }
            }

            self.maybe_auto_save(idx)?;
        }

        if !self.parked {
            self.call_hook(Hook::OnEnd)?;
            info!("backtest finished");
        }
        Ok(())
    }

    fn maybe_auto_save(&mut self, day_index: usize) -> EngineResult<()> {
        let Some(interval) = self.config.workspace.auto_save_interval else {
            return Ok(());
        };
        if interval == 0 || (day_index + 1) % interval as usize != 0 {
            return Ok(());
        }
        let tag = match self.config.workspace.auto_save_mode {
            qtrader_config::AutoSaveMode::Overwrite => "auto".to_string(),
            qtrader_config::AutoSaveMode::Increment => format!("auto_day_{}", day_index + 1),
        };
        // Checkpoints are resumable by definition.
        self.save_envelope(&tag, RunStatus::Paused)
    }

    // ---------------------------------------------------------------------
    // Simulation
    // ---------------------------------------------------------------------

    pub(crate) fn run_simulation_prelude_and_loop(&mut self) -> EngineResult<()> {
        let fresh = !self.skip_initialize;
        if fresh {
            self.set_now(self.clock.now(), MarketPhase::Closed);
            self.call_hook(Hook::Initialize)?;
        }
        self.merge_custom_schedule();
        // Fresh runs have nothing to catch up; resumes expire stale orders
        // and fast-forward missed settlements.
        self.synchronize_to_realtime(!fresh)?;
        if !self.maybe_start_paused()? {
            return Ok(());
        }
        self.run_simulation_loop()
    }

    fn run_simulation_loop(&mut self) -> EngineResult<()> {
        let sessions = self.config.session_windows()?;
        let now = self.clock.now();
        let mut last_known_date = now.date();
        let mut today_trading = self.calendar.is_trading_day(last_known_date);
        let (mut flags, mut last_fired) = self.seed_day_state(now);

        info!(date = %last_known_date, trading_day = today_trading, "simulation loop starting");

        loop {
            if !self.ctx.is_running {
                break;
            }
            let now = self.clock.now();

            if now.date() > last_known_date {
                flags = SimDayFlags::default();
                last_fired = None;
                last_known_date = now.date();
                today_trading = self.calendar.is_trading_day(last_known_date);
                self.ctx.orders.daily_reset();
                self.matching.clear_day_cache();
                self.ctx.strategy_error_today = false;
                info!(date = %last_known_date, trading_day = today_trading, "calendar day rollover");
            }

            if today_trading {
                let t = now.time();
                self.ctx.market_phase = self.phase_of(t, &sessions, flags.settle_done);

                if t >= self.before_time && !flags.before_done {
                    self.set_now(now, MarketPhase::BeforeTrading);
                    self.call_hook(Hook::BeforeTrading)?;
                    flags.before_done = true;
                    if self.consume_resync(&mut flags, &mut last_fired)? {
                        continue;
                    }
                    self.publish_monitor(RunStatus::Running);
                }

                // Fire the greatest unfired schedule point at or before now,
                // provided it is still within tolerance.
                if let Some(point) = self
                    .schedule_points
                    .iter()
                    .copied()
                    .filter(|point| *point <= t)
                    .last()
                {
                    let is_new = last_fired.map(|fired| point > fired).unwrap_or(true);
                    if is_new {
                        let due = now.date().and_time(point);
                        if now - due <= self.bar_tolerance() {
                            self.set_now(now, MarketPhase::Trading);
                            self.call_hook(Hook::HandleBar)?;
                            self.run_matching()?;
                            last_fired = Some(point);
                            if self.consume_resync(&mut flags, &mut last_fired)? {
                                continue;
                            }
                            self.publish_monitor(RunStatus::Running);
                        } else {
                            warn!(%point, now = %t, "schedule point outside tolerance; skipped");
                            last_fired = Some(point);
                        }
                    }
                }

                if t >= self.after_time && !flags.after_done {
                    self.set_now(now, MarketPhase::AfterTrading);
                    self.call_hook(Hook::AfterTrading)?;
                    flags.after_done = true;
                    if self.consume_resync(&mut flags, &mut last_fired)? {
                        continue;
                    }
                    self.publish_monitor(RunStatus::Running);
                }

                if t >= self.settle_time && !flags.settle_done {
                    self.set_now(now, MarketPhase::Settlement);
                    self.call_hook(Hook::BrokerSettle)?;
                    self.run_settle();
                    flags.settle_done = true;
                    if self.consume_resync(&mut flags, &mut last_fired)? {
                        continue;
                    }
                    self.publish_monitor(RunStatus::Running);
                }
            } else {
                self.ctx.market_phase = MarketPhase::Closed;
            }

            if !self.check_requests()? {
                break;
            }
            self.clock.sleep(StdDuration::from_secs(1));
        }

        if !self.parked {
            self.call_hook(Hook::OnEnd)?;
            info!("simulation run ended");
        }
        Ok(())
    }

    /// Seed the day flags on loop entry. A resume landing on the same
    /// calendar day as the snapshot must not re-fire events the parent
    /// already ran.
    fn seed_day_state(&self, now: NaiveDateTime) -> (SimDayFlags, Option<NaiveTime>) {
        let Some(marker) = self.resume_marker else {
            return (SimDayFlags::default(), None);
        };
        if marker.date() != now.date() {
            return (SimDayFlags::default(), None);
        }
        let t = marker.time();
        let flags = SimDayFlags {
            before_done: t >= self.before_time,
            after_done: t >= self.after_time,
            settle_done: t >= self.settle_time,
        };
        let last_fired = self
            .schedule_points
            .iter()
            .copied()
            .filter(|point| *point <= t)
            .last();
        (flags, last_fired)
    }

    fn bar_tolerance(&self) -> Duration {
        match self.config.engine.frequency {
            Frequency::Daily => Duration::hours(24),
            Frequency::Minute => Duration::seconds(60),
            Frequency::Tick => Duration::seconds(self.config.engine.tick_interval_seconds.max(1) as i64),
        }
    }

    fn phase_of(
        &self,
        t: NaiveTime,
        sessions: &[(NaiveTime, NaiveTime)],
        settle_done: bool,
    ) -> MarketPhase {
        if sessions.iter().any(|(open, close)| *open <= t && t <= *close) {
            return MarketPhase::Trading;
        }
        let first_open = sessions.first().map(|(open, _)| *open);
        let last_close = sessions.last().map(|(_, close)| *close);
        if let Some(open) = first_open {
            if self.before_time <= t && t < open {
                return MarketPhase::BeforeTrading;
            }
        }
        if let Some(close) = last_close {
            if close < t && t < self.settle_time {
                return MarketPhase::AfterTrading;
            }
        }
        if t >= self.settle_time && !settle_done {
            return MarketPhase::Settlement;
        }
        MarketPhase::Closed
    }

    /// Apply a pending watchdog resync: realign to the wall clock and
    /// recompute the day state. Returns true when a resync ran.
    fn consume_resync(
        &mut self,
        flags: &mut SimDayFlags,
        last_fired: &mut Option<NaiveTime>,
    ) -> EngineResult<bool> {
        if !self.ctx.resync_requested {
            return Ok(false);
        }
        self.ctx.resync_requested = false;
        self.resyncs += 1;
        info!("watchdog resync: realigning the state machine to real time");
        self.synchronize_to_realtime(true)?;

        let now = self.clock.now();
        let t = now.time();
        flags.before_done = t >= self.before_time;
        flags.after_done = t >= self.after_time;
        flags.settle_done = t >= self.settle_time;
        *last_fired = self
            .schedule_points
            .iter()
            .copied()
            .filter(|point| *point <= t)
            .last();
        Ok(true)
    }

    /// Fast-forward the account to the wall clock: expire stale orders and
    /// run settlement-only days for every missed trading day. No strategy
    /// code fires during the catch-up.
    pub(crate) fn synchronize_to_realtime(&mut self, expire_open: bool) -> EngineResult<()> {
        let now = self.clock.now();
        info!(
            from = ?self.ctx.current_dt,
            to = %now,
            "synchronizing to real time"
        );

        if expire_open {
            self.ctx.orders.expire_open();
            self.ctx.orders.daily_reset();
        }

        let last = self.ctx.current_dt.unwrap_or(now);
        // The last synchronized day still owes a settlement when the
        // snapshot was taken before the settle hook time.
        let catchup_start = if last.time() < self.settle_time {
            last.date()
        } else {
            last.date() + Duration::days(1)
        };
        let catchup_end = now.date() - Duration::days(1);
        if catchup_start <= catchup_end {
            let missed = self.calendar.trading_days(catchup_start, catchup_end);
            if !missed.is_empty() {
                info!(missed = missed.len(), "settling missed trading days");
            }
            for day in missed {
                self.set_now(day.and_time(self.settle_time), MarketPhase::Settlement);
                self.run_settle();
            }
        }

        let sessions = self.config.session_windows()?;
        self.ctx.current_dt = Some(now);
        self.ctx.market_phase = self.phase_of(now.time(), &sessions, false);
        info!(phase = ?self.ctx.market_phase, "synchronized");
        Ok(())
    }
}
