//! The QTrader run engine: component assembly, run lifecycle (new /
//! resume / fork), and finalization.

pub mod benchmark;
pub mod clock;
pub mod control;
pub mod sandbox;
pub mod scheduler;
pub mod snapshot;
pub mod workspace;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, NaiveTime};
use qtrader_config::AppConfig;
use qtrader_core::{Mode, RunStatus};
use qtrader_data::{DataProvider, TradingCalendar};
use qtrader_strategy::{load_strategy, Context, Strategy, StrategyError};
use qtrader_trading::matching::MatchingError;
use qtrader_trading::MatchingEngine;
use thiserror::Error;
use tracing::{error, info};
use uuid::Uuid;

pub use benchmark::BenchmarkTracker;
pub use clock::{Clock, ManualClock, SystemClock};
pub use control::{ControlHandle, MonitorSnapshot};
pub use sandbox::{Hook, Sandbox};
pub use snapshot::{Envelope, SnapshotError};
pub use workspace::{StrategySnapshot, Workspace};

/// Result alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Failures that abort a run. Strategy hook failures never appear here;
/// the sandbox absorbs them.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(#[from] qtrader_config::ConfigError),
    #[error("strategy error: {0}")]
    Strategy(#[from] StrategyError),
    #[error("matching failure: {0}")]
    Matching(#[from] MatchingError),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error("workspace error: {0}")]
    Workspace(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("csv export error: {0}")]
    Csv(#[from] csv::Error),
}

/// How a run ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RunOutcome {
    Finished,
    Interrupted,
    Paused,
}

impl RunOutcome {
    /// Process exit code contract: 0 clean, 1 interrupted.
    #[must_use]
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Finished | Self::Paused => 0,
            Self::Interrupted => 1,
        }
    }
}

/// What the engine does when a pause request lands.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum PauseBehavior {
    /// Save the pause envelope and return `RunOutcome::Paused`.
    #[default]
    Park,
    /// Save the envelope and spin until a resume or stop command arrives.
    Block,
}

/// Per-day one-shot flags of the simulation state machine.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct SimDayFlags {
    pub before_done: bool,
    pub after_done: bool,
    pub settle_done: bool,
}

/// The assembled run: every core component plus the scheduling state.
pub struct Engine {
    pub(crate) config: AppConfig,
    pub(crate) ctx: Context,
    pub(crate) strategy: Box<dyn Strategy>,
    pub(crate) sandbox: Sandbox,
    pub(crate) matching: MatchingEngine,
    pub(crate) calendar: TradingCalendar,
    pub(crate) benchmark: BenchmarkTracker,
    pub(crate) workspace: Workspace,
    pub(crate) control: ControlHandle,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) schedule_points: Vec<NaiveTime>,
    pub(crate) before_time: NaiveTime,
    pub(crate) after_time: NaiveTime,
    pub(crate) settle_time: NaiveTime,
    pub(crate) skip_initialize: bool,
    pub(crate) pause_behavior: PauseBehavior,
    pub(crate) parked: bool,
    pub(crate) resyncs: u64,
    /// `current_dt` of the envelope a resumed simulation came from; used to
    /// seed the day flags when resuming on the same calendar day.
    pub(crate) resume_marker: Option<chrono::NaiveDateTime>,
}

impl Engine {
    /// Assemble a fresh run from configuration. The strategy is resolved
    /// from the registry by `engine.strategy_name`.
    pub fn new_run(
        config: AppConfig,
        params: toml::Value,
        provider: Arc<dyn DataProvider>,
        clock: Arc<dyn Clock>,
    ) -> EngineResult<Self> {
        config.validate()?;
        let strategy = load_strategy(&config.engine.strategy_name, params.clone())?;

        let mut ctx = Context::new(config.clone(), provider.clone());
        if config.engine.mode == Mode::Simulation {
            // Simulation always starts "today"; the configured date range
            // is a backtest concern.
            ctx.start_date = Some(clock.now().date());
            ctx.end_date = None;
        }

        let run_tag = Uuid::new_v4().simple().to_string();
        let workspace = Workspace::create(
            &config.workspace.root_dir,
            config.engine.mode,
            &config.engine.strategy_name,
            &run_tag,
        )?;
        workspace.write_strategy_snapshot(&StrategySnapshot {
            strategy_name: config.engine.strategy_name.clone(),
            params,
        })?;

        let benchmark = BenchmarkTracker::new(config.benchmark.symbol.clone());
        Self::assemble(config, ctx, strategy, workspace, benchmark, provider, clock, false, None)
    }

    /// Rehydrate a paused run from its envelope and continue it.
    pub fn resume(
        envelope_path: &Path,
        config: AppConfig,
        provider: Arc<dyn DataProvider>,
        clock: Arc<dyn Clock>,
    ) -> EngineResult<Self> {
        let envelope = snapshot::load(envelope_path)?;
        snapshot::ensure_resumable(&envelope)?;

        let dir = envelope_path
            .parent()
            .ok_or_else(|| EngineError::Workspace("envelope has no parent directory".into()))?
            .to_path_buf();
        let workspace = Workspace::attach(dir, &envelope.context.strategy_name);
        let identity = workspace.read_strategy_snapshot()?;
        let strategy = load_strategy(&identity.strategy_name, identity.params)?;

        let mut config = config;
        config.engine.mode = envelope.context.mode;
        config.engine.frequency = envelope.context.frequency;
        config.engine.strategy_name = envelope.context.strategy_name.clone();

        let mut ctx = Context::new(config.clone(), provider.clone());
        ctx.mode = envelope.context.mode;
        let resume_marker = envelope.context.current_dt;
        let benchmark = snapshot::restore_into(&mut ctx, envelope);
        info!(
            strategy = %ctx.strategy_name,
            current_dt = ?ctx.current_dt,
            "resuming from pause envelope"
        );

        Self::assemble(
            config,
            ctx,
            strategy,
            workspace,
            benchmark,
            provider,
            clock,
            true,
            resume_marker,
        )
    }

    /// Fork a paused run onto a new timeline at `fork_date` (defaulting to
    /// the envelope's current date) with a new strategy.
    #[allow(clippy::too_many_arguments)]
    pub fn fork(
        envelope_path: &Path,
        fork_date: Option<NaiveDate>,
        config: AppConfig,
        params: toml::Value,
        provider: Arc<dyn DataProvider>,
        clock: Arc<dyn Clock>,
        reinitialize: bool,
    ) -> EngineResult<Self> {
        let envelope = snapshot::load(envelope_path)?;
        snapshot::ensure_resumable(&envelope)?;

        let fork_date = fork_date
            .or_else(|| envelope.context.current_dt.map(|dt| dt.date()))
            .ok_or_else(|| EngineError::Workspace("envelope carries no fork date".into()))?;
        let strategy = load_strategy(&config.engine.strategy_name, params.clone())?;

        let mut config = config;
        config.engine.start_date = Some(fork_date);
        if config.engine.end_date.is_none() {
            config.engine.end_date = envelope.context.end_date;
        }
        config.validate()?;

        let mut ctx = Context::new(config.clone(), provider.clone());
        ctx.start_date = Some(fork_date);
        let state = snapshot::fork_state(
            &envelope,
            fork_date,
            config.account.short_margin_rate,
            config.account.trading_rule,
        );
        let benchmark = snapshot::apply_fork(&mut ctx, state, !reinitialize);
        if !reinitialize {
            ctx.custom_schedule_points = envelope.context.custom_schedule_points.clone();
        }
        info!(%fork_date, reinitialize, "forking onto a new timeline");

        let run_tag = Uuid::new_v4().simple().to_string();
        let workspace = Workspace::create(
            &config.workspace.root_dir,
            config.engine.mode,
            &config.engine.strategy_name,
            &run_tag,
        )?;
        workspace.write_strategy_snapshot(&StrategySnapshot {
            strategy_name: config.engine.strategy_name.clone(),
            params,
        })?;

        Self::assemble(
            config,
            ctx,
            strategy,
            workspace,
            benchmark,
            provider,
            clock,
            !reinitialize,
            None,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        config: AppConfig,
        ctx: Context,
        strategy: Box<dyn Strategy>,
        workspace: Workspace,
        benchmark: BenchmarkTracker,
        provider: Arc<dyn DataProvider>,
        clock: Arc<dyn Clock>,
        skip_initialize: bool,
        resume_marker: Option<chrono::NaiveDateTime>,
    ) -> EngineResult<Self> {
        let (before_time, after_time, settle_time) = config.hook_times()?;
        let schedule_points = scheduler::build_schedule(&config)?;

        let now = clock.now();
        let calendar_start = ctx
            .start_date
            .unwrap_or_else(|| now.date() - chrono::Duration::days(366));
        let calendar_end = ctx.end_date.unwrap_or_else(|| now.date());
        let calendar = TradingCalendar::load(provider.as_ref(), calendar_start, calendar_end);

        let sandbox = Sandbox::new(
            ctx.mode,
            Duration::from_secs(config.engine.block_threshold_seconds),
            config.engine.strict_init,
        );
        let matching = MatchingEngine::new(&config);

        Ok(Self {
            config,
            ctx,
            strategy,
            sandbox,
            matching,
            calendar,
            benchmark,
            workspace,
            control: ControlHandle::new(),
            clock,
            schedule_points,
            before_time,
            after_time,
            settle_time,
            skip_initialize,
            pause_behavior: PauseBehavior::default(),
            parked: false,
            resyncs: 0,
            resume_marker,
        })
    }

    /// Choose what a pause request does (park by default).
    #[must_use]
    pub fn with_pause_behavior(mut self, behavior: PauseBehavior) -> Self {
        self.pause_behavior = behavior;
        self
    }

    /// Launch the run into the paused state.
    #[must_use]
    pub fn start_paused(mut self) -> Self {
        self.ctx.start_paused = true;
        self
    }

    /// Handle for pause/resume/stop commands and monitor copy-outs.
    #[must_use]
    pub fn control(&self) -> ControlHandle {
        self.control.clone()
    }

    /// The run's artifact directory.
    #[must_use]
    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    /// Read access to the shared context (tests, reporting).
    #[must_use]
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Benchmark history recorded so far.
    #[must_use]
    pub fn benchmark(&self) -> &BenchmarkTracker {
        &self.benchmark
    }

    /// How many time resynchronizations the watchdog has forced.
    #[must_use]
    pub fn resync_count(&self) -> u64 {
        self.resyncs
    }

    /// Run to completion (or pause/stop) and finalize artifacts.
    ///
    /// A framework failure (never a strategy failure) is logged, forces an
    /// INTERRUPTED envelope to disk, and is returned as the error.
    pub fn execute(&mut self) -> EngineResult<RunOutcome> {
        self.ctx.is_running = true;
        let result = match self.ctx.mode {
            Mode::Backtest => self.run_backtest_loop(),
            Mode::Simulation => self.run_simulation_prelude_and_loop(),
        };

        if let Err(err) = result {
            error!(error = %err, "engine failure; forcing interrupted snapshot");
            self.ctx.was_interrupted = true;
            self.call_hook_quiet(Hook::OnEnd);
            self.save_envelope("interrupt", RunStatus::Interrupted).ok();
            self.export_artifacts().ok();
            return Err(err);
        }

        let outcome = if self.parked {
            RunOutcome::Paused
        } else if self.ctx.was_interrupted {
            RunOutcome::Interrupted
        } else {
            RunOutcome::Finished
        };
        self.finalize(outcome)?;
        Ok(outcome)
    }

    fn finalize(&mut self, outcome: RunOutcome) -> EngineResult<()> {
        self.ctx.is_running = false;
        match outcome {
            RunOutcome::Finished => self.save_envelope("final", RunStatus::Finished)?,
            RunOutcome::Interrupted => self.save_envelope("interrupt", RunStatus::Interrupted)?,
            // The pause envelope was written when the pause landed.
            RunOutcome::Paused => {}
        }
        self.export_artifacts()?;
        self.publish_monitor(match outcome {
            RunOutcome::Finished => RunStatus::Finished,
            RunOutcome::Interrupted => RunStatus::Interrupted,
            RunOutcome::Paused => RunStatus::Paused,
        });
        info!(?outcome, "engine run finalized");
        Ok(())
    }

    pub(crate) fn save_envelope(&self, tag: &str, status: RunStatus) -> EngineResult<()> {
        let envelope = snapshot::capture(
            &self.ctx,
            &self.benchmark,
            status,
            self.settle_time,
            self.clock.now(),
        );
        snapshot::save(&self.workspace.envelope_path(tag), &envelope)?;
        Ok(())
    }

    fn export_artifacts(&self) -> EngineResult<()> {
        self.workspace.export_csv(
            &self.ctx.portfolio.history,
            self.ctx.positions.daily_snapshots(),
            &self.ctx.orders.all_known(),
        )
    }

    pub(crate) fn call_hook(&mut self, hook: Hook) -> EngineResult<()> {
        self.sandbox
            .call(self.strategy.as_mut(), hook, &mut self.ctx)
            .map_err(EngineError::Strategy)
    }

    fn call_hook_quiet(&mut self, hook: Hook) {
        let _ = self
            .sandbox
            .call(self.strategy.as_mut(), hook, &mut self.ctx);
    }

    pub(crate) fn publish_monitor(&self, status: RunStatus) {
        self.control.publish(MonitorSnapshot {
            status,
            market_phase: self.ctx.market_phase,
            current_dt: self.ctx.current_dt,
            net_worth: self.ctx.portfolio.net_worth,
            cash: self.ctx.portfolio.cash,
            available_cash: self.ctx.portfolio.available_cash(),
            margin: self.ctx.portfolio.margin,
            open_orders: self.ctx.orders.open_orders().len(),
            positions: self.ctx.positions.all().len(),
            strategy_error_today: self.ctx.strategy_error_today,
        });
    }
}
