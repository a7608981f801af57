//! The lifecycle sandbox: every strategy hook runs inside it.
//!
//! Failures are logged and flagged, never propagated, so one broken hook
//! cannot take down the run. In simulation mode a watchdog measures each
//! hook and raises a resync request when user code stalls the tick loop.

use std::time::{Duration, Instant};

use qtrader_core::Mode;
use qtrader_strategy::{Context, Strategy, StrategyError};
use tracing::{debug, error, warn};

/// The hook being dispatched.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Hook {
    Initialize,
    BeforeTrading,
    HandleBar,
    AfterTrading,
    BrokerSettle,
    OnEnd,
}

impl Hook {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Initialize => "initialize",
            Self::BeforeTrading => "before_trading",
            Self::HandleBar => "handle_bar",
            Self::AfterTrading => "after_trading",
            Self::BrokerSettle => "broker_settle",
            Self::OnEnd => "on_end",
        }
    }
}

/// Isolates strategy callbacks from the engine.
pub struct Sandbox {
    mode: Mode,
    block_threshold: Duration,
    strict_init: bool,
}

impl Sandbox {
    pub fn new(mode: Mode, block_threshold: Duration, strict_init: bool) -> Self {
        Self {
            mode,
            block_threshold,
            strict_init,
        }
    }

    /// Invoke one hook. Returns an error only for a failing `initialize`
    /// on a fresh run under `strict_init`; every other failure is absorbed
    /// after logging and setting `strategy_error_today`.
    pub fn call(
        &self,
        strategy: &mut dyn Strategy,
        hook: Hook,
        ctx: &mut Context,
    ) -> Result<(), StrategyError> {
        debug!(hook = hook.label(), "dispatching strategy hook");
        if hook == Hook::Initialize {
            ctx.is_initializing = true;
        }
        let started = Instant::now();
        let result = match hook {
            Hook::Initialize => strategy.initialize(ctx),
            Hook::BeforeTrading => strategy.before_trading(ctx),
            Hook::HandleBar => strategy.handle_bar(ctx),
            Hook::AfterTrading => strategy.after_trading(ctx),
            Hook::BrokerSettle => strategy.broker_settle(ctx),
            Hook::OnEnd => strategy.on_end(ctx),
        };
        let elapsed = started.elapsed();
        if hook == Hook::Initialize {
            ctx.is_initializing = false;
        }

        if let Err(err) = result {
            error!(hook = hook.label(), error = %err, "strategy hook failed");
            ctx.strategy_error_today = true;
            if hook == Hook::Initialize && self.strict_init {
                return Err(err);
            }
            return Ok(());
        }

        if self.mode == Mode::Simulation && elapsed > self.block_threshold {
            warn!(
                hook = hook.label(),
                elapsed_ms = elapsed.as_millis() as u64,
                threshold_ms = self.block_threshold.as_millis() as u64,
                "strategy hook blocked past the watchdog threshold; requesting resync"
            );
            ctx.resync_requested = true;
        }
        Ok(())
    }
}
