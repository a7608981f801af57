//! Shared fixtures for the engine integration tests: a scripted strategy
//! driven entirely by its TOML parameters (so it survives resume through
//! the registry) and configuration/provider builders.

use std::path::Path;
use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime};
use qtrader_config::{AppConfig, OneOrMany};
use qtrader_core::{OrderType, TickQuote};
use qtrader_data::FixtureProvider;
use qtrader_strategy::{
    register_strategy_factory, Context, Strategy, StrategyFactory, StrategyResult,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;

pub const SYMBOL: &str = "600519.SH";

/// One dated submission the scripted strategy performs on its first bar of
/// the day. Positive amounts buy, negative sell; a limit price makes it a
/// limit order.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ScriptedOrder {
    pub date: NaiveDate,
    pub amount: i64,
    #[serde(default)]
    pub limit: Option<Decimal>,
}

/// Full behavior script; every field round-trips through TOML so the same
/// strategy rebuilds identically on resume.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct ScriptedConfig {
    #[serde(default)]
    pub orders: Vec<ScriptedOrder>,
    /// Request a pause on the first bar of this date.
    #[serde(default)]
    pub pause_on_date: Option<NaiveDate>,
    /// Request a stop on the first bar of this date.
    #[serde(default)]
    pub stop_on_date: Option<NaiveDate>,
    /// Request a stop after this many bars in total.
    #[serde(default)]
    pub stop_after_bars: Option<usize>,
    /// Sleep this long inside the first bar only (watchdog tests).
    #[serde(default)]
    pub sleep_ms_on_first_bar: Option<u64>,
    /// Return an error from the first bar of this date (sandbox tests).
    #[serde(default)]
    pub fail_on_date: Option<NaiveDate>,
}

pub struct Scripted {
    cfg: ScriptedConfig,
    bars_seen: usize,
    last_order_date: Option<NaiveDate>,
}

impl Scripted {
    fn record(ctx: &mut Context, hook: &str) {
        let stamp = format!("{hook}:{}", ctx.now());
        let mut events = ctx
            .get("events")
            .and_then(|value| value.as_array().cloned())
            .unwrap_or_default();
        events.push(json!(stamp));
        ctx.set("events", json!(events));
    }
}

impl Strategy for Scripted {
    fn name(&self) -> &str {
        "scripted"
    }

    fn initialize(&mut self, ctx: &mut Context) -> StrategyResult<()> {
        Self::record(ctx, "initialize");
        Ok(())
    }

    fn before_trading(&mut self, ctx: &mut Context) -> StrategyResult<()> {
        Self::record(ctx, "before_trading");
        Ok(())
    }

    fn handle_bar(&mut self, ctx: &mut Context) -> StrategyResult<()> {
        Self::record(ctx, "handle_bar");
        let today = ctx.now().date();

        if self.last_order_date != Some(today) {
            self.last_order_date = Some(today);
            let todays: Vec<ScriptedOrder> = self
                .cfg
                .orders
                .iter()
                .filter(|order| order.date == today)
                .cloned()
                .collect();
            for order in todays {
                let order_type = if order.limit.is_some() {
                    OrderType::Limit
                } else {
                    OrderType::Market
                };
                ctx.submit_order(SYMBOL, order.amount, order_type, order.limit);
            }
        }

        if self.bars_seen == 0 {
            if let Some(ms) = self.cfg.sleep_ms_on_first_bar {
                std::thread::sleep(std::time::Duration::from_millis(ms));
            }
        }
        self.bars_seen += 1;

        if self.cfg.pause_on_date == Some(today) {
            ctx.pause_requested = true;
        }
        if self.cfg.fail_on_date == Some(today) {
            return Err(qtrader_strategy::StrategyError::Internal(
                "scripted failure".into(),
            ));
        }
        if self.cfg.stop_on_date == Some(today) {
            ctx.stop_requested = true;
        }
        if let Some(limit) = self.cfg.stop_after_bars {
            if self.bars_seen >= limit {
                ctx.stop_requested = true;
            }
        }
        Ok(())
    }

    fn after_trading(&mut self, ctx: &mut Context) -> StrategyResult<()> {
        Self::record(ctx, "after_trading");
        Ok(())
    }

    fn broker_settle(&mut self, ctx: &mut Context) -> StrategyResult<()> {
        Self::record(ctx, "broker_settle");
        Ok(())
    }

    fn on_end(&mut self, ctx: &mut Context) -> StrategyResult<()> {
        Self::record(ctx, "on_end");
        Ok(())
    }
}

struct ScriptedFactory;

impl StrategyFactory for ScriptedFactory {
    fn canonical_name(&self) -> &'static str {
        "Scripted"
    }

    fn build(&self, params: toml::Value) -> StrategyResult<Box<dyn Strategy>> {
        let cfg: ScriptedConfig = params.try_into().map_err(|err: toml::de::Error| {
            qtrader_strategy::StrategyError::InvalidConfig(err.to_string())
        })?;
        Ok(Box::new(Scripted {
            cfg,
            bars_seen: 0,
            last_order_date: None,
        }))
    }
}

/// Register the scripted strategy once per test binary.
pub fn setup() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| register_strategy_factory(Arc::new(ScriptedFactory)));
}

pub fn params(cfg: &ScriptedConfig) -> toml::Value {
    toml::Value::try_from(cfg).expect("script serializes")
}

/// Backtest config over `[start, end]`, one daily bar at 10:00.
pub fn base_config(root: &Path, start: NaiveDate, end: NaiveDate) -> AppConfig {
    let mut config = AppConfig::default();
    config.engine.start_date = Some(start);
    config.engine.end_date = Some(end);
    config.engine.strategy_name = "Scripted".to_string();
    config.lifecycle.hooks.handle_bar = OneOrMany::One("10:00:00".to_string());
    config.workspace.root_dir = root.to_path_buf();
    config
}

/// Weekday calendar with a flat 10.00 quote, then per-day overrides.
pub fn flat_provider(
    start: NaiveDate,
    end: NaiveDate,
    overrides: &[(NaiveDate, Decimal)],
) -> Arc<FixtureProvider> {
    let mut provider = FixtureProvider::new()
        .with_weekday_calendar(start, end)
        .with_symbol(SYMBOL, "Test Co");
    let mut day = start;
    while day <= end {
        let price = overrides
            .iter()
            .find(|(date, _)| *date == day)
            .map(|(_, price)| *price)
            .unwrap_or(Decimal::from(10));
        provider = provider.with_day_quote(SYMBOL, day, TickQuote::last(price));
        day += chrono::Duration::days(1);
    }
    Arc::new(provider)
}

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

pub fn dt(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
    date(y, m, d).and_hms_opt(h, min, 0).unwrap()
}

/// The recorded hook trace from a context's user data.
pub fn events(ctx: &Context) -> Vec<String> {
    ctx.get("events")
        .and_then(|value| value.as_array().cloned())
        .unwrap_or_default()
        .into_iter()
        .filter_map(|value| value.as_str().map(str::to_string))
        .collect()
}
