//! Strategy trait definitions, the shared context facade, and the strategy
//! registry.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use once_cell::sync::Lazy;
use qtrader_account::{Portfolio, Position, PositionManager};
use qtrader_config::AppConfig;
use qtrader_core::{
    Amount, Direction, MarketPhase, Mode, Order, OrderId, OrderType, Price, Symbol,
};
use qtrader_data::DataProvider;
use qtrader_trading::OrderManager;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

/// Result alias used within strategy implementations.
pub type StrategyResult<T> = Result<T, StrategyError>;

/// Failure variants surfaced by strategies.
#[derive(Debug, Error)]
pub enum StrategyError {
    /// Raised when a strategy's configuration cannot be parsed or is invalid.
    #[error("configuration is invalid: {0}")]
    InvalidConfig(String),
    /// Used for all other errors that should bubble up to the sandbox.
    #[error("strategy error: {0}")]
    Internal(String),
}

/// A position requested through `set_initial_state` / `align_account_state`.
/// A positive amount is a long holding, a negative one a short.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TargetPosition {
    pub symbol: Symbol,
    pub amount: Amount,
    #[serde(default)]
    pub avg_cost: Option<Price>,
    #[serde(default)]
    pub symbol_name: Option<String>,
}

/// The shared bus every hook receives: references to the account, the order
/// book, the provider, and the run's flags, behind a façade that forwards
/// to the sub-components.
pub struct Context {
    pub mode: Mode,
    pub strategy_name: String,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub current_dt: Option<NaiveDateTime>,
    pub market_phase: MarketPhase,

    pub portfolio: Portfolio,
    pub positions: PositionManager,
    pub orders: OrderManager,
    pub provider: Arc<dyn DataProvider>,
    pub config: AppConfig,

    /// The strategy's opaque key/value store, persisted in snapshots.
    pub user_data: BTreeMap<String, serde_json::Value>,
    /// Extra `handle_bar` times registered during `initialize`.
    pub custom_schedule_points: Vec<NaiveTime>,

    pub is_running: bool,
    pub is_paused: bool,
    pub is_initializing: bool,
    pub start_paused: bool,
    pub was_interrupted: bool,
    pub pause_requested: bool,
    pub stop_requested: bool,
    pub resync_requested: bool,
    pub strategy_error_today: bool,

    initial_state_set: bool,
}

impl Context {
    pub fn new(config: AppConfig, provider: Arc<dyn DataProvider>) -> Self {
        let portfolio = Portfolio::new(config.account.initial_cash);
        let positions = PositionManager::new(
            config.account.short_margin_rate,
            config.account.trading_rule,
        );
        let orders = OrderManager::new(config.account.order_lot_size);
        Self {
            mode: config.engine.mode,
            strategy_name: config.engine.strategy_name.clone(),
            start_date: config.engine.start_date,
            end_date: config.engine.end_date,
            current_dt: None,
            market_phase: MarketPhase::Closed,
            portfolio,
            positions,
            orders,
            provider,
            config,
            user_data: BTreeMap::new(),
            custom_schedule_points: Vec::new(),
            is_running: false,
            is_paused: false,
            is_initializing: false,
            start_paused: false,
            was_interrupted: false,
            pause_requested: false,
            stop_requested: false,
            resync_requested: false,
            strategy_error_today: false,
            initial_state_set: false,
        }
    }

    /// The engine's logical "now". Hooks always run with this set.
    #[must_use]
    pub fn now(&self) -> NaiveDateTime {
        self.current_dt.unwrap_or_default()
    }

    /// Submit an order. A positive amount buys, a negative one sells; the
    /// returned id is `None` when the submission was rejected outright.
    pub fn submit_order(
        &mut self,
        symbol: &str,
        amount: Amount,
        order_type: OrderType,
        limit_price: Option<Price>,
    ) -> Option<OrderId> {
        let now = self.now();
        self.orders
            .submit(symbol, amount, order_type, limit_price, None, now, now)
    }

    pub fn cancel_order(&mut self, order_id: &str) -> bool {
        self.orders.cancel(order_id)
    }

    #[must_use]
    pub fn open_orders(&self) -> Vec<Order> {
        self.orders.open_orders()
    }

    #[must_use]
    pub fn position(&self, symbol: &str, direction: Direction) -> Option<&Position> {
        self.positions.get(symbol, direction)
    }

    /// Store a value in the strategy's opaque dictionary.
    pub fn set(&mut self, key: &str, value: serde_json::Value) {
        self.user_data.insert(key.to_string(), value);
    }

    /// Fetch a value from the strategy's opaque dictionary.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.user_data.get(key)
    }

    /// Register an extra `handle_bar` time. Only honored during
    /// `initialize`; elsewhere the call is ignored with a warning.
    pub fn add_schedule(&mut self, time: &str) {
        if !self.is_initializing {
            warn!(time, "add_schedule ignored outside initialize");
            return;
        }
        match NaiveTime::parse_from_str(time, "%H:%M:%S") {
            Ok(point) => {
                if !self.custom_schedule_points.contains(&point) {
                    info!(%point, "custom schedule point added");
                    self.custom_schedule_points.push(point);
                }
            }
            Err(_) => warn!(time, "add_schedule ignored: expected HH:MM:SS"),
        }
    }

    /// Seed the account with a starting cash figure and positions. Allowed
    /// once, during `initialize`; repeated or late calls are ignored with a
    /// warning.
    pub fn set_initial_state(&mut self, cash: Price, positions: Vec<TargetPosition>) {
        if !self.is_initializing {
            warn!("set_initial_state ignored outside initialize");
            return;
        }
        if self.initial_state_set {
            warn!("set_initial_state ignored: already called once");
            return;
        }
        self.portfolio.cash = cash;
        self.apply_target_positions(&positions);
        self.portfolio.update_financials(&self.positions);
        // The run's baseline is whatever the seeded account is worth.
        self.portfolio.initial_cash = self.portfolio.net_worth;
        self.initial_state_set = true;
        info!(
            cash = %self.portfolio.cash,
            net_worth = %self.portfolio.net_worth,
            "initial account state set"
        );
    }

    /// Reconcile the internal account against an external statement: the
    /// target positions replace the book wholesale, margin is recomputed,
    /// and cash adopts the provided figure. Refused during trading hours.
    pub fn align_account_state(&mut self, cash: Price, positions: Vec<TargetPosition>) {
        if self.market_phase == MarketPhase::Trading {
            warn!("align_account_state ignored during the trading session");
            return;
        }
        let before = self.portfolio.cash;
        self.portfolio.cash = cash;

        // Drop slots the target does not mention, then apply the targets.
        let targeted: Vec<(Symbol, Direction)> = positions
            .iter()
            .filter(|target| target.amount != 0)
            .map(|target| (target.symbol.clone(), direction_of(target.amount)))
            .collect();
        let stale: Vec<(Symbol, Direction)> = self
            .positions
            .iter()
            .map(|pos| (pos.symbol.clone(), pos.direction))
            .filter(|key| !targeted.contains(key))
            .collect();
        let now = self.now();
        for (symbol, direction) in stale {
            self.positions
                .adjust(&symbol, 0, Price::ZERO, None, direction, now);
        }
        self.apply_target_positions(&positions);

        self.portfolio.update_financials(&self.positions);
        info!(
            cash_before = %before,
            cash_after = %self.portfolio.cash,
            "account state aligned"
        );
    }

    fn apply_target_positions(&mut self, positions: &[TargetPosition]) {
        let now = self.now();
        for target in positions {
            if target.amount == 0 {
                continue;
            }
            let direction = direction_of(target.amount);
            let avg_cost = match target.avg_cost {
                Some(cost) => cost,
                None => match self.provider.current_price(&target.symbol, now) {
                    Some(quote) => quote.current_price,
                    None => {
                        warn!(
                            symbol = %target.symbol,
                            "no price available for target position; skipped"
                        );
                        continue;
                    }
                },
            };
            let symbol_name = target.symbol_name.clone().or_else(|| {
                self.provider
                    .symbol_info(&target.symbol, now.date())
                    .map(|info| info.symbol_name)
            });
            self.positions.adjust(
                &target.symbol,
                target.amount.abs(),
                avg_cost,
                symbol_name.as_deref(),
                direction,
                now,
            );
        }
    }
}

fn direction_of(amount: Amount) -> Direction {
    if amount >= 0 {
        Direction::Long
    } else {
        Direction::Short
    }
}

/// Lifecycle hooks the engine calls through the sandbox. `initialize` is
/// the only mandatory hook; the rest default to no-ops.
pub trait Strategy: Send {
    /// Human-friendly identifier used in logs and artifacts.
    fn name(&self) -> &str;

    /// Called exactly once before the first trading day of a fresh run.
    fn initialize(&mut self, ctx: &mut Context) -> StrategyResult<()>;

    /// Called once per trading day before the first bar.
    fn before_trading(&mut self, _ctx: &mut Context) -> StrategyResult<()> {
        Ok(())
    }

    /// Called at every schedule point within the trading day.
    fn handle_bar(&mut self, _ctx: &mut Context) -> StrategyResult<()> {
        Ok(())
    }

    /// Called once per trading day after the last bar.
    fn after_trading(&mut self, _ctx: &mut Context) -> StrategyResult<()> {
        Ok(())
    }

    /// Called after the engine's daily settlement bookkeeping begins; the
    /// place to reconcile against an external broker statement.
    fn broker_settle(&mut self, _ctx: &mut Context) -> StrategyResult<()> {
        Ok(())
    }

    /// Called once when the run finishes or is stopped.
    fn on_end(&mut self, _ctx: &mut Context) -> StrategyResult<()> {
        Ok(())
    }
}

// -------------------------------------------------------------------------
// Strategy registry
// -------------------------------------------------------------------------

static STRATEGY_REGISTRY: Lazy<StrategyRegistry> = Lazy::new(StrategyRegistry::new);

/// Returns a handle to the global registry.
pub fn strategy_registry() -> &'static StrategyRegistry {
    &STRATEGY_REGISTRY
}

/// Registers a strategy factory with the global registry.
pub fn register_strategy_factory(factory: Arc<dyn StrategyFactory>) {
    strategy_registry().register(factory);
}

/// Builds a strategy by name using the registered factories.
pub fn load_strategy(name: &str, params: toml::Value) -> StrategyResult<Box<dyn Strategy>> {
    strategy_registry().build(name, params)
}

/// Returns the list of registered strategy identifiers in sorted order.
pub fn builtin_strategy_names() -> Vec<&'static str> {
    strategy_registry().names()
}

/// Factory contract used to construct strategies from configuration.
pub trait StrategyFactory: Send + Sync {
    /// Canonical, user-facing identifier for the strategy.
    fn canonical_name(&self) -> &'static str;

    /// Additional aliases that should resolve to the same strategy.
    fn aliases(&self) -> &'static [&'static str] {
        &[]
    }

    /// Builds and configures a strategy instance with the provided params.
    fn build(&self, params: toml::Value) -> StrategyResult<Box<dyn Strategy>>;
}

#[derive(Default)]
struct RegistryInner {
    by_canonical: HashMap<&'static str, Arc<dyn StrategyFactory>>,
    by_alias: HashMap<String, Arc<dyn StrategyFactory>>,
}

/// Thread-safe registry used to manage available strategies.
pub struct StrategyRegistry {
    inner: RwLock<RegistryInner>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
        }
    }

    fn register(&self, factory: Arc<dyn StrategyFactory>) {
        let mut inner = self.inner.write().expect("registry poisoned");
        let canonical = factory.canonical_name();
        if inner
            .by_canonical
            .insert(canonical, factory.clone())
            .is_some()
        {
            warn!(
                strategy = canonical,
                "duplicate strategy registration; overriding previous factory"
            );
        }
        inner
            .by_alias
            .insert(normalize_name(canonical), factory.clone());
        for alias in factory.aliases() {
            inner.by_alias.insert(normalize_name(alias), factory.clone());
        }
    }

    fn build(&self, name: &str, params: toml::Value) -> StrategyResult<Box<dyn Strategy>> {
        let factory = {
            let inner = self.inner.read().expect("registry poisoned");
            inner.by_alias.get(&normalize_name(name)).cloned()
        };
        factory
            .ok_or_else(|| StrategyError::InvalidConfig(format!("unknown strategy: {name}")))?
            .build(params)
    }

    fn names(&self) -> Vec<&'static str> {
        let inner = self.inner.read().expect("registry poisoned");
        let mut names: Vec<&'static str> = inner.by_canonical.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize_name(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}

// -------------------------------------------------------------------------
// Reference strategy
// -------------------------------------------------------------------------

/// Parameters of the reference buy-and-hold strategy.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct BuyAndHoldConfig {
    pub symbol: Symbol,
    pub amount: Amount,
}

impl Default for BuyAndHoldConfig {
    fn default() -> Self {
        Self {
            symbol: "600519.SH".to_string(),
            amount: 100,
        }
    }
}

/// Buys a fixed amount on the first bar and then holds.
pub struct BuyAndHold {
    cfg: BuyAndHoldConfig,
    entered: bool,
}

impl BuyAndHold {
    pub fn new(cfg: BuyAndHoldConfig) -> Self {
        Self {
            cfg,
            entered: false,
        }
    }
}

impl Strategy for BuyAndHold {
    fn name(&self) -> &str {
        "buy-and-hold"
    }

    fn initialize(&mut self, _ctx: &mut Context) -> StrategyResult<()> {
        if self.cfg.amount <= 0 {
            return Err(StrategyError::InvalidConfig(
                "amount must be positive".into(),
            ));
        }
        Ok(())
    }

    fn handle_bar(&mut self, ctx: &mut Context) -> StrategyResult<()> {
        if !self.entered {
            ctx.submit_order(&self.cfg.symbol, self.cfg.amount, OrderType::Market, None);
            self.entered = true;
        }
        Ok(())
    }
}

struct BuyAndHoldFactory;

impl StrategyFactory for BuyAndHoldFactory {
    fn canonical_name(&self) -> &'static str {
        "BuyAndHold"
    }

    fn aliases(&self) -> &'static [&'static str] {
        &["Hold"]
    }

    fn build(&self, params: toml::Value) -> StrategyResult<Box<dyn Strategy>> {
        let cfg: BuyAndHoldConfig = params.try_into().map_err(|err: toml::de::Error| {
            StrategyError::InvalidConfig(format!("failed to parse BuyAndHold config: {err}"))
        })?;
        Ok(Box::new(BuyAndHold::new(cfg)))
    }
}

/// Register the built-in reference strategies. Safe to call repeatedly.
pub fn register_builtins() {
    static ONCE: Lazy<()> = Lazy::new(|| {
        register_strategy_factory(Arc::new(BuyAndHoldFactory));
    });
    Lazy::force(&ONCE);
}

#[cfg(test)]
mod tests {
    use super::*;
    use qtrader_core::TickQuote;
    use qtrader_data::FixtureProvider;
    use rust_decimal::Decimal;

    fn context() -> Context {
        let day = NaiveDate::from_ymd_opt(2024, 3, 4).unwrap();
        let provider = FixtureProvider::new()
            .with_symbol("600519.SH", "Test Co")
            .with_day_quote("600519.SH", day, TickQuote::last(Decimal::from(10)));
        let mut ctx = Context::new(AppConfig::default(), Arc::new(provider));
        ctx.current_dt = day.and_hms_opt(9, 30, 0);
        ctx
    }

    #[test]
    fn add_schedule_only_works_during_initialize() {
        let mut ctx = context();
        ctx.add_schedule("10:30:00");
        assert!(ctx.custom_schedule_points.is_empty());

        ctx.is_initializing = true;
        ctx.add_schedule("10:30:00");
        ctx.add_schedule("10:30:00");
        ctx.add_schedule("not-a-time");
        assert_eq!(
            ctx.custom_schedule_points,
            vec![NaiveTime::from_hms_opt(10, 30, 0).unwrap()]
        );
    }

    #[test]
    fn set_initial_state_is_single_shot() {
        let mut ctx = context();
        ctx.is_initializing = true;
        ctx.set_initial_state(
            Decimal::from(50_000),
            vec![TargetPosition {
                symbol: "600519.SH".into(),
                amount: 200,
                avg_cost: None,
                symbol_name: None,
            }],
        );
        assert_eq!(ctx.portfolio.cash, Decimal::from(50_000));
        // 200 shares at the provider's 10.00.
        assert_eq!(ctx.portfolio.net_worth, Decimal::from(52_000));
        assert_eq!(ctx.portfolio.initial_cash, Decimal::from(52_000));

        // Second call is ignored.
        ctx.set_initial_state(Decimal::from(1), vec![]);
        assert_eq!(ctx.portfolio.cash, Decimal::from(50_000));
    }

    #[test]
    fn align_replaces_the_book_wholesale() {
        let mut ctx = context();
        ctx.is_initializing = true;
        ctx.set_initial_state(
            Decimal::from(10_000),
            vec![TargetPosition {
                symbol: "600519.SH".into(),
                amount: 100,
                avg_cost: Some(Decimal::from(10)),
                symbol_name: None,
            }],
        );
        ctx.is_initializing = false;

        ctx.align_account_state(
            Decimal::from(9_000),
            vec![TargetPosition {
                symbol: "000001.SZ".into(),
                amount: -300,
                avg_cost: Some(Decimal::from(5)),
                symbol_name: None,
            }],
        );
        assert!(ctx.position("600519.SH", Direction::Long).is_none());
        let short = ctx.position("000001.SZ", Direction::Short).unwrap();
        assert_eq!(short.total_amount, 300);
        assert_eq!(short.available_amount, 300);
        assert_eq!(ctx.portfolio.cash, Decimal::from(9_000));
        // Margin recomputed: 300 * 5 * 0.2.
        assert_eq!(ctx.portfolio.margin, Decimal::from(300));
    }

    #[test]
    fn align_is_refused_while_trading() {
        let mut ctx = context();
        ctx.market_phase = MarketPhase::Trading;
        let cash_before = ctx.portfolio.cash;
        ctx.align_account_state(Decimal::ZERO, vec![]);
        assert_eq!(ctx.portfolio.cash, cash_before);
    }

    #[test]
    fn registry_resolves_aliases_case_insensitively() {
        register_builtins();
        let strategy = load_strategy("hold", toml::Value::Table(Default::default())).unwrap();
        assert_eq!(strategy.name(), "buy-and-hold");
        assert!(builtin_strategy_names().contains(&"BuyAndHold"));
        assert!(load_strategy("nope", toml::Value::Table(Default::default())).is_err());
    }
}
