//! Layered configuration loading utilities.

use std::path::{Path, PathBuf};

use chrono::{NaiveDate, NaiveTime};
use config::{Config, Environment, File};
use qtrader_core::{Frequency, Mode, TradingMode, TradingRule};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Result alias for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Failure variants surfaced while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid time '{value}' for {field}: expected HH:MM:SS")]
    BadTime { field: &'static str, value: String },
    #[error("backtest mode requires engine.start_date and engine.end_date")]
    MissingDates,
    #[error("engine.start_date must not be after engine.end_date")]
    InvertedDates,
    #[error("lifecycle.trading_sessions must contain at least one window")]
    NoSessions,
}

/// Root application configuration deserialized from layered sources.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub account: AccountConfig,
    #[serde(default)]
    pub matching: MatchingConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub benchmark: BenchmarkConfig,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub frequency: Frequency,
    /// Granularity of tick-frequency schedule points, in seconds.
    #[serde(default = "default_tick_interval")]
    pub tick_interval_seconds: u64,
    /// Backtest only; ignored in simulation.
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
    #[serde(default = "default_strategy_name")]
    pub strategy_name: String,
    /// Simulation watchdog: hooks running longer than this request a resync.
    #[serde(default = "default_block_threshold")]
    pub block_threshold_seconds: u64,
    /// When true, a failing `initialize` on a fresh run aborts the engine.
    #[serde(default)]
    pub strict_init: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            frequency: Frequency::default(),
            tick_interval_seconds: default_tick_interval(),
            start_date: None,
            end_date: None,
            strategy_name: default_strategy_name(),
            block_threshold_seconds: default_block_threshold(),
            strict_init: false,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AccountConfig {
    #[serde(default = "default_initial_cash")]
    pub initial_cash: Decimal,
    #[serde(default)]
    pub trading_rule: TradingRule,
    #[serde(default)]
    pub trading_mode: TradingMode,
    #[serde(default = "default_lot_size")]
    pub order_lot_size: i64,
    #[serde(default = "default_short_margin_rate")]
    pub short_margin_rate: Decimal,
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            initial_cash: default_initial_cash(),
            trading_rule: TradingRule::default(),
            trading_mode: TradingMode::default(),
            order_lot_size: default_lot_size(),
            short_margin_rate: default_short_margin_rate(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct MatchingConfig {
    #[serde(default)]
    pub slippage: SlippageConfig,
    #[serde(default)]
    pub commission: CommissionConfig,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SlippageConfig {
    /// Fractional rate applied against the trade: buys fill at `p * (1 + r)`,
    /// sells at `p * (1 - r)`.
    #[serde(default = "default_slippage_rate")]
    pub rate: Decimal,
}

impl Default for SlippageConfig {
    fn default() -> Self {
        Self {
            rate: default_slippage_rate(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CommissionConfig {
    #[serde(default = "default_side_commission")]
    pub buy_commission: Decimal,
    #[serde(default = "default_side_commission")]
    pub sell_commission: Decimal,
    #[serde(default)]
    pub buy_tax: Decimal,
    #[serde(default = "default_sell_tax")]
    pub sell_tax: Decimal,
    #[serde(default = "default_min_commission")]
    pub min_commission: Decimal,
}

impl Default for CommissionConfig {
    fn default() -> Self {
        Self {
            buy_commission: default_side_commission(),
            sell_commission: default_side_commission(),
            buy_tax: Decimal::ZERO,
            sell_tax: default_sell_tax(),
            min_commission: default_min_commission(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct LifecycleConfig {
    /// `[open, close]` windows as `HH:MM:SS` strings.
    #[serde(default = "default_sessions")]
    pub trading_sessions: Vec<(String, String)>,
    #[serde(default)]
    pub hooks: HooksConfig,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            trading_sessions: default_sessions(),
            hooks: HooksConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct HooksConfig {
    #[serde(default = "default_before_trading")]
    pub before_trading: String,
    #[serde(default = "default_after_trading")]
    pub after_trading: String,
    #[serde(default = "default_broker_settle")]
    pub broker_settle: String,
    /// A single `HH:MM:SS` time or a list of them.
    #[serde(default = "default_handle_bar")]
    pub handle_bar: OneOrMany,
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self {
            before_trading: default_before_trading(),
            after_trading: default_after_trading(),
            broker_settle: default_broker_settle(),
            handle_bar: default_handle_bar(),
        }
    }
}

/// Accepts either a scalar string or a list of strings in TOML/JSON.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    #[must_use]
    pub fn as_vec(&self) -> Vec<String> {
        match self {
            Self::One(value) => vec![value.clone()],
            Self::Many(values) => values.clone(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct BenchmarkConfig {
    #[serde(default)]
    pub symbol: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct WorkspaceConfig {
    /// Root directory for per-run artifact directories.
    #[serde(default = "default_workspace_root")]
    pub root_dir: PathBuf,
    /// Snapshot every N trading days; `None` disables auto-save.
    #[serde(default)]
    pub auto_save_interval: Option<u32>,
    #[serde(default)]
    pub auto_save_mode: AutoSaveMode,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root_dir: default_workspace_root(),
            auto_save_interval: None,
            auto_save_mode: AutoSaveMode::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AutoSaveMode {
    Overwrite,
    #[default]
    Increment,
}

fn default_tick_interval() -> u64 {
    3
}

fn default_strategy_name() -> String {
    "UnnamedStrategy".to_string()
}

fn default_block_threshold() -> u64 {
    5
}

fn default_initial_cash() -> Decimal {
    Decimal::from(1_000_000)
}

fn default_lot_size() -> i64 {
    100
}

fn default_short_margin_rate() -> Decimal {
    Decimal::new(2, 1) // 0.2
}

fn default_slippage_rate() -> Decimal {
    Decimal::ZERO
}

fn default_side_commission() -> Decimal {
    Decimal::new(2, 4) // 0.0002
}

fn default_sell_tax() -> Decimal {
    Decimal::new(1, 3) // 0.001
}

fn default_min_commission() -> Decimal {
    Decimal::from(5)
}

fn default_sessions() -> Vec<(String, String)> {
    vec![
        ("09:30:00".to_string(), "11:30:00".to_string()),
        ("13:00:00".to_string(), "15:00:00".to_string()),
    ]
}

fn default_before_trading() -> String {
    "09:15:00".to_string()
}

fn default_after_trading() -> String {
    "15:05:00".to_string()
}

fn default_broker_settle() -> String {
    "15:30:00".to_string()
}

fn default_handle_bar() -> OneOrMany {
    OneOrMany::One("14:55:00".to_string())
}

fn default_workspace_root() -> PathBuf {
    PathBuf::from("./runs")
}

fn parse_time(field: &'static str, value: &str) -> ConfigResult<NaiveTime> {
    NaiveTime::parse_from_str(value, "%H:%M:%S").map_err(|_| ConfigError::BadTime {
        field,
        value: value.to_string(),
    })
}

impl AppConfig {
    /// Validate cross-field constraints that serde cannot express.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.engine.mode == Mode::Backtest {
            match (self.engine.start_date, self.engine.end_date) {
                (Some(start), Some(end)) if start > end => return Err(ConfigError::InvertedDates),
                (Some(_), Some(_)) => {}
                _ => return Err(ConfigError::MissingDates),
            }
        }
        if self.lifecycle.trading_sessions.is_empty() {
            return Err(ConfigError::NoSessions);
        }
        self.session_windows()?;
        self.hook_times()?;
        self.handle_bar_points()?;
        Ok(())
    }

    /// Trading sessions as parsed `(open, close)` time pairs.
    pub fn session_windows(&self) -> ConfigResult<Vec<(NaiveTime, NaiveTime)>> {
        self.lifecycle
            .trading_sessions
            .iter()
            .map(|(open, close)| {
                Ok((
                    parse_time("lifecycle.trading_sessions", open)?,
                    parse_time("lifecycle.trading_sessions", close)?,
                ))
            })
            .collect()
    }

    /// Parsed `(before_trading, after_trading, broker_settle)` hook times.
    pub fn hook_times(&self) -> ConfigResult<(NaiveTime, NaiveTime, NaiveTime)> {
        Ok((
            parse_time("hooks.before_trading", &self.lifecycle.hooks.before_trading)?,
            parse_time("hooks.after_trading", &self.lifecycle.hooks.after_trading)?,
            parse_time("hooks.broker_settle", &self.lifecycle.hooks.broker_settle)?,
        ))
    }

    /// Configured `handle_bar` schedule points, sorted and de-duplicated.
    ///
    /// Daily frequency with more than one point is accepted (the provider's
    /// granularity may not support it, so it is surfaced as a warning).
    pub fn handle_bar_points(&self) -> ConfigResult<Vec<NaiveTime>> {
        let mut points = self
            .lifecycle
            .hooks
            .handle_bar
            .as_vec()
            .iter()
            .map(|value| parse_time("hooks.handle_bar", value))
            .collect::<ConfigResult<Vec<_>>>()?;
        points.sort_unstable();
        points.dedup();
        if self.engine.frequency == Frequency::Daily && points.len() > 1 {
            warn!(
                points = points.len(),
                "daily frequency configured with multiple handle_bar points"
            );
        }
        Ok(points)
    }
}

/// Loads configuration by merging files and environment variables.
///
/// Sources (lowest to highest precedence):
/// 1. `config/default.toml`
/// 2. `config/{environment}.toml` (if `environment` is Some)
/// 3. `config/local.toml` (optional, ignored in git)
/// 4. Environment variables prefixed with `QTRADER__`
pub fn load_config(env: Option<&str>) -> ConfigResult<AppConfig> {
    let base_path = Path::new("config");

    let mut builder =
        Config::builder().add_source(File::from(base_path.join("default.toml")).required(true));
    if let Some(env_name) = env {
        builder = builder
            .add_source(File::from(base_path.join(format!("{env_name}.toml"))).required(false));
    }
    builder = builder.add_source(File::from(base_path.join("local.toml")).required(false));
    builder = builder.add_source(
        Environment::with_prefix("QTRADER")
            .separator("__")
            .ignore_empty(true),
    );

    let loaded: AppConfig = builder.build()?.try_deserialize()?;
    loaded.validate()?;
    Ok(loaded)
}

/// Load a single self-contained configuration file (the CLI `--config` path).
pub fn load_config_file(path: &Path) -> ConfigResult<AppConfig> {
    let loaded: AppConfig = Config::builder()
        .add_source(File::from(path.to_path_buf()).required(true))
        .build()?
        .try_deserialize()?;
    loaded.validate()?;
    Ok(loaded)
}
