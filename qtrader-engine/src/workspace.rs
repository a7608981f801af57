//! Per-run artifact directory: logs, snapshot envelopes, CSV exports, and
//! the strategy snapshot used on resume.

use std::fs;
use std::path::{Path, PathBuf};

use qtrader_account::{DailySnapshot, EquityPoint};
use qtrader_core::{Mode, Order};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{EngineError, EngineResult};

/// Strategy identity persisted beside every envelope so a resumed run
/// rebinds to the same code path.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct StrategySnapshot {
    pub strategy_name: String,
    pub params: toml::Value,
}

/// Owns one run's directory and the artifact contracts inside it.
pub struct Workspace {
    dir: PathBuf,
    strategy_name: String,
}

impl Workspace {
    /// Create a fresh run directory under `root/<mode>/<run_tag>/`.
    pub fn create(
        root: &Path,
        mode: Mode,
        strategy_name: &str,
        run_tag: &str,
    ) -> EngineResult<Self> {
        let mode_dir = match mode {
            Mode::Backtest => "backtest",
            Mode::Simulation => "simulation",
        };
        let dir = root.join(mode_dir).join(run_tag);
        fs::create_dir_all(&dir)?;
        info!(dir = %dir.display(), "workspace created");
        Ok(Self {
            dir,
            strategy_name: strategy_name.to_string(),
        })
    }

    /// Attach to an existing run directory (resume).
    pub fn attach(dir: PathBuf, strategy_name: &str) -> Self {
        Self {
            dir,
            strategy_name: strategy_name.to_string(),
        }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Snapshot envelope path for a tag (`pause`, `interrupt`, `final`, …).
    #[must_use]
    pub fn envelope_path(&self, tag: &str) -> PathBuf {
        self.dir.join(format!("{}_{tag}.json", self.strategy_name))
    }

    #[must_use]
    pub fn equity_csv(&self) -> PathBuf {
        self.dir.join("equity.csv")
    }

    #[must_use]
    pub fn orders_csv(&self) -> PathBuf {
        self.dir.join("orders.csv")
    }

    #[must_use]
    pub fn positions_csv(&self) -> PathBuf {
        self.dir.join("daily_positions.csv")
    }

    fn strategy_snapshot_path(&self) -> PathBuf {
        self.dir.join("snapshot_strategy.toml")
    }

    /// Persist the strategy identity (and params) driving this run.
    pub fn write_strategy_snapshot(&self, snapshot: &StrategySnapshot) -> EngineResult<()> {
        let body = toml::to_string(snapshot)
            .map_err(|err| EngineError::Workspace(format!("strategy snapshot encode: {err}")))?;
        fs::write(self.strategy_snapshot_path(), body)?;
        Ok(())
    }

    /// Load the persisted strategy identity; missing or unreadable
    /// snapshots are fatal for resume.
    pub fn read_strategy_snapshot(&self) -> EngineResult<StrategySnapshot> {
        let path = self.strategy_snapshot_path();
        let body = fs::read_to_string(&path).map_err(|_| {
            EngineError::Workspace(format!("missing strategy snapshot at {}", path.display()))
        })?;
        toml::from_str(&body)
            .map_err(|err| EngineError::Workspace(format!("strategy snapshot decode: {err}")))
    }

    /// Export the three durable CSV artifacts.
    pub fn export_csv(
        &self,
        equity: &[EquityPoint],
        snapshots: &[DailySnapshot],
        orders: &[Order],
    ) -> EngineResult<()> {
        if !equity.is_empty() {
            let mut writer = csv::Writer::from_path(self.equity_csv())?;
            for point in equity {
                writer.serialize(point)?;
            }
            writer.flush()?;
        }

        if !orders.is_empty() {
            let mut writer = csv::Writer::from_path(self.orders_csv())?;
            for order in orders {
                writer.serialize(OrderRow::from(order))?;
            }
            writer.flush()?;
        }

        if snapshots.iter().any(|snap| !snap.positions.is_empty()) {
            let mut writer = csv::Writer::from_path(self.positions_csv())?;
            for snapshot in snapshots {
                for record in &snapshot.positions {
                    writer.serialize(PositionRow::from_record(record))?;
                }
            }
            writer.flush()?;
        }

        info!(dir = %self.dir.display(), "CSV artifacts exported");
        Ok(())
    }
}

#[derive(Serialize)]
struct OrderRow {
    id: String,
    symbol: String,
    symbol_name: String,
    side: String,
    #[serde(rename = "type")]
    order_type: String,
    limit_price: Option<String>,
    amount: i64,
    status: String,
    created_time: String,
    filled_time: Option<String>,
    filled_price: Option<String>,
    commission: Option<String>,
}

impl From<&Order> for OrderRow {
    fn from(order: &Order) -> Self {
        Self {
            id: order.id.clone(),
            symbol: order.symbol.clone(),
            symbol_name: order.symbol_name.clone().unwrap_or_default(),
            side: order.side.to_string(),
            order_type: order.order_type.to_string(),
            limit_price: order.limit_price.map(|price| price.to_string()),
            amount: order.amount,
            status: order.status.to_string(),
            created_time: format_dt(order.created_dt),
            filled_time: order.filled_dt.map(format_dt),
            filled_price: order.filled_price.map(|price| price.to_string()),
            commission: order.commission.map(|fee| fee.to_string()),
        }
    }
}

#[derive(Serialize)]
struct PositionRow {
    date: String,
    symbol: String,
    symbol_name: String,
    direction: String,
    avg_cost: String,
    amount: i64,
    close_price: String,
    market_value: String,
    daily_pnl: String,
    daily_pnl_ratio: String,
}

impl PositionRow {
    fn from_record(record: &qtrader_account::DailyPositionRecord) -> Self {
        Self {
            date: record.date.to_string(),
            symbol: record.symbol.clone(),
            symbol_name: record.symbol_name.clone().unwrap_or_default(),
            direction: record.direction.to_string(),
            avg_cost: record.avg_cost.to_string(),
            amount: record.amount,
            close_price: record.close_price.to_string(),
            market_value: record.market_value.to_string(),
            daily_pnl: record.daily_pnl.to_string(),
            daily_pnl_ratio: record.daily_pnl_ratio.to_string(),
        }
    }
}

fn format_dt(dt: chrono::NaiveDateTime) -> String {
    dt.format("%Y-%m-%dT%H:%M:%S").to_string()
}
