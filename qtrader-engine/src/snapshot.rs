//! Snapshot envelopes: durable run state for pause, resume, and fork.
//!
//! An envelope is a self-describing JSON document with a version header, a
//! status tag, and component-keyed sections. Consumers read only the
//! sections they know; unknown sections round-trip untouched.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use qtrader_account::{DailyPositionRecord, DailySnapshot, Portfolio, Position};
use qtrader_core::{Frequency, Mode, OrderStatus, RunStatus, TradingRule};
use qtrader_strategy::Context;
use qtrader_trading::OrderManagerState;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::benchmark::BenchmarkTracker;

/// Current envelope format version.
pub const ENVELOPE_VERSION: u32 = 1;

/// Result alias for snapshot operations.
pub type SnapshotResult<T> = Result<T, SnapshotError>;

/// Snapshot failures are fatal: the engine refuses to start rather than
/// rehydrate partial state.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot encoding error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("envelope version {0} is newer than this build supports")]
    Version(u32),
    #[error("envelope status {0} is not resumable; only PAUSED envelopes rehydrate")]
    NotResumable(RunStatus),
}

/// Context fields that persist across pause/resume.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ContextSection {
    pub mode: Mode,
    pub frequency: Frequency,
    pub strategy_name: String,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub current_dt: Option<NaiveDateTime>,
    pub custom_schedule_points: Vec<NaiveTime>,
}

/// The full persisted run state.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Envelope {
    pub version: u32,
    pub status: RunStatus,
    pub saved_at: NaiveDateTime,
    pub context: ContextSection,
    pub portfolio: Portfolio,
    pub positions: Vec<Position>,
    pub position_snapshots: Vec<DailySnapshot>,
    pub orders: OrderManagerState,
    pub benchmark: BenchmarkTracker,
    pub user_data: BTreeMap<String, serde_json::Value>,
    /// Sections written by other components or newer builds; preserved
    /// verbatim on re-save.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Capture the live run into an envelope.
///
/// When the capture happens intraday (before the settlement hook time), a
/// live position snapshot for the current day is generated so a fork at
/// this date sees up-to-date holdings.
pub fn capture(
    ctx: &Context,
    benchmark: &BenchmarkTracker,
    status: RunStatus,
    settle_time: NaiveTime,
    saved_at: NaiveDateTime,
) -> Envelope {
    let mut position_snapshots: Vec<DailySnapshot> = ctx.positions.daily_snapshots().to_vec();

    if let Some(current_dt) = ctx.current_dt {
        if current_dt.time() < settle_time && !ctx.positions.is_empty() {
            let date = current_dt.date();
            let live: Vec<DailyPositionRecord> = ctx
                .positions
                .iter()
                .filter(|pos| pos.total_amount > 0)
                .map(|pos| live_record(pos, current_dt, ctx))
                .collect();
            if !live.is_empty() {
                position_snapshots.retain(|snap| snap.date != date);
                position_snapshots.push(DailySnapshot {
                    date,
                    positions: live,
                });
            }
        }
    }

    Envelope {
        version: ENVELOPE_VERSION,
        status,
        saved_at,
        context: ContextSection {
            mode: ctx.mode,
            frequency: ctx.config.engine.frequency,
            strategy_name: ctx.strategy_name.clone(),
            start_date: ctx.start_date,
            end_date: ctx.end_date,
            current_dt: ctx.current_dt,
            custom_schedule_points: ctx.custom_schedule_points.clone(),
        },
        portfolio: ctx.portfolio.clone(),
        positions: ctx.positions.all(),
        position_snapshots,
        orders: ctx.orders.state(),
        benchmark: benchmark.clone(),
        user_data: ctx.user_data.clone(),
        extra: BTreeMap::new(),
    }
}

fn live_record(pos: &Position, dt: NaiveDateTime, ctx: &Context) -> DailyPositionRecord {
    let price = ctx
        .provider
        .current_price(&pos.symbol, dt)
        .map(|quote| quote.current_price)
        .unwrap_or(pos.current_price);
    let sign = Decimal::from(pos.direction.sign());
    let daily_pnl = (price - pos.last_settle_price) * Decimal::from(pos.total_amount) * sign;
    let base = (pos.last_settle_price * Decimal::from(pos.total_amount)).abs();
    DailyPositionRecord {
        date: dt.date(),
        symbol: pos.symbol.clone(),
        symbol_name: pos.symbol_name.clone(),
        direction: pos.direction,
        amount: pos.total_amount,
        avg_cost: pos.avg_cost,
        close_price: price,
        market_value: sign * Decimal::from(pos.total_amount) * price,
        daily_pnl,
        daily_pnl_ratio: if base > Decimal::ZERO {
            daily_pnl / base
        } else {
            Decimal::ZERO
        },
    }
}

/// Write an envelope to disk.
pub fn save(path: &Path, envelope: &Envelope) -> SnapshotResult<()> {
    let body = serde_json::to_string_pretty(envelope)?;
    fs::write(path, body)?;
    info!(path = %path.display(), status = %envelope.status, "snapshot saved");
    Ok(())
}

/// Read an envelope from disk, refusing formats newer than this build.
pub fn load(path: &Path) -> SnapshotResult<Envelope> {
    let body = fs::read_to_string(path)?;
    let envelope: Envelope = serde_json::from_str(&body)?;
    if envelope.version > ENVELOPE_VERSION {
        return Err(SnapshotError::Version(envelope.version));
    }
    Ok(envelope)
}

/// Only PAUSED envelopes may rehydrate execution state.
pub fn ensure_resumable(envelope: &Envelope) -> SnapshotResult<()> {
    if envelope.status != RunStatus::Paused {
        return Err(SnapshotError::NotResumable(envelope.status));
    }
    Ok(())
}

/// Restore the envelope into a freshly constructed context. Returns the
/// benchmark tracker that travelled with the snapshot.
pub fn restore_into(ctx: &mut Context, envelope: Envelope) -> BenchmarkTracker {
    ctx.strategy_name = envelope.context.strategy_name;
    ctx.start_date = envelope.context.start_date;
    if ctx.end_date.is_none() {
        ctx.end_date = envelope.context.end_date;
    }
    ctx.current_dt = envelope.context.current_dt;
    ctx.custom_schedule_points = envelope.context.custom_schedule_points;
    ctx.portfolio = envelope.portfolio;
    ctx.positions.restore_positions(envelope.positions);
    ctx.positions
        .restore_daily_snapshots(envelope.position_snapshots);
    ctx.orders.restore(envelope.orders);
    ctx.user_data = envelope.user_data;
    envelope.benchmark
}

/// Everything a fork needs to seed its new timeline.
pub struct ForkedState {
    pub portfolio: Portfolio,
    pub positions: Vec<Position>,
    pub position_snapshots: Vec<DailySnapshot>,
    pub orders: OrderManagerState,
    pub benchmark: BenchmarkTracker,
    pub user_data: BTreeMap<String, serde_json::Value>,
}

/// Rebuild parent state truncated to strictly before the fork date.
///
/// Positions come from the latest daily snapshot before `fork_date` (empty
/// when none exists); only filled orders whose fill date precedes the fork
/// survive; cash rolls back to the last retained equity point.
pub fn fork_state(
    envelope: &Envelope,
    fork_date: NaiveDate,
    margin_rate: Decimal,
    trading_rule: TradingRule,
) -> ForkedState {
    let mut portfolio = envelope.portfolio.clone();
    portfolio.history.retain(|point| point.date < fork_date);
    if let Some(last) = portfolio.history.last() {
        portfolio.cash = last.cash;
    } else {
        portfolio.cash = portfolio.initial_cash;
    }
    portfolio.margin = Decimal::ZERO;

    let position_snapshots: Vec<DailySnapshot> = envelope
        .position_snapshots
        .iter()
        .filter(|snap| snap.date < fork_date)
        .cloned()
        .collect();

    let positions = position_snapshots
        .iter()
        .max_by_key(|snap| snap.date)
        .map(|snap| {
            snap.positions
                .iter()
                .map(|record| position_from_record(record, fork_date, margin_rate, trading_rule))
                .collect()
        })
        .unwrap_or_default();

    let orders = OrderManagerState {
        orders: envelope
            .orders
            .orders
            .iter()
            .filter(|order| {
                order.status == OrderStatus::Filled
                    && order.filled_date().map(|d| d < fork_date).unwrap_or(false)
            })
            .cloned()
            .collect(),
        next_seq: envelope.orders.next_seq,
    };

    let mut benchmark = envelope.benchmark.clone();
    benchmark.truncate_from(fork_date);

    ForkedState {
        portfolio,
        positions,
        position_snapshots,
        orders,
        benchmark,
        user_data: envelope.user_data.clone(),
    }
}

fn position_from_record(
    record: &DailyPositionRecord,
    fork_date: NaiveDate,
    margin_rate: Decimal,
    trading_rule: TradingRule,
) -> Position {
    let dt = fork_date.and_hms_opt(0, 0, 0).unwrap_or_default();
    let mut position = Position::new(
        record.symbol.clone(),
        record.symbol_name.clone(),
        record.amount,
        record.close_price,
        dt,
        record.direction,
        margin_rate,
        trading_rule,
    );
    // Inherited holdings are aged stock: fully sellable, nothing opened
    // today.
    position.available_amount = record.amount;
    position.today_open_amount = 0;
    position
}

/// Apply a forked state onto a fresh context.
pub fn apply_fork(ctx: &mut Context, state: ForkedState, keep_user_data: bool) -> BenchmarkTracker {
    ctx.portfolio = state.portfolio;
    ctx.positions.restore_positions(state.positions);
    ctx.positions.restore_daily_snapshots(state.position_snapshots);
    ctx.orders.restore(state.orders);
    ctx.user_data = if keep_user_data {
        state.user_data
    } else {
        BTreeMap::new()
    };
    ctx.portfolio.update_financials(&ctx.positions);
    state.benchmark
}
