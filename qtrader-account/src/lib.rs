//! Portfolio accounting primitives.

pub mod position;

use chrono::NaiveDate;
use qtrader_core::{Amount, Price, Symbol};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use position::{DailyPositionRecord, DailySnapshot, Position, PositionKey, PositionManager};

/// Result alias for accounting operations.
pub type AccountResult<T> = Result<T, AccountError>;

/// Accounting-specific error type.
#[derive(Debug, Error)]
pub enum AccountError {
    /// A close was asked for more shares than the slot holds.
    #[error("cannot close {requested} of {symbol}: only {held} held")]
    CloseExceedsPosition {
        symbol: Symbol,
        requested: Amount,
        held: Amount,
    },
    /// A sell would open a short in a long-only account.
    #[error("account is long-only; cannot open a short position in {0}")]
    ShortNotPermitted(Symbol),
}

/// One row of the daily equity history, also the `equity.csv` row shape.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct EquityPoint {
    pub date: NaiveDate,
    pub net_worth: Price,
    pub cash: Price,
    pub long_market_value: Price,
    pub short_market_value: Price,
    pub returns: Decimal,
}

/// The account's core financial state machine.
///
/// Derived figures are refreshed by [`Portfolio::update_financials`] after
/// any cash or position mutation; `record_history` appends the daily
/// snapshot used by `equity.csv` and the performance report.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Portfolio {
    pub initial_cash: Price,
    pub cash: Price,
    /// Reserved short margin, derived from the position book.
    pub margin: Price,
    pub net_worth: Price,
    pub long_positions_value: Price,
    /// Short liability recorded positive.
    pub short_positions_value: Price,
    pub net_positions_value: Price,
    pub total_assets: Price,
    pub history: Vec<EquityPoint>,
}

impl Portfolio {
    pub fn new(initial_cash: Price) -> Self {
        Self {
            initial_cash,
            cash: initial_cash,
            margin: Decimal::ZERO,
            net_worth: initial_cash,
            long_positions_value: Decimal::ZERO,
            short_positions_value: Decimal::ZERO,
            net_positions_value: Decimal::ZERO,
            total_assets: initial_cash,
            history: Vec::new(),
        }
    }

    /// Cash not locked as short margin.
    #[must_use]
    pub fn available_cash(&self) -> Price {
        self.cash - self.margin
    }

    /// Cumulative return on net worth.
    #[must_use]
    pub fn returns(&self) -> Decimal {
        if self.initial_cash.is_zero() {
            Decimal::ZERO
        } else {
            (self.net_worth - self.initial_cash) / self.initial_cash
        }
    }

    /// Recompute every derived figure from the current position book.
    pub fn update_financials(&mut self, positions: &PositionManager) {
        self.margin = positions.iter().map(Position::margin).sum();
        self.long_positions_value = positions
            .iter()
            .filter(|pos| pos.direction == qtrader_core::Direction::Long)
            .map(Position::market_value)
            .sum();
        self.short_positions_value = positions
            .iter()
            .filter(|pos| pos.direction == qtrader_core::Direction::Short)
            .map(|pos| pos.market_value().abs())
            .sum();
        self.net_positions_value = self.long_positions_value - self.short_positions_value;
        self.total_assets = self.cash + self.long_positions_value;
        self.net_worth = self.cash + self.net_positions_value;
    }

    /// Refresh financials and append the day's equity point.
    pub fn record_history(&mut self, date: NaiveDate, positions: &PositionManager) {
        self.update_financials(positions);
        let point = EquityPoint {
            date,
            net_worth: self.net_worth,
            cash: self.cash,
            long_market_value: self.long_positions_value,
            short_market_value: self.short_positions_value,
            returns: self.returns(),
        };
        self.history.push(point);
    }
}
