//! Fundamental data types shared across the entire workspace.

use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Alias for price precision.
pub type Price = Decimal;
/// Share quantities are integral lots.
pub type Amount = i64;
/// Alias used for human-readable market symbols (e.g., `600519.SH`).
pub type Symbol = String;
/// Unique identifier assigned to orders.
pub type OrderId = String;

/// Errors raised by illegal state transitions on core types.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Raised when a terminal order is asked to transition again.
    #[error("order {0} is terminal ({1}) and cannot transition")]
    TerminalOrder(OrderId, OrderStatus),
}

/// The side of an order, derived from the sign of the submitted amount.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Derive the side from a signed submission amount.
    #[must_use]
    pub fn from_signed(amount: Amount) -> Self {
        if amount >= 0 {
            Self::Buy
        } else {
            Self::Sell
        }
    }

    /// Returns the opposite side.
    #[must_use]
    pub fn inverse(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

/// Order execution style.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    /// Execute against the quoted contra side, falling back to the last price.
    Market,
    /// Execute at or better than the provided limit price.
    Limit,
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Market => write!(f, "market"),
            Self::Limit => write!(f, "limit"),
        }
    }
}

/// Lifecycle states of an order. All states except `Open` are terminal.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Open,
    Filled,
    Cancelled,
    Expired,
    Rejected,
}

impl OrderStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Open)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Open => "open",
            Self::Filled => "filled",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
            Self::Rejected => "rejected",
        };
        write!(f, "{label}")
    }
}

/// Direction of a position. The sign of a holding is encoded here, never in
/// the amount.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// Multiplier applied to market values and PnL deltas.
    #[must_use]
    pub fn sign(self) -> i64 {
        match self {
            Self::Long => 1,
            Self::Short => -1,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Long => write!(f, "long"),
            Self::Short => write!(f, "short"),
        }
    }
}

/// Runtime mode of the engine.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Backtest,
    Simulation,
}

/// Bar granularity driving the schedule-point builder.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    #[default]
    Daily,
    Minute,
    Tick,
}

/// Settlement rule governing when bought shares become sellable.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub enum TradingRule {
    #[default]
    #[serde(rename = "T+1")]
    TPlusOne,
    #[serde(rename = "T+0")]
    TPlusZero,
}

/// Whether the account may carry short positions.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TradingMode {
    #[default]
    LongOnly,
    LongShort,
}

/// Status of a run, persisted in the snapshot envelope. Only `Paused`
/// envelopes are legal inputs to resume or fork.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    Running,
    Paused,
    Interrupted,
    Finished,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Interrupted => "INTERRUPTED",
            Self::Finished => "FINISHED",
        };
        write!(f, "{label}")
    }
}

/// Intraday phase tracked by the simulation state machine.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub enum MarketPhase {
    BeforeTrading,
    Trading,
    AfterTrading,
    Settlement,
    #[default]
    Closed,
}

/// Price snapshot returned by the data provider for one (symbol, instant).
///
/// `current_price` is mandatory; the book and band fields are optional and
/// matching degrades gracefully when they are absent.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct TickQuote {
    pub current_price: Price,
    #[serde(default)]
    pub ask1: Option<Price>,
    #[serde(default)]
    pub bid1: Option<Price>,
    #[serde(default)]
    pub high_limit: Option<Price>,
    #[serde(default)]
    pub low_limit: Option<Price>,
}

impl TickQuote {
    /// Quote carrying only a last price.
    #[must_use]
    pub fn last(price: Price) -> Self {
        Self {
            current_price: price,
            ask1: None,
            bid1: None,
            high_limit: None,
            low_limit: None,
        }
    }
}

/// Static per-day information about a symbol.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct SymbolInfo {
    pub symbol_name: String,
    pub is_suspended: bool,
}

/// A trading order and everything the system learns about it over its life.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Order {
    pub id: OrderId,
    pub symbol: Symbol,
    #[serde(default)]
    pub symbol_name: Option<String>,
    /// Absolute quantity; the direction lives in `side`.
    pub amount: Amount,
    pub side: Side,
    pub order_type: OrderType,
    #[serde(default)]
    pub limit_price: Option<Price>,
    pub status: OrderStatus,
    /// Wall clock (simulation) or bar timestamp (backtest) at submission.
    pub created_dt: NaiveDateTime,
    /// The bar whose `handle_bar` produced this order, in either mode.
    pub created_bar_dt: NaiveDateTime,
    #[serde(default)]
    pub filled_dt: Option<NaiveDateTime>,
    #[serde(default)]
    pub filled_price: Option<Price>,
    #[serde(default)]
    pub commission: Option<Price>,
    /// Fresh orders match against their submission bar; once deferred they
    /// become resting and match against later bars instead.
    #[serde(default = "default_fresh")]
    pub is_fresh: bool,
}

fn default_fresh() -> bool {
    true
}

impl Order {
    /// Mark the order filled. Terminal states refuse further transitions.
    pub fn fill(
        &mut self,
        price: Price,
        commission: Price,
        dt: NaiveDateTime,
    ) -> Result<(), CoreError> {
        if self.status.is_terminal() {
            return Err(CoreError::TerminalOrder(self.id.clone(), self.status));
        }
        self.status = OrderStatus::Filled;
        self.filled_price = Some(price);
        self.commission = Some(commission);
        self.filled_dt = Some(dt);
        Ok(())
    }

    /// Mark the order rejected by the risk gate.
    pub fn reject(&mut self) {
        if !self.status.is_terminal() {
            self.status = OrderStatus::Rejected;
        }
    }

    /// Attempt a user cancel. Only `Open` orders cancel.
    pub fn cancel(&mut self) -> bool {
        if self.status == OrderStatus::Open {
            self.status = OrderStatus::Cancelled;
            true
        } else {
            false
        }
    }

    /// Expire a still-open order at end of day or during time resync.
    pub fn expire(&mut self) {
        if self.status == OrderStatus::Open {
            self.status = OrderStatus::Expired;
        }
    }

    /// Demote the order to the resting book for later bars.
    pub fn mark_resting(&mut self) {
        self.is_fresh = false;
    }

    /// Calendar date of the fill, if any.
    #[must_use]
    pub fn filled_date(&self) -> Option<NaiveDate> {
        self.filled_dt.map(|dt| dt.date())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn dt() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 4)
            .unwrap()
            .and_hms_opt(9, 31, 0)
            .unwrap()
    }

    fn sample_order() -> Order {
        Order {
            id: "O-000001".into(),
            symbol: "600519.SH".into(),
            symbol_name: None,
            amount: 100,
            side: Side::Buy,
            order_type: OrderType::Market,
            limit_price: None,
            status: OrderStatus::Open,
            created_dt: dt(),
            created_bar_dt: dt(),
            filled_dt: None,
            filled_price: None,
            commission: None,
            is_fresh: true,
        }
    }

    #[test]
    fn side_follows_sign_of_amount() {
        assert_eq!(Side::from_signed(100), Side::Buy);
        assert_eq!(Side::from_signed(-100), Side::Sell);
    }

    #[test]
    fn fill_records_time_price_and_commission() {
        let mut order = sample_order();
        order
            .fill(Decimal::new(1025, 2), Decimal::new(5, 0), dt())
            .unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.filled_price, Some(Decimal::new(1025, 2)));
        assert_eq!(order.filled_dt, Some(dt()));
    }

    #[test]
    fn terminal_states_block_every_transition() {
        let mut order = sample_order();
        order.expire();
        assert_eq!(order.status, OrderStatus::Expired);
        assert!(order.fill(Decimal::TEN, Decimal::ZERO, dt()).is_err());
        assert!(!order.cancel());
        order.reject();
        assert_eq!(order.status, OrderStatus::Expired);
    }

    #[test]
    fn cancel_only_from_open() {
        let mut order = sample_order();
        assert!(order.cancel());
        assert!(!order.cancel());
        assert_eq!(order.status, OrderStatus::Cancelled);
    }
}
