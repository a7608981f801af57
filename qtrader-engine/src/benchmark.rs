//! Daily tracking of the configured benchmark symbol.

use chrono::{NaiveDate, NaiveDateTime};
use qtrader_core::{Price, Symbol};
use qtrader_data::DataProvider;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// One benchmark observation at a day's close.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BenchmarkPoint {
    pub date: NaiveDate,
    pub close: Price,
    pub returns: Decimal,
}

/// Records the benchmark's closing series alongside the equity history so
/// reports can overlay the two. Its history truncates on fork exactly like
/// the portfolio's.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct BenchmarkTracker {
    pub symbol: Option<Symbol>,
    pub initial_close: Option<Price>,
    pub history: Vec<BenchmarkPoint>,
}

impl BenchmarkTracker {
    pub fn new(symbol: Option<Symbol>) -> Self {
        Self {
            symbol,
            initial_close: None,
            history: Vec::new(),
        }
    }

    /// Append the day's close; called once per settlement.
    pub fn update_daily(&mut self, dt: NaiveDateTime, provider: &dyn DataProvider) {
        let Some(symbol) = &self.symbol else {
            return;
        };
        let date = dt.date();
        if self.history.iter().any(|point| point.date == date) {
            return;
        }
        let Some(quote) = provider.current_price(symbol, dt) else {
            warn!(%symbol, %date, "no benchmark close for the day");
            return;
        };
        let close = quote.current_price;
        let initial = *self.initial_close.get_or_insert(close);
        let returns = if initial.is_zero() {
            Decimal::ZERO
        } else {
            close / initial - Decimal::ONE
        };
        self.history.push(BenchmarkPoint {
            date,
            close,
            returns,
        });
    }

    /// Drop every point on or after `date` (the fork truncation rule).
    pub fn truncate_from(&mut self, date: NaiveDate) {
        self.history.retain(|point| point.date < date);
    }
}
