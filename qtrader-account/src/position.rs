//! Per-(symbol, direction) position lots and their manager.

use std::collections::BTreeMap;

use chrono::{NaiveDate, NaiveDateTime};
use qtrader_core::{Amount, Direction, Price, Side, Symbol, TradingMode, TradingRule};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{AccountError, AccountResult};

/// Key of the position book. One long and one short slot may coexist per
/// symbol.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct PositionKey {
    pub symbol: Symbol,
    pub direction: Direction,
}

/// A single holding. The amount is always non-negative; the sign of market
/// value and PnL comes from `direction`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Position {
    pub symbol: Symbol,
    #[serde(default)]
    pub symbol_name: Option<String>,
    pub direction: Direction,
    pub total_amount: Amount,
    /// Sellable today. Under T+1 this lags `total_amount` by `today_open`.
    pub available_amount: Amount,
    pub today_open_amount: Amount,
    pub avg_cost: Price,
    pub current_price: Price,
    pub last_settle_price: Price,
    /// Accumulated realized PnL from closes against this slot.
    pub realized_pnl: Price,
    pub margin_rate: Decimal,
    pub trading_rule: TradingRule,
    pub init_dt: NaiveDateTime,
    pub last_update_dt: NaiveDateTime,
}

impl Position {
    pub fn new(
        symbol: Symbol,
        symbol_name: Option<String>,
        amount: Amount,
        price: Price,
        dt: NaiveDateTime,
        direction: Direction,
        margin_rate: Decimal,
        trading_rule: TradingRule,
    ) -> Self {
        let available = match trading_rule {
            TradingRule::TPlusZero => amount,
            TradingRule::TPlusOne => 0,
        };
        Self {
            symbol,
            symbol_name,
            direction,
            total_amount: amount,
            available_amount: available,
            today_open_amount: amount,
            avg_cost: price,
            current_price: price,
            last_settle_price: price,
            realized_pnl: Decimal::ZERO,
            margin_rate,
            trading_rule,
            init_dt: dt,
            last_update_dt: dt,
        }
    }

    /// Signed market value; short slots contribute a negative value.
    #[must_use]
    pub fn market_value(&self) -> Price {
        Decimal::from(self.direction.sign()) * Decimal::from(self.total_amount) * self.current_price
    }

    /// Floating PnL against the volume-weighted average cost.
    #[must_use]
    pub fn unrealized_pnl(&self) -> Price {
        let delta = match self.direction {
            Direction::Long => self.current_price - self.avg_cost,
            Direction::Short => self.avg_cost - self.current_price,
        };
        delta * Decimal::from(self.total_amount)
    }

    /// Margin this slot reserves. Only short slots carry margin.
    #[must_use]
    pub fn margin(&self) -> Price {
        match self.direction {
            Direction::Short => {
                (Decimal::from(self.total_amount) * self.current_price).abs() * self.margin_rate
            }
            Direction::Long => Decimal::ZERO,
        }
    }

    pub fn update_price(&mut self, price: Price) {
        self.current_price = price;
    }

    /// Add to the position, re-averaging the cost basis.
    pub fn open(&mut self, amount: Amount, price: Price, dt: NaiveDateTime) {
        let total_cost =
            self.avg_cost * Decimal::from(self.total_amount) + price * Decimal::from(amount);
        self.total_amount += amount;
        self.avg_cost = if self.total_amount > 0 {
            total_cost / Decimal::from(self.total_amount)
        } else {
            Decimal::ZERO
        };
        self.today_open_amount += amount;
        if self.trading_rule == TradingRule::TPlusZero {
            self.available_amount += amount;
        }
        self.last_update_dt = dt;
    }

    /// Reduce the position and return the realized PnL of the closed slice.
    pub fn close(&mut self, amount: Amount, price: Price, dt: NaiveDateTime) -> AccountResult<Price> {
        if amount > self.total_amount {
            return Err(AccountError::CloseExceedsPosition {
                symbol: self.symbol.clone(),
                requested: amount,
                held: self.total_amount,
            });
        }
        let pnl = match self.direction {
            Direction::Long => (price - self.avg_cost) * Decimal::from(amount),
            Direction::Short => (self.avg_cost - price) * Decimal::from(amount),
        };
        self.total_amount -= amount;
        self.available_amount = (self.available_amount - amount).max(0);
        if self.total_amount == 0 {
            self.today_open_amount = 0;
        }
        self.realized_pnl += pnl;
        self.last_update_dt = dt;
        Ok(pnl)
    }

    /// T+1 rollover: today's opens become sellable tomorrow.
    pub fn settle_t1(&mut self) {
        self.available_amount += self.today_open_amount;
        self.today_open_amount = 0;
    }

    /// Mark to the day's close and produce the snapshot row, if the slot is
    /// non-empty.
    pub fn settle_day(
        &mut self,
        close_price: Price,
        date: NaiveDate,
    ) -> Option<DailyPositionRecord> {
        if self.total_amount == 0 {
            self.last_settle_price = close_price;
            self.update_price(close_price);
            return None;
        }

        let prev = self.last_settle_price;
        let sign = Decimal::from(self.direction.sign());
        let daily_pnl = (close_price - prev) * Decimal::from(self.total_amount) * sign;
        self.last_settle_price = close_price;
        self.update_price(close_price);

        let base_value = (self.avg_cost * Decimal::from(self.total_amount)).abs();
        let daily_pnl_ratio = if base_value > Decimal::ZERO {
            daily_pnl / base_value
        } else {
            Decimal::ZERO
        };

        Some(DailyPositionRecord {
            date,
            symbol: self.symbol.clone(),
            symbol_name: self.symbol_name.clone(),
            direction: self.direction,
            amount: self.total_amount,
            avg_cost: self.avg_cost,
            close_price,
            market_value: sign * Decimal::from(self.total_amount) * close_price,
            daily_pnl,
            daily_pnl_ratio,
        })
    }
}

/// One row of a day's position snapshot.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DailyPositionRecord {
    pub date: NaiveDate,
    pub symbol: Symbol,
    #[serde(default)]
    pub symbol_name: Option<String>,
    pub direction: Direction,
    pub amount: Amount,
    pub avg_cost: Price,
    pub close_price: Price,
    pub market_value: Price,
    pub daily_pnl: Price,
    pub daily_pnl_ratio: Decimal,
}

/// All positions snapshotted at one day's close.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DailySnapshot {
    pub date: NaiveDate,
    pub positions: Vec<DailyPositionRecord>,
}

/// Tracks every open position and the per-day snapshot history.
///
/// The book is a `BTreeMap` so iteration (and with it settlement output and
/// CSV rows) is deterministic.
pub struct PositionManager {
    positions: BTreeMap<PositionKey, Position>,
    daily_snapshots: Vec<DailySnapshot>,
    margin_rate: Decimal,
    trading_rule: TradingRule,
}

impl PositionManager {
    pub fn new(margin_rate: Decimal, trading_rule: TradingRule) -> Self {
        Self {
            positions: BTreeMap::new(),
            daily_snapshots: Vec::new(),
            margin_rate,
            trading_rule,
        }
    }

    fn key(symbol: &str, direction: Direction) -> PositionKey {
        PositionKey {
            symbol: symbol.to_string(),
            direction,
        }
    }

    #[must_use]
    pub fn get(&self, symbol: &str, direction: Direction) -> Option<&Position> {
        self.positions.get(&Self::key(symbol, direction))
    }

    pub fn get_mut(&mut self, symbol: &str, direction: Direction) -> Option<&mut Position> {
        self.positions.get_mut(&Self::key(symbol, direction))
    }

    /// All positions in key order.
    pub fn iter(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Position> {
        self.positions.values_mut()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    #[must_use]
    pub fn all(&self) -> Vec<Position> {
        self.positions.values().cloned().collect()
    }

    #[must_use]
    pub fn trading_rule(&self) -> TradingRule {
        self.trading_rule
    }

    /// Apply a fill: close the opposite slot first, then open the same
    /// side with whatever remains. Returns the realized PnL of the closes.
    ///
    /// The caller (the matching engine's risk gate) has already verified
    /// sufficiency, so a partial application is impossible here; any breach
    /// of that assumption surfaces as an error without partial mutation.
    pub fn process_trade(
        &mut self,
        symbol: &str,
        symbol_name: Option<&str>,
        side: Side,
        amount: Amount,
        price: Price,
        dt: NaiveDateTime,
        trading_mode: TradingMode,
    ) -> AccountResult<Price> {
        let mut realized = Decimal::ZERO;
        let mut remaining = amount;

        match side {
            Side::Buy => {
                let mut emptied = false;
                if let Some(short) = self.get_mut(symbol, Direction::Short) {
                    if short.total_amount > 0 {
                        let closable = match short.trading_rule {
                            TradingRule::TPlusOne => short.available_amount,
                            TradingRule::TPlusZero => short.total_amount,
                        };
                        let cover = remaining.min(closable);
                        if cover > 0 {
                            realized += short.close(cover, price, dt)?;
                            remaining -= cover;
                            emptied = short.total_amount == 0;
                        }
                    }
                }
                if emptied {
                    self.positions.remove(&Self::key(symbol, Direction::Short));
                }
                if remaining > 0 {
                    self.open_into(symbol, symbol_name, Direction::Long, remaining, price, dt);
                }
            }
            Side::Sell => {
                let mut emptied = false;
                if let Some(long) = self.get_mut(symbol, Direction::Long) {
                    if long.total_amount > 0 {
                        let sellable = remaining.min(long.available_amount);
                        if sellable > 0 {
                            realized += long.close(sellable, price, dt)?;
                            remaining -= sellable;
                            emptied = long.total_amount == 0;
                        }
                    }
                }
                if emptied {
                    self.positions.remove(&Self::key(symbol, Direction::Long));
                }
                if remaining > 0 {
                    if trading_mode != TradingMode::LongShort {
                        return Err(AccountError::ShortNotPermitted(symbol.to_string()));
                    }
                    self.open_into(symbol, symbol_name, Direction::Short, remaining, price, dt);
                }
            }
        }

        Ok(realized)
    }

    fn open_into(
        &mut self,
        symbol: &str,
        symbol_name: Option<&str>,
        direction: Direction,
        amount: Amount,
        price: Price,
        dt: NaiveDateTime,
    ) {
        let key = Self::key(symbol, direction);
        let margin_rate = self.margin_rate;
        let trading_rule = self.trading_rule;
        let position = self.positions.entry(key).or_insert_with(|| {
            Position::new(
                symbol.to_string(),
                symbol_name.map(str::to_string),
                0,
                price,
                dt,
                direction,
                margin_rate,
                trading_rule,
            )
        });
        position.open(amount, price, dt);
    }

    /// Set or clear a slot outright. Adjusted slots are fully available.
    pub fn adjust(
        &mut self,
        symbol: &str,
        amount: Amount,
        avg_cost: Price,
        symbol_name: Option<&str>,
        direction: Direction,
        dt: NaiveDateTime,
    ) {
        let key = Self::key(symbol, direction);
        if amount <= 0 {
            self.positions.remove(&key);
        } else {
            let margin_rate = self.margin_rate;
            let trading_rule = self.trading_rule;
            let position = self.positions.entry(key).or_insert_with(|| {
                Position::new(
                    symbol.to_string(),
                    symbol_name.map(str::to_string),
                    0,
                    avg_cost,
                    dt,
                    direction,
                    margin_rate,
                    trading_rule,
                )
            });
            position.total_amount = amount;
            position.avg_cost = avg_cost;
            position.current_price = avg_cost;
            position.last_settle_price = avg_cost;
            position.available_amount = amount;
            position.today_open_amount = 0;
            position.last_update_dt = dt;
            if let Some(name) = symbol_name {
                position.symbol_name = Some(name.to_string());
            }
        }
        info!(symbol, %direction, amount, "position adjusted");
    }

    /// Record a day's snapshot, replacing an earlier one for the same date.
    pub fn record_daily_snapshot(&mut self, date: NaiveDate, positions: Vec<DailyPositionRecord>) {
        self.daily_snapshots.retain(|snap| snap.date != date);
        self.daily_snapshots.push(DailySnapshot { date, positions });
    }

    #[must_use]
    pub fn daily_snapshots(&self) -> &[DailySnapshot] {
        &self.daily_snapshots
    }

    /// The latest snapshot strictly before `date`.
    #[must_use]
    pub fn snapshot_before(&self, date: NaiveDate) -> Option<&DailySnapshot> {
        self.daily_snapshots
            .iter()
            .filter(|snap| snap.date < date)
            .max_by_key(|snap| snap.date)
    }

    pub fn restore_positions(&mut self, positions: Vec<Position>) {
        self.positions = positions
            .into_iter()
            .map(|pos| (Self::key(&pos.symbol, pos.direction), pos))
            .collect();
    }

    pub fn restore_daily_snapshots(&mut self, snapshots: Vec<DailySnapshot>) {
        self.daily_snapshots = snapshots;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn dt() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 4)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap()
    }

    fn manager() -> PositionManager {
        PositionManager::new(Decimal::new(2, 1), TradingRule::TPlusOne)
    }

    #[test]
    fn t1_availability_follows_opens_and_settle() {
        let mut pos = Position::new(
            "600519.SH".into(),
            None,
            100,
            Decimal::from(10),
            dt(),
            Direction::Long,
            Decimal::new(2, 1),
            TradingRule::TPlusOne,
        );
        assert_eq!(pos.available_amount, 0);
        assert_eq!(pos.available_amount + pos.today_open_amount, pos.total_amount);

        pos.settle_t1();
        assert_eq!(pos.available_amount, 100);
        assert_eq!(pos.today_open_amount, 0);

        pos.open(40, Decimal::from(12), dt());
        assert_eq!(pos.total_amount, 140);
        assert_eq!(pos.available_amount, 100);
        assert_eq!(pos.available_amount + pos.today_open_amount, pos.total_amount);
    }

    #[test]
    fn open_reaverages_cost_basis() {
        let mut pos = Position::new(
            "600519.SH".into(),
            None,
            100,
            Decimal::from(10),
            dt(),
            Direction::Long,
            Decimal::new(2, 1),
            TradingRule::TPlusZero,
        );
        pos.open(100, Decimal::from(12), dt());
        assert_eq!(pos.avg_cost, Decimal::from(11));
        assert_eq!(pos.total_amount, 200);
    }

    #[test]
    fn close_books_realized_pnl_per_direction() {
        let mut long = Position::new(
            "600519.SH".into(),
            None,
            100,
            Decimal::from(10),
            dt(),
            Direction::Long,
            Decimal::new(2, 1),
            TradingRule::TPlusZero,
        );
        let pnl = long.close(100, Decimal::from(11), dt()).unwrap();
        assert_eq!(pnl, Decimal::from(100));
        assert_eq!(long.realized_pnl, Decimal::from(100));

        let mut short = Position::new(
            "600519.SH".into(),
            None,
            100,
            Decimal::from(10),
            dt(),
            Direction::Short,
            Decimal::new(2, 1),
            TradingRule::TPlusZero,
        );
        let pnl = short.close(100, Decimal::from(9), dt()).unwrap();
        assert_eq!(pnl, Decimal::from(100));
    }

    #[test]
    fn buy_covers_short_before_opening_long() {
        let mut pm = PositionManager::new(Decimal::new(2, 1), TradingRule::TPlusZero);
        pm.process_trade(
            "600519.SH",
            None,
            Side::Sell,
            100,
            Decimal::from(10),
            dt(),
            TradingMode::LongShort,
        )
        .unwrap();
        assert!(pm.get("600519.SH", Direction::Short).is_some());

        // Buy 150: covers the 100 short at 9 (pnl +100) and opens 50 long.
        let realized = pm
            .process_trade(
                "600519.SH",
                None,
                Side::Buy,
                150,
                Decimal::from(9),
                dt(),
                TradingMode::LongShort,
            )
            .unwrap();
        assert_eq!(realized, Decimal::from(100));
        assert!(pm.get("600519.SH", Direction::Short).is_none());
        assert_eq!(pm.get("600519.SH", Direction::Long).unwrap().total_amount, 50);
    }

    #[test]
    fn zeroed_slot_is_removed_from_the_book() {
        let mut pm = PositionManager::new(Decimal::new(2, 1), TradingRule::TPlusZero);
        pm.process_trade(
            "600519.SH",
            None,
            Side::Buy,
            100,
            Decimal::from(10),
            dt(),
            TradingMode::LongOnly,
        )
        .unwrap();
        pm.process_trade(
            "600519.SH",
            None,
            Side::Sell,
            100,
            Decimal::from(11),
            dt(),
            TradingMode::LongOnly,
        )
        .unwrap();
        assert!(pm.is_empty());
    }

    #[test]
    fn naked_sell_in_long_only_is_an_error() {
        let mut pm = PositionManager::new(Decimal::new(2, 1), TradingRule::TPlusZero);
        let result = pm.process_trade(
            "600519.SH",
            None,
            Side::Sell,
            100,
            Decimal::from(10),
            dt(),
            TradingMode::LongOnly,
        );
        assert!(matches!(result, Err(AccountError::ShortNotPermitted(_))));
        assert!(pm.is_empty());
    }

    #[test]
    fn snapshot_before_picks_latest_earlier_day() {
        let mut pm = manager();
        let d = |day| NaiveDate::from_ymd_opt(2024, 1, day).unwrap();
        pm.record_daily_snapshot(d(10), vec![]);
        pm.record_daily_snapshot(d(12), vec![]);
        pm.record_daily_snapshot(d(15), vec![]);
        assert_eq!(pm.snapshot_before(d(15)).unwrap().date, d(12));
        assert!(pm.snapshot_before(d(10)).is_none());
    }

    #[test]
    fn settle_day_reports_signed_market_value() {
        let mut pos = Position::new(
            "600519.SH".into(),
            None,
            100,
            Decimal::from(10),
            dt(),
            Direction::Short,
            Decimal::new(2, 1),
            TradingRule::TPlusOne,
        );
        let record = pos
            .settle_day(Decimal::from(9), NaiveDate::from_ymd_opt(2024, 3, 4).unwrap())
            .unwrap();
        assert_eq!(record.market_value, Decimal::from(-900));
        assert_eq!(record.daily_pnl, Decimal::from(100));
    }
}
