//! The matching engine: price selection, risk checks, fills, and daily
//! settlement against the simulated market.

use std::collections::HashMap;

use chrono::NaiveDateTime;
use qtrader_account::{AccountError, Portfolio, PositionManager};
use qtrader_config::AppConfig;
use qtrader_core::{
    CoreError, Order, OrderType, Price, Side, Symbol, SymbolInfo, TickQuote, TradingMode,
    TradingRule,
};
use qtrader_data::DataProvider;
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{info, warn};

use crate::{CommissionSchedule, OrderManager, SlippageModel};

/// Result alias for matching operations.
pub type MatchingResult<T> = Result<T, MatchingError>;

/// Failures inside matching are framework bugs, never strategy errors: the
/// risk gate runs before any mutation, so accounting must not fail after it.
#[derive(Debug, Error)]
pub enum MatchingError {
    #[error(transparent)]
    Account(#[from] AccountError),
    #[error(transparent)]
    Order(#[from] CoreError),
}

/// What the engine decided for one order on one pulse.
enum Outcome {
    /// Fresh order with no actionable price: demote to the resting book.
    Defer,
    /// Resting order untouched this bar.
    Stand,
    Reject(String),
    Fill {
        price: Price,
        commission: Price,
        fill_dt: NaiveDateTime,
    },
}

/// Simulates exchange matching against provider quotes while enforcing
/// market and account risk rules.
pub struct MatchingEngine {
    commission: CommissionSchedule,
    slippage: SlippageModel,
    trading_mode: TradingMode,
    trading_rule: TradingRule,
    margin_rate: Decimal,
    /// Per-day cache of symbol static info; cleared at day start.
    info_cache: HashMap<Symbol, SymbolInfo>,
}

impl MatchingEngine {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            commission: CommissionSchedule::new(&config.matching.commission),
            slippage: SlippageModel::new(&config.matching.slippage),
            trading_mode: config.account.trading_mode,
            trading_rule: config.account.trading_rule,
            margin_rate: config.account.short_margin_rate,
            info_cache: HashMap::new(),
        }
    }

    /// Forget the per-day symbol info cache; called at each day start.
    pub fn clear_day_cache(&mut self) {
        self.info_cache.clear();
    }

    /// Drain the open book once. Fresh orders match against their
    /// submission bar's quote; resting orders against the current one.
    pub fn match_orders(
        &mut self,
        dt: NaiveDateTime,
        orders: &mut OrderManager,
        portfolio: &mut Portfolio,
        positions: &mut PositionManager,
        provider: &dyn DataProvider,
    ) -> MatchingResult<()> {
        let open = orders.open_orders();
        let (fresh, resting): (Vec<_>, Vec<_>) = open.into_iter().partition(|order| order.is_fresh);

        for order in fresh {
            let outcome = self.assess_fresh(&order, provider, portfolio, positions);
            self.apply(order, outcome, orders, portfolio, positions)?;
        }
        for order in resting {
            let outcome = self.assess_resting(&order, dt, provider, portfolio, positions);
            self.apply(order, outcome, orders, portfolio, positions)?;
        }
        Ok(())
    }

    fn cached_info(
        &mut self,
        symbol: &str,
        dt: NaiveDateTime,
        provider: &dyn DataProvider,
    ) -> Option<SymbolInfo> {
        if let Some(info) = self.info_cache.get(symbol) {
            return Some(info.clone());
        }
        let info = provider.symbol_info(symbol, dt.date())?;
        self.info_cache.insert(symbol.to_string(), info.clone());
        Some(info)
    }

    fn assess_fresh(
        &mut self,
        order: &Order,
        provider: &dyn DataProvider,
        portfolio: &Portfolio,
        positions: &PositionManager,
    ) -> Outcome {
        // A brand-new order matches against the quote of the bar that
        // created it, never a later print.
        let price_dt = order.created_dt;
        let Some(quote) = provider.current_price(&order.symbol, price_dt) else {
            return Outcome::Defer;
        };
        let Some(info) = self.cached_info(&order.symbol, price_dt, provider) else {
            return Outcome::Reject(format!("no symbol info for {}", order.symbol));
        };
        if info.is_suspended {
            return Outcome::Reject(format!("{} is suspended", order.symbol));
        }
        if let Some(reason) = at_price_band(order.side, &quote) {
            return Outcome::Reject(reason);
        }

        let current = quote.current_price;
        let match_price = match order.order_type {
            OrderType::Market => match order.side {
                Side::Buy => quote.ask1.unwrap_or(current),
                Side::Sell => quote.bid1.unwrap_or(current),
            },
            OrderType::Limit => {
                let limit = order.limit_price.unwrap_or(current);
                let market = match order.side {
                    Side::Buy => quote.ask1.unwrap_or(current),
                    Side::Sell => quote.bid1.unwrap_or(current),
                };
                let crosses = match order.side {
                    Side::Buy => limit >= market,
                    Side::Sell => limit <= market,
                };
                if !crosses {
                    return Outcome::Defer;
                }
                market
            }
        };

        self.execute(order, match_price, &quote, price_dt, portfolio, positions)
    }

    fn assess_resting(
        &mut self,
        order: &Order,
        dt: NaiveDateTime,
        provider: &dyn DataProvider,
        portfolio: &Portfolio,
        positions: &PositionManager,
    ) -> Outcome {
        let Some(quote) = provider.current_price(&order.symbol, dt) else {
            return Outcome::Stand;
        };
        let Some(info) = self.cached_info(&order.symbol, dt, provider) else {
            return Outcome::Reject(format!("no symbol info for {}", order.symbol));
        };
        // A suspension arriving after the order rested defers it; it will
        // expire at settlement if the halt lasts the day.
        if info.is_suspended {
            return Outcome::Stand;
        }

        let current = quote.current_price;
        let (crosses, match_price) = match order.order_type {
            OrderType::Market => (true, current),
            OrderType::Limit => {
                let limit = order.limit_price.unwrap_or(current);
                let crosses = match order.side {
                    Side::Buy => current <= limit,
                    Side::Sell => current >= limit,
                };
                // Filling at the limit, not the touch, avoids look-ahead
                // from cross-bar prints.
                (crosses, limit)
            }
        };
        if !crosses {
            return Outcome::Stand;
        }

        self.execute(order, match_price, &quote, dt, portfolio, positions)
    }

    fn execute(
        &self,
        order: &Order,
        match_price: Price,
        quote: &TickQuote,
        fill_dt: NaiveDateTime,
        portfolio: &Portfolio,
        positions: &PositionManager,
    ) -> Outcome {
        let final_price = self.slippage.apply(order.side, match_price);

        if let (Some(high), Some(low)) = (quote.high_limit, quote.low_limit) {
            if final_price < low || final_price > high {
                return Outcome::Reject(format!(
                    "slipped price {final_price} outside [{low}, {high}]"
                ));
            }
        }

        let commission = self.commission.calculate(order.side, order.amount, final_price);
        if let Err(reason) = self.check_sufficiency(order, final_price, commission, portfolio, positions)
        {
            return Outcome::Reject(reason);
        }

        Outcome::Fill {
            price: final_price,
            commission,
            fill_dt,
        }
    }

    fn check_sufficiency(
        &self,
        order: &Order,
        price: Price,
        commission: Price,
        portfolio: &Portfolio,
        positions: &PositionManager,
    ) -> Result<(), String> {
        match order.side {
            Side::Buy => {
                let cash_needed = price * Decimal::from(order.amount) + commission;

                let mut margin_released = Decimal::ZERO;
                if let Some(short) = positions.get(&order.symbol, qtrader_core::Direction::Short) {
                    if short.total_amount > 0 {
                        let closable = match self.trading_rule {
                            TradingRule::TPlusOne => short.available_amount,
                            TradingRule::TPlusZero => short.total_amount,
                        };
                        if order.amount > closable {
                            return Err(format!(
                                "insufficient coverable short (closable {closable}, wanted {})",
                                order.amount
                            ));
                        }
                        let cover = order.amount.min(closable);
                        margin_released =
                            short.margin() / Decimal::from(short.total_amount) * Decimal::from(cover);
                    }
                }

                let buying_power = portfolio.available_cash() + margin_released;
                if buying_power >= cash_needed {
                    Ok(())
                } else {
                    Err(format!(
                        "insufficient buying power (needed {cash_needed}, available {buying_power})"
                    ))
                }
            }
            Side::Sell => {
                let available_long = positions
                    .get(&order.symbol, qtrader_core::Direction::Long)
                    .map(|long| long.available_amount)
                    .unwrap_or(0);
                if order.amount <= available_long {
                    return Ok(());
                }

                let opening_short = order.amount - available_long;
                if self.trading_mode == TradingMode::LongShort {
                    let margin_needed =
                        price * Decimal::from(opening_short) * self.margin_rate;
                    if portfolio.available_cash() >= margin_needed {
                        Ok(())
                    } else {
                        Err(format!(
                            "insufficient margin to open short (needed {margin_needed})"
                        ))
                    }
                } else {
                    Err(format!(
                        "insufficient position (wanted {}, available {available_long})",
                        order.amount
                    ))
                }
            }
        }
    }

    fn apply(
        &mut self,
        mut order: Order,
        outcome: Outcome,
        orders: &mut OrderManager,
        portfolio: &mut Portfolio,
        positions: &mut PositionManager,
    ) -> MatchingResult<()> {
        match outcome {
            Outcome::Stand => Ok(()),
            Outcome::Defer => {
                order.mark_resting();
                orders.commit(order);
                Ok(())
            }
            Outcome::Reject(reason) => {
                warn!(
                    order_id = %order.id,
                    symbol = %order.symbol,
                    side = %order.side,
                    amount = order.amount,
                    reason,
                    "order rejected"
                );
                order.reject();
                orders.commit(order);
                Ok(())
            }
            Outcome::Fill {
                price,
                commission,
                fill_dt,
            } => {
                if order.symbol_name.is_none() {
                    order.symbol_name = self
                        .info_cache
                        .get(&order.symbol)
                        .map(|info| info.symbol_name.clone());
                }
                order.fill(price, commission, fill_dt)?;

                let realized = positions.process_trade(
                    &order.symbol,
                    order.symbol_name.as_deref(),
                    order.side,
                    order.amount,
                    price,
                    fill_dt,
                    self.trading_mode,
                )?;

                let gross = price * Decimal::from(order.amount);
                match order.side {
                    Side::Buy => portfolio.cash -= gross + commission,
                    Side::Sell => portfolio.cash += gross - commission,
                }
                portfolio.update_financials(positions);

                info!(
                    order_id = %order.id,
                    symbol = %order.symbol,
                    side = %order.side,
                    amount = order.amount,
                    %price,
                    %realized,
                    "order filled"
                );
                orders.add_filled_to_history(order.clone());
                orders.commit(order);
                Ok(())
            }
        }
    }

    /// End-of-day settlement: mark every position to the closing price,
    /// snapshot the day, roll T+1 availability, then reset the day's book.
    pub fn settle(
        &mut self,
        dt: NaiveDateTime,
        orders: &mut OrderManager,
        portfolio: &mut Portfolio,
        positions: &mut PositionManager,
        provider: &dyn DataProvider,
    ) {
        info!(date = %dt.date(), "daily settlement started");
        let date = dt.date();
        let mut records = Vec::new();

        for position in positions.iter_mut() {
            match provider.current_price(&position.symbol, dt) {
                Some(quote) => {
                    if let Some(record) = position.settle_day(quote.current_price, date) {
                        records.push(record);
                    }
                }
                None => warn!(
                    symbol = %position.symbol,
                    %date,
                    "no closing price available for settlement"
                ),
            }
            if self.trading_rule == TradingRule::TPlusOne {
                position.settle_t1();
            }
        }

        positions.record_daily_snapshot(date, records);
        portfolio.record_history(date, positions);
        orders.daily_reset();
        info!(net_worth = %portfolio.net_worth, "daily settlement complete");
    }
}

fn at_price_band(side: Side, quote: &TickQuote) -> Option<String> {
    match side {
        Side::Buy => {
            if quote.high_limit == Some(quote.current_price) {
                return Some("price already at the upper limit".to_string());
            }
        }
        Side::Sell => {
            if quote.low_limit == Some(quote.current_price) {
                return Some("price already at the lower limit".to_string());
            }
        }
    }
    None
}
