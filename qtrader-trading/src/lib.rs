//! Order lifecycle management: submission, the open book, and the
//! append-only filled history.

pub mod costs;
pub mod matching;

use chrono::NaiveDateTime;
use qtrader_core::{Amount, Order, OrderId, OrderStatus, OrderType, Price, Side};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub use costs::{CommissionSchedule, SlippageModel};
pub use matching::MatchingEngine;

/// Serializable state of the order manager, persisted in the snapshot
/// envelope.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct OrderManagerState {
    pub orders: Vec<Order>,
    pub next_seq: u64,
}

/// Owns today's order book and the cross-day filled history.
///
/// The two containers are deliberately separate: the nightly reset clears
/// today's book while the filled history survives pause, resume, and (in
/// truncated form) fork.
pub struct OrderManager {
    today: Vec<Order>,
    history: Vec<Order>,
    next_seq: u64,
    lot_size: i64,
}

impl OrderManager {
    pub fn new(lot_size: i64) -> Self {
        Self {
            today: Vec::new(),
            history: Vec::new(),
            next_seq: 1,
            lot_size: lot_size.max(1),
        }
    }

    fn next_id(&mut self) -> OrderId {
        let id = format!("O-{:06}", self.next_seq);
        self.next_seq += 1;
        id
    }

    /// Submit a new order. The sign of `amount` selects the side; the
    /// absolute value is normalized down to a whole number of lots.
    ///
    /// Returns `None` (nothing stored) when the submission is rejected
    /// outright: zero quantity, an amount below one lot, or a limit order
    /// without a positive price.
    pub fn submit(
        &mut self,
        symbol: &str,
        amount: Amount,
        order_type: OrderType,
        limit_price: Option<Price>,
        symbol_name: Option<&str>,
        created_dt: NaiveDateTime,
        created_bar_dt: NaiveDateTime,
    ) -> Option<OrderId> {
        if amount == 0 {
            warn!(symbol, "rejected submission: zero quantity");
            return None;
        }
        if order_type == OrderType::Limit {
            match limit_price {
                Some(price) if price > Price::ZERO => {}
                _ => {
                    warn!(symbol, "rejected submission: limit order without a positive price");
                    return None;
                }
            }
        }

        let side = Side::from_signed(amount);
        let requested = amount.abs();
        let normalized = (requested / self.lot_size) * self.lot_size;
        if normalized == 0 {
            warn!(
                symbol,
                requested,
                lot_size = self.lot_size,
                "rejected submission: below one lot"
            );
            return None;
        }
        if normalized != requested {
            info!(
                symbol,
                requested, normalized, "submission trimmed to whole lots"
            );
        }

        let id = self.next_id();
        let order = Order {
            id: id.clone(),
            symbol: symbol.to_string(),
            symbol_name: symbol_name.map(str::to_string),
            amount: normalized,
            side,
            order_type,
            limit_price,
            status: OrderStatus::Open,
            created_dt,
            created_bar_dt,
            filled_dt: None,
            filled_price: None,
            commission: None,
            is_fresh: true,
        };
        info!(
            order_id = %id,
            symbol,
            %side,
            amount = normalized,
            order_type = %order_type,
            "order submitted"
        );
        self.today.push(order);
        Some(id)
    }

    /// Cancel an open order. Returns false for unknown ids or terminal
    /// orders.
    pub fn cancel(&mut self, order_id: &str) -> bool {
        match self.today.iter_mut().find(|order| order.id == order_id) {
            Some(order) => {
                if order.cancel() {
                    info!(order_id, "order cancelled");
                    true
                } else {
                    warn!(order_id, status = %order.status, "cancel refused");
                    false
                }
            }
            None => {
                warn!(order_id, "cancel refused: unknown order id");
                false
            }
        }
    }

    /// Clones of every order still open, in submission order.
    #[must_use]
    pub fn open_orders(&self) -> Vec<Order> {
        self.today
            .iter()
            .filter(|order| order.status == OrderStatus::Open)
            .cloned()
            .collect()
    }

    /// Orders filled today, in submission order.
    #[must_use]
    pub fn filled_today(&self) -> Vec<Order> {
        self.today
            .iter()
            .filter(|order| order.status == OrderStatus::Filled)
            .cloned()
            .collect()
    }

    /// The append-only filled history (earlier days first).
    #[must_use]
    pub fn history(&self) -> &[Order] {
        &self.history
    }

    /// Every known order: the filled history followed by today's orders,
    /// with today's state winning on id collisions.
    #[must_use]
    pub fn all_known(&self) -> Vec<Order> {
        let mut merged: Vec<Order> = Vec::with_capacity(self.history.len() + self.today.len());
        for order in &self.history {
            if !self.today.iter().any(|today| today.id == order.id) {
                merged.push(order.clone());
            }
        }
        merged.extend(self.today.iter().cloned());
        merged
    }

    /// Write back an order mutated by the matching engine.
    pub fn commit(&mut self, updated: Order) {
        if let Some(slot) = self.today.iter_mut().find(|order| order.id == updated.id) {
            *slot = updated;
        }
    }

    /// Record a fill into the cross-day history.
    pub fn add_filled_to_history(&mut self, order: Order) {
        self.history.push(order);
    }

    /// Expire every still-open order in today's book.
    pub fn expire_open(&mut self) {
        for order in &mut self.today {
            order.expire();
        }
    }

    /// Nightly reset: still-open orders expire and today's book is cleared.
    /// Filled orders were already appended to the history at fill time.
    pub fn daily_reset(&mut self) {
        self.expire_open();
        self.today.clear();
    }

    /// Snapshot for persistence.
    #[must_use]
    pub fn state(&self) -> OrderManagerState {
        OrderManagerState {
            orders: self.all_known(),
            next_seq: self.next_seq,
        }
    }

    /// Rebuild from a persisted snapshot: filled orders go to the history,
    /// everything else back into today's book.
    pub fn restore(&mut self, state: OrderManagerState) {
        self.history.clear();
        self.today.clear();
        let mut max_seq = 0;
        for order in state.orders {
            if let Some(seq) = parse_seq(&order.id) {
                max_seq = max_seq.max(seq);
            }
            if order.status == OrderStatus::Filled {
                self.history.push(order);
            } else {
                self.today.push(order);
            }
        }
        self.next_seq = state.next_seq.max(max_seq + 1);
    }
}

fn parse_seq(id: &str) -> Option<u64> {
    id.strip_prefix("O-").and_then(|tail| tail.parse().ok())
}
