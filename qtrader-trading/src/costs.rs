//! Commission and slippage models applied by the matching engine.

use qtrader_config::{CommissionConfig, SlippageConfig};
use qtrader_core::{Amount, Price, Side};
use rust_decimal::Decimal;

/// Piecewise commission: `max(min_commission, notional * side_rate)` plus
/// `notional * side_tax`.
#[derive(Clone, Debug)]
pub struct CommissionSchedule {
    buy_commission: Decimal,
    sell_commission: Decimal,
    buy_tax: Decimal,
    sell_tax: Decimal,
    min_commission: Decimal,
}

impl CommissionSchedule {
    pub fn new(config: &CommissionConfig) -> Self {
        Self {
            buy_commission: config.buy_commission,
            sell_commission: config.sell_commission,
            buy_tax: config.buy_tax,
            sell_tax: config.sell_tax,
            min_commission: config.min_commission,
        }
    }

    /// Total fee for a fill of `amount` shares at `price`.
    #[must_use]
    pub fn calculate(&self, side: Side, amount: Amount, price: Price) -> Price {
        let notional = price * Decimal::from(amount);
        let (rate, tax_rate) = match side {
            Side::Buy => (self.buy_commission, self.buy_tax),
            Side::Sell => (self.sell_commission, self.sell_tax),
        };
        let commission = (notional * rate).max(self.min_commission);
        commission + notional * tax_rate
    }
}

/// Fixed-rate slippage: buys fill worse by `rate`, sells better by `rate`.
#[derive(Clone, Debug)]
pub struct SlippageModel {
    rate: Decimal,
}

impl SlippageModel {
    pub fn new(config: &SlippageConfig) -> Self {
        Self { rate: config.rate }
    }

    /// The effective fill price after slippage.
    #[must_use]
    pub fn apply(&self, side: Side, price: Price) -> Price {
        match side {
            Side::Buy => price * (Decimal::ONE + self.rate),
            Side::Sell => price * (Decimal::ONE - self.rate),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule() -> CommissionSchedule {
        CommissionSchedule::new(&CommissionConfig::default())
    }

    #[test]
    fn minimum_commission_floors_small_trades() {
        // 100 * 10.00 * 0.0002 = 0.20, floored to 5.00.
        let fee = schedule().calculate(Side::Buy, 100, Decimal::from(10));
        assert_eq!(fee, Decimal::from(5));
    }

    #[test]
    fn sell_tax_is_added_after_the_floor() {
        // Commission floor 5.00 plus 1100 * 0.001 tax.
        let fee = schedule().calculate(Side::Sell, 100, Decimal::from(11));
        assert_eq!(fee, Decimal::new(610, 2));
    }

    #[test]
    fn large_notional_escapes_the_floor() {
        // 100_000 * 10 * 0.0002 = 200.
        let fee = schedule().calculate(Side::Buy, 100_000, Decimal::from(10));
        assert_eq!(fee, Decimal::from(200));
    }

    #[test]
    fn slippage_moves_against_the_taker() {
        let model = SlippageModel::new(&SlippageConfig {
            rate: Decimal::new(1, 3), // 0.001
        });
        assert_eq!(
            model.apply(Side::Buy, Decimal::from(100)),
            Decimal::new(1001, 1)
        );
        assert_eq!(
            model.apply(Side::Sell, Decimal::from(100)),
            Decimal::new(999, 1)
        );
    }
}
