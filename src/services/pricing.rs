use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Money amounts carry two decimal places.
pub const MONEY_SCALE: u32 = 2;

pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// Tax and shipping rules applied when an order is created.
#[derive(Debug, Clone, PartialEq)]
pub struct PricingPolicy {
    pub tax_rate: Decimal,
    pub flat_shipping: Decimal,
    /// Subtotals strictly above this ship for free
    pub free_shipping_threshold: Decimal,
}

impl Default for PricingPolicy {
    fn default() -> Self {
        Self {
            tax_rate: dec!(0.15),
            flat_shipping: dec!(10.00),
            free_shipping_threshold: dec!(100.00),
        }
    }
}

/// A line to price: catalog unit price times quantity.
#[derive(Debug, Clone, Copy)]
pub struct PricedLine {
    pub unit_price: Decimal,
    pub quantity: i32,
}

impl PricedLine {
    pub fn line_total(&self) -> Decimal {
        round_money(self.unit_price * Decimal::from(self.quantity))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct OrderTotals {
    pub subtotal: Decimal,
    pub tax: Decimal,
    pub shipping: Decimal,
    pub total: Decimal,
}

impl PricingPolicy {
    pub fn shipping_for(&self, subtotal: Decimal) -> Decimal {
        if subtotal > self.free_shipping_threshold {
            Decimal::ZERO
        } else {
            round_money(self.flat_shipping)
        }
    }

    /// Computes order amounts. `total` is always exactly
    /// `subtotal + tax + shipping` after rounding each part.
    pub fn price(&self, lines: &[PricedLine]) -> OrderTotals {
        let subtotal = round_money(lines.iter().map(PricedLine::line_total).sum());
        let tax = round_money(subtotal * self.tax_rate);
        let shipping = self.shipping_for(subtotal);
        OrderTotals {
            subtotal,
            tax,
            shipping,
            total: subtotal + tax + shipping,
        }
    }
}
