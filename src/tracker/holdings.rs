//! Portfolio positions and per-symbol update payloads.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

/// One position in the portfolio. `cost_basis` is the average cost per
/// unit in `currency`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HoldingPosition {
    pub symbol: String,
    pub quantity: Decimal,
    pub cost_basis: Decimal,
    pub currency: String,
}

impl HoldingPosition {
    pub fn new(symbol: impl Into<String>, quantity: Decimal, cost_basis: Decimal) -> Self {
        Self {
            symbol: symbol.into().to_uppercase(),
            quantity,
            cost_basis,
            currency: "USD".to_string(),
        }
    }

    pub fn with_currency(mut self, currency: impl Into<String>) -> Self {
        self.currency = currency.into();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.symbol.is_empty() {
            return Err(Error::invalid_config("holding symbol must not be empty"));
        }
        if self.quantity.is_sign_negative() {
            return Err(Error::invalid_config("holding quantity must not be negative"));
        }
        if self.cost_basis.is_sign_negative() {
            return Err(Error::invalid_config("cost basis must not be negative"));
        }
        Ok(())
    }

    pub fn total_cost(&self) -> Decimal {
        self.quantity * self.cost_basis
    }
}

/// Valuation of one holding at a price observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HoldingUpdate {
    pub symbol: String,
    pub quantity: Decimal,
    pub price: Decimal,
    pub market_value: Decimal,
    pub unrealized_pnl: Decimal,
    pub unrealized_pnl_percent: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_percent_24h: Option<Decimal>,
    pub timestamp: DateTime<Utc>,
}

impl HoldingUpdate {
    /// Value `holding` at `price`.
    pub fn from_price(
        holding: &HoldingPosition,
        price: Decimal,
        change_percent_24h: Option<Decimal>,
    ) -> Self {
        let market_value = holding.quantity * price;
        let cost = holding.total_cost();
        let unrealized_pnl = market_value - cost;
        let unrealized_pnl_percent = if cost.is_zero() {
            Decimal::ZERO
        } else {
            unrealized_pnl / cost * Decimal::ONE_HUNDRED
        };
        Self {
            symbol: holding.symbol.clone(),
            quantity: holding.quantity,
            price,
            market_value,
            unrealized_pnl,
            unrealized_pnl_percent,
            change_percent_24h,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_holding_validation() {
        assert!(HoldingPosition::new("BTC", dec!(1), dec!(40000)).validate().is_ok());
        assert!(HoldingPosition::new("", dec!(1), dec!(1)).validate().is_err());
        assert!(HoldingPosition::new("BTC", dec!(-1), dec!(1)).validate().is_err());
        assert!(HoldingPosition::new("BTC", dec!(1), dec!(-1)).validate().is_err());
    }

    #[test]
    fn test_symbol_normalized() {
        let holding = HoldingPosition::new("btc", dec!(2), dec!(30000));
        assert_eq!(holding.symbol, "BTC");
        assert_eq!(holding.total_cost(), dec!(60000));
    }

    #[test]
    fn test_update_valuation() {
        let holding = HoldingPosition::new("BTC", dec!(2), dec!(40000));
        let update = HoldingUpdate::from_price(&holding, dec!(50000), Some(dec!(1.5)));

        assert_eq!(update.market_value, dec!(100000));
        assert_eq!(update.unrealized_pnl, dec!(20000));
        assert_eq!(update.unrealized_pnl_percent, dec!(25));
        assert_eq!(update.change_percent_24h, Some(dec!(1.5)));
    }

    #[test]
    fn test_update_zero_cost() {
        let holding = HoldingPosition::new("AIR", dec!(10), dec!(0));
        let update = HoldingUpdate::from_price(&holding, dec!(5), None);
        assert_eq!(update.unrealized_pnl, dec!(50));
        assert_eq!(update.unrealized_pnl_percent, dec!(0));
    }
}
