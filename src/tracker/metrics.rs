//! Portfolio metrics snapshots.
//!
//! Valuation and return arithmetic lives here; risk statistics
//! (volatility, Sharpe, drawdown) are a collaborator's concern and the
//! snapshot only carries slots for them.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::feeds::PriceTick;
use crate::tracker::holdings::HoldingPosition;

/// Immutable portfolio valuation snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioMetrics {
    pub timestamp: DateTime<Utc>,
    pub total_value: Decimal,
    pub total_cost: Decimal,
    pub total_return: Decimal,
    pub return_percentage: Decimal,
    /// Value change since the tracking baseline
    pub daily_pnl: Decimal,
    pub daily_pnl_percentage: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volatility: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sharpe_ratio: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_drawdown: Option<Decimal>,
    /// Market value per symbol
    pub allocations: BTreeMap<String, Decimal>,
}

impl PortfolioMetrics {
    /// Allocation weight of `symbol` as a percentage of total value.
    pub fn allocation_percent(&self, symbol: &str) -> Option<Decimal> {
        if self.total_value.is_zero() {
            return None;
        }
        self.allocations
            .get(symbol)
            .map(|v| v / self.total_value * Decimal::ONE_HUNDRED)
    }
}

/// Computes snapshots from holdings and a price cache.
pub trait MetricsEngine: Send + Sync {
    fn compute_snapshot(
        &self,
        holdings: &[HoldingPosition],
        prices: &HashMap<String, PriceTick>,
        baseline_value: Option<Decimal>,
    ) -> PortfolioMetrics;
}

/// Valuation-only engine. Holdings without a price observation are
/// carried at cost so they contribute zero return.
#[derive(Debug, Clone, Default)]
pub struct BasicMetricsEngine;

impl MetricsEngine for BasicMetricsEngine {
    fn compute_snapshot(
        &self,
        holdings: &[HoldingPosition],
        prices: &HashMap<String, PriceTick>,
        baseline_value: Option<Decimal>,
    ) -> PortfolioMetrics {
        let mut total_value = Decimal::ZERO;
        let mut total_cost = Decimal::ZERO;
        let mut allocations = BTreeMap::new();

        for holding in holdings {
            let price = prices
                .get(&holding.symbol)
                .map(|t| t.price)
                .unwrap_or(holding.cost_basis);
            let value = holding.quantity * price;
            total_value += value;
            total_cost += holding.total_cost();
            *allocations.entry(holding.symbol.clone()).or_insert(Decimal::ZERO) += value;
        }

        let total_return = total_value - total_cost;
        let return_percentage = if total_cost.is_zero() {
            Decimal::ZERO
        } else {
            total_return / total_cost * Decimal::ONE_HUNDRED
        };
        let (daily_pnl, daily_pnl_percentage) = match baseline_value {
            Some(base) if !base.is_zero() => {
                let pnl = total_value - base;
                (pnl, pnl / base * Decimal::ONE_HUNDRED)
            }
            Some(base) => (total_value - base, Decimal::ZERO),
            None => (Decimal::ZERO, Decimal::ZERO),
        };

        PortfolioMetrics {
            timestamp: Utc::now(),
            total_value,
            total_cost,
            total_return,
            return_percentage,
            daily_pnl,
            daily_pnl_percentage,
            volatility: None,
            sharpe_ratio: None,
            max_drawdown: None,
            allocations,
        }
    }
}
