//! The singleton trading account.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

/// Primary key of the only account row.
pub const ACCOUNT_ID: i64 = 1;

/// Tolerance used when checking the `total_asset` identity.
pub const ASSET_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Account {
    pub cash: f64,
    pub market_value: f64,
    pub frozen_cash: f64,
    pub total_asset: f64,
    /// Trade date of the last daily unlock, if any has run.
    pub settled_on: Option<NaiveDate>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    pub fn new(initial_cash: f64, now: DateTime<Utc>) -> Self {
        Account {
            cash: initial_cash,
            market_value: 0.0,
            frozen_cash: 0.0,
            total_asset: initial_cash,
            settled_on: None,
            updated_at: now,
        }
    }

    /// Replace the market value and re-derive `total_asset`.
    pub fn revalue(&mut self, market_value: f64) {
        self.market_value = market_value;
        self.total_asset = self.cash + market_value;
    }

    pub fn is_consistent(&self) -> bool {
        (self.total_asset - (self.cash + self.market_value)).abs() < ASSET_EPSILON
    }
}
