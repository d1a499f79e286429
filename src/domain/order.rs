//! Executed trades: the append-only audit record.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

use super::error::LedgerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderAction {
    Buy,
    Sell,
}

impl OrderAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderAction::Buy => "BUY",
            OrderAction::Sell => "SELL",
        }
    }
}

impl fmt::Display for OrderAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "BUY" => Ok(OrderAction::Buy),
            "SELL" => Ok(OrderAction::Sell),
            other => Err(format!("unknown order action: {other}")),
        }
    }
}

/// `Cancelled` is reserved; nothing in the ledger produces it yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    Filled,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Filled => "FILLED",
            OrderStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "FILLED" => Ok(OrderStatus::Filled),
            "CANCELLED" => Ok(OrderStatus::Cancelled),
            other => Err(format!("unknown order status: {other}")),
        }
    }
}

/// Everything the store needs to execute one trade.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub trade_date: NaiveDate,
    pub code: String,
    /// Display name used when a BUY opens a new position.
    pub name: Option<String>,
    pub action: OrderAction,
    pub price: f64,
    pub volume: i64,
    pub fee: f64,
    /// Strategy tag for a BUY, exit reason for a SELL.
    pub note: Option<String>,
}

impl OrderRequest {
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.code.trim().is_empty() {
            return Err(LedgerError::invalid("code must not be empty"));
        }
        if !self.price.is_finite() || self.price <= 0.0 {
            return Err(LedgerError::invalid(format!(
                "price must be positive, got {}",
                self.price
            )));
        }
        if self.volume <= 0 {
            return Err(LedgerError::invalid(format!(
                "volume must be positive, got {}",
                self.volume
            )));
        }
        if !self.fee.is_finite() || self.fee < 0.0 {
            return Err(LedgerError::invalid(format!(
                "fee must be non-negative, got {}",
                self.fee
            )));
        }
        Ok(())
    }

    pub fn notional(&self) -> f64 {
        self.price * self.volume as f64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Order {
    pub order_id: String,
    pub trade_date: NaiveDate,
    pub code: String,
    pub action: OrderAction,
    pub price: f64,
    pub volume: i64,
    pub fee: f64,
    pub status: OrderStatus,
    pub strategy_tag: Option<String>,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Order {
    /// The FILLED record for an executed request, with a fresh id.
    pub fn filled(request: &OrderRequest, now: DateTime<Utc>) -> Self {
        let (strategy_tag, reason) = match request.action {
            OrderAction::Buy => (request.note.clone(), None),
            OrderAction::Sell => (None, request.note.clone()),
        };
        Order {
            order_id: uuid::Uuid::new_v4().to_string(),
            trade_date: request.trade_date,
            code: request.code.clone(),
            action: request.action,
            price: request.price,
            volume: request.volume,
            fee: request.fee,
            status: OrderStatus::Filled,
            strategy_tag,
            reason,
            created_at: now,
        }
    }
}
