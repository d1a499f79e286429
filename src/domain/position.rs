//! Per-instrument holdings and their T+1 availability.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::error::LedgerError;

/// One open holding. A row only exists while `total_vol > 0`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Position {
    pub code: String,
    pub name: String,
    pub total_vol: i64,
    /// Shares eligible for sale today; never above `total_vol`.
    pub avail_vol: i64,
    pub avg_price: f64,
    pub current_price: Option<f64>,
    pub profit: f64,
    pub profit_pct: f64,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    /// A freshly bought holding, valued at its fill price. Nothing is
    /// sellable until the next unlock.
    pub fn open(code: &str, name: Option<&str>, volume: i64, price: f64, now: DateTime<Utc>) -> Self {
        let mut pos = Position {
            code: code.to_string(),
            name: name.unwrap_or(code).to_string(),
            total_vol: volume,
            avail_vol: 0,
            avg_price: price,
            current_price: Some(price),
            profit: 0.0,
            profit_pct: 0.0,
            updated_at: now,
        };
        pos.refresh_profit();
        pos
    }

    /// Add bought shares. `avail_vol` is left alone.
    ///
    /// Fails without touching the position if the new total would not fit
    /// in an `i64`.
    pub fn add(&mut self, volume: i64, price: f64, now: DateTime<Utc>) -> Result<(), LedgerError> {
        let total_vol = self
            .total_vol
            .checked_add(volume)
            .ok_or_else(|| volume_overflow(&self.code, self.total_vol, volume))?;
        self.avg_price = weighted_average_price(self.avg_price, self.total_vol, price, volume);
        self.total_vol = total_vol;
        self.refresh_profit();
        self.updated_at = now;
        Ok(())
    }

    /// Remove sold shares from both the total and the sellable quantity.
    /// Callers check `avail_vol >= volume` first.
    pub fn reduce(&mut self, volume: i64, now: DateTime<Utc>) {
        self.total_vol -= volume;
        self.avail_vol -= volume;
        self.refresh_profit();
        self.updated_at = now;
    }

    /// Record a market price and re-derive profit figures.
    pub fn mark(&mut self, price: f64, now: DateTime<Utc>) {
        self.current_price = Some(price);
        self.refresh_profit();
        self.updated_at = now;
    }

    /// Make every held share sellable. Returns whether anything changed.
    pub fn unlock(&mut self, now: DateTime<Utc>) -> bool {
        if self.avail_vol == self.total_vol {
            return false;
        }
        self.avail_vol = self.total_vol;
        self.updated_at = now;
        true
    }

    pub fn is_closed(&self) -> bool {
        self.total_vol == 0
    }

    /// Holds shares bought since the last unlock.
    pub fn is_locked(&self) -> bool {
        self.avail_vol < self.total_vol
    }

    /// Priced at the last synced price; unpriced holdings count as zero.
    pub fn market_value(&self) -> f64 {
        self.current_price
            .map(|price| price * self.total_vol as f64)
            .unwrap_or(0.0)
    }

    fn refresh_profit(&mut self) {
        let Some(price) = self.current_price else {
            return;
        };
        self.profit = (price - self.avg_price) * self.total_vol as f64;
        self.profit_pct = if self.avg_price > 0.0 {
            (price - self.avg_price) / self.avg_price * 100.0
        } else {
            0.0
        };
    }
}

/// Volume-weighted cost after adding `volume` shares at `price`.
pub fn weighted_average_price(old_avg: f64, old_vol: i64, price: f64, volume: i64) -> f64 {
    let total = old_vol as f64 + volume as f64;
    if total == 0.0 {
        return 0.0;
    }
    (old_avg * old_vol as f64 + price * volume as f64) / total
}

fn volume_overflow(code: &str, held: i64, volume: i64) -> LedgerError {
    LedgerError::invalid(format!(
        "volume {volume} on top of {held} held for {code} exceeds the maximum position size"
    ))
}

/// Sum of `current_price * total_vol` over all holdings.
pub fn total_market_value(positions: &[Position]) -> f64 {
    positions.iter().map(Position::market_value).sum()
}
