//! Ledger transaction scripts.
//!
//! Storage adapters load a [`LedgerSnapshot`] inside an open transaction,
//! apply one of the operations below, write back what changed and commit.
//! Every operation either returns an error before touching the snapshot or
//! leaves it fully updated, with `total_asset == cash + market_value`.

use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashMap;

use super::account::Account;
use super::error::LedgerError;
use super::order::{Order, OrderAction, OrderRequest};
use super::position::{total_market_value, Position};
use super::unlock::UnlockReport;

/// What an executed order did to the position table.
#[derive(Debug, Clone, PartialEq)]
pub enum PositionChange {
    Upsert(Position),
    Delete(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Execution {
    pub order: Order,
    pub change: PositionChange,
}

/// In-transaction view of the whole ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerSnapshot {
    pub account: Account,
    /// Sorted by code.
    pub positions: Vec<Position>,
}

impl LedgerSnapshot {
    pub fn new(account: Account, mut positions: Vec<Position>) -> Self {
        positions.sort_by(|a, b| a.code.cmp(&b.code));
        LedgerSnapshot { account, positions }
    }

    pub fn position(&self, code: &str) -> Option<&Position> {
        self.positions
            .binary_search_by(|p| p.code.as_str().cmp(code))
            .ok()
            .map(|idx| &self.positions[idx])
    }

    /// Execute a fully-filled BUY or SELL.
    pub fn execute(
        &mut self,
        request: &OrderRequest,
        now: DateTime<Utc>,
    ) -> Result<Execution, LedgerError> {
        request.validate()?;
        let change = match request.action {
            OrderAction::Buy => self.buy(request, now)?,
            OrderAction::Sell => self.sell(request, now)?,
        };
        self.revalue(now);
        Ok(Execution {
            order: Order::filled(request, now),
            change,
        })
    }

    fn buy(&mut self, request: &OrderRequest, now: DateTime<Utc>) -> Result<PositionChange, LedgerError> {
        let cost = request.notional() + request.fee;
        if self.account.cash < cost {
            return Err(LedgerError::InsufficientFunds {
                required: cost,
                available: self.account.cash,
            });
        }

        let position = match self
            .positions
            .binary_search_by(|p| p.code.as_str().cmp(&request.code))
        {
            Ok(idx) => {
                let pos = &mut self.positions[idx];
                pos.add(request.volume, request.price, now)?;
                pos.clone()
            }
            Err(idx) => {
                let pos = Position::open(
                    &request.code,
                    request.name.as_deref(),
                    request.volume,
                    request.price,
                    now,
                );
                self.positions.insert(idx, pos.clone());
                pos
            }
        };
        self.account.cash -= cost;
        Ok(PositionChange::Upsert(position))
    }

    fn sell(&mut self, request: &OrderRequest, now: DateTime<Utc>) -> Result<PositionChange, LedgerError> {
        let idx = self
            .positions
            .binary_search_by(|p| p.code.as_str().cmp(&request.code))
            .map_err(|_| LedgerError::PositionNotFound {
                code: request.code.clone(),
            })?;

        let available = self.positions[idx].avail_vol;
        if available < request.volume {
            return Err(LedgerError::InsufficientAvailableVolume {
                code: request.code.clone(),
                required: request.volume,
                available,
            });
        }

        self.account.cash += request.notional() - request.fee;
        let pos = &mut self.positions[idx];
        pos.reduce(request.volume, now);
        if pos.is_closed() {
            self.positions.remove(idx);
            return Ok(PositionChange::Delete(request.code.clone()));
        }
        Ok(PositionChange::Upsert(pos.clone()))
    }

    /// Mark every held code present in `prices`, then revalue once.
    /// Returns the positions that changed.
    pub fn apply_prices(
        &mut self,
        prices: &HashMap<String, f64>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Position>, LedgerError> {
        for (code, price) in prices {
            if !price.is_finite() || *price <= 0.0 {
                return Err(LedgerError::invalid(format!(
                    "price for {code} must be positive, got {price}"
                )));
            }
        }

        let mut updated = Vec::new();
        for pos in self.positions.iter_mut() {
            if let Some(&price) = prices.get(&pos.code) {
                pos.mark(price, now);
                updated.push(pos.clone());
            }
        }
        self.revalue(now);
        Ok(updated)
    }

    /// Daily T+1 reset. A date at or before the last settlement is a no-op.
    pub fn unlock(&mut self, trade_date: NaiveDate, now: DateTime<Utc>) -> (UnlockReport, Vec<Position>) {
        if let Some(settled) = self.account.settled_on {
            if settled >= trade_date {
                return (UnlockReport::already_settled(trade_date), Vec::new());
            }
        }

        let mut unlocked = Vec::new();
        for pos in self.positions.iter_mut() {
            if pos.unlock(now) {
                unlocked.push(pos.clone());
            }
        }
        self.account.settled_on = Some(trade_date);
        self.account.updated_at = now;
        (UnlockReport::settled(trade_date, unlocked.len()), unlocked)
    }

    /// Overwrite available cash, keeping the asset identity.
    pub fn set_cash(&mut self, cash: f64, now: DateTime<Utc>) -> Result<(), LedgerError> {
        if !cash.is_finite() || cash < 0.0 {
            return Err(LedgerError::invalid(format!(
                "cash must be non-negative, got {cash}"
            )));
        }
        self.account.cash = cash;
        self.revalue(now);
        Ok(())
    }

    /// Drop a holding without trading it.
    pub fn remove(&mut self, code: &str, now: DateTime<Utc>) -> Option<Position> {
        let idx = self
            .positions
            .binary_search_by(|p| p.code.as_str().cmp(code))
            .ok()?;
        let removed = self.positions.remove(idx);
        self.revalue(now);
        Some(removed)
    }

    fn revalue(&mut self, now: DateTime<Utc>) {
        self.account.revalue(total_market_value(&self.positions));
        self.account.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::order::OrderStatus;
    use approx::assert_relative_eq;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn snapshot(cash: f64) -> LedgerSnapshot {
        LedgerSnapshot::new(Account::new(cash, Utc::now()), Vec::new())
    }

    fn request(action: OrderAction, code: &str, price: f64, volume: i64) -> OrderRequest {
        OrderRequest {
            trade_date: date(2024, 3, 4),
            code: code.into(),
            name: None,
            action,
            price,
            volume,
            fee: price * volume as f64 * 0.002,
            note: None,
        }
    }

    #[test]
    fn buy_opens_locked_position() {
        let mut ledger = snapshot(100_000.0);
        let exec = ledger
            .execute(&request(OrderAction::Buy, "AAA", 10.0, 100), Utc::now())
            .unwrap();

        assert_relative_eq!(ledger.account.cash, 98_998.0);
        assert_eq!(exec.order.status, OrderStatus::Filled);
        match exec.change {
            PositionChange::Upsert(pos) => {
                assert_eq!(pos.total_vol, 100);
                assert_eq!(pos.avail_vol, 0);
                assert_relative_eq!(pos.avg_price, 10.0);
            }
            other => panic!("expected upsert, got {other:?}"),
        }
        assert!(ledger.account.is_consistent());
    }

    #[test]
    fn second_buy_averages_cost() {
        let mut ledger = snapshot(100_000.0);
        ledger
            .execute(&request(OrderAction::Buy, "AAA", 10.0, 100), Utc::now())
            .unwrap();
        ledger
            .execute(&request(OrderAction::Buy, "AAA", 13.0, 200), Utc::now())
            .unwrap();
        let pos = ledger.position("AAA").unwrap();
        assert_eq!(pos.total_vol, 300);
        assert_eq!(pos.avail_vol, 0);
        assert_relative_eq!(pos.avg_price, 12.0);
    }

    #[test]
    fn buy_beyond_cash_leaves_snapshot_untouched() {
        let mut ledger = snapshot(1_001.0);
        let before = ledger.clone();
        let err = ledger
            .execute(&request(OrderAction::Buy, "BBB", 10.0, 100), Utc::now())
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientFunds { .. }));
        assert_eq!(ledger, before);
    }

    #[test]
    fn buy_with_exact_cash_succeeds() {
        let mut ledger = snapshot(1_002.0);
        ledger
            .execute(&request(OrderAction::Buy, "AAA", 10.0, 100), Utc::now())
            .unwrap();
        assert_relative_eq!(ledger.account.cash, 0.0);
    }

    #[test]
    fn buy_overflowing_held_volume_is_rejected() {
        let mut ledger = snapshot(100_000.0);
        ledger
            .execute(&request(OrderAction::Buy, "AAA", 1e-15, i64::MAX), Utc::now())
            .unwrap();
        let before = ledger.clone();
        let err = ledger
            .execute(&request(OrderAction::Buy, "AAA", 1.0, 1), Utc::now())
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidOrderParameters { .. }));
        assert_eq!(ledger, before);
    }

    #[test]
    fn new_position_counts_at_cost() {
        let mut ledger = snapshot(100_000.0);
        ledger
            .execute(&request(OrderAction::Buy, "AAA", 10.0, 100), Utc::now())
            .unwrap();
        assert_relative_eq!(ledger.account.market_value, 1_000.0);
        assert_relative_eq!(ledger.account.total_asset, 99_998.0);
    }

    #[test]
    fn sell_without_position_is_not_found() {
        let mut ledger = snapshot(10_000.0);
        let err = ledger
            .execute(&request(OrderAction::Sell, "AAA", 10.0, 100), Utc::now())
            .unwrap_err();
        assert_eq!(err, LedgerError::PositionNotFound { code: "AAA".into() });
    }

    #[test]
    fn sell_before_unlock_is_rejected() {
        let mut ledger = snapshot(10_000.0);
        ledger
            .execute(&request(OrderAction::Buy, "AAA", 10.0, 100), Utc::now())
            .unwrap();
        let before = ledger.clone();
        let err = ledger
            .execute(&request(OrderAction::Sell, "AAA", 10.0, 100), Utc::now())
            .unwrap_err();
        assert_eq!(
            err,
            LedgerError::InsufficientAvailableVolume {
                code: "AAA".into(),
                required: 100,
                available: 0,
            }
        );
        assert_eq!(ledger, before);
    }

    #[test]
    fn full_sell_deletes_position() {
        let mut ledger = snapshot(100_000.0);
        ledger
            .execute(&request(OrderAction::Buy, "AAA", 10.0, 100), Utc::now())
            .unwrap();
        ledger.unlock(date(2024, 3, 5), Utc::now());
        let exec = ledger
            .execute(&request(OrderAction::Sell, "AAA", 12.0, 100), Utc::now())
            .unwrap();
        assert_eq!(exec.change, PositionChange::Delete("AAA".into()));
        assert!(ledger.positions.is_empty());
        assert_relative_eq!(ledger.account.cash, 98_998.0 + 1_197.6, epsilon = 1e-9);
        assert_relative_eq!(ledger.account.total_asset, ledger.account.cash);
    }

    #[test]
    fn partial_sell_keeps_locked_remainder() {
        let mut ledger = snapshot(100_000.0);
        ledger
            .execute(&request(OrderAction::Buy, "AAA", 10.0, 100), Utc::now())
            .unwrap();
        ledger.unlock(date(2024, 3, 5), Utc::now());
        ledger
            .execute(&request(OrderAction::Buy, "AAA", 10.0, 50), Utc::now())
            .unwrap();
        ledger
            .execute(&request(OrderAction::Sell, "AAA", 10.0, 100), Utc::now())
            .unwrap();
        let pos = ledger.position("AAA").unwrap();
        assert_eq!(pos.total_vol, 50);
        assert_eq!(pos.avail_vol, 0);
    }

    #[test]
    fn apply_prices_revalues_once() {
        let mut ledger = snapshot(100_000.0);
        ledger
            .execute(&request(OrderAction::Buy, "AAA", 10.0, 100), Utc::now())
            .unwrap();
        let prices = HashMap::from([("AAA".to_string(), 12.0), ("ZZZ".to_string(), 1.0)]);
        let updated = ledger.apply_prices(&prices, Utc::now()).unwrap();

        assert_eq!(updated.len(), 1);
        assert_relative_eq!(updated[0].profit, 200.0);
        assert_relative_eq!(updated[0].profit_pct, 20.0);
        assert_relative_eq!(ledger.account.market_value, 1_200.0);
        assert_relative_eq!(ledger.account.total_asset, 100_198.0);
    }

    #[test]
    fn apply_prices_rejects_bad_price() {
        let mut ledger = snapshot(100_000.0);
        ledger
            .execute(&request(OrderAction::Buy, "AAA", 10.0, 100), Utc::now())
            .unwrap();
        let before = ledger.clone();
        let prices = HashMap::from([("AAA".to_string(), 12.0), ("BBB".to_string(), -3.0)]);
        assert!(ledger.apply_prices(&prices, Utc::now()).is_err());
        assert_eq!(ledger, before);
    }

    #[test]
    fn unlock_is_once_per_trade_date() {
        let mut ledger = snapshot(100_000.0);
        ledger
            .execute(&request(OrderAction::Buy, "AAA", 10.0, 100), Utc::now())
            .unwrap();
        let (report, changed) = ledger.unlock(date(2024, 3, 5), Utc::now());
        assert_eq!(report.unlocked, 1);
        assert_eq!(changed.len(), 1);

        ledger
            .execute(&request(OrderAction::Buy, "AAA", 10.0, 100), Utc::now())
            .unwrap();
        let (again, _) = ledger.unlock(date(2024, 3, 5), Utc::now());
        assert!(again.already_settled);
        assert_eq!(ledger.position("AAA").unwrap().avail_vol, 100);
    }

    #[test]
    fn set_cash_keeps_identity() {
        let mut ledger = snapshot(100_000.0);
        ledger
            .execute(&request(OrderAction::Buy, "AAA", 10.0, 100), Utc::now())
            .unwrap();
        ledger
            .apply_prices(&HashMap::from([("AAA".to_string(), 11.0)]), Utc::now())
            .unwrap();
        ledger.set_cash(5_000.0, Utc::now()).unwrap();
        assert_relative_eq!(ledger.account.total_asset, 6_100.0);
        assert!(ledger.set_cash(-1.0, Utc::now()).is_err());
    }

    #[test]
    fn remove_revalues() {
        let mut ledger = snapshot(100_000.0);
        ledger
            .execute(&request(OrderAction::Buy, "AAA", 10.0, 100), Utc::now())
            .unwrap();
        ledger
            .apply_prices(&HashMap::from([("AAA".to_string(), 11.0)]), Utc::now())
            .unwrap();
        assert!(ledger.remove("AAA", Utc::now()).is_some());
        assert!(ledger.remove("AAA", Utc::now()).is_none());
        assert_eq!(ledger.account.market_value, 0.0);
        assert!(ledger.account.is_consistent());
    }

    #[test]
    fn new_sorts_positions() {
        let now = Utc::now();
        let ledger = LedgerSnapshot::new(
            Account::new(0.0, now),
            vec![
                Position::open("CCC", None, 1, 1.0, now),
                Position::open("AAA", None, 1, 1.0, now),
            ],
        );
        assert!(ledger.position("AAA").is_some());
        assert!(ledger.position("CCC").is_some());
        assert!(ledger.position("BBB").is_none());
    }
}
