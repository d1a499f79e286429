//! Business-facing ledger entry points.
//!
//! Adds fee computation and advisory pre-checks in front of the ledger store,
//! fetches quotes before any store transaction opens, and hands every failure
//! back to the caller as the store's own [`LedgerError`] kind.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use super::account::Account;
use super::error::LedgerError;
use super::order::{Order, OrderAction, OrderRequest};
use super::position::Position;
use super::unlock::{self, UnlockReport};
use crate::ports::calendar_port::CalendarPort;
use crate::ports::ledger_port::LedgerPort;
use crate::ports::price_port::PricePort;

/// Proportional fee charged on both buy and sell notional.
pub const DEFAULT_FEE_RATE: f64 = 0.002;

pub fn trade_fee(price: f64, volume: i64, fee_rate: f64) -> f64 {
    price * volume as f64 * fee_rate
}

/// Ledger parameters read from the `[ledger]` config section.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerConfig {
    pub initial_cash: f64,
    pub fee_rate: f64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        LedgerConfig {
            initial_cash: 100_000.0,
            fee_rate: DEFAULT_FEE_RATE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncReport {
    /// Held codes a quote was requested for.
    pub requested: usize,
    pub updated: usize,
    pub failed_codes: Vec<String>,
    pub synced_at: DateTime<Utc>,
}

pub struct SettlementService {
    ledger: Arc<dyn LedgerPort + Send + Sync>,
    prices: Arc<dyn PricePort + Send + Sync>,
    calendar: Arc<dyn CalendarPort + Send + Sync>,
    fee_rate: f64,
}

impl SettlementService {
    pub fn new(
        ledger: Arc<dyn LedgerPort + Send + Sync>,
        prices: Arc<dyn PricePort + Send + Sync>,
        calendar: Arc<dyn CalendarPort + Send + Sync>,
    ) -> Self {
        SettlementService {
            ledger,
            prices,
            calendar,
            fee_rate: DEFAULT_FEE_RATE,
        }
    }

    pub fn with_fee_rate(mut self, fee_rate: f64) -> Self {
        self.fee_rate = fee_rate;
        self
    }

    pub fn fee_rate(&self) -> f64 {
        self.fee_rate
    }

    pub fn initialize_account(&self, initial_cash: f64) -> Result<Account, LedgerError> {
        if !initial_cash.is_finite() || initial_cash <= 0.0 {
            return Err(LedgerError::invalid(format!(
                "initial cash must be positive, got {initial_cash}"
            )));
        }
        self.ledger.initialize_account(initial_cash)
    }

    pub fn get_account(&self) -> Result<Account, LedgerError> {
        self.ledger.get_account()
    }

    pub fn get_positions(&self) -> Result<Vec<Position>, LedgerError> {
        self.ledger.get_positions()
    }

    pub fn get_position(&self, code: &str) -> Result<Option<Position>, LedgerError> {
        self.ledger.get_position(code)
    }

    pub fn get_orders(&self, limit: Option<usize>) -> Result<Vec<Order>, LedgerError> {
        self.ledger.get_orders(limit)
    }

    pub fn execute_buy(
        &self,
        code: &str,
        price: f64,
        volume: i64,
        strategy_tag: Option<&str>,
    ) -> Result<Order, LedgerError> {
        self.execute_buy_named(code, None, price, volume, strategy_tag)
    }

    /// Like [`execute_buy`](Self::execute_buy), naming the position if it is new.
    pub fn execute_buy_named(
        &self,
        code: &str,
        name: Option<&str>,
        price: f64,
        volume: i64,
        strategy_tag: Option<&str>,
    ) -> Result<Order, LedgerError> {
        let mut request = self.request(OrderAction::Buy, code, price, volume, strategy_tag);
        request.name = name.map(str::to_string);
        request.validate()?;

        let account = self.ledger.get_account()?;
        let required = request.notional() + request.fee;
        if account.cash < required {
            warn!(code, required, available = account.cash, "buy rejected by pre-check");
            return Err(LedgerError::InsufficientFunds {
                required,
                available: account.cash,
            });
        }

        let order = self.ledger.execute_order(&request)?;
        info!(
            order_id = %order.order_id,
            code,
            volume,
            price,
            fee = order.fee,
            "buy filled"
        );
        Ok(order)
    }

    pub fn execute_sell(
        &self,
        code: &str,
        price: f64,
        volume: i64,
        reason: Option<&str>,
    ) -> Result<Order, LedgerError> {
        let request = self.request(OrderAction::Sell, code, price, volume, reason);
        request.validate()?;

        let position = self
            .ledger
            .get_position(&request.code)?
            .ok_or_else(|| LedgerError::PositionNotFound {
                code: request.code.clone(),
            })?;
        if position.avail_vol < volume {
            warn!(code, volume, available = position.avail_vol, "sell rejected by pre-check");
            return Err(LedgerError::InsufficientAvailableVolume {
                code: request.code.clone(),
                required: volume,
                available: position.avail_vol,
            });
        }

        let order = self.ledger.execute_order(&request)?;
        info!(
            order_id = %order.order_id,
            code,
            volume,
            price,
            fee = order.fee,
            "sell filled"
        );
        Ok(order)
    }

    /// Quote every held code, then apply all prices in one store transaction.
    /// Codes whose quote fails are skipped and reported.
    pub fn sync_latest_prices(&self) -> Result<SyncReport, LedgerError> {
        let codes: Vec<String> = self
            .ledger
            .get_positions()?
            .into_iter()
            .map(|p| p.code)
            .collect();

        let mut prices = HashMap::with_capacity(codes.len());
        let mut failed_codes = Vec::new();
        for (code, quote) in self.prices.latest_prices(&codes) {
            match quote {
                Ok(price) if price.is_finite() && price > 0.0 => {
                    prices.insert(code, price);
                }
                Ok(price) => {
                    warn!(%code, price, "discarding non-positive quote");
                    failed_codes.push(code);
                }
                Err(e) => {
                    warn!(%code, error = %e, "quote unavailable");
                    failed_codes.push(code);
                }
            }
        }
        failed_codes.sort();

        let updated = self.ledger.sync_prices(&prices)?;
        info!(requested = codes.len(), updated, failed = failed_codes.len(), "prices synced");
        Ok(SyncReport {
            requested: codes.len(),
            updated,
            failed_codes,
            synced_at: Utc::now(),
        })
    }

    pub fn run_daily_unlock(&self) -> Result<UnlockReport, LedgerError> {
        unlock::run_daily_unlock(self.ledger.as_ref(), self.calendar.as_ref())
    }

    pub fn set_cash(&self, cash: f64) -> Result<Account, LedgerError> {
        let account = self.ledger.set_cash(cash)?;
        info!(cash, total_asset = account.total_asset, "cash adjusted");
        Ok(account)
    }

    pub fn remove_position(&self, code: &str) -> Result<bool, LedgerError> {
        let removed = self.ledger.remove_position(code)?;
        if removed {
            info!(code, "position removed");
        }
        Ok(removed)
    }

    fn request(
        &self,
        action: OrderAction,
        code: &str,
        price: f64,
        volume: i64,
        note: Option<&str>,
    ) -> OrderRequest {
        OrderRequest {
            trade_date: self.calendar.trade_date(),
            code: code.trim().to_string(),
            name: None,
            action,
            price,
            volume,
            fee: trade_fee(price, volume, self.fee_rate),
            note: note.map(str::to_string),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::PapertraderError;
    use approx::assert_relative_eq;
    use chrono::NaiveDate;
    use std::sync::Mutex;

    /// Store double that records what reaches it.
    struct RecordingLedger {
        account: Option<Account>,
        positions: Vec<Position>,
        executed: Mutex<Vec<OrderRequest>>,
        synced: Mutex<Vec<HashMap<String, f64>>>,
    }

    impl RecordingLedger {
        fn new(cash: Option<f64>) -> Self {
            RecordingLedger {
                account: cash.map(|c| Account::new(c, Utc::now())),
                positions: Vec::new(),
                executed: Mutex::new(Vec::new()),
                synced: Mutex::new(Vec::new()),
            }
        }
    }

    impl LedgerPort for RecordingLedger {
        fn initialize_account(&self, initial_cash: f64) -> Result<Account, LedgerError> {
            Ok(Account::new(initial_cash, Utc::now()))
        }
        fn get_account(&self) -> Result<Account, LedgerError> {
            self.account.clone().ok_or(LedgerError::AccountNotInitialized)
        }
        fn get_positions(&self) -> Result<Vec<Position>, LedgerError> {
            Ok(self.positions.clone())
        }
        fn get_position(&self, code: &str) -> Result<Option<Position>, LedgerError> {
            Ok(self.positions.iter().find(|p| p.code == code).cloned())
        }
        fn get_orders(&self, _limit: Option<usize>) -> Result<Vec<Order>, LedgerError> {
            Ok(Vec::new())
        }
        fn execute_order(&self, request: &OrderRequest) -> Result<Order, LedgerError> {
            self.executed.lock().unwrap().push(request.clone());
            Ok(Order::filled(request, Utc::now()))
        }
        fn sync_prices(&self, prices: &HashMap<String, f64>) -> Result<usize, LedgerError> {
            self.synced.lock().unwrap().push(prices.clone());
            Ok(prices.len())
        }
        fn unlock_positions(&self, trade_date: NaiveDate) -> Result<UnlockReport, LedgerError> {
            Ok(UnlockReport::settled(trade_date, 0))
        }
        fn set_cash(&self, cash: f64) -> Result<Account, LedgerError> {
            Ok(Account::new(cash, Utc::now()))
        }
        fn remove_position(&self, _code: &str) -> Result<bool, LedgerError> {
            Ok(false)
        }
    }

    struct Quotes(HashMap<String, f64>);

    impl PricePort for Quotes {
        fn latest_price(&self, code: &str) -> Result<f64, PapertraderError> {
            self.0.get(code).copied().ok_or_else(|| PapertraderError::Quote {
                code: code.to_string(),
                reason: "no quote".into(),
            })
        }
    }

    struct Pinned;

    impl CalendarPort for Pinned {
        fn trade_date(&self) -> NaiveDate {
            NaiveDate::from_ymd_opt(2024, 3, 4).unwrap()
        }
    }

    fn service(ledger: Arc<RecordingLedger>, quotes: &[(&str, f64)]) -> SettlementService {
        let quotes = quotes.iter().map(|(c, p)| (c.to_string(), *p)).collect();
        SettlementService::new(ledger, Arc::new(Quotes(quotes)), Arc::new(Pinned))
    }

    #[test]
    fn trade_fee_is_proportional() {
        assert_relative_eq!(trade_fee(10.0, 100, DEFAULT_FEE_RATE), 2.0);
        assert_relative_eq!(trade_fee(12.0, 100, DEFAULT_FEE_RATE), 2.4);
    }

    #[test]
    fn buy_passes_fee_and_trade_date_to_store() {
        let ledger = Arc::new(RecordingLedger::new(Some(100_000.0)));
        let svc = service(ledger.clone(), &[]);
        let order = svc.execute_buy("AAA", 10.0, 100, Some("breakout")).unwrap();

        assert_relative_eq!(order.fee, 2.0);
        assert_eq!(order.strategy_tag.as_deref(), Some("breakout"));
        let executed = ledger.executed.lock().unwrap();
        assert_eq!(executed.len(), 1);
        assert_eq!(executed[0].trade_date, NaiveDate::from_ymd_opt(2024, 3, 4).unwrap());
    }

    #[test]
    fn buy_precheck_fails_fast() {
        let ledger = Arc::new(RecordingLedger::new(Some(1_001.0)));
        let svc = service(ledger.clone(), &[]);
        let err = svc.execute_buy("AAA", 10.0, 100, None).unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientFunds { .. }));
        assert!(ledger.executed.lock().unwrap().is_empty());
    }

    #[test]
    fn buy_without_account_is_not_initialized() {
        let ledger = Arc::new(RecordingLedger::new(None));
        let svc = service(ledger, &[]);
        assert_eq!(
            svc.execute_buy("AAA", 10.0, 100, None).unwrap_err(),
            LedgerError::AccountNotInitialized
        );
    }

    #[test]
    fn invalid_parameters_rejected_before_store() {
        let ledger = Arc::new(RecordingLedger::new(Some(1_000.0)));
        let svc = service(ledger.clone(), &[]);
        assert!(matches!(
            svc.execute_sell("AAA", 0.0, 100, None),
            Err(LedgerError::InvalidOrderParameters { .. })
        ));
        assert!(matches!(
            svc.execute_buy("AAA", 10.0, -5, None),
            Err(LedgerError::InvalidOrderParameters { .. })
        ));
        assert!(ledger.executed.lock().unwrap().is_empty());
    }

    #[test]
    fn sell_precheck_needs_available_volume() {
        let mut inner = RecordingLedger::new(Some(0.0));
        inner.positions.push(Position::open("AAA", None, 100, 10.0, Utc::now()));
        let ledger = Arc::new(inner);
        let svc = service(ledger.clone(), &[]);

        let err = svc.execute_sell("AAA", 10.0, 100, Some("exit")).unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientAvailableVolume { available: 0, .. }));
        assert_eq!(
            svc.execute_sell("BBB", 10.0, 1, None).unwrap_err(),
            LedgerError::PositionNotFound { code: "BBB".into() }
        );
        assert!(ledger.executed.lock().unwrap().is_empty());
    }

    #[test]
    fn sync_skips_failed_quotes() {
        let mut inner = RecordingLedger::new(Some(0.0));
        for code in ["AAA", "BBB", "CCC"] {
            inner.positions.push(Position::open(code, None, 100, 10.0, Utc::now()));
        }
        let ledger = Arc::new(inner);
        let svc = service(ledger.clone(), &[("AAA", 11.0), ("CCC", 0.0)]);

        let report = svc.sync_latest_prices().unwrap();
        assert_eq!(report.requested, 3);
        assert_eq!(report.updated, 1);
        assert_eq!(report.failed_codes, vec!["BBB".to_string(), "CCC".to_string()]);
        let synced = ledger.synced.lock().unwrap();
        assert_eq!(synced[0], HashMap::from([("AAA".to_string(), 11.0)]));
    }

    #[test]
    fn custom_fee_rate_applies() {
        let ledger = Arc::new(RecordingLedger::new(Some(100_000.0)));
        let svc = service(ledger, &[]).with_fee_rate(0.001);
        let order = svc.execute_buy("AAA", 10.0, 100, None).unwrap();
        assert_relative_eq!(order.fee, 1.0);
        assert_relative_eq!(svc.fee_rate(), 0.001);
    }

    #[test]
    fn non_positive_initial_cash_rejected() {
        let svc = service(Arc::new(RecordingLedger::new(None)), &[]);
        assert!(svc.initialize_account(-1.0).is_err());
        assert!(matches!(
            svc.initialize_account(0.0),
            Err(LedgerError::InvalidOrderParameters { .. })
        ));
        assert!(svc.initialize_account(50_000.0).is_ok());
    }
}
