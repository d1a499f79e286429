#![allow(dead_code)]

use chrono::NaiveDate;
use papertrader::adapters::calendar_adapter::FixedCalendar;
use papertrader::adapters::sqlite_adapter::SqliteAdapter;
use papertrader::domain::account::{Account, ASSET_EPSILON};
use papertrader::domain::error::PapertraderError;
use papertrader::domain::order::Order;
use papertrader::domain::position::{total_market_value, Position};
use papertrader::domain::settlement::SettlementService;
use papertrader::ports::ledger_port::LedgerPort;
use papertrader::ports::price_port::PricePort;
use std::collections::HashMap;
use std::sync::Arc;

pub struct MockPricePort {
    pub quotes: HashMap<String, f64>,
    pub errors: HashMap<String, String>,
}

impl MockPricePort {
    pub fn new() -> Self {
        Self {
            quotes: HashMap::new(),
            errors: HashMap::new(),
        }
    }

    pub fn with_price(mut self, code: &str, price: f64) -> Self {
        self.quotes.insert(code.to_string(), price);
        self
    }

    pub fn with_error(mut self, code: &str, reason: &str) -> Self {
        self.errors.insert(code.to_string(), reason.to_string());
        self
    }
}

impl PricePort for MockPricePort {
    fn latest_price(&self, code: &str) -> Result<f64, PapertraderError> {
        if let Some(reason) = self.errors.get(code) {
            return Err(PapertraderError::Quote {
                code: code.to_string(),
                reason: reason.clone(),
            });
        }
        self.quotes
            .get(code)
            .copied()
            .ok_or_else(|| PapertraderError::Quote {
                code: code.to_string(),
                reason: "no quote".into(),
            })
    }
}

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

/// Monday 2024-03-04.
pub fn trade_day() -> NaiveDate {
    date(2024, 3, 4)
}

pub fn memory_store() -> Arc<SqliteAdapter> {
    let store = SqliteAdapter::in_memory().unwrap();
    store.initialize_schema().unwrap();
    Arc::new(store)
}

pub fn service_on(
    store: Arc<SqliteAdapter>,
    prices: MockPricePort,
    day: NaiveDate,
) -> SettlementService {
    SettlementService::new(store, Arc::new(prices), Arc::new(FixedCalendar::new(day)))
}

/// In-memory store with an initialised account, plus a service pinned to
/// [`trade_day`].
pub fn funded(cash: f64, prices: MockPricePort) -> (Arc<SqliteAdapter>, SettlementService) {
    let store = memory_store();
    let service = service_on(store.clone(), prices, trade_day());
    service.initialize_account(cash).unwrap();
    (store, service)
}

pub type LedgerState = (Account, Vec<Position>, Vec<Order>);

pub fn ledger_state(store: &dyn LedgerPort) -> LedgerState {
    (
        store.get_account().unwrap(),
        store.get_positions().unwrap(),
        store.get_orders(None).unwrap(),
    )
}

/// Checks every ledger invariant against what is persisted.
pub fn assert_ledger_consistent(store: &dyn LedgerPort) {
    let account = store.get_account().unwrap();
    let positions = store.get_positions().unwrap();

    let expected_total = account.cash + account.market_value;
    assert!(
        (account.total_asset - expected_total).abs() < ASSET_EPSILON,
        "total_asset {} != {}",
        account.total_asset,
        expected_total
    );
    assert!(
        (account.market_value - total_market_value(&positions)).abs() < ASSET_EPSILON,
        "market_value {} out of step with positions",
        account.market_value
    );
    for p in &positions {
        assert!(p.total_vol > 0, "{} persisted with zero volume", p.code);
        assert!(
            0 <= p.avail_vol && p.avail_vol <= p.total_vol,
            "{} avail {} outside 0..={}",
            p.code,
            p.avail_vol,
            p.total_vol
        );
    }
}
