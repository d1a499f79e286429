//! Ledger storage port.
//!
//! Implementations are the only code allowed to mutate the account, the
//! positions and the order history. Each mutating call is one serialisable
//! transaction: it commits completely or leaves storage untouched.

use chrono::NaiveDate;
use std::collections::HashMap;

use crate::domain::account::Account;
use crate::domain::error::LedgerError;
use crate::domain::order::{Order, OrderRequest};
use crate::domain::position::Position;
use crate::domain::unlock::UnlockReport;

pub trait LedgerPort {
    /// Create the singleton account unless it already exists.
    fn initialize_account(&self, initial_cash: f64) -> Result<Account, LedgerError>;

    fn get_account(&self) -> Result<Account, LedgerError>;

    /// All open positions, sorted by code.
    fn get_positions(&self) -> Result<Vec<Position>, LedgerError>;

    fn get_position(&self, code: &str) -> Result<Option<Position>, LedgerError>;

    /// Newest first.
    fn get_orders(&self, limit: Option<usize>) -> Result<Vec<Order>, LedgerError>;

    fn execute_order(&self, request: &OrderRequest) -> Result<Order, LedgerError>;

    /// Returns the number of positions whose price was updated.
    fn sync_prices(&self, prices: &HashMap<String, f64>) -> Result<usize, LedgerError>;

    fn unlock_positions(&self, trade_date: NaiveDate) -> Result<UnlockReport, LedgerError>;

    fn set_cash(&self, cash: f64) -> Result<Account, LedgerError>;

    /// Returns whether a position existed.
    fn remove_position(&self, code: &str) -> Result<bool, LedgerError>;
}
