//! Trade-date provider port.

use chrono::NaiveDate;

pub trait CalendarPort {
    /// Trading date stamped on new orders and used for settlement.
    fn trade_date(&self) -> NaiveDate;
}
