//! Daily T+1 unlock.
//!
//! Run once per trading day before the first order: every position becomes
//! fully sellable (`avail_vol := total_vol`). The account remembers the last
//! settled trade date, so a repeat run for the same day cannot release
//! shares bought after the first run.

use chrono::NaiveDate;
use serde::Serialize;
use tracing::info;

use super::error::LedgerError;
use crate::ports::calendar_port::CalendarPort;
use crate::ports::ledger_port::LedgerPort;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnlockReport {
    pub trade_date: NaiveDate,
    /// Positions that moved from locked-partial to fully available.
    pub unlocked: usize,
    pub already_settled: bool,
}

impl UnlockReport {
    pub fn settled(trade_date: NaiveDate, unlocked: usize) -> Self {
        UnlockReport {
            trade_date,
            unlocked,
            already_settled: false,
        }
    }

    pub fn already_settled(trade_date: NaiveDate) -> Self {
        UnlockReport {
            trade_date,
            unlocked: 0,
            already_settled: true,
        }
    }
}

/// Settle the current trade date as reported by `calendar`.
pub fn run_daily_unlock(
    ledger: &dyn LedgerPort,
    calendar: &dyn CalendarPort,
) -> Result<UnlockReport, LedgerError> {
    let trade_date = calendar.trade_date();
    let report = ledger.unlock_positions(trade_date)?;
    if report.already_settled {
        info!(%trade_date, "daily unlock skipped, trade date already settled");
    } else {
        info!(%trade_date, unlocked = report.unlocked, "daily unlock complete");
    }
    Ok(report)
}
