//! SQLite ledger store.
//!
//! Every mutating call opens a `BEGIN IMMEDIATE` transaction, which takes the
//! database write lock before the ledger is read. Writers are therefore
//! serialised across all pooled connections and no two of them can work from
//! the same stale account or position row.

use crate::domain::account::{Account, ACCOUNT_ID};
use crate::domain::error::{LedgerError, PapertraderError};
use crate::domain::ledger::{LedgerSnapshot, PositionChange};
use crate::domain::order::{Order, OrderAction, OrderRequest, OrderStatus};
use crate::domain::position::Position;
use crate::domain::unlock::UnlockReport;
use crate::ports::config_port::ConfigPort;
use crate::ports::ledger_port::LedgerPort;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

const DATE_FORMAT: &str = "%Y-%m-%d";

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS accounts (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        cash REAL NOT NULL,
        market_value REAL NOT NULL DEFAULT 0,
        frozen_cash REAL NOT NULL DEFAULT 0,
        total_asset REAL NOT NULL,
        settled_on TEXT,
        updated_at TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS positions (
        code TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        total_vol INTEGER NOT NULL CHECK (total_vol > 0),
        avail_vol INTEGER NOT NULL CHECK (avail_vol >= 0 AND avail_vol <= total_vol),
        avg_price REAL NOT NULL,
        current_price REAL,
        profit REAL NOT NULL DEFAULT 0,
        profit_pct REAL NOT NULL DEFAULT 0,
        updated_at TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS orders (
        order_id TEXT PRIMARY KEY,
        trade_date TEXT NOT NULL,
        code TEXT NOT NULL,
        action TEXT NOT NULL CHECK (action IN ('BUY', 'SELL')),
        price REAL NOT NULL CHECK (price > 0),
        volume INTEGER NOT NULL CHECK (volume > 0),
        fee REAL NOT NULL CHECK (fee >= 0),
        status TEXT NOT NULL CHECK (status IN ('FILLED', 'CANCELLED')),
        strategy_tag TEXT,
        reason TEXT,
        created_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_orders_created_at ON orders(created_at);
    CREATE INDEX IF NOT EXISTS idx_orders_code ON orders(code);";

pub struct SqliteAdapter {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteAdapter {
    pub fn from_config(config: &dyn ConfigPort) -> Result<Self, PapertraderError> {
        let db_path =
            config
                .get_string("sqlite", "path")
                .ok_or_else(|| PapertraderError::ConfigMissing {
                    section: "sqlite".into(),
                    key: "path".into(),
                })?;

        let pool_size = config.get_int("sqlite", "pool_size", 4).max(1) as u32;
        let busy_timeout =
            Duration::from_millis(config.get_int("sqlite", "busy_timeout_ms", 5_000).max(0) as u64);
        let wal = config.get_bool("sqlite", "wal", true);

        let manager = SqliteConnectionManager::file(&db_path).with_init(move |conn| {
            conn.busy_timeout(busy_timeout)?;
            if wal {
                conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
                    row.get::<_, String>(0)
                })?;
            }
            Ok(())
        });
        let pool = Pool::builder()
            .max_size(pool_size)
            .build(manager)
            .map_err(|e: r2d2::Error| PapertraderError::Ledger(LedgerError::aborted(e)))?;

        Ok(Self { pool })
    }

    pub fn in_memory() -> Result<Self, PapertraderError> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(|e: r2d2::Error| PapertraderError::Ledger(LedgerError::aborted(e)))?;

        Ok(Self { pool })
    }

    pub fn initialize_schema(&self) -> Result<(), LedgerError> {
        let conn = self.conn()?;
        conn.execute_batch(SCHEMA)
            .map_err(|e: rusqlite::Error| LedgerError::aborted(e))?;
        Ok(())
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>, LedgerError> {
        self.pool
            .get()
            .map_err(|e: r2d2::Error| LedgerError::aborted(e))
    }

    /// Run `op` inside one write transaction. Any error drops the
    /// transaction, which rolls it back.
    fn write<T>(
        &self,
        op: impl FnOnce(&Connection) -> Result<T, LedgerError>,
    ) -> Result<T, LedgerError> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e: rusqlite::Error| LedgerError::aborted(e))?;
        let out = op(&*tx)?;
        tx.commit()
            .map_err(|e: rusqlite::Error| LedgerError::aborted(e))?;
        Ok(out)
    }
}

fn timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_error(idx: usize, e: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into())
}

fn get_date(row: &Row<'_>, idx: usize) -> rusqlite::Result<NaiveDate> {
    let s: String = row.get(idx)?;
    NaiveDate::parse_from_str(&s, DATE_FORMAT).map_err(|e| conversion_error(idx, e))
}

fn get_timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn map_account(row: &Row<'_>) -> rusqlite::Result<Account> {
    let settled_on = match row.get::<_, Option<String>>(4)? {
        Some(s) => Some(NaiveDate::parse_from_str(&s, DATE_FORMAT).map_err(|e| conversion_error(4, e))?),
        None => None,
    };
    Ok(Account {
        cash: row.get(0)?,
        market_value: row.get(1)?,
        frozen_cash: row.get(2)?,
        total_asset: row.get(3)?,
        settled_on,
        updated_at: get_timestamp(row, 5)?,
    })
}

fn map_position(row: &Row<'_>) -> rusqlite::Result<Position> {
    Ok(Position {
        code: row.get(0)?,
        name: row.get(1)?,
        total_vol: row.get(2)?,
        avail_vol: row.get(3)?,
        avg_price: row.get(4)?,
        current_price: row.get(5)?,
        profit: row.get(6)?,
        profit_pct: row.get(7)?,
        updated_at: get_timestamp(row, 8)?,
    })
}

fn map_order(row: &Row<'_>) -> rusqlite::Result<Order> {
    let action: String = row.get(3)?;
    let status: String = row.get(7)?;
    Ok(Order {
        order_id: row.get(0)?,
        trade_date: get_date(row, 1)?,
        code: row.get(2)?,
        action: action
            .parse::<OrderAction>()
            .map_err(|e| conversion_error(3, e))?,
        price: row.get(4)?,
        volume: row.get(5)?,
        fee: row.get(6)?,
        status: status
            .parse::<OrderStatus>()
            .map_err(|e| conversion_error(7, e))?,
        strategy_tag: row.get(8)?,
        reason: row.get(9)?,
        created_at: get_timestamp(row, 10)?,
    })
}

const POSITION_COLUMNS: &str =
    "code, name, total_vol, avail_vol, avg_price, current_price, profit, profit_pct, updated_at";

fn load_account(conn: &Connection) -> Result<Option<Account>, LedgerError> {
    conn.query_row(
        "SELECT cash, market_value, frozen_cash, total_asset, settled_on, updated_at
         FROM accounts WHERE id = ?1",
        params![ACCOUNT_ID],
        map_account,
    )
    .optional()
    .map_err(|e: rusqlite::Error| LedgerError::aborted(e))
}

fn load_positions(conn: &Connection) -> Result<Vec<Position>, LedgerError> {
    let query = format!("SELECT {POSITION_COLUMNS} FROM positions ORDER BY code");
    let mut stmt = conn
        .prepare(&query)
        .map_err(|e: rusqlite::Error| LedgerError::aborted(e))?;
    let rows = stmt
        .query_map([], map_position)
        .map_err(|e: rusqlite::Error| LedgerError::aborted(e))?;

    let mut positions = Vec::new();
    for row in rows {
        positions.push(row.map_err(|e: rusqlite::Error| LedgerError::aborted(e))?);
    }
    Ok(positions)
}

fn load_snapshot(conn: &Connection) -> Result<LedgerSnapshot, LedgerError> {
    let account = load_account(conn)?.ok_or(LedgerError::AccountNotInitialized)?;
    Ok(LedgerSnapshot::new(account, load_positions(conn)?))
}

fn save_account(conn: &Connection, account: &Account) -> Result<(), LedgerError> {
    conn.execute(
        "UPDATE accounts
         SET cash = ?1, market_value = ?2, frozen_cash = ?3, total_asset = ?4,
             settled_on = ?5, updated_at = ?6
         WHERE id = ?7",
        params![
            account.cash,
            account.market_value,
            account.frozen_cash,
            account.total_asset,
            account.settled_on.map(|d| d.format(DATE_FORMAT).to_string()),
            timestamp(&account.updated_at),
            ACCOUNT_ID
        ],
    )
    .map_err(|e: rusqlite::Error| LedgerError::aborted(e))?;
    Ok(())
}

fn upsert_position(conn: &Connection, pos: &Position) -> Result<(), LedgerError> {
    conn.execute(
        "INSERT INTO positions (code, name, total_vol, avail_vol, avg_price, current_price,
                                profit, profit_pct, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(code) DO UPDATE SET
             name = excluded.name,
             total_vol = excluded.total_vol,
             avail_vol = excluded.avail_vol,
             avg_price = excluded.avg_price,
             current_price = excluded.current_price,
             profit = excluded.profit,
             profit_pct = excluded.profit_pct,
             updated_at = excluded.updated_at",
        params![
            pos.code,
            pos.name,
            pos.total_vol,
            pos.avail_vol,
            pos.avg_price,
            pos.current_price,
            pos.profit,
            pos.profit_pct,
            timestamp(&pos.updated_at)
        ],
    )
    .map_err(|e: rusqlite::Error| LedgerError::aborted(e))?;
    Ok(())
}

fn delete_position(conn: &Connection, code: &str) -> Result<(), LedgerError> {
    conn.execute("DELETE FROM positions WHERE code = ?1", params![code])
        .map_err(|e: rusqlite::Error| LedgerError::aborted(e))?;
    Ok(())
}

fn insert_order(conn: &Connection, order: &Order) -> Result<(), LedgerError> {
    conn.execute(
        "INSERT INTO orders (order_id, trade_date, code, action, price, volume, fee, status,
                             strategy_tag, reason, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            order.order_id,
            order.trade_date.format(DATE_FORMAT).to_string(),
            order.code,
            order.action.as_str(),
            order.price,
            order.volume,
            order.fee,
            order.status.as_str(),
            order.strategy_tag,
            order.reason,
            timestamp(&order.created_at)
        ],
    )
    .map_err(|e: rusqlite::Error| LedgerError::aborted(e))?;
    Ok(())
}

impl LedgerPort for SqliteAdapter {
    fn initialize_account(&self, initial_cash: f64) -> Result<Account, LedgerError> {
        self.write(|conn| {
            if let Some(existing) = load_account(conn)? {
                return Ok(existing);
            }
            let account = Account::new(initial_cash, Utc::now());
            conn.execute(
                "INSERT INTO accounts (id, cash, market_value, frozen_cash, total_asset, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    ACCOUNT_ID,
                    account.cash,
                    account.market_value,
                    account.frozen_cash,
                    account.total_asset,
                    timestamp(&account.updated_at)
                ],
            )
            .map_err(|e: rusqlite::Error| LedgerError::aborted(e))?;
            debug!(initial_cash, "account row created");
            Ok(account)
        })
    }

    fn get_account(&self) -> Result<Account, LedgerError> {
        let conn = self.conn()?;
        load_account(&conn)?.ok_or(LedgerError::AccountNotInitialized)
    }

    fn get_positions(&self) -> Result<Vec<Position>, LedgerError> {
        let conn = self.conn()?;
        load_positions(&conn)
    }

    fn get_position(&self, code: &str) -> Result<Option<Position>, LedgerError> {
        let conn = self.conn()?;
        let query = format!("SELECT {POSITION_COLUMNS} FROM positions WHERE code = ?1");
        conn.query_row(&query, params![code], map_position)
            .optional()
            .map_err(|e: rusqlite::Error| LedgerError::aborted(e))
    }

    fn get_orders(&self, limit: Option<usize>) -> Result<Vec<Order>, LedgerError> {
        let conn = self.conn()?;
        // LIMIT -1 means no limit in SQLite.
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let mut stmt = conn
            .prepare(
                "SELECT order_id, trade_date, code, action, price, volume, fee, status,
                        strategy_tag, reason, created_at
                 FROM orders
                 ORDER BY created_at DESC, rowid DESC
                 LIMIT ?1",
            )
            .map_err(|e: rusqlite::Error| LedgerError::aborted(e))?;
        let rows = stmt
            .query_map(params![limit], map_order)
            .map_err(|e: rusqlite::Error| LedgerError::aborted(e))?;

        let mut orders = Vec::new();
        for row in rows {
            orders.push(row.map_err(|e: rusqlite::Error| LedgerError::aborted(e))?);
        }
        Ok(orders)
    }

    fn execute_order(&self, request: &OrderRequest) -> Result<Order, LedgerError> {
        request.validate()?;
        self.write(|conn| {
            let mut ledger = load_snapshot(conn)?;
            let execution = ledger.execute(request, Utc::now())?;
            match &execution.change {
                PositionChange::Upsert(pos) => upsert_position(conn, pos)?,
                PositionChange::Delete(code) => delete_position(conn, code)?,
            }
            save_account(conn, &ledger.account)?;
            insert_order(conn, &execution.order)?;
            debug!(
                cash = ledger.account.cash,
                market_value = ledger.account.market_value,
                total_asset = ledger.account.total_asset,
                "account revalued after order"
            );
            Ok(execution.order)
        })
    }

    fn sync_prices(&self, prices: &HashMap<String, f64>) -> Result<usize, LedgerError> {
        if prices.is_empty() {
            return Ok(0);
        }
        self.write(|conn| {
            let mut ledger = load_snapshot(conn)?;
            let updated = ledger.apply_prices(prices, Utc::now())?;
            for pos in &updated {
                upsert_position(conn, pos)?;
            }
            save_account(conn, &ledger.account)?;
            debug!(
                updated = updated.len(),
                market_value = ledger.account.market_value,
                "account revalued after price sync"
            );
            Ok(updated.len())
        })
    }

    fn unlock_positions(&self, trade_date: NaiveDate) -> Result<UnlockReport, LedgerError> {
        self.write(|conn| {
            let mut ledger = load_snapshot(conn)?;
            let (report, unlocked) = ledger.unlock(trade_date, Utc::now());
            if !report.already_settled {
                for pos in &unlocked {
                    upsert_position(conn, pos)?;
                }
                save_account(conn, &ledger.account)?;
            }
            Ok(report)
        })
    }

    fn set_cash(&self, cash: f64) -> Result<Account, LedgerError> {
        self.write(|conn| {
            let mut ledger = load_snapshot(conn)?;
            ledger.set_cash(cash, Utc::now())?;
            save_account(conn, &ledger.account)?;
            Ok(ledger.account)
        })
    }

    fn remove_position(&self, code: &str) -> Result<bool, LedgerError> {
        self.write(|conn| {
            let mut ledger = load_snapshot(conn)?;
            if ledger.remove(code, Utc::now()).is_none() {
                return Ok(false);
            }
            delete_position(conn, code)?;
            save_account(conn, &ledger.account)?;
            Ok(true)
        })
    }
}
