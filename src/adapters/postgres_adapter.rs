//! PostgreSQL ledger store.
//!
//! Mutations lock the singleton account row with `SELECT ... FOR UPDATE`
//! before reading positions. Every writer goes through that row, so
//! concurrent writers queue behind each other instead of interleaving.

use crate::domain::account::{Account, ACCOUNT_ID};
use crate::domain::error::{LedgerError, PapertraderError};
use crate::domain::ledger::{LedgerSnapshot, PositionChange};
use crate::domain::order::{Order, OrderAction, OrderRequest, OrderStatus};
use crate::domain::position::Position;
use crate::domain::unlock::UnlockReport;
use crate::ports::config_port::ConfigPort;
use crate::ports::ledger_port::LedgerPort;
use chrono::{NaiveDate, Utc};
use postgres::{GenericClient, NoTls, Row, Transaction};
use r2d2::{Pool, PooledConnection};
use r2d2_postgres::PostgresConnectionManager;
use std::collections::HashMap;
use tracing::debug;

type Manager = PostgresConnectionManager<NoTls>;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS accounts (
        id BIGINT PRIMARY KEY CHECK (id = 1),
        cash DOUBLE PRECISION NOT NULL,
        market_value DOUBLE PRECISION NOT NULL DEFAULT 0,
        frozen_cash DOUBLE PRECISION NOT NULL DEFAULT 0,
        total_asset DOUBLE PRECISION NOT NULL,
        settled_on DATE,
        updated_at TIMESTAMPTZ NOT NULL
    );
    CREATE TABLE IF NOT EXISTS positions (
        code TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        total_vol BIGINT NOT NULL CHECK (total_vol > 0),
        avail_vol BIGINT NOT NULL CHECK (avail_vol >= 0 AND avail_vol <= total_vol),
        avg_price DOUBLE PRECISION NOT NULL,
        current_price DOUBLE PRECISION,
        profit DOUBLE PRECISION NOT NULL DEFAULT 0,
        profit_pct DOUBLE PRECISION NOT NULL DEFAULT 0,
        updated_at TIMESTAMPTZ NOT NULL
    );
    CREATE TABLE IF NOT EXISTS orders (
        seq BIGSERIAL UNIQUE,
        order_id TEXT PRIMARY KEY,
        trade_date DATE NOT NULL,
        code TEXT NOT NULL,
        action TEXT NOT NULL CHECK (action IN ('BUY', 'SELL')),
        price DOUBLE PRECISION NOT NULL CHECK (price > 0),
        volume BIGINT NOT NULL CHECK (volume > 0),
        fee DOUBLE PRECISION NOT NULL CHECK (fee >= 0),
        status TEXT NOT NULL CHECK (status IN ('FILLED', 'CANCELLED')),
        strategy_tag TEXT,
        reason TEXT,
        created_at TIMESTAMPTZ NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_orders_created_at ON orders(created_at);
    CREATE INDEX IF NOT EXISTS idx_orders_code ON orders(code);";

const ACCOUNT_COLUMNS: &str =
    "cash, market_value, frozen_cash, total_asset, settled_on, updated_at";
const POSITION_COLUMNS: &str =
    "code, name, total_vol, avail_vol, avg_price, current_price, profit, profit_pct, updated_at";

pub struct PostgresAdapter {
    pool: Pool<Manager>,
}

impl PostgresAdapter {
    pub fn from_config(config: &dyn ConfigPort) -> Result<Self, PapertraderError> {
        let connection_string = config
            .get_string("postgres", "connection_string")
            .ok_or_else(|| PapertraderError::ConfigMissing {
                section: "postgres".into(),
                key: "connection_string".into(),
            })?;

        let pg_config = connection_string
            .parse::<postgres::Config>()
            .map_err(|e| PapertraderError::ConfigInvalid {
                section: "postgres".into(),
                key: "connection_string".into(),
                reason: e.to_string(),
            })?;

        let pool_size = config.get_int("postgres", "pool_size", 4).max(1) as u32;
        let manager = PostgresConnectionManager::new(pg_config, NoTls);
        let pool = Pool::builder()
            .max_size(pool_size)
            .build(manager)
            .map_err(|e: r2d2::Error| PapertraderError::Ledger(LedgerError::aborted(e)))?;

        Ok(Self { pool })
    }

    pub fn initialize_schema(&self) -> Result<(), LedgerError> {
        let mut conn = self.conn()?;
        conn.batch_execute(SCHEMA)
            .map_err(|e: postgres::Error| LedgerError::aborted(e))
    }

    fn conn(&self) -> Result<PooledConnection<Manager>, LedgerError> {
        self.pool
            .get()
            .map_err(|e: r2d2::Error| LedgerError::aborted(e))
    }

    fn write<T>(
        &self,
        op: impl FnOnce(&mut Transaction<'_>) -> Result<T, LedgerError>,
    ) -> Result<T, LedgerError> {
        let mut conn = self.conn()?;
        let mut tx = conn
            .transaction()
            .map_err(|e: postgres::Error| LedgerError::aborted(e))?;
        let out = op(&mut tx)?;
        tx.commit()
            .map_err(|e: postgres::Error| LedgerError::aborted(e))?;
        Ok(out)
    }
}

fn map_account(row: &Row) -> Account {
    Account {
        cash: row.get(0),
        market_value: row.get(1),
        frozen_cash: row.get(2),
        total_asset: row.get(3),
        settled_on: row.get(4),
        updated_at: row.get(5),
    }
}

fn map_position(row: &Row) -> Position {
    Position {
        code: row.get(0),
        name: row.get(1),
        total_vol: row.get(2),
        avail_vol: row.get(3),
        avg_price: row.get(4),
        current_price: row.get(5),
        profit: row.get(6),
        profit_pct: row.get(7),
        updated_at: row.get(8),
    }
}

fn map_order(row: &Row) -> Result<Order, LedgerError> {
    let action: String = row.get(3);
    let status: String = row.get(7);
    Ok(Order {
        order_id: row.get(0),
        trade_date: row.get(1),
        code: row.get(2),
        action: action
            .parse::<OrderAction>()
            .map_err(LedgerError::aborted)?,
        price: row.get(4),
        volume: row.get(5),
        fee: row.get(6),
        status: status
            .parse::<OrderStatus>()
            .map_err(LedgerError::aborted)?,
        strategy_tag: row.get(8),
        reason: row.get(9),
        created_at: row.get(10),
    })
}

fn load_account(
    client: &mut impl GenericClient,
    lock: bool,
) -> Result<Option<Account>, LedgerError> {
    let query = format!(
        "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1{}",
        if lock { " FOR UPDATE" } else { "" }
    );
    let row = client
        .query_opt(query.as_str(), &[&ACCOUNT_ID])
        .map_err(|e: postgres::Error| LedgerError::aborted(e))?;
    Ok(row.as_ref().map(map_account))
}

fn load_positions(client: &mut impl GenericClient) -> Result<Vec<Position>, LedgerError> {
    let query = format!("SELECT {POSITION_COLUMNS} FROM positions ORDER BY code");
    let rows = client
        .query(query.as_str(), &[])
        .map_err(|e: postgres::Error| LedgerError::aborted(e))?;
    Ok(rows.iter().map(map_position).collect())
}

fn load_snapshot(tx: &mut Transaction<'_>) -> Result<LedgerSnapshot, LedgerError> {
    let account = load_account(tx, true)?.ok_or(LedgerError::AccountNotInitialized)?;
    Ok(LedgerSnapshot::new(account, load_positions(tx)?))
}

fn save_account(tx: &mut Transaction<'_>, account: &Account) -> Result<(), LedgerError> {
    tx.execute(
        "UPDATE accounts
         SET cash = $1, market_value = $2, frozen_cash = $3, total_asset = $4,
             settled_on = $5, updated_at = $6
         WHERE id = $7",
        &[
            &account.cash,
            &account.market_value,
            &account.frozen_cash,
            &account.total_asset,
            &account.settled_on,
            &account.updated_at,
            &ACCOUNT_ID,
        ],
    )
    .map_err(|e: postgres::Error| LedgerError::aborted(e))?;
    Ok(())
}

fn upsert_position(tx: &mut Transaction<'_>, pos: &Position) -> Result<(), LedgerError> {
    tx.execute(
        "INSERT INTO positions (code, name, total_vol, avail_vol, avg_price, current_price,
                                profit, profit_pct, updated_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
         ON CONFLICT (code) DO UPDATE SET
             name = EXCLUDED.name,
             total_vol = EXCLUDED.total_vol,
             avail_vol = EXCLUDED.avail_vol,
             avg_price = EXCLUDED.avg_price,
             current_price = EXCLUDED.current_price,
             profit = EXCLUDED.profit,
             profit_pct = EXCLUDED.profit_pct,
             updated_at = EXCLUDED.updated_at",
        &[
            &pos.code,
            &pos.name,
            &pos.total_vol,
            &pos.avail_vol,
            &pos.avg_price,
            &pos.current_price,
            &pos.profit,
            &pos.profit_pct,
            &pos.updated_at,
        ],
    )
    .map_err(|e: postgres::Error| LedgerError::aborted(e))?;
    Ok(())
}

fn delete_position(tx: &mut Transaction<'_>, code: &str) -> Result<(), LedgerError> {
    tx.execute("DELETE FROM positions WHERE code = $1", &[&code])
        .map_err(|e: postgres::Error| LedgerError::aborted(e))?;
    Ok(())
}

fn insert_order(tx: &mut Transaction<'_>, order: &Order) -> Result<(), LedgerError> {
    tx.execute(
        "INSERT INTO orders (order_id, trade_date, code, action, price, volume, fee, status,
                             strategy_tag, reason, created_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        &[
            &order.order_id,
            &order.trade_date,
            &order.code,
            &order.action.as_str(),
            &order.price,
            &order.volume,
            &order.fee,
            &order.status.as_str(),
            &order.strategy_tag,
            &order.reason,
            &order.created_at,
        ],
    )
    .map_err(|e: postgres::Error| LedgerError::aborted(e))?;
    Ok(())
}

impl LedgerPort for PostgresAdapter {
    fn initialize_account(&self, initial_cash: f64) -> Result<Account, LedgerError> {
        self.write(|tx| {
            let account = Account::new(initial_cash, Utc::now());
            let inserted = tx
                .execute(
                    "INSERT INTO accounts (id, cash, market_value, frozen_cash, total_asset, updated_at)
                     VALUES ($1, $2, $3, $4, $5, $6)
                     ON CONFLICT (id) DO NOTHING",
                    &[
                        &ACCOUNT_ID,
                        &account.cash,
                        &account.market_value,
                        &account.frozen_cash,
                        &account.total_asset,
                        &account.updated_at,
                    ],
                )
                .map_err(|e: postgres::Error| LedgerError::aborted(e))?;
            if inserted == 1 {
                debug!(initial_cash, "account row created");
                return Ok(account);
            }
            load_account(tx, false)?.ok_or(LedgerError::AccountNotInitialized)
        })
    }

    fn get_account(&self) -> Result<Account, LedgerError> {
        let mut conn = self.conn()?;
        load_account(&mut *conn, false)?.ok_or(LedgerError::AccountNotInitialized)
    }

    fn get_positions(&self) -> Result<Vec<Position>, LedgerError> {
        let mut conn = self.conn()?;
        load_positions(&mut *conn)
    }

    fn get_position(&self, code: &str) -> Result<Option<Position>, LedgerError> {
        let mut conn = self.conn()?;
        let query = format!("SELECT {POSITION_COLUMNS} FROM positions WHERE code = $1");
        let row = conn
            .query_opt(query.as_str(), &[&code])
            .map_err(|e: postgres::Error| LedgerError::aborted(e))?;
        Ok(row.as_ref().map(map_position))
    }

    fn get_orders(&self, limit: Option<usize>) -> Result<Vec<Order>, LedgerError> {
        let mut conn = self.conn()?;
        // LIMIT NULL means no limit.
        let limit = limit.map(|l| l as i64);
        let rows = conn
            .query(
                "SELECT order_id, trade_date, code, action, price, volume, fee, status,
                        strategy_tag, reason, created_at
                 FROM orders
                 ORDER BY created_at DESC, seq DESC
                 LIMIT $1",
                &[&limit],
            )
            .map_err(|e: postgres::Error| LedgerError::aborted(e))?;
        rows.iter().map(map_order).collect()
    }

    fn execute_order(&self, request: &OrderRequest) -> Result<Order, LedgerError> {
        request.validate()?;
        self.write(|tx| {
            let mut ledger = load_snapshot(tx)?;
            let execution = ledger.execute(request, Utc::now())?;
            match &execution.change {
                PositionChange::Upsert(pos) => upsert_position(tx, pos)?,
                PositionChange::Delete(code) => delete_position(tx, code)?,
            }
            save_account(tx, &ledger.account)?;
            insert_order(tx, &execution.order)?;
            Ok(execution.order)
        })
    }

    fn sync_prices(&self, prices: &HashMap<String, f64>) -> Result<usize, LedgerError> {
        if prices.is_empty() {
            return Ok(0);
        }
        self.write(|tx| {
            let mut ledger = load_snapshot(tx)?;
            let updated = ledger.apply_prices(prices, Utc::now())?;
            for pos in &updated {
                upsert_position(tx, pos)?;
            }
            save_account(tx, &ledger.account)?;
            Ok(updated.len())
        })
    }

    fn unlock_positions(&self, trade_date: NaiveDate) -> Result<UnlockReport, LedgerError> {
        self.write(|tx| {
            let mut ledger = load_snapshot(tx)?;
            let (report, unlocked) = ledger.unlock(trade_date, Utc::now());
            if !report.already_settled {
                for pos in &unlocked {
                    upsert_position(tx, pos)?;
                }
                save_account(tx, &ledger.account)?;
            }
            Ok(report)
        })
    }

    fn set_cash(&self, cash: f64) -> Result<Account, LedgerError> {
        self.write(|tx| {
            let mut ledger = load_snapshot(tx)?;
            ledger.set_cash(cash, Utc::now())?;
            save_account(tx, &ledger.account)?;
            Ok(ledger.account)
        })
    }

    fn remove_position(&self, code: &str) -> Result<bool, LedgerError> {
        self.write(|tx| {
            let mut ledger = load_snapshot(tx)?;
            if ledger.remove(code, Utc::now()).is_none() {
                return Ok(false);
            }
            delete_position(tx, code)?;
            save_account(tx, &ledger.account)?;
            Ok(true)
        })
    }
}
