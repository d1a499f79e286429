//! CLI definition and dispatch.

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use crate::adapters::calendar_adapter::{FixedCalendar, WeekdayCalendar};
use crate::adapters::csv_adapter::CsvPriceAdapter;
use crate::adapters::file_config_adapter::FileConfigAdapter;
use crate::domain::account::Account;
use crate::domain::config_validation::validate_ledger_config;
use crate::domain::error::PapertraderError;
use crate::domain::order::Order;
use crate::domain::position::Position;
use crate::domain::settlement::{LedgerConfig, SettlementService};
use crate::ports::calendar_port::CalendarPort;
use crate::ports::config_port::ConfigPort;
use crate::ports::ledger_port::LedgerPort;

const DEFAULT_PRICES_PATH: &str = "prices.csv";

#[derive(Parser, Debug)]
#[command(name = "papertrader", about = "Single-account paper-trading ledger")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create the ledger tables and the account
    Init {
        #[arg(short, long)]
        config: PathBuf,
        /// Starting cash; defaults to [ledger] initial_cash
        #[arg(long)]
        cash: Option<f64>,
    },
    /// Show the account summary
    Account {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// List open positions
    Positions {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// List orders, newest first
    Orders {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(short = 'n', long)]
        limit: Option<usize>,
        #[arg(long)]
        json: bool,
    },
    /// Record a filled buy
    Buy {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long)]
        code: String,
        #[arg(long, allow_negative_numbers = true)]
        price: f64,
        #[arg(long, allow_negative_numbers = true)]
        volume: i64,
        /// Display name for a newly opened position
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        tag: Option<String>,
        /// Trade date override (YYYY-MM-DD)
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Record a filled sell
    Sell {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long)]
        code: String,
        #[arg(long, allow_negative_numbers = true)]
        price: f64,
        #[arg(long, allow_negative_numbers = true)]
        volume: i64,
        #[arg(long)]
        reason: Option<String>,
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Mark held positions to the latest quotes
    SyncPrices {
        #[arg(short, long)]
        config: PathBuf,
        /// Quote file; defaults to [prices] path
        #[arg(long)]
        prices: Option<PathBuf>,
    },
    /// Release T+1 locked volume for the trade date
    Settle {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Overwrite available cash
    SetCash {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long, allow_negative_numbers = true)]
        amount: f64,
    },
    /// Drop a position without recording an order
    RemovePosition {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long)]
        code: String,
    },
}

impl Command {
    fn config_path(&self) -> &Path {
        match self {
            Command::Init { config, .. }
            | Command::Account { config, .. }
            | Command::Positions { config, .. }
            | Command::Orders { config, .. }
            | Command::Buy { config, .. }
            | Command::Sell { config, .. }
            | Command::SyncPrices { config, .. }
            | Command::Settle { config, .. }
            | Command::SetCash { config, .. }
            | Command::RemovePosition { config, .. } => config,
        }
    }

    fn trade_date(&self) -> Option<NaiveDate> {
        match self {
            Command::Buy { date, .. } | Command::Sell { date, .. } | Command::Settle { date, .. } => {
                *date
            }
            _ => None,
        }
    }
}

pub fn run(cli: Cli) -> ExitCode {
    match execute(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            (&e).into()
        }
    }
}

/// Run one command end to end: config, logging, store, then the operation.
pub fn execute(command: Command) -> Result<(), PapertraderError> {
    let config = load_config(command.config_path())?;
    init_logging(config.get_string("log", "level").as_deref());
    let ledger_config = build_ledger_config(&config)?;
    let ledger = open_ledger(&config)?;

    let calendar: Arc<dyn CalendarPort + Send + Sync> = match command.trade_date() {
        Some(date) => Arc::new(FixedCalendar::new(date)),
        None => Arc::new(WeekdayCalendar),
    };
    let prices_path = match &command {
        Command::SyncPrices {
            prices: Some(path), ..
        } => path.clone(),
        _ => config
            .get_string("prices", "path")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_PRICES_PATH)),
    };
    let service = SettlementService::new(
        ledger,
        Arc::new(CsvPriceAdapter::new(prices_path)),
        calendar,
    )
    .with_fee_rate(ledger_config.fee_rate);

    match command {
        Command::Init { cash, .. } => {
            let account = service.initialize_account(cash.unwrap_or(ledger_config.initial_cash))?;
            eprintln!("Ledger ready");
            print_account(&account);
        }
        Command::Account { json, .. } => {
            let account = service.get_account()?;
            if json {
                print_json(&account)?;
            } else {
                print_account(&account);
            }
        }
        Command::Positions { json, .. } => {
            let positions = service.get_positions()?;
            if json {
                print_json(&positions)?;
            } else {
                print_positions(&positions);
            }
        }
        Command::Orders { limit, json, .. } => {
            let orders = service.get_orders(limit)?;
            if json {
                print_json(&orders)?;
            } else {
                print_orders(&orders);
            }
        }
        Command::Buy {
            code,
            price,
            volume,
            name,
            tag,
            ..
        } => {
            let order =
                service.execute_buy_named(&code, name.as_deref(), price, volume, tag.as_deref())?;
            println!("{}", order.order_id);
            eprintln!(
                "Bought {} {} @ {:.2} (fee {:.2}) on {}",
                order.volume, order.code, order.price, order.fee, order.trade_date
            );
        }
        Command::Sell {
            code,
            price,
            volume,
            reason,
            ..
        } => {
            let order = service.execute_sell(&code, price, volume, reason.as_deref())?;
            println!("{}", order.order_id);
            eprintln!(
                "Sold {} {} @ {:.2} (fee {:.2}) on {}",
                order.volume, order.code, order.price, order.fee, order.trade_date
            );
        }
        Command::SyncPrices { .. } => {
            let report = service.sync_latest_prices()?;
            println!("{} of {} positions updated", report.updated, report.requested);
            if !report.failed_codes.is_empty() {
                eprintln!("warning: no usable quote for {}", report.failed_codes.join(", "));
            }
        }
        Command::Settle { .. } => {
            let report = service.run_daily_unlock()?;
            if report.already_settled {
                eprintln!("Already settled for {}", report.trade_date);
            } else {
                println!(
                    "{} positions unlocked for {}",
                    report.unlocked, report.trade_date
                );
            }
        }
        Command::SetCash { amount, .. } => {
            let account = service.set_cash(amount)?;
            print_account(&account);
        }
        Command::RemovePosition { code, .. } => {
            if service.remove_position(&code)? {
                println!("removed {code}");
            } else {
                eprintln!("No position for {code}");
            }
        }
    }
    Ok(())
}

pub fn load_config(path: &Path) -> Result<FileConfigAdapter, PapertraderError> {
    FileConfigAdapter::from_file(path).map_err(|e| PapertraderError::ConfigParse {
        file: path.display().to_string(),
        reason: e.to_string(),
    })
}

/// Route tracing output to stderr. `RUST_LOG` wins over the configured
/// level. Safe to call more than once; later calls are ignored.
pub fn init_logging(level: Option<&str>) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.unwrap_or("info")));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

pub fn build_ledger_config(config: &dyn ConfigPort) -> Result<LedgerConfig, PapertraderError> {
    validate_ledger_config(config)?;
    let defaults = LedgerConfig::default();
    Ok(LedgerConfig {
        initial_cash: config.get_double("ledger", "initial_cash", defaults.initial_cash),
        fee_rate: config.get_double("ledger", "fee_rate", defaults.fee_rate),
    })
}

/// Open the configured store and make sure its tables exist. A
/// `[postgres] connection_string` selects PostgreSQL when that backend is
/// compiled in; otherwise `[sqlite] path` is used.
pub fn open_ledger(
    config: &dyn ConfigPort,
) -> Result<Arc<dyn LedgerPort + Send + Sync>, PapertraderError> {
    #[cfg(feature = "postgres")]
    {
        use crate::adapters::postgres_adapter::PostgresAdapter;

        if config.get_string("postgres", "connection_string").is_some() {
            let store = PostgresAdapter::from_config(config)?;
            store.initialize_schema()?;
            return Ok(Arc::new(store));
        }
    }

    #[cfg(feature = "sqlite")]
    {
        use crate::adapters::sqlite_adapter::SqliteAdapter;

        let store = SqliteAdapter::from_config(config)?;
        store.initialize_schema()?;
        Ok(Arc::new(store))
    }

    #[cfg(not(feature = "sqlite"))]
    {
        let _ = config;
        Err(PapertraderError::ConfigMissing {
            section: "postgres".into(),
            key: "connection_string".into(),
        })
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<(), PapertraderError> {
    let text = serde_json::to_string_pretty(value).map_err(std::io::Error::other)?;
    println!("{text}");
    Ok(())
}

fn print_account(account: &Account) {
    println!("Cash:          {:>14.2}", account.cash);
    println!("Market Value:  {:>14.2}", account.market_value);
    println!("Frozen Cash:   {:>14.2}", account.frozen_cash);
    println!("Total Asset:   {:>14.2}", account.total_asset);
    match account.settled_on {
        Some(date) => println!("Settled On:    {:>14}", date),
        None => println!("Settled On:    {:>14}", "-"),
    }
}

fn print_positions(positions: &[Position]) {
    if positions.is_empty() {
        eprintln!("No open positions");
        return;
    }
    println!(
        "{:<12} {:<16} {:>10} {:>10} {:>10} {:>10} {:>12} {:>8}",
        "Code", "Name", "Total", "Avail", "Avg", "Last", "Profit", "Pct"
    );
    for p in positions {
        let last = p
            .current_price
            .map(|px| format!("{px:.2}"))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<12} {:<16} {:>10} {:>10} {:>10.2} {:>10} {:>12.2} {:>7.2}%",
            p.code, p.name, p.total_vol, p.avail_vol, p.avg_price, last, p.profit, p.profit_pct
        );
    }
    eprintln!("{} positions", positions.len());
}

fn print_orders(orders: &[Order]) {
    if orders.is_empty() {
        eprintln!("No orders");
        return;
    }
    for o in orders {
        println!(
            "{}  {}  {:<4} {:<12} {:>10} @ {:>10.2}  fee {:>8.2}  {}",
            o.order_id,
            o.trade_date,
            o.action.as_str(),
            o.code,
            o.volume,
            o.price,
            o.fee,
            o.status.as_str()
        );
    }
}
