//! Port traits (hexagonal architecture boundaries).

pub mod calendar_port;
pub mod config_port;
pub mod ledger_port;
pub mod price_port;
