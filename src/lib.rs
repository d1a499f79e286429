//! papertrader: single-account paper-trading ledger.
//!
//! Hexagonal architecture: domain logic in [`domain`], port traits in [`ports`],
//! concrete implementations in [`adapters`], operator commands in [`cli`].

pub mod domain;
pub mod ports;
pub mod adapters;
pub mod cli;
