//! Core domain types and logic.

pub mod account;
pub mod position;
pub mod order;
pub mod ledger;
pub mod settlement;
pub mod unlock;
pub mod config_validation;
pub mod error;
