//! Configuration validation.
//!
//! Checks ledger, storage and logging settings before any store is opened.

use crate::domain::error::PapertraderError;
use crate::ports::config_port::ConfigPort;

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

pub fn validate_ledger_config(config: &dyn ConfigPort) -> Result<(), PapertraderError> {
    validate_initial_cash(config)?;
    validate_fee_rate(config)?;
    validate_pool_size(config, "sqlite")?;
    validate_pool_size(config, "postgres")?;
    validate_busy_timeout(config)?;
    validate_log_level(config)?;
    Ok(())
}

fn invalid(section: &str, key: &str, reason: &str) -> PapertraderError {
    PapertraderError::ConfigInvalid {
        section: section.to_string(),
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

fn validate_initial_cash(config: &dyn ConfigPort) -> Result<(), PapertraderError> {
    let value = config.get_double("ledger", "initial_cash", 100_000.0);
    if !value.is_finite() || value <= 0.0 {
        return Err(invalid("ledger", "initial_cash", "initial_cash must be positive"));
    }
    Ok(())
}

fn validate_fee_rate(config: &dyn ConfigPort) -> Result<(), PapertraderError> {
    let value = config.get_double("ledger", "fee_rate", 0.002);
    if !(0.0..1.0).contains(&value) {
        return Err(invalid("ledger", "fee_rate", "fee_rate must be in [0, 1)"));
    }
    Ok(())
}

fn validate_pool_size(config: &dyn ConfigPort, section: &str) -> Result<(), PapertraderError> {
    let value = config.get_int(section, "pool_size", 4);
    if value < 1 {
        return Err(invalid(section, "pool_size", "pool_size must be at least 1"));
    }
    Ok(())
}

fn validate_busy_timeout(config: &dyn ConfigPort) -> Result<(), PapertraderError> {
    let value = config.get_int("sqlite", "busy_timeout_ms", 5_000);
    if value < 0 {
        return Err(invalid(
            "sqlite",
            "busy_timeout_ms",
            "busy_timeout_ms must be non-negative",
        ));
    }
    Ok(())
}

fn validate_log_level(config: &dyn ConfigPort) -> Result<(), PapertraderError> {
    match config.get_string("log", "level") {
        Some(level) if !LOG_LEVELS.contains(&level.trim().to_lowercase().as_str()) => Err(invalid(
            "log",
            "level",
            "level must be one of trace, debug, info, warn, error",
        )),
        _ => Ok(()),
    }
}
