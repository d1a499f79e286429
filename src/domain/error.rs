//! Domain error types.

/// Failure kinds raised by the ledger store.
///
/// A call that returns one of these has left the account, every position and
/// the order history untouched.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LedgerError {
    #[error("account not initialized")]
    AccountNotInitialized,

    #[error("invalid order parameters: {reason}")]
    InvalidOrderParameters { reason: String },

    #[error("insufficient funds: required {required:.2}, available {available:.2}")]
    InsufficientFunds { required: f64, available: f64 },

    #[error("no open position for {code}")]
    PositionNotFound { code: String },

    #[error("insufficient available volume for {code}: required {required}, available {available}")]
    InsufficientAvailableVolume {
        code: String,
        required: i64,
        available: i64,
    },

    #[error("transaction aborted: {reason}")]
    TransactionAborted { reason: String },
}

impl LedgerError {
    /// Stable identifier for callers that map failures onto wire codes.
    pub fn error_code(&self) -> &'static str {
        match self {
            LedgerError::AccountNotInitialized => "ACCOUNT_NOT_INITIALIZED",
            LedgerError::InvalidOrderParameters { .. } => "INVALID_ORDER_PARAMETERS",
            LedgerError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            LedgerError::PositionNotFound { .. } => "POSITION_NOT_FOUND",
            LedgerError::InsufficientAvailableVolume { .. } => "INSUFFICIENT_AVAILABLE_VOLUME",
            LedgerError::TransactionAborted { .. } => "TRANSACTION_ABORTED",
        }
    }

    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        LedgerError::InvalidOrderParameters {
            reason: reason.into(),
        }
    }

    pub(crate) fn aborted(reason: impl std::fmt::Display) -> Self {
        LedgerError::TransactionAborted {
            reason: reason.to_string(),
        }
    }
}

/// Top-level error type for papertrader.
#[derive(Debug, thiserror::Error)]
pub enum PapertraderError {
    #[error("config parse error in {file}: {reason}")]
    ConfigParse { file: String, reason: String },

    #[error("missing config key [{section}] {key}")]
    ConfigMissing { section: String, key: String },

    #[error("invalid config value [{section}] {key}: {reason}")]
    ConfigInvalid {
        section: String,
        key: String,
        reason: String,
    },

    #[error("price unavailable for {code}: {reason}")]
    Quote { code: String, reason: String },

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<&PapertraderError> for std::process::ExitCode {
    fn from(err: &PapertraderError) -> Self {
        let code: u8 = match err {
            PapertraderError::Io(_) => 1,
            PapertraderError::ConfigParse { .. }
            | PapertraderError::ConfigMissing { .. }
            | PapertraderError::ConfigInvalid { .. } => 2,
            PapertraderError::Ledger(LedgerError::TransactionAborted { .. }) => 3,
            PapertraderError::Ledger(_) => 4,
            PapertraderError::Quote { .. } => 5,
        };
        std::process::ExitCode::from(code)
    }
}
