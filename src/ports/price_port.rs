//! Market quote source port.

use crate::domain::error::PapertraderError;
use std::collections::HashMap;

pub trait PricePort {
    fn latest_price(&self, code: &str) -> Result<f64, PapertraderError>;

    /// Default implementation: one `latest_price` call per code.
    fn latest_prices(&self, codes: &[String]) -> HashMap<String, Result<f64, PapertraderError>> {
        codes
            .iter()
            .map(|code| (code.clone(), self.latest_price(code)))
            .collect()
    }
}
