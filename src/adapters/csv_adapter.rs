//! CSV file quote adapter.
//!
//! Reads `code,price` rows (header required). The file is re-read on every
//! request so an external job can refresh it between syncs.

use crate::domain::error::PapertraderError;
use crate::ports::price_port::PricePort;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize)]
struct QuoteRow {
    code: String,
    price: f64,
}

pub struct CsvPriceAdapter {
    path: PathBuf,
}

impl CsvPriceAdapter {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// All quotes in the file; later rows win over earlier ones.
    pub fn load(&self) -> Result<HashMap<String, f64>, String> {
        let content = fs::read_to_string(&self.path)
            .map_err(|e| format!("failed to read {}: {}", self.path.display(), e))?;

        let mut rdr = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(content.as_bytes());

        let mut quotes = HashMap::new();
        for result in rdr.deserialize::<QuoteRow>() {
            let row = result.map_err(|e| format!("CSV parse error: {}", e))?;
            quotes.insert(row.code, row.price);
        }
        Ok(quotes)
    }

    fn lookup(quotes: &HashMap<String, f64>, code: &str) -> Result<f64, PapertraderError> {
        match quotes.get(code) {
            Some(&price) if price.is_finite() && price > 0.0 => Ok(price),
            Some(&price) => Err(PapertraderError::Quote {
                code: code.to_string(),
                reason: format!("non-positive price {price}"),
            }),
            None => Err(PapertraderError::Quote {
                code: code.to_string(),
                reason: "no quote in file".into(),
            }),
        }
    }
}

impl PricePort for CsvPriceAdapter {
    fn latest_price(&self, code: &str) -> Result<f64, PapertraderError> {
        let quotes = self.load().map_err(|reason| PapertraderError::Quote {
            code: code.to_string(),
            reason,
        })?;
        Self::lookup(&quotes, code)
    }

    fn latest_prices(&self, codes: &[String]) -> HashMap<String, Result<f64, PapertraderError>> {
        match self.load() {
            Ok(quotes) => codes
                .iter()
                .map(|code| (code.clone(), Self::lookup(&quotes, code)))
                .collect(),
            Err(reason) => codes
                .iter()
                .map(|code| {
                    let err = PapertraderError::Quote {
                        code: code.clone(),
                        reason: reason.clone(),
                    };
                    (code.clone(), Err(err))
                })
                .collect(),
        }
    }
}
