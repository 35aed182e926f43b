//! Pricing records: operation id -> required price and recipient
//!
//! Loaded once from a TOML file and read-only afterwards:
//!
//! ```toml
//! [[operation]]
//! id = "weather.current"
//! price = "0.01"            # decimal token units
//! recipient = "0x7099..."   # optional, defaults to PAYMENT_RECIPIENT
//! description = "Current conditions for a city"
//! ```

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

use crate::domain_types::{EthAddress, TokenAmount};

/// Price policy for one paid operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceEntry {
    pub operation: String,
    pub price: TokenAmount,
    pub recipient: EthAddress,
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PricingFile {
    #[serde(default, rename = "operation")]
    operations: Vec<PricingFileEntry>,
}

#[derive(Debug, Deserialize)]
struct PricingFileEntry {
    id: String,
    price: String,
    recipient: Option<String>,
    description: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PricingTable {
    entries: HashMap<String, PriceEntry>,
}

impl PricingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an entry
    pub fn insert(&mut self, entry: PriceEntry) {
        self.entries.insert(entry.operation.clone(), entry);
    }

    pub fn with_entry(mut self, entry: PriceEntry) -> Self {
        self.insert(entry);
        self
    }

    pub fn lookup(&self, operation: &str) -> Option<&PriceEntry> {
        self.entries.get(operation)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parse TOML pricing text. Prices are decimal token amounts.
    pub fn from_toml_str(
        text: &str,
        decimals: u8,
        default_recipient: EthAddress,
    ) -> Result<Self, String> {
        let file: PricingFile =
            toml::from_str(text).map_err(|e| format!("Invalid pricing file: {}", e))?;

        let mut table = Self::new();
        for raw in file.operations {
            if raw.id.trim().is_empty() {
                return Err("Pricing entry with empty id".to_string());
            }
            if table.entries.contains_key(&raw.id) {
                return Err(format!("Duplicate pricing entry '{}'", raw.id));
            }

            let price = TokenAmount::from_decimal_str(&raw.price, decimals)
                .map_err(|e| format!("Pricing entry '{}': {}", raw.id, e))?;
            if price.is_zero() {
                return Err(format!("Pricing entry '{}' has a zero price", raw.id));
            }

            let recipient = match raw.recipient {
                Some(r) => EthAddress::parse(&r)
                    .map_err(|e| format!("Pricing entry '{}': {}", raw.id, e))?,
                None => default_recipient,
            };

            table.insert(PriceEntry {
                operation: raw.id,
                price,
                recipient,
                description: raw.description,
            });
        }

        Ok(table)
    }

    pub fn from_file(
        path: &Path,
        decimals: u8,
        default_recipient: EthAddress,
    ) -> Result<Self, String> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read pricing file {}: {}", path.display(), e))?;
        let table = Self::from_toml_str(&text, decimals, default_recipient)?;
        log::info!(
            "[Pricing] Loaded {} paid operations from {}",
            table.len(),
            path.display()
        );
        Ok(table)
    }
}
