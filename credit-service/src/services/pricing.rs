//! Per-sku unit rates.

use config::{Config as Cfg, File};
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

/// Rates built in for the platform's standard skus.
const DEFAULT_RATES: &[(&str, &str)] = &[
    ("vm-spr-sml", "0.0075"),
    ("vm-spr-med", "0.015"),
    ("vm-spr-lrg", "0.03"),
    ("vm-spr-tny", "0"),
    ("gpu-max-1100", "0.65"),
    ("storage-file-gb", "0.0001"),
];

/// Immutable rate table keyed by product type.
#[derive(Debug, Clone, Default)]
pub struct PriceTable {
    rates: BTreeMap<String, Decimal>,
}

impl PriceTable {
    pub fn new(rates: impl IntoIterator<Item = (String, Decimal)>) -> Self {
        Self {
            rates: rates.into_iter().collect(),
        }
    }

    pub fn defaults() -> Self {
        Self::new(DEFAULT_RATES.iter().filter_map(|(sku, rate)| {
            Decimal::from_str(rate).ok().map(|r| (sku.to_string(), r))
        }))
    }

    /// Loads `[rates]` from a TOML/JSON/YAML file on top of the defaults.
    pub fn from_file(path: &str) -> Result<Self, AppError> {
        let settings = Cfg::builder()
            .add_source(File::with_name(path))
            .build()?;
        let raw: HashMap<String, String> = settings.get("rates")?;

        let mut table = Self::defaults();
        for (sku, rate) in raw {
            let rate = Decimal::from_str(rate.trim()).map_err(|e| {
                AppError::ConfigError(anyhow::anyhow!("Invalid rate for {}: {}", sku, e))
            })?;
            if rate < Decimal::ZERO {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "Negative rate for {}",
                    sku
                )));
            }
            table.rates.insert(sku, rate);
        }
        Ok(table)
    }

    pub fn rate(&self, product_type: &str) -> Option<Decimal> {
        self.rates.get(product_type).copied()
    }

    /// Skus with a non-zero rate.
    pub fn paid_products(&self) -> Vec<String> {
        self.rates
            .iter()
            .filter(|(_, rate)| **rate > Decimal::ZERO)
            .map(|(sku, _)| sku.clone())
            .collect()
    }
}
