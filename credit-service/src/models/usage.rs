//! Metered usage records and their rated form.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::BillingPeriod;

/// A raw metering event as reported by a product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    /// Globally unique; ingestion is idempotent on it.
    pub transaction_id: String,
    pub account_id: Uuid,
    pub product_type: String,
    pub quantity: Decimal,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

/// A usage record as persisted, with its position in the account's stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredUsage {
    pub sequence: i64,
    pub record: UsageRecord,
    pub received_utc: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum IngestOutcome {
    Accepted { sequence: i64 },
    Duplicate,
}

/// Usage priced against the rate table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatedUsage {
    pub sequence: i64,
    pub transaction_id: String,
    pub account_id: Uuid,
    pub product_type: String,
    pub quantity: Decimal,
    pub rate: Decimal,
    pub amount: Decimal,
    pub timestamp: DateTime<Utc>,
    pub period: BillingPeriod,
}

/// Usage rolled up by period and product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageSummary {
    pub period: BillingPeriod,
    pub product_type: String,
    pub quantity: Decimal,
    pub rate: Decimal,
    pub amount: Decimal,
    pub transaction_ids: Vec<String>,
}
