//! Usage aggregator: idempotent ingestion and rating of metered usage.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::CreditError;
use crate::models::{BillingPeriod, IngestOutcome, RatedUsage, StoredUsage, UsageRecord, UsageSummary};
use crate::services::metrics::USAGE_INGESTED_TOTAL;
use crate::services::pricing::PriceTable;
use crate::services::store::CreditStore;

pub struct UsageAggregator {
    store: Arc<dyn CreditStore>,
    prices: Arc<PriceTable>,
    clock: Arc<dyn Clock>,
}

impl UsageAggregator {
    pub fn new(store: Arc<dyn CreditStore>, prices: Arc<PriceTable>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            prices,
            clock,
        }
    }

    pub fn prices(&self) -> &PriceTable {
        &self.prices
    }

    /// Appends a usage record. A repeated transaction id is a no-op that
    /// reports [`IngestOutcome::Duplicate`].
    #[instrument(skip(self, record), fields(
        transaction_id = %record.transaction_id,
        account_id = %record.account_id,
        product_type = %record.product_type
    ))]
    pub async fn ingest(&self, record: UsageRecord) -> Result<IngestOutcome, CreditError> {
        if let Err(e) = self.validate(&record) {
            USAGE_INGESTED_TOTAL.with_label_values(&["rejected"]).inc();
            return Err(e);
        }
        if self.store.get_account(record.account_id).await?.is_none() {
            USAGE_INGESTED_TOTAL.with_label_values(&["rejected"]).inc();
            return Err(CreditError::AccountNotFound(record.account_id));
        }

        let outcome = self.store.append_usage(&record, self.clock.now()).await?;
        match outcome {
            IngestOutcome::Accepted { sequence } => {
                USAGE_INGESTED_TOTAL.with_label_values(&["accepted"]).inc();
                debug!(sequence, "Usage accepted");
            }
            IngestOutcome::Duplicate => {
                USAGE_INGESTED_TOTAL.with_label_values(&["duplicate"]).inc();
                debug!("Duplicate usage ignored");
            }
        }
        Ok(outcome)
    }

    fn validate(&self, record: &UsageRecord) -> Result<(), CreditError> {
        if record.transaction_id.trim().is_empty() {
            return Err(CreditError::InvalidRequest(
                "transaction_id must not be empty".to_string(),
            ));
        }
        if record.quantity <= Decimal::ZERO {
            return Err(CreditError::InvalidAmount(format!(
                "usage quantity must be positive, got {}",
                record.quantity
            )));
        }
        if self.prices.rate(&record.product_type).is_none() {
            return Err(CreditError::UnknownProduct(record.product_type.clone()));
        }
        Ok(())
    }

    fn rate(&self, stored: &StoredUsage) -> Result<RatedUsage, CreditError> {
        let record = &stored.record;
        let rate = self.prices.rate(&record.product_type).ok_or_else(|| {
            warn!(
                product_type = %record.product_type,
                sequence = stored.sequence,
                "Stored usage references a product missing from the price table"
            );
            CreditError::UnknownProduct(record.product_type.clone())
        })?;

        Ok(RatedUsage {
            sequence: stored.sequence,
            transaction_id: record.transaction_id.clone(),
            account_id: record.account_id,
            product_type: record.product_type.clone(),
            quantity: record.quantity,
            rate,
            amount: record.quantity * rate,
            timestamp: record.timestamp,
            period: BillingPeriod::containing(record.timestamp),
        })
    }

    /// Rated usage after `cursor`, in ingestion order.
    #[instrument(skip(self))]
    pub async fn drain(&self, account_id: Uuid, cursor: i64) -> Result<Vec<RatedUsage>, CreditError> {
        let stored = self.store.usage_after(account_id, cursor).await?;
        stored.iter().map(|s| self.rate(s)).collect()
    }

    /// Usage with timestamps in `[from, to)`, grouped by billing period and sku.
    #[instrument(skip(self))]
    pub async fn usage_report(
        &self,
        account_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<UsageSummary>, CreditError> {
        if from >= to {
            return Err(CreditError::InvalidRequest(format!(
                "report window {} .. {} is empty",
                from, to
            )));
        }
        if self.store.get_account(account_id).await?.is_none() {
            return Err(CreditError::AccountNotFound(account_id));
        }

        let stored = self.store.usage_between(account_id, from, to).await?;
        let mut groups: BTreeMap<(BillingPeriod, String), UsageSummary> = BTreeMap::new();

        for usage in &stored {
            let rated = self.rate(usage)?;
            let summary = groups
                .entry((rated.period, rated.product_type.clone()))
                .or_insert_with(|| UsageSummary {
                    period: rated.period,
                    product_type: rated.product_type.clone(),
                    quantity: Decimal::ZERO,
                    rate: rated.rate,
                    amount: Decimal::ZERO,
                    transaction_ids: Vec::new(),
                });
            summary.quantity += rated.quantity;
            summary.amount += rated.amount;
            summary.transaction_ids.push(rated.transaction_id);
        }

        Ok(groups.into_values().collect())
    }
}
