//! Invoice workflow for usage that credits did not cover.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::CreditError;
use crate::models::{
    BillingPeriod, Invoice, InvoiceDirective, InvoiceLineItem, InvoiceStatus, ShortfallStatus,
};
use crate::services::ledger::{AccountBook, CreditLedger};
use crate::services::locks::AccountLocks;
use crate::services::metrics::INVOICES_TOTAL;
use crate::services::payment::PaymentGateway;
use crate::services::store::CreditStore;

const ADJUSTMENT_LINE: &str = "adjustment";

/// Builds a pending invoice for the outstanding shortfalls of `period`, and
/// marks those shortfalls invoiced. Returns `None` when nothing is owed.
pub fn build_pending(
    book: &mut AccountBook,
    period: BillingPeriod,
    now: DateTime<Utc>,
) -> Option<Invoice> {
    let owed: Vec<(Uuid, String, Decimal)> = book
        .shortfalls()
        .iter()
        .filter(|s| s.period == period && s.is_outstanding())
        .map(|s| {
            let product = s
                .product_type
                .clone()
                .unwrap_or_else(|| ADJUSTMENT_LINE.to_string());
            (s.shortfall_id, product, s.amount)
        })
        .collect();
    if owed.is_empty() {
        return None;
    }

    let invoice_id = Uuid::new_v4();
    let mut lines: BTreeMap<String, InvoiceLineItem> = BTreeMap::new();
    for (shortfall_id, product, amount) in &owed {
        let line = lines
            .entry(product.clone())
            .or_insert_with(|| InvoiceLineItem {
                product_type: product.clone(),
                amount: Decimal::ZERO,
                shortfall_ids: Vec::new(),
            });
        line.amount += *amount;
        line.shortfall_ids.push(*shortfall_id);

        if let Some(shortfall) = book.shortfall_mut(*shortfall_id) {
            shortfall.status = ShortfallStatus::Invoiced;
            shortfall.invoice_id = Some(invoice_id);
        }
    }

    let total: Decimal = owed.iter().map(|(_, _, amount)| *amount).sum();
    let invoice = Invoice {
        invoice_id,
        account_id: book.account_id(),
        period,
        status: InvoiceStatus::Pending,
        total,
        paid: Decimal::ZERO,
        due: total,
        line_items: lines.into_values().collect(),
        created_utc: now,
        decided_utc: None,
        updated_utc: now,
    };
    book.record_invoice(invoice.clone());
    Some(invoice)
}

/// Pending invoices for every closed period that still has outstanding
/// shortfalls.
pub fn roll_closed_periods(book: &mut AccountBook, now: DateTime<Utc>) -> Vec<Invoice> {
    let periods: BTreeSet<BillingPeriod> = book
        .shortfalls()
        .iter()
        .filter(|s| s.is_outstanding() && s.period.is_closed(now))
        .map(|s| s.period)
        .collect();

    periods
        .into_iter()
        .filter_map(|period| build_pending(book, period, now))
        .collect()
}

pub struct InvoiceWorkflow {
    store: Arc<dyn CreditStore>,
    ledger: Arc<CreditLedger>,
    locks: Arc<AccountLocks>,
    clock: Arc<dyn Clock>,
    gateway: Arc<dyn PaymentGateway>,
}

impl InvoiceWorkflow {
    pub fn new(
        store: Arc<dyn CreditStore>,
        ledger: Arc<CreditLedger>,
        locks: Arc<AccountLocks>,
        clock: Arc<dyn Clock>,
        gateway: Arc<dyn PaymentGateway>,
    ) -> Self {
        Self {
            store,
            ledger,
            locks,
            clock,
            gateway,
        }
    }

    /// Invoices the outstanding shortfalls of `period`. Returns `None` when
    /// credits covered all usage in the period.
    #[instrument(skip(self), fields(period = %period))]
    pub async fn create_pending(
        &self,
        account_id: Uuid,
        period: BillingPeriod,
    ) -> Result<Option<Uuid>, CreditError> {
        let _guard = self.locks.acquire(account_id).await;
        let now = self.clock.now();

        let mut book = self.ledger.load_book(account_id).await?;
        let Some(invoice) = build_pending(&mut book, period, now) else {
            return Ok(None);
        };
        self.store.commit(book.into_commit()).await?;

        INVOICES_TOTAL.with_label_values(&["created"]).inc();
        info!(invoice_id = %invoice.invoice_id, total = %invoice.total, "Pending invoice created");
        Ok(Some(invoice.invoice_id))
    }

    /// Approves or discards a pending invoice.
    #[instrument(skip(self))]
    pub async fn decide(
        &self,
        invoice_id: Uuid,
        directive: InvoiceDirective,
    ) -> Result<Invoice, CreditError> {
        let account_id = self.get_invoice(invoice_id).await?.account_id;
        let _guard = self.locks.acquire(account_id).await;
        let now = self.clock.now();

        let mut invoice = self.get_invoice(invoice_id).await?;
        if invoice.status != InvoiceStatus::Pending {
            return Err(CreditError::InvoiceStateConflict {
                invoice_id,
                actual: invoice.status,
                expected: "PENDING",
            });
        }

        let mut book = self.ledger.load_book(account_id).await?;
        match directive {
            InvoiceDirective::Approve => {
                let captured = self.gateway.capture(book.account(), &invoice).await?;
                invoice.status = InvoiceStatus::Approved;
                invoice.decided_utc = Some(now);
                invoice.apply_payment(captured.max(Decimal::ZERO), now);
                INVOICES_TOTAL.with_label_values(&["approved"]).inc();
            }
            InvoiceDirective::Discard => {
                for shortfall_id in invoice.shortfall_ids().collect::<Vec<_>>() {
                    if let Some(shortfall) = book.shortfall_mut(shortfall_id) {
                        shortfall.status = ShortfallStatus::WrittenOff;
                    }
                }
                invoice.status = InvoiceStatus::Discarded;
                invoice.decided_utc = Some(now);
                invoice.updated_utc = now;
                INVOICES_TOTAL.with_label_values(&["discarded"]).inc();
            }
        }

        book.record_invoice(invoice.clone());
        self.store.commit(book.into_commit()).await?;

        info!(
            account_id = %account_id,
            status = %invoice.status,
            paid = %invoice.paid,
            due = %invoice.due,
            "Invoice decided"
        );
        Ok(invoice)
    }

    /// Records a payment against an approved invoice.
    #[instrument(skip(self), fields(amount = %amount))]
    pub async fn record_payment(
        &self,
        invoice_id: Uuid,
        amount: Decimal,
    ) -> Result<Invoice, CreditError> {
        let account_id = self.get_invoice(invoice_id).await?.account_id;
        let _guard = self.locks.acquire(account_id).await;
        let now = self.clock.now();

        let mut invoice = self.get_invoice(invoice_id).await?;
        if invoice.status != InvoiceStatus::Approved {
            return Err(CreditError::InvoiceStateConflict {
                invoice_id,
                actual: invoice.status,
                expected: "APPROVED",
            });
        }
        if amount <= Decimal::ZERO || amount > invoice.due {
            return Err(CreditError::InvalidAmount(format!(
                "payment must be in (0, {}], got {}",
                invoice.due, amount
            )));
        }

        invoice.apply_payment(amount, now);

        let mut book = self.ledger.load_book(account_id).await?;
        book.record_invoice(invoice.clone());
        self.store.commit(book.into_commit()).await?;

        INVOICES_TOTAL.with_label_values(&["payment"]).inc();
        if invoice.status == InvoiceStatus::Paid {
            INVOICES_TOTAL.with_label_values(&["paid"]).inc();
        }
        Ok(invoice)
    }

    pub async fn get_invoice(&self, invoice_id: Uuid) -> Result<Invoice, CreditError> {
        self.store
            .get_invoice(invoice_id)
            .await?
            .ok_or(CreditError::InvoiceNotFound(invoice_id))
    }

    /// Approved and paid invoices.
    pub async fn list_billed(&self, account_id: Option<Uuid>) -> Result<Vec<Invoice>, CreditError> {
        let invoices = self.store.list_invoices(account_id).await?;
        Ok(invoices.into_iter().filter(Invoice::is_billed).collect())
    }

    /// Pending invoices and approved ones with money still due.
    pub async fn list_unbilled(&self, account_id: Option<Uuid>) -> Result<Vec<Invoice>, CreditError> {
        let invoices = self.store.list_invoices(account_id).await?;
        Ok(invoices.into_iter().filter(Invoice::is_unbilled).collect())
    }
}
