//! Invoice model for uncovered usage.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::BillingPeriod;

/// Invoice lifecycle.
///
/// `Pending` moves to `Approved` or `Discarded` exactly once. `Approved`
/// moves to `Paid` when the outstanding due reaches zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InvoiceStatus {
    Pending,
    Approved,
    Discarded,
    Paid,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Approved => "APPROVED",
            Self::Discarded => "DISCARDED",
            Self::Paid => "PAID",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Some(Self::Pending),
            "APPROVED" => Some(Self::Approved),
            "DISCARDED" => Some(Self::Discarded),
            "PAID" => Some(Self::Paid),
            _ => None,
        }
    }
}

impl std::fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Operator decision on a pending invoice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvoiceDirective {
    Approve,
    Discard,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceLineItem {
    pub product_type: String,
    pub amount: Decimal,
    pub shortfall_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub invoice_id: Uuid,
    pub account_id: Uuid,
    pub period: BillingPeriod,
    pub status: InvoiceStatus,
    pub total: Decimal,
    pub paid: Decimal,
    pub due: Decimal,
    pub line_items: Vec<InvoiceLineItem>,
    pub created_utc: DateTime<Utc>,
    pub decided_utc: Option<DateTime<Utc>>,
    pub updated_utc: DateTime<Utc>,
}

impl Invoice {
    /// Approved or paid.
    pub fn is_billed(&self) -> bool {
        matches!(self.status, InvoiceStatus::Approved | InvoiceStatus::Paid)
    }

    /// Awaiting a decision, or approved with money still owed.
    pub fn is_unbilled(&self) -> bool {
        match self.status {
            InvoiceStatus::Pending => true,
            InvoiceStatus::Approved => self.due > Decimal::ZERO,
            InvoiceStatus::Discarded | InvoiceStatus::Paid => false,
        }
    }

    pub fn shortfall_ids(&self) -> impl Iterator<Item = Uuid> + '_ {
        self.line_items
            .iter()
            .flat_map(|item| item.shortfall_ids.iter().copied())
    }

    /// Records a payment, settling the invoice when nothing is left due.
    pub fn apply_payment(&mut self, amount: Decimal, now: DateTime<Utc>) {
        let amount = amount.min(self.due);
        self.paid += amount;
        self.due -= amount;
        if self.due.is_zero() && self.status == InvoiceStatus::Approved {
            self.status = InvoiceStatus::Paid;
        }
        self.updated_utc = now;
    }
}
