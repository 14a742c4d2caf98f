//! Domain models for credit-service.

mod account;
mod coupon;
mod credit;
mod invoice;
mod notification;
mod usage;

pub use account::{AccountType, CloudAccount, EnrollAccount, UpgradeStatus};
pub use coupon::{Coupon, CreateCoupon, Redemption};
pub use credit::{
    AddCredit, ApplicationKind, BillingPeriod, Credit, CreditCharge, CreditOrigin, CreditTotals,
    LedgerApplication, Shortfall, ShortfallStatus, UsageApplication,
};
pub use invoice::{Invoice, InvoiceDirective, InvoiceLineItem, InvoiceStatus};
pub use notification::{
    CreditState, CreditStateTransition, DeliveryStatus, NotificationEvent, NotificationKind,
    NotificationMarks, ReconciliationState,
};
pub use usage::{IngestOutcome, RatedUsage, StoredUsage, UsageRecord, UsageSummary};
