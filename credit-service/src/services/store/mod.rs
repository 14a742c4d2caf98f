//! Persistence seam for credit-service.
//!
//! Every mutation of an account's ledger goes through a single
//! [`CreditStore::commit`] call carrying a [`LedgerCommit`]. Implementations
//! must apply a commit entirely or not at all.

mod memory;
mod postgres;

pub use memory::InMemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use uuid::Uuid;

use crate::models::{
    CloudAccount, Coupon, Credit, CreditStateTransition, IngestOutcome, Invoice,
    LedgerApplication, NotificationEvent, ReconciliationState, Redemption, Shortfall,
    StoredUsage, UsageRecord,
};

/// Everything needed to rebuild an account's working ledger.
#[derive(Debug, Clone)]
pub struct BookSnapshot {
    pub account: CloudAccount,
    pub credits: Vec<Credit>,
    pub shortfalls: Vec<Shortfall>,
    pub state: Option<ReconciliationState>,
}

/// One atomic unit of ledger writes for a single account.
#[derive(Debug, Clone, Default)]
pub struct LedgerCommit {
    pub account: Option<CloudAccount>,
    /// Inserted or updated by `credit_id`.
    pub credits: Vec<Credit>,
    /// Append only.
    pub applications: Vec<LedgerApplication>,
    /// Inserted or updated by `shortfall_id`.
    pub shortfalls: Vec<Shortfall>,
    /// Inserted or updated by `invoice_id`.
    pub invoices: Vec<Invoice>,
    /// Append only.
    pub notifications: Vec<NotificationEvent>,
    /// Append only.
    pub transitions: Vec<CreditStateTransition>,
    pub state: Option<ReconciliationState>,
}

impl LedgerCommit {
    pub fn is_empty(&self) -> bool {
        self.account.is_none()
            && self.credits.is_empty()
            && self.applications.is_empty()
            && self.shortfalls.is_empty()
            && self.invoices.is_empty()
            && self.notifications.is_empty()
            && self.transitions.is_empty()
            && self.state.is_none()
    }
}

/// Outcome of trying to reserve a coupon use for an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed,
    AlreadyRedeemed,
    Exhausted,
    Unavailable,
}

#[async_trait]
pub trait CreditStore: Send + Sync {
    async fn health_check(&self) -> Result<(), AppError>;

    // Accounts

    /// Returns false when the account already exists.
    async fn insert_account(&self, account: &CloudAccount) -> Result<bool, AppError>;
    async fn get_account(&self, account_id: Uuid) -> Result<Option<CloudAccount>, AppError>;
    async fn list_account_ids(&self) -> Result<Vec<Uuid>, AppError>;

    // Ledger reads

    async fn load_book(&self, account_id: Uuid) -> Result<Option<BookSnapshot>, AppError>;
    async fn list_credits(&self, account_id: Uuid) -> Result<Vec<Credit>, AppError>;
    async fn list_applications(&self, account_id: Uuid)
    -> Result<Vec<LedgerApplication>, AppError>;
    async fn list_shortfalls(&self, account_id: Uuid) -> Result<Vec<Shortfall>, AppError>;
    async fn list_transitions(
        &self,
        account_id: Uuid,
    ) -> Result<Vec<CreditStateTransition>, AppError>;

    // Usage

    /// Appends a usage record unless its transaction id has been seen before.
    async fn append_usage(
        &self,
        record: &UsageRecord,
        received_utc: DateTime<Utc>,
    ) -> Result<IngestOutcome, AppError>;
    /// Records with a sequence greater than `cursor`, in sequence order.
    async fn usage_after(&self, account_id: Uuid, cursor: i64)
    -> Result<Vec<StoredUsage>, AppError>;
    /// Records whose usage timestamp falls in `[from, to)`.
    async fn usage_between(
        &self,
        account_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<StoredUsage>, AppError>;

    // Invoices

    async fn get_invoice(&self, invoice_id: Uuid) -> Result<Option<Invoice>, AppError>;
    async fn list_invoices(&self, account_id: Option<Uuid>) -> Result<Vec<Invoice>, AppError>;

    // Notifications

    async fn list_notifications(&self, account_id: Uuid)
    -> Result<Vec<NotificationEvent>, AppError>;
    async fn pending_notifications(
        &self,
        account_id: Uuid,
    ) -> Result<Vec<NotificationEvent>, AppError>;
    async fn update_notification(&self, event: &NotificationEvent) -> Result<(), AppError>;

    // Atomic ledger write

    async fn commit(&self, commit: LedgerCommit) -> Result<(), AppError>;

    // Coupons

    /// Returns false when the code is taken.
    async fn insert_coupon(&self, coupon: &Coupon) -> Result<bool, AppError>;
    async fn get_coupon(&self, code: &str) -> Result<Option<Coupon>, AppError>;
    async fn list_coupons(&self) -> Result<Vec<Coupon>, AppError>;
    async fn disable_coupon(
        &self,
        code: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<Coupon>, AppError>;
    async fn list_redemptions(&self, code: &str) -> Result<Vec<Redemption>, AppError>;
    /// Atomically records the redemption and bumps the coupon's use count.
    async fn claim_redemption(&self, redemption: &Redemption) -> Result<ClaimOutcome, AppError>;
    /// Undoes a claim whose credit could not be granted.
    async fn release_redemption(&self, code: &str, account_id: Uuid) -> Result<(), AppError>;
}
