//! Entitlement gate: derives account flags from a ledger snapshot.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::CreditError;
use crate::models::{AccountType, CloudAccount, CreditState};
use crate::services::ledger::AccountBook;
use crate::services::pricing::PriceTable;
use crate::services::store::CreditStore;

/// Consumed percentage at which an account counts as low on credit, per tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LowCreditThresholds {
    pub standard: u8,
    pub premium: u8,
    pub enterprise: u8,
}

impl Default for LowCreditThresholds {
    fn default() -> Self {
        Self::uniform(80)
    }
}

impl LowCreditThresholds {
    pub fn uniform(percent_consumed: u8) -> Self {
        Self {
            standard: percent_consumed,
            premium: percent_consumed,
            enterprise: percent_consumed,
        }
    }

    pub fn percent_consumed(&self, account_type: AccountType) -> u8 {
        let pct = match account_type {
            AccountType::Standard => self.standard,
            AccountType::Premium => self.premium,
            AccountType::Enterprise => self.enterprise,
        };
        pct.min(100)
    }

    /// Fraction of the original grant that may remain at the threshold.
    pub fn remaining_fraction(&self, account_type: AccountType) -> Decimal {
        Decimal::from(100 - self.percent_consumed(account_type)) / Decimal::from(100)
    }
}

/// The ledger figures the gate reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerSnapshot {
    pub has_credits: bool,
    pub remaining: Decimal,
    pub original_grant: Decimal,
}

impl LedgerSnapshot {
    pub fn of(book: &AccountBook, now: DateTime<Utc>) -> Self {
        Self {
            has_credits: book.has_credits(),
            remaining: book.totals(now).remaining,
            original_grant: book.grant_base(now),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entitlement {
    pub paid_services_allowed: bool,
    pub low_credits: bool,
    pub terminate_paid_services: bool,
}

impl Entitlement {
    /// Writes the flags onto the account. Returns true if any changed.
    pub fn apply_to(&self, account: &mut CloudAccount) -> bool {
        let changed = account.paid_services_allowed != self.paid_services_allowed
            || account.low_credits != self.low_credits
            || account.terminate_paid_services != self.terminate_paid_services;
        account.paid_services_allowed = self.paid_services_allowed;
        account.low_credits = self.low_credits;
        account.terminate_paid_services = self.terminate_paid_services;
        changed
    }
}

/// A paid sku switched off for an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductQuota {
    pub product_type: String,
    pub quota: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeactivationEntry {
    pub account_id: Uuid,
    pub account_type: AccountType,
    pub owner_email: String,
    /// Start of the current depletion, `None` if credits never ran out.
    pub credits_depleted: Option<DateTime<Utc>>,
    /// Depleted for at least the cleanup threshold.
    pub cleanup_due: bool,
    pub quotas: Vec<ProductQuota>,
}

pub const DEFAULT_CLEANUP_THRESHOLD_DAYS: i64 = 30;

/// True once an account has been out of credit for `threshold_days`.
pub fn cleanup_due(account: &CloudAccount, now: DateTime<Utc>, threshold_days: i64) -> bool {
    account.has_depleted() && now >= account.credits_depleted + Duration::days(threshold_days)
}

#[derive(Debug, Clone)]
pub struct EntitlementGate {
    thresholds: LowCreditThresholds,
    cleanup_threshold_days: i64,
}

impl Default for EntitlementGate {
    fn default() -> Self {
        Self::new(LowCreditThresholds::default())
    }
}

impl EntitlementGate {
    pub fn new(thresholds: LowCreditThresholds) -> Self {
        Self {
            thresholds,
            cleanup_threshold_days: DEFAULT_CLEANUP_THRESHOLD_DAYS,
        }
    }

    pub fn with_cleanup_threshold_days(mut self, days: i64) -> Self {
        self.cleanup_threshold_days = days.max(0);
        self
    }

    pub fn thresholds(&self) -> &LowCreditThresholds {
        &self.thresholds
    }

    /// Pure derivation of the account flags.
    pub fn evaluate(&self, account: &CloudAccount, ledger: &LedgerSnapshot) -> Entitlement {
        let low_credits = ledger.has_credits
            && ledger.remaining
                <= self.thresholds.remaining_fraction(account.account_type) * ledger.original_grant;
        let paid_services_allowed = ledger.remaining > Decimal::ZERO || account.has_payment_method;

        Entitlement {
            paid_services_allowed,
            low_credits,
            terminate_paid_services: account.termination_policy && !paid_services_allowed,
        }
    }

    /// Credit health implied by a snapshot and its entitlement.
    pub fn credit_state(&self, ledger: &LedgerSnapshot, entitlement: &Entitlement) -> CreditState {
        if ledger.has_credits && ledger.remaining.is_zero() {
            CreditState::Depleted
        } else if entitlement.low_credits {
            CreditState::LowCredit
        } else {
            CreditState::Healthy
        }
    }

    /// Accounts whose paid services must be switched off, with every paid sku
    /// at quota zero. `threshold_days` overrides the configured cleanup
    /// threshold for this listing.
    #[instrument(skip_all)]
    pub async fn deactivation_list(
        &self,
        store: &dyn CreditStore,
        prices: &PriceTable,
        clock: &dyn Clock,
        threshold_days: Option<i64>,
    ) -> Result<Vec<DeactivationEntry>, CreditError> {
        let now = clock.now();
        let threshold_days = threshold_days
            .map(|days| days.max(0))
            .unwrap_or(self.cleanup_threshold_days);
        let paid_products = prices.paid_products();
        let mut entries = Vec::new();

        for account_id in store.list_account_ids().await? {
            let Some(snapshot) = store.load_book(account_id).await? else {
                continue;
            };
            let book = AccountBook::from_snapshot(snapshot);
            let entitlement = self.evaluate(book.account(), &LedgerSnapshot::of(&book, now));
            if !entitlement.terminate_paid_services {
                continue;
            }

            let account = book.account();
            entries.push(DeactivationEntry {
                account_id: account.account_id,
                account_type: account.account_type,
                owner_email: account.owner_email.clone(),
                credits_depleted: account.has_depleted().then_some(account.credits_depleted),
                cleanup_due: cleanup_due(account, now, threshold_days),
                quotas: paid_products
                    .iter()
                    .map(|sku| ProductQuota {
                        product_type: sku.clone(),
                        quota: 0,
                    })
                    .collect(),
            });
        }

        debug!(threshold_days, count = entries.len(), "Deactivation list built");
        Ok(entries)
    }
}
