//! Cloud account model and its derived entitlement flags.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

/// Commercial tier of an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountType {
    Standard,
    Premium,
    Enterprise,
}

impl AccountType {
    pub const ALL: [AccountType; 3] = [Self::Standard, Self::Premium, Self::Enterprise];

    /// Get string representation for database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Premium => "premium",
            Self::Enterprise => "enterprise",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "standard" => Some(Self::Standard),
            "premium" => Some(Self::Premium),
            "enterprise" => Some(Self::Enterprise),
            _ => None,
        }
    }

    /// Coupons are split into standard and non-standard (premium, enterprise) pools.
    pub fn is_standard(&self) -> bool {
        matches!(self, Self::Standard)
    }
}

impl std::fmt::Display for AccountType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Progress of a tier upgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpgradeStatus {
    NotInitiated,
    PendingPaymentMethod,
    Complete,
}

impl UpgradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotInitiated => "not_initiated",
            Self::PendingPaymentMethod => "pending_payment_method",
            Self::Complete => "complete",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "not_initiated" => Some(Self::NotInitiated),
            "pending_payment_method" => Some(Self::PendingPaymentMethod),
            "complete" => Some(Self::Complete),
            _ => None,
        }
    }
}

/// A billable customer and the entitlement flags the reconciliation loop
/// maintains on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudAccount {
    pub account_id: Uuid,
    pub account_type: AccountType,
    pub owner_email: String,
    pub country_code: String,
    pub has_payment_method: bool,
    pub paid_services_allowed: bool,
    pub low_credits: bool,
    pub terminate_paid_services: bool,
    /// Opt-in for terminating paid services once credits and payment are both gone.
    pub termination_policy: bool,
    /// Instant of the most recent transition into the depleted state.
    /// Holds the epoch until the account depletes for the first time.
    pub credits_depleted: DateTime<Utc>,
    pub premium_upgrade: UpgradeStatus,
    pub enterprise_upgrade: UpgradeStatus,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl CloudAccount {
    /// Sentinel stored in `credits_depleted` before the first depletion.
    pub fn never_depleted() -> DateTime<Utc> {
        DateTime::<Utc>::UNIX_EPOCH
    }

    pub fn has_depleted(&self) -> bool {
        self.credits_depleted != Self::never_depleted()
    }

    pub fn upgrade_status(&self, tier: AccountType) -> Option<UpgradeStatus> {
        match tier {
            AccountType::Standard => None,
            AccountType::Premium => Some(self.premium_upgrade),
            AccountType::Enterprise => Some(self.enterprise_upgrade),
        }
    }

    pub fn set_upgrade_status(&mut self, tier: AccountType, status: UpgradeStatus) {
        match tier {
            AccountType::Standard => {}
            AccountType::Premium => self.premium_upgrade = status,
            AccountType::Enterprise => self.enterprise_upgrade = status,
        }
    }

    pub fn new(input: &EnrollAccount, now: DateTime<Utc>) -> Self {
        Self {
            account_id: input.account_id.unwrap_or_else(Uuid::new_v4),
            account_type: input.account_type,
            owner_email: input.owner_email.clone(),
            country_code: input.country_code.to_ascii_uppercase(),
            has_payment_method: input.has_payment_method,
            paid_services_allowed: input.has_payment_method,
            low_credits: false,
            terminate_paid_services: false,
            termination_policy: input.termination_policy,
            credits_depleted: Self::never_depleted(),
            premium_upgrade: UpgradeStatus::NotInitiated,
            enterprise_upgrade: UpgradeStatus::NotInitiated,
            created_utc: now,
            updated_utc: now,
        }
    }
}

/// Input for enrolling an account.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct EnrollAccount {
    pub account_id: Option<Uuid>,
    pub account_type: AccountType,
    #[validate(email)]
    pub owner_email: String,
    #[validate(length(equal = 2))]
    pub country_code: String,
    #[serde(default)]
    pub has_payment_method: bool,
    #[serde(default)]
    pub termination_policy: bool,
}
