//! Credit usage notifications and the per-account reconciliation state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationKind {
    /// Remaining credit dropped to the low-credit threshold.
    EightyPercent,
    /// Remaining credit reached zero.
    HundredPercent,
    /// A credit expired with balance left on it.
    Expired,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EightyPercent => "EIGHTY_PERCENT",
            Self::HundredPercent => "HUNDRED_PERCENT",
            Self::Expired => "EXPIRED",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "EIGHTY_PERCENT" => Some(Self::EightyPercent),
            "HUNDRED_PERCENT" => Some(Self::HundredPercent),
            "EXPIRED" => Some(Self::Expired),
            _ => None,
        }
    }

    pub fn subject(&self) -> &'static str {
        match self {
            Self::EightyPercent => "80% of your cloud credits have been used",
            Self::HundredPercent => "Your cloud credits have been used up",
            Self::Expired => "Your cloud credits have expired",
        }
    }
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    /// Not sent because delivery policy excludes the account.
    Suppressed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Delivered => "delivered",
            Self::Suppressed => "suppressed",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "delivered" => Some(Self::Delivered),
            "suppressed" => Some(Self::Suppressed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub event_id: Uuid,
    pub account_id: Uuid,
    pub kind: NotificationKind,
    /// The expired credit, for `Expired` events.
    pub credit_id: Option<Uuid>,
    pub fired_utc: DateTime<Utc>,
    pub delivery: DeliveryStatus,
    pub attempts: u32,
    pub delivered_utc: Option<DateTime<Utc>>,
}

impl NotificationEvent {
    pub fn new(
        account_id: Uuid,
        kind: NotificationKind,
        credit_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            account_id,
            kind,
            credit_id,
            fired_utc: now,
            delivery: DeliveryStatus::Pending,
            attempts: 0,
            delivered_utc: None,
        }
    }
}

/// Which one-shot notifications have fired since they were last armed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationMarks {
    pub eighty_fired: bool,
    pub hundred_fired: bool,
    pub expired_credits: BTreeSet<Uuid>,
}

/// Derived credit health of an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditState {
    Healthy,
    LowCredit,
    Depleted,
}

impl CreditState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::LowCredit => "low_credit",
            Self::Depleted => "depleted",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "healthy" => Some(Self::Healthy),
            "low_credit" => Some(Self::LowCredit),
            "depleted" => Some(Self::Depleted),
            _ => None,
        }
    }
}

impl std::fmt::Display for CreditState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One row of the credit state log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditStateTransition {
    pub account_id: Uuid,
    pub from_state: CreditState,
    pub to_state: CreditState,
    pub remaining: rust_decimal::Decimal,
    pub at: DateTime<Utc>,
}

/// Everything the reconciliation loop remembers about an account between ticks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationState {
    pub account_id: Uuid,
    /// Sequence of the last usage record charged.
    pub cursor: i64,
    pub credit_state: CreditState,
    /// Set once the account has been healthy after its last depletion.
    pub healthy_since_depletion: bool,
    pub marks: NotificationMarks,
    /// Low-credit base of the current cycle, taken when the last credit was
    /// granted. `None` until the first grant is recorded.
    pub grant_base: Option<rust_decimal::Decimal>,
    pub last_run_utc: Option<DateTime<Utc>>,
}

impl ReconciliationState {
    pub fn new(account_id: Uuid) -> Self {
        Self {
            account_id,
            cursor: 0,
            credit_state: CreditState::Healthy,
            healthy_since_depletion: true,
            marks: NotificationMarks::default(),
            grant_base: None,
            last_run_utc: None,
        }
    }
}
