//! Prepaid credits and the charge records drawn against them.

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Where a credit came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditOrigin {
    Coupon,
    Grant,
}

impl CreditOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Coupon => "coupon",
            Self::Grant => "grant",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "coupon" => Some(Self::Coupon),
            "grant" => Some(Self::Grant),
            _ => None,
        }
    }
}

/// A prepaid grant with an expiry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credit {
    pub credit_id: Uuid,
    pub account_id: Uuid,
    pub origin: CreditOrigin,
    pub coupon_code: Option<String>,
    pub granted_amount: Decimal,
    pub remaining_amount: Decimal,
    pub created_utc: DateTime<Utc>,
    pub expires_utc: DateTime<Utc>,
}

impl Credit {
    pub fn used_amount(&self) -> Decimal {
        self.granted_amount - self.remaining_amount
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_utc <= now
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining_amount <= Decimal::ZERO
    }

    /// Unexpired with something left to draw.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        !self.is_expired(now) && !self.is_exhausted()
    }
}

/// Input for granting a credit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddCredit {
    pub account_id: Uuid,
    pub amount: Decimal,
    pub expires_utc: DateTime<Utc>,
    #[serde(default = "default_origin")]
    pub origin: CreditOrigin,
    #[serde(default)]
    pub coupon_code: Option<String>,
}

fn default_origin() -> CreditOrigin {
    CreditOrigin::Grant
}

/// Account level credit totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CreditTotals {
    /// Consumed across every credit, expired ones included.
    pub used: Decimal,
    /// Spendable balance across unexpired credits.
    pub remaining: Decimal,
    /// Usage no credit could cover and that has not been settled since.
    pub unapplied: Decimal,
}

/// A calendar-month billing period, `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BillingPeriod {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl BillingPeriod {
    /// The calendar month containing `instant`.
    pub fn containing(instant: DateTime<Utc>) -> Self {
        let start = NaiveDate::from_ymd_opt(instant.year(), instant.month(), 1)
            .unwrap_or_else(|| instant.date_naive());
        Self::starting(start)
    }

    /// The calendar month beginning at `start` (day is ignored).
    pub fn starting(start: NaiveDate) -> Self {
        let start = start.with_day(1).unwrap_or(start);
        let (year, month) = if start.month() == 12 {
            (start.year() + 1, 1)
        } else {
            (start.year(), start.month() + 1)
        };
        let end = NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(start);
        Self { start, end }
    }

    /// A period is closed once `now` has reached its exclusive end.
    pub fn is_closed(&self, now: DateTime<Utc>) -> bool {
        now >= self.end_instant()
    }

    pub fn start_instant(&self) -> DateTime<Utc> {
        Utc.from_utc_datetime(&self.start.and_time(chrono::NaiveTime::MIN))
    }

    pub fn end_instant(&self) -> DateTime<Utc> {
        Utc.from_utc_datetime(&self.end.and_time(chrono::NaiveTime::MIN))
    }
}

impl std::fmt::Display for BillingPeriod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.start.format("%Y-%m"))
    }
}

/// Amount drawn from one credit by one application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditCharge {
    pub credit_id: Uuid,
    pub amount: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationKind {
    /// Rated usage charged against credits.
    Usage,
    /// An outstanding shortfall later covered by a new credit.
    Settlement,
}

impl ApplicationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Usage => "usage",
            Self::Settlement => "settlement",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "usage" => Some(Self::Usage),
            "settlement" => Some(Self::Settlement),
            _ => None,
        }
    }
}

/// Immutable record of one charge against the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerApplication {
    pub application_id: Uuid,
    pub account_id: Uuid,
    pub kind: ApplicationKind,
    pub product_type: Option<String>,
    /// Usage transaction that produced the charge, when there is one.
    pub transaction_id: Option<String>,
    /// Shortfall being settled, for settlement applications.
    pub shortfall_id: Option<Uuid>,
    pub period: BillingPeriod,
    pub amount: Decimal,
    pub charges: Vec<CreditCharge>,
    pub unapplied_amount: Decimal,
    pub created_utc: DateTime<Utc>,
}

impl LedgerApplication {
    pub fn charged_amount(&self) -> Decimal {
        self.charges.iter().map(|c| c.amount).sum()
    }
}

/// Result of charging an amount against an account's credits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageApplication {
    pub application: LedgerApplication,
    pub charged: Decimal,
    pub unapplied: Decimal,
    /// Account remaining balance after the charge.
    pub remaining: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShortfallStatus {
    Outstanding,
    Invoiced,
    Settled,
    WrittenOff,
}

impl ShortfallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Outstanding => "outstanding",
            Self::Invoiced => "invoiced",
            Self::Settled => "settled",
            Self::WrittenOff => "written_off",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "outstanding" => Some(Self::Outstanding),
            "invoiced" => Some(Self::Invoiced),
            "settled" => Some(Self::Settled),
            "written_off" => Some(Self::WrittenOff),
            _ => None,
        }
    }
}

/// Usage that exceeded available credit at the time it was applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shortfall {
    pub shortfall_id: Uuid,
    pub account_id: Uuid,
    pub application_id: Uuid,
    pub product_type: Option<String>,
    pub period: BillingPeriod,
    pub original_amount: Decimal,
    /// Part still owed. Reduced by settlements, zero once settled.
    pub amount: Decimal,
    pub status: ShortfallStatus,
    pub invoice_id: Option<Uuid>,
    pub created_utc: DateTime<Utc>,
}

impl Shortfall {
    pub fn is_outstanding(&self) -> bool {
        self.status == ShortfallStatus::Outstanding && self.amount > Decimal::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_billing_period_boundaries() {
        let instant = Utc.with_ymd_and_hms(2024, 12, 31, 23, 59, 59).unwrap();
        let period = BillingPeriod::containing(instant);
        assert_eq!(period.start, NaiveDate::from_ymd_opt(2024, 12, 1).unwrap());
        assert_eq!(period.end, NaiveDate::from_ymd_opt(2025, 1, 1).unwrap());
        assert!(!period.is_closed(instant));
        assert!(period.is_closed(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()));
        assert_eq!(period.to_string(), "2024-12");
    }

    #[test]
    fn test_credit_activity() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let mut credit = Credit {
            credit_id: Uuid::new_v4(),
            account_id: Uuid::new_v4(),
            origin: CreditOrigin::Grant,
            coupon_code: None,
            granted_amount: Decimal::new(100, 0),
            remaining_amount: Decimal::new(40, 0),
            created_utc: now,
            expires_utc: now + chrono::Duration::days(1),
        };
        assert!(credit.is_active(now));
        assert_eq!(credit.used_amount(), Decimal::new(60, 0));
        assert!(!credit.is_active(credit.expires_utc));

        credit.remaining_amount = Decimal::ZERO;
        assert!(credit.is_exhausted());
        assert!(!credit.is_active(now));
    }
}
