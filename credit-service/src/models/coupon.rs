//! Coupons that grant credits on redemption.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coupon {
    pub code: String,
    pub amount: Decimal,
    pub creator: String,
    /// Standard coupons are only redeemable by standard accounts and vice versa.
    pub is_standard: bool,
    pub num_uses: u32,
    pub num_redeemed: u32,
    pub start_utc: DateTime<Utc>,
    pub expires_utc: DateTime<Utc>,
    pub created_utc: DateTime<Utc>,
    pub disabled_utc: Option<DateTime<Utc>>,
}

impl Coupon {
    pub fn is_disabled(&self) -> bool {
        self.disabled_utc.is_some()
    }

    pub fn uses_left(&self) -> u32 {
        self.num_uses.saturating_sub(self.num_redeemed)
    }
}

/// Input for creating a coupon.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateCoupon {
    /// Generated when absent.
    #[validate(length(min = 4, max = 64))]
    pub code: Option<String>,
    pub amount: Decimal,
    #[validate(email)]
    pub creator: String,
    #[serde(default = "default_standard")]
    pub is_standard: bool,
    #[validate(range(min = 1))]
    pub num_uses: u32,
    pub start_utc: Option<DateTime<Utc>>,
    pub expires_utc: Option<DateTime<Utc>>,
}

fn default_standard() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Redemption {
    pub code: String,
    pub account_id: Uuid,
    pub redeemed_utc: DateTime<Utc>,
}
