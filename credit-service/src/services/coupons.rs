//! Coupon issuance and redemption.

use chrono::Duration;
use rand::Rng;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::clock::Clock;
use crate::config::CouponConfig;
use crate::error::CreditError;
use crate::models::{AddCredit, Coupon, CreateCoupon, Credit, CreditOrigin, Redemption};
use crate::services::ledger::CreditLedger;
use crate::services::locks::AccountLocks;
use crate::services::metrics::COUPON_REDEMPTIONS_TOTAL;
use crate::services::store::{ClaimOutcome, CreditStore, LedgerCommit};
use crate::workers::Reconciler;

/// Unambiguous characters for generated codes.
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

fn generate_code() -> String {
    let mut rng = rand::thread_rng();
    (0..3)
        .map(|_| {
            (0..4)
                .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
                .collect::<String>()
        })
        .collect::<Vec<_>>()
        .join("-")
}

fn rejected(code: &str, reason: &str) -> CreditError {
    COUPON_REDEMPTIONS_TOTAL.with_label_values(&["rejected"]).inc();
    CreditError::CouponRejected {
        code: code.to_string(),
        reason: reason.to_string(),
    }
}

pub struct CouponService {
    store: Arc<dyn CreditStore>,
    ledger: Arc<CreditLedger>,
    locks: Arc<AccountLocks>,
    clock: Arc<dyn Clock>,
    reconciler: Arc<Reconciler>,
    config: CouponConfig,
}

impl CouponService {
    pub fn new(
        store: Arc<dyn CreditStore>,
        ledger: Arc<CreditLedger>,
        locks: Arc<AccountLocks>,
        clock: Arc<dyn Clock>,
        reconciler: Arc<Reconciler>,
        config: CouponConfig,
    ) -> Self {
        Self {
            store,
            ledger,
            locks,
            clock,
            reconciler,
            config,
        }
    }

    #[instrument(skip(self, input), fields(creator = %input.creator, amount = %input.amount))]
    pub async fn create(&self, input: CreateCoupon) -> Result<Coupon, CreditError> {
        input.validate()?;
        if input.amount <= Decimal::ZERO {
            return Err(CreditError::InvalidAmount(format!(
                "coupon amount must be positive, got {}",
                input.amount
            )));
        }

        let max_uses = if input.is_standard {
            self.config.max_uses_standard
        } else {
            self.config.max_uses_non_standard
        };
        if input.num_uses > max_uses {
            return Err(CreditError::InvalidRequest(format!(
                "num_uses {} exceeds the limit of {}",
                input.num_uses, max_uses
            )));
        }

        let now = self.clock.now();
        let start_utc = input.start_utc.unwrap_or(now);
        let expires_utc = input
            .expires_utc
            .unwrap_or(start_utc + Duration::days(self.config.default_validity_days));
        if expires_utc <= now || expires_utc <= start_utc {
            return Err(CreditError::InvalidRequest(format!(
                "coupon expiry {} must be after both now and its start {}",
                expires_utc, start_utc
            )));
        }

        let coupon = Coupon {
            code: input.code.clone().unwrap_or_else(generate_code),
            amount: input.amount,
            creator: input.creator.clone(),
            is_standard: input.is_standard,
            num_uses: input.num_uses,
            num_redeemed: 0,
            start_utc,
            expires_utc,
            created_utc: now,
            disabled_utc: None,
        };
        if !self.store.insert_coupon(&coupon).await? {
            return Err(CreditError::CouponExists(coupon.code));
        }

        info!(code = %coupon.code, "Coupon created");
        Ok(coupon)
    }

    /// Redeems a coupon into a credit on the account.
    #[instrument(skip(self))]
    pub async fn redeem(&self, code: &str, account_id: Uuid) -> Result<Credit, CreditError> {
        let now = self.clock.now();
        let coupon = self.get(code).await?;

        if coupon.is_disabled() {
            return Err(rejected(code, "coupon is disabled"));
        }
        if coupon.start_utc > now {
            return Err(rejected(code, "coupon is not active yet"));
        }
        if coupon.expires_utc <= now {
            return Err(rejected(code, "coupon has expired"));
        }

        let account = self
            .store
            .get_account(account_id)
            .await?
            .ok_or(CreditError::AccountNotFound(account_id))?;

        if self
            .store
            .list_redemptions(code)
            .await?
            .iter()
            .any(|r| r.account_id == account_id)
        {
            COUPON_REDEMPTIONS_TOTAL.with_label_values(&["rejected"]).inc();
            return Err(CreditError::CouponAlreadyRedeemed(code.to_string()));
        }
        if coupon.is_standard != account.account_type.is_standard() {
            let reason = if coupon.is_standard {
                "standard coupons cannot be redeemed by premium or enterprise accounts"
            } else {
                "only premium or enterprise accounts can redeem this coupon"
            };
            return Err(rejected(code, reason));
        }
        if coupon.uses_left() == 0 {
            return Err(rejected(code, "coupon has no uses left"));
        }

        let claim = Redemption {
            code: code.to_string(),
            account_id,
            redeemed_utc: now,
        };
        match self.store.claim_redemption(&claim).await? {
            ClaimOutcome::Claimed => {}
            ClaimOutcome::AlreadyRedeemed => {
                COUPON_REDEMPTIONS_TOTAL.with_label_values(&["rejected"]).inc();
                return Err(CreditError::CouponAlreadyRedeemed(code.to_string()));
            }
            ClaimOutcome::Exhausted => return Err(rejected(code, "coupon has no uses left")),
            ClaimOutcome::Unavailable => return Err(rejected(code, "coupon is disabled")),
        }

        let credit = match self
            .ledger
            .add_credit(AddCredit {
                account_id,
                amount: coupon.amount,
                expires_utc: coupon.expires_utc,
                origin: CreditOrigin::Coupon,
                coupon_code: Some(coupon.code.clone()),
            })
            .await
        {
            Ok(credit) => credit,
            Err(e) => {
                warn!(error = %e, "Credit grant failed, releasing coupon claim");
                self.store.release_redemption(code, account_id).await?;
                COUPON_REDEMPTIONS_TOTAL.with_label_values(&["failed"]).inc();
                return Err(e);
            }
        };

        self.clear_termination_policy(account_id).await?;
        if let Err(e) = self.reconciler.reconcile_account(account_id).await {
            warn!(account_id = %account_id, error = %e, "Immediate reconciliation failed");
        }

        COUPON_REDEMPTIONS_TOTAL.with_label_values(&["redeemed"]).inc();
        info!(credit_id = %credit.credit_id, amount = %credit.granted_amount, "Coupon redeemed");
        Ok(credit)
    }

    async fn clear_termination_policy(&self, account_id: Uuid) -> Result<(), CreditError> {
        let _guard = self.locks.acquire(account_id).await;
        let Some(mut account) = self.store.get_account(account_id).await? else {
            return Err(CreditError::AccountNotFound(account_id));
        };
        if !account.termination_policy {
            return Ok(());
        }
        account.termination_policy = false;
        account.updated_utc = self.clock.now();
        self.store
            .commit(LedgerCommit {
                account: Some(account),
                ..Default::default()
            })
            .await?;
        Ok(())
    }

    /// Stops further redemptions. Credits already granted are unaffected.
    #[instrument(skip(self))]
    pub async fn disable(&self, code: &str) -> Result<Coupon, CreditError> {
        self.store
            .disable_coupon(code, self.clock.now())
            .await?
            .ok_or_else(|| CreditError::CouponNotFound(code.to_string()))
    }

    pub async fn get(&self, code: &str) -> Result<Coupon, CreditError> {
        self.store
            .get_coupon(code)
            .await?
            .ok_or_else(|| CreditError::CouponNotFound(code.to_string()))
    }

    pub async fn list(&self) -> Result<Vec<Coupon>, CreditError> {
        Ok(self.store.list_coupons().await?)
    }
}
