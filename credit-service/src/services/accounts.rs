//! Account enrollment, payment method, tier upgrades and termination policy.

use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::clock::Clock;
use crate::error::CreditError;
use crate::models::{AccountType, CloudAccount, EnrollAccount, UpgradeStatus};
use crate::services::locks::AccountLocks;
use crate::services::metrics::ACCOUNTS_ENROLLED;
use crate::services::store::{CreditStore, LedgerCommit};
use crate::workers::Reconciler;

pub struct AccountService {
    store: Arc<dyn CreditStore>,
    locks: Arc<AccountLocks>,
    clock: Arc<dyn Clock>,
    reconciler: Arc<Reconciler>,
}

impl AccountService {
    pub fn new(
        store: Arc<dyn CreditStore>,
        locks: Arc<AccountLocks>,
        clock: Arc<dyn Clock>,
        reconciler: Arc<Reconciler>,
    ) -> Self {
        Self {
            store,
            locks,
            clock,
            reconciler,
        }
    }

    #[instrument(skip(self, input), fields(account_type = %input.account_type))]
    pub async fn enroll(&self, input: EnrollAccount) -> Result<CloudAccount, CreditError> {
        input.validate()?;

        let account = CloudAccount::new(&input, self.clock.now());
        if !self.store.insert_account(&account).await? {
            return Err(CreditError::AccountExists(account.account_id));
        }

        ACCOUNTS_ENROLLED
            .with_label_values(&[account.account_type.as_str()])
            .inc();
        info!(account_id = %account.account_id, "Account enrolled");
        Ok(account)
    }

    /// The last committed account record.
    pub async fn get_account(&self, account_id: Uuid) -> Result<CloudAccount, CreditError> {
        self.store
            .get_account(account_id)
            .await?
            .ok_or(CreditError::AccountNotFound(account_id))
    }

    /// Puts a card on file, completing any upgrade that was waiting for one.
    #[instrument(skip(self))]
    pub async fn attach_payment_method(&self, account_id: Uuid) -> Result<CloudAccount, CreditError> {
        self.update(account_id, |account| {
            account.has_payment_method = true;
            for tier in [AccountType::Premium, AccountType::Enterprise] {
                if account.upgrade_status(tier) == Some(UpgradeStatus::PendingPaymentMethod) {
                    account.set_upgrade_status(tier, UpgradeStatus::Complete);
                    if tier > account.account_type {
                        account.account_type = tier;
                    }
                }
            }
            Ok(())
        })
        .await
    }

    /// Moves the account to a higher tier. Without a payment method the
    /// upgrade waits for one.
    #[instrument(skip(self))]
    pub async fn upgrade_account(
        &self,
        account_id: Uuid,
        target: AccountType,
    ) -> Result<CloudAccount, CreditError> {
        self.update(account_id, |account| {
            if target <= account.account_type {
                return Err(CreditError::InvalidRequest(format!(
                    "cannot upgrade {} account to {}",
                    account.account_type, target
                )));
            }
            if account.has_payment_method {
                account.account_type = target;
                account.set_upgrade_status(target, UpgradeStatus::Complete);
            } else {
                account.set_upgrade_status(target, UpgradeStatus::PendingPaymentMethod);
            }
            Ok(())
        })
        .await
    }

    /// Opts the account in or out of terminating paid services once it has
    /// neither credit nor a payment method.
    #[instrument(skip(self))]
    pub async fn set_termination_policy(
        &self,
        account_id: Uuid,
        enabled: bool,
    ) -> Result<CloudAccount, CreditError> {
        self.update(account_id, |account| {
            account.termination_policy = enabled;
            Ok(())
        })
        .await
    }

    /// Applies `change` under the account lock, commits, then reconciles so
    /// the derived flags reflect it straight away.
    async fn update<F>(&self, account_id: Uuid, change: F) -> Result<CloudAccount, CreditError>
    where
        F: FnOnce(&mut CloudAccount) -> Result<(), CreditError>,
    {
        {
            let _guard = self.locks.acquire(account_id).await;
            let mut account = self.get_account(account_id).await?;
            change(&mut account)?;
            account.updated_utc = self.clock.now();
            self.store
                .commit(LedgerCommit {
                    account: Some(account),
                    ..Default::default()
                })
                .await?;
        }

        if let Err(e) = self.reconciler.reconcile_account(account_id).await {
            warn!(account_id = %account_id, error = %e, "Immediate reconciliation failed");
        }
        self.get_account(account_id).await
    }
}
