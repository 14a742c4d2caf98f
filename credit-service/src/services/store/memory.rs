//! In-memory store used by tests and single-node deployments.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{BookSnapshot, ClaimOutcome, CreditStore, LedgerCommit};
use crate::models::{
    CloudAccount, Coupon, Credit, CreditStateTransition, DeliveryStatus, IngestOutcome, Invoice,
    LedgerApplication, NotificationEvent, ReconciliationState, Redemption, Shortfall,
    StoredUsage, UsageRecord,
};

#[derive(Debug, Default)]
struct Tables {
    accounts: BTreeMap<Uuid, CloudAccount>,
    credits: HashMap<Uuid, Credit>,
    applications: Vec<LedgerApplication>,
    shortfalls: HashMap<Uuid, Shortfall>,
    invoices: HashMap<Uuid, Invoice>,
    notifications: Vec<NotificationEvent>,
    transitions: Vec<CreditStateTransition>,
    states: HashMap<Uuid, ReconciliationState>,
    usage: Vec<StoredUsage>,
    transaction_ids: HashSet<String>,
    next_sequence: i64,
    coupons: BTreeMap<String, Coupon>,
    redemptions: Vec<Redemption>,
}

/// All tables behind one lock, so a commit is trivially atomic.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sorted_by_created<T, K: Ord>(mut items: Vec<T>, key: impl Fn(&T) -> K) -> Vec<T> {
    items.sort_by_key(|item| key(item));
    items
}

#[async_trait]
impl CreditStore for InMemoryStore {
    async fn health_check(&self) -> Result<(), AppError> {
        Ok(())
    }

    async fn insert_account(&self, account: &CloudAccount) -> Result<bool, AppError> {
        let mut tables = self.tables.write().await;
        if tables.accounts.contains_key(&account.account_id) {
            return Ok(false);
        }
        tables.accounts.insert(account.account_id, account.clone());
        Ok(true)
    }

    async fn get_account(&self, account_id: Uuid) -> Result<Option<CloudAccount>, AppError> {
        Ok(self.tables.read().await.accounts.get(&account_id).cloned())
    }

    async fn list_account_ids(&self) -> Result<Vec<Uuid>, AppError> {
        Ok(self.tables.read().await.accounts.keys().copied().collect())
    }

    async fn load_book(&self, account_id: Uuid) -> Result<Option<BookSnapshot>, AppError> {
        let tables = self.tables.read().await;
        let Some(account) = tables.accounts.get(&account_id).cloned() else {
            return Ok(None);
        };

        let credits = tables
            .credits
            .values()
            .filter(|c| c.account_id == account_id)
            .cloned()
            .collect();
        let shortfalls = tables
            .shortfalls
            .values()
            .filter(|s| s.account_id == account_id)
            .cloned()
            .collect::<Vec<_>>();

        Ok(Some(BookSnapshot {
            account,
            credits,
            shortfalls: sorted_by_created(shortfalls, |s| (s.created_utc, s.shortfall_id)),
            state: tables.states.get(&account_id).cloned(),
        }))
    }

    async fn list_credits(&self, account_id: Uuid) -> Result<Vec<Credit>, AppError> {
        let tables = self.tables.read().await;
        let credits = tables
            .credits
            .values()
            .filter(|c| c.account_id == account_id)
            .cloned()
            .collect();
        Ok(sorted_by_created(credits, |c| (c.created_utc, c.credit_id)))
    }

    async fn list_applications(
        &self,
        account_id: Uuid,
    ) -> Result<Vec<LedgerApplication>, AppError> {
        let tables = self.tables.read().await;
        Ok(tables
            .applications
            .iter()
            .filter(|a| a.account_id == account_id)
            .cloned()
            .collect())
    }

    async fn list_shortfalls(&self, account_id: Uuid) -> Result<Vec<Shortfall>, AppError> {
        let tables = self.tables.read().await;
        let shortfalls = tables
            .shortfalls
            .values()
            .filter(|s| s.account_id == account_id)
            .cloned()
            .collect();
        Ok(sorted_by_created(shortfalls, |s| (s.created_utc, s.shortfall_id)))
    }

    async fn list_transitions(
        &self,
        account_id: Uuid,
    ) -> Result<Vec<CreditStateTransition>, AppError> {
        let tables = self.tables.read().await;
        Ok(tables
            .transitions
            .iter()
            .filter(|t| t.account_id == account_id)
            .cloned()
            .collect())
    }

    async fn append_usage(
        &self,
        record: &UsageRecord,
        received_utc: DateTime<Utc>,
    ) -> Result<IngestOutcome, AppError> {
        let mut tables = self.tables.write().await;
        if !tables.transaction_ids.insert(record.transaction_id.clone()) {
            return Ok(IngestOutcome::Duplicate);
        }
        tables.next_sequence += 1;
        let sequence = tables.next_sequence;
        tables.usage.push(StoredUsage {
            sequence,
            record: record.clone(),
            received_utc,
        });
        Ok(IngestOutcome::Accepted { sequence })
    }

    async fn usage_after(
        &self,
        account_id: Uuid,
        cursor: i64,
    ) -> Result<Vec<StoredUsage>, AppError> {
        let tables = self.tables.read().await;
        Ok(tables
            .usage
            .iter()
            .filter(|u| u.record.account_id == account_id && u.sequence > cursor)
            .cloned()
            .collect())
    }

    async fn usage_between(
        &self,
        account_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<StoredUsage>, AppError> {
        let tables = self.tables.read().await;
        Ok(tables
            .usage
            .iter()
            .filter(|u| {
                u.record.account_id == account_id
                    && u.record.timestamp >= from
                    && u.record.timestamp < to
            })
            .cloned()
            .collect())
    }

    async fn get_invoice(&self, invoice_id: Uuid) -> Result<Option<Invoice>, AppError> {
        Ok(self.tables.read().await.invoices.get(&invoice_id).cloned())
    }

    async fn list_invoices(&self, account_id: Option<Uuid>) -> Result<Vec<Invoice>, AppError> {
        let tables = self.tables.read().await;
        let invoices = tables
            .invoices
            .values()
            .filter(|i| account_id.map_or(true, |id| i.account_id == id))
            .cloned()
            .collect();
        Ok(sorted_by_created(invoices, |i| (i.created_utc, i.invoice_id)))
    }

    async fn list_notifications(
        &self,
        account_id: Uuid,
    ) -> Result<Vec<NotificationEvent>, AppError> {
        let tables = self.tables.read().await;
        Ok(tables
            .notifications
            .iter()
            .filter(|n| n.account_id == account_id)
            .cloned()
            .collect())
    }

    async fn pending_notifications(
        &self,
        account_id: Uuid,
    ) -> Result<Vec<NotificationEvent>, AppError> {
        let tables = self.tables.read().await;
        Ok(tables
            .notifications
            .iter()
            .filter(|n| n.account_id == account_id && n.delivery == DeliveryStatus::Pending)
            .cloned()
            .collect())
    }

    async fn update_notification(&self, event: &NotificationEvent) -> Result<(), AppError> {
        let mut tables = self.tables.write().await;
        let Some(existing) = tables
            .notifications
            .iter_mut()
            .find(|n| n.event_id == event.event_id)
        else {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "notification {} not found",
                event.event_id
            )));
        };
        *existing = event.clone();
        Ok(())
    }

    async fn commit(&self, commit: LedgerCommit) -> Result<(), AppError> {
        let mut tables = self.tables.write().await;

        if let Some(account) = commit.account {
            if !tables.accounts.contains_key(&account.account_id) {
                return Err(AppError::NotFound(anyhow::anyhow!(
                    "account {} not found",
                    account.account_id
                )));
            }
            tables.accounts.insert(account.account_id, account);
        }
        for credit in commit.credits {
            tables.credits.insert(credit.credit_id, credit);
        }
        tables.applications.extend(commit.applications);
        for shortfall in commit.shortfalls {
            tables.shortfalls.insert(shortfall.shortfall_id, shortfall);
        }
        for invoice in commit.invoices {
            tables.invoices.insert(invoice.invoice_id, invoice);
        }
        tables.notifications.extend(commit.notifications);
        tables.transitions.extend(commit.transitions);
        if let Some(state) = commit.state {
            tables.states.insert(state.account_id, state);
        }
        Ok(())
    }

    async fn insert_coupon(&self, coupon: &Coupon) -> Result<bool, AppError> {
        let mut tables = self.tables.write().await;
        if tables.coupons.contains_key(&coupon.code) {
            return Ok(false);
        }
        tables.coupons.insert(coupon.code.clone(), coupon.clone());
        Ok(true)
    }

    async fn get_coupon(&self, code: &str) -> Result<Option<Coupon>, AppError> {
        Ok(self.tables.read().await.coupons.get(code).cloned())
    }

    async fn list_coupons(&self) -> Result<Vec<Coupon>, AppError> {
        let tables = self.tables.read().await;
        let coupons = tables.coupons.values().cloned().collect();
        Ok(sorted_by_created(coupons, |c| (c.created_utc, c.code.clone())))
    }

    async fn disable_coupon(
        &self,
        code: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<Coupon>, AppError> {
        let mut tables = self.tables.write().await;
        let Some(coupon) = tables.coupons.get_mut(code) else {
            return Ok(None);
        };
        if coupon.disabled_utc.is_none() {
            coupon.disabled_utc = Some(at);
        }
        Ok(Some(coupon.clone()))
    }

    async fn list_redemptions(&self, code: &str) -> Result<Vec<Redemption>, AppError> {
        let tables = self.tables.read().await;
        Ok(tables
            .redemptions
            .iter()
            .filter(|r| r.code == code)
            .cloned()
            .collect())
    }

    async fn claim_redemption(&self, redemption: &Redemption) -> Result<ClaimOutcome, AppError> {
        let mut tables = self.tables.write().await;
        if tables
            .redemptions
            .iter()
            .any(|r| r.code == redemption.code && r.account_id == redemption.account_id)
        {
            return Ok(ClaimOutcome::AlreadyRedeemed);
        }
        let Some(coupon) = tables.coupons.get_mut(&redemption.code) else {
            return Ok(ClaimOutcome::Unavailable);
        };
        if coupon.is_disabled() {
            return Ok(ClaimOutcome::Unavailable);
        }
        if coupon.uses_left() == 0 {
            return Ok(ClaimOutcome::Exhausted);
        }
        coupon.num_redeemed += 1;
        tables.redemptions.push(redemption.clone());
        Ok(ClaimOutcome::Claimed)
    }

    async fn release_redemption(&self, code: &str, account_id: Uuid) -> Result<(), AppError> {
        let mut tables = self.tables.write().await;
        let before = tables.redemptions.len();
        tables
            .redemptions
            .retain(|r| !(r.code == code && r.account_id == account_id));
        if tables.redemptions.len() < before {
            if let Some(coupon) = tables.coupons.get_mut(code) {
                coupon.num_redeemed = coupon.num_redeemed.saturating_sub(1);
            }
        }
        Ok(())
    }
}
