//! Credit ledger: expiry-ordered charging of usage against prepaid credits.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::CreditError;
use crate::models::{
    AddCredit, ApplicationKind, BillingPeriod, CloudAccount, Credit, CreditCharge,
    CreditStateTransition, CreditTotals, Invoice, LedgerApplication, NotificationEvent,
    ReconciliationState, Shortfall, ShortfallStatus, UsageApplication,
};
use crate::services::locks::AccountLocks;
use crate::services::metrics::{CREDITS_GRANTED, CREDIT_AMOUNT_GRANTED, SHORTFALL_AMOUNT};
use crate::services::store::{BookSnapshot, CreditStore, LedgerCommit};

/// Charge order: earliest expiry first, then creation time, then id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct ChargeKey {
    expires_utc: DateTime<Utc>,
    created_utc: DateTime<Utc>,
    credit_id: Uuid,
}

impl ChargeKey {
    fn of(credit: &Credit) -> Self {
        Self {
            expires_utc: credit.expires_utc,
            created_utc: credit.created_utc,
            credit_id: credit.credit_id,
        }
    }
}

/// What a charge is for.
#[derive(Debug, Clone)]
pub struct ChargeContext {
    pub product_type: Option<String>,
    pub transaction_id: Option<String>,
    pub period: BillingPeriod,
}

impl ChargeContext {
    pub fn adjustment(now: DateTime<Utc>) -> Self {
        Self {
            product_type: None,
            transaction_id: None,
            period: BillingPeriod::containing(now),
        }
    }
}

/// Working copy of one account's ledger, loaded under the account lock.
///
/// Mutations are tracked and turned into a single [`LedgerCommit`], so a
/// failed write leaves the stored ledger untouched.
#[derive(Debug)]
pub struct AccountBook {
    account: CloudAccount,
    credits: BTreeMap<ChargeKey, Credit>,
    keys: HashMap<Uuid, ChargeKey>,
    shortfalls: Vec<Shortfall>,
    state: ReconciliationState,
    touched_credits: BTreeSet<Uuid>,
    touched_shortfalls: BTreeSet<Uuid>,
    applications: Vec<LedgerApplication>,
    invoices: Vec<Invoice>,
    notifications: Vec<NotificationEvent>,
    transitions: Vec<CreditStateTransition>,
    account_dirty: bool,
    state_dirty: bool,
}

impl AccountBook {
    pub fn from_snapshot(snapshot: BookSnapshot) -> Self {
        let account_id = snapshot.account.account_id;
        let mut book = Self {
            account: snapshot.account,
            credits: BTreeMap::new(),
            keys: HashMap::new(),
            shortfalls: snapshot.shortfalls,
            state: snapshot
                .state
                .unwrap_or_else(|| ReconciliationState::new(account_id)),
            touched_credits: BTreeSet::new(),
            touched_shortfalls: BTreeSet::new(),
            applications: Vec::new(),
            invoices: Vec::new(),
            notifications: Vec::new(),
            transitions: Vec::new(),
            account_dirty: false,
            state_dirty: false,
        };
        for credit in snapshot.credits {
            book.insert_credit(credit);
        }
        book.shortfalls
            .sort_by_key(|s| (s.created_utc, s.shortfall_id));
        book
    }

    fn insert_credit(&mut self, credit: Credit) {
        let key = ChargeKey::of(&credit);
        self.keys.insert(credit.credit_id, key);
        self.credits.insert(key, credit);
    }

    pub fn account_id(&self) -> Uuid {
        self.account.account_id
    }

    pub fn account(&self) -> &CloudAccount {
        &self.account
    }

    pub fn account_mut(&mut self) -> &mut CloudAccount {
        self.account_dirty = true;
        &mut self.account
    }

    pub fn state(&self) -> &ReconciliationState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut ReconciliationState {
        self.state_dirty = true;
        &mut self.state
    }

    /// Credits in charge order.
    pub fn credits(&self) -> impl Iterator<Item = &Credit> {
        self.credits.values()
    }

    pub fn credit(&self, credit_id: Uuid) -> Option<&Credit> {
        self.keys.get(&credit_id).and_then(|key| self.credits.get(key))
    }

    pub fn has_credits(&self) -> bool {
        !self.credits.is_empty()
    }

    pub fn shortfalls(&self) -> &[Shortfall] {
        &self.shortfalls
    }

    pub fn shortfall_mut(&mut self, shortfall_id: Uuid) -> Option<&mut Shortfall> {
        let shortfall = self
            .shortfalls
            .iter_mut()
            .find(|s| s.shortfall_id == shortfall_id)?;
        self.touched_shortfalls.insert(shortfall_id);
        Some(shortfall)
    }

    pub fn totals(&self, now: DateTime<Utc>) -> CreditTotals {
        let mut totals = CreditTotals::default();
        for credit in self.credits.values() {
            totals.used += credit.used_amount();
            if !credit.is_expired(now) {
                totals.remaining += credit.remaining_amount;
            }
        }
        totals.unapplied = self.shortfalls.iter().map(|s| s.amount).sum();
        totals
    }

    /// Granted amount of the credits still in play: unexpired and not exhausted.
    pub fn original_grant(&self, now: DateTime<Utc>) -> Decimal {
        self.credits
            .values()
            .filter(|c| c.is_active(now))
            .map(|c| c.granted_amount)
            .sum()
    }

    /// Low-credit base of the current cycle. Fixed at the last grant, so an
    /// earlier credit running out does not shrink it.
    pub fn grant_base(&self, now: DateTime<Utc>) -> Decimal {
        self.state
            .grant_base
            .unwrap_or_else(|| self.original_grant(now))
    }

    /// Credits past expiry that still had balance on them.
    pub fn expired_with_balance(&self, now: DateTime<Utc>) -> Vec<&Credit> {
        self.credits
            .values()
            .filter(|c| c.is_expired(now) && !c.is_exhausted())
            .collect()
    }

    /// Adds a credit to the book.
    pub fn grant(&mut self, input: &AddCredit, now: DateTime<Utc>) -> Result<Credit, CreditError> {
        if input.amount <= Decimal::ZERO {
            return Err(CreditError::InvalidAmount(format!(
                "credit amount must be positive, got {}",
                input.amount
            )));
        }
        if input.expires_utc <= now {
            return Err(CreditError::InvalidRequest(format!(
                "credit expiry {} is not in the future",
                input.expires_utc
            )));
        }

        let credit = Credit {
            credit_id: Uuid::new_v4(),
            account_id: self.account.account_id,
            origin: input.origin,
            coupon_code: input.coupon_code.clone(),
            granted_amount: input.amount,
            remaining_amount: input.amount,
            created_utc: now,
            expires_utc: input.expires_utc,
        };
        self.touched_credits.insert(credit.credit_id);
        self.insert_credit(credit.clone());

        let base = self.original_grant(now);
        self.state_mut().grant_base = Some(base);
        Ok(credit)
    }

    /// Draws `amount` from active credits in charge order.
    fn draw(&mut self, amount: Decimal, now: DateTime<Utc>) -> Vec<CreditCharge> {
        let mut left = amount;
        let mut charges = Vec::new();

        for credit in self.credits.values_mut() {
            if left.is_zero() {
                break;
            }
            if !credit.is_active(now) {
                continue;
            }
            let take = credit.remaining_amount.min(left);
            credit.remaining_amount -= take;
            left -= take;
            self.touched_credits.insert(credit.credit_id);
            charges.push(CreditCharge {
                credit_id: credit.credit_id,
                amount: take,
            });
        }

        charges
    }

    /// Charges usage against the account's credits. Whatever no credit can
    /// cover is recorded as an outstanding shortfall.
    pub fn apply_usage(
        &mut self,
        amount: Decimal,
        context: ChargeContext,
        now: DateTime<Utc>,
    ) -> Result<UsageApplication, CreditError> {
        if amount <= Decimal::ZERO {
            return Err(CreditError::InvalidAmount(format!(
                "usage amount must be positive, got {}",
                amount
            )));
        }

        let charges = self.draw(amount, now);
        let charged: Decimal = charges.iter().map(|c| c.amount).sum();
        let unapplied = amount - charged;

        let application = LedgerApplication {
            application_id: Uuid::new_v4(),
            account_id: self.account.account_id,
            kind: ApplicationKind::Usage,
            product_type: context.product_type.clone(),
            transaction_id: context.transaction_id,
            shortfall_id: None,
            period: context.period,
            amount,
            charges,
            unapplied_amount: unapplied,
            created_utc: now,
        };

        if unapplied > Decimal::ZERO {
            let shortfall = Shortfall {
                shortfall_id: Uuid::new_v4(),
                account_id: self.account.account_id,
                application_id: application.application_id,
                product_type: context.product_type,
                period: context.period,
                original_amount: unapplied,
                amount: unapplied,
                status: ShortfallStatus::Outstanding,
                invoice_id: None,
                created_utc: now,
            };
            SHORTFALL_AMOUNT.inc_by(decimal_to_f64(unapplied));
            self.touched_shortfalls.insert(shortfall.shortfall_id);
            self.shortfalls.push(shortfall);
        }

        self.applications.push(application.clone());

        Ok(UsageApplication {
            application,
            charged,
            unapplied,
            remaining: self.totals(now).remaining,
        })
    }

    /// Covers outstanding shortfalls from available credit, oldest first.
    /// Shortfalls already on an invoice are left to the invoice.
    pub fn settle_outstanding(&mut self, now: DateTime<Utc>) -> Vec<LedgerApplication> {
        let mut settled = Vec::new();

        for index in 0..self.shortfalls.len() {
            if !self.shortfalls[index].is_outstanding() {
                continue;
            }
            if self.totals(now).remaining.is_zero() {
                break;
            }

            let owed = self.shortfalls[index].amount;
            let charges = self.draw(owed, now);
            let charged: Decimal = charges.iter().map(|c| c.amount).sum();

            let shortfall = &mut self.shortfalls[index];
            shortfall.amount -= charged;
            if shortfall.amount.is_zero() {
                shortfall.status = ShortfallStatus::Settled;
            }
            self.touched_shortfalls.insert(shortfall.shortfall_id);

            let application = LedgerApplication {
                application_id: Uuid::new_v4(),
                account_id: shortfall.account_id,
                kind: ApplicationKind::Settlement,
                product_type: shortfall.product_type.clone(),
                transaction_id: None,
                shortfall_id: Some(shortfall.shortfall_id),
                period: shortfall.period,
                amount: charged,
                charges,
                unapplied_amount: shortfall.amount,
                created_utc: now,
            };
            self.applications.push(application.clone());
            settled.push(application);
        }

        settled
    }

    pub fn record_invoice(&mut self, invoice: Invoice) {
        self.invoices.push(invoice);
    }

    pub fn record_notifications(&mut self, events: Vec<NotificationEvent>) {
        self.notifications.extend(events);
    }

    pub fn record_transition(&mut self, transition: CreditStateTransition) {
        self.transitions.push(transition);
    }

    /// Notifications recorded on this book so far.
    pub fn pending_notifications(&self) -> &[NotificationEvent] {
        &self.notifications
    }

    /// Turns the tracked changes into one atomic write.
    pub fn into_commit(self) -> LedgerCommit {
        let credits = self
            .touched_credits
            .iter()
            .filter_map(|id| self.keys.get(id).and_then(|key| self.credits.get(key)))
            .cloned()
            .collect();
        let shortfalls = self
            .shortfalls
            .iter()
            .filter(|s| self.touched_shortfalls.contains(&s.shortfall_id))
            .cloned()
            .collect();

        LedgerCommit {
            account: self.account_dirty.then_some(self.account),
            credits,
            applications: self.applications,
            shortfalls,
            invoices: self.invoices,
            notifications: self.notifications,
            transitions: self.transitions,
            state: self.state_dirty.then_some(self.state),
        }
    }
}

pub(crate) fn decimal_to_f64(value: Decimal) -> f64 {
    use rust_decimal::prelude::ToPrimitive;
    value.to_f64().unwrap_or_default()
}

/// Public ledger operations. Every mutation runs under the account lock
/// and lands in one store commit.
pub struct CreditLedger {
    store: Arc<dyn CreditStore>,
    locks: Arc<AccountLocks>,
    clock: Arc<dyn Clock>,
}

impl CreditLedger {
    pub fn new(store: Arc<dyn CreditStore>, locks: Arc<AccountLocks>, clock: Arc<dyn Clock>) -> Self {
        Self { store, locks, clock }
    }

    /// Loads an account's working ledger. Callers must hold the account lock.
    pub async fn load_book(&self, account_id: Uuid) -> Result<AccountBook, CreditError> {
        let snapshot = self
            .store
            .load_book(account_id)
            .await?
            .ok_or(CreditError::AccountNotFound(account_id))?;
        Ok(AccountBook::from_snapshot(snapshot))
    }

    /// Grants a credit and settles outstanding shortfalls from it.
    #[instrument(skip(self, input), fields(account_id = %input.account_id, amount = %input.amount))]
    pub async fn add_credit(&self, input: AddCredit) -> Result<Credit, CreditError> {
        let _guard = self.locks.acquire(input.account_id).await;
        let now = self.clock.now();

        let mut book = self.load_book(input.account_id).await?;
        let credit = book.grant(&input, now)?;
        let settlements = book.settle_outstanding(now);

        self.store.commit(book.into_commit()).await?;

        CREDITS_GRANTED
            .with_label_values(&[input.origin.as_str()])
            .inc();
        CREDIT_AMOUNT_GRANTED.inc_by(decimal_to_f64(input.amount));

        info!(
            credit_id = %credit.credit_id,
            expires_utc = %credit.expires_utc,
            settlements = settlements.len(),
            "Credit granted"
        );
        Ok(credit)
    }

    /// Charges an ad-hoc amount against the account.
    #[instrument(skip(self), fields(account_id = %account_id, amount = %amount))]
    pub async fn apply_usage(
        &self,
        account_id: Uuid,
        amount: Decimal,
    ) -> Result<UsageApplication, CreditError> {
        let _guard = self.locks.acquire(account_id).await;
        let now = self.clock.now();

        let mut book = self.load_book(account_id).await?;
        let result = book.apply_usage(amount, ChargeContext::adjustment(now), now)?;
        self.store.commit(book.into_commit()).await?;

        Ok(result)
    }

    /// Totals from the last committed ledger.
    #[instrument(skip(self))]
    pub async fn totals(&self, account_id: Uuid) -> Result<CreditTotals, CreditError> {
        let book = self.load_book(account_id).await?;
        Ok(book.totals(self.clock.now()))
    }

    /// Credits in charge order. Without history only credits that can still
    /// be drawn from are returned.
    #[instrument(skip(self))]
    pub async fn list_credits(
        &self,
        account_id: Uuid,
        include_history: bool,
    ) -> Result<Vec<Credit>, CreditError> {
        let now = self.clock.now();
        let book = self.load_book(account_id).await?;
        Ok(book
            .credits()
            .filter(|c| include_history || c.is_active(now))
            .cloned()
            .collect())
    }

    #[instrument(skip(self))]
    pub async fn list_applications(
        &self,
        account_id: Uuid,
    ) -> Result<Vec<LedgerApplication>, CreditError> {
        if self.store.get_account(account_id).await?.is_none() {
            return Err(CreditError::AccountNotFound(account_id));
        }
        Ok(self.store.list_applications(account_id).await?)
    }
}
