//! One reconciliation pass per account: charge new usage, recompute flags,
//! detect notification edges, roll closed periods into invoices, commit.

use chrono::{DateTime, Utc};
use futures::StreamExt;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::CreditError;
use crate::models::{CreditState, CreditStateTransition};
use crate::services::entitlement::{Entitlement, EntitlementGate, LedgerSnapshot};
use crate::services::invoices::roll_closed_periods;
use crate::services::ledger::{AccountBook, ChargeContext, CreditLedger};
use crate::services::locks::AccountLocks;
use crate::services::metrics::{
    ACCOUNT_RECONCILIATIONS_TOTAL, STATE_TRANSITIONS_TOTAL, TICKS_TOTAL, TICK_DURATION,
    USAGE_APPLIED_TOTAL,
};
use crate::services::notifier::NotificationDispatcher;
use crate::services::store::CreditStore;
use crate::services::trigger::{NotificationTrigger, TriggerInput};
use crate::services::usage::UsageAggregator;

/// What one account's reconciliation did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountReport {
    pub account_id: Uuid,
    pub usage_applied: usize,
    pub unapplied: Decimal,
    pub credit_state: CreditState,
    pub notifications: usize,
    pub invoices: usize,
}

#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub accounts: usize,
    pub succeeded: usize,
    pub failed: Vec<Uuid>,
}

pub struct Reconciler {
    store: Arc<dyn CreditStore>,
    ledger: Arc<CreditLedger>,
    usage: Arc<UsageAggregator>,
    gate: Arc<EntitlementGate>,
    dispatcher: Arc<NotificationDispatcher>,
    locks: Arc<AccountLocks>,
    clock: Arc<dyn Clock>,
    max_parallel: usize,
}

/// Store failures during a pass become tick failures; nothing was written.
fn tick_failure(account_id: Uuid, err: CreditError) -> CreditError {
    match err {
        CreditError::Store(source) => CreditError::SchedulerTickFailure { account_id, source },
        other => other,
    }
}

impl Reconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn CreditStore>,
        ledger: Arc<CreditLedger>,
        usage: Arc<UsageAggregator>,
        gate: Arc<EntitlementGate>,
        dispatcher: Arc<NotificationDispatcher>,
        locks: Arc<AccountLocks>,
        clock: Arc<dyn Clock>,
        max_parallel: usize,
    ) -> Self {
        Self {
            store,
            ledger,
            usage,
            gate,
            dispatcher,
            locks,
            clock,
            max_parallel: max_parallel.max(1),
        }
    }

    /// Reconciles every account, up to `max_parallel` at a time.
    #[instrument(skip(self))]
    pub async fn run_tick(&self) -> Result<TickReport, CreditError> {
        let started = Instant::now();
        let account_ids = self.store.list_account_ids().await.map_err(|e| {
            TICKS_TOTAL.with_label_values(&["error"]).inc();
            CreditError::Store(e)
        })?;

        let report = Mutex::new(TickReport {
            accounts: account_ids.len(),
            ..Default::default()
        });

        futures::stream::iter(account_ids)
            .for_each_concurrent(self.max_parallel, |account_id| {
                let report = &report;
                async move {
                    let outcome = self.reconcile_account(account_id).await;
                    let mut report = report.lock().await;
                    match outcome {
                        Ok(_) => report.succeeded += 1,
                        Err(e) => {
                            error!(
                                account_id = %account_id,
                                error = %e,
                                kind = e.kind(),
                                retryable = e.is_retryable(),
                                "Account reconciliation failed"
                            );
                            report.failed.push(account_id);
                        }
                    }
                }
            })
            .await;

        let report = report.into_inner();
        let status = if report.failed.is_empty() { "ok" } else { "partial" };
        TICKS_TOTAL.with_label_values(&[status]).inc();
        TICK_DURATION.observe(started.elapsed().as_secs_f64());

        info!(
            accounts = report.accounts,
            succeeded = report.succeeded,
            failed = report.failed.len(),
            duration_ms = started.elapsed().as_millis() as u64,
            "Reconciliation tick complete"
        );
        Ok(report)
    }

    /// Reconciles one account under its lock, then publishes any committed
    /// notifications.
    #[instrument(skip(self))]
    pub async fn reconcile_account(&self, account_id: Uuid) -> Result<AccountReport, CreditError> {
        let result = {
            let _guard = self.locks.acquire(account_id).await;
            self.reconcile_locked(account_id)
                .await
                .map_err(|e| tick_failure(account_id, e))
        };

        let report = match result {
            Ok(report) => {
                ACCOUNT_RECONCILIATIONS_TOTAL.with_label_values(&["ok"]).inc();
                report
            }
            Err(e) => {
                ACCOUNT_RECONCILIATIONS_TOTAL.with_label_values(&["error"]).inc();
                return Err(e);
            }
        };

        if let Err(e) = self.dispatcher.publish_pending(account_id).await {
            warn!(account_id = %account_id, error = %e, "Notification publish failed");
        }
        Ok(report)
    }

    async fn reconcile_locked(&self, account_id: Uuid) -> Result<AccountReport, CreditError> {
        let now = self.clock.now();
        let mut book = self.ledger.load_book(account_id).await?;

        let cursor = book.state().cursor;
        let usage = self.usage.drain(account_id, cursor).await?;
        let mut last_sequence = cursor;
        let mut usage_applied = 0;
        let mut unapplied = Decimal::ZERO;

        for rated in usage {
            last_sequence = last_sequence.max(rated.sequence);
            if rated.amount <= Decimal::ZERO {
                continue;
            }
            let applied = book.apply_usage(
                rated.amount,
                ChargeContext {
                    product_type: Some(rated.product_type),
                    transaction_id: Some(rated.transaction_id),
                    period: rated.period,
                },
                now,
            )?;
            usage_applied += 1;
            unapplied += applied.unapplied;
        }
        if last_sequence != cursor {
            book.state_mut().cursor = last_sequence;
        }
        USAGE_APPLIED_TOTAL.inc_by(usage_applied as u64);

        let ledger = LedgerSnapshot::of(&book, now);
        let entitlement = self.gate.evaluate(book.account(), &ledger);
        if entitlement != current_entitlement(&book) {
            let account = book.account_mut();
            entitlement.apply_to(account);
            account.updated_utc = now;
        }

        let next_state = self.gate.credit_state(&ledger, &entitlement);
        advance_credit_state(&mut book, next_state, ledger.remaining, now);

        let input = TriggerInput {
            low_credits: entitlement.low_credits,
            depleted: next_state == CreditState::Depleted,
            expired_credits: book
                .expired_with_balance(now)
                .into_iter()
                .map(|c| c.credit_id)
                .collect(),
        };
        let mut marks = book.state().marks.clone();
        let events = NotificationTrigger::evaluate(&mut marks, account_id, &input, now);
        if marks != book.state().marks {
            book.state_mut().marks = marks;
        }
        let notifications = events.len();
        book.record_notifications(events);

        let invoices = roll_closed_periods(&mut book, now).len();
        book.state_mut().last_run_utc = Some(now);

        self.store.commit(book.into_commit()).await?;

        Ok(AccountReport {
            account_id,
            usage_applied,
            unapplied,
            credit_state: next_state,
            notifications,
            invoices,
        })
    }
}

fn current_entitlement(book: &AccountBook) -> Entitlement {
    let account = book.account();
    Entitlement {
        paid_services_allowed: account.paid_services_allowed,
        low_credits: account.low_credits,
        terminate_paid_services: account.terminate_paid_services,
    }
}

/// Moves the derived state machine and stamps `credits_depleted` on a new
/// depletion cycle only.
fn advance_credit_state(
    book: &mut AccountBook,
    next: CreditState,
    remaining: Decimal,
    now: DateTime<Utc>,
) {
    let previous = book.state().credit_state;

    if next == CreditState::Depleted && previous != CreditState::Depleted {
        let new_cycle = !book.account().has_depleted() || book.state().healthy_since_depletion;
        if new_cycle {
            book.account_mut().credits_depleted = now;
            book.state_mut().healthy_since_depletion = false;
        }
    }
    if next == CreditState::Healthy && !book.state().healthy_since_depletion {
        book.state_mut().healthy_since_depletion = true;
    }

    if next != previous {
        book.state_mut().credit_state = next;
        book.record_transition(CreditStateTransition {
            account_id: book.account_id(),
            from_state: previous,
            to_state: next,
            remaining,
            at: now,
        });
        STATE_TRANSITIONS_TOTAL
            .with_label_values(&[next.as_str()])
            .inc();
        info!(
            account_id = %book.account_id(),
            from = %previous,
            to = %next,
            "Credit state changed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AccountType, CloudAccount, EnrollAccount};
    use crate::services::store::BookSnapshot;
    use chrono::{Duration, TimeZone};

    fn book() -> AccountBook {
        let account = CloudAccount::new(
            &EnrollAccount {
                account_id: None,
                account_type: AccountType::Standard,
                owner_email: "dev@example.com".to_string(),
                country_code: "US".to_string(),
                has_payment_method: false,
                termination_policy: false,
            },
            Utc::now(),
        );
        AccountBook::from_snapshot(BookSnapshot {
            account,
            credits: vec![],
            shortfalls: vec![],
            state: None,
        })
    }

    #[test]
    fn test_depletion_stamp_is_stable_within_a_cycle() {
        let mut book = book();
        let t0 = Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap();

        advance_credit_state(&mut book, CreditState::Depleted, Decimal::ZERO, t0);
        assert_eq!(book.account().credits_depleted, t0);

        let t1 = t0 + Duration::hours(1);
        advance_credit_state(&mut book, CreditState::Depleted, Decimal::ZERO, t1);
        assert_eq!(book.account().credits_depleted, t0);

        advance_credit_state(&mut book, CreditState::LowCredit, Decimal::ONE, t1);
        let t2 = t1 + Duration::hours(1);
        advance_credit_state(&mut book, CreditState::Depleted, Decimal::ZERO, t2);
        assert_eq!(book.account().credits_depleted, t0);
    }

    #[test]
    fn test_depletion_stamp_advances_after_healthy_period() {
        let mut book = book();
        let t0 = Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap();
        advance_credit_state(&mut book, CreditState::Depleted, Decimal::ZERO, t0);

        let t1 = t0 + Duration::days(1);
        advance_credit_state(&mut book, CreditState::Healthy, Decimal::TEN, t1);
        assert_eq!(book.account().credits_depleted, t0);

        let t2 = t1 + Duration::days(1);
        advance_credit_state(&mut book, CreditState::Depleted, Decimal::ZERO, t2);
        assert_eq!(book.account().credits_depleted, t2);
    }

    #[test]
    fn test_transitions_are_logged_on_change_only() {
        let mut book = book();
        let now = Utc::now();
        advance_credit_state(&mut book, CreditState::Healthy, Decimal::TEN, now);
        advance_credit_state(&mut book, CreditState::LowCredit, Decimal::ONE, now);
        advance_credit_state(&mut book, CreditState::LowCredit, Decimal::ONE, now);

        let commit = book.into_commit();
        assert_eq!(commit.transitions.len(), 1);
        assert_eq!(commit.transitions[0].from_state, CreditState::Healthy);
        assert_eq!(commit.transitions[0].to_state, CreditState::LowCredit);
    }
}
