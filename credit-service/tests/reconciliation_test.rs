//! Reconciliation loop integration tests for credit-service.

mod common;

use chrono::Duration;
use common::{dec, TestApp, TestOptions};
use credit_service::error::CreditError;
use credit_service::models::{AccountType, CreditState};
use credit_service::services::{CreditStore, LowCreditThresholds};

#[tokio::test]
async fn test_low_credits_set_at_threshold() {
    let app = TestApp::spawn();
    let account = app.enroll(AccountType::Standard, false).await;
    app.grant(account.account_id, "15.0", 30).await;

    // 11.25 of 15 used, just under 80%
    app.ingest(account.account_id, "vm-spr-sml", "1500").await;
    app.tick().await;
    assert!(!app.account(account.account_id).await.low_credits);

    // 12.0 of 15 used, exactly 80%
    app.ingest(account.account_id, "vm-spr-sml", "100").await;
    let report = app
        .state
        .reconciler
        .reconcile_account(account.account_id)
        .await
        .unwrap();
    assert_eq!(report.credit_state, CreditState::LowCredit);
    assert_eq!(report.usage_applied, 1);

    let flagged = app.account(account.account_id).await;
    assert!(flagged.low_credits);
    assert!(flagged.paid_services_allowed);
}

#[tokio::test]
async fn test_account_without_credits_is_not_low() {
    let app = TestApp::spawn();
    let account = app.enroll(AccountType::Standard, false).await;

    app.tick().await;

    let account = app.account(account.account_id).await;
    assert!(!account.low_credits);
    assert!(!account.paid_services_allowed);
    assert!(!account.has_depleted());
}

#[tokio::test]
async fn test_threshold_varies_by_tier() {
    let app = TestApp::spawn_with(TestOptions {
        thresholds: LowCreditThresholds {
            standard: 80,
            premium: 50,
            enterprise: 80,
        },
        ..Default::default()
    });
    let standard = app.enroll(AccountType::Standard, false).await;
    let premium = app.enroll(AccountType::Premium, false).await;
    for account in [&standard, &premium] {
        app.grant(account.account_id, "10.0", 30).await;
        // 6.0 of 10 used
        app.ingest(account.account_id, "vm-spr-sml", "800").await;
    }

    let report = app.tick().await;
    assert_eq!(report.accounts, 2);
    assert_eq!(report.succeeded, 2);

    assert!(!app.account(standard.account_id).await.low_credits);
    assert!(app.account(premium.account_id).await.low_credits);
}

#[tokio::test]
async fn test_depletion_stamp_is_stable_across_ticks() {
    let app = TestApp::spawn();
    let account = app.enroll(AccountType::Standard, false).await;
    app.grant(account.account_id, "10.0", 30).await;

    app.ingest(account.account_id, "vm-spr-sml", "2000").await;
    app.tick().await;
    let first = app.account(account.account_id).await;
    assert!(first.has_depleted());
    assert_eq!(first.credits_depleted, app.now());
    assert_eq!(app.totals(account.account_id).await.unapplied, dec("5"));

    app.advance(Duration::hours(1));
    app.ingest(account.account_id, "vm-spr-sml", "100").await;
    app.tick().await;
    assert_eq!(
        app.account(account.account_id).await.credits_depleted,
        first.credits_depleted
    );

    // Healthy again, then a second depletion starts a new cycle
    app.grant(account.account_id, "30.0", 30).await;
    app.tick().await;
    assert!(!app.account(account.account_id).await.low_credits);

    app.advance(Duration::hours(1));
    app.ingest(account.account_id, "vm-spr-sml", "4000").await;
    app.tick().await;
    let second = app.account(account.account_id).await;
    assert_eq!(second.credits_depleted, app.now());
    assert!(second.credits_depleted > first.credits_depleted);

    let states: Vec<(CreditState, CreditState)> = app
        .store
        .list_transitions(account.account_id)
        .await
        .unwrap()
        .into_iter()
        .map(|t| (t.from_state, t.to_state))
        .collect();
    assert_eq!(
        states,
        vec![
            (CreditState::Healthy, CreditState::Depleted),
            (CreditState::Depleted, CreditState::Healthy),
            (CreditState::Healthy, CreditState::Depleted),
        ]
    );
}

#[tokio::test]
async fn test_failed_commit_leaves_no_partial_state() {
    let app = TestApp::spawn();
    let account = app.enroll(AccountType::Standard, false).await;
    app.grant(account.account_id, "15.0", 30).await;
    app.ingest(account.account_id, "vm-spr-sml", "1800").await;

    app.store.fail_commits(true);
    let report = app.tick().await;
    assert_eq!(report.succeeded, 0);
    assert_eq!(report.failed, vec![account.account_id]);

    let err = app
        .state
        .reconciler
        .reconcile_account(account.account_id)
        .await
        .unwrap_err();
    assert!(matches!(err, CreditError::SchedulerTickFailure { .. }));

    assert_eq!(app.totals(account.account_id).await.used, dec("0"));
    assert!(app
        .state
        .ledger
        .list_applications(account.account_id)
        .await
        .unwrap()
        .is_empty());
    assert!(!app.account(account.account_id).await.low_credits);
    assert!(app
        .store
        .list_notifications(account.account_id)
        .await
        .unwrap()
        .is_empty());
    assert!(app.publisher.sent().is_empty());

    // The next tick picks up the same usage
    app.store.fail_commits(false);
    let report = app.tick().await;
    assert_eq!(report.succeeded, 1);
    assert!(report.failed.is_empty());

    assert_eq!(app.totals(account.account_id).await.used, dec("13.5"));
    assert!(app.account(account.account_id).await.low_credits);
}

#[tokio::test]
async fn test_tick_covers_every_account() {
    let app = TestApp::spawn();
    let busy = app.enroll(AccountType::Standard, false).await;
    app.grant(busy.account_id, "15.0", 30).await;
    app.ingest(busy.account_id, "vm-spr-sml", "100").await;

    let idle = app.enroll(AccountType::Premium, false).await;
    app.grant(idle.account_id, "5.0", 30).await;

    let report = app.tick().await;
    assert_eq!(report.accounts, 2);
    assert_eq!(report.succeeded, 2);
    assert_eq!(app.totals(busy.account_id).await.used, dec("0.75"));
    assert_eq!(app.totals(idle.account_id).await.remaining, dec("5.0"));
}

#[tokio::test]
async fn test_expired_credit_stops_counting() {
    let app = TestApp::spawn();
    let account = app.enroll(AccountType::Standard, false).await;
    app.grant(account.account_id, "10.0", 2).await;

    app.tick().await;
    assert!(app.account(account.account_id).await.paid_services_allowed);

    app.advance(Duration::days(3));
    app.tick().await;

    let totals = app.totals(account.account_id).await;
    assert_eq!(totals.remaining, dec("0"));
    assert!(!app.account(account.account_id).await.paid_services_allowed);
}
