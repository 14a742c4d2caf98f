//! Notification trigger and delivery integration tests for credit-service.

mod common;

use chrono::Duration;
use common::{dec, TestApp, TestOptions};
use credit_service::models::{AccountType, CreditState, DeliveryStatus, NotificationKind};
use credit_service::services::CreditStore;

#[tokio::test]
async fn test_thresholds_fire_once_and_rearm() {
    let app = TestApp::spawn();
    let account = app.enroll(AccountType::Standard, false).await;
    let id = account.account_id;
    app.grant(id, "15.0", 30).await;

    app.ingest(id, "vm-spr-sml", "1600").await;
    app.tick().await;
    assert_eq!(app.publisher.sent_kinds(id), vec![NotificationKind::EightyPercent]);

    // Still low, nothing new
    app.tick().await;
    assert_eq!(app.publisher.sent_kinds(id).len(), 1);

    app.ingest(id, "vm-spr-sml", "400").await;
    let report = app.state.reconciler.reconcile_account(id).await.unwrap();
    assert_eq!(report.credit_state, CreditState::Depleted);
    assert_eq!(report.notifications, 1);
    assert_eq!(
        app.publisher.sent_kinds(id),
        vec![NotificationKind::EightyPercent, NotificationKind::HundredPercent]
    );

    // Top-up re-arms both thresholds
    app.grant(id, "15.0", 30).await;
    let report = app.state.reconciler.reconcile_account(id).await.unwrap();
    assert_eq!(report.credit_state, CreditState::Healthy);
    assert_eq!(report.notifications, 0);

    app.ingest(id, "vm-spr-sml", "2000").await;
    app.tick().await;
    assert_eq!(
        app.publisher.sent_kinds(id),
        vec![
            NotificationKind::EightyPercent,
            NotificationKind::HundredPercent,
            NotificationKind::EightyPercent,
            NotificationKind::HundredPercent,
        ]
    );
}

#[tokio::test]
async fn test_early_credit_running_out_keeps_account_low() {
    let app = TestApp::spawn();
    let account = app.enroll(AccountType::Standard, false).await;
    let id = account.account_id;
    app.grant(id, "10.0", 10).await;
    app.grant(id, "1.0", 30).await;

    app.ingest(id, "vm-spr-sml", "1200").await;
    app.tick().await;
    assert!(app.account(id).await.low_credits);
    assert_eq!(app.totals(id).await.remaining, dec("2.0"));

    // The 10.0 credit is now spent; the low-credit base stays at 11.0
    app.ingest(id, "vm-spr-sml", "140").await;
    let report = app.state.reconciler.reconcile_account(id).await.unwrap();
    assert_eq!(report.credit_state, CreditState::LowCredit);
    assert_eq!(app.totals(id).await.remaining, dec("0.95"));
    assert!(app.account(id).await.low_credits);

    app.ingest(id, "vm-spr-sml", "100").await;
    app.tick().await;

    assert_eq!(app.publisher.sent_kinds(id), vec![NotificationKind::EightyPercent]);
}

#[tokio::test]
async fn test_expiry_notice_fires_once_per_credit() {
    let app = TestApp::spawn();
    let account = app.enroll(AccountType::Standard, false).await;
    let id = account.account_id;
    let short = app.grant(id, "10.0", 2).await;
    app.grant(id, "10.0", 30).await;

    app.tick().await;
    assert!(app.publisher.sent_kinds(id).is_empty());

    app.advance(Duration::days(3));
    app.tick().await;
    app.tick().await;
    assert_eq!(app.publisher.sent_kinds(id), vec![NotificationKind::Expired]);

    let events = app.store.list_notifications(id).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].credit_id, Some(short.credit_id));
    assert_eq!(events[0].delivery, DeliveryStatus::Delivered);
    assert!(events[0].delivered_utc.is_some());
}

#[tokio::test]
async fn test_account_with_card_is_not_warned() {
    let app = TestApp::spawn();
    let account = app.enroll(AccountType::Standard, true).await;
    let id = account.account_id;
    app.grant(id, "10.0", 30).await;

    app.ingest(id, "vm-spr-sml", "2000").await;
    app.tick().await;

    assert!(app.publisher.sent().is_empty());
    let events = app.store.list_notifications(id).await.unwrap();
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|e| e.delivery == DeliveryStatus::Suppressed));
    assert!(app.account(id).await.paid_services_allowed);
}

#[tokio::test]
async fn test_delivery_policy_filters_account_types() {
    let app = TestApp::spawn_with(TestOptions {
        email_account_types: vec![AccountType::Premium],
        ..Default::default()
    });
    let standard = app.enroll(AccountType::Standard, false).await;
    let premium = app.enroll(AccountType::Premium, false).await;
    for account in [&standard, &premium] {
        app.grant(account.account_id, "10.0", 30).await;
        app.ingest(account.account_id, "vm-spr-sml", "1200").await;
    }

    app.tick().await;

    assert!(app.publisher.sent_kinds(standard.account_id).is_empty());
    assert_eq!(
        app.publisher.sent_kinds(premium.account_id),
        vec![NotificationKind::EightyPercent]
    );
}

#[tokio::test]
async fn test_email_disabled_suppresses_everything() {
    let app = TestApp::spawn_with(TestOptions {
        email_enabled: false,
        ..Default::default()
    });
    let account = app.enroll(AccountType::Enterprise, false).await;
    app.grant(account.account_id, "10.0", 30).await;
    app.ingest(account.account_id, "vm-spr-sml", "2000").await;

    app.tick().await;

    assert!(app.publisher.sent().is_empty());
    let events = app.store.list_notifications(account.account_id).await.unwrap();
    assert!(!events.is_empty());
    assert!(events.iter().all(|e| e.delivery == DeliveryStatus::Suppressed));
}

#[tokio::test]
async fn test_transient_failure_is_retried_next_tick() {
    let app = TestApp::spawn();
    let account = app.enroll(AccountType::Standard, false).await;
    let id = account.account_id;
    app.grant(id, "10.0", 30).await;
    app.ingest(id, "vm-spr-sml", "1200").await;

    app.publisher.fail_transiently(true);
    app.tick().await;

    assert!(app.publisher.sent().is_empty());
    let pending = app.store.pending_notifications(id).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].attempts, 1);
    // The ledger side of the tick still committed
    assert!(app.account(id).await.low_credits);

    app.publisher.fail_transiently(false);
    app.tick().await;

    assert_eq!(app.publisher.sent_kinds(id), vec![NotificationKind::EightyPercent]);
    assert!(app.store.pending_notifications(id).await.unwrap().is_empty());
    let events = app.store.list_notifications(id).await.unwrap();
    assert_eq!(events[0].attempts, 2);
    assert_eq!(events[0].delivery, DeliveryStatus::Delivered);
}

#[tokio::test]
async fn test_permanent_failure_is_not_retried() {
    let app = TestApp::spawn();
    let account = app.enroll(AccountType::Standard, false).await;
    let id = account.account_id;
    app.grant(id, "10.0", 30).await;
    app.ingest(id, "vm-spr-sml", "1200").await;

    app.publisher.fail_permanently(true);
    app.tick().await;
    app.publisher.fail_permanently(false);
    app.tick().await;

    assert!(app.publisher.sent().is_empty());
    let events = app.store.list_notifications(id).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].delivery, DeliveryStatus::Suppressed);
    assert_eq!(events[0].attempts, 1);
}
