//! Reconciliation scheduler loop tests for credit-service.

mod common;

use common::{dec, TestApp};
use credit_service::config::SchedulerConfig;
use credit_service::models::AccountType;
use credit_service::workers::ReconciliationScheduler;
use std::time::Duration;

#[tokio::test]
async fn test_scheduler_ticks_until_cancelled() {
    let app = TestApp::spawn();
    let account = app.enroll(AccountType::Standard, false).await;
    app.grant(account.account_id, "15.0", 30).await;
    app.ingest(account.account_id, "vm-spr-sml", "500").await;

    let scheduler = ReconciliationScheduler::new(
        SchedulerConfig {
            enabled: true,
            interval_secs: 1,
            max_parallel_accounts: 2,
        },
        app.state.reconciler.clone(),
    );
    let (handle, token) = scheduler.spawn();

    // The first interval tick fires immediately
    let mut used = dec("0");
    for _ in 0..50 {
        used = app.totals(account.account_id).await.used;
        if used > dec("0") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(used, dec("3.75"));

    token.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("scheduler did not stop")
        .unwrap();
}

#[tokio::test]
async fn test_disabled_scheduler_exits_immediately() {
    let app = TestApp::spawn();
    let account = app.enroll(AccountType::Standard, false).await;
    app.grant(account.account_id, "15.0", 30).await;
    app.ingest(account.account_id, "vm-spr-sml", "500").await;

    let scheduler = ReconciliationScheduler::new(
        SchedulerConfig {
            enabled: false,
            ..Default::default()
        },
        app.state.reconciler.clone(),
    );
    let (handle, _token) = scheduler.spawn();

    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("disabled scheduler kept running")
        .unwrap();
    assert_eq!(app.totals(account.account_id).await.used, dec("0"));
}
