//! Postgres-backed integration tests for credit-service.
//!
//! Run against a real database by setting `TEST_DATABASE_URL`; each test
//! gets its own schema. Without it these tests return immediately.

mod common;

use chrono::Duration;
use common::{dec, TestApp};
use credit_service::models::{
    AccountType, BillingPeriod, CreateCoupon, Credit, CreditOrigin, IngestOutcome, Redemption,
    Shortfall, ShortfallStatus,
};
use credit_service::services::store::{ClaimOutcome, LedgerCommit};
use credit_service::services::CreditStore;
use uuid::Uuid;

#[tokio::test]
async fn test_pg_partial_consumption_leaves_balance() {
    let Some(app) = TestApp::spawn_postgres().await else {
        return;
    };
    let account = app.enroll(AccountType::Standard, false).await;
    app.grant(account.account_id, "15.0", 30).await;

    app.ingest(account.account_id, "vm-spr-sml", "500").await;
    app.tick().await;

    let totals = app.totals(account.account_id).await;
    assert_eq!(totals.used, dec("3.75"));
    assert_eq!(totals.remaining, dec("11.25"));
    assert_eq!(totals.unapplied, dec("0"));
    assert!(!app.account(account.account_id).await.low_credits);

    app.cleanup().await;
}

#[tokio::test]
async fn test_pg_coupon_tops_up_carried_balance() {
    let Some(app) = TestApp::spawn_postgres().await else {
        return;
    };
    let account = app.enroll(AccountType::Standard, false).await;
    app.grant(account.account_id, "20.0", 30).await;
    app.ingest(account.account_id, "vm-spr-sml", "2000").await;
    app.tick().await;
    assert_eq!(app.totals(account.account_id).await.remaining, dec("5.0"));

    let coupon = app.create_coupon("10.0", true).await;
    app.state
        .coupons
        .redeem(&coupon.code, account.account_id)
        .await
        .unwrap();

    assert_eq!(app.totals(account.account_id).await.remaining, dec("15.0"));
    assert_eq!(app.state.coupons.get(&coupon.code).await.unwrap().num_redeemed, 1);

    app.cleanup().await;
}

#[tokio::test]
async fn test_pg_exact_depletion_then_top_up() {
    let Some(app) = TestApp::spawn_postgres().await else {
        return;
    };
    let account = app.enroll(AccountType::Standard, false).await;
    app.grant(account.account_id, "15.0", 30).await;

    app.ingest(account.account_id, "vm-spr-sml", "2000").await;
    app.tick().await;

    let totals = app.totals(account.account_id).await;
    assert_eq!(totals.remaining, dec("0"));
    assert_eq!(totals.unapplied, dec("0"));
    let depleted = app.account(account.account_id).await;
    assert!(depleted.low_credits);
    assert!(depleted.has_depleted());

    app.grant(account.account_id, "15.0", 30).await;
    app.tick().await;

    assert_eq!(app.totals(account.account_id).await.remaining, dec("15.0"));
    let restored = app.account(account.account_id).await;
    assert!(!restored.low_credits);
    assert!(restored.paid_services_allowed);

    app.cleanup().await;
}

#[tokio::test]
async fn test_pg_rejected_commit_writes_nothing() {
    let Some(app) = TestApp::spawn_postgres().await else {
        return;
    };
    let account = app.enroll(AccountType::Standard, false).await;
    let now = app.now();

    let credit = Credit {
        credit_id: Uuid::new_v4(),
        account_id: account.account_id,
        origin: CreditOrigin::Grant,
        coupon_code: None,
        granted_amount: dec("10"),
        remaining_amount: dec("10"),
        created_utc: now,
        expires_utc: now + Duration::days(30),
    };
    // References an application that was never written.
    let shortfall = Shortfall {
        shortfall_id: Uuid::new_v4(),
        account_id: account.account_id,
        application_id: Uuid::new_v4(),
        product_type: None,
        period: BillingPeriod::containing(now),
        original_amount: dec("1"),
        amount: dec("1"),
        status: ShortfallStatus::Outstanding,
        invoice_id: None,
        created_utc: now,
    };

    let result = app
        .store
        .commit(LedgerCommit {
            credits: vec![credit],
            shortfalls: vec![shortfall],
            ..Default::default()
        })
        .await;

    assert!(result.is_err());
    assert!(app.store.list_credits(account.account_id).await.unwrap().is_empty());
    assert!(app.store.list_shortfalls(account.account_id).await.unwrap().is_empty());

    app.cleanup().await;
}

#[tokio::test]
async fn test_pg_claim_and_release_redemption() {
    let Some(app) = TestApp::spawn_postgres().await else {
        return;
    };
    let first = app.enroll(AccountType::Standard, false).await;
    let second = app.enroll(AccountType::Standard, false).await;
    let coupon = app
        .state
        .coupons
        .create(CreateCoupon {
            code: None,
            amount: dec("5.0"),
            creator: "sales@example.com".to_string(),
            is_standard: true,
            num_uses: 1,
            start_utc: None,
            expires_utc: None,
        })
        .await
        .unwrap();
    let claim = |account_id| Redemption {
        code: coupon.code.clone(),
        account_id,
        redeemed_utc: app.now(),
    };

    assert_eq!(
        app.store.claim_redemption(&claim(first.account_id)).await.unwrap(),
        ClaimOutcome::Claimed
    );
    assert_eq!(
        app.store.claim_redemption(&claim(first.account_id)).await.unwrap(),
        ClaimOutcome::AlreadyRedeemed
    );
    assert_eq!(
        app.store.claim_redemption(&claim(second.account_id)).await.unwrap(),
        ClaimOutcome::Exhausted
    );
    // A failed claim leaves no redemption row behind.
    assert_eq!(app.store.list_redemptions(&coupon.code).await.unwrap().len(), 1);

    app.store
        .release_redemption(&coupon.code, first.account_id)
        .await
        .unwrap();
    let released = app.store.get_coupon(&coupon.code).await.unwrap().unwrap();
    assert_eq!(released.num_redeemed, 0);
    assert!(app.store.list_redemptions(&coupon.code).await.unwrap().is_empty());

    assert_eq!(
        app.store.claim_redemption(&claim(second.account_id)).await.unwrap(),
        ClaimOutcome::Claimed
    );

    app.cleanup().await;
}

#[tokio::test]
async fn test_pg_duplicate_usage_is_ignored() {
    let Some(app) = TestApp::spawn_postgres().await else {
        return;
    };
    let account = app.enroll(AccountType::Standard, false).await;
    app.grant(account.account_id, "15.0", 30).await;

    let record = app.usage_record(account.account_id, "vm-spr-sml", "100");
    let first = app.state.usage.ingest(record.clone()).await.unwrap();
    let second = app.state.usage.ingest(record).await.unwrap();
    assert!(matches!(first, IngestOutcome::Accepted { .. }));
    assert_eq!(second, IngestOutcome::Duplicate);

    app.tick().await;
    assert_eq!(app.totals(account.account_id).await.used, dec("0.75"));

    app.cleanup().await;
}

#[tokio::test]
async fn test_pg_usage_ingested_during_ticks_is_charged_once() {
    let Some(app) = TestApp::spawn_postgres().await else {
        return;
    };
    let account = app.enroll(AccountType::Standard, false).await;
    app.grant(account.account_id, "50.0", 30).await;

    // 40 records of 0.75 each
    let ingests = futures::future::join_all(
        (0..40).map(|_| app.ingest(account.account_id, "vm-spr-sml", "100")),
    );
    let ticks = async {
        for _ in 0..10 {
            app.tick().await;
        }
    };
    futures::join!(ingests, ticks);
    app.tick().await;

    let totals = app.totals(account.account_id).await;
    assert_eq!(totals.used, dec("30.0"));
    assert_eq!(totals.remaining, dec("20.0"));

    app.cleanup().await;
}
