//! Coupon integration tests for credit-service.

mod common;

use chrono::Duration;
use common::{dec, TestApp};
use credit_service::error::CreditError;
use credit_service::models::{AccountType, CreateCoupon, CreditOrigin};
use credit_service::services::CreditStore;
use uuid::Uuid;

fn coupon_input(app: &TestApp, amount: &str, num_uses: u32) -> CreateCoupon {
    CreateCoupon {
        code: None,
        amount: dec(amount),
        creator: "sales@example.com".to_string(),
        is_standard: true,
        num_uses,
        start_utc: None,
        expires_utc: Some(app.now() + Duration::days(30)),
    }
}

#[tokio::test]
async fn test_redeem_adds_credit_on_top_of_balance() {
    let app = TestApp::spawn();
    let account = app.enroll(AccountType::Standard, false).await;
    app.grant(account.account_id, "20.0", 30).await;
    app.ingest(account.account_id, "vm-spr-sml", "2000").await;
    app.tick().await;
    assert_eq!(app.totals(account.account_id).await.remaining, dec("5.0"));

    let coupon = app.create_coupon("10.0", true).await;
    let credit = app
        .state
        .coupons
        .redeem(&coupon.code, account.account_id)
        .await
        .unwrap();

    assert_eq!(credit.origin, CreditOrigin::Coupon);
    assert_eq!(credit.coupon_code.as_deref(), Some(coupon.code.as_str()));
    assert_eq!(credit.expires_utc, coupon.expires_utc);
    assert_eq!(app.totals(account.account_id).await.remaining, dec("15.0"));

    let stored = app.state.coupons.get(&coupon.code).await.unwrap();
    assert_eq!(stored.num_redeemed, 1);
    let redemptions = app.store.list_redemptions(&coupon.code).await.unwrap();
    assert_eq!(redemptions.len(), 1);
    assert_eq!(redemptions[0].account_id, account.account_id);
}

#[tokio::test]
async fn test_redeem_twice_is_rejected() {
    let app = TestApp::spawn();
    let account = app.enroll(AccountType::Standard, false).await;
    let coupon = app.create_coupon("10.0", true).await;

    app.state
        .coupons
        .redeem(&coupon.code, account.account_id)
        .await
        .unwrap();
    let err = app
        .state
        .coupons
        .redeem(&coupon.code, account.account_id)
        .await
        .unwrap_err();

    assert!(matches!(err, CreditError::CouponAlreadyRedeemed(_)));
    assert_eq!(app.totals(account.account_id).await.remaining, dec("10.0"));
}

#[tokio::test]
async fn test_tier_must_match_coupon() {
    let app = TestApp::spawn();
    let standard = app.enroll(AccountType::Standard, false).await;
    let premium = app.enroll(AccountType::Premium, false).await;
    let standard_coupon = app.create_coupon("10.0", true).await;
    let premium_coupon = app.create_coupon("50.0", false).await;

    let err = app
        .state
        .coupons
        .redeem(&standard_coupon.code, premium.account_id)
        .await
        .unwrap_err();
    assert!(matches!(err, CreditError::CouponRejected { .. }));

    let err = app
        .state
        .coupons
        .redeem(&premium_coupon.code, standard.account_id)
        .await
        .unwrap_err();
    assert!(matches!(err, CreditError::CouponRejected { .. }));

    app.state
        .coupons
        .redeem(&premium_coupon.code, premium.account_id)
        .await
        .unwrap();
    assert_eq!(app.totals(premium.account_id).await.remaining, dec("50.0"));
}

#[tokio::test]
async fn test_disabled_coupon_is_rejected() {
    let app = TestApp::spawn();
    let account = app.enroll(AccountType::Standard, false).await;
    let coupon = app.create_coupon("10.0", true).await;

    let disabled = app.state.coupons.disable(&coupon.code).await.unwrap();
    assert!(disabled.is_disabled());

    let err = app
        .state
        .coupons
        .redeem(&coupon.code, account.account_id)
        .await
        .unwrap_err();
    assert!(matches!(err, CreditError::CouponRejected { .. }));
    assert!(app
        .state
        .ledger
        .list_credits(account.account_id, true)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_redemption_window_is_enforced() {
    let app = TestApp::spawn();
    let account = app.enroll(AccountType::Standard, false).await;

    let mut future = coupon_input(&app, "10.0", 5);
    future.start_utc = Some(app.now() + Duration::days(1));
    let future = app.state.coupons.create(future).await.unwrap();
    let err = app
        .state
        .coupons
        .redeem(&future.code, account.account_id)
        .await
        .unwrap_err();
    assert!(matches!(err, CreditError::CouponRejected { .. }));

    let expiring = app
        .state
        .coupons
        .create(coupon_input(&app, "10.0", 5))
        .await
        .unwrap();
    app.advance(Duration::days(31));
    let err = app
        .state
        .coupons
        .redeem(&expiring.code, account.account_id)
        .await
        .unwrap_err();
    assert!(matches!(err, CreditError::CouponRejected { .. }));
}

#[tokio::test]
async fn test_uses_are_limited() {
    let app = TestApp::spawn();
    let coupon = app
        .state
        .coupons
        .create(coupon_input(&app, "10.0", 1))
        .await
        .unwrap();
    let first = app.enroll(AccountType::Standard, false).await;
    let second = app.enroll(AccountType::Standard, false).await;

    app.state
        .coupons
        .redeem(&coupon.code, first.account_id)
        .await
        .unwrap();
    let err = app
        .state
        .coupons
        .redeem(&coupon.code, second.account_id)
        .await
        .unwrap_err();

    assert!(matches!(err, CreditError::CouponRejected { .. }));
    assert_eq!(app.state.coupons.get(&coupon.code).await.unwrap().uses_left(), 0);
}

#[tokio::test]
async fn test_concurrent_redemptions_respect_use_limit() {
    let app = TestApp::spawn();
    let coupon = app
        .state
        .coupons
        .create(coupon_input(&app, "10.0", 3))
        .await
        .unwrap();
    let mut accounts = Vec::new();
    for _ in 0..6 {
        accounts.push(app.enroll(AccountType::Standard, false).await.account_id);
    }

    let results = futures::future::join_all(
        accounts
            .iter()
            .map(|id| app.state.coupons.redeem(&coupon.code, *id)),
    )
    .await;

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 3);
    assert_eq!(app.state.coupons.get(&coupon.code).await.unwrap().num_redeemed, 3);
}

#[tokio::test]
async fn test_redeem_clears_termination_policy() {
    let app = TestApp::spawn();
    let account = app.enroll(AccountType::Standard, false).await;
    let flagged = app
        .state
        .accounts
        .set_termination_policy(account.account_id, true)
        .await
        .unwrap();
    assert!(flagged.terminate_paid_services);

    let coupon = app.create_coupon("10.0", true).await;
    app.state
        .coupons
        .redeem(&coupon.code, account.account_id)
        .await
        .unwrap();

    let account = app.account(account.account_id).await;
    assert!(!account.termination_policy);
    assert!(!account.terminate_paid_services);
    assert!(account.paid_services_allowed);
}

#[tokio::test]
async fn test_create_validation() {
    let app = TestApp::spawn();

    let mut zero = coupon_input(&app, "0", 5);
    zero.code = Some("ZERO-VALUE".to_string());
    assert!(matches!(
        app.state.coupons.create(zero).await.unwrap_err(),
        CreditError::InvalidAmount(_)
    ));

    let too_many = coupon_input(&app, "10.0", 1001);
    assert!(matches!(
        app.state.coupons.create(too_many).await.unwrap_err(),
        CreditError::InvalidRequest(_)
    ));

    let mut bad_creator = coupon_input(&app, "10.0", 5);
    bad_creator.creator = "not-an-email".to_string();
    assert!(matches!(
        app.state.coupons.create(bad_creator).await.unwrap_err(),
        CreditError::Validation(_)
    ));

    let mut named = coupon_input(&app, "10.0", 5);
    named.code = Some("LAUNCH-2024".to_string());
    app.state.coupons.create(named.clone()).await.unwrap();
    assert!(matches!(
        app.state.coupons.create(named).await.unwrap_err(),
        CreditError::CouponExists(_)
    ));
    assert_eq!(app.state.coupons.list().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_unknown_coupon_and_account() {
    let app = TestApp::spawn();
    let account = app.enroll(AccountType::Standard, false).await;

    let err = app
        .state
        .coupons
        .redeem("NOPE-NOPE-NOPE", account.account_id)
        .await
        .unwrap_err();
    assert!(matches!(err, CreditError::CouponNotFound(_)));

    let coupon = app.create_coupon("10.0", true).await;
    let err = app
        .state
        .coupons
        .redeem(&coupon.code, Uuid::new_v4())
        .await
        .unwrap_err();
    assert!(matches!(err, CreditError::AccountNotFound(_)));
}
