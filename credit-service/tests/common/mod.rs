//! Test helper module for credit-service integration tests.
//!
//! Wires the full engine over an in-memory store with a controllable clock,
//! a recording notification publisher and a scripted payment gateway.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use credit_service::clock::ManualClock;
use credit_service::config::CouponConfig;
use credit_service::models::{
    AccountType, AddCredit, CloudAccount, Coupon, CreateCoupon, Credit, CreditOrigin,
    CreditStateTransition, CreditTotals, EnrollAccount, IngestOutcome, Invoice,
    LedgerApplication, NotificationEvent, NotificationKind, Redemption, Shortfall, StoredUsage,
    UsageRecord,
};
use credit_service::services::notifier::PublishError;
use credit_service::services::store::{BookSnapshot, ClaimOutcome, LedgerCommit};
use credit_service::services::{
    init_metrics, CreditStore, DeliveryPolicy, InMemoryStore, LowCreditThresholds,
    NotificationPublisher, PaymentGateway, PgStore, PriceTable,
};
use credit_service::startup::{AppState, Dependencies};
use credit_service::workers::TickReport;
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Once};
use uuid::Uuid;

static TRACING: Once = Once::new();
static SCHEMA_COUNTER: AtomicU32 = AtomicU32::new(0);

fn init_test_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::new("warn"))
            .with_test_writer()
            .try_init();
    });
}

pub fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

/// Mid-month start so a test has room before the period closes.
pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 10, 12, 0, 0).unwrap()
}

// -----------------------------------------------------------------------------
// Test doubles
// -----------------------------------------------------------------------------

/// Records every published notification and can be told to fail.
#[derive(Default)]
pub struct RecordingPublisher {
    sent: Mutex<Vec<(Uuid, NotificationKind)>>,
    fail_transient: AtomicBool,
    fail_permanent: AtomicBool,
}

impl RecordingPublisher {
    pub fn sent(&self) -> Vec<(Uuid, NotificationKind)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_kinds(&self, account_id: Uuid) -> Vec<NotificationKind> {
        self.sent()
            .into_iter()
            .filter(|(id, _)| *id == account_id)
            .map(|(_, kind)| kind)
            .collect()
    }

    pub fn fail_transiently(&self, fail: bool) {
        self.fail_transient.store(fail, Ordering::SeqCst);
    }

    pub fn fail_permanently(&self, fail: bool) {
        self.fail_permanent.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl NotificationPublisher for RecordingPublisher {
    async fn publish(
        &self,
        account: &CloudAccount,
        event: &NotificationEvent,
    ) -> Result<(), PublishError> {
        if self.fail_permanent.load(Ordering::SeqCst) {
            return Err(PublishError::InvalidRecipient(account.owner_email.clone()));
        }
        if self.fail_transient.load(Ordering::SeqCst) {
            return Err(PublishError::SendFailed("mail relay unavailable".to_string()));
        }
        self.sent
            .lock()
            .unwrap()
            .push((account.account_id, event.kind));
        Ok(())
    }
}

/// Captures a scripted amount, the full due amount, or fails.
#[derive(Default)]
pub struct ScriptedGateway {
    next_capture: Mutex<Option<Decimal>>,
    fail: AtomicBool,
}

impl ScriptedGateway {
    pub fn capture_next(&self, amount: Decimal) {
        *self.next_capture.lock().unwrap() = Some(amount);
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    async fn capture(&self, account: &CloudAccount, invoice: &Invoice) -> Result<Decimal, AppError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(AppError::PaymentError("gateway timeout".to_string()));
        }
        if let Some(amount) = self.next_capture.lock().unwrap().take() {
            return Ok(amount);
        }
        if account.has_payment_method {
            Ok(invoice.due)
        } else {
            Ok(Decimal::ZERO)
        }
    }
}

/// Delegates to a real store but can be made to reject commits.
pub struct FailingStore {
    inner: Arc<dyn CreditStore>,
    fail_commits: AtomicBool,
}

impl Default for FailingStore {
    fn default() -> Self {
        Self::wrapping(Arc::new(InMemoryStore::new()))
    }
}

impl FailingStore {
    pub fn wrapping(inner: Arc<dyn CreditStore>) -> Self {
        Self {
            inner,
            fail_commits: AtomicBool::new(false),
        }
    }

    pub fn fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl CreditStore for FailingStore {
    async fn health_check(&self) -> Result<(), AppError> {
        self.inner.health_check().await
    }

    async fn insert_account(&self, account: &CloudAccount) -> Result<bool, AppError> {
        self.inner.insert_account(account).await
    }

    async fn get_account(&self, account_id: Uuid) -> Result<Option<CloudAccount>, AppError> {
        self.inner.get_account(account_id).await
    }

    async fn list_account_ids(&self) -> Result<Vec<Uuid>, AppError> {
        self.inner.list_account_ids().await
    }

    async fn load_book(&self, account_id: Uuid) -> Result<Option<BookSnapshot>, AppError> {
        self.inner.load_book(account_id).await
    }

    async fn list_credits(&self, account_id: Uuid) -> Result<Vec<Credit>, AppError> {
        self.inner.list_credits(account_id).await
    }

    async fn list_applications(
        &self,
        account_id: Uuid,
    ) -> Result<Vec<LedgerApplication>, AppError> {
        self.inner.list_applications(account_id).await
    }

    async fn list_shortfalls(&self, account_id: Uuid) -> Result<Vec<Shortfall>, AppError> {
        self.inner.list_shortfalls(account_id).await
    }

    async fn list_transitions(
        &self,
        account_id: Uuid,
    ) -> Result<Vec<CreditStateTransition>, AppError> {
        self.inner.list_transitions(account_id).await
    }

    async fn append_usage(
        &self,
        record: &UsageRecord,
        received_utc: DateTime<Utc>,
    ) -> Result<IngestOutcome, AppError> {
        self.inner.append_usage(record, received_utc).await
    }

    async fn usage_after(
        &self,
        account_id: Uuid,
        cursor: i64,
    ) -> Result<Vec<StoredUsage>, AppError> {
        self.inner.usage_after(account_id, cursor).await
    }

    async fn usage_between(
        &self,
        account_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<StoredUsage>, AppError> {
        self.inner.usage_between(account_id, from, to).await
    }

    async fn get_invoice(&self, invoice_id: Uuid) -> Result<Option<Invoice>, AppError> {
        self.inner.get_invoice(invoice_id).await
    }

    async fn list_invoices(&self, account_id: Option<Uuid>) -> Result<Vec<Invoice>, AppError> {
        self.inner.list_invoices(account_id).await
    }

    async fn list_notifications(
        &self,
        account_id: Uuid,
    ) -> Result<Vec<NotificationEvent>, AppError> {
        self.inner.list_notifications(account_id).await
    }

    async fn pending_notifications(
        &self,
        account_id: Uuid,
    ) -> Result<Vec<NotificationEvent>, AppError> {
        self.inner.pending_notifications(account_id).await
    }

    async fn update_notification(&self, event: &NotificationEvent) -> Result<(), AppError> {
        self.inner.update_notification(event).await
    }

    async fn commit(&self, commit: LedgerCommit) -> Result<(), AppError> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(AppError::DatabaseError(anyhow::anyhow!(
                "connection reset during commit"
            )));
        }
        self.inner.commit(commit).await
    }

    async fn insert_coupon(&self, coupon: &Coupon) -> Result<bool, AppError> {
        self.inner.insert_coupon(coupon).await
    }

    async fn get_coupon(&self, code: &str) -> Result<Option<Coupon>, AppError> {
        self.inner.get_coupon(code).await
    }

    async fn list_coupons(&self) -> Result<Vec<Coupon>, AppError> {
        self.inner.list_coupons().await
    }

    async fn disable_coupon(
        &self,
        code: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<Coupon>, AppError> {
        self.inner.disable_coupon(code, at).await
    }

    async fn list_redemptions(&self, code: &str) -> Result<Vec<Redemption>, AppError> {
        self.inner.list_redemptions(code).await
    }

    async fn claim_redemption(&self, redemption: &Redemption) -> Result<ClaimOutcome, AppError> {
        self.inner.claim_redemption(redemption).await
    }

    async fn release_redemption(&self, code: &str, account_id: Uuid) -> Result<(), AppError> {
        self.inner.release_redemption(code, account_id).await
    }
}

// -----------------------------------------------------------------------------
// Harness
// -----------------------------------------------------------------------------

pub struct TestOptions {
    pub thresholds: LowCreditThresholds,
    pub email_enabled: bool,
    pub email_account_types: Vec<AccountType>,
}

impl Default for TestOptions {
    fn default() -> Self {
        Self {
            thresholds: LowCreditThresholds::default(),
            email_enabled: true,
            email_account_types: AccountType::ALL.to_vec(),
        }
    }
}

pub struct TestApp {
    pub state: AppState,
    pub clock: Arc<ManualClock>,
    pub store: Arc<FailingStore>,
    pub publisher: Arc<RecordingPublisher>,
    pub gateway: Arc<ScriptedGateway>,
    schema_name: Option<String>,
}

/// Database URL for the Postgres-backed suites. They are skipped when unset.
pub fn test_database_url() -> Option<String> {
    std::env::var("TEST_DATABASE_URL").ok().filter(|url| !url.is_empty())
}

fn unique_schema_name() -> String {
    let counter = SCHEMA_COUNTER.fetch_add(1, Ordering::SeqCst);
    format!("test_credit_{}_{}", std::process::id(), counter)
}

impl TestApp {
    pub fn spawn() -> Self {
        Self::spawn_with(TestOptions::default())
    }

    pub fn spawn_with(options: TestOptions) -> Self {
        Self::assemble(Arc::new(FailingStore::default()), options, None)
    }

    /// The same engine over `PgStore`, in a fresh schema. Returns `None`
    /// when `TEST_DATABASE_URL` is not set.
    pub async fn spawn_postgres() -> Option<Self> {
        let base_url = test_database_url()?;
        let schema_name = unique_schema_name();

        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(1)
            .connect(&base_url)
            .await
            .expect("Failed to connect to test database");
        sqlx::query(&format!("DROP SCHEMA IF EXISTS {} CASCADE", schema_name))
            .execute(&pool)
            .await
            .ok();
        sqlx::query(&format!("CREATE SCHEMA {}", schema_name))
            .execute(&pool)
            .await
            .expect("Failed to create test schema");
        pool.close().await;

        let separator = if base_url.contains('?') { "&" } else { "?" };
        let url = format!(
            "{}{}options=-c search_path%3D{}",
            base_url, separator, schema_name
        );
        let pg = PgStore::new(&url, 5, 1)
            .await
            .expect("Failed to connect PgStore");
        pg.run_migrations().await.expect("Failed to run migrations");

        let store = Arc::new(FailingStore::wrapping(Arc::new(pg)));
        Some(Self::assemble(store, TestOptions::default(), Some(schema_name)))
    }

    /// Drops the schema created by [`TestApp::spawn_postgres`].
    pub async fn cleanup(&self) {
        let (Some(schema_name), Some(base_url)) = (&self.schema_name, test_database_url()) else {
            return;
        };
        if let Ok(pool) = sqlx::postgres::PgPoolOptions::new()
            .max_connections(1)
            .connect(&base_url)
            .await
        {
            let _ = sqlx::query(&format!("DROP SCHEMA IF EXISTS {} CASCADE", schema_name))
                .execute(&pool)
                .await;
            pool.close().await;
        }
    }

    fn assemble(store: Arc<FailingStore>, options: TestOptions, schema_name: Option<String>) -> Self {
        init_test_tracing();
        init_metrics();

        let clock = Arc::new(ManualClock::new(start_time()));
        let publisher = Arc::new(RecordingPublisher::default());
        let gateway = Arc::new(ScriptedGateway::default());

        let state = AppState::assemble(Dependencies {
            store: store.clone(),
            clock: clock.clone(),
            publisher: publisher.clone(),
            gateway: gateway.clone(),
            prices: PriceTable::defaults(),
            thresholds: options.thresholds,
            delivery: DeliveryPolicy {
                email_enabled: options.email_enabled,
                account_types: options.email_account_types,
                retry_initial_interval: std::time::Duration::from_millis(1),
                retry_max_elapsed: std::time::Duration::from_millis(20),
            },
            coupons: CouponConfig::default(),
            max_parallel_accounts: 4,
            cleanup_threshold_days: 30,
        });

        Self {
            state,
            clock,
            store,
            publisher,
            gateway,
            schema_name,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        use credit_service::clock::Clock;
        self.clock.now()
    }

    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
    }

    pub async fn enroll(&self, account_type: AccountType, has_payment_method: bool) -> CloudAccount {
        self.state
            .accounts
            .enroll(EnrollAccount {
                account_id: None,
                account_type,
                owner_email: "owner@example.com".to_string(),
                country_code: "US".to_string(),
                has_payment_method,
                termination_policy: false,
            })
            .await
            .expect("Failed to enroll account")
    }

    /// Grants a credit expiring `days` from now.
    pub async fn grant(&self, account_id: Uuid, amount: &str, days: i64) -> Credit {
        self.state
            .ledger
            .add_credit(AddCredit {
                account_id,
                amount: dec(amount),
                expires_utc: self.now() + Duration::days(days),
                origin: CreditOrigin::Grant,
                coupon_code: None,
            })
            .await
            .expect("Failed to grant credit")
    }

    pub fn usage_record(&self, account_id: Uuid, sku: &str, quantity: &str) -> UsageRecord {
        UsageRecord {
            transaction_id: Uuid::new_v4().to_string(),
            account_id,
            product_type: sku.to_string(),
            quantity: dec(quantity),
            timestamp: self.now(),
            region: Some("us-region-1".to_string()),
            properties: Default::default(),
        }
    }

    pub async fn ingest(&self, account_id: Uuid, sku: &str, quantity: &str) -> IngestOutcome {
        let record = self.usage_record(account_id, sku, quantity);
        self.state
            .usage
            .ingest(record)
            .await
            .expect("Failed to ingest usage")
    }

    pub async fn tick(&self) -> TickReport {
        self.state
            .reconciler
            .run_tick()
            .await
            .expect("Reconciliation tick failed")
    }

    pub async fn account(&self, account_id: Uuid) -> CloudAccount {
        self.state
            .accounts
            .get_account(account_id)
            .await
            .expect("Failed to read account")
    }

    pub async fn totals(&self, account_id: Uuid) -> CreditTotals {
        self.state
            .ledger
            .totals(account_id)
            .await
            .expect("Failed to read totals")
    }

    pub async fn create_coupon(&self, amount: &str, is_standard: bool) -> Coupon {
        self.state
            .coupons
            .create(CreateCoupon {
                code: None,
                amount: dec(amount),
                creator: "sales@example.com".to_string(),
                is_standard,
                num_uses: 5,
                start_utc: None,
                expires_utc: None,
            })
            .await
            .expect("Failed to create coupon")
    }
}
