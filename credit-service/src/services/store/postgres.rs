//! PostgreSQL store for credit-service.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{FromRow, PgExecutor, Postgres, Transaction};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

use super::{BookSnapshot, ClaimOutcome, CreditStore, LedgerCommit};
use crate::models::{
    AccountType, ApplicationKind, BillingPeriod, CloudAccount, Coupon, Credit, CreditCharge,
    CreditOrigin, CreditState, CreditStateTransition, DeliveryStatus, IngestOutcome, Invoice,
    InvoiceLineItem, InvoiceStatus, LedgerApplication, NotificationEvent, NotificationKind,
    NotificationMarks, ReconciliationState, Redemption, Shortfall, ShortfallStatus, StoredUsage,
    UpgradeStatus, UsageRecord,
};
use crate::services::metrics::DB_QUERY_DURATION;

fn db_error(operation: &str, e: sqlx::Error) -> AppError {
    AppError::DatabaseError(anyhow::anyhow!("Failed to {}: {}", operation, e))
}

fn corrupt(column: &str, value: &str) -> AppError {
    AppError::DatabaseError(anyhow::anyhow!(
        "Unexpected value '{}' in column {}",
        value,
        column
    ))
}

fn parse<T>(column: &str, value: &str, f: impl Fn(&str) -> Option<T>) -> Result<T, AppError> {
    f(value).ok_or_else(|| corrupt(column, value))
}

fn to_count(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

fn to_db_count(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

/// Advisory lock key guarding usage appends for one account.
fn usage_lock_key(account_id: Uuid) -> i64 {
    let (high, low) = account_id.as_u64_pair();
    (high ^ low) as i64
}

// -----------------------------------------------------------------------------
// Row types
// -----------------------------------------------------------------------------

#[derive(Debug, FromRow)]
struct AccountRow {
    account_id: Uuid,
    account_type: String,
    owner_email: String,
    country_code: String,
    has_payment_method: bool,
    paid_services_allowed: bool,
    low_credits: bool,
    terminate_paid_services: bool,
    termination_policy: bool,
    credits_depleted: DateTime<Utc>,
    premium_upgrade: String,
    enterprise_upgrade: String,
    created_utc: DateTime<Utc>,
    updated_utc: DateTime<Utc>,
}

impl TryFrom<AccountRow> for CloudAccount {
    type Error = AppError;

    fn try_from(row: AccountRow) -> Result<Self, Self::Error> {
        Ok(Self {
            account_id: row.account_id,
            account_type: parse("account_type", &row.account_type, AccountType::from_string)?,
            owner_email: row.owner_email,
            country_code: row.country_code,
            has_payment_method: row.has_payment_method,
            paid_services_allowed: row.paid_services_allowed,
            low_credits: row.low_credits,
            terminate_paid_services: row.terminate_paid_services,
            termination_policy: row.termination_policy,
            credits_depleted: row.credits_depleted,
            premium_upgrade: parse("premium_upgrade", &row.premium_upgrade, UpgradeStatus::from_string)?,
            enterprise_upgrade: parse(
                "enterprise_upgrade",
                &row.enterprise_upgrade,
                UpgradeStatus::from_string,
            )?,
            created_utc: row.created_utc,
            updated_utc: row.updated_utc,
        })
    }
}

#[derive(Debug, FromRow)]
struct CreditRow {
    credit_id: Uuid,
    account_id: Uuid,
    origin: String,
    coupon_code: Option<String>,
    granted_amount: Decimal,
    remaining_amount: Decimal,
    created_utc: DateTime<Utc>,
    expires_utc: DateTime<Utc>,
}

impl TryFrom<CreditRow> for Credit {
    type Error = AppError;

    fn try_from(row: CreditRow) -> Result<Self, Self::Error> {
        Ok(Self {
            credit_id: row.credit_id,
            account_id: row.account_id,
            origin: parse("origin", &row.origin, CreditOrigin::from_string)?,
            coupon_code: row.coupon_code,
            granted_amount: row.granted_amount,
            remaining_amount: row.remaining_amount,
            created_utc: row.created_utc,
            expires_utc: row.expires_utc,
        })
    }
}

#[derive(Debug, FromRow)]
struct ApplicationRow {
    application_id: Uuid,
    account_id: Uuid,
    kind: String,
    product_type: Option<String>,
    transaction_id: Option<String>,
    shortfall_id: Option<Uuid>,
    period_start: NaiveDate,
    amount: Decimal,
    charges: Json<Vec<CreditCharge>>,
    unapplied_amount: Decimal,
    created_utc: DateTime<Utc>,
}

impl TryFrom<ApplicationRow> for LedgerApplication {
    type Error = AppError;

    fn try_from(row: ApplicationRow) -> Result<Self, Self::Error> {
        Ok(Self {
            application_id: row.application_id,
            account_id: row.account_id,
            kind: parse("kind", &row.kind, ApplicationKind::from_string)?,
            product_type: row.product_type,
            transaction_id: row.transaction_id,
            shortfall_id: row.shortfall_id,
            period: BillingPeriod::starting(row.period_start),
            amount: row.amount,
            charges: row.charges.0,
            unapplied_amount: row.unapplied_amount,
            created_utc: row.created_utc,
        })
    }
}

#[derive(Debug, FromRow)]
struct ShortfallRow {
    shortfall_id: Uuid,
    account_id: Uuid,
    application_id: Uuid,
    product_type: Option<String>,
    period_start: NaiveDate,
    original_amount: Decimal,
    amount: Decimal,
    status: String,
    invoice_id: Option<Uuid>,
    created_utc: DateTime<Utc>,
}

impl TryFrom<ShortfallRow> for Shortfall {
    type Error = AppError;

    fn try_from(row: ShortfallRow) -> Result<Self, Self::Error> {
        Ok(Self {
            shortfall_id: row.shortfall_id,
            account_id: row.account_id,
            application_id: row.application_id,
            product_type: row.product_type,
            period: BillingPeriod::starting(row.period_start),
            original_amount: row.original_amount,
            amount: row.amount,
            status: parse("status", &row.status, ShortfallStatus::from_string)?,
            invoice_id: row.invoice_id,
            created_utc: row.created_utc,
        })
    }
}

#[derive(Debug, FromRow)]
struct InvoiceRow {
    invoice_id: Uuid,
    account_id: Uuid,
    period_start: NaiveDate,
    status: String,
    total: Decimal,
    paid: Decimal,
    due: Decimal,
    line_items: Json<Vec<InvoiceLineItem>>,
    created_utc: DateTime<Utc>,
    decided_utc: Option<DateTime<Utc>>,
    updated_utc: DateTime<Utc>,
}

impl TryFrom<InvoiceRow> for Invoice {
    type Error = AppError;

    fn try_from(row: InvoiceRow) -> Result<Self, Self::Error> {
        Ok(Self {
            invoice_id: row.invoice_id,
            account_id: row.account_id,
            period: BillingPeriod::starting(row.period_start),
            status: parse("status", &row.status, InvoiceStatus::from_string)?,
            total: row.total,
            paid: row.paid,
            due: row.due,
            line_items: row.line_items.0,
            created_utc: row.created_utc,
            decided_utc: row.decided_utc,
            updated_utc: row.updated_utc,
        })
    }
}

#[derive(Debug, FromRow)]
struct NotificationRow {
    event_id: Uuid,
    account_id: Uuid,
    kind: String,
    credit_id: Option<Uuid>,
    fired_utc: DateTime<Utc>,
    delivery: String,
    attempts: i32,
    delivered_utc: Option<DateTime<Utc>>,
}

impl TryFrom<NotificationRow> for NotificationEvent {
    type Error = AppError;

    fn try_from(row: NotificationRow) -> Result<Self, Self::Error> {
        Ok(Self {
            event_id: row.event_id,
            account_id: row.account_id,
            kind: parse("kind", &row.kind, NotificationKind::from_string)?,
            credit_id: row.credit_id,
            fired_utc: row.fired_utc,
            delivery: parse("delivery", &row.delivery, DeliveryStatus::from_string)?,
            attempts: to_count(row.attempts),
            delivered_utc: row.delivered_utc,
        })
    }
}

#[derive(Debug, FromRow)]
struct TransitionRow {
    account_id: Uuid,
    from_state: String,
    to_state: String,
    remaining: Decimal,
    at: DateTime<Utc>,
}

impl TryFrom<TransitionRow> for CreditStateTransition {
    type Error = AppError;

    fn try_from(row: TransitionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            account_id: row.account_id,
            from_state: parse("from_state", &row.from_state, CreditState::from_string)?,
            to_state: parse("to_state", &row.to_state, CreditState::from_string)?,
            remaining: row.remaining,
            at: row.at,
        })
    }
}

#[derive(Debug, FromRow)]
struct StateRow {
    account_id: Uuid,
    usage_cursor: i64,
    credit_state: String,
    healthy_since_depletion: bool,
    marks: Json<NotificationMarks>,
    grant_base: Option<Decimal>,
    last_run_utc: Option<DateTime<Utc>>,
}

impl TryFrom<StateRow> for ReconciliationState {
    type Error = AppError;

    fn try_from(row: StateRow) -> Result<Self, Self::Error> {
        Ok(Self {
            account_id: row.account_id,
            cursor: row.usage_cursor,
            credit_state: parse("credit_state", &row.credit_state, CreditState::from_string)?,
            healthy_since_depletion: row.healthy_since_depletion,
            marks: row.marks.0,
            grant_base: row.grant_base,
            last_run_utc: row.last_run_utc,
        })
    }
}

#[derive(Debug, FromRow)]
struct UsageRow {
    sequence: i64,
    transaction_id: String,
    account_id: Uuid,
    product_type: String,
    quantity: Decimal,
    usage_timestamp: DateTime<Utc>,
    region: Option<String>,
    properties: Json<BTreeMap<String, String>>,
    received_utc: DateTime<Utc>,
}

impl From<UsageRow> for StoredUsage {
    fn from(row: UsageRow) -> Self {
        Self {
            sequence: row.sequence,
            record: UsageRecord {
                transaction_id: row.transaction_id,
                account_id: row.account_id,
                product_type: row.product_type,
                quantity: row.quantity,
                timestamp: row.usage_timestamp,
                region: row.region,
                properties: row.properties.0,
            },
            received_utc: row.received_utc,
        }
    }
}

#[derive(Debug, FromRow)]
struct CouponRow {
    code: String,
    amount: Decimal,
    creator: String,
    is_standard: bool,
    num_uses: i32,
    num_redeemed: i32,
    start_utc: DateTime<Utc>,
    expires_utc: DateTime<Utc>,
    created_utc: DateTime<Utc>,
    disabled_utc: Option<DateTime<Utc>>,
}

impl From<CouponRow> for Coupon {
    fn from(row: CouponRow) -> Self {
        Self {
            code: row.code,
            amount: row.amount,
            creator: row.creator,
            is_standard: row.is_standard,
            num_uses: to_count(row.num_uses),
            num_redeemed: to_count(row.num_redeemed),
            start_utc: row.start_utc,
            expires_utc: row.expires_utc,
            created_utc: row.created_utc,
            disabled_utc: row.disabled_utc,
        }
    }
}

#[derive(Debug, FromRow)]
struct RedemptionRow {
    code: String,
    account_id: Uuid,
    redeemed_utc: DateTime<Utc>,
}

impl From<RedemptionRow> for Redemption {
    fn from(row: RedemptionRow) -> Self {
        Self {
            code: row.code,
            account_id: row.account_id,
            redeemed_utc: row.redeemed_utc,
        }
    }
}

fn convert<R, T>(rows: Vec<R>) -> Result<Vec<T>, AppError>
where
    T: TryFrom<R, Error = AppError>,
{
    rows.into_iter().map(T::try_from).collect()
}

const ACCOUNT_COLUMNS: &str = "account_id, account_type, owner_email, country_code, \
    has_payment_method, paid_services_allowed, low_credits, terminate_paid_services, \
    termination_policy, credits_depleted, premium_upgrade, enterprise_upgrade, created_utc, updated_utc";

const CREDIT_COLUMNS: &str = "credit_id, account_id, origin, coupon_code, granted_amount, \
    remaining_amount, created_utc, expires_utc";

const SHORTFALL_COLUMNS: &str = "shortfall_id, account_id, application_id, product_type, \
    period_start, original_amount, amount, status, invoice_id, created_utc";

const INVOICE_COLUMNS: &str = "invoice_id, account_id, period_start, status, total, paid, due, \
    line_items, created_utc, decided_utc, updated_utc";

const NOTIFICATION_COLUMNS: &str =
    "event_id, account_id, kind, credit_id, fired_utc, delivery, attempts, delivered_utc";

const USAGE_COLUMNS: &str = "sequence, transaction_id, account_id, product_type, quantity, \
    usage_timestamp, region, properties, received_utc";

const COUPON_COLUMNS: &str = "code, amount, creator, is_standard, num_uses, num_redeemed, \
    start_utc, expires_utc, created_utc, disabled_utc";

/// Database connection pool wrapper implementing [`CreditStore`].
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "credit-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    async fn fetch_account<'e, E>(executor: E, account_id: Uuid) -> Result<Option<CloudAccount>, AppError>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as::<_, AccountRow>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM cloud_accounts WHERE account_id = $1"
        ))
        .bind(account_id)
        .fetch_optional(executor)
        .await
        .map_err(|e| db_error("get account", e))?
        .map(CloudAccount::try_from)
        .transpose()
    }

    async fn fetch_credits<'e, E>(executor: E, account_id: Uuid) -> Result<Vec<Credit>, AppError>
    where
        E: PgExecutor<'e>,
    {
        let rows = sqlx::query_as::<_, CreditRow>(&format!(
            "SELECT {CREDIT_COLUMNS} FROM credits WHERE account_id = $1 ORDER BY created_utc, credit_id"
        ))
        .bind(account_id)
        .fetch_all(executor)
        .await
        .map_err(|e| db_error("list credits", e))?;
        convert(rows)
    }

    async fn fetch_shortfalls<'e, E>(executor: E, account_id: Uuid) -> Result<Vec<Shortfall>, AppError>
    where
        E: PgExecutor<'e>,
    {
        let rows = sqlx::query_as::<_, ShortfallRow>(&format!(
            "SELECT {SHORTFALL_COLUMNS} FROM shortfalls WHERE account_id = $1 ORDER BY created_utc, shortfall_id"
        ))
        .bind(account_id)
        .fetch_all(executor)
        .await
        .map_err(|e| db_error("list shortfalls", e))?;
        convert(rows)
    }

    async fn fetch_state<'e, E>(
        executor: E,
        account_id: Uuid,
    ) -> Result<Option<ReconciliationState>, AppError>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as::<_, StateRow>(
            r#"
            SELECT account_id, usage_cursor, credit_state, healthy_since_depletion, marks,
                   grant_base, last_run_utc
            FROM reconciliation_states
            WHERE account_id = $1
            "#,
        )
        .bind(account_id)
        .fetch_optional(executor)
        .await
        .map_err(|e| db_error("load reconciliation state", e))?
        .map(ReconciliationState::try_from)
        .transpose()
    }

    // -------------------------------------------------------------------------
    // Commit steps, all inside the caller's transaction
    // -------------------------------------------------------------------------

    async fn write_account(
        tx: &mut Transaction<'_, Postgres>,
        account: &CloudAccount,
    ) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            UPDATE cloud_accounts
            SET account_type = $2, owner_email = $3, country_code = $4, has_payment_method = $5,
                paid_services_allowed = $6, low_credits = $7, terminate_paid_services = $8,
                termination_policy = $9, credits_depleted = $10, premium_upgrade = $11,
                enterprise_upgrade = $12, updated_utc = $13
            WHERE account_id = $1
            "#,
        )
        .bind(account.account_id)
        .bind(account.account_type.as_str())
        .bind(&account.owner_email)
        .bind(&account.country_code)
        .bind(account.has_payment_method)
        .bind(account.paid_services_allowed)
        .bind(account.low_credits)
        .bind(account.terminate_paid_services)
        .bind(account.termination_policy)
        .bind(account.credits_depleted)
        .bind(account.premium_upgrade.as_str())
        .bind(account.enterprise_upgrade.as_str())
        .bind(account.updated_utc)
        .execute(&mut **tx)
        .await
        .map_err(|e| db_error("update account", e))?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "account {} not found",
                account.account_id
            )));
        }
        Ok(())
    }

    async fn write_credit(tx: &mut Transaction<'_, Postgres>, credit: &Credit) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO credits (credit_id, account_id, origin, coupon_code, granted_amount,
                                 remaining_amount, created_utc, expires_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (credit_id) DO UPDATE SET remaining_amount = EXCLUDED.remaining_amount
            "#,
        )
        .bind(credit.credit_id)
        .bind(credit.account_id)
        .bind(credit.origin.as_str())
        .bind(&credit.coupon_code)
        .bind(credit.granted_amount)
        .bind(credit.remaining_amount)
        .bind(credit.created_utc)
        .bind(credit.expires_utc)
        .execute(&mut **tx)
        .await
        .map_err(|e| db_error("write credit", e))?;
        Ok(())
    }

    async fn write_application(
        tx: &mut Transaction<'_, Postgres>,
        application: &LedgerApplication,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO ledger_applications (application_id, account_id, kind, product_type,
                                             transaction_id, shortfall_id, period_start, amount,
                                             charges, unapplied_amount, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(application.application_id)
        .bind(application.account_id)
        .bind(application.kind.as_str())
        .bind(&application.product_type)
        .bind(&application.transaction_id)
        .bind(application.shortfall_id)
        .bind(application.period.start)
        .bind(application.amount)
        .bind(Json(&application.charges))
        .bind(application.unapplied_amount)
        .bind(application.created_utc)
        .execute(&mut **tx)
        .await
        .map_err(|e| db_error("insert ledger application", e))?;
        Ok(())
    }

    async fn write_invoice(tx: &mut Transaction<'_, Postgres>, invoice: &Invoice) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO invoices (invoice_id, account_id, period_start, status, total, paid, due,
                                  line_items, created_utc, decided_utc, updated_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (invoice_id) DO UPDATE
            SET status = EXCLUDED.status, total = EXCLUDED.total, paid = EXCLUDED.paid,
                due = EXCLUDED.due, line_items = EXCLUDED.line_items,
                decided_utc = EXCLUDED.decided_utc, updated_utc = EXCLUDED.updated_utc
            "#,
        )
        .bind(invoice.invoice_id)
        .bind(invoice.account_id)
        .bind(invoice.period.start)
        .bind(invoice.status.as_str())
        .bind(invoice.total)
        .bind(invoice.paid)
        .bind(invoice.due)
        .bind(Json(&invoice.line_items))
        .bind(invoice.created_utc)
        .bind(invoice.decided_utc)
        .bind(invoice.updated_utc)
        .execute(&mut **tx)
        .await
        .map_err(|e| db_error("write invoice", e))?;
        Ok(())
    }

    async fn write_shortfall(
        tx: &mut Transaction<'_, Postgres>,
        shortfall: &Shortfall,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO shortfalls (shortfall_id, account_id, application_id, product_type,
                                    period_start, original_amount, amount, status, invoice_id,
                                    created_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (shortfall_id) DO UPDATE
            SET amount = EXCLUDED.amount, status = EXCLUDED.status, invoice_id = EXCLUDED.invoice_id
            "#,
        )
        .bind(shortfall.shortfall_id)
        .bind(shortfall.account_id)
        .bind(shortfall.application_id)
        .bind(&shortfall.product_type)
        .bind(shortfall.period.start)
        .bind(shortfall.original_amount)
        .bind(shortfall.amount)
        .bind(shortfall.status.as_str())
        .bind(shortfall.invoice_id)
        .bind(shortfall.created_utc)
        .execute(&mut **tx)
        .await
        .map_err(|e| db_error("write shortfall", e))?;
        Ok(())
    }

    async fn write_notification(
        tx: &mut Transaction<'_, Postgres>,
        event: &NotificationEvent,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO notification_events (event_id, account_id, kind, credit_id, fired_utc,
                                             delivery, attempts, delivered_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(event.event_id)
        .bind(event.account_id)
        .bind(event.kind.as_str())
        .bind(event.credit_id)
        .bind(event.fired_utc)
        .bind(event.delivery.as_str())
        .bind(to_db_count(event.attempts))
        .bind(event.delivered_utc)
        .execute(&mut **tx)
        .await
        .map_err(|e| db_error("insert notification", e))?;
        Ok(())
    }

    async fn write_transition(
        tx: &mut Transaction<'_, Postgres>,
        transition: &CreditStateTransition,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO credit_state_transitions (account_id, from_state, to_state, remaining, at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(transition.account_id)
        .bind(transition.from_state.as_str())
        .bind(transition.to_state.as_str())
        .bind(transition.remaining)
        .bind(transition.at)
        .execute(&mut **tx)
        .await
        .map_err(|e| db_error("insert state transition", e))?;
        Ok(())
    }

    async fn write_state(
        tx: &mut Transaction<'_, Postgres>,
        state: &ReconciliationState,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO reconciliation_states (account_id, usage_cursor, credit_state,
                                               healthy_since_depletion, marks, grant_base,
                                               last_run_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (account_id) DO UPDATE
            SET usage_cursor = EXCLUDED.usage_cursor, credit_state = EXCLUDED.credit_state,
                healthy_since_depletion = EXCLUDED.healthy_since_depletion,
                marks = EXCLUDED.marks, grant_base = EXCLUDED.grant_base,
                last_run_utc = EXCLUDED.last_run_utc
            "#,
        )
        .bind(state.account_id)
        .bind(state.cursor)
        .bind(state.credit_state.as_str())
        .bind(state.healthy_since_depletion)
        .bind(Json(&state.marks))
        .bind(state.grant_base)
        .bind(state.last_run_utc)
        .execute(&mut **tx)
        .await
        .map_err(|e| db_error("write reconciliation state", e))?;
        Ok(())
    }
}

#[async_trait]
impl CreditStore for PgStore {
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Accounts
    // -------------------------------------------------------------------------

    #[instrument(skip(self, account), fields(account_id = %account.account_id))]
    async fn insert_account(&self, account: &CloudAccount) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_account"])
            .start_timer();

        let result = sqlx::query(&format!(
            "INSERT INTO cloud_accounts ({ACCOUNT_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14) \
             ON CONFLICT (account_id) DO NOTHING"
        ))
        .bind(account.account_id)
        .bind(account.account_type.as_str())
        .bind(&account.owner_email)
        .bind(&account.country_code)
        .bind(account.has_payment_method)
        .bind(account.paid_services_allowed)
        .bind(account.low_credits)
        .bind(account.terminate_paid_services)
        .bind(account.termination_policy)
        .bind(account.credits_depleted)
        .bind(account.premium_upgrade.as_str())
        .bind(account.enterprise_upgrade.as_str())
        .bind(account.created_utc)
        .bind(account.updated_utc)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("insert account", e))?;

        timer.observe_duration();
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn get_account(&self, account_id: Uuid) -> Result<Option<CloudAccount>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_account"])
            .start_timer();

        let account = Self::fetch_account(&self.pool, account_id).await?;

        timer.observe_duration();
        Ok(account)
    }

    #[instrument(skip(self))]
    async fn list_account_ids(&self) -> Result<Vec<Uuid>, AppError> {
        sqlx::query_scalar::<_, Uuid>("SELECT account_id FROM cloud_accounts ORDER BY account_id")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_error("list accounts", e))
    }

    // -------------------------------------------------------------------------
    // Ledger reads
    // -------------------------------------------------------------------------

    #[instrument(skip(self))]
    async fn load_book(&self, account_id: Uuid) -> Result<Option<BookSnapshot>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["load_book"])
            .start_timer();

        // One snapshot, so a concurrent commit is seen entirely or not at all.
        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("set snapshot isolation", e))?;

        let Some(account) = Self::fetch_account(&mut *tx, account_id).await? else {
            return Ok(None);
        };
        let credits = Self::fetch_credits(&mut *tx, account_id).await?;
        let shortfalls = Self::fetch_shortfalls(&mut *tx, account_id).await?;
        let state = Self::fetch_state(&mut *tx, account_id).await?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to end read transaction: {}", e))
        })?;

        timer.observe_duration();

        Ok(Some(BookSnapshot {
            account,
            credits,
            shortfalls,
            state,
        }))
    }

    #[instrument(skip(self))]
    async fn list_credits(&self, account_id: Uuid) -> Result<Vec<Credit>, AppError> {
        Self::fetch_credits(&self.pool, account_id).await
    }

    #[instrument(skip(self))]
    async fn list_applications(
        &self,
        account_id: Uuid,
    ) -> Result<Vec<LedgerApplication>, AppError> {
        let rows = sqlx::query_as::<_, ApplicationRow>(
            r#"
            SELECT application_id, account_id, kind, product_type, transaction_id, shortfall_id,
                   period_start, amount, charges, unapplied_amount, created_utc
            FROM ledger_applications
            WHERE account_id = $1
            ORDER BY created_utc, application_id
            "#,
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("list ledger applications", e))?;
        convert(rows)
    }

    #[instrument(skip(self))]
    async fn list_shortfalls(&self, account_id: Uuid) -> Result<Vec<Shortfall>, AppError> {
        Self::fetch_shortfalls(&self.pool, account_id).await
    }

    #[instrument(skip(self))]
    async fn list_transitions(
        &self,
        account_id: Uuid,
    ) -> Result<Vec<CreditStateTransition>, AppError> {
        let rows = sqlx::query_as::<_, TransitionRow>(
            r#"
            SELECT account_id, from_state, to_state, remaining, at
            FROM credit_state_transitions
            WHERE account_id = $1
            ORDER BY transition_id
            "#,
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("list state transitions", e))?;
        convert(rows)
    }

    // -------------------------------------------------------------------------
    // Usage
    // -------------------------------------------------------------------------

    #[instrument(skip(self, record), fields(transaction_id = %record.transaction_id))]
    async fn append_usage(
        &self,
        record: &UsageRecord,
        received_utc: DateTime<Utc>,
    ) -> Result<IngestOutcome, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["append_usage"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        // Appends for one account are serialised until commit, so their
        // sequence numbers become visible in order and a reader's cursor
        // never skips a row that commits later.
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(usage_lock_key(record.account_id))
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("lock account usage", e))?;

        let sequence = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO usage_records (transaction_id, account_id, product_type, quantity,
                                       usage_timestamp, region, properties, received_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (transaction_id) DO NOTHING
            RETURNING sequence
            "#,
        )
        .bind(&record.transaction_id)
        .bind(record.account_id)
        .bind(&record.product_type)
        .bind(record.quantity)
        .bind(record.timestamp)
        .bind(&record.region)
        .bind(Json(&record.properties))
        .bind(received_utc)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| db_error("append usage", e))?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();

        Ok(match sequence {
            Some(sequence) => IngestOutcome::Accepted { sequence },
            None => IngestOutcome::Duplicate,
        })
    }

    #[instrument(skip(self))]
    async fn usage_after(
        &self,
        account_id: Uuid,
        cursor: i64,
    ) -> Result<Vec<StoredUsage>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["usage_after"])
            .start_timer();

        let rows = sqlx::query_as::<_, UsageRow>(&format!(
            "SELECT {USAGE_COLUMNS} FROM usage_records \
             WHERE account_id = $1 AND sequence > $2 ORDER BY sequence"
        ))
        .bind(account_id)
        .bind(cursor)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("read usage", e))?;

        timer.observe_duration();
        Ok(rows.into_iter().map(StoredUsage::from).collect())
    }

    #[instrument(skip(self))]
    async fn usage_between(
        &self,
        account_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<StoredUsage>, AppError> {
        let rows = sqlx::query_as::<_, UsageRow>(&format!(
            "SELECT {USAGE_COLUMNS} FROM usage_records \
             WHERE account_id = $1 AND usage_timestamp >= $2 AND usage_timestamp < $3 \
             ORDER BY sequence"
        ))
        .bind(account_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("read usage window", e))?;
        Ok(rows.into_iter().map(StoredUsage::from).collect())
    }

    // -------------------------------------------------------------------------
    // Invoices
    // -------------------------------------------------------------------------

    #[instrument(skip(self))]
    async fn get_invoice(&self, invoice_id: Uuid) -> Result<Option<Invoice>, AppError> {
        sqlx::query_as::<_, InvoiceRow>(&format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices WHERE invoice_id = $1"
        ))
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("get invoice", e))?
        .map(Invoice::try_from)
        .transpose()
    }

    #[instrument(skip(self))]
    async fn list_invoices(&self, account_id: Option<Uuid>) -> Result<Vec<Invoice>, AppError> {
        let rows = sqlx::query_as::<_, InvoiceRow>(&format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices \
             WHERE ($1::uuid IS NULL OR account_id = $1) \
             ORDER BY created_utc, invoice_id"
        ))
        .bind(account_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("list invoices", e))?;
        convert(rows)
    }

    // -------------------------------------------------------------------------
    // Notifications
    // -------------------------------------------------------------------------

    #[instrument(skip(self))]
    async fn list_notifications(
        &self,
        account_id: Uuid,
    ) -> Result<Vec<NotificationEvent>, AppError> {
        let rows = sqlx::query_as::<_, NotificationRow>(&format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM notification_events \
             WHERE account_id = $1 ORDER BY fired_utc, event_id"
        ))
        .bind(account_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("list notifications", e))?;
        convert(rows)
    }

    #[instrument(skip(self))]
    async fn pending_notifications(
        &self,
        account_id: Uuid,
    ) -> Result<Vec<NotificationEvent>, AppError> {
        let rows = sqlx::query_as::<_, NotificationRow>(&format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM notification_events \
             WHERE account_id = $1 AND delivery = $2 ORDER BY fired_utc, event_id"
        ))
        .bind(account_id)
        .bind(DeliveryStatus::Pending.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("list pending notifications", e))?;
        convert(rows)
    }

    #[instrument(skip(self, event), fields(event_id = %event.event_id))]
    async fn update_notification(&self, event: &NotificationEvent) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            UPDATE notification_events
            SET delivery = $2, attempts = $3, delivered_utc = $4
            WHERE event_id = $1
            "#,
        )
        .bind(event.event_id)
        .bind(event.delivery.as_str())
        .bind(to_db_count(event.attempts))
        .bind(event.delivered_utc)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("update notification", e))?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "notification {} not found",
                event.event_id
            )));
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Atomic ledger write
    // -------------------------------------------------------------------------

    #[instrument(skip(self, commit), fields(
        credits = commit.credits.len(),
        applications = commit.applications.len(),
        shortfalls = commit.shortfalls.len(),
    ))]
    async fn commit(&self, commit: LedgerCommit) -> Result<(), AppError> {
        if commit.is_empty() {
            return Ok(());
        }

        let timer = DB_QUERY_DURATION
            .with_label_values(&["commit"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        if let Some(account) = &commit.account {
            Self::write_account(&mut tx, account).await?;
        }
        for credit in &commit.credits {
            Self::write_credit(&mut tx, credit).await?;
        }
        for application in &commit.applications {
            Self::write_application(&mut tx, application).await?;
        }
        // Invoices first: shortfalls reference them.
        for invoice in &commit.invoices {
            Self::write_invoice(&mut tx, invoice).await?;
        }
        for shortfall in &commit.shortfalls {
            Self::write_shortfall(&mut tx, shortfall).await?;
        }
        for event in &commit.notifications {
            Self::write_notification(&mut tx, event).await?;
        }
        for transition in &commit.transitions {
            Self::write_transition(&mut tx, transition).await?;
        }
        if let Some(state) = &commit.state {
            Self::write_state(&mut tx, state).await?;
        }

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Coupons
    // -------------------------------------------------------------------------

    #[instrument(skip(self, coupon), fields(code = %coupon.code))]
    async fn insert_coupon(&self, coupon: &Coupon) -> Result<bool, AppError> {
        let result = sqlx::query(&format!(
            "INSERT INTO coupons ({COUPON_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             ON CONFLICT (code) DO NOTHING"
        ))
        .bind(&coupon.code)
        .bind(coupon.amount)
        .bind(&coupon.creator)
        .bind(coupon.is_standard)
        .bind(to_db_count(coupon.num_uses))
        .bind(to_db_count(coupon.num_redeemed))
        .bind(coupon.start_utc)
        .bind(coupon.expires_utc)
        .bind(coupon.created_utc)
        .bind(coupon.disabled_utc)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("insert coupon", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn get_coupon(&self, code: &str) -> Result<Option<Coupon>, AppError> {
        let row = sqlx::query_as::<_, CouponRow>(&format!(
            "SELECT {COUPON_COLUMNS} FROM coupons WHERE code = $1"
        ))
        .bind(code)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("get coupon", e))?;
        Ok(row.map(Coupon::from))
    }

    #[instrument(skip(self))]
    async fn list_coupons(&self) -> Result<Vec<Coupon>, AppError> {
        let rows = sqlx::query_as::<_, CouponRow>(&format!(
            "SELECT {COUPON_COLUMNS} FROM coupons ORDER BY created_utc, code"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("list coupons", e))?;
        Ok(rows.into_iter().map(Coupon::from).collect())
    }

    #[instrument(skip(self))]
    async fn disable_coupon(
        &self,
        code: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<Coupon>, AppError> {
        let row = sqlx::query_as::<_, CouponRow>(&format!(
            "UPDATE coupons SET disabled_utc = COALESCE(disabled_utc, $2) \
             WHERE code = $1 RETURNING {COUPON_COLUMNS}"
        ))
        .bind(code)
        .bind(at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("disable coupon", e))?;
        Ok(row.map(Coupon::from))
    }

    #[instrument(skip(self))]
    async fn list_redemptions(&self, code: &str) -> Result<Vec<Redemption>, AppError> {
        let rows = sqlx::query_as::<_, RedemptionRow>(
            r#"
            SELECT code, account_id, redeemed_utc
            FROM coupon_redemptions
            WHERE code = $1
            ORDER BY redeemed_utc, account_id
            "#,
        )
        .bind(code)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("list redemptions", e))?;
        Ok(rows.into_iter().map(Redemption::from).collect())
    }

    #[instrument(skip(self, redemption), fields(code = %redemption.code, account_id = %redemption.account_id))]
    async fn claim_redemption(&self, redemption: &Redemption) -> Result<ClaimOutcome, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["claim_redemption"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let inserted = match sqlx::query(
            r#"
            INSERT INTO coupon_redemptions (code, account_id, redeemed_utc)
            VALUES ($1, $2, $3)
            ON CONFLICT (code, account_id) DO NOTHING
            "#,
        )
        .bind(&redemption.code)
        .bind(redemption.account_id)
        .bind(redemption.redeemed_utc)
        .execute(&mut *tx)
        .await
        {
            Ok(result) => result,
            Err(sqlx::Error::Database(db_err)) if db_err.is_foreign_key_violation() => {
                return Ok(ClaimOutcome::Unavailable);
            }
            Err(e) => return Err(db_error("record redemption", e)),
        };
        if inserted.rows_affected() == 0 {
            return Ok(ClaimOutcome::AlreadyRedeemed);
        }

        let bumped = sqlx::query(
            r#"
            UPDATE coupons
            SET num_redeemed = num_redeemed + 1
            WHERE code = $1 AND disabled_utc IS NULL AND num_redeemed < num_uses
            "#,
        )
        .bind(&redemption.code)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("claim coupon use", e))?;

        if bumped.rows_affected() == 0 {
            let disabled = sqlx::query_scalar::<_, Option<DateTime<Utc>>>(
                "SELECT disabled_utc FROM coupons WHERE code = $1",
            )
            .bind(&redemption.code)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| db_error("read coupon", e))?;

            tx.rollback()
                .await
                .map_err(|e| db_error("roll back redemption", e))?;
            timer.observe_duration();

            return Ok(match disabled {
                Some(None) => ClaimOutcome::Exhausted,
                _ => ClaimOutcome::Unavailable,
            });
        }

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();
        Ok(ClaimOutcome::Claimed)
    }

    #[instrument(skip(self))]
    async fn release_redemption(&self, code: &str, account_id: Uuid) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let removed = sqlx::query("DELETE FROM coupon_redemptions WHERE code = $1 AND account_id = $2")
            .bind(code)
            .bind(account_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("release redemption", e))?;

        if removed.rows_affected() > 0 {
            sqlx::query(
                "UPDATE coupons SET num_redeemed = GREATEST(num_redeemed - 1, 0) WHERE code = $1",
            )
            .bind(code)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("release coupon use", e))?;
        }

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;
        Ok(())
    }
}
