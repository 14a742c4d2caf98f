//! Prometheus metrics for credit-service.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter, register_histogram, register_histogram_vec, register_int_counter,
    register_int_counter_vec, Counter, Histogram, HistogramVec, IntCounter, IntCounterVec,
    TextEncoder,
};

/// Usage records by ingestion outcome (accepted, duplicate, rejected).
pub static USAGE_INGESTED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "credit_usage_ingested_total",
        "Usage records received by ingestion outcome",
        &["outcome"]
    )
    .expect("Failed to register usage_ingested_total")
});

/// Usage records charged against the ledger.
pub static USAGE_APPLIED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "credit_usage_applied_total",
        "Rated usage records charged against credits"
    )
    .expect("Failed to register usage_applied_total")
});

/// Usage amount no credit could cover.
pub static SHORTFALL_AMOUNT: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "credit_shortfall_amount_total",
        "Cumulative usage amount not covered by credit"
    )
    .expect("Failed to register shortfall_amount_total")
});

/// Credits granted by origin.
pub static CREDITS_GRANTED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "credit_credits_granted_total",
        "Credits granted by origin",
        &["origin"]
    )
    .expect("Failed to register credits_granted_total")
});

pub static CREDIT_AMOUNT_GRANTED: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "credit_amount_granted_total",
        "Cumulative credit amount granted"
    )
    .expect("Failed to register amount_granted_total")
});

/// Scheduler ticks by status (ok, partial, error).
pub static TICKS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "credit_reconciliation_ticks_total",
        "Reconciliation ticks by status",
        &["status"]
    )
    .expect("Failed to register reconciliation_ticks_total")
});

pub static TICK_DURATION: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "credit_reconciliation_tick_duration_seconds",
        "Duration of a full reconciliation tick in seconds",
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    )
    .expect("Failed to register tick_duration")
});

/// Per-account reconciliations (no account label to avoid cardinality explosion).
pub static ACCOUNT_RECONCILIATIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "credit_account_reconciliations_total",
        "Account reconciliations by status",
        &["status"]
    )
    .expect("Failed to register account_reconciliations_total")
});

pub static STATE_TRANSITIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "credit_state_transitions_total",
        "Credit state transitions by target state",
        &["to_state"]
    )
    .expect("Failed to register state_transitions_total")
});

/// Notifications by kind and delivery result.
pub static NOTIFICATIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "credit_notifications_total",
        "Credit notifications by kind and delivery result",
        &["kind", "delivery"]
    )
    .expect("Failed to register notifications_total")
});

/// Invoice lifecycle events (created, approved, discarded, payment, paid).
pub static INVOICES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "credit_invoices_total",
        "Invoice lifecycle events",
        &["action"]
    )
    .expect("Failed to register invoices_total")
});

pub static COUPON_REDEMPTIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "credit_coupon_redemptions_total",
        "Coupon redemption attempts by result",
        &["result"]
    )
    .expect("Failed to register coupon_redemptions_total")
});

pub static ACCOUNTS_ENROLLED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "credit_accounts_enrolled_total",
        "Accounts enrolled by account type",
        &["account_type"]
    )
    .expect("Failed to register accounts_enrolled_total")
});

/// Database query duration histogram.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "credit_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    )
    .expect("Failed to register db_query_duration")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&USAGE_INGESTED_TOTAL);
    Lazy::force(&USAGE_APPLIED_TOTAL);
    Lazy::force(&SHORTFALL_AMOUNT);
    Lazy::force(&CREDITS_GRANTED);
    Lazy::force(&CREDIT_AMOUNT_GRANTED);
    Lazy::force(&TICKS_TOTAL);
    Lazy::force(&TICK_DURATION);
    Lazy::force(&ACCOUNT_RECONCILIATIONS_TOTAL);
    Lazy::force(&STATE_TRANSITIONS_TOTAL);
    Lazy::force(&NOTIFICATIONS_TOTAL);
    Lazy::force(&INVOICES_TOTAL);
    Lazy::force(&COUPON_REDEMPTIONS_TOTAL);
    Lazy::force(&ACCOUNTS_ENROLLED);
    Lazy::force(&DB_QUERY_DURATION);
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_default()
}
