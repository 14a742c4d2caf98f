//! Domain errors for credit-service.

use service_core::error::AppError;
use thiserror::Error;
use uuid::Uuid;

use crate::models::InvoiceStatus;

#[derive(Debug, Error)]
pub enum CreditError {
    #[error("account {0} not found")]
    AccountNotFound(Uuid),

    #[error("account {0} already exists")]
    AccountExists(Uuid),

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unknown product: {0}")]
    UnknownProduct(String),

    #[error("invoice {0} not found")]
    InvoiceNotFound(Uuid),

    #[error("invoice {invoice_id} is {actual}, expected {expected}")]
    InvoiceStateConflict {
        invoice_id: Uuid,
        actual: InvoiceStatus,
        expected: &'static str,
    },

    #[error("coupon {0} not found")]
    CouponNotFound(String),

    #[error("coupon {code} cannot be redeemed: {reason}")]
    CouponRejected { code: String, reason: String },

    #[error("coupon {0} has already been redeemed by this account")]
    CouponAlreadyRedeemed(String),

    #[error("coupon {0} already exists")]
    CouponExists(String),

    #[error("reconciliation failed for account {account_id}: {source}")]
    SchedulerTickFailure {
        account_id: Uuid,
        #[source]
        source: AppError,
    },

    #[error("validation error: {0}")]
    Validation(#[from] validator::ValidationErrors),

    #[error(transparent)]
    Store(#[from] AppError),
}

impl CreditError {
    /// Short machine-readable label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            CreditError::AccountNotFound(_) => "account_not_found",
            CreditError::AccountExists(_) => "account_exists",
            CreditError::InvalidAmount(_) => "invalid_amount",
            CreditError::InvalidRequest(_) => "invalid_request",
            CreditError::UnknownProduct(_) => "unknown_product",
            CreditError::InvoiceNotFound(_) => "invoice_not_found",
            CreditError::InvoiceStateConflict { .. } => "invoice_state_conflict",
            CreditError::CouponNotFound(_) => "coupon_not_found",
            CreditError::CouponRejected { .. } => "coupon_rejected",
            CreditError::CouponAlreadyRedeemed(_) => "coupon_already_redeemed",
            CreditError::CouponExists(_) => "coupon_exists",
            CreditError::SchedulerTickFailure { .. } => "scheduler_tick_failure",
            CreditError::Validation(_) => "validation_error",
            CreditError::Store(_) => "store_error",
        }
    }
}

impl CreditError {
    /// True when the same call may succeed on a later tick.
    pub fn is_retryable(&self) -> bool {
        match self {
            CreditError::Store(inner) | CreditError::SchedulerTickFailure { source: inner, .. } => {
                inner.is_transient()
            }
            _ => false,
        }
    }
}

impl From<CreditError> for AppError {
    fn from(err: CreditError) -> Self {
        match err {
            CreditError::AccountNotFound(_)
            | CreditError::InvoiceNotFound(_)
            | CreditError::CouponNotFound(_) => AppError::NotFound(anyhow::anyhow!(err.to_string())),
            CreditError::AccountExists(_)
            | CreditError::CouponExists(_)
            | CreditError::CouponAlreadyRedeemed(_)
            | CreditError::InvoiceStateConflict { .. } => {
                AppError::Conflict(anyhow::anyhow!(err.to_string()))
            }
            CreditError::InvalidAmount(_)
            | CreditError::InvalidRequest(_)
            | CreditError::UnknownProduct(_) => {
                AppError::BadRequest(anyhow::anyhow!(err.to_string()))
            }
            CreditError::CouponRejected { .. } => {
                AppError::Unprocessable(anyhow::anyhow!(err.to_string()))
            }
            CreditError::Validation(errors) => AppError::ValidationError(errors),
            CreditError::SchedulerTickFailure { source, .. } => source,
            CreditError::Store(inner) => inner,
        }
    }
}
