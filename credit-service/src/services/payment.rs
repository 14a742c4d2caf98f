//! Payment capture for approved invoices.

use async_trait::async_trait;
use rust_decimal::Decimal;
use service_core::error::AppError;
use tracing::info;

use crate::models::{CloudAccount, Invoice};

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Tries to collect the invoice's outstanding amount and returns what was
    /// actually captured.
    async fn capture(&self, account: &CloudAccount, invoice: &Invoice) -> Result<Decimal, AppError>;
}

/// Charges the card on file in full. Accounts without one capture nothing
/// and the invoice stays due.
#[derive(Debug, Default)]
pub struct CardOnFileGateway;

#[async_trait]
impl PaymentGateway for CardOnFileGateway {
    async fn capture(&self, account: &CloudAccount, invoice: &Invoice) -> Result<Decimal, AppError> {
        if !account.has_payment_method {
            info!(
                account_id = %account.account_id,
                invoice_id = %invoice.invoice_id,
                "No payment method on file, nothing captured"
            );
            return Ok(Decimal::ZERO);
        }
        Ok(invoice.due)
    }
}
