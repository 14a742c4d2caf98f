//! Credit engine services.

pub mod accounts;
pub mod coupons;
pub mod entitlement;
pub mod invoices;
pub mod ledger;
pub mod locks;
pub mod metrics;
pub mod notifier;
pub mod payment;
pub mod pricing;
pub mod store;
pub mod trigger;
pub mod usage;

pub use accounts::AccountService;
pub use coupons::CouponService;
pub use entitlement::{EntitlementGate, LowCreditThresholds};
pub use invoices::InvoiceWorkflow;
pub use ledger::CreditLedger;
pub use locks::AccountLocks;
pub use metrics::{get_metrics, init_metrics};
pub use notifier::{DeliveryPolicy, LogPublisher, NotificationDispatcher, NotificationPublisher, SmtpPublisher};
pub use payment::{CardOnFileGateway, PaymentGateway};
pub use pricing::PriceTable;
pub use store::{CreditStore, InMemoryStore, PgStore};
pub use usage::UsageAggregator;
