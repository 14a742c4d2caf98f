//! Outbox delivery of credit usage notifications.

use async_trait::async_trait;
use backoff::future::retry;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::{NotificationConfig, SmtpConfig};
use crate::error::CreditError;
use crate::models::{AccountType, CloudAccount, DeliveryStatus, NotificationEvent, NotificationKind};
use crate::services::metrics::NOTIFICATIONS_TOTAL;
use crate::services::store::CreditStore;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),

    #[error("Send error: {0}")]
    SendFailed(String),
}

impl PublishError {
    fn is_permanent(&self) -> bool {
        matches!(
            self,
            PublishError::Configuration(_) | PublishError::InvalidRecipient(_)
        )
    }
}

#[async_trait]
pub trait NotificationPublisher: Send + Sync {
    async fn publish(
        &self,
        account: &CloudAccount,
        event: &NotificationEvent,
    ) -> Result<(), PublishError>;
}

/// Writes notifications to the log instead of sending them.
#[derive(Debug, Default)]
pub struct LogPublisher;

#[async_trait]
impl NotificationPublisher for LogPublisher {
    async fn publish(
        &self,
        account: &CloudAccount,
        event: &NotificationEvent,
    ) -> Result<(), PublishError> {
        info!(
            account_id = %account.account_id,
            event_id = %event.event_id,
            kind = %event.kind,
            to = %account.owner_email,
            "Credit notification"
        );
        Ok(())
    }
}

pub struct SmtpPublisher {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpPublisher {
    pub fn new(config: &SmtpConfig) -> Result<Self, PublishError> {
        let creds = Credentials::new(config.user.clone(), config.password.clone());

        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
            .map_err(|e| PublishError::Configuration(format!("Failed to create SMTP relay: {}", e)))?
            .port(config.port)
            .credentials(creds)
            .build();

        let from = format!("{} <{}>", config.from_name, config.from_email)
            .parse()
            .map_err(|e| PublishError::Configuration(format!("Invalid from address: {}", e)))?;

        Ok(Self { transport, from })
    }

    fn body(account: &CloudAccount, event: &NotificationEvent) -> String {
        match event.kind {
            NotificationKind::EightyPercent => format!(
                "Your {} account has used 80% of its cloud credits. \
                 Add a payment method or redeem a coupon to keep paid services running.",
                account.account_type
            ),
            NotificationKind::HundredPercent => format!(
                "Your {} account has used all of its cloud credits. \
                 New paid instances cannot be launched until credit or a payment method is added.",
                account.account_type
            ),
            NotificationKind::Expired => {
                "One of your cloud credits has expired with an unused balance.".to_string()
            }
        }
    }
}

#[async_trait]
impl NotificationPublisher for SmtpPublisher {
    async fn publish(
        &self,
        account: &CloudAccount,
        event: &NotificationEvent,
    ) -> Result<(), PublishError> {
        let to: Mailbox = account
            .owner_email
            .parse()
            .map_err(|e| PublishError::InvalidRecipient(format!("{}: {}", account.owner_email, e)))?;

        let message = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(event.kind.subject())
            .header(ContentType::TEXT_PLAIN)
            .body(Self::body(account, event))
            .map_err(|e| PublishError::SendFailed(format!("Failed to build message: {}", e)))?;

        self.transport
            .send(message)
            .await
            .map_err(|e| PublishError::SendFailed(format!("Failed to send email: {}", e)))?;

        info!(
            to = %account.owner_email,
            kind = %event.kind,
            "Credit notification email sent"
        );
        Ok(())
    }
}

/// Who gets notified.
#[derive(Debug, Clone)]
pub struct DeliveryPolicy {
    pub email_enabled: bool,
    pub account_types: Vec<AccountType>,
    pub retry_initial_interval: Duration,
    pub retry_max_elapsed: Duration,
}

impl DeliveryPolicy {
    pub fn from_config(config: &NotificationConfig) -> Self {
        Self {
            email_enabled: config.email_enabled,
            account_types: config.account_types.clone(),
            retry_initial_interval: config.retry_initial_interval(),
            retry_max_elapsed: config.retry_max_elapsed(),
        }
    }

    /// Accounts with a card on file are billed, not warned.
    pub fn allows(&self, account: &CloudAccount) -> bool {
        self.email_enabled
            && self.account_types.contains(&account.account_type)
            && !account.has_payment_method
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.retry_initial_interval,
            max_elapsed_time: Some(self.retry_max_elapsed),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub suppressed: usize,
    pub failed: usize,
}

/// Publishes committed notification events. Events stay pending until a
/// publish succeeds, so a failed delivery is retried on a later tick.
pub struct NotificationDispatcher {
    store: Arc<dyn CreditStore>,
    publisher: Arc<dyn NotificationPublisher>,
    policy: DeliveryPolicy,
    clock: Arc<dyn Clock>,
}

impl NotificationDispatcher {
    pub fn new(
        store: Arc<dyn CreditStore>,
        publisher: Arc<dyn NotificationPublisher>,
        policy: DeliveryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            publisher,
            policy,
            clock,
        }
    }

    #[instrument(skip(self))]
    pub async fn publish_pending(&self, account_id: Uuid) -> Result<DispatchReport, CreditError> {
        let mut report = DispatchReport::default();
        let pending = self.store.pending_notifications(account_id).await?;
        if pending.is_empty() {
            return Ok(report);
        }
        let account = self
            .store
            .get_account(account_id)
            .await?
            .ok_or(CreditError::AccountNotFound(account_id))?;

        for mut event in pending {
            if !self.policy.allows(&account) {
                self.finish(&mut event, DeliveryStatus::Suppressed, None).await?;
                report.suppressed += 1;
                continue;
            }

            event.attempts += 1;
            match self.send(&account, &event).await {
                Ok(()) => {
                    let now = self.clock.now();
                    self.finish(&mut event, DeliveryStatus::Delivered, Some(now)).await?;
                    report.delivered += 1;
                }
                Err(e) if e.is_permanent() => {
                    warn!(
                        event_id = %event.event_id,
                        kind = %event.kind,
                        error = %e,
                        "Notification cannot be delivered, suppressing"
                    );
                    self.finish(&mut event, DeliveryStatus::Suppressed, None).await?;
                    report.failed += 1;
                }
                Err(e) => {
                    warn!(
                        event_id = %event.event_id,
                        kind = %event.kind,
                        attempts = event.attempts,
                        error = %e,
                        "Notification delivery failed, will retry"
                    );
                    NOTIFICATIONS_TOTAL
                        .with_label_values(&[event.kind.as_str(), "failed"])
                        .inc();
                    self.store.update_notification(&event).await?;
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    async fn send(&self, account: &CloudAccount, event: &NotificationEvent) -> Result<(), PublishError> {
        retry(self.policy.backoff(), || async {
            self.publisher.publish(account, event).await.map_err(|e| {
                if e.is_permanent() {
                    backoff::Error::permanent(e)
                } else {
                    backoff::Error::transient(e)
                }
            })
        })
        .await
    }

    async fn finish(
        &self,
        event: &mut NotificationEvent,
        status: DeliveryStatus,
        delivered_utc: Option<DateTime<Utc>>,
    ) -> Result<(), CreditError> {
        event.delivery = status;
        event.delivered_utc = delivered_utc;
        self.store.update_notification(event).await?;
        NOTIFICATIONS_TOTAL
            .with_label_values(&[event.kind.as_str(), status.as_str()])
            .inc();
        Ok(())
    }
}
