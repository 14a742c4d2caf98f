//! Configuration module for credit-service.

use service_core::config::{self as core_config, env_or, get_env, list_env, parse_env};
use service_core::error::AppError;
use std::time::Duration;

use crate::models::AccountType;
use crate::services::entitlement::{LowCreditThresholds, DEFAULT_CLEANUP_THRESHOLD_DAYS};

#[derive(Debug, Clone)]
pub struct CreditConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub store: StoreConfig,
    pub scheduler: SchedulerConfig,
    pub thresholds: LowCreditThresholds,
    pub notifications: NotificationConfig,
    pub coupons: CouponConfig,
    /// Days an account stays depleted before it is due for cleanup.
    pub cleanup_threshold_days: i64,
    pub price_table_file: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Postgres,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub database: Option<DatabaseConfig>,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub max_parallel_accounts: usize,
}

impl SchedulerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
            max_parallel_accounts: 8,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NotificationConfig {
    pub email_enabled: bool,
    pub account_types: Vec<AccountType>,
    pub retry_initial_interval_ms: u64,
    pub retry_max_elapsed_ms: u64,
    pub smtp: Option<SmtpConfig>,
}

impl NotificationConfig {
    pub fn retry_initial_interval(&self) -> Duration {
        Duration::from_millis(self.retry_initial_interval_ms)
    }

    pub fn retry_max_elapsed(&self) -> Duration {
        Duration::from_millis(self.retry_max_elapsed_ms)
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            email_enabled: true,
            account_types: AccountType::ALL.to_vec(),
            retry_initial_interval_ms: 500,
            retry_max_elapsed_ms: 30_000,
            smtp: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub from_email: String,
    pub from_name: String,
}

#[derive(Debug, Clone)]
pub struct CouponConfig {
    pub max_uses_standard: u32,
    pub max_uses_non_standard: u32,
    pub default_validity_days: i64,
}

impl Default for CouponConfig {
    fn default() -> Self {
        Self {
            max_uses_standard: 1000,
            max_uses_non_standard: 100,
            default_validity_days: 90,
        }
    }
}

fn parse_account_types(raw: &[String]) -> Result<Vec<AccountType>, AppError> {
    raw.iter()
        .map(|s| {
            AccountType::from_string(s).ok_or_else(|| {
                AppError::ConfigError(anyhow::anyhow!("Unknown account type: {}", s))
            })
        })
        .collect()
}

fn percent(key: &str) -> Result<u8, AppError> {
    let value: u8 = parse_env(key, 80)?;
    if value > 100 {
        return Err(AppError::ConfigError(anyhow::anyhow!(
            "{} must be between 0 and 100, got {}",
            key,
            value
        )));
    }
    Ok(value)
}

impl CreditConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        let backend = match env_or("STORE_BACKEND", "postgres").to_ascii_lowercase().as_str() {
            "memory" => StoreBackend::Memory,
            "postgres" => StoreBackend::Postgres,
            other => {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "STORE_BACKEND must be memory or postgres, got {}",
                    other
                )));
            }
        };
        let database = match backend {
            StoreBackend::Memory => None,
            StoreBackend::Postgres => Some(DatabaseConfig {
                url: get_env("DATABASE_URL")?,
                max_connections: parse_env("DATABASE_MAX_CONNECTIONS", 10)?,
                min_connections: parse_env("DATABASE_MIN_CONNECTIONS", 2)?,
            }),
        };

        let email_enabled: bool = parse_env("CREDIT_USAGE_EMAIL_ENABLED", true)?;
        let smtp = match std::env::var("SMTP_HOST") {
            Ok(host) if email_enabled => Some(SmtpConfig {
                host,
                port: parse_env("SMTP_PORT", 587)?,
                user: env_or("SMTP_USER", ""),
                password: env_or("SMTP_PASSWORD", ""),
                from_email: env_or("SMTP_FROM_EMAIL", "billing@localhost"),
                from_name: env_or("SMTP_FROM_NAME", "Cloud Billing"),
            }),
            _ => None,
        };

        Ok(Self {
            common,
            service_name: env_or("SERVICE_NAME", "credit-service"),
            service_version: env_or("SERVICE_VERSION", env!("CARGO_PKG_VERSION")),
            log_level: env_or("LOG_LEVEL", "info"),
            otlp_endpoint: std::env::var("OTLP_ENDPOINT").ok(),
            store: StoreConfig { backend, database },
            scheduler: SchedulerConfig {
                enabled: parse_env("SCHEDULER_ENABLED", true)?,
                interval_secs: parse_env("SCHEDULER_INTERVAL_SECS", 60)?,
                max_parallel_accounts: parse_env("SCHEDULER_MAX_PARALLEL_ACCOUNTS", 8)?,
            },
            thresholds: LowCreditThresholds {
                standard: percent("LOW_CREDIT_THRESHOLD_STANDARD")?,
                premium: percent("LOW_CREDIT_THRESHOLD_PREMIUM")?,
                enterprise: percent("LOW_CREDIT_THRESHOLD_ENTERPRISE")?,
            },
            notifications: NotificationConfig {
                email_enabled,
                account_types: parse_account_types(&list_env(
                    "CREDIT_USAGE_EMAIL_ACCOUNT_TYPES",
                    "standard,premium,enterprise",
                ))?,
                retry_initial_interval_ms: parse_env("NOTIFICATION_RETRY_INITIAL_MS", 500)?,
                retry_max_elapsed_ms: parse_env("NOTIFICATION_RETRY_MAX_ELAPSED_MS", 30_000)?,
                smtp,
            },
            coupons: CouponConfig {
                max_uses_standard: parse_env("COUPON_MAX_USES_STANDARD", 1000)?,
                max_uses_non_standard: parse_env("COUPON_MAX_USES_NON_STANDARD", 100)?,
                default_validity_days: parse_env("COUPON_DEFAULT_VALIDITY_DAYS", 90)?,
            },
            cleanup_threshold_days: parse_env(
                "CLEANUP_THRESHOLD_DAYS",
                DEFAULT_CLEANUP_THRESHOLD_DAYS,
            )?,
            price_table_file: std::env::var("PRICE_TABLE_FILE").ok(),
        })
    }
}
