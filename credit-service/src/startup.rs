//! Application startup and lifecycle management.

use crate::clock::{Clock, SystemClock};
use crate::config::{CouponConfig, CreditConfig, SchedulerConfig, StoreBackend};
use crate::error::CreditError;
use crate::services::entitlement::DeactivationEntry;
use crate::services::{
    init_metrics, get_metrics, AccountLocks, AccountService, CardOnFileGateway, CouponService,
    CreditLedger, CreditStore, DeliveryPolicy, EntitlementGate, InMemoryStore, InvoiceWorkflow,
    LogPublisher, LowCreditThresholds, NotificationDispatcher, NotificationPublisher,
    PaymentGateway, PgStore, PriceTable, SmtpPublisher, UsageAggregator,
};
use crate::workers::{ReconciliationScheduler, Reconciler};
use axum::{
    extract::State, http::StatusCode, middleware, response::IntoResponse, routing::get, Json,
    Router,
};
use serde_json::json;
use service_core::error::AppError;
use service_core::middleware::metrics::metrics_middleware;
use service_core::middleware::tracing::request_id_middleware;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

/// Collaborators the engine is wired from.
pub struct Dependencies {
    pub store: Arc<dyn CreditStore>,
    pub clock: Arc<dyn Clock>,
    pub publisher: Arc<dyn NotificationPublisher>,
    pub gateway: Arc<dyn PaymentGateway>,
    pub prices: PriceTable,
    pub thresholds: LowCreditThresholds,
    pub delivery: DeliveryPolicy,
    pub coupons: CouponConfig,
    pub max_parallel_accounts: usize,
    pub cleanup_threshold_days: i64,
}

/// Shared application state: every engine component over one store.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn CreditStore>,
    pub clock: Arc<dyn Clock>,
    pub prices: Arc<PriceTable>,
    pub ledger: Arc<CreditLedger>,
    pub usage: Arc<UsageAggregator>,
    pub gate: Arc<EntitlementGate>,
    pub invoices: Arc<InvoiceWorkflow>,
    pub dispatcher: Arc<NotificationDispatcher>,
    pub reconciler: Arc<Reconciler>,
    pub accounts: Arc<AccountService>,
    pub coupons: Arc<CouponService>,
}

impl AppState {
    pub fn assemble(deps: Dependencies) -> Self {
        let locks = Arc::new(AccountLocks::new());
        let prices = Arc::new(deps.prices);

        let ledger = Arc::new(CreditLedger::new(
            deps.store.clone(),
            locks.clone(),
            deps.clock.clone(),
        ));
        let usage = Arc::new(UsageAggregator::new(
            deps.store.clone(),
            prices.clone(),
            deps.clock.clone(),
        ));
        let gate = Arc::new(
            EntitlementGate::new(deps.thresholds)
                .with_cleanup_threshold_days(deps.cleanup_threshold_days),
        );
        let invoices = Arc::new(InvoiceWorkflow::new(
            deps.store.clone(),
            ledger.clone(),
            locks.clone(),
            deps.clock.clone(),
            deps.gateway,
        ));
        let dispatcher = Arc::new(NotificationDispatcher::new(
            deps.store.clone(),
            deps.publisher,
            deps.delivery,
            deps.clock.clone(),
        ));
        let reconciler = Arc::new(Reconciler::new(
            deps.store.clone(),
            ledger.clone(),
            usage.clone(),
            gate.clone(),
            dispatcher.clone(),
            locks.clone(),
            deps.clock.clone(),
            deps.max_parallel_accounts,
        ));
        let accounts = Arc::new(AccountService::new(
            deps.store.clone(),
            locks.clone(),
            deps.clock.clone(),
            reconciler.clone(),
        ));
        let coupons = Arc::new(CouponService::new(
            deps.store.clone(),
            ledger.clone(),
            locks,
            deps.clock.clone(),
            reconciler.clone(),
            deps.coupons,
        ));

        Self {
            store: deps.store,
            clock: deps.clock,
            prices,
            ledger,
            usage,
            gate,
            invoices,
            dispatcher,
            reconciler,
            accounts,
            coupons,
        }
    }

    /// Accounts whose paid services must be switched off. `threshold_days`
    /// overrides the configured cleanup threshold.
    pub async fn deactivation_list(
        &self,
        threshold_days: Option<i64>,
    ) -> Result<Vec<DeactivationEntry>, CreditError> {
        self.gate
            .deactivation_list(
                self.store.as_ref(),
                &self.prices,
                self.clock.as_ref(),
                threshold_days,
            )
            .await
    }
}

/// Health check endpoint for Docker/K8s liveness probes.
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.health_check().await {
        Ok(_) => {
            tracing::debug!("Health check passed");
            (
                StatusCode::OK,
                Json(json!({
                    "status": "ok",
                    "service": "credit-service",
                    "version": env!("CARGO_PKG_VERSION")
                })),
            )
        }
        Err(e) => {
            tracing::warn!(error = %e, "Health check failed - store unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "service": "credit-service",
                    "error": e.to_string()
                })),
            )
        }
    }
}

/// Readiness check endpoint for K8s readiness probes.
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.health_check().await {
        Ok(_) => StatusCode::OK,
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// Metrics endpoint for Prometheus scraping.
async fn metrics_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        get_metrics(),
    )
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(metrics_middleware))
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
    scheduler: SchedulerConfig,
    shutdown_token: CancellationToken,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: CreditConfig) -> Result<Self, AppError> {
        init_metrics();

        let store: Arc<dyn CreditStore> = match (&config.store.backend, &config.store.database) {
            (StoreBackend::Postgres, Some(db)) => {
                let store = PgStore::new(&db.url, db.max_connections, db.min_connections)
                    .await
                    .map_err(|e| {
                        tracing::error!(error = %e, "Failed to connect to PostgreSQL");
                        e
                    })?;
                store.run_migrations().await.map_err(|e| {
                    tracing::error!(error = %e, "Failed to run migrations");
                    e
                })?;
                Arc::new(store)
            }
            (StoreBackend::Postgres, None) => {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "Postgres backend selected without database settings"
                )));
            }
            (StoreBackend::Memory, _) => {
                tracing::warn!("Using in-memory store - ledger state is lost on restart");
                Arc::new(InMemoryStore::new())
            }
        };

        let prices = match &config.price_table_file {
            Some(path) => PriceTable::from_file(path)?,
            None => PriceTable::defaults(),
        };

        let publisher: Arc<dyn NotificationPublisher> = match &config.notifications.smtp {
            Some(smtp) => Arc::new(SmtpPublisher::new(smtp).map_err(|e| {
                AppError::ConfigError(anyhow::anyhow!("Failed to create SMTP publisher: {}", e))
            })?),
            None => {
                tracing::info!("SMTP not configured - credit notifications will be logged only");
                Arc::new(LogPublisher)
            }
        };

        let state = AppState::assemble(Dependencies {
            store,
            clock: Arc::new(SystemClock),
            publisher,
            gateway: Arc::new(CardOnFileGateway),
            prices,
            thresholds: config.thresholds,
            delivery: DeliveryPolicy::from_config(&config.notifications),
            coupons: config.coupons.clone(),
            max_parallel_accounts: config.scheduler.max_parallel_accounts,
            cleanup_threshold_days: config.cleanup_threshold_days,
        });

        let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!(http_port = port, "Credit service listener bound");

        Ok(Self {
            port,
            listener,
            state,
            scheduler: config.scheduler,
            shutdown_token: CancellationToken::new(),
        })
    }

    /// Get the HTTP port the server is listening on.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Token that stops the reconciliation scheduler.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Run the HTTP server and the reconciliation scheduler until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let (scheduler_handle, scheduler_token) =
            ReconciliationScheduler::new(self.scheduler, self.state.reconciler.clone()).spawn();

        tracing::info!(
            service = "credit-service",
            version = env!("CARGO_PKG_VERSION"),
            http_port = self.port,
            "Service ready to accept connections"
        );

        let shutdown = self.shutdown_token.clone();
        let result = axum::serve(self.listener, router(self.state))
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;

        scheduler_token.cancel();
        if let Err(e) = scheduler_handle.await {
            tracing::error!(error = %e, "Scheduler task ended abnormally");
        }

        result.map_err(|e| {
            tracing::error!(error = %e, "HTTP server error");
            std::io::Error::other(format!("HTTP server error: {}", e))
        })
    }
}
