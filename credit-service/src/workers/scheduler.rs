//! Recurring driver for the reconciler.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::workers::reconciler::Reconciler;

pub struct ReconciliationScheduler {
    config: SchedulerConfig,
    reconciler: Arc<Reconciler>,
    shutdown_token: CancellationToken,
}

impl ReconciliationScheduler {
    pub fn new(config: SchedulerConfig, reconciler: Arc<Reconciler>) -> Self {
        Self {
            config,
            reconciler,
            shutdown_token: CancellationToken::new(),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Runs ticks until cancelled. A failed tick is logged and retried
    /// wholesale on the next interval.
    pub async fn run(self) {
        if !self.config.enabled {
            tracing::info!("Reconciliation scheduler disabled by configuration");
            return;
        }

        tracing::info!(
            interval_secs = self.config.interval_secs,
            max_parallel_accounts = self.config.max_parallel_accounts,
            "Starting reconciliation scheduler"
        );

        let mut interval = tokio::time::interval(self.config.interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown_token.cancelled() => {
                    tracing::info!("Reconciliation scheduler shutting down");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.reconciler.run_tick().await {
                        tracing::error!(error = %e, "Reconciliation tick failed");
                    }
                }
            }
        }
    }

    /// Spawns the loop and returns its handle with a token that stops it.
    pub fn spawn(self) -> (JoinHandle<()>, CancellationToken) {
        let token = self.shutdown_token();
        (tokio::spawn(self.run()), token)
    }
}
