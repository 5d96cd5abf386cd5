//! Periodic index maintenance.
//!
//! Drains the reconciliation outbox on a short interval, optionally rebuilds
//! every index on a long one, and sweeps expired keys out of the embedded
//! store. Runs until the cancellation token fires.
//!
//! The service must be the one the hosting process writes through; a
//! worker over a store of its own has nothing to maintain.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use widgetry_db::repositories::{RebuildReport, ReconcileReport};
use widgetry_db::{MemoryStore, WidgetService};

use crate::config::WorkerConfig;

/// Drains per tick at most; leftovers wait for the next tick.
const MAX_DRAINS_PER_TICK: usize = 10;

pub struct Maintenance {
    service: WidgetService,
    memory: Option<Arc<MemoryStore>>,
    config: WorkerConfig,
}

impl Maintenance {
    /// `memory` is the embedded store to sweep, if the service runs on one.
    pub fn new(
        service: WidgetService,
        memory: Option<Arc<MemoryStore>>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            service,
            memory,
            config,
        }
    }

    /// Drain the outbox until it is empty, a drain fails, or the per-tick
    /// cap is hit. Returns the summed report.
    pub async fn reconcile_tick(&self) -> ReconcileReport {
        let mut total = ReconcileReport::default();
        for _ in 0..MAX_DRAINS_PER_TICK {
            match self.service.reconcile_indexes(self.config.reconcile_batch).await {
                Ok(report) => {
                    let popped = report.reconciled + report.failed + report.malformed;
                    total.reconciled += report.reconciled;
                    total.failed += report.failed;
                    total.malformed += report.malformed;
                    if popped < self.config.reconcile_batch || report.failed > 0 {
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Index reconciliation: drain failed");
                    break;
                }
            }
        }

        if total == ReconcileReport::default() {
            tracing::debug!("Index reconciliation: outbox empty");
        } else {
            tracing::info!(
                reconciled = total.reconciled,
                failed = total.failed,
                malformed = total.malformed,
                "Index reconciliation: outbox drained"
            );
        }
        total
    }

    pub async fn rebuild_tick(&self) -> Option<RebuildReport> {
        match self.service.rebuild_indexes().await {
            Ok(report) => Some(report),
            Err(e) => {
                tracing::error!(error = %e, "Index rebuild failed");
                None
            }
        }
    }

    /// Sweep expired keys. Returns how many were removed.
    pub fn purge_tick(&self) -> usize {
        let Some(memory) = &self.memory else {
            return 0;
        };
        let removed = memory.purge_expired();
        if removed > 0 {
            tracing::info!(removed, "Expired keys purged");
        } else {
            tracing::debug!("No expired keys to purge");
        }
        removed
    }

    /// Start the loop on the current runtime. Cancel `cancel` and await the
    /// handle to stop it.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    /// Run the maintenance loop until `cancel` is triggered.
    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(
            reconcile_interval_secs = self.config.reconcile_interval.as_secs(),
            reconcile_batch = self.config.reconcile_batch,
            rebuild_interval_secs = self.config.rebuild_interval.map(|d| d.as_secs()),
            purge_interval_secs = self.config.purge_interval.as_secs(),
            "Widget maintenance started"
        );

        let mut reconcile = interval(self.config.reconcile_interval);
        let mut purge = interval(self.config.purge_interval);
        let mut rebuild = self.config.rebuild_interval.map(interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Widget maintenance stopping");
                    break;
                }
                _ = reconcile.tick() => {
                    self.reconcile_tick().await;
                }
                _ = purge.tick() => {
                    self.purge_tick();
                }
                _ = optional_tick(&mut rebuild) => {
                    self.rebuild_tick().await;
                }
            }
        }
    }
}

fn interval(period: Duration) -> Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Tick `interval` if configured; otherwise never complete.
async fn optional_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
