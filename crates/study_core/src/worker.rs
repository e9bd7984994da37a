//! crates/study_core/src/worker.rs
//!
//! Background drain loop over the `materials` queue. Each tick finds plans that still
//! have claimable materials and runs the same `kick` step a client would.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::ingestion::IngestionService;
use crate::ports::MaterialStore;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub enabled: bool,
    /// Pause between ticks when the previous tick found nothing to do.
    pub interval: Duration,
    /// Plans drained per tick.
    pub plans_per_tick: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_millis(2000),
            plans_per_tick: 8,
        }
    }
}

impl WorkerConfig {
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

pub struct IngestionWorker {
    store: Arc<dyn MaterialStore>,
    ingestion: Arc<IngestionService>,
    config: WorkerConfig,
}

impl IngestionWorker {
    pub fn new(store: Arc<dyn MaterialStore>, ingestion: Arc<IngestionService>, config: WorkerConfig) -> Self {
        Self {
            store,
            ingestion,
            config,
        }
    }

    /// Runs one tick and returns how many plans were drained. Plans the drain rejects
    /// (over their file limits) keep their place in the queue, so the next page starts
    /// after them.
    pub async fn tick(&self) -> usize {
        let window = self.ingestion.config().claim_window();
        let mut seen = HashSet::new();
        let mut skipped = 0;
        let mut drained = 0;

        while drained < self.config.plans_per_tick {
            let page = match self
                .store
                .list_pending_plans(window, skipped, self.config.plans_per_tick - drained)
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    error!(error = %e, "Failed to list plans with pending materials");
                    break;
                }
            };
            let fresh: Vec<(Uuid, Uuid)> = page.into_iter().filter(|plan| seen.insert(*plan)).collect();
            if fresh.is_empty() {
                break;
            }

            for (user_id, plan_id) in fresh {
                match self.ingestion.kick(user_id, plan_id).await {
                    Ok(report) => {
                        debug!(%plan_id, processed = report.processed_count, "Worker drained plan");
                        drained += 1;
                    }
                    Err(e) => {
                        warn!(%plan_id, code = e.code(), error = %e, "Worker skipped plan");
                        skipped += 1;
                    }
                }
            }
        }
        drained
    }

    /// Loops until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        if !self.config.enabled {
            info!("Ingestion worker disabled");
            return;
        }
        info!(interval_ms = self.config.interval.as_millis() as u64, "Ingestion worker started");

        loop {
            let drained = tokio::select! {
                _ = shutdown.cancelled() => break,
                drained = self.tick() => drained,
            };
            if drained > 0 {
                continue;
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.interval) => {}
            }
        }
        info!("Ingestion worker stopped");
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}
