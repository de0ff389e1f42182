use crate::metadata_store::MetadataStore;
use crate::pipeline::{JobOutcome, TaggingPipeline};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Background loop that claims pending datasets one at a time and runs the
/// tagging pipeline on each.
///
/// Several schedulers may share a store; the atomic claim keeps them from
/// processing the same record.
pub struct TaggingScheduler {
    metadata: Arc<dyn MetadataStore>,
    pipeline: Arc<TaggingPipeline>,
    poll_interval: Duration,
}

impl TaggingScheduler {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        pipeline: Arc<TaggingPipeline>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            metadata,
            pipeline,
            poll_interval,
        }
    }

    /// Claim at most one pending record and process it to a terminal status
    pub async fn tick(&self) -> Option<JobOutcome> {
        let record = match self.metadata.claim_one_pending().await {
            Ok(Some(record)) => record,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "Failed to claim pending dataset");
                return None;
            }
        };

        metrics::counter!("dataset.jobs.claimed").increment(1);
        debug!(id = %record.id, dataset = %record.name, "Claimed dataset");

        Some(self.pipeline.process(&record).await)
    }

    /// Tick until `shutdown` is cancelled, sleeping `poll_interval` between ticks.
    ///
    /// Cancellation is observed before each claim and during the sleep; a job
    /// already claimed always finishes.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Tagging scheduler started"
        );

        while !shutdown.is_cancelled() {
            if let Some(outcome) = self.tick().await {
                debug!(
                    id = %outcome.record_id,
                    status = ?outcome.status,
                    labeled = outcome.labeled,
                    "Job finished"
                );
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        info!("Tagging scheduler stopped");
    }

    /// Run the loop on its own task
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}
