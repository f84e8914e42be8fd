#![cfg(feature = "runtime")]

use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::task;
use tokio::time::{self, MissedTickBehavior};
use tracing::{info, warn};

use crate::error::Result;
use crate::pipeline::{Pipeline, UpdateReport};

#[derive(Debug, Clone, Default, Serialize)]
pub struct ContinuousSummary {
    pub updates: usize,
    pub failed_updates: usize,
    pub rows_processed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_update: Option<UpdateReport>,
}

/// Runs an update on every tick of `trigger_interval` until `shutdown` resolves.
///
/// A failed update is logged and retried on the next tick; the pipeline's checkpoints only
/// advance for flows that committed. Shutdown is checked before every tick, so a request made
/// during an update stops the loop once that update returns. `trigger_interval` must be
/// non-zero.
pub async fn run_continuous<F>(
    pipeline: &mut Pipeline,
    trigger_interval: Duration,
    shutdown: F,
) -> ContinuousSummary
where
    F: Future<Output = ()>,
{
    let mut ticker = time::interval(trigger_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tokio::pin!(shutdown);

    let mut summary = ContinuousSummary::default();
    info!(
        pipeline = pipeline.name(),
        interval_ms = trigger_interval.as_millis() as u64,
        "starting continuous execution"
    );

    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => {
                info!(pipeline = pipeline.name(), updates = summary.updates, "shutdown requested");
                break;
            }
            _ = ticker.tick() => {
                match run_update(pipeline) {
                    Ok(report) => {
                        summary.updates += 1;
                        summary.rows_processed += report.processed_rows();
                        summary.last_update = Some(report);
                    }
                    Err(err) => {
                        summary.failed_updates += 1;
                        warn!(pipeline = pipeline.name(), error = %err, "update failed; retrying on next trigger");
                    }
                }
            }
        }
    }

    summary
}

/// Runs the synchronous update without stalling the other tasks of a multi-threaded runtime.
fn run_update(pipeline: &mut Pipeline) -> Result<UpdateReport> {
    match Handle::current().runtime_flavor() {
        RuntimeFlavor::MultiThread => task::block_in_place(|| pipeline.update()),
        _ => pipeline.update(),
    }
}
