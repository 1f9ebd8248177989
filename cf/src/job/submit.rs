//! Batched job dispatch
//!
//! Submission proceeds in rounds on the main loop: the scheduler drains the
//! `preparing` set, job scripts are written, and the prepared jobs are
//! grouped by (host, runner). Each group dispatches up to the configured
//! batch size, then waits the configured delay before the next batch.
//! Results come back to the main loop as [`JobEvent`]s.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::rundir::RunDir;

use super::runner::JobRunner;
use super::{JobEvent, JobSpec};

/// A job script on disk plus the adapter that will run it
pub struct PreparedJob {
    pub spec: JobSpec,
    pub runner: Arc<dyn JobRunner>,
}

/// Group prepared jobs by (host, runner name), preserving order
pub fn group_by_target(jobs: Vec<PreparedJob>) -> Vec<Vec<PreparedJob>> {
    let mut groups: BTreeMap<(String, String), Vec<PreparedJob>> = BTreeMap::new();
    for job in jobs {
        let key = (job.spec.host.clone(), job.runner.name().to_string());
        groups.entry(key).or_default().push(job);
    }
    groups.into_values().collect()
}

/// Dispatch one group off the main loop. Jobs go out in batches of
/// `batch_size` with `batch_delay` between them; each outcome is reported
/// through `tx`.
pub fn dispatch_group(
    group: Vec<PreparedJob>,
    batch_size: usize,
    batch_delay: Duration,
    rundir: RunDir,
    tx: mpsc::Sender<JobEvent>,
) {
    tokio::spawn(async move {
        let batch_size = batch_size.max(1);
        let mut first = true;
        for batch in group.chunks(batch_size) {
            if !first {
                tokio::time::sleep(batch_delay).await;
            }
            first = false;
            for job in batch {
                let outcome = job.runner.submit(&job.spec).await;
                rundir.log_job_activity(
                    &job.spec.id.point,
                    &job.spec.id.name,
                    job.spec.submit_num,
                    &format!("submit ({}@{}): {:?}", job.runner.name(), job.spec.host, outcome),
                );
                debug!(id = %job.spec.id, ?outcome, "Submission attempt finished");
                let event = JobEvent::SubmitResult {
                    id: job.spec.id.clone(),
                    submit_num: job.spec.submit_num,
                    outcome,
                };
                if tx.send(event).await.is_err() {
                    warn!("Scheduler gone; abandoning submission batch");
                    return;
                }
            }
        }
    });
}
