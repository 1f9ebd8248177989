//! Job polling
//!
//! A poll merges two sources: the job status file (authoritative for the
//! exit verdict) and the runner's own view (authoritative for "is it still
//! there"). Results flow through the same state-machine transitions as
//! status messages. Status files are read from the run directory, which is
//! shared with the job hosts.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use super::runner::JobRunner;
use super::status::{JobExit, JobStatusFile};
use super::{JobEvent, JobSpec, PollOutcome, RunnerStatus};

/// Poll one job and merge the evidence
pub async fn poll_job(runner: Arc<dyn JobRunner>, spec: &JobSpec) -> PollOutcome {
    let file = JobStatusFile::read(&spec.status_path);

    match &file.exit {
        Some(JobExit::Succeeded) => return PollOutcome::Succeeded,
        Some(JobExit::Err) => {
            return PollOutcome::Failed {
                reason: "ERR".to_string(),
            }
        }
        Some(JobExit::Signal(signal)) => {
            return PollOutcome::Failed {
                reason: signal.clone(),
            }
        }
        None => {}
    }

    let runner_status = runner.poll(spec).await;
    debug!(id = %spec.id, ?runner_status, started = file.has_started(), "Poll merged");

    if file.has_started() {
        // Started but no exit recorded yet
        match runner_status {
            RunnerStatus::Running => PollOutcome::Running,
            RunnerStatus::DoneSuccess | RunnerStatus::DoneFailure => {
                // The runner finished before the wrapper flushed its exit;
                // give the file another poll cycle
                PollOutcome::Unknown
            }
            RunnerStatus::Unknown => PollOutcome::Vanished,
        }
    } else if file.is_submission_in_progress() {
        match runner_status {
            RunnerStatus::Running => PollOutcome::Submitted,
            _ => PollOutcome::Unknown,
        }
    } else {
        // Landed with the runner but not started
        match runner_status {
            RunnerStatus::Running => PollOutcome::Submitted,
            RunnerStatus::DoneSuccess | RunnerStatus::DoneFailure | RunnerStatus::Unknown => PollOutcome::Vanished,
        }
    }
}

/// Run a poll off the main loop, reporting through `tx`
pub fn spawn_poll(runner: Arc<dyn JobRunner>, spec: JobSpec, tx: mpsc::Sender<JobEvent>) {
    tokio::spawn(async move {
        let outcome = poll_job(runner, &spec).await;
        let _ = tx
            .send(JobEvent::PollResult {
                id: spec.id.clone(),
                submit_num: spec.submit_num,
                outcome,
            })
            .await;
    });
}

/// Run a kill off the main loop, reporting through `tx`
pub fn spawn_kill(runner: Arc<dyn JobRunner>, spec: JobSpec, tx: mpsc::Sender<JobEvent>) {
    tokio::spawn(async move {
        let ok = runner.kill(&spec).await.is_ok();
        let _ = tx
            .send(JobEvent::KillResult {
                id: spec.id.clone(),
                submit_num: spec.submit_num,
                ok,
            })
            .await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cycling::CyclePoint;
    use crate::job::runner::runner_for;
    use crate::task::TaskId;
    use tempfile::TempDir;

    fn spec_with_status(temp: &TempDir, status: &str, job_id: Option<&str>) -> JobSpec {
        let dir = temp.path().to_path_buf();
        if !status.is_empty() {
            std::fs::write(dir.join("job.status"), status).unwrap();
        }
        JobSpec {
            id: TaskId::new("t", &CyclePoint::Integer(1)),
            submit_num: 1,
            host: "localhost".to_string(),
            script_path: dir.join("job"),
            job_dir: dir.clone(),
            status_path: dir.join("job.status"),
            out_path: dir.join("job.out"),
            err_path: dir.join("job.err"),
            job_id: job_id.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_exit_in_file_wins() {
        let temp = TempDir::new().unwrap();
        let runner = runner_for("background").unwrap();
        let spec = spec_with_status(
            &temp,
            "CYLC_JOB_RUNNER_NAME=background\nCYLC_JOB_ID=1\nCYLC_JOB_INIT_TIME=x\nCYLC_JOB_EXIT=SUCCEEDED\n",
            Some("1"),
        );
        assert_eq!(poll_job(runner, &spec).await, PollOutcome::Succeeded);
    }

    #[tokio::test]
    async fn test_signal_exit_reports_failure() {
        let temp = TempDir::new().unwrap();
        let runner = runner_for("background").unwrap();
        let spec = spec_with_status(
            &temp,
            "CYLC_JOB_RUNNER_NAME=background\nCYLC_JOB_ID=1\nCYLC_JOB_INIT_TIME=x\nCYLC_JOB_EXIT=TERM\n",
            Some("1"),
        );
        assert_eq!(
            poll_job(runner, &spec).await,
            PollOutcome::Failed {
                reason: "TERM".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_started_but_gone_is_vanished() {
        let temp = TempDir::new().unwrap();
        let runner = runner_for("background").unwrap();
        // Started per the file, but the pid is long dead
        let spec = spec_with_status(
            &temp,
            "CYLC_JOB_RUNNER_NAME=background\nCYLC_JOB_ID=4194304999\nCYLC_JOB_INIT_TIME=x\n",
            Some("4194304999"),
        );
        assert_eq!(poll_job(runner, &spec).await, PollOutcome::Vanished);
    }

    #[tokio::test]
    async fn test_empty_file_is_unknown() {
        let temp = TempDir::new().unwrap();
        let runner = runner_for("background").unwrap();
        let spec = spec_with_status(&temp, "", None);
        assert_eq!(poll_job(runner, &spec).await, PollOutcome::Unknown);
    }
}
