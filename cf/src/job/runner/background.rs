//! Local background runner: a detached fork on the target host
//!
//! Submission double-forks the job script through `nohup` and captures the
//! shell's `$!` as the runner job id. Polling sends signal 0 to the pid;
//! the status file carries the authoritative exit verdict.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::debug;

use crate::job::{JobSpec, RunnerStatus, SubmitOutcome};

use super::{classify_submit_failure, exec, is_local, sh_quote, JobRunner};

pub struct BackgroundRunner;

#[async_trait]
impl JobRunner for BackgroundRunner {
    fn name(&self) -> &'static str {
        "background"
    }

    fn parse_directives(&self, _directives: &BTreeMap<String, String>) -> String {
        // Background jobs take no scheduler directives
        String::new()
    }

    async fn submit(&self, spec: &JobSpec) -> SubmitOutcome {
        let command = format!(
            "cd {dir} && nohup sh {script} >{out} 2>{err} </dev/null & echo $!",
            dir = sh_quote(&spec.job_dir.display().to_string()),
            script = sh_quote(&spec.script_path.display().to_string()),
            out = sh_quote(&spec.out_path.display().to_string()),
            err = sh_quote(&spec.err_path.display().to_string()),
        );
        let result = exec(&spec.host, &command).await;
        match &result {
            Ok(output) if output.status.success() => {
                let pid = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if pid.chars().all(|c| c.is_ascii_digit()) && !pid.is_empty() {
                    debug!(id = %spec.id, pid, "Background job forked");
                    SubmitOutcome::Submitted { job_id: pid }
                } else {
                    SubmitOutcome::Failed {
                        reason: format!("no pid from background fork: {:?}", pid),
                    }
                }
            }
            _ => classify_submit_failure(&spec.host, &result),
        }
    }

    async fn poll(&self, spec: &JobSpec) -> RunnerStatus {
        let Some(pid) = &spec.job_id else {
            return RunnerStatus::Unknown;
        };

        if is_local(&spec.host) {
            let alive = pid
                .parse::<i32>()
                .map(|pid| nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok())
                .unwrap_or(false);
            return if alive { RunnerStatus::Running } else { RunnerStatus::Unknown };
        }

        match exec(&spec.host, &format!("kill -0 {} 2>/dev/null", pid)).await {
            Ok(output) if output.status.success() => RunnerStatus::Running,
            _ => RunnerStatus::Unknown,
        }
    }

    async fn kill(&self, spec: &JobSpec) -> eyre::Result<()> {
        let pid = spec
            .job_id
            .as_deref()
            .ok_or_else(|| eyre::eyre!("no job id to kill for {}", spec.id))?;
        let output = exec(&spec.host, &format!("kill -TERM {}", pid))
            .await
            .map_err(|e| eyre::eyre!("kill failed for {}: {}", spec.id, e))?;
        if !output.status.success() {
            return Err(eyre::eyre!(
                "kill exited {} for {}: {}",
                output.status,
                spec.id,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(())
    }
}
