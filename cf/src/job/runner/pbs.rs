//! PBS adapter (`qsub` / `qstat` / `qdel`)

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::job::{JobSpec, RunnerStatus, SubmitOutcome};

use super::{classify_submit_failure, directive_header, exec, sh_quote, JobRunner};

pub struct PbsRunner;

#[async_trait]
impl JobRunner for PbsRunner {
    fn name(&self) -> &'static str {
        "pbs"
    }

    fn parse_directives(&self, directives: &BTreeMap<String, String>) -> String {
        directive_header("#PBS ", directives)
    }

    async fn submit(&self, spec: &JobSpec) -> SubmitOutcome {
        let command = format!("qsub {}", sh_quote(&spec.script_path.display().to_string()));
        let result = exec(&spec.host, &command).await;
        match &result {
            Ok(output) if output.status.success() => {
                // qsub prints the job id alone, e.g. "123456.pbsserver"
                let job_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if job_id.is_empty() {
                    SubmitOutcome::Failed {
                        reason: "empty qsub output".to_string(),
                    }
                } else {
                    SubmitOutcome::Submitted { job_id }
                }
            }
            _ => classify_submit_failure(&spec.host, &result),
        }
    }

    async fn poll(&self, spec: &JobSpec) -> RunnerStatus {
        let Some(job_id) = &spec.job_id else {
            return RunnerStatus::Unknown;
        };
        match exec(&spec.host, &format!("qstat {}", sh_quote(job_id))).await {
            Ok(output) if output.status.success() => RunnerStatus::Running,
            _ => RunnerStatus::Unknown,
        }
    }

    async fn kill(&self, spec: &JobSpec) -> eyre::Result<()> {
        let job_id = spec
            .job_id
            .as_deref()
            .ok_or_else(|| eyre::eyre!("no job id to kill for {}", spec.id))?;
        let output = exec(&spec.host, &format!("qdel {}", sh_quote(job_id)))
            .await
            .map_err(|e| eyre::eyre!("qdel failed for {}: {}", spec.id, e))?;
        if !output.status.success() {
            return Err(eyre::eyre!("qdel exited {} for {}", output.status, spec.id));
        }
        Ok(())
    }
}
