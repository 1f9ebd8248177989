//! `at` adapter (`at now` / `atq` / `atrm`)

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::job::{JobSpec, RunnerStatus, SubmitOutcome};

use super::{classify_submit_failure, exec, sh_quote, JobRunner};

pub struct AtRunner;

#[async_trait]
impl JobRunner for AtRunner {
    fn name(&self) -> &'static str {
        "at"
    }

    fn parse_directives(&self, _directives: &BTreeMap<String, String>) -> String {
        // `at` takes no scheduler directives
        String::new()
    }

    async fn submit(&self, spec: &JobSpec) -> SubmitOutcome {
        let command = format!(
            "at now -f {} 2>&1",
            sh_quote(&spec.script_path.display().to_string())
        );
        let result = exec(&spec.host, &command).await;
        match &result {
            Ok(output) if output.status.success() => {
                // "job 5 at Sat Aug  1 12:00:00 2026"
                let text = String::from_utf8_lossy(&output.stdout);
                let id = text
                    .lines()
                    .filter_map(|l| l.strip_prefix("job "))
                    .filter_map(|rest| rest.split_whitespace().next())
                    .next_back();
                match id {
                    Some(id) => SubmitOutcome::Submitted { job_id: id.to_string() },
                    None => SubmitOutcome::Failed {
                        reason: format!("unparseable at output: {}", text.trim()),
                    },
                }
            }
            _ => classify_submit_failure(&spec.host, &result),
        }
    }

    async fn poll(&self, spec: &JobSpec) -> RunnerStatus {
        let Some(job_id) = &spec.job_id else {
            return RunnerStatus::Unknown;
        };
        match exec(&spec.host, "atq").await {
            Ok(output) if output.status.success() => {
                let listed = String::from_utf8_lossy(&output.stdout)
                    .lines()
                    .any(|l| l.split_whitespace().next() == Some(job_id.as_str()));
                if listed {
                    RunnerStatus::Running
                } else {
                    RunnerStatus::Unknown
                }
            }
            _ => RunnerStatus::Unknown,
        }
    }

    async fn kill(&self, spec: &JobSpec) -> eyre::Result<()> {
        let job_id = spec
            .job_id
            .as_deref()
            .ok_or_else(|| eyre::eyre!("no job id to kill for {}", spec.id))?;
        let output = exec(&spec.host, &format!("atrm {}", sh_quote(job_id)))
            .await
            .map_err(|e| eyre::eyre!("atrm failed for {}: {}", spec.id, e))?;
        if !output.status.success() {
            return Err(eyre::eyre!("atrm exited {} for {}", output.status, spec.id));
        }
        Ok(())
    }
}
