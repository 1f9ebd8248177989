//! LSF adapter (`bsub` / `bjobs` / `bkill`)

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::job::{JobSpec, RunnerStatus, SubmitOutcome};

use super::{classify_submit_failure, directive_header, exec, sh_quote, JobRunner};

pub struct LsfRunner;

#[async_trait]
impl JobRunner for LsfRunner {
    fn name(&self) -> &'static str {
        "lsf"
    }

    fn parse_directives(&self, directives: &BTreeMap<String, String>) -> String {
        directive_header("#BSUB ", directives)
    }

    async fn submit(&self, spec: &JobSpec) -> SubmitOutcome {
        // bsub reads the script on stdin
        let command = format!("bsub < {}", sh_quote(&spec.script_path.display().to_string()));
        let result = exec(&spec.host, &command).await;
        match &result {
            Ok(output) if output.status.success() => {
                // "Job <123456> is submitted to default queue <normal>."
                let stdout = String::from_utf8_lossy(&output.stdout);
                match stdout.split_once('<').and_then(|(_, rest)| rest.split_once('>')) {
                    Some((id, _)) if !id.is_empty() => SubmitOutcome::Submitted {
                        job_id: id.to_string(),
                    },
                    _ => SubmitOutcome::Failed {
                        reason: format!("unparseable bsub output: {}", stdout.trim()),
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
        match exec(&spec.host, &format!("bjobs -noheader {}", sh_quote(job_id))).await {
            Ok(output) if output.status.success() => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                if stdout.contains("RUN") || stdout.contains("PEND") || stdout.contains("USUSP") {
                    RunnerStatus::Running
                } else if stdout.contains("DONE") {
                    RunnerStatus::DoneSuccess
                } else if stdout.contains("EXIT") {
                    RunnerStatus::DoneFailure
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
        let output = exec(&spec.host, &format!("bkill {}", sh_quote(job_id)))
            .await
            .map_err(|e| eyre::eyre!("bkill failed for {}: {}", spec.id, e))?;
        if !output.status.success() {
            return Err(eyre::eyre!("bkill exited {} for {}", output.status, spec.id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directives_use_bsub_prefix() {
        let runner = LsfRunner;
        let mut directives = BTreeMap::new();
        directives.insert("-W".to_string(), "10".to_string());
        assert_eq!(runner.parse_directives(&directives), "#BSUB -W 10\n");
    }
}
