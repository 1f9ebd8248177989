//! Slurm adapter (`sbatch` / `squeue` / `scancel`)

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::job::{JobSpec, RunnerStatus, SubmitOutcome};

use super::{classify_submit_failure, directive_header, exec, sh_quote, JobRunner};

pub struct SlurmRunner;

#[async_trait]
impl JobRunner for SlurmRunner {
    fn name(&self) -> &'static str {
        "slurm"
    }

    fn parse_directives(&self, directives: &BTreeMap<String, String>) -> String {
        directive_header("#SBATCH ", directives)
    }

    async fn submit(&self, spec: &JobSpec) -> SubmitOutcome {
        let command = format!("sbatch {}", sh_quote(&spec.script_path.display().to_string()));
        let result = exec(&spec.host, &command).await;
        match &result {
            Ok(output) if output.status.success() => {
                // "Submitted batch job 123456"
                let stdout = String::from_utf8_lossy(&output.stdout);
                match stdout.split_whitespace().last() {
                    Some(id) if id.chars().all(|c| c.is_ascii_digit()) => SubmitOutcome::Submitted {
                        job_id: id.to_string(),
                    },
                    _ => SubmitOutcome::Failed {
                        reason: format!("unparseable sbatch output: {}", stdout.trim()),
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
        match exec(&spec.host, &format!("squeue -h -j {}", job_id)).await {
            Ok(output) if output.status.success() && !output.stdout.is_empty() => RunnerStatus::Running,
            _ => RunnerStatus::Unknown,
        }
    }

    async fn kill(&self, spec: &JobSpec) -> eyre::Result<()> {
        let job_id = spec
            .job_id
            .as_deref()
            .ok_or_else(|| eyre::eyre!("no job id to kill for {}", spec.id))?;
        let output = exec(&spec.host, &format!("scancel {}", job_id))
            .await
            .map_err(|e| eyre::eyre!("scancel failed for {}: {}", spec.id, e))?;
        if !output.status.success() {
            return Err(eyre::eyre!(
                "scancel exited {} for {}",
                output.status,
                spec.id
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directives_use_sbatch_prefix() {
        let runner = SlurmRunner;
        let mut directives = BTreeMap::new();
        directives.insert("--time".to_string(), "10:00".to_string());
        assert_eq!(runner.parse_directives(&directives), "#SBATCH --time 10:00\n");
    }
}
