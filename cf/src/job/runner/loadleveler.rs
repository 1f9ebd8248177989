//! LoadLeveler adapter (`llsubmit` / `llq` / `llcancel`)

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::job::{JobSpec, RunnerStatus, SubmitOutcome};

use super::{classify_submit_failure, exec, sh_quote, JobRunner};

pub struct LoadlevelerRunner;

#[async_trait]
impl JobRunner for LoadlevelerRunner {
    fn name(&self) -> &'static str {
        "loadleveler"
    }

    fn parse_directives(&self, directives: &BTreeMap<String, String>) -> String {
        // LoadLeveler keyword form: `# @ key = value`, closed by `# @ queue`
        let mut out = String::new();
        for (key, value) in directives {
            if value.is_empty() {
                out.push_str(&format!("# @ {}\n", key));
            } else {
                out.push_str(&format!("# @ {} = {}\n", key, value));
            }
        }
        if !out.is_empty() {
            out.push_str("# @ queue\n");
        }
        out
    }

    async fn submit(&self, spec: &JobSpec) -> SubmitOutcome {
        let command = format!("llsubmit {}", sh_quote(&spec.script_path.display().to_string()));
        let result = exec(&spec.host, &command).await;
        match &result {
            Ok(output) if output.status.success() => {
                // llsubmit: The job "host.123" has been submitted.
                let stdout = String::from_utf8_lossy(&output.stdout);
                match stdout.split_once('"').and_then(|(_, rest)| rest.split_once('"')) {
                    Some((id, _)) if !id.is_empty() => SubmitOutcome::Submitted {
                        job_id: id.to_string(),
                    },
                    _ => SubmitOutcome::Failed {
                        reason: format!("unparseable llsubmit output: {}", stdout.trim()),
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
        match exec(&spec.host, &format!("llq {}", sh_quote(job_id))).await {
            Ok(output) if output.status.success() => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                if stdout.contains("There is currently no job status to report") {
                    RunnerStatus::Unknown
                } else {
                    RunnerStatus::Running
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
        let output = exec(&spec.host, &format!("llcancel {}", sh_quote(job_id)))
            .await
            .map_err(|e| eyre::eyre!("llcancel failed for {}: {}", spec.id, e))?;
        if !output.status.success() {
            return Err(eyre::eyre!("llcancel exited {} for {}", output.status, spec.id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyword_directives_with_queue_terminator() {
        let runner = LoadlevelerRunner;
        let mut directives = BTreeMap::new();
        directives.insert("class".to_string(), "serial".to_string());
        let header = runner.parse_directives(&directives);
        assert_eq!(header, "# @ class = serial\n# @ queue\n");
    }
}
