//! Job runner adapters
//!
//! A runner is polymorphic over the capability set: submit a prepared job
//! script, poll runner-side job state, kill, and translate directives into
//! a script header. Concrete runners: `background` (detached local or ssh
//! fork), `at`, `pbs`, `slurm`, `lsf`, `loadleveler`. Remote hosts are
//! reached by wrapping the runner command in `ssh`.

mod at;
mod background;
mod loadleveler;
mod lsf;
mod pbs;
mod slurm;

pub use at::AtRunner;
pub use background::BackgroundRunner;
pub use loadleveler::LoadlevelerRunner;
pub use lsf::LsfRunner;
pub use pbs::PbsRunner;
pub use slurm::SlurmRunner;

use std::collections::BTreeMap;
use std::process::Output;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{JobSpec, RunnerStatus, SubmitOutcome};

/// Timeout on any single runner invocation
const EXEC_TIMEOUT: Duration = Duration::from_secs(60);

/// The per-runner adapter contract
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Runner name as used in `job runner` settings
    fn name(&self) -> &'static str;

    /// Translate directives into the script header for this runner
    fn parse_directives(&self, directives: &BTreeMap<String, String>) -> String;

    /// Enqueue one prepared job; returns the runner job id on success
    async fn submit(&self, spec: &JobSpec) -> SubmitOutcome;

    /// Ask the runner what it knows about the job
    async fn poll(&self, spec: &JobSpec) -> RunnerStatus;

    /// Kill the job
    async fn kill(&self, spec: &JobSpec) -> eyre::Result<()>;
}

/// Look up an adapter by runner name
pub fn runner_for(name: &str) -> Option<Arc<dyn JobRunner>> {
    match name {
        "background" => Some(Arc::new(BackgroundRunner)),
        "at" => Some(Arc::new(AtRunner)),
        "pbs" => Some(Arc::new(PbsRunner)),
        "slurm" => Some(Arc::new(SlurmRunner)),
        "lsf" => Some(Arc::new(LsfRunner)),
        "loadleveler" => Some(Arc::new(LoadlevelerRunner)),
        _ => None,
    }
}

/// Render `prefix key value` (or `prefix key` for valueless) header lines
pub(crate) fn directive_header(prefix: &str, directives: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (key, value) in directives {
        if value.is_empty() {
            out.push_str(&format!("{}{}\n", prefix, key));
        } else {
            out.push_str(&format!("{}{} {}\n", prefix, key, value));
        }
    }
    out
}

/// Run a shell command on the target host (ssh-wrapped when remote)
pub(crate) async fn exec(host: &str, command: &str) -> std::io::Result<Output> {
    let mut cmd = if is_local(host) {
        let mut c = tokio::process::Command::new("sh");
        c.arg("-c").arg(command);
        c
    } else {
        let mut c = tokio::process::Command::new("ssh");
        c.arg("-oBatchMode=yes").arg(host).arg(command);
        c
    };
    debug!(host, command, "Runner exec");
    match tokio::time::timeout(EXEC_TIMEOUT, cmd.output()).await {
        Ok(result) => result,
        Err(_) => Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "runner command timed out")),
    }
}

pub(crate) fn is_local(host: &str) -> bool {
    matches!(host, "localhost" | "127.0.0.1" | "")
}

/// Classify a failed submission command: unreachable hosts and timeouts are
/// transient; a clean non-zero exit is a rejection.
pub(crate) fn classify_submit_failure(host: &str, result: &std::io::Result<Output>) -> SubmitOutcome {
    match result {
        Err(e) => SubmitOutcome::Transient {
            reason: format!("could not invoke runner on {}: {}", host, e),
        },
        Ok(output) => {
            // ssh itself exits 255 when the host is unreachable
            if !is_local(host) && output.status.code() == Some(255) {
                return SubmitOutcome::Transient {
                    reason: format!("ssh to {} failed: {}", host, String::from_utf8_lossy(&output.stderr).trim()),
                };
            }
            SubmitOutcome::Failed {
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }
        }
    }
}

/// Shell-quote a path or argument
pub(crate) fn sh_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runner_registry() {
        for name in ["background", "at", "pbs", "slurm", "lsf", "loadleveler"] {
            let runner = runner_for(name).unwrap();
            assert_eq!(runner.name(), name);
        }
        assert!(runner_for("condor").is_none());
    }

    #[test]
    fn test_directive_header() {
        let mut directives = BTreeMap::new();
        directives.insert("-q".to_string(), "main".to_string());
        directives.insert("-V".to_string(), String::new());
        let header = directive_header("#PBS ", &directives);
        assert_eq!(header, "#PBS -V\n#PBS -q main\n");
    }

    #[test]
    fn test_classify_submit_failure() {
        let err: std::io::Result<Output> = Err(std::io::Error::new(std::io::ErrorKind::NotFound, "no ssh"));
        assert!(matches!(
            classify_submit_failure("remote", &err),
            SubmitOutcome::Transient { .. }
        ));
    }

    #[tokio::test]
    async fn test_exec_local() {
        let output = exec("localhost", "echo hi").await.unwrap();
        assert!(output.status.success());
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "hi");
    }
}
