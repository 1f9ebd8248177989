//! Job script generation
//!
//! Each submission materialises a POSIX shell script under
//! `log/job/<point>/<name>/<NN>/job`. The script is self-contained: it
//! writes the job status file as it starts, traps signals, exports the
//! workflow identity and user environment, runs the user's script sections
//! in order, and records the exit verdict.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use eyre::{Context, Result};

use crate::config::RuntimeConfig;
use crate::rundir::RunDir;
use crate::task::TaskId;

use super::JobSpec;

/// Everything needed to render one job script
#[derive(Debug)]
pub struct JobContext<'a> {
    pub workflow_id: &'a str,
    pub id: &'a TaskId,
    pub submit_num: u32,
    pub try_num: u32,
    /// Effective settings: merged definition plus broadcast overrides
    pub runtime: &'a RuntimeConfig,
    /// Environment contributed by satisfied xtriggers
    pub xtrigger_env: &'a BTreeMap<String, String>,
    pub runner_name: &'a str,
    /// Runner-specific `#DIRECTIVE` header lines
    pub directives_header: &'a str,
}

/// Write the job directory and script; returns the adapter-facing spec
pub fn write_job_script(rundir: &RunDir, ctx: &JobContext<'_>) -> Result<JobSpec> {
    let point = ctx.id.point.as_str();
    let name = ctx.id.name.as_str();
    let job_dir = rundir.job_dir(point, name, ctx.submit_num);
    fs::create_dir_all(&job_dir).with_context(|| format!("Failed to create job directory {}", job_dir.display()))?;

    let script_path = rundir.job_script(point, name, ctx.submit_num);
    let status_path = rundir.job_status(point, name, ctx.submit_num);

    let body = render(ctx, &status_path, rundir);
    fs::write(&script_path, body).with_context(|| format!("Failed to write job script {}", script_path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&script_path, fs::Permissions::from_mode(0o755))
            .context("Failed to mark job script executable")?;
    }

    Ok(JobSpec {
        id: ctx.id.clone(),
        submit_num: ctx.submit_num,
        host: ctx.runtime.host.clone().unwrap_or_else(|| "localhost".to_string()),
        script_path,
        job_dir: job_dir.clone(),
        status_path,
        out_path: rundir.job_out(point, name, ctx.submit_num),
        err_path: rundir.job_err(point, name, ctx.submit_num),
        job_id: None,
    })
}

fn render(ctx: &JobContext<'_>, status_path: &Path, rundir: &RunDir) -> String {
    let rt = ctx.runtime;
    let mut s = String::new();
    s.push_str("#!/bin/sh\n");
    if !ctx.directives_header.is_empty() {
        s.push_str(ctx.directives_header);
        if !ctx.directives_header.ends_with('\n') {
            s.push('\n');
        }
    }
    s.push_str("set -u\n\n");

    s.push_str(&format!("CYLC_JOB_STATUS_FILE={}\n", quote(&status_path.display().to_string())));
    s.push_str("cylc_status() { echo \"$1=$2\" >>\"$CYLC_JOB_STATUS_FILE\"; }\n");
    s.push_str("cylc_iso_now() { date -u +%Y-%m-%dT%H:%M:%SZ; }\n");
    s.push_str(&format!("cylc_status CYLC_JOB_RUNNER_NAME {}\n", quote(ctx.runner_name)));
    s.push_str("cylc_status CYLC_JOB_ID \"${CYLC_JOB_ID:-$$}\"\n");
    s.push_str("cylc_status CYLC_JOB_PID \"$$\"\n");
    s.push_str("cylc_status CYLC_JOB_INIT_TIME \"$(cylc_iso_now)\"\n\n");

    s.push_str("cylc_job_exit() {\n");
    s.push_str("    cylc_status CYLC_JOB_EXIT \"$1\"\n");
    s.push_str("    cylc_status CYLC_JOB_EXIT_TIME \"$(cylc_iso_now)\"\n");
    s.push_str("}\n");
    for (signal, code) in [("HUP", 129), ("INT", 130), ("TERM", 143), ("XCPU", 152)] {
        s.push_str(&format!(
            "trap 'cylc_job_exit {signal}; exit {code}' {signal}\n",
            signal = signal,
            code = code
        ));
    }
    s.push('\n');

    // Workflow identity
    for (key, value) in [
        ("CYLC_WORKFLOW_ID", ctx.workflow_id.to_string()),
        ("CYLC_TASK_NAME", ctx.id.name.clone()),
        ("CYLC_TASK_CYCLE_POINT", ctx.id.point.clone()),
        ("CYLC_TASK_ID", ctx.id.to_string()),
        ("CYLC_TASK_SUBMIT_NUMBER", ctx.submit_num.to_string()),
        ("CYLC_TASK_TRY_NUMBER", ctx.try_num.to_string()),
        ("CYLC_WORKFLOW_RUN_DIR", rundir.path().display().to_string()),
        ("CYLC_WORKFLOW_SHARE_DIR", rundir.share_dir().display().to_string()),
        ("CYLC_WORKFLOW_WORK_DIR", rundir.work_dir().display().to_string()),
    ] {
        s.push_str(&format!("export {}={}\n", key, quote(&value)));
    }
    // Xtrigger results, then user environment (user wins)
    for (key, value) in ctx.xtrigger_env {
        s.push_str(&format!("export {}={}\n", key, quote(value)));
    }
    for (key, value) in &rt.environment {
        s.push_str(&format!("export {}={}\n", key, quote(value)));
    }
    s.push('\n');

    // User script sections run in a subshell so one failure aborts the rest
    s.push_str("(\n    set -e\n");
    for section in [
        &rt.init_script,
        &rt.env_script,
        &rt.pre_script,
        &rt.script,
        &rt.post_script,
    ] {
        if let Some(text) = section {
            if !text.trim().is_empty() {
                for line in text.lines() {
                    s.push_str("    ");
                    s.push_str(line);
                    s.push('\n');
                }
            }
        }
    }
    s.push_str(")\n");
    s.push_str("cylc_ret=$?\n");
    s.push_str("if [ \"$cylc_ret\" -eq 0 ]; then\n");
    s.push_str("    cylc_job_exit SUCCEEDED\n");
    s.push_str("else\n");
    s.push_str("    cylc_job_exit ERR\n");
    if let Some(err_script) = &rt.err_script {
        if !err_script.trim().is_empty() {
            for line in err_script.lines() {
                s.push_str("    ");
                s.push_str(line);
                s.push('\n');
            }
        }
    }
    s.push_str("fi\n");
    s.push_str("exit \"$cylc_ret\"\n");
    s
}

/// Single-quote for POSIX sh
fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cycling::CyclePoint;
    use tempfile::TempDir;

    fn render_script(runtime: &RuntimeConfig) -> (TempDir, String, JobSpec) {
        let temp = TempDir::new().unwrap();
        let rundir = RunDir::at(temp.path().join("wf"));
        rundir.ensure_layout().unwrap();
        let id = TaskId::new("t", &CyclePoint::Integer(1));
        let xtrigger_env = BTreeMap::new();
        let ctx = JobContext {
            workflow_id: "wf",
            id: &id,
            submit_num: 1,
            try_num: 1,
            runtime,
            xtrigger_env: &xtrigger_env,
            runner_name: "background",
            directives_header: "",
        };
        let spec = write_job_script(&rundir, &ctx).unwrap();
        let body = fs::read_to_string(&spec.script_path).unwrap();
        (temp, body, spec)
    }

    #[test]
    fn test_script_structure() {
        let runtime = RuntimeConfig {
            script: Some("echo hello".to_string()),
            ..Default::default()
        };
        let (_temp, body, spec) = render_script(&runtime);
        assert!(body.starts_with("#!/bin/sh\n"));
        assert!(body.contains("CYLC_JOB_RUNNER_NAME"));
        assert!(body.contains("cylc_status CYLC_JOB_INIT_TIME"));
        assert!(body.contains("echo hello"));
        assert!(body.contains("cylc_job_exit SUCCEEDED"));
        assert!(spec.script_path.ends_with("log/job/1/t/01/job"));
    }

    #[test]
    fn test_environment_exported_and_quoted() {
        let runtime = RuntimeConfig {
            script: Some("true".to_string()),
            environment: [("GREETING".to_string(), "it's here".to_string())].into(),
            ..Default::default()
        };
        let (_temp, body, _) = render_script(&runtime);
        assert!(body.contains(r"export GREETING='it'\''s here'"));
        assert!(body.contains("export CYLC_TASK_NAME='t'"));
        assert!(body.contains("export CYLC_TASK_CYCLE_POINT='1'"));
    }

    #[test]
    fn test_script_sections_in_order() {
        let runtime = RuntimeConfig {
            init_script: Some("echo init".to_string()),
            pre_script: Some("echo pre".to_string()),
            script: Some("echo main".to_string()),
            post_script: Some("echo post".to_string()),
            ..Default::default()
        };
        let (_temp, body, _) = render_script(&runtime);
        let init = body.find("echo init").unwrap();
        let pre = body.find("echo pre").unwrap();
        let main = body.find("echo main").unwrap();
        let post = body.find("echo post").unwrap();
        assert!(init < pre && pre < main && main < post);
    }

    #[test]
    fn test_err_script_on_failure_branch() {
        let runtime = RuntimeConfig {
            script: Some("false".to_string()),
            err_script: Some("echo cleanup".to_string()),
            ..Default::default()
        };
        let (_temp, body, _) = render_script(&runtime);
        let err_branch = body.find("cylc_job_exit ERR").unwrap();
        let cleanup = body.find("echo cleanup").unwrap();
        assert!(cleanup > err_branch);
    }

    #[test]
    fn test_directives_header_included() {
        let temp = TempDir::new().unwrap();
        let rundir = RunDir::at(temp.path().join("wf"));
        rundir.ensure_layout().unwrap();
        let id = TaskId::new("t", &CyclePoint::Integer(1));
        let runtime = RuntimeConfig::default();
        let xtrigger_env = BTreeMap::new();
        let ctx = JobContext {
            workflow_id: "wf",
            id: &id,
            submit_num: 2,
            try_num: 2,
            runtime: &runtime,
            xtrigger_env: &xtrigger_env,
            runner_name: "slurm",
            directives_header: "#SBATCH --time=10\n#SBATCH --mem=1G",
        };
        let spec = write_job_script(&rundir, &ctx).unwrap();
        let body = fs::read_to_string(&spec.script_path).unwrap();
        assert!(body.contains("#SBATCH --time=10"));
        assert!(body.contains("#SBATCH --mem=1G"));
    }
}
