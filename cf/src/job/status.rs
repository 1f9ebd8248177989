//! Job status files
//!
//! The worker-side job script appends key=value lines as it starts, traps
//! signals, and exits. The format is fixed:
//!
//! ```text
//! CYLC_JOB_RUNNER_NAME=<runner>
//! CYLC_JOB_ID=<runner-job-id>
//! CYLC_JOB_PID=<pid>
//! CYLC_JOB_INIT_TIME=<ISO8601>
//! CYLC_JOB_EXIT=<SUCCEEDED|ERR|signal-name>
//! CYLC_JOB_EXIT_TIME=<ISO8601>
//! ```
//!
//! A file missing `CYLC_JOB_RUNNER_NAME` or `CYLC_JOB_ID` is treated as
//! submission-in-progress.

use std::path::Path;

/// How the job ended, per its status file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobExit {
    Succeeded,
    /// Non-zero exit
    Err,
    /// Killed by the named signal
    Signal(String),
}

/// Parsed contents of a `job.status` file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobStatusFile {
    pub runner_name: Option<String>,
    pub job_id: Option<String>,
    pub pid: Option<String>,
    pub init_time: Option<String>,
    pub exit: Option<JobExit>,
    pub exit_time: Option<String>,
}

impl JobStatusFile {
    /// Parse status file content; unknown keys are ignored, later
    /// occurrences win (the wrapper may rewrite on retries)
    pub fn parse(content: &str) -> Self {
        let mut out = Self::default();
        for line in content.lines() {
            let Some((key, value)) = line.split_once('=') else { continue };
            let value = value.trim();
            match key.trim() {
                "CYLC_JOB_RUNNER_NAME" => out.runner_name = Some(value.to_string()),
                "CYLC_JOB_ID" => out.job_id = Some(value.to_string()),
                "CYLC_JOB_PID" => out.pid = Some(value.to_string()),
                "CYLC_JOB_INIT_TIME" => out.init_time = Some(value.to_string()),
                "CYLC_JOB_EXIT" => {
                    out.exit = Some(match value {
                        "SUCCEEDED" => JobExit::Succeeded,
                        "ERR" => JobExit::Err,
                        signal => JobExit::Signal(signal.to_string()),
                    })
                }
                "CYLC_JOB_EXIT_TIME" => out.exit_time = Some(value.to_string()),
                _ => {}
            }
        }
        out
    }

    /// Read and parse; a missing file reads as empty (in progress)
    pub fn read(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::parse(&content),
            Err(_) => Self::default(),
        }
    }

    /// Missing runner name or job id: the submission has not landed yet
    pub fn is_submission_in_progress(&self) -> bool {
        self.runner_name.is_none() || self.job_id.is_none()
    }

    /// The job has started (init time recorded)
    pub fn has_started(&self) -> bool {
        self.init_time.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_complete_file() {
        let content = "\
CYLC_JOB_RUNNER_NAME=background
CYLC_JOB_ID=12345
CYLC_JOB_PID=12345
CYLC_JOB_INIT_TIME=2026-08-01T12:00:00Z
CYLC_JOB_EXIT=SUCCEEDED
CYLC_JOB_EXIT_TIME=2026-08-01T12:00:05Z
";
        let parsed = JobStatusFile::parse(content);
        assert_eq!(parsed.runner_name.as_deref(), Some("background"));
        assert_eq!(parsed.job_id.as_deref(), Some("12345"));
        assert_eq!(parsed.exit, Some(JobExit::Succeeded));
        assert!(!parsed.is_submission_in_progress());
        assert!(parsed.has_started());
    }

    #[test]
    fn test_parse_error_exit() {
        let parsed = JobStatusFile::parse("CYLC_JOB_EXIT=ERR\n");
        assert_eq!(parsed.exit, Some(JobExit::Err));
    }

    #[test]
    fn test_parse_signal_exit() {
        let parsed = JobStatusFile::parse("CYLC_JOB_EXIT=TERM\n");
        assert_eq!(parsed.exit, Some(JobExit::Signal("TERM".to_string())));
    }

    #[test]
    fn test_incomplete_is_submission_in_progress() {
        let parsed = JobStatusFile::parse("CYLC_JOB_RUNNER_NAME=background\n");
        assert!(parsed.is_submission_in_progress());
        let parsed = JobStatusFile::parse("");
        assert!(parsed.is_submission_in_progress());
    }

    #[test]
    fn test_missing_file_reads_empty() {
        let parsed = JobStatusFile::read(Path::new("/definitely/not/here"));
        assert!(parsed.is_submission_in_progress());
        assert!(parsed.exit.is_none());
    }

    #[test]
    fn test_garbage_lines_ignored() {
        let parsed = JobStatusFile::parse("not a key value line\nCYLC_JOB_ID=7\nWHAT=ever\n");
        assert_eq!(parsed.job_id.as_deref(), Some("7"));
    }
}
