//! Run directory layout and the contact file
//!
//! ```text
//! <run-root>/<workflow-id>/
//!   flow.yaml                  (snapshot of the active configuration)
//!   .service/contact           (host, port, pid, auth token)
//!   .service/db                (authoritative workflow DB)
//!   log/db                     (readable copy)
//!   log/scheduler/log          (plain-text scheduler log)
//!   log/config/NN-<kind>.yaml  (config snapshots)
//!   log/job/<point>/<name>/<submit>/...
//!   share/  work/              (user task I/O)
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use eyre::{Context, Result};
use tracing::debug;

/// Environment variable overriding the run-directory root
pub const RUN_DIR_ENV: &str = "CYLC_RUN_DIR";

/// Root directory under which all workflow run dirs live
pub fn run_root() -> PathBuf {
    if let Ok(root) = std::env::var(RUN_DIR_ENV) {
        return PathBuf::from(root);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("cycleflow-run")
}

/// One workflow's run directory
#[derive(Debug, Clone)]
pub struct RunDir {
    path: PathBuf,
}

impl RunDir {
    /// The run dir for a workflow id under the default root
    pub fn for_workflow(workflow_id: &str) -> Self {
        Self {
            path: run_root().join(workflow_id),
        }
    }

    /// A run dir at an explicit path (tests)
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the standard directory tree
    pub fn ensure_layout(&self) -> Result<()> {
        for sub in [
            ".service",
            "log/scheduler",
            "log/config",
            "log/job",
            "share",
            "work",
        ] {
            fs::create_dir_all(self.path.join(sub))
                .with_context(|| format!("Failed to create run directory {}", self.path.display()))?;
        }
        debug!(path = %self.path.display(), "Run directory layout ready");
        Ok(())
    }

    pub fn flow_config(&self) -> PathBuf {
        self.path.join("flow.yaml")
    }

    pub fn contact_file(&self) -> PathBuf {
        self.path.join(".service").join("contact")
    }

    /// Authoritative workflow DB
    pub fn db(&self) -> PathBuf {
        self.path.join(".service").join("db")
    }

    /// Readable DB copy for CLI/review consumers
    pub fn public_db(&self) -> PathBuf {
        self.path.join("log").join("db")
    }

    pub fn scheduler_log(&self) -> PathBuf {
        self.path.join("log").join("scheduler").join("log")
    }

    /// Next numbered config snapshot path, e.g. `log/config/02-reload.yaml`
    pub fn next_config_snapshot(&self, kind: &str) -> Result<PathBuf> {
        let dir = self.path.join("log").join("config");
        fs::create_dir_all(&dir).context("Failed to create config snapshot directory")?;
        let mut highest = 0u32;
        for entry in fs::read_dir(&dir).context("Failed to list config snapshots")? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if let Some((num, _)) = name.split_once('-') {
                    if let Ok(n) = num.parse::<u32>() {
                        highest = highest.max(n);
                    }
                }
            }
        }
        Ok(dir.join(format!("{:02}-{}.yaml", highest + 1, kind)))
    }

    /// Job directory for one submission attempt
    pub fn job_dir(&self, point: &str, name: &str, submit_num: u32) -> PathBuf {
        self.path
            .join("log")
            .join("job")
            .join(point)
            .join(name)
            .join(format!("{:02}", submit_num))
    }

    pub fn job_script(&self, point: &str, name: &str, submit_num: u32) -> PathBuf {
        self.job_dir(point, name, submit_num).join("job")
    }

    pub fn job_out(&self, point: &str, name: &str, submit_num: u32) -> PathBuf {
        self.job_dir(point, name, submit_num).join("job.out")
    }

    pub fn job_err(&self, point: &str, name: &str, submit_num: u32) -> PathBuf {
        self.job_dir(point, name, submit_num).join("job.err")
    }

    pub fn job_status(&self, point: &str, name: &str, submit_num: u32) -> PathBuf {
        self.job_dir(point, name, submit_num).join("job.status")
    }

    pub fn job_activity_log(&self, point: &str, name: &str, submit_num: u32) -> PathBuf {
        self.job_dir(point, name, submit_num).join("job-activity.log")
    }

    /// Append a line to a job's activity log (submission/poll/kill attempts)
    pub fn log_job_activity(&self, point: &str, name: &str, submit_num: u32, message: &str) {
        use std::io::Write;
        let path = self.job_activity_log(point, name, submit_num);
        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        if let Ok(mut f) = fs::OpenOptions::new().create(true).append(true).open(&path) {
            let _ = writeln!(f, "[{}] {}", cyclestore::now_iso(), message);
        }
    }

    pub fn share_dir(&self) -> PathBuf {
        self.path.join("share")
    }

    pub fn work_dir(&self) -> PathBuf {
        self.path.join("work")
    }
}

/// Contents of `.service/contact`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactInfo {
    pub host: String,
    pub port: u16,
    pub pid: u32,
    pub token: String,
}

impl ContactInfo {
    /// Write key=value lines, owner-readable only
    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create service directory")?;
        }
        let body = format!(
            "CYLC_WORKFLOW_HOST={}\nCYLC_WORKFLOW_PORT={}\nCYLC_WORKFLOW_PID={}\nCYLC_WORKFLOW_TOKEN={}\n",
            self.host, self.port, self.pid, self.token
        );
        fs::write(path, body).context("Failed to write contact file")?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perm = fs::Permissions::from_mode(0o600);
            fs::set_permissions(path, perm).context("Failed to restrict contact file permissions")?;
        }
        Ok(())
    }

    /// Read a contact file written by a running scheduler
    pub fn read(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("No contact file at {} (is the workflow running?)", path.display()))?;
        let mut host = None;
        let mut port = None;
        let mut pid = None;
        let mut token = None;
        for line in content.lines() {
            let Some((key, value)) = line.split_once('=') else { continue };
            match key {
                "CYLC_WORKFLOW_HOST" => host = Some(value.to_string()),
                "CYLC_WORKFLOW_PORT" => port = value.parse().ok(),
                "CYLC_WORKFLOW_PID" => pid = value.parse().ok(),
                "CYLC_WORKFLOW_TOKEN" => token = Some(value.to_string()),
                _ => {}
            }
        }
        match (host, port, pid, token) {
            (Some(host), Some(port), Some(pid), Some(token)) => Ok(Self { host, port, pid, token }),
            _ => Err(eyre::eyre!("Malformed contact file at {}", path.display())),
        }
    }

    /// Remove the contact file on shutdown
    pub fn remove(path: &Path) {
        if path.exists() {
            let _ = fs::remove_file(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_layout_paths() {
        let temp = TempDir::new().unwrap();
        let rd = RunDir::at(temp.path().join("wf"));
        rd.ensure_layout().unwrap();

        assert!(rd.path().join(".service").is_dir());
        assert!(rd.path().join("share").is_dir());
        assert_eq!(rd.job_script("1", "a", 1), rd.path().join("log/job/1/a/01/job"));
        assert_eq!(rd.job_status("2", "b", 3), rd.path().join("log/job/2/b/03/job.status"));
    }

    #[test]
    fn test_config_snapshot_numbering() {
        let temp = TempDir::new().unwrap();
        let rd = RunDir::at(temp.path().join("wf"));
        rd.ensure_layout().unwrap();

        let first = rd.next_config_snapshot("start").unwrap();
        assert!(first.ends_with("01-start.yaml"));
        fs::write(&first, "x").unwrap();
        let second = rd.next_config_snapshot("reload").unwrap();
        assert!(second.ends_with("02-reload.yaml"));
    }

    #[test]
    fn test_contact_roundtrip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("contact");
        let info = ContactInfo {
            host: "127.0.0.1".to_string(),
            port: 43001,
            pid: 999,
            token: "secret".to_string(),
        };
        info.write(&path).unwrap();
        assert_eq!(ContactInfo::read(&path).unwrap(), info);

        ContactInfo::remove(&path);
        assert!(ContactInfo::read(&path).is_err());
    }

    #[test]
    fn test_activity_log_appends() {
        let temp = TempDir::new().unwrap();
        let rd = RunDir::at(temp.path().join("wf"));
        rd.log_job_activity("1", "a", 1, "submitted to background");
        rd.log_job_activity("1", "a", 1, "polled");
        let content = fs::read_to_string(rd.job_activity_log("1", "a", 1)).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(content.contains("submitted to background"));
    }
}
