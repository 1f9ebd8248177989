//! Row types for the workflow database

use serde::{Deserialize, Serialize};

/// Latest recorded state for a task at a cycle point
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStateRow {
    /// Task name
    pub name: String,
    /// Canonical cycle point string
    pub cycle: String,
    /// Latest submit number (0 before first submission)
    pub submit_num: u32,
    /// State name, e.g. "waiting", "running", "succeeded"
    pub status: String,
    /// Whether the instance is held
    pub is_held: bool,
    /// ISO-8601 creation time
    pub time_created: String,
    /// ISO-8601 last update time
    pub time_updated: String,
}

/// Job identity and timings for one submission attempt
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskJobRow {
    /// Canonical cycle point string
    pub cycle: String,
    /// Task name
    pub name: String,
    /// Submit number (1-indexed)
    pub submit_num: u32,
    /// Execution attempt number (1-indexed)
    pub try_num: u32,
    /// Whether the submission was forced by `trigger`
    pub is_manual_submit: bool,
    /// 0 = submitted ok, 1 = submission failed (None while in flight)
    pub submit_status: Option<i32>,
    /// ISO-8601 submission time
    pub time_submit: Option<String>,
    /// ISO-8601 job start time
    pub time_run: Option<String>,
    /// ISO-8601 job exit time
    pub time_run_exit: Option<String>,
    /// Signal name if the job died on a signal
    pub run_signal: Option<String>,
    /// Job exit status (0 success) once known
    pub run_status: Option<i32>,
    /// Platform (host) the job ran on
    pub platform_name: String,
    /// Runner name, e.g. "background", "slurm"
    pub job_runner_name: String,
    /// Runner-assigned job id
    pub job_id: Option<String>,
}

/// Append-only task event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEventRow {
    /// Task name
    pub name: String,
    /// Canonical cycle point string
    pub cycle: String,
    /// ISO-8601 event time
    pub time: String,
    /// Submit number the event belongs to
    pub submit_num: u32,
    /// Event label, e.g. "submitted", "failed", "removed"
    pub event: String,
    /// Free-text detail
    pub message: String,
}

/// Direction of a broadcast journal entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BroadcastChange {
    /// Setting applied
    Set,
    /// Setting cancelled/cleared
    Cancel,
}

impl BroadcastChange {
    /// Journal marker, `+` for set and `-` for cancel
    pub fn marker(self) -> &'static str {
        match self {
            Self::Set => "+",
            Self::Cancel => "-",
        }
    }

    /// Parse a journal marker
    pub fn from_marker(s: &str) -> Option<Self> {
        match s {
            "+" => Some(Self::Set),
            "-" => Some(Self::Cancel),
            _ => None,
        }
    }
}

/// One broadcast journal entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastEventRow {
    /// ISO-8601 time of the change
    pub time: String,
    /// `+` (set) or `-` (cancel)
    pub change: BroadcastChange,
    /// Point selector (`*` for all points)
    pub point: String,
    /// Namespace selector (task or family name, `root` for all)
    pub namespace: String,
    /// Setting key path, e.g. "environment.HELLO"
    pub key: String,
    /// JSON-encoded value (empty for cancel-by-key)
    pub value: String,
}

/// Checkpoint row for one live pool instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolRow {
    /// Canonical cycle point string
    pub cycle: String,
    /// Task name
    pub name: String,
    /// State name at checkpoint
    pub status: String,
    /// Whether the instance is held
    pub is_held: bool,
    /// JSON map of prerequisite label -> satisfied flag
    pub satisfied: String,
    /// JSON list of completed outputs
    pub outputs: String,
}

/// Satisfied xtrigger signature with its captured results
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct XtriggerRow {
    /// Unique signature, e.g. "wall_clock(offset=PT0S, point=20260801T0000Z)"
    pub signature: String,
    /// JSON map of result keys broadcast to dependent instances
    pub results: String,
}
