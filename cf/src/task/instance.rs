//! Task instances
//!
//! A task instance is one (name, cycle-point, submit-number) execution
//! attempt plus the bookkeeping the scheduler needs around it: satisfied
//! prerequisites, completed outputs, retry state, polling schedule, and
//! timeout deadlines. Instances live in the task pool; the job subsystem
//! refers to them only by identity tuple.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::cycling::CyclePoint;
use crate::task::definition::TaskDef;
use crate::task::outputs;
use crate::task::prereq::Prerequisite;
use crate::task::state::TaskState;

/// Identity tuple used by the job subsystem and the wire protocol
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId {
    pub name: String,
    /// Canonical cycle point string
    pub point: String,
}

impl TaskId {
    pub fn new(name: impl Into<String>, point: &CyclePoint) -> Self {
        Self {
            name: name.into(),
            point: point.format(),
        }
    }

    /// Parse `name.point`
    pub fn parse(s: &str) -> Option<Self> {
        let (name, point) = s.split_once('.')?;
        if name.is_empty() || point.is_empty() {
            return None;
        }
        Some(Self {
            name: name.to_string(),
            point: point.to_string(),
        })
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.name, self.point)
    }
}

/// Identity of a job once submitted to a runner
#[derive(Debug, Clone, Default)]
pub struct JobRef {
    pub runner_name: String,
    pub host: String,
    /// Runner-assigned id (pid, batch job id)
    pub job_id: Option<String>,
    /// Status file path inside the run directory
    pub status_path: Option<std::path::PathBuf>,
}

/// One live task instance
#[derive(Debug, Clone)]
pub struct TaskInstance {
    pub name: String,
    pub point: CyclePoint,
    /// Incremented on every dispatch (1-indexed once submitted)
    pub submit_num: u32,
    /// Execution attempt (1 + prior execution failures)
    pub try_num: u32,
    /// Submission attempt within the current execution try
    pub sub_try_num: u32,
    pub state: TaskState,
    pub is_held: bool,
    /// Forced by the `trigger` command; bypasses prerequisites
    pub is_manual: bool,

    /// Normal prerequisites; all must be satisfied
    pub prereqs: Vec<Prerequisite>,
    /// Suicide prerequisites; any satisfied removes the instance
    pub suicides: Vec<Prerequisite>,
    /// Completed outputs
    pub outputs: BTreeSet<String>,

    /// Outstanding xtrigger signatures
    pub xtriggers: BTreeSet<String>,
    /// Environment contributed by satisfied xtriggers
    pub xtrigger_env: BTreeMap<String, String>,

    /// Earliest wall-clock time the next retry may submit
    pub retry_at: Option<DateTime<Utc>>,
    /// Remaining polling schedule; the tail entry repeats
    pub poll_schedule: VecDeque<Duration>,
    pub next_poll_at: Option<DateTime<Utc>>,
    pub submit_timeout_at: Option<DateTime<Utc>>,
    pub execution_timeout_at: Option<DateTime<Utc>>,

    /// Job identity once dispatched
    pub job: Option<JobRef>,
    /// Settings captured when the instance left `waiting`; reload does not
    /// touch these
    pub captured: Arc<TaskDef>,
    /// Children this instance has already spawned (dedup)
    pub spawned: BTreeSet<TaskId>,
}

impl TaskInstance {
    /// Create a new waiting instance
    pub fn new(
        name: impl Into<String>,
        point: CyclePoint,
        def: Arc<TaskDef>,
        prereqs: Vec<Prerequisite>,
        suicides: Vec<Prerequisite>,
    ) -> Self {
        let name = name.into();
        Self {
            name,
            point,
            submit_num: 0,
            try_num: 1,
            sub_try_num: 1,
            state: TaskState::Waiting,
            is_held: false,
            is_manual: false,
            prereqs,
            suicides,
            outputs: BTreeSet::new(),
            xtriggers: BTreeSet::new(),
            xtrigger_env: BTreeMap::new(),
            retry_at: None,
            poll_schedule: VecDeque::new(),
            next_poll_at: None,
            submit_timeout_at: None,
            execution_timeout_at: None,
            job: None,
            captured: def,
            spawned: BTreeSet::new(),
        }
    }

    /// Identity tuple
    pub fn id(&self) -> TaskId {
        TaskId::new(self.name.clone(), &self.point)
    }

    /// Apply a state transition, honouring terminal monotonicity. Returns
    /// false (and logs) when the transition is rejected.
    pub fn transition(&mut self, to: TaskState) -> bool {
        if self.state == to {
            return false;
        }
        if self.state.is_terminal() && !to.is_terminal() {
            debug!(id = %self.id(), from = %self.state, to = %to, "Ignoring late non-terminal transition");
            return false;
        }
        debug!(id = %self.id(), from = %self.state, to = %to, "State transition");
        self.state = to;
        true
    }

    /// Record a completed output; returns true if newly completed
    pub fn complete_output(&mut self, output: &str) -> bool {
        self.outputs.insert(output.to_string())
    }

    /// All prerequisites (including xtriggers and any retry timer) satisfied
    pub fn prereqs_satisfied(&self, now: DateTime<Utc>) -> bool {
        if self.is_manual {
            return true;
        }
        if let Some(at) = self.retry_at {
            if now < at {
                return false;
            }
        }
        self.xtriggers.is_empty() && self.prereqs.iter().all(|p| p.is_satisfied())
    }

    /// Any suicide prerequisite fully satisfied
    pub fn suicide_satisfied(&self) -> bool {
        self.suicides.iter().any(|p| p.is_satisfied())
    }

    /// Whether a retry timer is pending (waiting but not yet eligible)
    pub fn retry_pending(&self, now: DateTime<Utc>) -> bool {
        self.state == TaskState::Waiting && self.retry_at.map(|at| now < at).unwrap_or(false)
    }

    /// Reset per-submission bookkeeping ahead of a (re)dispatch
    pub fn begin_submission(&mut self, now: DateTime<Utc>) {
        self.submit_num += 1;
        self.retry_at = None;
        self.job = None;
        self.next_poll_at = None;
        self.execution_timeout_at = None;
        self.poll_schedule = self.captured.submission_polling_intervals().into();
        self.submit_timeout_at = self
            .captured
            .submission_timeout()
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .map(|d| now + d);
    }

    /// Switch the polling schedule to the execution intervals (job started)
    pub fn begin_execution(&mut self, now: DateTime<Utc>) {
        self.submit_timeout_at = None;
        self.poll_schedule = self.captured.execution_polling_intervals().into();
        self.next_poll_at = None;
        self.schedule_next_poll(now);
        let timeout = self
            .captured
            .execution_timeout()
            .or_else(|| self.captured.execution_time_limit());
        self.execution_timeout_at = timeout
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .map(|d| now + d);
    }

    /// Consume the next polling delay; the final entry repeats
    pub fn schedule_next_poll(&mut self, now: DateTime<Utc>) {
        let delay = if self.poll_schedule.len() > 1 {
            self.poll_schedule.pop_front()
        } else {
            self.poll_schedule.front().copied()
        };
        self.next_poll_at = delay
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .map(|d| now + d);
    }

    /// A fresh message arrived: push the next poll out and, when configured,
    /// restart the timeout clock
    pub fn message_received(&mut self, now: DateTime<Utc>) {
        self.schedule_next_poll(now);
        if self.captured.runtime.events.reset_timer_on_message {
            if self.state == TaskState::Submitted {
                if let Some(d) = self
                    .captured
                    .submission_timeout()
                    .and_then(|d| chrono::Duration::from_std(d).ok())
                {
                    self.submit_timeout_at = Some(now + d);
                }
            }
            if self.state == TaskState::Running {
                if let Some(d) = self
                    .captured
                    .execution_timeout()
                    .and_then(|d| chrono::Duration::from_std(d).ok())
                {
                    self.execution_timeout_at = Some(now + d);
                }
            }
        }
    }

    /// Arrange an execution retry: attempt+1, back to waiting after `delay`
    pub fn schedule_execution_retry(&mut self, delay: Duration, now: DateTime<Utc>) {
        self.try_num += 1;
        self.sub_try_num = 1;
        self.arm_retry(delay, now);
    }

    /// Arrange a submission retry: same execution try, next submission
    pub fn schedule_submission_retry(&mut self, delay: Duration, now: DateTime<Utc>) {
        self.sub_try_num += 1;
        self.arm_retry(delay, now);
    }

    fn arm_retry(&mut self, delay: Duration, now: DateTime<Utc>) {
        self.state = TaskState::Waiting;
        self.is_manual = false;
        self.retry_at = chrono::Duration::from_std(delay).ok().map(|d| now + d);
        self.submit_timeout_at = None;
        self.execution_timeout_at = None;
        self.next_poll_at = None;
    }

    /// The output implied by a state, if any (synthetic outputs)
    pub fn output_for_state(state: TaskState) -> Option<&'static str> {
        match state {
            TaskState::Submitted => Some(outputs::SUBMITTED),
            TaskState::SubmitFailed => Some(outputs::SUBMIT_FAILED),
            TaskState::Running => Some(outputs::STARTED),
            TaskState::Succeeded => Some(outputs::SUCCEEDED),
            TaskState::Failed => Some(outputs::FAILED),
            TaskState::Expired => Some(outputs::EXPIRED),
            TaskState::Waiting | TaskState::Preparing => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;

    fn def() -> Arc<TaskDef> {
        Arc::new(TaskDef {
            name: "t".to_string(),
            runtime: RuntimeConfig::default(),
            clock_trigger: None,
            clock_expire: None,
            external_trigger: None,
        })
    }

    fn instance() -> TaskInstance {
        TaskInstance::new("t", CyclePoint::Integer(1), def(), Vec::new(), Vec::new())
    }

    #[test]
    fn test_task_id_roundtrip() {
        let id = TaskId::new("t", &CyclePoint::Integer(3));
        assert_eq!(id.to_string(), "t.3");
        assert_eq!(TaskId::parse("t.3"), Some(id));
        assert_eq!(TaskId::parse("no-dot"), None);
    }

    #[test]
    fn test_terminal_monotonicity() {
        let mut inst = instance();
        assert!(inst.transition(TaskState::Preparing));
        assert!(inst.transition(TaskState::Submitted));
        assert!(inst.transition(TaskState::Running));
        assert!(inst.transition(TaskState::Succeeded));
        // Late `started` after succeeded is dropped
        assert!(!inst.transition(TaskState::Running));
        assert_eq!(inst.state, TaskState::Succeeded);
        // Terminal-to-terminal is also refused once equal
        assert!(!inst.transition(TaskState::Succeeded));
    }

    #[test]
    fn test_eligibility_requires_prereqs_and_xtriggers() {
        let now = Utc::now();
        let mut inst = instance();
        assert!(inst.prereqs_satisfied(now));

        inst.xtriggers.insert("wall_clock(...)".to_string());
        assert!(!inst.prereqs_satisfied(now));
        inst.xtriggers.clear();

        inst.retry_at = Some(now + chrono::Duration::seconds(30));
        assert!(!inst.prereqs_satisfied(now));
        assert!(inst.retry_pending(now));
        assert!(inst.prereqs_satisfied(now + chrono::Duration::seconds(31)));
    }

    #[test]
    fn test_manual_trigger_bypasses_prereqs() {
        let now = Utc::now();
        let mut inst = instance();
        inst.xtriggers.insert("ext".to_string());
        inst.is_manual = true;
        assert!(inst.prereqs_satisfied(now));
    }

    #[test]
    fn test_begin_submission_resets_job_state() {
        let now = Utc::now();
        let mut inst = instance();
        inst.begin_submission(now);
        assert_eq!(inst.submit_num, 1);
        assert!(inst.job.is_none());
        assert!(!inst.poll_schedule.is_empty());

        inst.begin_submission(now);
        assert_eq!(inst.submit_num, 2);
    }

    #[test]
    fn test_retry_counters() {
        let now = Utc::now();
        let mut inst = instance();
        inst.begin_submission(now);

        inst.schedule_execution_retry(Duration::from_secs(5), now);
        assert_eq!(inst.try_num, 2);
        assert_eq!(inst.sub_try_num, 1);
        assert_eq!(inst.state, TaskState::Waiting);
        assert!(inst.retry_at.is_some());

        inst.schedule_submission_retry(Duration::from_secs(5), now);
        assert_eq!(inst.try_num, 2);
        assert_eq!(inst.sub_try_num, 2);
    }

    #[test]
    fn test_poll_schedule_tail_repeats() {
        let now = Utc::now();
        let mut inst = instance();
        inst.poll_schedule = vec![Duration::from_secs(2), Duration::from_secs(10)].into();
        inst.schedule_next_poll(now);
        assert_eq!(inst.next_poll_at, Some(now + chrono::Duration::seconds(2)));
        inst.schedule_next_poll(now);
        assert_eq!(inst.next_poll_at, Some(now + chrono::Duration::seconds(10)));
        // Tail repeats
        inst.schedule_next_poll(now);
        assert_eq!(inst.next_poll_at, Some(now + chrono::Duration::seconds(10)));
    }

    #[test]
    fn test_output_for_state() {
        assert_eq!(TaskInstance::output_for_state(TaskState::Succeeded), Some("succeeded"));
        assert_eq!(TaskInstance::output_for_state(TaskState::Waiting), None);
    }
}
