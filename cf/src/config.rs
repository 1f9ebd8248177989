//! Workflow configuration types and loading
//!
//! The scheduler consumes a validated, normalised YAML mapping (`flow.yaml`)
//! with `scheduler`, `scheduling`, `runtime`, and `task parameters`
//! sections. Keys keep their spec spelling (spaces and all) via serde
//! renames; every section defaults so sparse configs load cleanly.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::cycling::{CycleDuration, CyclePoint, CyclingMode};

/// Load and validation failures; refuse to start/apply on these
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration error: {0}")]
    Invalid(String),
}

/// Top-level workflow configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    pub scheduler: SchedulerConfig,
    pub scheduling: SchedulingConfig,
    pub runtime: BTreeMap<String, RuntimeConfig>,
    #[serde(rename = "task parameters")]
    pub task_parameters: BTreeMap<String, String>,
}

/// `scheduler` section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    #[serde(rename = "UTC mode")]
    pub utc_mode: bool,

    /// Recognised for compatibility; points always render canonically
    #[serde(rename = "cycle point format")]
    pub cycle_point_format: Option<String>,

    /// Applied when initial/final points carry no zone designator
    #[serde(rename = "cycle point time zone")]
    pub cycle_point_time_zone: Option<String>,

    #[serde(rename = "allow implicit tasks")]
    pub allow_implicit_tasks: bool,

    /// Main loop tick interval (ISO duration)
    #[serde(rename = "main loop interval")]
    pub main_loop_interval: String,

    /// Max job submissions dispatched per runner group per round
    #[serde(rename = "job batch size")]
    pub job_batch_size: usize,

    /// Delay between successive batches of one round (ISO duration)
    #[serde(rename = "job batch delay")]
    pub job_batch_delay: String,

    /// Max concurrently running event handlers
    #[serde(rename = "max active handlers")]
    pub max_active_handlers: usize,

    pub events: SchedulerEventsConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            utc_mode: true,
            cycle_point_format: None,
            cycle_point_time_zone: None,
            allow_implicit_tasks: false,
            main_loop_interval: "PT1S".to_string(),
            job_batch_size: 100,
            job_batch_delay: "PT0S".to_string(),
            max_active_handlers: 10,
            events: SchedulerEventsConfig::default(),
        }
    }
}

/// `scheduler.events` section: workflow-level timers and handlers
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerEventsConfig {
    #[serde(rename = "inactivity timeout")]
    pub inactivity_timeout: Option<String>,
    #[serde(rename = "abort on inactivity timeout")]
    pub abort_on_inactivity_timeout: bool,

    #[serde(rename = "stall timeout")]
    pub stall_timeout: Option<String>,
    #[serde(rename = "abort on stall timeout")]
    pub abort_on_stall_timeout: bool,

    /// Overall workflow timeout, measured from startup
    pub timeout: Option<String>,
    #[serde(rename = "abort on timeout")]
    pub abort_on_timeout: bool,

    #[serde(rename = "startup handlers")]
    pub startup_handlers: Vec<String>,
    #[serde(rename = "shutdown handlers")]
    pub shutdown_handlers: Vec<String>,
    #[serde(rename = "stall handlers")]
    pub stall_handlers: Vec<String>,
    #[serde(rename = "timeout handlers")]
    pub timeout_handlers: Vec<String>,
    #[serde(rename = "inactivity handlers")]
    pub inactivity_handlers: Vec<String>,
}

/// `scheduling` section
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulingConfig {
    #[serde(rename = "initial cycle point")]
    pub initial_cycle_point: Option<String>,
    #[serde(rename = "final cycle point")]
    pub final_cycle_point: Option<String>,
    #[serde(rename = "cycling mode")]
    pub cycling_mode: CyclingMode,
    /// Duration (date-time mode) or `P<n>` point count (integer mode)
    #[serde(rename = "runahead limit")]
    pub runahead_limit: Option<String>,
    #[serde(rename = "hold after cycle point")]
    pub hold_after_cycle_point: Option<String>,
    #[serde(rename = "stop after cycle point")]
    pub stop_after_cycle_point: Option<String>,
    pub queues: BTreeMap<String, QueueConfig>,
    #[serde(rename = "special tasks")]
    pub special_tasks: SpecialTasksConfig,
    pub xtriggers: BTreeMap<String, String>,
    /// Recurrence expression -> graph string
    pub graph: BTreeMap<String, String>,
}

/// One queue's settings (only the default queue is consulted)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Max members simultaneously submitted or running; 0 = unlimited
    pub limit: usize,
    pub members: Vec<String>,
}

/// `scheduling.special tasks`: lists of `name(arg)` declarations
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SpecialTasksConfig {
    /// `task(PT1H)` - eligible when wall clock passes point + offset
    #[serde(rename = "clock-trigger")]
    pub clock_trigger: Vec<String>,
    /// `task(-P1D)` - expire if wall clock passes point + offset unstarted
    #[serde(rename = "clock-expire")]
    pub clock_expire: Vec<String>,
    /// `task(event-id)` - wait for an external trigger event
    #[serde(rename = "external-trigger")]
    pub external_trigger: Vec<String>,
}

/// One namespace's `runtime` settings (raw, pre-merge)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub inherit: Vec<String>,

    pub script: Option<String>,
    #[serde(rename = "init-script")]
    pub init_script: Option<String>,
    #[serde(rename = "env-script")]
    pub env_script: Option<String>,
    #[serde(rename = "pre-script")]
    pub pre_script: Option<String>,
    #[serde(rename = "post-script")]
    pub post_script: Option<String>,
    #[serde(rename = "err-script")]
    pub err_script: Option<String>,

    pub platform: Option<String>,
    #[serde(rename = "job runner")]
    pub job_runner: Option<String>,
    pub host: Option<String>,

    #[serde(rename = "execution time limit")]
    pub execution_time_limit: Option<String>,
    #[serde(rename = "execution retry delays")]
    pub execution_retry_delays: Option<String>,
    #[serde(rename = "submission retry delays")]
    pub submission_retry_delays: Option<String>,
    #[serde(rename = "execution polling intervals")]
    pub execution_polling_intervals: Option<String>,
    #[serde(rename = "submission polling intervals")]
    pub submission_polling_intervals: Option<String>,

    pub directives: BTreeMap<String, String>,
    pub environment: BTreeMap<String, String>,
    /// label -> message string
    pub outputs: BTreeMap<String, String>,

    pub events: TaskEventsConfig,
}

impl RuntimeConfig {
    /// Overlay `child` onto `self`: scalars override, maps merge key-wise
    pub fn merged_with(&self, child: &Self) -> Self {
        fn pick<T: Clone>(base: &Option<T>, over: &Option<T>) -> Option<T> {
            over.clone().or_else(|| base.clone())
        }
        fn union(base: &BTreeMap<String, String>, over: &BTreeMap<String, String>) -> BTreeMap<String, String> {
            let mut out = base.clone();
            out.extend(over.iter().map(|(k, v)| (k.clone(), v.clone())));
            out
        }
        Self {
            inherit: child.inherit.clone(),
            script: pick(&self.script, &child.script),
            init_script: pick(&self.init_script, &child.init_script),
            env_script: pick(&self.env_script, &child.env_script),
            pre_script: pick(&self.pre_script, &child.pre_script),
            post_script: pick(&self.post_script, &child.post_script),
            err_script: pick(&self.err_script, &child.err_script),
            platform: pick(&self.platform, &child.platform),
            job_runner: pick(&self.job_runner, &child.job_runner),
            host: pick(&self.host, &child.host),
            execution_time_limit: pick(&self.execution_time_limit, &child.execution_time_limit),
            execution_retry_delays: pick(&self.execution_retry_delays, &child.execution_retry_delays),
            submission_retry_delays: pick(&self.submission_retry_delays, &child.submission_retry_delays),
            execution_polling_intervals: pick(&self.execution_polling_intervals, &child.execution_polling_intervals),
            submission_polling_intervals: pick(
                &self.submission_polling_intervals,
                &child.submission_polling_intervals,
            ),
            directives: union(&self.directives, &child.directives),
            environment: union(&self.environment, &child.environment),
            outputs: union(&self.outputs, &child.outputs),
            events: self.events.merged_with(&child.events),
        }
    }
}

/// Per-task `events` section
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskEventsConfig {
    /// event name -> handler command templates
    pub handlers: BTreeMap<String, Vec<String>>,
    #[serde(rename = "handler retry delays")]
    pub handler_retry_delays: Option<String>,
    /// Events whose persistently failing handler aborts the workflow
    #[serde(rename = "abort if handler fails")]
    pub abort_if_handler_fails: Vec<String>,
    #[serde(rename = "submission timeout")]
    pub submission_timeout: Option<String>,
    #[serde(rename = "execution timeout")]
    pub execution_timeout: Option<String>,
    /// Restart the timeout clock whenever a fresh message arrives
    #[serde(rename = "reset timer on incoming message")]
    pub reset_timer_on_message: bool,
}

impl TaskEventsConfig {
    fn merged_with(&self, child: &Self) -> Self {
        let mut handlers = self.handlers.clone();
        handlers.extend(child.handlers.iter().map(|(k, v)| (k.clone(), v.clone())));
        let mut abort = self.abort_if_handler_fails.clone();
        for ev in &child.abort_if_handler_fails {
            if !abort.contains(ev) {
                abort.push(ev.clone());
            }
        }
        Self {
            handlers,
            handler_retry_delays: child
                .handler_retry_delays
                .clone()
                .or_else(|| self.handler_retry_delays.clone()),
            abort_if_handler_fails: abort,
            submission_timeout: child.submission_timeout.clone().or_else(|| self.submission_timeout.clone()),
            execution_timeout: child.execution_timeout.clone().or_else(|| self.execution_timeout.clone()),
            reset_timer_on_message: child.reset_timer_on_message || self.reset_timer_on_message,
        }
    }
}

impl WorkflowConfig {
    /// Load from a YAML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content =
            fs::read_to_string(path).with_context(|| format!("Failed to read workflow config {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Failed to parse workflow config {}", path.display()))
    }

    /// Parse from a YAML string and validate
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content).context("Invalid workflow configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.scheduling.graph.is_empty() {
            return Err(ConfigError::Invalid("scheduling.graph is empty".to_string()).into());
        }
        if self.scheduling.initial_cycle_point.is_none() {
            return Err(ConfigError::Invalid("scheduling.initial cycle point is required".to_string()).into());
        }
        // Durations must parse
        for (label, value) in [
            ("scheduler.main loop interval", &self.scheduler.main_loop_interval),
            ("scheduler.job batch delay", &self.scheduler.job_batch_delay),
        ] {
            CycleDuration::parse(value).map_err(|e| ConfigError::Invalid(format!("{}: {}", label, e)))?;
        }
        Ok(())
    }

    /// Cycling mode
    pub fn mode(&self) -> CyclingMode {
        self.scheduling.cycling_mode
    }

    /// Parse a point string, applying the configured default time zone when
    /// the string carries no zone designator
    pub fn parse_point(&self, s: &str) -> Result<CyclePoint> {
        match CyclePoint::parse(s, self.mode()) {
            Ok(p) => Ok(p),
            Err(e) => {
                if self.mode() == CyclingMode::Gregorian {
                    if let Some(tz) = &self.scheduler.cycle_point_time_zone {
                        if let Ok(p) = CyclePoint::parse(&format!("{}{}", s, tz), self.mode()) {
                            return Ok(p);
                        }
                    }
                    // UTC mode resolves bare points to Z
                    if self.scheduler.utc_mode {
                        if let Ok(p) = CyclePoint::parse(&format!("{}Z", s), self.mode()) {
                            return Ok(p);
                        }
                    }
                }
                Err(e.into())
            }
        }
    }

    /// Resolved initial cycle point
    pub fn initial_point(&self) -> Result<CyclePoint> {
        let raw = self
            .scheduling
            .initial_cycle_point
            .as_deref()
            .ok_or_else(|| ConfigError::Invalid("initial cycle point is required".to_string()))?;
        self.parse_point(raw)
    }

    /// Resolved final cycle point, if configured
    pub fn final_point(&self) -> Result<Option<CyclePoint>> {
        match self.scheduling.final_cycle_point.as_deref() {
            Some(raw) => Ok(Some(self.parse_point(raw)?)),
            None => Ok(None),
        }
    }

    /// Runahead limit as a duration (`P2` counts as two points in integer
    /// mode); default P3/PT24H by mode
    pub fn runahead_limit(&self) -> Result<CycleDuration> {
        match self.scheduling.runahead_limit.as_deref() {
            Some(raw) => Ok(CycleDuration::parse(raw)?),
            None => Ok(match self.mode() {
                CyclingMode::Integer => CycleDuration::Integer(3),
                CyclingMode::Gregorian => CycleDuration::Calendar {
                    years: 0,
                    months: 0,
                    weeks: 0,
                    days: 1,
                    hours: 0,
                    minutes: 0,
                    seconds: 0,
                    negative: false,
                },
            }),
        }
    }

    /// The default queue's active-task limit (0 = unlimited)
    pub fn queue_limit(&self) -> usize {
        self.scheduling.queues.get("default").map(|q| q.limit).unwrap_or(0)
    }

    /// Graph sections in a stable order
    pub fn graph_sections(&self) -> Vec<(String, String)> {
        self.scheduling
            .graph
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Main loop tick interval (clamped to at least 50ms)
    pub fn tick_interval(&self) -> std::time::Duration {
        CycleDuration::parse(&self.scheduler.main_loop_interval)
            .ok()
            .and_then(|d| d.to_std())
            .map(|d| d.max(std::time::Duration::from_millis(50)))
            .unwrap_or(std::time::Duration::from_secs(1))
    }
}

/// Parse a `name(arg)` special-task declaration
pub fn parse_special_task(decl: &str) -> Result<(String, Option<String>)> {
    let decl = decl.trim();
    match decl.split_once('(') {
        None => Ok((decl.to_string(), None)),
        Some((name, rest)) => {
            let arg = rest
                .strip_suffix(')')
                .ok_or_else(|| ConfigError::Invalid(format!("bad special task declaration: {}", decl)))?;
            Ok((name.trim().to_string(), Some(arg.trim().to_string())))
        }
    }
}

/// Expand a parameter value set: `1..3` or a comma list
pub fn parse_param_values(raw: &str) -> Result<Vec<String>> {
    let raw = raw.trim();
    if let Some((lo, hi)) = raw.split_once("..") {
        let lo: i64 = lo
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("bad parameter range: {}", raw)))?;
        let hi: i64 = hi
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("bad parameter range: {}", raw)))?;
        if hi < lo {
            return Err(ConfigError::Invalid(format!("bad parameter range: {}", raw)).into());
        }
        return Ok((lo..=hi).map(|n| n.to_string()).collect());
    }
    let values: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    if values.is_empty() {
        return Err(ConfigError::Invalid(format!("empty parameter value set: {}", raw)).into());
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = "
scheduling:
  initial cycle point: '1'
  final cycle point: '3'
  cycling mode: integer
  graph:
    P1: a => b
";

    #[test]
    fn test_minimal_config_parses() {
        let config = WorkflowConfig::parse(MINIMAL).unwrap();
        assert_eq!(config.mode(), CyclingMode::Integer);
        assert_eq!(config.initial_point().unwrap(), CyclePoint::Integer(1));
        assert_eq!(config.final_point().unwrap(), Some(CyclePoint::Integer(3)));
        assert!(config.scheduler.utc_mode);
    }

    #[test]
    fn test_empty_graph_rejected() {
        let err = WorkflowConfig::parse("scheduling:\n  initial cycle point: '1'\n").unwrap_err();
        assert!(err.to_string().contains("graph"));
    }

    #[test]
    fn test_missing_initial_point_rejected() {
        let err = WorkflowConfig::parse("scheduling:\n  graph:\n    P1: a\n").unwrap_err();
        assert!(format!("{:#}", err).contains("initial cycle point"));
    }

    #[test]
    fn test_runtime_section_with_spaced_keys() {
        let yaml = "
scheduling:
  initial cycle point: '1'
  cycling mode: integer
  graph:
    P1: t
runtime:
  t:
    script: 'true'
    job runner: slurm
    execution retry delays: PT5S, PT5S
    execution time limit: PT1M
    environment:
      GREETING: hello
    events:
      handlers:
        failed: ['echo {{id}} {{event}}']
";
        let config = WorkflowConfig::parse(yaml).unwrap();
        let t = &config.runtime["t"];
        assert_eq!(t.job_runner.as_deref(), Some("slurm"));
        assert_eq!(t.execution_retry_delays.as_deref(), Some("PT5S, PT5S"));
        assert_eq!(t.environment["GREETING"], "hello");
        assert_eq!(t.events.handlers["failed"].len(), 1);
    }

    #[test]
    fn test_merged_with_scalar_and_map() {
        let base = RuntimeConfig {
            script: Some("base".to_string()),
            host: Some("hostA".to_string()),
            environment: [("A".to_string(), "1".to_string()), ("B".to_string(), "2".to_string())].into(),
            ..Default::default()
        };
        let child = RuntimeConfig {
            script: Some("child".to_string()),
            environment: [("B".to_string(), "override".to_string())].into(),
            ..Default::default()
        };
        let merged = base.merged_with(&child);
        assert_eq!(merged.script.as_deref(), Some("child"));
        assert_eq!(merged.host.as_deref(), Some("hostA"));
        assert_eq!(merged.environment["A"], "1");
        assert_eq!(merged.environment["B"], "override");
    }

    #[test]
    fn test_bare_datetime_point_gets_utc() {
        let yaml = "
scheduling:
  initial cycle point: 20260801T0000
  graph:
    P1D: t
";
        let config = WorkflowConfig::parse(yaml).unwrap();
        assert_eq!(config.initial_point().unwrap().format(), "20260801T0000Z");
    }

    #[test]
    fn test_special_task_decl() {
        assert_eq!(
            parse_special_task("c(PT1H)").unwrap(),
            ("c".to_string(), Some("PT1H".to_string()))
        );
        assert_eq!(parse_special_task("plain").unwrap(), ("plain".to_string(), None));
        assert!(parse_special_task("bad(PT1H").is_err());
    }

    #[test]
    fn test_param_values() {
        assert_eq!(parse_param_values("1..3").unwrap(), vec!["1", "2", "3"]);
        assert_eq!(parse_param_values("a, b, c").unwrap(), vec!["a", "b", "c"]);
        assert!(parse_param_values("3..1").is_err());
        assert!(parse_param_values("").is_err());
    }

    #[test]
    fn test_queue_limit() {
        let yaml = "
scheduling:
  initial cycle point: '1'
  cycling mode: integer
  queues:
    default:
      limit: 2
  graph:
    P1: a
";
        let config = WorkflowConfig::parse(yaml).unwrap();
        assert_eq!(config.queue_limit(), 2);
    }
}
