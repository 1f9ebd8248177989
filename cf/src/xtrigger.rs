//! Xtriggers: asynchronous predicates gating task instances
//!
//! Three kinds: wall-clock offsets, external trigger events (satisfied by
//! the `ext-trigger` command), and peer-workflow state (polled from the
//! other workflow's database copy). Satisfied signatures are persisted so
//! a restart never re-waits; results are broadcast to subscribing
//! instances as environment settings.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use eyre::{bail, Context, Result};

use crate::cycling::{CycleDuration, CyclePoint};

/// A parsed xtrigger declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XtriggerSpec {
    /// True once the wall clock passes point + offset
    WallClock { offset: CycleDuration },
    /// True once the named event has been delivered via `ext-trigger`
    ExtTrigger { id: String },
    /// True once a task in another workflow reaches a state
    WorkflowState {
        workflow: String,
        task: String,
        /// Literal point or `%(point)s` to use the subscriber's point
        point: String,
        status: String,
    },
}

impl XtriggerSpec {
    /// Parse `func(arg=value, ...)` syntax from `scheduling.xtriggers`
    pub fn parse(expr: &str) -> Result<Self> {
        let expr = expr.trim();
        let (func, rest) = expr
            .split_once('(')
            .ok_or_else(|| eyre::eyre!("bad xtrigger expression: {}", expr))?;
        let args_text = rest
            .strip_suffix(')')
            .ok_or_else(|| eyre::eyre!("bad xtrigger expression: {}", expr))?;

        let mut args: BTreeMap<String, String> = BTreeMap::new();
        let mut positional: Vec<String> = Vec::new();
        for piece in args_text.split(',') {
            let piece = piece.trim();
            if piece.is_empty() {
                continue;
            }
            match piece.split_once('=') {
                Some((k, v)) => {
                    args.insert(k.trim().to_string(), v.trim().trim_matches(['\'', '"']).to_string());
                }
                None => positional.push(piece.trim_matches(['\'', '"']).to_string()),
            }
        }

        match func.trim() {
            "wall_clock" => {
                let offset = match args.get("offset").map(String::as_str).or(positional.first().map(String::as_str)) {
                    Some(raw) => CycleDuration::parse(raw)?,
                    None => CycleDuration::from_seconds(0),
                };
                Ok(Self::WallClock { offset })
            }
            "ext_trigger" => {
                let id = args
                    .get("id")
                    .cloned()
                    .or_else(|| positional.first().cloned())
                    .ok_or_else(|| eyre::eyre!("ext_trigger requires an event id: {}", expr))?;
                Ok(Self::ExtTrigger { id })
            }
            "workflow_state" => {
                let workflow = args
                    .get("workflow")
                    .cloned()
                    .ok_or_else(|| eyre::eyre!("workflow_state requires workflow=: {}", expr))?;
                let task = args
                    .get("task")
                    .cloned()
                    .ok_or_else(|| eyre::eyre!("workflow_state requires task=: {}", expr))?;
                let point = args.get("point").cloned().unwrap_or_else(|| "%(point)s".to_string());
                let status = args.get("status").cloned().unwrap_or_else(|| "succeeded".to_string());
                Ok(Self::WorkflowState {
                    workflow,
                    task,
                    point,
                    status,
                })
            }
            other => bail!("unknown xtrigger function: {}", other),
        }
    }

    /// Unique signature for this trigger at a subscriber's point; equal
    /// signatures share one evaluation.
    pub fn signature(&self, point: &CyclePoint) -> String {
        match self {
            Self::WallClock { offset } => {
                format!("wall_clock(offset={}, point={})", offset, point.format())
            }
            Self::ExtTrigger { id } => format!("ext_trigger(id={}, point={})", id, point.format()),
            Self::WorkflowState {
                workflow,
                task,
                point: target,
                status,
            } => {
                let target = target.replace("%(point)s", &point.format());
                format!(
                    "workflow_state(workflow={}, task={}, point={}, status={})",
                    workflow, task, target, status
                )
            }
        }
    }

    /// Check a wall-clock trigger against the clock; non-clock kinds are
    /// checked elsewhere (commands, peer DB polls).
    pub fn is_clock_satisfied(&self, point: &CyclePoint, now: DateTime<Utc>) -> bool {
        match self {
            Self::WallClock { offset } => clock_passed(point, offset, now),
            _ => false,
        }
    }
}

/// Whether the wall clock has passed `point + offset` (date-time mode);
/// integer points satisfy clock triggers immediately.
pub fn clock_passed(point: &CyclePoint, offset: &CycleDuration, now: DateTime<Utc>) -> bool {
    match point.add(offset) {
        Ok(CyclePoint::DateTime(dt)) => now >= dt,
        Ok(CyclePoint::Integer(_)) => true,
        Err(_) => true,
    }
}

/// Poll a peer workflow's public database copy for a task state
pub fn check_workflow_state(
    run_root: &std::path::Path,
    workflow: &str,
    task: &str,
    point: &str,
    status: &str,
) -> Result<bool> {
    let db_path: PathBuf = run_root.join(workflow).join("log").join("db");
    let found = cyclestore::Store::read_task_state(&db_path, task, point)
        .with_context(|| format!("polling peer workflow db {}", db_path.display()))?;
    Ok(found.as_deref() == Some(status))
}

/// Environment entries contributed to subscribers when a trigger fires
pub fn result_env(spec: &XtriggerSpec, name: &str) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    match spec {
        XtriggerSpec::WallClock { .. } => {}
        XtriggerSpec::ExtTrigger { id } => {
            env.insert(format!("CYLC_EXT_TRIGGER_{}", shout(name)), id.clone());
        }
        XtriggerSpec::WorkflowState { workflow, task, .. } => {
            env.insert(format!("CYLC_XTRIGGER_{}_WORKFLOW", shout(name)), workflow.clone());
            env.insert(format!("CYLC_XTRIGGER_{}_TASK", shout(name)), task.clone());
        }
    }
    env
}

fn shout(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cycling::CyclingMode;

    #[test]
    fn test_parse_wall_clock() {
        let spec = XtriggerSpec::parse("wall_clock(offset=PT1H)").unwrap();
        assert_eq!(
            spec,
            XtriggerSpec::WallClock {
                offset: CycleDuration::parse("PT1H").unwrap()
            }
        );
        // Default offset
        let spec = XtriggerSpec::parse("wall_clock()").unwrap();
        assert!(matches!(spec, XtriggerSpec::WallClock { .. }));
    }

    #[test]
    fn test_parse_ext_trigger() {
        let spec = XtriggerSpec::parse("ext_trigger(upstream-done)").unwrap();
        assert_eq!(
            spec,
            XtriggerSpec::ExtTrigger {
                id: "upstream-done".to_string()
            }
        );
    }

    #[test]
    fn test_parse_workflow_state() {
        let spec = XtriggerSpec::parse("workflow_state(workflow=other, task=t, status=succeeded)").unwrap();
        let XtriggerSpec::WorkflowState { workflow, task, point, status } = spec else {
            panic!("wrong kind")
        };
        assert_eq!(workflow, "other");
        assert_eq!(task, "t");
        assert_eq!(point, "%(point)s");
        assert_eq!(status, "succeeded");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(XtriggerSpec::parse("nonsense(1)").is_err());
        assert!(XtriggerSpec::parse("wall_clock").is_err());
        assert!(XtriggerSpec::parse("workflow_state(task=t)").is_err());
    }

    #[test]
    fn test_signature_substitutes_point() {
        let point = CyclePoint::Integer(3);
        let spec = XtriggerSpec::parse("workflow_state(workflow=w, task=t)").unwrap();
        assert_eq!(
            spec.signature(&point),
            "workflow_state(workflow=w, task=t, point=3, status=succeeded)"
        );
    }

    #[test]
    fn test_clock_passed() {
        let now = Utc::now();
        let past = CyclePoint::parse("20200101T0000Z", CyclingMode::Gregorian).unwrap();
        let future = CyclePoint::parse("29990101T0000Z", CyclingMode::Gregorian).unwrap();
        let zero = CycleDuration::from_seconds(0);
        assert!(clock_passed(&past, &zero, now));
        assert!(!clock_passed(&future, &zero, now));
    }
}
