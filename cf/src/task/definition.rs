//! Task definition registry
//!
//! On startup and reload the registry expands task parameters, builds the
//! family tree from `inherit` lists, and merges runtime settings per leaf
//! along the C3 linearisation. Merged settings are immutable; broadcasts
//! override copies at submission time only.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use eyre::{bail, Context, Result};

use crate::config::{parse_param_values, parse_special_task, RuntimeConfig, WorkflowConfig};
use crate::cycling::{parse_delays, CycleDuration};
use crate::graph::{FamilyTree, ROOT};

/// A concrete task with its fully merged runtime settings
#[derive(Debug, Clone)]
pub struct TaskDef {
    /// Concrete (parameter-expanded) task name
    pub name: String,
    /// Merged runtime settings
    pub runtime: RuntimeConfig,
    /// Clock-trigger offset from the cycle point, if declared
    pub clock_trigger: Option<CycleDuration>,
    /// Clock-expire offset from the cycle point, if declared
    pub clock_expire: Option<CycleDuration>,
    /// External-trigger event id, if declared
    pub external_trigger: Option<String>,
}

impl TaskDef {
    /// Target host (job runners are invoked via ssh for non-local hosts)
    pub fn host(&self) -> &str {
        self.runtime.host.as_deref().unwrap_or("localhost")
    }

    /// Job runner name
    pub fn runner_name(&self) -> &str {
        self.runtime.job_runner.as_deref().unwrap_or("background")
    }

    /// Platform label recorded in the DB
    pub fn platform(&self) -> &str {
        self.runtime.platform.as_deref().unwrap_or_else(|| self.host())
    }

    /// Execution retry delays (empty = no retries)
    pub fn execution_retry_delays(&self) -> Vec<CycleDuration> {
        self.runtime
            .execution_retry_delays
            .as_deref()
            .and_then(|s| parse_delays(s).ok())
            .unwrap_or_default()
    }

    /// Submission retry delays (empty = no retries)
    pub fn submission_retry_delays(&self) -> Vec<CycleDuration> {
        self.runtime
            .submission_retry_delays
            .as_deref()
            .and_then(|s| parse_delays(s).ok())
            .unwrap_or_default()
    }

    /// Polling schedule while `submitted`; the last entry repeats
    pub fn submission_polling_intervals(&self) -> Vec<std::time::Duration> {
        delays_to_std(self.runtime.submission_polling_intervals.as_deref(), "PT1M")
    }

    /// Polling schedule while `running`; the last entry repeats
    pub fn execution_polling_intervals(&self) -> Vec<std::time::Duration> {
        delays_to_std(self.runtime.execution_polling_intervals.as_deref(), "PT1M")
    }

    /// Wall-clock limit on execution, if set
    pub fn execution_time_limit(&self) -> Option<std::time::Duration> {
        self.runtime
            .execution_time_limit
            .as_deref()
            .and_then(|s| CycleDuration::parse(s).ok())
            .and_then(|d| d.to_std())
    }

    /// Timeout waiting for `started` after submission
    pub fn submission_timeout(&self) -> Option<std::time::Duration> {
        self.runtime
            .events
            .submission_timeout
            .as_deref()
            .and_then(|s| CycleDuration::parse(s).ok())
            .and_then(|d| d.to_std())
    }

    /// Timeout on execution measured from `started`
    pub fn execution_timeout(&self) -> Option<std::time::Duration> {
        self.runtime
            .events
            .execution_timeout
            .as_deref()
            .and_then(|s| CycleDuration::parse(s).ok())
            .and_then(|d| d.to_std())
    }

    /// Handler command templates for a task event
    pub fn handlers_for(&self, event: &str) -> &[String] {
        self.runtime
            .events
            .handlers
            .get(event)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

fn delays_to_std(raw: Option<&str>, default: &str) -> Vec<std::time::Duration> {
    let raw = raw.unwrap_or(default);
    parse_delays(raw)
        .ok()
        .map(|ds| ds.iter().filter_map(|d| d.to_std()).collect::<Vec<_>>())
        .filter(|v: &Vec<_>| !v.is_empty())
        .unwrap_or_else(|| vec![std::time::Duration::from_secs(60)])
}

/// The registry of merged task definitions
#[derive(Debug, Clone)]
pub struct TaskRegistry {
    defs: BTreeMap<String, Arc<TaskDef>>,
    families: FamilyTree,
    params: BTreeMap<String, Vec<String>>,
}

impl TaskRegistry {
    /// Expand parameters, build the family tree, and merge inheritance
    pub fn from_config(config: &WorkflowConfig) -> Result<Self> {
        let mut params: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, raw) in &config.task_parameters {
            params.insert(
                name.clone(),
                parse_param_values(raw).with_context(|| format!("task parameter {}", name))?,
            );
        }

        // Parameter-expand namespace names
        let mut expanded: BTreeMap<String, RuntimeConfig> = BTreeMap::new();
        for (name, runtime) in &config.runtime {
            for (concrete, combo) in expand_namespace_name(name, &params)? {
                let mut rt = substitute_params(runtime, &combo);
                // Parents may reference the same parameter
                rt.inherit = rt
                    .inherit
                    .iter()
                    .map(|p| substitute_in_str(p, &combo))
                    .collect();
                if expanded.insert(concrete.clone(), rt).is_some() {
                    bail!("duplicate runtime namespace {}", concrete);
                }
            }
        }

        let inherit_map: BTreeMap<String, Vec<String>> = expanded
            .iter()
            .map(|(name, rt)| (name.clone(), rt.inherit.clone()))
            .collect();
        let families = FamilyTree::new(&inherit_map);

        // Merge along the C3 linearisation, root first
        let root_runtime = expanded.get(ROOT).cloned().unwrap_or_default();
        let mut defs = BTreeMap::new();
        for leaf in families.leaves() {
            let lin = families
                .linearization(&leaf)
                .with_context(|| format!("resolving inheritance of {}", leaf))?;
            let mut merged = root_runtime.clone();
            // Walk ancestors nearest-last so nearer namespaces override
            for ancestor in lin.iter().rev() {
                if ancestor == ROOT {
                    continue;
                }
                let rt = expanded
                    .get(ancestor)
                    .ok_or_else(|| eyre::eyre!("undefined namespace {} inherited by {}", ancestor, leaf))?;
                merged = merged.merged_with(rt);
            }
            defs.insert(
                leaf.clone(),
                Arc::new(TaskDef {
                    name: leaf.clone(),
                    runtime: merged,
                    clock_trigger: None,
                    clock_expire: None,
                    external_trigger: None,
                }),
            );
        }

        let mut registry = Self { defs, families, params };
        registry.apply_special_tasks(config)?;
        Ok(registry)
    }

    fn apply_special_tasks(&mut self, config: &WorkflowConfig) -> Result<()> {
        let special = &config.scheduling.special_tasks;
        for (decls, kind) in [
            (&special.clock_trigger, "clock-trigger"),
            (&special.clock_expire, "clock-expire"),
            (&special.external_trigger, "external-trigger"),
        ] {
            for decl in decls.iter() {
                let (name, arg) = parse_special_task(decl)?;
                for member in self.families.members(&name) {
                    let def = match self.defs.get(&member) {
                        Some(def) => def,
                        // Implicit tasks pick this up in adopt_implicit
                        None => continue,
                    };
                    let mut new_def = (**def).clone();
                    match kind {
                        "clock-trigger" | "clock-expire" => {
                            let offset = match arg.as_deref() {
                                Some(raw) => CycleDuration::parse(raw)
                                    .with_context(|| format!("{} offset for {}", kind, name))?,
                                None => CycleDuration::from_seconds(0),
                            };
                            if kind == "clock-trigger" {
                                new_def.clock_trigger = Some(offset);
                            } else {
                                new_def.clock_expire = Some(offset);
                            }
                        }
                        _ => {
                            new_def.external_trigger = Some(arg.clone().unwrap_or_else(|| member.clone()));
                        }
                    }
                    self.defs.insert(member.clone(), Arc::new(new_def));
                }
            }
        }
        Ok(())
    }

    /// Check graph tasks against the registry; synthesise root-only
    /// definitions for implicit tasks when allowed, error otherwise.
    pub fn adopt_graph_tasks(&mut self, graph_tasks: &BTreeSet<String>, allow_implicit: bool) -> Result<()> {
        let missing: Vec<&String> = graph_tasks.iter().filter(|t| !self.defs.contains_key(*t)).collect();
        if missing.is_empty() {
            return Ok(());
        }
        if !allow_implicit {
            bail!(
                "graph tasks with no runtime definition: {} (set `scheduler.allow implicit tasks` to permit)",
                missing.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
            );
        }
        for name in missing {
            self.defs.insert(
                name.clone(),
                Arc::new(TaskDef {
                    name: name.clone(),
                    runtime: RuntimeConfig::default(),
                    clock_trigger: None,
                    clock_expire: None,
                    external_trigger: None,
                }),
            );
        }
        Ok(())
    }

    /// Look up a merged definition
    pub fn get(&self, name: &str) -> Option<&Arc<TaskDef>> {
        self.defs.get(name)
    }

    /// The family tree
    pub fn families(&self) -> &FamilyTree {
        &self.families
    }

    /// Expanded parameter value sets
    pub fn params(&self) -> &BTreeMap<String, Vec<String>> {
        &self.params
    }

    /// All registered task names
    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.defs.keys()
    }
}

/// Expand a namespace name over its parameter spec. `model<i>` uses the
/// declared values of `i`; `model<i=1..3>` declares inline; a plain name
/// expands to itself.
fn expand_namespace_name(
    name: &str,
    params: &BTreeMap<String, Vec<String>>,
) -> Result<Vec<(String, BTreeMap<String, String>)>> {
    let Some((base, rest)) = name.split_once('<') else {
        return Ok(vec![(name.to_string(), BTreeMap::new())]);
    };
    let spec = rest
        .strip_suffix('>')
        .ok_or_else(|| eyre::eyre!("unterminated parameter in namespace {}", name))?;

    let (param, values) = match spec.split_once('=') {
        Some((p, v)) => (p.trim().to_string(), parse_param_values(v)?),
        None => {
            let p = spec.trim().to_string();
            let values = params
                .get(&p)
                .ok_or_else(|| eyre::eyre!("undeclared task parameter <{}> in namespace {}", p, name))?
                .clone();
            (p, values)
        }
    };

    Ok(values
        .into_iter()
        .map(|v| {
            let mut combo = BTreeMap::new();
            combo.insert(param.clone(), v.clone());
            (format!("{}_{}", base, v), combo)
        })
        .collect())
}

/// Substitute `<p>` parameter references inside runtime string settings
fn substitute_params(runtime: &RuntimeConfig, combo: &BTreeMap<String, String>) -> RuntimeConfig {
    if combo.is_empty() {
        return runtime.clone();
    }
    let sub = |s: &Option<String>| s.as_ref().map(|v| substitute_in_str(v, combo));
    let sub_map = |m: &BTreeMap<String, String>| {
        m.iter()
            .map(|(k, v)| (k.clone(), substitute_in_str(v, combo)))
            .collect()
    };
    RuntimeConfig {
        inherit: runtime.inherit.clone(),
        script: sub(&runtime.script),
        init_script: sub(&runtime.init_script),
        env_script: sub(&runtime.env_script),
        pre_script: sub(&runtime.pre_script),
        post_script: sub(&runtime.post_script),
        err_script: sub(&runtime.err_script),
        platform: sub(&runtime.platform),
        job_runner: runtime.job_runner.clone(),
        host: sub(&runtime.host),
        execution_time_limit: runtime.execution_time_limit.clone(),
        execution_retry_delays: runtime.execution_retry_delays.clone(),
        submission_retry_delays: runtime.submission_retry_delays.clone(),
        execution_polling_intervals: runtime.execution_polling_intervals.clone(),
        submission_polling_intervals: runtime.submission_polling_intervals.clone(),
        directives: sub_map(&runtime.directives),
        environment: sub_map(&runtime.environment),
        outputs: sub_map(&runtime.outputs),
        events: runtime.events.clone(),
    }
}

fn substitute_in_str(s: &str, combo: &BTreeMap<String, String>) -> String {
    let mut out = s.to_string();
    for (p, v) in combo {
        out = out.replace(&format!("<{}>", p), v);
    }
    out
}
