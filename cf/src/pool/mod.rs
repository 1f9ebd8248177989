//! The task pool
//!
//! Exclusively owns all live task instances, indexed by (point, name). The
//! pool enforces the runahead window, spawns instances on demand (downstream
//! children on output completion, parentless tasks one point ahead of the
//! runahead edge), applies suicide removals, housekeeps completed points,
//! and detects stalls.

pub mod resolver;

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cycling::{CycleDuration, CyclePoint};
use crate::graph::WorkflowGraph;
use crate::task::{Prerequisite, TaskDef, TaskId, TaskInstance, TaskRegistry, TaskState};
use crate::xtrigger::XtriggerSpec;

/// Persisted per-instance snapshot stored in the `task_pool` checkpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    /// Prerequisite condition -> satisfied
    #[serde(default)]
    pub prereqs: BTreeMap<String, bool>,
    /// Suicide condition -> satisfied
    #[serde(default)]
    pub suicides: BTreeMap<String, bool>,
    /// Execution attempt number
    #[serde(default)]
    pub try_num: u32,
    /// Submission attempt number within the try
    #[serde(default)]
    pub sub_try_num: u32,
    /// Submit number
    #[serde(default)]
    pub submit_num: u32,
    /// Pending retry deadline (ISO-8601)
    #[serde(default)]
    pub retry_at: Option<String>,
    /// Forced by `trigger`
    #[serde(default)]
    pub is_manual: bool,
}

/// Decision about whether a candidate instance may enter the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnOutcome {
    Spawned,
    AlreadyPresent,
    /// Beyond the final or stop point, or not on any recurrence
    OutOfBounds,
}

/// The pool of live task instances
pub struct TaskPool {
    instances: BTreeMap<(CyclePoint, String), TaskInstance>,
    initial: CyclePoint,
    final_point: Option<CyclePoint>,
    runahead: CycleDuration,
    queue_limit: usize,
    hold_point: Option<CyclePoint>,
    stop_point: Option<CyclePoint>,
    /// Next candidate point per parentless task
    parentless_next: BTreeMap<String, CyclePoint>,
    /// Declared xtriggers (`scheduling.xtriggers`)
    xtrigger_defs: BTreeMap<String, XtriggerSpec>,
    /// Signatures already satisfied (shared across instances)
    satisfied_xtriggers: BTreeSet<String>,
    /// signature -> (label, spec, subscriber point), for evaluation
    sig_meta: BTreeMap<String, (String, XtriggerSpec, CyclePoint)>,
}

impl TaskPool {
    pub fn new(
        initial: CyclePoint,
        final_point: Option<CyclePoint>,
        runahead: CycleDuration,
        queue_limit: usize,
        xtrigger_defs: BTreeMap<String, XtriggerSpec>,
    ) -> Self {
        Self {
            instances: BTreeMap::new(),
            initial,
            final_point,
            runahead,
            queue_limit,
            hold_point: None,
            stop_point: None,
            parentless_next: BTreeMap::new(),
            xtrigger_defs,
            satisfied_xtriggers: BTreeSet::new(),
            sig_meta: BTreeMap::new(),
        }
    }

    /// The workflow's initial cycle point
    pub fn initial(&self) -> CyclePoint {
        self.initial
    }

    /// The final cycle point, if any
    pub fn final_point(&self) -> Option<CyclePoint> {
        self.final_point
    }

    /// Bar spawning beyond this point (`hold after cycle point`)
    pub fn set_hold_point(&mut self, p: Option<CyclePoint>) {
        self.hold_point = p;
    }

    /// Refuse spawns beyond this point (`stop after cycle point`)
    pub fn set_stop_point(&mut self, p: Option<CyclePoint>) {
        self.stop_point = p;
    }

    pub fn stop_point(&self) -> Option<CyclePoint> {
        self.stop_point
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn get(&self, id: &TaskId) -> Option<&TaskInstance> {
        let point = CyclePoint::parse(&id.point, self.initial.mode()).ok()?;
        self.instances.get(&(point, id.name.clone()))
    }

    pub fn get_mut(&mut self, id: &TaskId) -> Option<&mut TaskInstance> {
        let point = CyclePoint::parse(&id.point, self.initial.mode()).ok()?;
        self.instances.get_mut(&(point, id.name.clone()))
    }

    pub fn contains(&self, name: &str, point: &CyclePoint) -> bool {
        self.instances.contains_key(&(*point, name.to_string()))
    }

    pub fn values(&self) -> impl Iterator<Item = &TaskInstance> {
        self.instances.values()
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut TaskInstance> {
        self.instances.values_mut()
    }

    /// Instances currently preparing, submitted, or running
    pub fn active_count(&self) -> usize {
        self.instances
            .values()
            .filter(|i| i.state == TaskState::Preparing || i.state.is_active())
            .count()
    }

    /// Spawn (name, point) if in bounds and not already present
    pub fn spawn(
        &mut self,
        name: &str,
        point: &CyclePoint,
        registry: &TaskRegistry,
        graph: &WorkflowGraph,
    ) -> SpawnOutcome {
        if self.contains(name, point) {
            return SpawnOutcome::AlreadyPresent;
        }
        if let Some(fin) = self.final_point {
            if *point > fin {
                return SpawnOutcome::OutOfBounds;
            }
        }
        if let Some(stop) = self.stop_point {
            if *point > stop {
                debug!(name, point = %point.format(), "Refusing spawn beyond stop point");
                return SpawnOutcome::OutOfBounds;
            }
        }
        if !graph.task_at(name, point) {
            return SpawnOutcome::OutOfBounds;
        }
        let Some(def) = registry.get(name) else {
            warn!(name, "Spawn requested for unregistered task");
            return SpawnOutcome::OutOfBounds;
        };

        let inst = self.build_instance(name, point, def.clone(), graph);
        debug!(id = %inst.id(), "Spawned task instance");
        self.instances.insert((*point, name.to_string()), inst);
        SpawnOutcome::Spawned
    }

    fn build_instance(
        &mut self,
        name: &str,
        point: &CyclePoint,
        def: std::sync::Arc<TaskDef>,
        graph: &WorkflowGraph,
    ) -> TaskInstance {
        let (prereq_exprs, suicide_exprs) = graph.prerequisites_for(name, point);
        let prereqs = prereq_exprs
            .iter()
            .map(|e| Prerequisite::bind(e, point, &self.initial))
            .collect();
        let suicides = suicide_exprs
            .iter()
            .map(|e| Prerequisite::bind(e, point, &self.initial))
            .collect();

        let mut inst = TaskInstance::new(name, *point, def.clone(), prereqs, suicides);

        // Xtriggers: graph `@` conjuncts plus the special-task declarations
        for xt_name in graph.xtriggers_for(name, point) {
            match self.xtrigger_defs.get(&xt_name).cloned() {
                Some(spec) => {
                    let sig = spec.signature(point);
                    self.sig_meta.insert(sig.clone(), (xt_name, spec, *point));
                    if !self.satisfied_xtriggers.contains(&sig) {
                        inst.xtriggers.insert(sig);
                    }
                }
                None => warn!(name = %xt_name, "Graph references undeclared xtrigger"),
            }
        }
        if let Some(offset) = def.clock_trigger {
            let spec = XtriggerSpec::WallClock { offset };
            let sig = spec.signature(point);
            self.sig_meta.insert(sig.clone(), ("wall_clock".to_string(), spec, *point));
            if !self.satisfied_xtriggers.contains(&sig) {
                inst.xtriggers.insert(sig);
            }
        }
        if let Some(id) = &def.external_trigger {
            let spec = XtriggerSpec::ExtTrigger { id: id.clone() };
            let sig = spec.signature(point);
            self.sig_meta.insert(sig.clone(), (id.clone(), spec, *point));
            if !self.satisfied_xtriggers.contains(&sig) {
                inst.xtriggers.insert(sig);
            }
        }

        if let Some(hold) = self.hold_point {
            if *point > hold {
                inst.is_held = true;
            }
        }
        inst
    }

    /// Oldest point with an incomplete instance (not succeeded/expired)
    pub fn runahead_base(&self) -> Option<CyclePoint> {
        self.instances
            .values()
            .filter(|i| !matches!(i.state, TaskState::Succeeded | TaskState::Expired))
            .map(|i| i.point)
            .min()
            .or_else(|| self.instances.keys().map(|(p, _)| *p).min())
    }

    /// Leading edge allowed by the runahead limit
    pub fn runahead_limit_point(&self) -> Option<CyclePoint> {
        let base = self.runahead_base()?;
        base.add(&self.runahead).ok()
    }

    /// Waiting instances ready to become `preparing`, oldest first, bounded
    /// by the default queue limit
    pub fn eligible(&self, now: DateTime<Utc>) -> Vec<TaskId> {
        let limit_point = self.runahead_limit_point();
        let mut slots = if self.queue_limit > 0 {
            self.queue_limit.saturating_sub(self.active_count())
        } else {
            usize::MAX
        };

        let mut out = Vec::new();
        for inst in self.instances.values() {
            if slots == 0 {
                break;
            }
            if !self.ready_ignoring_queue(inst, now, limit_point) {
                continue;
            }
            out.push(inst.id());
            if slots != usize::MAX {
                slots -= 1;
            }
        }
        out
    }

    fn ready_ignoring_queue(&self, inst: &TaskInstance, now: DateTime<Utc>, limit_point: Option<CyclePoint>) -> bool {
        if inst.state != TaskState::Waiting || inst.is_held {
            return false;
        }
        if !inst.is_manual {
            if let Some(limit) = limit_point {
                if inst.point > limit {
                    return false;
                }
            }
        }
        inst.prereqs_satisfied(now)
    }

    /// Spawn parentless tasks up to one point beyond the runahead edge
    pub fn spawn_parentless(
        &mut self,
        graph: &WorkflowGraph,
        registry: &TaskRegistry,
        already_done: &dyn Fn(&str, &str) -> bool,
    ) -> Vec<TaskId> {
        let limit = self
            .runahead_limit_point()
            .or_else(|| self.initial.add(&self.runahead).ok());
        let mut spawned = Vec::new();

        for name in graph.tasks().clone() {
            let mut point = match self.parentless_next.get(&name) {
                Some(p) => *p,
                None => match graph.first_point(&name, &self.initial) {
                    Some(p) => p,
                    None => continue,
                },
            };
            let mut beyond_limit = 0;
            loop {
                if let Some(fin) = self.final_point {
                    if point > fin {
                        break;
                    }
                }
                if let Some(stop) = self.stop_point {
                    if point > stop {
                        break;
                    }
                }
                if let Some(limit) = limit {
                    if point > limit {
                        beyond_limit += 1;
                        // One point ahead of the edge keeps xtrigger
                        // evaluation unblocked
                        if beyond_limit > 1 {
                            break;
                        }
                    }
                }
                if self.spawnable_unaided(&name, &point, graph)
                    && !self.contains(&name, &point)
                    && !already_done(&name, &point.format())
                    && self.spawn(&name, &point, registry, graph) == SpawnOutcome::Spawned
                {
                    spawned.push(TaskId::new(name.clone(), &point));
                }
                point = match graph.next_point(&name, &point) {
                    Some(p) => p,
                    None => break,
                };
            }
            self.parentless_next.insert(name.clone(), point);
        }
        spawned
    }

    /// An instance needs no upstream help when it has no dependency edges,
    /// or when every trigger condition refers to a pre-initial point
    /// (inter-cycle edges are cycles in the template, not the instance
    /// graph)
    fn spawnable_unaided(&self, name: &str, point: &CyclePoint, graph: &WorkflowGraph) -> bool {
        if graph.is_parentless(name, point) {
            return true;
        }
        let (prereqs, _) = graph.prerequisites_for(name, point);
        !prereqs.is_empty()
            && prereqs
                .iter()
                .all(|expr| Prerequisite::bind(expr, point, &self.initial).is_satisfied())
    }

    /// Remove one instance (suicide, `remove` command)
    pub fn remove(&mut self, id: &TaskId) -> Option<TaskInstance> {
        let key = self
            .instances
            .keys()
            .find(|(p, n)| n == &id.name && p.format() == id.point)
            .cloned()?;
        self.instances.remove(&key)
    }

    /// Drop completed instances whose downstream children have all been
    /// spawned; returns the housekept ids
    pub fn housekeep(&mut self, graph: &WorkflowGraph) -> Vec<TaskId> {
        let removable: Vec<(CyclePoint, String)> = self
            .instances
            .values()
            .filter(|inst| self.is_housekeepable(inst, graph))
            .map(|inst| (inst.point, inst.name.clone()))
            .collect();
        let mut out = Vec::new();
        for key in removable {
            if let Some(inst) = self.instances.remove(&key) {
                debug!(id = %inst.id(), "Housekept completed instance");
                out.push(inst.id());
            }
        }
        out
    }

    fn is_housekeepable(&self, inst: &TaskInstance, graph: &WorkflowGraph) -> bool {
        if !matches!(inst.state, TaskState::Succeeded | TaskState::Expired) {
            return false;
        }
        for output in &inst.outputs {
            for (child, child_point) in graph.children_of(&inst.name, &inst.point, output) {
                if let Some(fin) = self.final_point {
                    if child_point > fin {
                        continue;
                    }
                }
                if let Some(stop) = self.stop_point {
                    if child_point > stop {
                        continue;
                    }
                }
                let child_id = TaskId::new(child, &child_point);
                if !inst.spawned.contains(&child_id) {
                    return false;
                }
            }
        }
        true
    }

    /// Hold instances matching an id glob (`name.point` form)
    pub fn hold_matching(&mut self, pattern: &glob::Pattern) -> Vec<TaskId> {
        let mut out = Vec::new();
        for inst in self.instances.values_mut() {
            if pattern.matches(&inst.id().to_string()) && !inst.is_held {
                inst.is_held = true;
                out.push(inst.id());
            }
        }
        out
    }

    /// Release held instances matching an id glob
    pub fn release_matching(&mut self, pattern: &glob::Pattern) -> Vec<TaskId> {
        let mut out = Vec::new();
        for inst in self.instances.values_mut() {
            if pattern.matches(&inst.id().to_string()) && inst.is_held {
                inst.is_held = false;
                out.push(inst.id());
            }
        }
        out
    }

    /// Record an xtrigger signature as satisfied workflow-wide
    pub fn mark_xtrigger_satisfied(&mut self, signature: &str) {
        self.satisfied_xtriggers.insert(signature.to_string());
    }

    /// Whether the signature has already fired
    pub fn xtrigger_satisfied(&self, signature: &str) -> bool {
        self.satisfied_xtriggers.contains(signature)
    }

    /// Outstanding xtrigger signatures across all instances
    pub fn outstanding_xtriggers(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        for inst in self.instances.values() {
            for sig in &inst.xtriggers {
                out.insert(sig.clone());
            }
        }
        out
    }

    /// Declared xtrigger spec by name
    pub fn xtrigger_def(&self, name: &str) -> Option<&XtriggerSpec> {
        self.xtrigger_defs.get(name)
    }

    /// Evaluation metadata for a signature: (label, spec, subscriber point)
    pub fn xtrigger_meta(&self, signature: &str) -> Option<&(String, XtriggerSpec, CyclePoint)> {
        self.sig_meta.get(signature)
    }

    /// Stalled: non-empty, nothing active or eligible, nothing pending
    pub fn is_stalled(&self, now: DateTime<Utc>) -> bool {
        if self.instances.is_empty() {
            return false;
        }
        let limit_point = self.runahead_limit_point();
        for inst in self.instances.values() {
            if inst.state == TaskState::Preparing || inst.state.is_active() {
                return false;
            }
            if inst.is_held {
                // Operator intervention in progress
                return false;
            }
            if inst.retry_pending(now) {
                return false;
            }
            if inst.state == TaskState::Waiting && !inst.xtriggers.is_empty() {
                return false;
            }
            if self.ready_ignoring_queue(inst, now, limit_point) {
                return false;
            }
        }
        true
    }

    /// Checkpoint rows for the `task_pool` table
    pub fn checkpoint_rows(&self) -> Vec<cyclestore::PoolRow> {
        self.instances
            .values()
            .map(|inst| {
                let mut prereqs = BTreeMap::new();
                for p in &inst.prereqs {
                    prereqs.extend(p.snapshot());
                }
                let mut suicides = BTreeMap::new();
                for p in &inst.suicides {
                    suicides.extend(p.snapshot());
                }
                let snapshot = InstanceSnapshot {
                    prereqs,
                    suicides,
                    try_num: inst.try_num,
                    sub_try_num: inst.sub_try_num,
                    submit_num: inst.submit_num,
                    retry_at: inst.retry_at.map(|t| t.to_rfc3339()),
                    is_manual: inst.is_manual,
                };
                cyclestore::PoolRow {
                    cycle: inst.point.format(),
                    name: inst.name.clone(),
                    status: inst.state.to_string(),
                    is_held: inst.is_held,
                    satisfied: serde_json::to_string(&snapshot).unwrap_or_else(|_| "{}".to_string()),
                    outputs: serde_json::to_string(&inst.outputs).unwrap_or_else(|_| "[]".to_string()),
                }
            })
            .collect()
    }

    /// Rebuild one instance from its checkpoint row
    pub fn restore(
        &mut self,
        row: &cyclestore::PoolRow,
        registry: &TaskRegistry,
        graph: &WorkflowGraph,
    ) -> eyre::Result<()> {
        let point = CyclePoint::parse(&row.cycle, self.initial.mode())?;
        let Some(def) = registry.get(&row.name) else {
            warn!(name = %row.name, "Checkpointed task is no longer defined; dropping");
            return Ok(());
        };

        let mut inst = self.build_instance(&row.name, &point, def.clone(), graph);
        inst.state = TaskState::parse(&row.status)
            .ok_or_else(|| eyre::eyre!("unknown state {} in task_pool", row.status))?;
        inst.is_held = row.is_held;

        let snapshot: InstanceSnapshot = serde_json::from_str(&row.satisfied).unwrap_or_default();
        for p in inst.prereqs.iter_mut() {
            p.restore(&snapshot.prereqs);
        }
        for p in inst.suicides.iter_mut() {
            p.restore(&snapshot.suicides);
        }
        inst.try_num = snapshot.try_num.max(1);
        inst.sub_try_num = snapshot.sub_try_num.max(1);
        inst.submit_num = snapshot.submit_num;
        inst.is_manual = snapshot.is_manual;
        inst.retry_at = snapshot
            .retry_at
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc));

        let outputs: BTreeSet<String> = serde_json::from_str(&row.outputs).unwrap_or_default();
        inst.outputs = outputs;

        self.instances.insert((point, row.name.clone()), inst);
        Ok(())
    }
}
