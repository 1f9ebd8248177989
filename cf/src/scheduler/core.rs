//! Scheduler main loop
//!
//! All state mutation - pool, resolver, registry, broadcasts, DB writes -
//! happens on this one task. Suspension points are explicit: the command
//! channel, the job event channel, the handler completion channel, and the
//! tick interval. Subprocess work (submission, polling, kill, handlers)
//! runs on spawned tasks whose completions come back as events.
//!
//! Ordering: every tick first applies inbound changes, then resolves
//! eligibility, then flushes the database batch, and only then executes
//! outbound effects (dispatch, polls, handler commands). A crash before
//! dispatch merely delays an effect, never loses the state that caused it.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use cyclestore::{Store, TaskEventRow, TaskJobRow, XtriggerRow};
use eyre::{Context as _, Result};
use rand::distr::{Alphanumeric, SampleString};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::broadcast::BroadcastEngine;
use crate::config::WorkflowConfig;
use crate::cycling::RecurrenceContext;
use crate::graph::WorkflowGraph;
use crate::handlers::{HandlerContext, HandlerDone, HandlerEngine};
use crate::job::runner::{runner_for, JobRunner};
use crate::job::script::{write_job_script, JobContext};
use crate::job::submit::{dispatch_group, group_by_target, PreparedJob};
use crate::job::{JobEvent, JobSpec, PollOutcome, SubmitOutcome};
use crate::pool::{resolver, TaskPool};
use crate::rundir::{ContactInfo, RunDir};
use crate::server::{CommandRequest, Server, StopMode};
use crate::task::{JobRef, TaskDef, TaskId, TaskInstance, TaskRegistry, TaskState};
use crate::xtrigger::{self, XtriggerSpec};

/// Why the main loop ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Every instance completed and the pool drained
    Complete,
    /// A stop command was applied
    Stopped,
    /// An abort-on-timeout or failing handler escalated
    Aborted(String),
    /// Persistence failure; a final checkpoint was attempted
    Fatal(String),
}

/// Deferred outbound work, executed after the tick's DB flush
enum Effect {
    Dispatch(Vec<PreparedJob>),
    Poll { spec: JobSpec, runner: Arc<dyn JobRunner> },
    Kill { spec: JobSpec, runner: Arc<dyn JobRunner> },
    TaskHandlers { def: Arc<TaskDef>, id: TaskId, event: String, message: String },
    WorkflowHandlers { templates: Vec<String>, event: String, message: String },
}

pub struct Scheduler {
    pub(crate) workflow_id: String,
    pub(crate) config: WorkflowConfig,
    pub(crate) registry: TaskRegistry,
    pub(crate) graph: WorkflowGraph,
    pub(crate) pool: TaskPool,
    pub(crate) broadcasts: BroadcastEngine,
    pub(crate) store: Store,
    pub(crate) rundir: RunDir,
    handlers: HandlerEngine,

    cmd_rx: mpsc::Receiver<CommandRequest>,
    job_tx: mpsc::Sender<JobEvent>,
    job_rx: mpsc::Receiver<JobEvent>,
    handler_done_rx: mpsc::Receiver<HandlerDone>,

    // Writes accumulated during a tick, flushed in one transaction
    pub(crate) dirty_states: BTreeSet<TaskId>,
    pub(crate) pending_events: Vec<TaskEventRow>,
    pub(crate) pending_jobs: Vec<TaskJobRow>,
    pub(crate) pending_outputs: BTreeSet<TaskId>,
    pub(crate) pending_broadcasts: Vec<cyclestore::BroadcastEventRow>,
    pub(crate) pending_params: Vec<(String, Option<String>)>,
    pending_xtriggers: Vec<XtriggerRow>,
    pub(crate) pool_dirty: bool,

    effects: Vec<Effect>,

    started_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    stall_since: Option<DateTime<Utc>>,
    inactivity_fired: bool,
    timeout_fired: bool,
    in_flight_submissions: usize,

    pub(crate) stop: Option<StopMode>,
    pub(crate) stop_clock: Option<DateTime<Utc>>,
    shutdown: Option<ShutdownReason>,
}

impl Scheduler {
    /// Build a scheduler for an already-prepared run directory. Returns the
    /// scheduler and the sender the command server feeds.
    pub fn new(
        workflow_id: &str,
        rundir: RunDir,
        config: WorkflowConfig,
    ) -> Result<(Self, mpsc::Sender<CommandRequest>)> {
        let registry_and_graph = build_model(&config)?;
        let (registry, graph) = registry_and_graph;

        let mut xtrigger_defs = BTreeMap::new();
        for (name, expr) in &config.scheduling.xtriggers {
            xtrigger_defs.insert(
                name.clone(),
                XtriggerSpec::parse(expr).with_context(|| format!("xtrigger {}", name))?,
            );
        }

        let mut pool = TaskPool::new(
            config.initial_point()?,
            config.final_point()?,
            config.runahead_limit()?,
            config.queue_limit(),
            xtrigger_defs,
        );
        if let Some(raw) = config.scheduling.hold_after_cycle_point.as_deref() {
            pool.set_hold_point(Some(config.parse_point(raw)?));
        }
        if let Some(raw) = config.scheduling.stop_after_cycle_point.as_deref() {
            pool.set_stop_point(Some(config.parse_point(raw)?));
        }

        let store = Store::open(rundir.db())?;

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (job_tx, job_rx) = mpsc::channel(256);
        let (handler_tx, handler_done_rx) = mpsc::channel(64);
        let handlers = HandlerEngine::new(workflow_id, config.scheduler.max_active_handlers, handler_tx);

        let now = Utc::now();
        let scheduler = Self {
            workflow_id: workflow_id.to_string(),
            config,
            registry,
            graph,
            pool,
            broadcasts: BroadcastEngine::new(),
            store,
            rundir,
            handlers,
            cmd_rx,
            job_tx,
            job_rx,
            handler_done_rx,
            dirty_states: BTreeSet::new(),
            pending_events: Vec::new(),
            pending_jobs: Vec::new(),
            pending_outputs: BTreeSet::new(),
            pending_broadcasts: Vec::new(),
            pending_params: Vec::new(),
            pending_xtriggers: Vec::new(),
            pool_dirty: false,
            effects: Vec::new(),
            started_at: now,
            last_activity: now,
            stall_since: None,
            inactivity_fired: false,
            timeout_fired: false,
            in_flight_submissions: 0,
            stop: None,
            stop_clock: None,
            shutdown: None,
        };
        Ok((scheduler, cmd_tx))
    }

    /// Load state from the workflow DB after a restart
    pub fn load_restart(&mut self) -> Result<()> {
        info!("Restarting from the workflow database");

        for row in self.store.load_xtriggers()? {
            self.pool.mark_xtrigger_satisfied(&row.signature);
        }
        let journal = self.store.load_broadcast_events()?;
        self.broadcasts.replay(&journal);

        let params = self.store.load_workflow_params()?;
        if let Some(raw) = params.get("stop_after_point") {
            if let Ok(p) = self.config.parse_point(raw) {
                self.pool.set_stop_point(Some(p));
            }
        }
        if let Some(raw) = params.get("stop_at_clock") {
            self.stop_clock = DateTime::parse_from_rfc3339(raw).ok().map(|t| t.with_timezone(&Utc));
        }

        let rows = self.store.load_task_pool()?;
        for row in &rows {
            self.pool.restore(row, &self.registry, &self.graph)?;
        }

        // Replay recorded outputs so downstream instances spawned and
        // satisfied in a previous life (or housekept before this restart)
        // are reconstructed
        let recorded = self.store.load_all_task_outputs()?;
        for (cycle, name, outputs_json) in recorded {
            let Ok(point) = self.config.parse_point(&cycle) else { continue };
            let outputs: Vec<String> = serde_json::from_str(&outputs_json).unwrap_or_default();
            for output in outputs {
                let store = &self.store;
                let done = |name: &str, point: &str| instance_finished(store, name, point);
                resolver::apply_output(&mut self.pool, &self.graph, &self.registry, &name, &point, &output, &done);
            }
        }

        // Reconcile outstanding jobs: rebuild identities and poll at once
        let jobs = self.store.load_latest_task_jobs()?;
        let now = Utc::now();
        let mut to_poll = Vec::new();
        for inst in self.pool.values_mut() {
            match inst.state {
                TaskState::Preparing => {
                    // Submission was never confirmed; safe to go again
                    inst.state = TaskState::Waiting;
                }
                TaskState::Submitted | TaskState::Running => {
                    let job_row = jobs
                        .iter()
                        .find(|j| j.name == inst.name && j.cycle == inst.point.format());
                    if let Some(row) = job_row {
                        inst.submit_num = row.submit_num;
                        inst.try_num = row.try_num;
                        inst.job = Some(JobRef {
                            runner_name: row.job_runner_name.clone(),
                            host: row.platform_name.clone(),
                            job_id: row.job_id.clone(),
                            status_path: None,
                        });
                        inst.poll_schedule = inst.captured.execution_polling_intervals().into();
                        inst.next_poll_at = Some(now);
                        to_poll.push(inst.id());
                    } else {
                        warn!(id = %inst.id(), "Active instance with no job row; back to waiting");
                        inst.state = TaskState::Waiting;
                    }
                }
                _ => {}
            }
        }
        info!(instances = rows.len(), polls = to_poll.len(), "Restart state loaded");
        for id in to_poll {
            self.request_poll(&id);
        }
        self.pool_dirty = true;
        Ok(())
    }

    /// Run the main loop to completion
    pub async fn run(mut self) -> Result<ShutdownReason> {
        self.record_workflow_params();
        self.fire_workflow_event("startup", "workflow started");

        let mut tick = tokio::time::interval(self.config.tick_interval());
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let reason = loop {
            tokio::select! {
                Some((command, reply)) = self.cmd_rx.recv() => {
                    let response = self.apply_command(command);
                    let _ = reply.send(response);
                }
                Some(event) = self.job_rx.recv() => self.handle_job_event(event),
                Some(done) = self.handler_done_rx.recv() => self.handle_handler_done(done),
                _ = tick.tick() => {}
            }

            if let Err(e) = self.tick() {
                // Nothing short of a persistence error unwinds the loop
                error!(error = %format!("{:#}", e), "Persistence failure; stopping");
                break ShutdownReason::Fatal(format!("{:#}", e));
            }
            if let Some(reason) = self.shutdown.clone() {
                break reason;
            }
        };

        self.finish(&reason);
        Ok(reason)
    }

    /// One pass of the cooperative loop body
    fn tick(&mut self) -> Result<()> {
        let now = Utc::now();

        self.check_stop_timers(now);
        self.expire_overdue_instances(now);
        self.evaluate_xtriggers(now);
        self.spawn_parentless();
        if self.stop.is_none() {
            self.prepare_eligible(now);
        }
        self.poll_due_jobs(now);
        self.check_job_timeouts(now);
        self.check_workflow_timers(now);

        let housekept = self.pool.housekeep(&self.graph);
        if !housekept.is_empty() {
            self.pool_dirty = true;
        }

        self.check_completion();
        self.flush().context("workflow database flush failed")?;
        self.run_effects();
        Ok(())
    }

    // === tick stages ===

    fn check_stop_timers(&mut self, now: DateTime<Utc>) {
        if let Some(at) = self.stop_clock {
            if now >= at && self.stop.is_none() {
                info!("Stop clock time reached");
                self.stop = Some(StopMode::Clean);
                self.pending_params.push(("stop_at_clock".to_string(), None));
            }
        }
    }

    fn expire_overdue_instances(&mut self, now: DateTime<Utc>) {
        let overdue: Vec<TaskId> = self
            .pool
            .values()
            .filter(|inst| inst.state == TaskState::Waiting && !inst.is_manual)
            .filter(|inst| {
                inst.captured
                    .clock_expire
                    .as_ref()
                    .map(|offset| xtrigger::clock_passed(&inst.point, offset, now))
                    .unwrap_or(false)
            })
            .map(TaskInstance::id)
            .collect();
        for id in overdue {
            info!(id = %id, "Instance expired");
            self.apply_state(&id, TaskState::Expired, Some(("expired", "clock-expire offset passed")));
        }
    }

    fn evaluate_xtriggers(&mut self, now: DateTime<Utc>) {
        let outstanding = self.pool.outstanding_xtriggers();
        for sig in outstanding {
            let Some((label, spec, point)) = self.pool.xtrigger_meta(&sig).cloned() else {
                continue;
            };
            let fired = match &spec {
                XtriggerSpec::WallClock { .. } => spec.is_clock_satisfied(&point, now),
                XtriggerSpec::ExtTrigger { .. } => false,
                XtriggerSpec::WorkflowState {
                    workflow,
                    task,
                    point: target,
                    status,
                } => {
                    let target = target.replace("%(point)s", &point.format());
                    xtrigger::check_workflow_state(&crate::rundir::run_root(), workflow, task, &target, status)
                        .unwrap_or(false)
                }
            };
            if fired {
                self.satisfy_xtrigger(&sig, &label, &spec);
            }
        }
    }

    pub(crate) fn satisfy_xtrigger(&mut self, signature: &str, label: &str, spec: &XtriggerSpec) {
        info!(signature, "Xtrigger satisfied");
        let satisfied = resolver::apply_xtrigger(&mut self.pool, signature, Some(spec), label);
        if !satisfied.is_empty() {
            self.pool_dirty = true;
            self.touch();
        }
        let env = xtrigger::result_env(spec, label);
        self.pending_xtriggers.push(XtriggerRow {
            signature: signature.to_string(),
            results: serde_json::to_string(&env).unwrap_or_else(|_| "{}".to_string()),
        });
    }

    fn spawn_parentless(&mut self) {
        let store = &self.store;
        let graph = &self.graph;
        let registry = &self.registry;
        let done = |name: &str, point: &str| instance_finished(store, name, point);
        let spawned = self.pool.spawn_parentless(graph, registry, &done);
        if !spawned.is_empty() {
            debug!(count = spawned.len(), "Parentless instances spawned");
            self.pool_dirty = true;
            self.dirty_states.extend(spawned);
        }
    }

    fn prepare_eligible(&mut self, now: DateTime<Utc>) {
        let eligible = self.pool.eligible(now);
        if eligible.is_empty() {
            return;
        }
        let mut prepared = Vec::new();

        for id in eligible {
            let lineage = self
                .registry
                .families()
                .linearization(&id.name)
                .unwrap_or_else(|_| vec![id.name.clone(), "root".to_string()]);
            let Some(inst) = self.pool.get_mut(&id) else { continue };
            if !inst.transition(TaskState::Preparing) {
                continue;
            }

            // Capture the effective settings: merged definition overlaid
            // with broadcasts; reload will not touch these
            let effective = self.broadcasts.apply(&inst.captured.runtime, &id.point, &lineage);
            inst.captured = Arc::new(TaskDef {
                name: inst.captured.name.clone(),
                runtime: effective,
                clock_trigger: inst.captured.clock_trigger,
                clock_expire: inst.captured.clock_expire,
                external_trigger: inst.captured.external_trigger.clone(),
            });
            inst.begin_submission(now);

            let def = inst.captured.clone();
            let Some(runner) = runner_for(def.runner_name()) else {
                let msg = format!("unknown job runner {}", def.runner_name());
                self.on_submission_failed(&id, &msg, false);
                continue;
            };

            let directives_header = runner.parse_directives(&def.runtime.directives);
            let job_ctx = JobContext {
                workflow_id: &self.workflow_id,
                id: &id,
                submit_num: inst.submit_num,
                try_num: inst.try_num,
                runtime: &def.runtime,
                xtrigger_env: &inst.xtrigger_env,
                runner_name: runner.name(),
                directives_header: &directives_header,
            };
            let spec = match write_job_script(&self.rundir, &job_ctx) {
                Ok(spec) => spec,
                Err(e) => {
                    let msg = format!("job script generation failed: {:#}", e);
                    self.on_submission_failed(&id, &msg, false);
                    continue;
                }
            };

            self.pending_jobs.push(TaskJobRow {
                cycle: id.point.clone(),
                name: id.name.clone(),
                submit_num: spec.submit_num,
                try_num: self.pool.get(&id).map(|i| i.try_num).unwrap_or(1),
                is_manual_submit: self.pool.get(&id).map(|i| i.is_manual).unwrap_or(false),
                submit_status: None,
                time_submit: Some(cyclestore::now_iso()),
                platform_name: spec.host.clone(),
                job_runner_name: runner.name().to_string(),
                job_id: None,
                ..Default::default()
            });
            self.dirty_states.insert(id.clone());
            self.pool_dirty = true;
            prepared.push(PreparedJob { spec, runner });
        }

        if !prepared.is_empty() {
            self.in_flight_submissions += prepared.len();
            for group in group_by_target(prepared) {
                self.effects.push(Effect::Dispatch(group));
            }
        }
    }

    fn poll_due_jobs(&mut self, now: DateTime<Utc>) {
        let due: Vec<TaskId> = self
            .pool
            .values()
            .filter(|inst| inst.state.is_active())
            .filter(|inst| inst.next_poll_at.map(|at| now >= at).unwrap_or(false))
            .map(TaskInstance::id)
            .collect();
        for id in due {
            if let Some(inst) = self.pool.get_mut(&id) {
                inst.schedule_next_poll(now);
            }
            self.request_poll(&id);
        }
    }

    pub(crate) fn request_poll(&mut self, id: &TaskId) {
        let Some(inst) = self.pool.get(id) else { return };
        let Some((spec, runner)) = self.job_spec_of(inst) else {
            warn!(id = %id, "Cannot poll: no job identity");
            return;
        };
        self.rundir
            .log_job_activity(&id.point, &id.name, spec.submit_num, "poll requested");
        self.effects.push(Effect::Poll { spec, runner });
    }

    pub(crate) fn request_kill(&mut self, id: &TaskId) -> bool {
        let Some(inst) = self.pool.get(id) else { return false };
        if !inst.state.is_active() {
            return false;
        }
        let Some((spec, runner)) = self.job_spec_of(inst) else { return false };
        self.rundir
            .log_job_activity(&id.point, &id.name, spec.submit_num, "kill requested");
        self.effects.push(Effect::Kill { spec, runner });
        true
    }

    fn job_spec_of(&self, inst: &TaskInstance) -> Option<(JobSpec, Arc<dyn JobRunner>)> {
        let job = inst.job.as_ref()?;
        let runner = runner_for(&job.runner_name)?;
        let point = inst.point.format();
        let spec = JobSpec {
            id: inst.id(),
            submit_num: inst.submit_num,
            host: job.host.clone(),
            script_path: self.rundir.job_script(&point, &inst.name, inst.submit_num),
            job_dir: self.rundir.job_dir(&point, &inst.name, inst.submit_num),
            status_path: self.rundir.job_status(&point, &inst.name, inst.submit_num),
            out_path: self.rundir.job_out(&point, &inst.name, inst.submit_num),
            err_path: self.rundir.job_err(&point, &inst.name, inst.submit_num),
            job_id: job.job_id.clone(),
        };
        Some((spec, runner))
    }

    fn check_job_timeouts(&mut self, now: DateTime<Utc>) {
        let submit_overdue: Vec<TaskId> = self
            .pool
            .values()
            .filter(|i| i.state == TaskState::Submitted)
            .filter(|i| i.submit_timeout_at.map(|at| now >= at).unwrap_or(false))
            .map(TaskInstance::id)
            .collect();
        for id in submit_overdue {
            warn!(id = %id, "Submission timeout");
            if let Some(inst) = self.pool.get_mut(&id) {
                inst.submit_timeout_at = None;
            }
            self.record_task_event(&id, "submission timeout", "no started message in time");
            self.fire_task_handlers(&id, "submission timeout", "no started message in time");
            self.request_poll(&id);
        }

        let exec_overdue: Vec<TaskId> = self
            .pool
            .values()
            .filter(|i| i.state == TaskState::Running)
            .filter(|i| i.execution_timeout_at.map(|at| now >= at).unwrap_or(false))
            .map(TaskInstance::id)
            .collect();
        for id in exec_overdue {
            warn!(id = %id, "Execution timeout");
            if let Some(inst) = self.pool.get_mut(&id) {
                inst.execution_timeout_at = None;
            }
            self.record_task_event(&id, "execution timeout", "job overran");
            self.fire_task_handlers(&id, "execution timeout", "job overran");
            self.request_poll(&id);
        }
    }

    fn check_workflow_timers(&mut self, now: DateTime<Utc>) {
        let events = self.config.scheduler.events.clone();

        // Stall
        if self.pool.is_stalled(now) && !self.pool.is_empty() {
            if self.stall_since.is_none() {
                warn!("Workflow stalled");
                self.stall_since = Some(now);
                self.fire_workflow_event("stall", "no instance can make progress");
            }
            if let Some(since) = self.stall_since {
                if let Some(timeout) = parse_timeout(events.stall_timeout.as_deref()) {
                    if now.signed_duration_since(since).to_std().unwrap_or_default() >= timeout {
                        if events.abort_on_stall_timeout {
                            self.abort("stall timeout");
                        } else if self.stop.is_none() {
                            info!("Stall timeout reached; stopping");
                            self.stop = Some(StopMode::Clean);
                        }
                    }
                }
            }
        } else {
            self.stall_since = None;
        }

        // Inactivity
        if let Some(timeout) = parse_timeout(events.inactivity_timeout.as_deref()) {
            let idle = now.signed_duration_since(self.last_activity).to_std().unwrap_or_default();
            if idle >= timeout && !self.inactivity_fired {
                self.inactivity_fired = true;
                warn!("Inactivity timeout");
                self.fire_workflow_event("inactivity", "no activity within the timeout");
                if events.abort_on_inactivity_timeout {
                    self.abort("inactivity timeout");
                }
            }
        }

        // Overall workflow timeout
        if let Some(timeout) = parse_timeout(events.timeout.as_deref()) {
            let age = now.signed_duration_since(self.started_at).to_std().unwrap_or_default();
            if age >= timeout && !self.timeout_fired {
                self.timeout_fired = true;
                warn!("Workflow timeout");
                self.fire_workflow_event("timeout", "workflow ran past its timeout");
                if events.abort_on_timeout {
                    self.abort("workflow timeout");
                }
            }
        }
    }

    fn check_completion(&mut self) {
        if self.shutdown.is_some() {
            return;
        }
        match &self.stop {
            Some(StopMode::NowNow) => {
                self.shutdown = Some(ShutdownReason::Stopped);
            }
            Some(StopMode::Now) => {
                if self.in_flight_submissions == 0 {
                    self.shutdown = Some(ShutdownReason::Stopped);
                }
            }
            Some(StopMode::Clean) => {
                let active = self
                    .pool
                    .values()
                    .any(|i| i.state.is_active() || i.state == TaskState::Preparing);
                if !active && self.in_flight_submissions == 0 {
                    self.shutdown = Some(ShutdownReason::Stopped);
                }
            }
            _ => {
                if self.pool.is_empty() {
                    info!("Task pool drained; workflow complete");
                    self.shutdown = Some(ShutdownReason::Complete);
                }
            }
        }
    }

    // === inbound events ===

    fn handle_job_event(&mut self, event: JobEvent) {
        self.touch();
        match event {
            JobEvent::SubmitResult { id, submit_num, outcome } => {
                self.in_flight_submissions = self.in_flight_submissions.saturating_sub(1);
                // Discard callbacks for instances no longer in the pool or
                // already resubmitted
                let current = self.pool.get(&id).map(|i| i.submit_num);
                if current != Some(submit_num) {
                    debug!(id = %id, submit_num, "Discarding stale submit result");
                    return;
                }
                match outcome {
                    SubmitOutcome::Submitted { job_id } => self.on_submitted(&id, &job_id),
                    SubmitOutcome::Transient { reason } => self.on_submission_failed(&id, &reason, true),
                    SubmitOutcome::Failed { reason } => self.on_submission_failed(&id, &reason, false),
                }
            }
            JobEvent::PollResult { id, submit_num, outcome } => {
                let current = self.pool.get(&id).map(|i| i.submit_num);
                if current != Some(submit_num) {
                    debug!(id = %id, submit_num, "Discarding stale poll result");
                    return;
                }
                self.on_poll_outcome(&id, outcome);
            }
            JobEvent::KillResult { id, submit_num, ok } => {
                self.rundir
                    .log_job_activity(&id.point, &id.name, submit_num, if ok { "killed" } else { "kill failed" });
                if ok {
                    self.request_poll(&id);
                }
            }
        }
    }

    fn on_submitted(&mut self, id: &TaskId, job_id: &str) {
        let Some(inst) = self.pool.get_mut(id) else { return };
        let host = inst.captured.host().to_string();
        let runner_name = inst.captured.runner_name().to_string();
        inst.job = Some(JobRef {
            runner_name: runner_name.clone(),
            host: host.clone(),
            job_id: Some(job_id.to_string()),
            status_path: Some(self.rundir.job_status(&id.point, &id.name, inst.submit_num)),
        });
        let now = Utc::now();
        inst.schedule_next_poll(now);
        let submit_num = inst.submit_num;
        let try_num = inst.try_num;

        self.pending_jobs.push(TaskJobRow {
            cycle: id.point.clone(),
            name: id.name.clone(),
            submit_num,
            try_num,
            submit_status: Some(0),
            platform_name: host,
            job_runner_name: runner_name,
            job_id: Some(job_id.to_string()),
            ..Default::default()
        });
        self.apply_state(id, TaskState::Submitted, Some(("submitted", job_id)));
    }

    pub(crate) fn on_started(&mut self, id: &TaskId) {
        let now = Utc::now();
        let Some(inst) = self.pool.get_mut(id) else { return };
        if inst.state == TaskState::Running || inst.state.is_terminal() {
            return;
        }
        inst.begin_execution(now);
        self.pending_jobs.push(TaskJobRow {
            cycle: id.point.clone(),
            name: id.name.clone(),
            submit_num: self.pool.get(id).map(|i| i.submit_num).unwrap_or(0),
            try_num: self.pool.get(id).map(|i| i.try_num).unwrap_or(1),
            time_run: Some(cyclestore::now_iso()),
            platform_name: self.pool.get(id).map(|i| i.captured.host().to_string()).unwrap_or_default(),
            job_runner_name: self
                .pool
                .get(id)
                .map(|i| i.captured.runner_name().to_string())
                .unwrap_or_default(),
            ..Default::default()
        });
        self.apply_state(id, TaskState::Running, Some(("started", "")));
    }

    pub(crate) fn on_succeeded(&mut self, id: &TaskId) {
        let Some(inst) = self.pool.get(id) else { return };
        if inst.state.is_terminal() {
            return;
        }
        self.pending_jobs.push(TaskJobRow {
            cycle: id.point.clone(),
            name: id.name.clone(),
            submit_num: inst.submit_num,
            try_num: inst.try_num,
            time_run_exit: Some(cyclestore::now_iso()),
            run_status: Some(0),
            platform_name: inst.captured.host().to_string(),
            job_runner_name: inst.captured.runner_name().to_string(),
            ..Default::default()
        });
        self.apply_state(id, TaskState::Succeeded, Some(("succeeded", "")));
    }

    pub(crate) fn on_failed(&mut self, id: &TaskId, reason: &str) {
        let Some(inst) = self.pool.get_mut(id) else { return };
        if inst.state.is_terminal() {
            return;
        }
        let delays = inst.captured.execution_retry_delays();
        let try_num = inst.try_num as usize;
        let signal = if reason == "ERR" { None } else { Some(reason.to_string()) };

        self.pending_jobs.push(TaskJobRow {
            cycle: id.point.clone(),
            name: id.name.clone(),
            submit_num: inst.submit_num,
            try_num: inst.try_num,
            time_run_exit: Some(cyclestore::now_iso()),
            run_status: Some(1),
            run_signal: signal,
            platform_name: inst.captured.host().to_string(),
            job_runner_name: inst.captured.runner_name().to_string(),
            ..Default::default()
        });

        if try_num <= delays.len() {
            let delay = delays[try_num - 1].to_std().unwrap_or_default();
            let now = Utc::now();
            let Some(inst) = self.pool.get_mut(id) else { return };
            inst.schedule_execution_retry(delay, now);
            info!(id = %id, try_num = try_num + 1, ?delay, "Execution retry scheduled");
            self.dirty_states.insert(id.clone());
            self.pool_dirty = true;
            self.touch();
            self.record_task_event(id, "retry", reason);
            self.fire_task_handlers(id, "retry", reason);
        } else {
            self.apply_state(id, TaskState::Failed, Some(("failed", reason)));
        }
    }

    pub(crate) fn on_submission_failed(&mut self, id: &TaskId, reason: &str, transient: bool) {
        let Some(inst) = self.pool.get_mut(id) else { return };
        if inst.state.is_terminal() {
            return;
        }
        let delays = inst.captured.submission_retry_delays();
        let sub_try = inst.sub_try_num as usize;

        self.pending_jobs.push(TaskJobRow {
            cycle: id.point.clone(),
            name: id.name.clone(),
            submit_num: inst.submit_num,
            try_num: inst.try_num,
            submit_status: Some(1),
            platform_name: inst.captured.host().to_string(),
            job_runner_name: inst.captured.runner_name().to_string(),
            ..Default::default()
        });

        if sub_try <= delays.len() {
            let delay = delays[sub_try - 1].to_std().unwrap_or_default();
            let now = Utc::now();
            let Some(inst) = self.pool.get_mut(id) else { return };
            inst.schedule_submission_retry(delay, now);
            warn!(id = %id, transient, reason, "Submission retry scheduled");
            self.dirty_states.insert(id.clone());
            self.pool_dirty = true;
            self.touch();
            self.record_task_event(id, "submission retry", reason);
            self.fire_task_handlers(id, "submission retry", reason);
        } else if transient && delays.is_empty() {
            // A transient contact error with no retry policy goes once more
            // on the next tick rather than failing the instance
            let now = Utc::now();
            let Some(inst) = self.pool.get_mut(id) else { return };
            inst.schedule_submission_retry(std::time::Duration::from_secs(30), now);
            warn!(id = %id, reason, "Transient runner error; resubmitting");
            self.dirty_states.insert(id.clone());
            self.pool_dirty = true;
        } else {
            self.apply_state(id, TaskState::SubmitFailed, Some(("submission failed", reason)));
        }
    }

    fn on_poll_outcome(&mut self, id: &TaskId, outcome: PollOutcome) {
        match outcome {
            PollOutcome::Submitted | PollOutcome::Unknown => {}
            PollOutcome::Running => self.on_started(id),
            PollOutcome::Succeeded => {
                // The job may have started and finished between polls
                self.on_started(id);
                self.on_succeeded(id);
            }
            PollOutcome::Failed { reason } => {
                self.on_started(id);
                self.on_failed(id, &reason);
            }
            PollOutcome::Vanished => {
                let state = self.pool.get(id).map(|i| i.state);
                match state {
                    Some(TaskState::Submitted) => self.on_submission_failed(id, "job vanished", false),
                    Some(TaskState::Running) => self.on_failed(id, "job vanished"),
                    _ => {}
                }
            }
        }
    }

    fn handle_handler_done(&mut self, done: HandlerDone) {
        self.touch();
        if done.success {
            debug!(event = %done.event, command = %done.command, "Handler succeeded");
            return;
        }
        warn!(event = %done.event, command = %done.command, attempts = done.attempts, "Handler failed");
        if let Some(id) = &done.id {
            let abort = self
                .registry
                .get(&id.name)
                .map(|def| def.runtime.events.abort_if_handler_fails.contains(&done.event))
                .unwrap_or(false);
            if abort {
                self.abort(&format!("{} handler failed for {}", done.event, id));
            }
        }
    }

    // === shared state-change helpers ===

    /// Transition an instance, journal the event, complete the synthetic
    /// output, and fire handlers. The DB rows land before any effect runs.
    pub(crate) fn apply_state(&mut self, id: &TaskId, to: TaskState, event: Option<(&str, &str)>) {
        let Some(inst) = self.pool.get_mut(id) else { return };
        if !inst.transition(to) {
            return;
        }
        self.dirty_states.insert(id.clone());
        self.pool_dirty = true;
        self.touch();

        if let Some((event, message)) = event {
            self.record_task_event(id, event, message);
            self.fire_task_handlers(id, event, message);
        }
        if let Some(output) = TaskInstance::output_for_state(to) {
            self.complete_output(id, output);
        }
    }

    /// Record a completed output and run the resolver over the pool
    pub(crate) fn complete_output(&mut self, id: &TaskId, output: &str) {
        let Some(point) = self.pool.get(id).map(|i| i.point) else { return };
        if let Some(inst) = self.pool.get_mut(id) {
            if !inst.complete_output(output) {
                return;
            }
        }
        self.pending_outputs.insert(id.clone());
        self.pool_dirty = true;

        let store = &self.store;
        let done = |name: &str, point: &str| instance_finished(store, name, point);
        let effects = resolver::apply_output(
            &mut self.pool,
            &self.graph,
            &self.registry,
            &id.name,
            &point,
            output,
            &done,
        );
        for spawned in &effects.spawned {
            debug!(id = %spawned, "Spawned downstream instance");
            self.dirty_states.insert(spawned.clone());
        }
        for removed in effects.suicided {
            self.pending_events.push(TaskEventRow {
                name: removed.name.clone(),
                cycle: removed.point.clone(),
                time: cyclestore::now_iso(),
                submit_num: 0,
                event: "removed".to_string(),
                message: "suicide prerequisite satisfied".to_string(),
            });
        }
    }

    pub(crate) fn record_task_event(&mut self, id: &TaskId, event: &str, message: &str) {
        let submit_num = self.pool.get(id).map(|i| i.submit_num).unwrap_or(0);
        self.pending_events.push(TaskEventRow {
            name: id.name.clone(),
            cycle: id.point.clone(),
            time: cyclestore::now_iso(),
            submit_num,
            event: event.to_string(),
            message: message.to_string(),
        });
    }

    pub(crate) fn fire_task_handlers(&mut self, id: &TaskId, event: &str, message: &str) {
        let Some(inst) = self.pool.get(id) else { return };
        let def = inst.captured.clone();
        if def.handlers_for(event).is_empty() {
            return;
        }
        self.effects.push(Effect::TaskHandlers {
            def,
            id: id.clone(),
            event: event.to_string(),
            message: message.to_string(),
        });
    }

    pub(crate) fn fire_workflow_event(&mut self, event: &str, message: &str) {
        info!(event, message, "Workflow event");
        let events = &self.config.scheduler.events;
        let templates = match event {
            "startup" => &events.startup_handlers,
            "shutdown" => &events.shutdown_handlers,
            "stall" => &events.stall_handlers,
            "timeout" => &events.timeout_handlers,
            "inactivity" => &events.inactivity_handlers,
            _ => return,
        };
        if templates.is_empty() {
            return;
        }
        self.effects.push(Effect::WorkflowHandlers {
            templates: templates.clone(),
            event: event.to_string(),
            message: message.to_string(),
        });
    }

    pub(crate) fn abort(&mut self, reason: &str) {
        error!(reason, "Aborting workflow");
        if self.shutdown.is_none() {
            self.shutdown = Some(ShutdownReason::Aborted(reason.to_string()));
        }
    }

    pub(crate) fn touch(&mut self) {
        self.last_activity = Utc::now();
        self.inactivity_fired = false;
    }

    fn record_workflow_params(&mut self) {
        self.pending_params
            .push(("workflow_id".to_string(), Some(self.workflow_id.clone())));
        self.pending_params.push((
            "cycling_mode".to_string(),
            Some(self.config.mode().to_string()),
        ));
        if let Ok(p) = self.config.initial_point() {
            self.pending_params.push(("initial_point".to_string(), Some(p.format())));
        }
        if let Ok(Some(p)) = self.config.final_point() {
            self.pending_params.push(("final_point".to_string(), Some(p.format())));
        }
    }

    // === persistence ===

    fn flush(&mut self) -> Result<()> {
        let nothing_dirty = self.dirty_states.is_empty()
            && self.pending_events.is_empty()
            && self.pending_jobs.is_empty()
            && self.pending_outputs.is_empty()
            && self.pending_broadcasts.is_empty()
            && self.pending_params.is_empty()
            && self.pending_xtriggers.is_empty()
            && !self.pool_dirty;
        if nothing_dirty {
            return Ok(());
        }

        let state_rows: Vec<cyclestore::TaskStateRow> = self
            .dirty_states
            .iter()
            .filter_map(|id| self.pool.get(id))
            .map(|inst| cyclestore::TaskStateRow {
                name: inst.name.clone(),
                cycle: inst.point.format(),
                submit_num: inst.submit_num,
                status: inst.state.to_string(),
                is_held: inst.is_held,
                time_created: cyclestore::now_iso(),
                time_updated: cyclestore::now_iso(),
            })
            .collect();
        let output_rows: Vec<(String, String, String)> = self
            .pending_outputs
            .iter()
            .filter_map(|id| self.pool.get(id))
            .map(|inst| {
                (
                    inst.point.format(),
                    inst.name.clone(),
                    serde_json::to_string(&inst.outputs).unwrap_or_else(|_| "[]".to_string()),
                )
            })
            .collect();
        let pool_rows = if self.pool_dirty { Some(self.pool.checkpoint_rows()) } else { None };

        let batch = self.store.batch()?;
        for row in &state_rows {
            batch.set_task_state(row)?;
        }
        for row in &self.pending_events {
            batch.insert_task_event(row)?;
        }
        for row in &self.pending_jobs {
            batch.upsert_task_job(row)?;
        }
        for (cycle, name, outputs) in &output_rows {
            batch.set_task_outputs(cycle, name, outputs)?;
        }
        for row in &self.pending_broadcasts {
            batch.insert_broadcast_event(row)?;
        }
        for (key, value) in &self.pending_params {
            match value {
                Some(v) => batch.set_workflow_param(key, v)?,
                None => batch.delete_workflow_param(key)?,
            }
        }
        for row in &self.pending_xtriggers {
            batch.upsert_xtrigger(row)?;
        }
        if let Some(rows) = &pool_rows {
            batch.replace_task_pool(rows)?;
        }
        batch.commit()?;

        self.dirty_states.clear();
        self.pending_events.clear();
        self.pending_jobs.clear();
        self.pending_outputs.clear();
        self.pending_broadcasts.clear();
        self.pending_params.clear();
        self.pending_xtriggers.clear();

        if self.pool_dirty {
            self.pool_dirty = false;
            if let Err(e) = self.store.copy_to(self.rundir.public_db()) {
                warn!(error = %format!("{:#}", e), "Could not refresh public db copy");
            }
        }
        Ok(())
    }

    fn run_effects(&mut self) {
        let batch_size = self.config.scheduler.job_batch_size;
        let batch_delay = crate::cycling::CycleDuration::parse(&self.config.scheduler.job_batch_delay)
            .ok()
            .and_then(|d| d.to_std())
            .unwrap_or_default();

        for effect in std::mem::take(&mut self.effects) {
            match effect {
                Effect::Dispatch(group) => {
                    dispatch_group(group, batch_size, batch_delay, self.rundir.clone(), self.job_tx.clone());
                }
                Effect::Poll { spec, runner } => {
                    crate::job::poll::spawn_poll(runner, spec, self.job_tx.clone());
                }
                Effect::Kill { spec, runner } => {
                    crate::job::poll::spawn_kill(runner, spec, self.job_tx.clone());
                }
                Effect::TaskHandlers { def, id, event, message } => {
                    let ctx = HandlerContext::task(&self.workflow_id, &id, &event, &message);
                    let delays = def
                        .runtime
                        .events
                        .handler_retry_delays
                        .as_deref()
                        .and_then(|s| crate::cycling::parse_delays(s).ok())
                        .map(|ds| ds.iter().filter_map(|d| d.to_std()).collect())
                        .unwrap_or_default();
                    self.handlers.fire(def.handlers_for(&event), &ctx, delays, Some(id));
                }
                Effect::WorkflowHandlers { templates, event, message } => {
                    let ctx = HandlerContext::workflow(&self.workflow_id, &event, &message);
                    self.handlers.fire(&templates, &ctx, Vec::new(), None);
                }
            }
        }
    }

    fn finish(&mut self, reason: &ShutdownReason) {
        info!(?reason, "Shutting down");
        self.fire_workflow_event("shutdown", &format!("{:?}", reason));
        self.run_effects();
        if let Err(e) = self.flush() {
            error!(error = %format!("{:#}", e), "Final checkpoint failed");
        }
        // Always leave a readable copy behind
        if let Err(e) = self.store.copy_to(self.rundir.public_db()) {
            warn!(error = %format!("{:#}", e), "Could not write final public db copy");
        }
    }
}

/// Build the registry and graph from a validated config
pub(crate) fn build_model(config: &WorkflowConfig) -> Result<(TaskRegistry, WorkflowGraph)> {
    let mut registry = TaskRegistry::from_config(config)?;
    let ctx = RecurrenceContext {
        initial: config.initial_point()?,
        final_point: config.final_point()?,
        mode: config.mode(),
    };
    let graph = WorkflowGraph::build(&config.graph_sections(), registry.families(), registry.params(), &ctx)?;
    registry.adopt_graph_tasks(graph.tasks(), config.scheduler.allow_implicit_tasks)?;
    Ok((registry, graph))
}

/// Has this instance already finished in a previous life?
fn instance_finished(store: &Store, name: &str, point: &str) -> bool {
    store
        .get_task_state(point, name)
        .ok()
        .flatten()
        .and_then(|s| TaskState::parse(&s))
        .map(|s| s.is_terminal())
        .unwrap_or(false)
}

fn parse_timeout(raw: Option<&str>) -> Option<std::time::Duration> {
    raw.and_then(|s| crate::cycling::CycleDuration::parse(s).ok())
        .and_then(|d| d.to_std())
}

/// Start (or restart) a workflow scheduler in the foreground.
///
/// `source` is the workflow definition to install on first play; an
/// existing run directory restarts from its own `flow.yaml` and database.
pub async fn play(workflow_id: &str, source: Option<PathBuf>) -> Result<ShutdownReason> {
    let rundir = RunDir::for_workflow(workflow_id);
    rundir.ensure_layout()?;

    if let Some(src) = source {
        std::fs::copy(&src, rundir.flow_config())
            .with_context(|| format!("Failed to install workflow source {}", src.display()))?;
    }
    let config = WorkflowConfig::load(rundir.flow_config())?;

    let restarting = Store::exists(rundir.db());
    let kind = if restarting { "restart" } else { "start" };
    let snapshot = rundir.next_config_snapshot(kind)?;
    std::fs::copy(rundir.flow_config(), &snapshot).context("Failed to snapshot configuration")?;

    let token = Alphanumeric.sample_string(&mut rand::rng(), 32);
    let (server, port) = Server::bind(&token).await?;
    let contact = ContactInfo {
        host: "127.0.0.1".to_string(),
        port,
        pid: std::process::id(),
        token,
    };
    contact.write(&rundir.contact_file())?;

    let (mut scheduler, cmd_tx) = Scheduler::new(workflow_id, rundir.clone(), config)?;
    if restarting {
        scheduler.load_restart()?;
    }
    server.spawn(cmd_tx);

    info!(workflow_id, port, restarting, "Scheduler running");
    let result = scheduler.run().await;
    ContactInfo::remove(&rundir.contact_file());
    result
}
