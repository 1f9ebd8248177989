//! Command application
//!
//! Every client command and inbound task message is validated and applied
//! on the main loop; the response carries the applied effect or a typed
//! error.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::config::WorkflowConfig;
use crate::cycling::CyclePoint;
use crate::server::{BroadcastOp, Command, ErrorKind, Response, StopMode};
use crate::task::{TaskId, TaskState};
use crate::xtrigger::XtriggerSpec;

use super::core::{build_model, Scheduler};

impl Scheduler {
    /// Apply one validated command; called from the main loop only
    pub(crate) fn apply_command(&mut self, command: Command) -> Response {
        self.touch();
        match command {
            Command::Ping => Response::ok(json!({"workflow": self.workflow_id})),
            Command::Hold { ids } => self.cmd_hold(&ids, true),
            Command::Release { ids } => self.cmd_hold(&ids, false),
            Command::Trigger { ids } => self.cmd_trigger(&ids),
            Command::Set { id, outputs } => self.cmd_set(&id, &outputs),
            Command::Remove { ids } => self.cmd_remove(&ids),
            Command::Kill { ids } => self.cmd_kill(&ids),
            Command::Poll { ids } => self.cmd_poll(&ids),
            Command::Reload => self.cmd_reload(),
            Command::Stop { mode } => self.cmd_stop(mode),
            Command::Broadcast {
                op,
                points,
                namespaces,
                settings,
                keys,
                cutoff,
            } => self.cmd_broadcast(op, points, namespaces, settings, keys, cutoff),
            Command::ExtTrigger { event, point } => self.cmd_ext_trigger(&event, point.as_deref()),
            Command::Message { id, severity, messages } => self.cmd_message(&id, severity.as_deref(), &messages),
            Command::Show { id } => self.cmd_show(&id),
            Command::Dump => self.cmd_dump(),
        }
    }

    fn cmd_hold(&mut self, globs: &[String], hold: bool) -> Response {
        let mut matched = Vec::new();
        for raw in globs {
            let pattern = match glob::Pattern::new(raw) {
                Ok(p) => p,
                Err(e) => return Response::error(ErrorKind::BadRequest, format!("bad glob {:?}: {}", raw, e)),
            };
            let ids = if hold {
                self.pool.hold_matching(&pattern)
            } else {
                self.pool.release_matching(&pattern)
            };
            matched.extend(ids);
        }
        for id in &matched {
            self.dirty_states.insert(id.clone());
            self.record_task_event(id, if hold { "held" } else { "released" }, "");
        }
        if !matched.is_empty() {
            self.pool_dirty = true;
        }
        info!(count = matched.len(), hold, "Hold/release applied");
        Response::ok(json!({ "matched": matched.iter().map(ToString::to_string).collect::<Vec<_>>() }))
    }

    fn cmd_trigger(&mut self, ids: &[String]) -> Response {
        let mut triggered = Vec::new();
        for raw in ids {
            let Some(id) = TaskId::parse(raw) else {
                return Response::error(ErrorKind::BadRequest, format!("bad task id {:?}", raw));
            };
            if self.pool.get(&id).is_none() {
                // Spawn on demand for a force-trigger
                let Ok(point) = self.config.parse_point(&id.point) else {
                    return Response::error(ErrorKind::BadRequest, format!("bad cycle point {:?}", id.point));
                };
                let spawned = {
                    let registry = &self.registry;
                    let graph = &self.graph;
                    self.pool.spawn(&id.name, &point, registry, graph)
                };
                if spawned == crate::pool::SpawnOutcome::OutOfBounds {
                    return Response::error(ErrorKind::NotFound, format!("{} is not a task at {}", id.name, id.point));
                }
            }
            let Some(inst) = self.pool.get_mut(&id) else {
                return Response::error(ErrorKind::NotFound, format!("no instance {}", id));
            };
            if inst.state != TaskState::Waiting {
                return Response::error(ErrorKind::BadRequest, format!("{} is {}, not waiting", id, inst.state));
            }
            inst.is_manual = true;
            inst.is_held = false;
            inst.retry_at = None;
            warn!(id = %id, "Force-triggered regardless of prerequisites");
            self.record_task_event(&id, "triggered", "forced by operator");
            self.dirty_states.insert(id.clone());
            self.pool_dirty = true;
            triggered.push(id.to_string());
        }
        Response::ok(json!({ "triggered": triggered }))
    }

    fn cmd_set(&mut self, raw: &str, outputs: &[String]) -> Response {
        let Some(id) = TaskId::parse(raw) else {
            return Response::error(ErrorKind::BadRequest, format!("bad task id {:?}", raw));
        };
        if self.pool.get(&id).is_none() {
            return Response::error(ErrorKind::NotFound, format!("no instance {}", id));
        }
        let outputs: Vec<String> = if outputs.is_empty() {
            vec![crate::task::outputs::SUCCEEDED.to_string()]
        } else {
            outputs.to_vec()
        };
        for output in &outputs {
            info!(id = %id, output, "Output set by operator");
            self.record_task_event(&id, "output set", output);
            match output.as_str() {
                "succeeded" => self.apply_state(&id, TaskState::Succeeded, Some(("succeeded", "set by operator"))),
                "failed" => self.apply_state(&id, TaskState::Failed, Some(("failed", "set by operator"))),
                "expired" => self.apply_state(&id, TaskState::Expired, Some(("expired", "set by operator"))),
                other => self.complete_output(&id, other),
            }
        }
        Response::ok(json!({ "id": id.to_string(), "outputs": outputs }))
    }

    fn cmd_remove(&mut self, ids: &[String]) -> Response {
        let mut removed = Vec::new();
        for raw in ids {
            let Some(id) = TaskId::parse(raw) else {
                return Response::error(ErrorKind::BadRequest, format!("bad task id {:?}", raw));
            };
            if self.pool.remove(&id).is_some() {
                self.record_task_event(&id, "removed", "removed by operator");
                self.pool_dirty = true;
                removed.push(id.to_string());
            }
        }
        Response::ok(json!({ "removed": removed }))
    }

    fn cmd_kill(&mut self, ids: &[String]) -> Response {
        let mut killed = Vec::new();
        for raw in ids {
            let Some(id) = TaskId::parse(raw) else {
                return Response::error(ErrorKind::BadRequest, format!("bad task id {:?}", raw));
            };
            if self.request_kill(&id) {
                killed.push(id.to_string());
            }
        }
        Response::ok(json!({ "killed": killed }))
    }

    fn cmd_poll(&mut self, ids: &[String]) -> Response {
        let mut polled = Vec::new();
        for raw in ids {
            let Some(id) = TaskId::parse(raw) else {
                return Response::error(ErrorKind::BadRequest, format!("bad task id {:?}", raw));
            };
            if self.pool.get(&id).map(|i| i.state.is_active()).unwrap_or(false) {
                self.request_poll(&id);
                polled.push(id.to_string());
            }
        }
        Response::ok(json!({ "polled": polled }))
    }

    fn cmd_reload(&mut self) -> Response {
        info!("Reloading workflow configuration");
        let config = match WorkflowConfig::load(self.rundir.flow_config()) {
            Ok(c) => c,
            Err(e) => return Response::error(ErrorKind::BadRequest, format!("reload refused: {:#}", e)),
        };
        let (registry, graph) = match build_model(&config) {
            Ok(parts) => parts,
            Err(e) => return Response::error(ErrorKind::BadRequest, format!("reload refused: {:#}", e)),
        };

        match self.rundir.next_config_snapshot("reload") {
            Ok(snapshot) => {
                if let Err(e) = std::fs::copy(self.rundir.flow_config(), &snapshot) {
                    warn!(error = %e, "Could not snapshot reloaded configuration");
                }
            }
            Err(e) => warn!(error = %format!("{:#}", e), "Could not number config snapshot"),
        }

        // The registry swaps atomically; instances past `preparing` keep
        // their captured settings, `waiting` instances adopt the new ones
        self.config = config;
        self.registry = registry;
        self.graph = graph;
        let mut adopted = 0usize;
        for inst in self.pool.values_mut() {
            if inst.state == TaskState::Waiting {
                if let Some(def) = self.registry.get(&inst.name) {
                    inst.captured = def.clone();
                    adopted += 1;
                }
            }
        }
        self.pool_dirty = true;
        info!(adopted, "Reload applied");
        Response::ok(json!({ "adopted": adopted }))
    }

    fn cmd_stop(&mut self, mode: StopMode) -> Response {
        info!(?mode, "Stop requested");
        match &mode {
            StopMode::AtClockTime(raw) => {
                let at = match DateTime::parse_from_rfc3339(raw) {
                    Ok(t) => t.with_timezone(&Utc),
                    Err(e) => return Response::error(ErrorKind::BadRequest, format!("bad clock time {:?}: {}", raw, e)),
                };
                self.stop_clock = Some(at);
                self.pending_params
                    .push(("stop_at_clock".to_string(), Some(at.to_rfc3339())));
            }
            StopMode::AtCyclePoint(raw) => {
                let point = match self.config.parse_point(raw) {
                    Ok(p) => p,
                    Err(e) => return Response::error(ErrorKind::BadRequest, format!("bad cycle point {:?}: {:#}", raw, e)),
                };
                self.pool.set_stop_point(Some(point));
                self.pending_params
                    .push(("stop_after_point".to_string(), Some(point.format())));
            }
            mode => {
                self.stop = Some(mode.clone());
            }
        }
        Response::ok(json!({ "stopping": true }))
    }

    fn cmd_broadcast(
        &mut self,
        op: BroadcastOp,
        points: Vec<String>,
        namespaces: Vec<String>,
        settings: std::collections::BTreeMap<String, String>,
        keys: Vec<String>,
        cutoff: Option<String>,
    ) -> Response {
        let points = if points.is_empty() { vec!["*".to_string()] } else { points };
        let namespaces = if namespaces.is_empty() { vec!["root".to_string()] } else { namespaces };

        let rows = match op {
            BroadcastOp::Set => {
                if settings.is_empty() {
                    return Response::error(ErrorKind::BadRequest, "broadcast set requires settings");
                }
                self.broadcasts.set(&points, &namespaces, &settings)
            }
            BroadcastOp::Cancel => self.broadcasts.cancel(&points, &namespaces, &keys),
            BroadcastOp::Clear => self.broadcasts.cancel(&[], &[], &[]),
            BroadcastOp::Expire => {
                let Some(raw) = cutoff else {
                    return Response::error(ErrorKind::BadRequest, "broadcast expire requires a cutoff point");
                };
                let Ok(cutoff_point) = self.config.parse_point(&raw) else {
                    return Response::error(ErrorKind::BadRequest, format!("bad cutoff point {:?}", raw));
                };
                let mode = self.config.mode();
                self.broadcasts
                    .expire(&|p| CyclePoint::parse(p, mode).map(|pt| pt < cutoff_point).unwrap_or(false))
            }
        };

        let changed = rows.len();
        self.pending_broadcasts.extend(rows);
        info!(?op, changed, "Broadcast applied");
        Response::ok(json!({ "changed": changed }))
    }

    fn cmd_ext_trigger(&mut self, event: &str, point: Option<&str>) -> Response {
        let outstanding = self.pool.outstanding_xtriggers();
        let mut satisfied = Vec::new();
        for sig in outstanding {
            let Some((label, spec, sig_point)) = self.pool.xtrigger_meta(&sig).cloned() else {
                continue;
            };
            let XtriggerSpec::ExtTrigger { id } = &spec else { continue };
            if id != event {
                continue;
            }
            if let Some(p) = point {
                if sig_point.format() != p {
                    continue;
                }
            }
            self.satisfy_xtrigger(&sig, &label, &spec);
            satisfied.push(sig);
        }
        if satisfied.is_empty() {
            return Response::error(ErrorKind::NotFound, format!("no waiting external trigger {:?}", event));
        }
        Response::ok(json!({ "satisfied": satisfied }))
    }

    fn cmd_message(&mut self, raw: &str, severity: Option<&str>, messages: &[String]) -> Response {
        let Some(id) = TaskId::parse(raw) else {
            return Response::error(ErrorKind::BadRequest, format!("bad task id {:?}", raw));
        };
        let Some(inst) = self.pool.get_mut(&id) else {
            // The instance may have been housekept; a late message is
            // logged and discarded, never an error for the job
            info!(id = %raw, "Message for unknown instance discarded");
            return Response::ok(Value::Null);
        };
        let now = Utc::now();
        inst.message_received(now);
        let custom_outputs = inst.captured.runtime.outputs.clone();

        if severity == Some("WARNING") {
            let text = messages.join("; ");
            self.record_task_event(&id, "warning", &text);
            self.fire_task_handlers(&id, "warning", &text);
        }

        for message in messages {
            match message.as_str() {
                "started" => self.on_started(&id),
                "succeeded" => self.on_succeeded(&id),
                "failed" => self.on_failed(&id, "ERR"),
                "submit-failed" => self.on_submission_failed(&id, "reported by job", false),
                other => {
                    // Custom outputs arrive as their message string or label
                    let label = custom_outputs
                        .iter()
                        .find(|(label, msg)| *label == other || *msg == other)
                        .map(|(label, _)| label.clone());
                    match label {
                        Some(label) => {
                            self.record_task_event(&id, "message", other);
                            self.complete_output(&id, &label);
                        }
                        None => {
                            self.record_task_event(&id, "message", other);
                        }
                    }
                }
            }
        }
        Response::ok(Value::Null)
    }

    fn cmd_show(&mut self, raw: &str) -> Response {
        let Some(id) = TaskId::parse(raw) else {
            return Response::error(ErrorKind::BadRequest, format!("bad task id {:?}", raw));
        };
        if let Some(inst) = self.pool.get(&id) {
            let prereqs: Vec<Value> = inst
                .prereqs
                .iter()
                .flat_map(|p| p.conditions())
                .map(|(cond, ok)| json!({"condition": cond.to_string(), "satisfied": ok}))
                .collect();
            return Response::ok(json!({
                "id": id.to_string(),
                "state": inst.state.to_string(),
                "is_held": inst.is_held,
                "submit_num": inst.submit_num,
                "try_num": inst.try_num,
                "outputs": inst.outputs,
                "prerequisites": prereqs,
                "xtriggers": inst.xtriggers,
            }));
        }
        // Fall back to the recorded history
        match self.store.get_task_state(&id.point, &id.name) {
            Ok(Some(status)) => Response::ok(json!({
                "id": id.to_string(),
                "state": status,
                "live": false,
            })),
            Ok(None) => Response::error(ErrorKind::NotFound, format!("no instance {}", id)),
            Err(e) => Response::error(ErrorKind::Server, format!("{:#}", e)),
        }
    }

    fn cmd_dump(&mut self) -> Response {
        let tasks: Vec<Value> = self
            .pool
            .values()
            .map(|inst| {
                json!({
                    "id": inst.id().to_string(),
                    "state": inst.state.to_string(),
                    "is_held": inst.is_held,
                    "submit_num": inst.submit_num,
                })
            })
            .collect();
        let broadcasts: Vec<Value> = self
            .broadcasts
            .entries()
            .iter()
            .map(|e| json!({"point": e.point, "namespace": e.namespace, "key": e.key, "value": e.value}))
            .collect();
        Response::ok(json!({
            "workflow": self.workflow_id,
            "tasks": tasks,
            "broadcasts": broadcasts,
            "stopping": self.stop.is_some(),
        }))
    }
}
