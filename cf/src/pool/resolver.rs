//! Prerequisite/output resolver
//!
//! Routes completed outputs (real or synthetic) to waiting prerequisites,
//! spawns downstream children on demand, and fires suicide removals. All
//! effects are returned to the caller so state changes can be journalled
//! before any outbound effect.

use tracing::debug;

use crate::cycling::CyclePoint;
use crate::graph::WorkflowGraph;
use crate::task::{TaskId, TaskRegistry};
use crate::xtrigger::XtriggerSpec;

use super::{SpawnOutcome, TaskPool};

/// Effects of applying one completed output
#[derive(Debug, Default)]
pub struct OutputEffects {
    /// Newly spawned downstream instances
    pub spawned: Vec<TaskId>,
    /// Instances removed by a satisfied suicide prerequisite
    pub suicided: Vec<TaskId>,
}

/// Apply a completed output of (name, point) through the pool.
///
/// `already_done` answers whether a candidate child instance has already
/// finished in a previous life (restart, housekept point) and must not be
/// respawned.
pub fn apply_output(
    pool: &mut TaskPool,
    graph: &WorkflowGraph,
    registry: &TaskRegistry,
    name: &str,
    point: &CyclePoint,
    output: &str,
    already_done: &dyn Fn(&str, &str) -> bool,
) -> OutputEffects {
    let mut effects = OutputEffects::default();

    // Spawn downstream children first so this very output can satisfy them
    for (child, child_point) in graph.children_of(name, point, output) {
        let child_id = TaskId::new(child.clone(), &child_point);
        if pool.contains(&child, &child_point) {
            note_spawned(pool, name, point, &child_id);
            continue;
        }
        if already_done(&child, &child_point.format()) {
            note_spawned(pool, name, point, &child_id);
            continue;
        }
        if pool.spawn(&child, &child_point, registry, graph) == SpawnOutcome::Spawned {
            debug!(parent = %TaskId::new(name, point), child = %child_id, "Spawned on output");
            effects.spawned.push(child_id.clone());
        }
        note_spawned(pool, name, point, &child_id);
    }

    // Route the output to every waiting prerequisite
    let point_str = point.format();
    let mut suicided = Vec::new();
    for inst in pool.values_mut() {
        for p in inst.prereqs.iter_mut() {
            p.satisfy(name, &point_str, output);
        }
        let mut fired = false;
        for p in inst.suicides.iter_mut() {
            p.satisfy(name, &point_str, output);
            fired = fired || p.is_satisfied();
        }
        if fired {
            suicided.push(inst.id());
        }
    }
    for id in suicided {
        if pool.remove(&id).is_some() {
            debug!(id = %id, "Suicide prerequisite satisfied; removed");
            effects.suicided.push(id);
        }
    }

    effects
}

/// Record the child in the upstream instance's spawn ledger (dedup and
/// housekeeping evidence); the upstream may already be gone.
fn note_spawned(pool: &mut TaskPool, name: &str, point: &CyclePoint, child: &TaskId) {
    let parent = TaskId::new(name, point);
    if let Some(inst) = pool.get_mut(&parent) {
        inst.spawned.insert(child.clone());
    }
}

/// Satisfy an xtrigger signature across the pool; contributes the trigger's
/// result environment to every subscriber.
pub fn apply_xtrigger(pool: &mut TaskPool, signature: &str, spec: Option<&XtriggerSpec>, xt_name: &str) -> Vec<TaskId> {
    pool.mark_xtrigger_satisfied(signature);
    let env = spec.map(|s| crate::xtrigger::result_env(s, xt_name)).unwrap_or_default();
    let mut satisfied = Vec::new();
    for inst in pool.values_mut() {
        if inst.xtriggers.remove(signature) {
            inst.xtrigger_env.extend(env.clone());
            satisfied.push(inst.id());
        }
    }
    satisfied
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkflowConfig;
    use crate::cycling::RecurrenceContext;
    use crate::task::TaskState;
    use std::collections::BTreeMap;

    fn fixtures(yaml: &str) -> (TaskPool, TaskRegistry, WorkflowGraph) {
        let config = WorkflowConfig::parse(yaml).unwrap();
        let mut registry = TaskRegistry::from_config(&config).unwrap();
        let ctx = RecurrenceContext {
            initial: config.initial_point().unwrap(),
            final_point: config.final_point().unwrap(),
            mode: config.mode(),
        };
        let graph = WorkflowGraph::build(
            &config.graph_sections(),
            registry.families(),
            registry.params(),
            &ctx,
        )
        .unwrap();
        registry.adopt_graph_tasks(graph.tasks(), true).unwrap();
        let mut defs = BTreeMap::new();
        for (name, expr) in &config.scheduling.xtriggers {
            defs.insert(name.clone(), XtriggerSpec::parse(expr).unwrap());
        }
        let pool = TaskPool::new(
            ctx.initial,
            ctx.final_point,
            config.runahead_limit().unwrap(),
            config.queue_limit(),
            defs,
        );
        (pool, registry, graph)
    }

    #[test]
    fn test_output_spawns_and_satisfies_child() {
        let yaml = "
scheduling:
  initial cycle point: '1'
  final cycle point: '3'
  cycling mode: integer
  graph:
    P1: a => b
";
        let (mut pool, registry, graph) = fixtures(yaml);
        pool.spawn("a", &CyclePoint::Integer(1), &registry, &graph);

        let effects = apply_output(
            &mut pool,
            &graph,
            &registry,
            "a",
            &CyclePoint::Integer(1),
            "succeeded",
            &|_, _| false,
        );
        assert_eq!(effects.spawned, vec![TaskId::parse("b.1").unwrap()]);

        let b = pool.get(&TaskId::parse("b.1").unwrap()).unwrap();
        assert!(b.prereqs[0].is_satisfied());
        // Parent's spawn ledger records the child
        let a = pool.get(&TaskId::parse("a.1").unwrap()).unwrap();
        assert!(a.spawned.contains(&TaskId::parse("b.1").unwrap()));
    }

    #[test]
    fn test_already_done_children_not_respawned() {
        let yaml = "
scheduling:
  initial cycle point: '1'
  final cycle point: '3'
  cycling mode: integer
  graph:
    P1: a => b
";
        let (mut pool, registry, graph) = fixtures(yaml);
        pool.spawn("a", &CyclePoint::Integer(1), &registry, &graph);
        let effects = apply_output(
            &mut pool,
            &graph,
            &registry,
            "a",
            &CyclePoint::Integer(1),
            "succeeded",
            &|name, point| name == "b" && point == "1",
        );
        assert!(effects.spawned.is_empty());
        assert!(!pool.contains("b", &CyclePoint::Integer(1)));
    }

    #[test]
    fn test_and_join_suicide_fires_once_both_observed() {
        let yaml = "
scheduling:
  initial cycle point: '1'
  final cycle point: '1'
  cycling mode: integer
  graph:
    R1: |
      z
      x:succeeded & y:succeeded => !z
";
        let (mut pool, registry, graph) = fixtures(yaml);
        pool.spawn("z", &CyclePoint::Integer(1), &registry, &graph);

        let effects = apply_output(
            &mut pool,
            &graph,
            &registry,
            "x",
            &CyclePoint::Integer(1),
            "succeeded",
            &|_, _| false,
        );
        assert!(effects.suicided.is_empty());
        assert!(pool.contains("z", &CyclePoint::Integer(1)));

        // Second side arrives on a later tick
        let effects = apply_output(
            &mut pool,
            &graph,
            &registry,
            "y",
            &CyclePoint::Integer(1),
            "succeeded",
            &|_, _| false,
        );
        assert_eq!(effects.suicided, vec![TaskId::parse("z.1").unwrap()]);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_intercycle_chain_spawns_next_point() {
        let yaml = "
scheduling:
  initial cycle point: '1'
  final cycle point: '3'
  cycling mode: integer
  graph:
    P1: b[-P1] => b
";
        let (mut pool, registry, graph) = fixtures(yaml);
        pool.spawn("b", &CyclePoint::Integer(1), &registry, &graph);
        {
            let id = TaskId::parse("b.1").unwrap();
            let inst = pool.get_mut(&id).unwrap();
            inst.state = TaskState::Succeeded;
            inst.complete_output("succeeded");
        }
        let effects = apply_output(
            &mut pool,
            &graph,
            &registry,
            "b",
            &CyclePoint::Integer(1),
            "succeeded",
            &|_, _| false,
        );
        assert_eq!(effects.spawned, vec![TaskId::parse("b.2").unwrap()]);
        let b2 = pool.get(&TaskId::parse("b.2").unwrap()).unwrap();
        assert!(b2.prereqs[0].is_satisfied());
    }

    #[test]
    fn test_custom_output_routing() {
        let yaml = "
scheduling:
  initial cycle point: '1'
  final cycle point: '1'
  cycling mode: integer
  graph:
    R1: a:ready => b
runtime:
  a:
    outputs:
      ready: 'data is staged'
  b: {}
";
        let (mut pool, registry, graph) = fixtures(yaml);
        pool.spawn("a", &CyclePoint::Integer(1), &registry, &graph);

        // succeeded does not satisfy the custom-output trigger
        let effects = apply_output(
            &mut pool,
            &graph,
            &registry,
            "a",
            &CyclePoint::Integer(1),
            "succeeded",
            &|_, _| false,
        );
        assert!(effects.spawned.is_empty());

        let effects = apply_output(
            &mut pool,
            &graph,
            &registry,
            "a",
            &CyclePoint::Integer(1),
            "ready",
            &|_, _| false,
        );
        assert_eq!(effects.spawned, vec![TaskId::parse("b.1").unwrap()]);
    }

    #[test]
    fn test_apply_xtrigger() {
        let yaml = "
scheduling:
  initial cycle point: '1'
  final cycle point: '1'
  cycling mode: integer
  xtriggers:
    ready: ext_trigger(data-ready)
  graph:
    R1: '@ready => t'
";
        let (mut pool, registry, graph) = fixtures(yaml);
        pool.spawn("t", &CyclePoint::Integer(1), &registry, &graph);

        let spec = XtriggerSpec::parse("ext_trigger(data-ready)").unwrap();
        let id = TaskId::parse("t.1").unwrap();
        let sig = spec.signature(&CyclePoint::Integer(1));
        assert!(!pool.get(&id).unwrap().xtriggers.is_empty());
        assert!(!pool.get(&id).unwrap().prereqs_satisfied(chrono::Utc::now()));

        let satisfied = apply_xtrigger(&mut pool, &sig, Some(&spec), "ready");
        assert_eq!(satisfied, vec![id.clone()]);
        let inst = pool.get(&id).unwrap();
        assert!(inst.prereqs_satisfied(chrono::Utc::now()));
        assert!(inst.xtrigger_env.contains_key("CYLC_EXT_TRIGGER_READY"));
    }
}
