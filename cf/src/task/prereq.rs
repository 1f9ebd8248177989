//! Prerequisites: trigger expressions bound to concrete upstream instances
//!
//! A prerequisite is built from a graph trigger expression by substituting
//! the owner's cycle point into each upstream reference (applying offsets).
//! Conditions whose point falls before the initial cycle point are
//! synthesised as satisfied - inter-cycle edges are cycles in the template,
//! not the instance graph.

use std::collections::BTreeMap;

use crate::cycling::CyclePoint;
use crate::graph::GraphExpr;
use crate::task::outputs;

/// One condition of a prerequisite expression
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct CondKey {
    /// Upstream task name
    pub task: String,
    /// Canonical upstream point string
    pub point: String,
    /// Required output label
    pub output: String,
}

impl std::fmt::Display for CondKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}:{}", self.task, self.point, self.output)
    }
}

#[derive(Debug, Clone)]
enum PrereqExpr {
    Cond(CondKey),
    All(Vec<PrereqExpr>),
    Any(Vec<PrereqExpr>),
}

/// A trigger expression with per-condition satisfaction state
#[derive(Debug, Clone)]
pub struct Prerequisite {
    expr: PrereqExpr,
    satisfied: BTreeMap<CondKey, bool>,
}

impl Prerequisite {
    /// Bind `expr` to the owner's point. Conditions before `initial` start
    /// satisfied.
    pub fn bind(expr: &GraphExpr, owner: &CyclePoint, initial: &CyclePoint) -> Self {
        let mut satisfied = BTreeMap::new();
        let bound = bind_expr(expr, owner, initial, &mut satisfied);
        Self { expr: bound, satisfied }
    }

    /// Mark a completed upstream output; returns true if anything changed
    pub fn satisfy(&mut self, task: &str, point: &str, output: &str) -> bool {
        let key = CondKey {
            task: task.to_string(),
            point: point.to_string(),
            output: output.to_string(),
        };
        match self.satisfied.get_mut(&key) {
            Some(flag) if !*flag => {
                *flag = true;
                true
            }
            _ => false,
        }
    }

    /// Force every condition satisfied (`set`/`trigger` commands)
    pub fn satisfy_all(&mut self) {
        for flag in self.satisfied.values_mut() {
            *flag = true;
        }
    }

    /// Evaluate the expression over the observed conditions
    pub fn is_satisfied(&self) -> bool {
        eval(&self.expr, &self.satisfied)
    }

    /// All conditions and their current state
    pub fn conditions(&self) -> impl Iterator<Item = (&CondKey, bool)> {
        self.satisfied.iter().map(|(k, v)| (k, *v))
    }

    /// Snapshot as label -> satisfied (for the pool checkpoint)
    pub fn snapshot(&self) -> BTreeMap<String, bool> {
        self.satisfied.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    /// Restore satisfaction flags from a checkpoint snapshot
    pub fn restore(&mut self, snapshot: &BTreeMap<String, bool>) {
        for (key, flag) in self.satisfied.iter_mut() {
            if let Some(v) = snapshot.get(&key.to_string()) {
                *flag = *flag || *v;
            }
        }
    }
}

fn bind_expr(
    expr: &GraphExpr,
    owner: &CyclePoint,
    initial: &CyclePoint,
    satisfied: &mut BTreeMap<CondKey, bool>,
) -> PrereqExpr {
    match expr {
        GraphExpr::All(xs) => PrereqExpr::All(xs.iter().map(|x| bind_expr(x, owner, initial, satisfied)).collect()),
        GraphExpr::Any(xs) => PrereqExpr::Any(xs.iter().map(|x| bind_expr(x, owner, initial, satisfied)).collect()),
        GraphExpr::Node(node) => {
            let point = match &node.offset {
                Some(off) => owner.add(off).unwrap_or(*owner),
                None => *owner,
            };
            let key = CondKey {
                task: node.name.clone(),
                point: point.format(),
                output: node.output.clone().unwrap_or_else(|| outputs::SUCCEEDED.to_string()),
            };
            // Pre-initial upstream references are satisfied by construction
            let pre_satisfied = point < *initial;
            satisfied.entry(key.clone()).or_insert(pre_satisfied);
            PrereqExpr::Cond(key)
        }
    }
}

fn eval(expr: &PrereqExpr, satisfied: &BTreeMap<CondKey, bool>) -> bool {
    match expr {
        PrereqExpr::Cond(key) => satisfied.get(key).copied().unwrap_or(false),
        PrereqExpr::All(xs) => xs.iter().all(|x| eval(x, satisfied)),
        PrereqExpr::Any(xs) => xs.iter().any(|x| eval(x, satisfied)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cycling::CycleDuration;
    use crate::graph::GraphNode;

    fn node(name: &str, offset: Option<&str>, output: &str) -> GraphExpr {
        GraphExpr::Node(GraphNode {
            suicide: false,
            xtrigger: false,
            name: name.to_string(),
            offset: offset.map(|s| CycleDuration::parse(s).unwrap()),
            output: Some(output.to_string()),
        })
    }

    #[test]
    fn test_simple_satisfaction() {
        let expr = node("a", None, "succeeded");
        let mut p = Prerequisite::bind(&expr, &CyclePoint::Integer(2), &CyclePoint::Integer(1));
        assert!(!p.is_satisfied());
        assert!(p.satisfy("a", "2", "succeeded"));
        assert!(p.is_satisfied());
        // Re-satisfying is a no-op
        assert!(!p.satisfy("a", "2", "succeeded"));
    }

    #[test]
    fn test_and_join_across_ticks() {
        let expr = GraphExpr::All(vec![node("x", None, "succeeded"), node("y", None, "succeeded")]);
        let mut p = Prerequisite::bind(&expr, &CyclePoint::Integer(1), &CyclePoint::Integer(1));
        assert!(p.satisfy("x", "1", "succeeded"));
        assert!(!p.is_satisfied());
        assert!(p.satisfy("y", "1", "succeeded"));
        assert!(p.is_satisfied());
    }

    #[test]
    fn test_or_expression() {
        let expr = GraphExpr::Any(vec![node("x", None, "succeeded"), node("y", None, "failed")]);
        let mut p = Prerequisite::bind(&expr, &CyclePoint::Integer(1), &CyclePoint::Integer(1));
        p.satisfy("y", "1", "failed");
        assert!(p.is_satisfied());
    }

    #[test]
    fn test_offset_binds_upstream_point() {
        let expr = node("b", Some("-P1"), "succeeded");
        let mut p = Prerequisite::bind(&expr, &CyclePoint::Integer(3), &CyclePoint::Integer(1));
        // Upstream is b.2
        assert!(!p.satisfy("b", "3", "succeeded"));
        assert!(p.satisfy("b", "2", "succeeded"));
        assert!(p.is_satisfied());
    }

    #[test]
    fn test_pre_initial_reference_is_satisfied() {
        let expr = node("b", Some("-P1"), "succeeded");
        let p = Prerequisite::bind(&expr, &CyclePoint::Integer(1), &CyclePoint::Integer(1));
        // b.0 is before the initial point
        assert!(p.is_satisfied());
    }

    #[test]
    fn test_snapshot_restore() {
        let expr = GraphExpr::All(vec![node("x", None, "succeeded"), node("y", None, "succeeded")]);
        let mut p = Prerequisite::bind(&expr, &CyclePoint::Integer(1), &CyclePoint::Integer(1));
        p.satisfy("x", "1", "succeeded");

        let snap = p.snapshot();
        let mut q = Prerequisite::bind(&expr, &CyclePoint::Integer(1), &CyclePoint::Integer(1));
        q.restore(&snap);
        assert!(q.satisfy("y", "1", "succeeded"));
        assert!(q.is_satisfied());
    }

    #[test]
    fn test_satisfy_all() {
        let expr = GraphExpr::All(vec![node("x", None, "succeeded"), node("y", None, "succeeded")]);
        let mut p = Prerequisite::bind(&expr, &CyclePoint::Integer(1), &CyclePoint::Integer(1));
        p.satisfy_all();
        assert!(p.is_satisfied());
    }
}
