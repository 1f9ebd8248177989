//! The workflow graph: per-recurrence dependency edges
//!
//! Built once at load/reload from the `scheduling.graph` section. Families
//! and parameters are expanded to concrete leaf tasks at build time; edge
//! *evaluation* stays deferred - prerequisites for an instance (T, P) are
//! derived on demand by scanning the sections whose recurrence contains P.

use std::collections::{BTreeMap, BTreeSet};

use eyre::{bail, Context, Result};

use crate::cycling::{CyclePoint, Recurrence, RecurrenceContext};
use crate::task::outputs;

use super::family::FamilyTree;
use super::trigger::{logical_lines, parse_line, GraphExpr, GraphNode};

/// One dependency edge: `expr` gates `target`. `expr` is `None` for tasks
/// declared with no upstream (parentless at this recurrence).
#[derive(Debug, Clone)]
pub struct Edge {
    /// Family- and parameter-expanded trigger expression
    pub expr: Option<GraphExpr>,
    /// Xtrigger names conjoined with `expr` (`@name` conjuncts)
    pub xtriggers: Vec<String>,
    /// Concrete downstream task name
    pub target: String,
    /// Suicide edge: satisfying `expr` removes `target` instead of gating it
    pub suicide: bool,
}

/// All edges under one recurrence
#[derive(Debug, Clone)]
pub struct GraphSection {
    /// Source text of the recurrence (for messages)
    pub recurrence_text: String,
    /// Resolved recurrence
    pub recurrence: Recurrence,
    /// Edges in declaration order
    pub edges: Vec<Edge>,
    /// Concrete tasks that cycle on this recurrence
    pub tasks: BTreeSet<String>,
}

/// The full graph model
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    sections: Vec<GraphSection>,
    tasks: BTreeSet<String>,
}

impl WorkflowGraph {
    /// Build the graph from `(recurrence, graph string)` sections
    pub fn build(
        graph_cfg: &[(String, String)],
        families: &FamilyTree,
        params: &BTreeMap<String, Vec<String>>,
        ctx: &RecurrenceContext,
    ) -> Result<Self> {
        let mut sections = Vec::new();
        let mut all_tasks = BTreeSet::new();

        for (rec_text, graph_text) in graph_cfg {
            let recurrence = Recurrence::parse(rec_text, ctx)
                .with_context(|| format!("in graph section [{}]", rec_text))?;
            let mut edges = Vec::new();
            let mut tasks = BTreeSet::new();

            for line in logical_lines(graph_text) {
                let chain = parse_line(&line).with_context(|| format!("in graph section [{}]", rec_text))?;
                for concrete in expand_chain_params(&chain, params)
                    .with_context(|| format!("in graph line: {}", line))?
                {
                    build_line_edges(&concrete, families, &mut edges, &mut tasks)
                        .with_context(|| format!("in graph line: {}", line))?;
                }
            }

            all_tasks.extend(tasks.iter().cloned());
            sections.push(GraphSection {
                recurrence_text: rec_text.clone(),
                recurrence,
                edges,
                tasks,
            });
        }

        Ok(Self {
            sections,
            tasks: all_tasks,
        })
    }

    /// Every concrete task named in the graph
    pub fn tasks(&self) -> &BTreeSet<String> {
        &self.tasks
    }

    /// Graph sections (read-only)
    pub fn sections(&self) -> &[GraphSection] {
        &self.sections
    }

    /// Trigger expressions gating (name, point): `(prerequisites, suicides)`
    pub fn prerequisites_for(&self, name: &str, point: &CyclePoint) -> (Vec<GraphExpr>, Vec<GraphExpr>) {
        let mut prereqs = Vec::new();
        let mut suicides = Vec::new();
        for section in &self.sections {
            if !section.recurrence.contains(point) {
                continue;
            }
            for edge in &section.edges {
                if edge.target != name {
                    continue;
                }
                if let Some(expr) = &edge.expr {
                    if edge.suicide {
                        suicides.push(expr.clone());
                    } else {
                        prereqs.push(expr.clone());
                    }
                }
            }
        }
        (prereqs, suicides)
    }

    /// Xtrigger names gating (name, point)
    pub fn xtriggers_for(&self, name: &str, point: &CyclePoint) -> Vec<String> {
        let mut out = Vec::new();
        for section in &self.sections {
            if !section.recurrence.contains(point) {
                continue;
            }
            for edge in &section.edges {
                if edge.target != name || edge.suicide {
                    continue;
                }
                for xt in &edge.xtriggers {
                    if !out.contains(xt) {
                        out.push(xt.clone());
                    }
                }
            }
        }
        out
    }

    /// Downstream instances to spawn when (name, point) completes `output`
    pub fn children_of(&self, name: &str, point: &CyclePoint, output: &str) -> Vec<(String, CyclePoint)> {
        let mut out = Vec::new();
        for section in &self.sections {
            for edge in &section.edges {
                if edge.suicide {
                    continue;
                }
                let Some(expr) = &edge.expr else { continue };
                for node in expr.nodes() {
                    if node.name != name {
                        continue;
                    }
                    let node_output = node.output.as_deref().unwrap_or(outputs::SUCCEEDED);
                    if node_output != output {
                        continue;
                    }
                    // Upstream point = child point + offset, so the child
                    // sits at point - offset
                    let child_point = match &node.offset {
                        Some(off) => match point.sub(off) {
                            Ok(p) => p,
                            Err(_) => continue,
                        },
                        None => *point,
                    };
                    if section.recurrence.contains(&child_point)
                        && !out.contains(&(edge.target.clone(), child_point))
                    {
                        out.push((edge.target.clone(), child_point));
                    }
                }
            }
        }
        out
    }

    /// Whether (name, point) has no dependency edges (candidates for
    /// spawning ahead of the runahead edge)
    pub fn is_parentless(&self, name: &str, point: &CyclePoint) -> bool {
        let mut present = false;
        for section in &self.sections {
            if !section.tasks.contains(name) || !section.recurrence.contains(point) {
                continue;
            }
            present = true;
            for edge in &section.edges {
                if edge.target == name && edge.expr.is_some() && !edge.suicide {
                    return false;
                }
            }
        }
        present
    }

    /// First point of `name` on or after `from`
    pub fn first_point(&self, name: &str, from: &CyclePoint) -> Option<CyclePoint> {
        self.sections
            .iter()
            .filter(|s| s.tasks.contains(name))
            .filter_map(|s| s.recurrence.first_on_or_after(from))
            .min()
    }

    /// Next point of `name` strictly after `from`
    pub fn next_point(&self, name: &str, from: &CyclePoint) -> Option<CyclePoint> {
        self.sections
            .iter()
            .filter(|s| s.tasks.contains(name))
            .filter_map(|s| s.recurrence.next_after(from))
            .min()
    }

    /// Whether the task cycles on some recurrence containing `point`
    pub fn task_at(&self, name: &str, point: &CyclePoint) -> bool {
        self.sections
            .iter()
            .any(|s| s.tasks.contains(name) && s.recurrence.contains(point))
    }
}

/// Build the edges for one fully parameter-expanded graph line
fn build_line_edges(
    chain: &[GraphExpr],
    families: &FamilyTree,
    edges: &mut Vec<Edge>,
    tasks: &mut BTreeSet<String>,
) -> Result<()> {
    // Track task membership from every zero-offset task node in the line
    for group in chain {
        for node in group.nodes() {
            if node.offset.is_none() && !node.xtrigger {
                for leaf in families.members(&node.name) {
                    tasks.insert(leaf);
                }
            }
        }
    }

    if chain.len() == 1 {
        // No arrow: declares the tasks at this recurrence, dependency-free
        for node in flatten_targets(&chain[0])? {
            if node.suicide {
                bail!("suicide marker on a task with no trigger: !{}", node.name);
            }
            for leaf in families.members(&node.name) {
                edges.push(Edge {
                    expr: None,
                    xtriggers: Vec::new(),
                    target: leaf,
                    suicide: false,
                });
            }
        }
        return Ok(());
    }

    for pair in chain.windows(2) {
        let (task_expr, xtriggers) = split_xtriggers(&pair[0])?;
        let lhs = match &task_expr {
            Some(expr) => Some(expand_expr(expr, families)?),
            None => None,
        };
        for node in flatten_targets(&pair[1])? {
            for leaf in families.members(&node.name) {
                edges.push(Edge {
                    expr: lhs.clone(),
                    xtriggers: xtriggers.clone(),
                    target: leaf,
                    suicide: node.suicide,
                });
            }
        }
    }
    Ok(())
}

/// Strip `@xtrigger` conjuncts off the top level of a trigger expression.
/// Xtriggers are predicates, not outputs, so they may only be and-joined.
fn split_xtriggers(expr: &GraphExpr) -> Result<(Option<GraphExpr>, Vec<String>)> {
    let conjuncts: Vec<&GraphExpr> = match expr {
        GraphExpr::All(xs) => xs.iter().collect(),
        other => vec![other],
    };
    let mut xtriggers = Vec::new();
    let mut rest = Vec::new();
    for part in conjuncts {
        match part {
            GraphExpr::Node(node) if node.xtrigger => xtriggers.push(node.name.clone()),
            other => {
                if other.nodes().iter().any(|n| n.xtrigger) {
                    bail!("`@xtrigger` may only appear as a top-level `&` conjunct");
                }
                rest.push(other.clone());
            }
        }
    }
    let task_expr = match rest.len() {
        0 => None,
        1 => Some(rest.into_iter().next().expect("non-empty")),
        _ => Some(GraphExpr::All(rest)),
    };
    Ok((task_expr, xtriggers))
}

/// Expand families and canonicalise outputs in a trigger expression
fn expand_expr(expr: &GraphExpr, families: &FamilyTree) -> Result<GraphExpr> {
    match expr {
        GraphExpr::All(xs) => Ok(GraphExpr::All(
            xs.iter().map(|x| expand_expr(x, families)).collect::<Result<_>>()?,
        )),
        GraphExpr::Any(xs) => Ok(GraphExpr::Any(
            xs.iter().map(|x| expand_expr(x, families)).collect::<Result<_>>()?,
        )),
        GraphExpr::Node(node) => {
            if node.suicide {
                bail!("suicide marker on the left of a trigger: !{}", node.name);
            }
            if families.is_family(&node.name) {
                expand_family_node(node, families)
            } else {
                Ok(expand_task_node(node))
            }
        }
    }
}

/// `finish` is succeeded-or-failed; everything else maps to one output
fn expand_task_node(node: &GraphNode) -> GraphExpr {
    let label = node.output.as_deref().unwrap_or(outputs::SUCCEEDED);
    if label == "finish" || label == "finished" {
        let cond = |output: &str| {
            GraphExpr::Node(GraphNode {
                suicide: false,
                xtrigger: false,
                name: node.name.clone(),
                offset: node.offset,
                output: Some(output.to_string()),
            })
        };
        return GraphExpr::Any(vec![cond(outputs::SUCCEEDED), cond(outputs::FAILED)]);
    }
    GraphExpr::Node(GraphNode {
        suicide: false,
        xtrigger: false,
        name: node.name.clone(),
        offset: node.offset,
        output: Some(outputs::canonical(label).to_string()),
    })
}

/// `FAM:succeed-all` and friends expand to a boolean over the members
fn expand_family_node(node: &GraphNode, families: &FamilyTree) -> Result<GraphExpr> {
    let qualifier = node
        .output
        .as_deref()
        .ok_or_else(|| eyre::eyre!("family {} used as a trigger without a family qualifier", node.name))?;
    let (member_label, all) = match qualifier {
        "succeed-all" => (outputs::SUCCEEDED, true),
        "succeed-any" => (outputs::SUCCEEDED, false),
        "fail-all" => (outputs::FAILED, true),
        "fail-any" => (outputs::FAILED, false),
        "start-all" => (outputs::STARTED, true),
        "start-any" => (outputs::STARTED, false),
        "finish-all" => ("finish", true),
        "finish-any" => ("finish", false),
        other => bail!("unknown family qualifier {}:{}", node.name, other),
    };

    let members = families.members(&node.name);
    if members.is_empty() {
        bail!("family {} has no members", node.name);
    }
    let conds: Vec<GraphExpr> = members
        .into_iter()
        .map(|m| {
            expand_task_node(&GraphNode {
                suicide: false,
                xtrigger: false,
                name: m,
                offset: node.offset,
                output: Some(member_label.to_string()),
            })
        })
        .collect();

    Ok(if conds.len() == 1 {
        conds.into_iter().next().expect("non-empty")
    } else if all {
        GraphExpr::All(conds)
    } else {
        GraphExpr::Any(conds)
    })
}

/// Flatten a target group into its nodes; `|` and offsets are illegal on
/// the right of an arrow.
fn flatten_targets(expr: &GraphExpr) -> Result<Vec<GraphNode>> {
    match expr {
        GraphExpr::Any(_) => bail!("`|` is not allowed on the right of `=>`"),
        GraphExpr::All(xs) => {
            let mut out = Vec::new();
            for x in xs {
                out.extend(flatten_targets(x)?);
            }
            Ok(out)
        }
        GraphExpr::Node(node) => {
            if node.offset.is_some() {
                bail!("offset is not allowed on the right of `=>`: {}", node.name);
            }
            if node.xtrigger {
                bail!("`@{}` is not allowed on the right of `=>`", node.name);
            }
            Ok(vec![node.clone()])
        }
    }
}

/// Expand `<p>` / `<p=v>` parameter references over their value sets
fn expand_chain_params(
    chain: &[GraphExpr],
    params: &BTreeMap<String, Vec<String>>,
) -> Result<Vec<Vec<GraphExpr>>> {
    // Collect free parameter references in declaration order
    let mut refs: Vec<String> = Vec::new();
    for group in chain {
        for node in group.nodes() {
            if let Some((_, spec)) = split_param(&node.name)? {
                if !spec.contains('=') {
                    if !params.contains_key(spec) {
                        bail!("undeclared task parameter <{}>", spec);
                    }
                    if !refs.iter().any(|r| r == spec) {
                        refs.push(spec.to_string());
                    }
                }
            }
        }
    }

    if refs.is_empty() {
        return Ok(vec![substitute_chain(chain, &BTreeMap::new(), params)?]);
    }

    // Cartesian product over the referenced parameters
    let mut combos: Vec<BTreeMap<String, String>> = vec![BTreeMap::new()];
    for name in &refs {
        let values = &params[name];
        let mut next = Vec::with_capacity(combos.len() * values.len());
        for combo in &combos {
            for v in values {
                let mut c = combo.clone();
                c.insert(name.clone(), v.clone());
                next.push(c);
            }
        }
        combos = next;
    }

    combos
        .iter()
        .map(|combo| substitute_chain(chain, combo, params))
        .collect()
}

fn substitute_chain(
    chain: &[GraphExpr],
    combo: &BTreeMap<String, String>,
    params: &BTreeMap<String, Vec<String>>,
) -> Result<Vec<GraphExpr>> {
    chain
        .iter()
        .map(|group| substitute_expr(group, combo, params))
        .collect()
}

fn substitute_expr(
    expr: &GraphExpr,
    combo: &BTreeMap<String, String>,
    params: &BTreeMap<String, Vec<String>>,
) -> Result<GraphExpr> {
    match expr {
        GraphExpr::All(xs) => Ok(GraphExpr::All(
            xs.iter()
                .map(|x| substitute_expr(x, combo, params))
                .collect::<Result<_>>()?,
        )),
        GraphExpr::Any(xs) => Ok(GraphExpr::Any(
            xs.iter()
                .map(|x| substitute_expr(x, combo, params))
                .collect::<Result<_>>()?,
        )),
        GraphExpr::Node(node) => {
            let name = expand_param_name(&node.name, combo, params)?;
            Ok(GraphExpr::Node(GraphNode {
                name,
                ..node.clone()
            }))
        }
    }
}

/// Split `base<spec>` into (base, spec); None when unparameterised
fn split_param(name: &str) -> Result<Option<(&str, &str)>> {
    match name.split_once('<') {
        None => Ok(None),
        Some((base, rest)) => {
            let spec = rest
                .strip_suffix('>')
                .ok_or_else(|| eyre::eyre!("unterminated parameter in {}", name))?;
            Ok(Some((base, spec)))
        }
    }
}

/// `model<i>` with i bound -> `model_1`; `model<i=2>` -> `model_2`
fn expand_param_name(
    name: &str,
    combo: &BTreeMap<String, String>,
    params: &BTreeMap<String, Vec<String>>,
) -> Result<String> {
    let Some((base, spec)) = split_param(name)? else {
        return Ok(name.to_string());
    };
    match spec.split_once('=') {
        Some((p, v)) => {
            let p = p.trim();
            let v = v.trim();
            if let Some(values) = params.get(p) {
                if !values.iter().any(|x| x == v) {
                    bail!("parameter {}={} is not in the declared value set", p, v);
                }
            }
            Ok(format!("{}_{}", base, v))
        }
        None => {
            let v = combo
                .get(spec)
                .ok_or_else(|| eyre::eyre!("unbound task parameter <{}>", spec))?;
            Ok(format!("{}_{}", base, v))
        }
    }
}
