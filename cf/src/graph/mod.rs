//! Graph model: trigger grammar, dependency edges, family inheritance

mod edge;
mod family;
mod trigger;

pub use edge::{Edge, GraphSection, WorkflowGraph};
pub use family::{FamilyTree, ROOT};
pub use trigger::{logical_lines, parse_line, GraphChain, GraphExpr, GraphNode};
