//! Family inheritance
//!
//! Namespaces form a DAG through their `inherit` lists, rooted at the
//! implicit `root` namespace. Multiple-inheritance merge order is the C3
//! linearisation of that DAG, computed once at load/reload time.

use std::collections::{BTreeMap, BTreeSet};

use eyre::{bail, Result};

/// The implicit base namespace
pub const ROOT: &str = "root";

/// The namespace DAG: name -> direct parents (first parent wins ties)
#[derive(Debug, Clone, Default)]
pub struct FamilyTree {
    parents: BTreeMap<String, Vec<String>>,
}

impl FamilyTree {
    /// Build from `inherit` lists. Namespaces with no parents inherit from
    /// `root`.
    pub fn new(inherit: &BTreeMap<String, Vec<String>>) -> Self {
        let mut parents = BTreeMap::new();
        for (name, ps) in inherit {
            if name == ROOT {
                continue;
            }
            let ps: Vec<String> = if ps.is_empty() {
                vec![ROOT.to_string()]
            } else {
                ps.clone()
            };
            parents.insert(name.clone(), ps);
        }
        Self { parents }
    }

    /// Whether the namespace is known (root always is)
    pub fn is_known(&self, name: &str) -> bool {
        name == ROOT || self.parents.contains_key(name)
    }

    /// Whether `name` is a family: some other namespace inherits from it
    pub fn is_family(&self, name: &str) -> bool {
        name == ROOT || self.parents.values().any(|ps| ps.iter().any(|p| p == name))
    }

    /// Leaf members of a family: every namespace that inherits from it
    /// (transitively) and is not itself inherited from. A leaf is its own
    /// sole member.
    pub fn members(&self, family: &str) -> Vec<String> {
        if !self.is_family(family) {
            return vec![family.to_string()];
        }
        let mut out: Vec<String> = self
            .parents
            .keys()
            .filter(|name| !self.is_family(name))
            .filter(|name| {
                self.linearization(name)
                    .map(|lin| lin.iter().any(|a| a == family))
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        out.sort();
        out
    }

    /// All leaf namespaces (concrete tasks)
    pub fn leaves(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .parents
            .keys()
            .filter(|name| !self.is_family(name))
            .cloned()
            .collect();
        out.sort();
        out
    }

    /// C3 linearisation of `name`: the namespace itself first, `root` last.
    pub fn linearization(&self, name: &str) -> Result<Vec<String>> {
        let mut seen = BTreeSet::new();
        self.linearize_inner(name, &mut seen)
    }

    fn linearize_inner(&self, name: &str, visiting: &mut BTreeSet<String>) -> Result<Vec<String>> {
        if name == ROOT {
            return Ok(vec![ROOT.to_string()]);
        }
        if !visiting.insert(name.to_string()) {
            bail!("circular inheritance through namespace {}", name);
        }
        let parents = self
            .parents
            .get(name)
            .ok_or_else(|| eyre::eyre!("undefined namespace {} in inherit list", name))?;

        // Merge parent linearisations plus the parent list itself
        let mut sequences: Vec<Vec<String>> = Vec::new();
        for p in parents {
            sequences.push(self.linearize_inner(p, visiting)?);
        }
        sequences.push(parents.clone());
        visiting.remove(name);

        let mut result = vec![name.to_string()];
        result.extend(c3_merge(sequences, name)?);
        Ok(result)
    }
}

/// The C3 merge: repeatedly take the head of a sequence that appears in no
/// other sequence's tail.
fn c3_merge(mut sequences: Vec<Vec<String>>, context: &str) -> Result<Vec<String>> {
    let mut result = Vec::new();
    loop {
        sequences.retain(|s| !s.is_empty());
        if sequences.is_empty() {
            return Ok(result);
        }
        let candidate = sequences
            .iter()
            .map(|s| s[0].clone())
            .find(|head| !sequences.iter().any(|s| s[1..].contains(head)));
        let Some(head) = candidate else {
            bail!("inconsistent inheritance hierarchy at namespace {}", context);
        };
        result.push(head.clone());
        for s in &mut sequences {
            s.retain(|x| *x != head);
        }
    }
}
