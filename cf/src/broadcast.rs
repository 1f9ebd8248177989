//! Broadcast engine
//!
//! Broadcasts are temporary runtime-setting overrides applied to matching
//! future job submissions. Each record targets (point selector, namespace
//! selector, setting key path); selectors may be `*`. Precedence when
//! deriving effective settings is most specific first, with the namespace
//! dominating: exact point + exact task beats wildcard point + exact task
//! beats any family match, down to `root`. Every change is journalled with
//! a `+`/`-` marker and replayed on restart.

use std::collections::BTreeMap;

use cyclestore::{BroadcastChange, BroadcastEventRow};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::RuntimeConfig;

/// One live broadcast setting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastEntry {
    /// Point selector: canonical point string or `*`
    pub point: String,
    /// Namespace selector: task/family name or `root`
    pub namespace: String,
    /// Dotted setting path, e.g. `environment.HELLO` or `script`
    pub key: String,
    /// JSON-encoded value
    pub value: String,
}

/// The broadcast state: an ordered list of live settings
#[derive(Debug, Default)]
pub struct BroadcastEngine {
    entries: Vec<BroadcastEntry>,
}

impl BroadcastEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Live entries (for `dump` and diagnostics)
    pub fn entries(&self) -> &[BroadcastEntry] {
        &self.entries
    }

    /// Apply a `set` operation; returns the journal rows to persist
    pub fn set(
        &mut self,
        points: &[String],
        namespaces: &[String],
        settings: &BTreeMap<String, String>,
    ) -> Vec<BroadcastEventRow> {
        let mut rows = Vec::new();
        for point in points {
            for namespace in namespaces {
                for (key, value) in settings {
                    let json_value = serde_json::to_string(value).unwrap_or_else(|_| "null".to_string());
                    let entry = BroadcastEntry {
                        point: point.clone(),
                        namespace: namespace.clone(),
                        key: key.clone(),
                        value: json_value.clone(),
                    };
                    // Re-setting replaces the previous value in place
                    self.entries
                        .retain(|e| !(e.point == entry.point && e.namespace == entry.namespace && e.key == entry.key));
                    self.entries.push(entry);
                    rows.push(BroadcastEventRow {
                        time: cyclestore::now_iso(),
                        change: BroadcastChange::Set,
                        point: point.clone(),
                        namespace: namespace.clone(),
                        key: key.clone(),
                        value: json_value,
                    });
                    debug!(point, namespace, key, "Broadcast set");
                }
            }
        }
        rows
    }

    /// Cancel specific settings; empty `keys` cancels everything matching
    /// the selectors (the `clear` operation)
    pub fn cancel(&mut self, points: &[String], namespaces: &[String], keys: &[String]) -> Vec<BroadcastEventRow> {
        let mut rows = Vec::new();
        self.entries.retain(|entry| {
            let point_match = points.is_empty() || points.iter().any(|p| *p == entry.point);
            let ns_match = namespaces.is_empty() || namespaces.iter().any(|n| *n == entry.namespace);
            let key_match = keys.is_empty() || keys.iter().any(|k| *k == entry.key);
            if point_match && ns_match && key_match {
                rows.push(BroadcastEventRow {
                    time: cyclestore::now_iso(),
                    change: BroadcastChange::Cancel,
                    point: entry.point.clone(),
                    namespace: entry.namespace.clone(),
                    key: entry.key.clone(),
                    value: entry.value.clone(),
                });
                debug!(point = %entry.point, namespace = %entry.namespace, key = %entry.key, "Broadcast cancelled");
                false
            } else {
                true
            }
        });
        rows
    }

    /// Expire all point-specific broadcasts strictly before `cutoff`
    /// (canonical string comparison is not used; the caller supplies an
    /// ordering predicate so integer and date-time points both work)
    pub fn expire(&mut self, is_before_cutoff: &dyn Fn(&str) -> bool) -> Vec<BroadcastEventRow> {
        let mut rows = Vec::new();
        self.entries.retain(|entry| {
            if entry.point != "*" && is_before_cutoff(&entry.point) {
                rows.push(BroadcastEventRow {
                    time: cyclestore::now_iso(),
                    change: BroadcastChange::Cancel,
                    point: entry.point.clone(),
                    namespace: entry.namespace.clone(),
                    key: entry.key.clone(),
                    value: entry.value.clone(),
                });
                false
            } else {
                true
            }
        });
        rows
    }

    /// Rebuild from the journal (restart)
    pub fn replay(&mut self, journal: &[BroadcastEventRow]) {
        self.entries.clear();
        for row in journal {
            match row.change {
                BroadcastChange::Set => {
                    self.entries
                        .retain(|e| !(e.point == row.point && e.namespace == row.namespace && e.key == row.key));
                    self.entries.push(BroadcastEntry {
                        point: row.point.clone(),
                        namespace: row.namespace.clone(),
                        key: row.key.clone(),
                        value: row.value.clone(),
                    });
                }
                BroadcastChange::Cancel => {
                    self.entries
                        .retain(|e| !(e.point == row.point && e.namespace == row.namespace && e.key == row.key));
                }
            }
        }
        debug!(live = self.entries.len(), "Broadcast journal replayed");
    }

    /// Derive the effective runtime settings for a submission: the merged
    /// definition overlaid with matching broadcasts, least specific first.
    /// `lineage` is the namespace linearisation, task first, `root` last.
    pub fn apply(&self, runtime: &RuntimeConfig, point: &str, lineage: &[String]) -> RuntimeConfig {
        if self.entries.is_empty() {
            return runtime.clone();
        }
        let mut value = match serde_json::to_value(runtime) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "Could not serialise runtime for broadcast application");
                return runtime.clone();
            }
        };

        // Least specific first so more specific overwrites: root .. task,
        // and within a namespace, wildcard point before exact point
        for namespace in lineage.iter().rev() {
            for wildcard in [true, false] {
                for entry in &self.entries {
                    if entry.namespace != *namespace {
                        continue;
                    }
                    let point_matches = if wildcard { entry.point == "*" } else { entry.point == point };
                    if !point_matches {
                        continue;
                    }
                    let parsed: Value =
                        serde_json::from_str(&entry.value).unwrap_or(Value::String(entry.value.clone()));
                    set_path(&mut value, &entry.key, parsed);
                }
            }
        }

        match serde_json::from_value(value) {
            Ok(rt) => rt,
            Err(e) => {
                warn!(error = %e, "Broadcast produced invalid runtime settings; ignoring overrides");
                runtime.clone()
            }
        }
    }
}

/// Set a dotted path inside a JSON object, creating intermediate objects
fn set_path(root: &mut Value, path: &str, new_value: Value) {
    let mut current = root;
    let parts: Vec<&str> = path.split('.').collect();
    for (i, part) in parts.iter().enumerate() {
        let Value::Object(map) = current else { return };
        if i == parts.len() - 1 {
            map.insert(part.to_string(), new_value);
            return;
        }
        current = map
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
        if !matches!(current, Value::Object(_)) {
            *current = Value::Object(serde_json::Map::new());
        }
    }
}
