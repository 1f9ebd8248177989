//! CycleStore - the workflow database
//!
//! A single-writer SQLite store that is the scheduler's write-ahead record
//! of state changes and the source of truth after a crash. The scheduler
//! groups all writes for a main-loop tick into one transaction; read-only
//! consumers (CLI `dump`, the review UI) open their own connections against
//! the public copy.
//!
//! Tables:
//!
//! - `task_states` - one row per (name, cycle): latest state
//! - `task_jobs` - one row per (cycle, name, submit_num): job identity
//! - `task_outputs` - completed outputs per (cycle, name), JSON list
//! - `task_events` - append-only event journal
//! - `broadcast_events` - append-only broadcast journal (`+`/`-` changes)
//! - `workflow_params` - key/value scheduler parameters
//! - `task_pool` - the rolling active set, rewritten on checkpoint
//! - `xtriggers` - satisfied xtrigger signatures and their results

mod store;
mod types;

pub use store::{Batch, Store, StoreError};
pub use types::{
    BroadcastChange, BroadcastEventRow, PoolRow, TaskEventRow, TaskJobRow, TaskStateRow, XtriggerRow,
};

/// Current wall-clock time as an ISO-8601 UTC string (second precision)
pub fn now_iso() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Current Unix timestamp in milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
