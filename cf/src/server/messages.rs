//! Wire protocol for the command channel
//!
//! Newline-delimited JSON over TCP. Every request carries the per-workflow
//! bearer token from the contact file:
//!
//! ```text
//! {"command": "hold", "args": {"ids": ["a.1"]}, "token": "..."}
//! ```
//!
//! Responses are `{"ok": true, "data": ...}` or
//! `{"error": true, "kind": "...", "message": "..."}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One request line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub command: String,
    #[serde(default)]
    pub args: Value,
    #[serde(default)]
    pub token: String,
}

/// Error classification carried to clients (drives CLI exit codes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// Malformed or unauthenticated request; client error
    BadRequest,
    /// Bad or missing token
    Auth,
    /// Target instance/setting does not exist
    NotFound,
    /// Internal scheduler failure
    Server,
}

/// One response line
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Response {
    Ok {
        ok: bool,
        #[serde(default)]
        data: Value,
    },
    Error {
        error: bool,
        kind: ErrorKind,
        message: String,
    },
}

impl Response {
    pub fn ok(data: Value) -> Self {
        Self::Ok { ok: true, data }
    }

    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Error {
            error: true,
            kind,
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }
}

/// Workflow stop modes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StopMode {
    /// Finish active tasks, then shut down
    Clean,
    /// Halt new dispatches; wait for in-flight submissions/polls/handlers
    Now,
    /// Abandon in-flight work after a final checkpoint
    NowNow,
    /// Stop cleanly once the wall clock reaches the given time
    AtClockTime(String),
    /// Hold spawning beyond the given point, stop when it is complete
    AtCyclePoint(String),
}

/// Broadcast sub-operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BroadcastOp {
    Set,
    Cancel,
    Clear,
    Expire,
}

/// A validated command ready for the main loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", content = "args", rename_all = "kebab-case")]
pub enum Command {
    Ping,
    Hold {
        ids: Vec<String>,
    },
    Release {
        ids: Vec<String>,
    },
    Trigger {
        ids: Vec<String>,
    },
    Set {
        id: String,
        #[serde(default)]
        outputs: Vec<String>,
    },
    Remove {
        ids: Vec<String>,
    },
    Kill {
        ids: Vec<String>,
    },
    Poll {
        ids: Vec<String>,
    },
    Reload,
    Stop {
        mode: StopMode,
    },
    Broadcast {
        op: BroadcastOp,
        #[serde(default)]
        points: Vec<String>,
        #[serde(default)]
        namespaces: Vec<String>,
        #[serde(default)]
        settings: std::collections::BTreeMap<String, String>,
        #[serde(default)]
        keys: Vec<String>,
        #[serde(default)]
        cutoff: Option<String>,
    },
    ExtTrigger {
        event: String,
        #[serde(default)]
        point: Option<String>,
    },
    /// Task job status message (same channel, workflow token)
    Message {
        id: String,
        #[serde(default)]
        severity: Option<String>,
        messages: Vec<String>,
    },
    Show {
        id: String,
    },
    Dump,
}

impl Command {
    /// Parse the wire request into a typed command
    pub fn from_request(req: &Request) -> Result<Self, Response> {
        let envelope = serde_json::json!({
            "command": req.command,
            "args": req.args,
        });
        serde_json::from_value(envelope)
            .map_err(|e| Response::error(ErrorKind::BadRequest, format!("bad command {:?}: {}", req.command, e)))
    }
}
