//! Event handler engine
//!
//! Task and workflow events fire user-defined commands. Handler command
//! templates are rendered with handlebars (`{{workflow}}`, `{{id}}`,
//! `{{event}}`, `{{message}}`, ...), executed through `sh -c` under a
//! bounded-concurrency pool, and retried on non-zero exit according to the
//! handler retry schedule. Completions come back to the main loop so
//! `abort if <event> handler fails` can escalate.

use std::sync::Arc;
use std::time::Duration;

use handlebars::Handlebars;
use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, warn};

use crate::task::TaskId;

/// Template context for one handler invocation
#[derive(Debug, Clone, Serialize)]
pub struct HandlerContext {
    /// Workflow id
    pub workflow: String,
    /// Task id (`name.point`), empty for workflow events
    pub id: String,
    /// Task name, empty for workflow events
    pub name: String,
    /// Cycle point, empty for workflow events
    pub point: String,
    /// Event label, e.g. `failed`, `stall`
    pub event: String,
    /// Free-text detail
    pub message: String,
}

impl HandlerContext {
    /// Context for a task event
    pub fn task(workflow: &str, id: &TaskId, event: &str, message: &str) -> Self {
        Self {
            workflow: workflow.to_string(),
            id: id.to_string(),
            name: id.name.clone(),
            point: id.point.clone(),
            event: event.to_string(),
            message: message.to_string(),
        }
    }

    /// Context for a workflow event
    pub fn workflow(workflow: &str, event: &str, message: &str) -> Self {
        Self {
            workflow: workflow.to_string(),
            id: String::new(),
            name: String::new(),
            point: String::new(),
            event: event.to_string(),
            message: message.to_string(),
        }
    }
}

/// Completion report delivered to the main loop
#[derive(Debug)]
pub struct HandlerDone {
    /// Event that fired the handler
    pub event: String,
    /// Task id when task-scoped
    pub id: Option<TaskId>,
    /// Rendered command
    pub command: String,
    /// Final verdict after retries
    pub success: bool,
    /// Attempts made
    pub attempts: u32,
}

/// Dispatches handler commands with bounded concurrency
pub struct HandlerEngine {
    workflow: String,
    semaphore: Arc<Semaphore>,
    tx: mpsc::Sender<HandlerDone>,
    timeout: Duration,
}

impl HandlerEngine {
    pub fn new(workflow: &str, max_active: usize, tx: mpsc::Sender<HandlerDone>) -> Self {
        Self {
            workflow: workflow.to_string(),
            semaphore: Arc::new(Semaphore::new(max_active.max(1))),
            tx,
            timeout: Duration::from_secs(300),
        }
    }

    /// Render and dispatch every template for one event. `retry_delays`
    /// re-runs a handler that exits non-zero.
    pub fn fire(
        &self,
        templates: &[String],
        ctx: &HandlerContext,
        retry_delays: Vec<Duration>,
        id: Option<TaskId>,
    ) {
        for template in templates {
            let command = match render_template(template, ctx) {
                Ok(c) => c,
                Err(e) => {
                    warn!(template, error = %e, "Bad handler template; skipping");
                    continue;
                }
            };
            let semaphore = self.semaphore.clone();
            let tx = self.tx.clone();
            let event = ctx.event.clone();
            let id = id.clone();
            let delays = retry_delays.clone();
            let timeout = self.timeout;
            tokio::spawn(async move {
                let _permit = match semaphore.acquire().await {
                    Ok(p) => p,
                    Err(_) => return,
                };
                let mut attempts = 0u32;
                let mut remaining = delays.into_iter();
                let success = loop {
                    attempts += 1;
                    if run_once(&command, timeout).await {
                        break true;
                    }
                    match remaining.next() {
                        Some(delay) => {
                            debug!(command, attempts, ?delay, "Handler failed; retrying");
                            tokio::time::sleep(delay).await;
                        }
                        None => break false,
                    }
                };
                let _ = tx
                    .send(HandlerDone {
                        event,
                        id,
                        command,
                        success,
                        attempts,
                    })
                    .await;
            });
        }
    }

    /// The workflow id handlers are fired for
    pub fn workflow(&self) -> &str {
        &self.workflow
    }
}

/// Render one handler template
pub fn render_template(template: &str, ctx: &HandlerContext) -> eyre::Result<String> {
    let handlebars = Handlebars::new();
    handlebars
        .render_template(template, ctx)
        .map_err(|e| eyre::eyre!("handler template {:?}: {}", template, e))
}

async fn run_once(command: &str, timeout: Duration) -> bool {
    let result = tokio::time::timeout(
        timeout,
        tokio::process::Command::new("sh").arg("-c").arg(command).output(),
    )
    .await;
    match result {
        Ok(Ok(output)) => {
            if !output.status.success() {
                debug!(command, status = ?output.status.code(), "Handler exited non-zero");
            }
            output.status.success()
        }
        Ok(Err(e)) => {
            warn!(command, error = %e, "Handler could not be spawned");
            false
        }
        Err(_) => {
            warn!(command, "Handler timed out");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cycling::CyclePoint;

    fn ctx(event: &str) -> HandlerContext {
        HandlerContext::task(
            "wf",
            &TaskId::new("t", &CyclePoint::Integer(1)),
            event,
            "job failed",
        )
    }

    #[test]
    fn test_template_rendering() {
        let rendered = render_template("notify {{workflow}} {{id}} {{event}}: {{message}}", &ctx("failed")).unwrap();
        assert_eq!(rendered, "notify wf t.1 failed: job failed");
    }

    #[test]
    fn test_bad_template_is_an_error() {
        assert!(render_template("echo {{#if}}", &ctx("failed")).is_err());
    }

    #[tokio::test]
    async fn test_fire_reports_success() {
        let (tx, mut rx) = mpsc::channel(4);
        let engine = HandlerEngine::new("wf", 2, tx);
        engine.fire(&["true".to_string()], &ctx("succeeded"), Vec::new(), None);

        let done = rx.recv().await.unwrap();
        assert!(done.success);
        assert_eq!(done.attempts, 1);
        assert_eq!(done.event, "succeeded");
    }

    #[tokio::test]
    async fn test_fire_retries_then_reports_failure() {
        let (tx, mut rx) = mpsc::channel(4);
        let engine = HandlerEngine::new("wf", 2, tx);
        engine.fire(
            &["false".to_string()],
            &ctx("failed"),
            vec![Duration::from_millis(10)],
            Some(TaskId::new("t", &CyclePoint::Integer(1))),
        );

        let done = rx.recv().await.unwrap();
        assert!(!done.success);
        assert_eq!(done.attempts, 2);
        assert_eq!(done.id, Some(TaskId::new("t", &CyclePoint::Integer(1))));
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let (tx, mut rx) = mpsc::channel(16);
        let engine = HandlerEngine::new("wf", 1, tx);
        let start = std::time::Instant::now();
        // Two handlers of ~100ms each through a single slot
        engine.fire(
            &["sleep 0.1".to_string(), "sleep 0.1".to_string()],
            &ctx("started"),
            Vec::new(),
            None,
        );
        let _ = rx.recv().await.unwrap();
        let _ = rx.recv().await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(200));
    }
}
