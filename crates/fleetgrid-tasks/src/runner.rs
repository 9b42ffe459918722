//! Task runner: the single authorize-then-execute-then-record path.
//!
//! Every verb goes through [`TaskRunner::run`] (caller waits for the result)
//! or [`TaskRunner::spawn`] (caller gets a task ID and polls
//! [`TaskRunner::result`]). Both log an audit line when the task starts and
//! when it finishes, whatever the outcome.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::command::Command;
use crate::error::{TaskError, TaskResult};
use crate::maintenance::MaintenanceGate;
use crate::tracker::{Task, TaskSnapshot, TaskStatus, TaskTracker};

#[derive(Debug, Clone)]
pub struct TaskRunner {
    tracker: TaskTracker,
    gate: MaintenanceGate,
}

impl TaskRunner {
    pub fn new(tracker: TaskTracker, gate: MaintenanceGate) -> Self {
        Self { tracker, gate }
    }

    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    pub fn gate(&self) -> &MaintenanceGate {
        &self.gate
    }

    /// Run a command to completion and return its result.
    pub async fn run(&self, command: Arc<dyn Command>) -> TaskResult<Value> {
        let task = self.admit(command.as_ref()).await?;
        match self.launch(command.clone(), task.clone()).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let outcome = Err(TaskError::Internal(e.to_string()));
                self.complete(&task, command.as_ref(), &outcome);
                outcome
            }
        }
    }

    /// Admit a command and execute it in the background. Maintenance,
    /// validation and authorization failures are returned here; execution
    /// failures only through [`result`](Self::result).
    pub async fn spawn(&self, command: Arc<dyn Command>) -> TaskResult<String> {
        let task = self.admit(command.as_ref()).await?;
        let id = task.id().to_string();
        drop(self.launch(command, task));
        Ok(id)
    }

    /// Snapshot of a task, waiting up to `wait` for it to finish.
    pub async fn result(&self, id: &str, wait: Duration) -> TaskResult<TaskSnapshot> {
        self.tracker
            .wait(id, wait)
            .await
            .ok_or_else(|| TaskError::NotFound(format!("task {id} not found")))
    }

    async fn admit(&self, command: &dyn Command) -> TaskResult<Task> {
        let task = self
            .tracker
            .create(command.name(), command.user(), command.description());
        info!(
            task_id = %task.id(),
            verb = command.name(),
            user = command.user(),
            description = %command.description(),
            "task started"
        );

        let admitted = async {
            if self.gate.is_active() && !command.allow_during_maintenance() {
                return Err(TaskError::MaintenanceMode);
            }
            command.validate()?;
            self.tracker.set_status(task.id(), TaskStatus::Authorizing);
            command.authorize().await
        }
        .await;

        match admitted {
            Ok(()) => {
                self.tracker.set_status(task.id(), TaskStatus::Executing);
                Ok(task)
            }
            Err(e) => {
                let outcome = Err(e.clone());
                self.complete(&task, command, &outcome);
                Err(e)
            }
        }
    }

    /// Execute on its own tokio task so a panic fails the task instead of
    /// the caller.
    fn launch(&self, command: Arc<dyn Command>, task: Task) -> JoinHandle<TaskResult<Value>> {
        let runner = self.clone();
        tokio::spawn(async move {
            let execution = {
                let command = command.clone();
                let task = task.clone();
                tokio::spawn(async move { command.execute(&task).await })
            };
            let outcome = match execution.await {
                Ok(outcome) => outcome,
                Err(e) if e.is_panic() => Err(TaskError::Internal(format!(
                    "{} panicked while executing",
                    command.name()
                ))),
                Err(e) => Err(TaskError::Internal(e.to_string())),
            };
            runner.complete(&task, command.as_ref(), &outcome);
            outcome
        })
    }

    fn complete(&self, task: &Task, command: &dyn Command, outcome: &TaskResult<Value>) {
        self.tracker.finish(task.id(), outcome);
        match outcome {
            Ok(_) => info!(
                task_id = %task.id(),
                verb = command.name(),
                user = command.user(),
                description = %command.description(),
                status = "done",
                "task finished"
            ),
            Err(e) => warn!(
                task_id = %task.id(),
                verb = command.name(),
                user = command.user(),
                description = %command.description(),
                status = "failed",
                kind = e.kind(),
                error = %e,
                "task finished"
            ),
        }
    }
}
