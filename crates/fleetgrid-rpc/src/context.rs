//! Process-wide manager context shared by every command.

use std::sync::Arc;
use std::time::Duration;

use fleetgrid_model::Registry;
use fleetgrid_tasks::{MaintenanceGate, TaskRunner, TaskTracker};

use crate::auth::{AuthSettings, TeamDirectory};
use crate::supervisor::Supervisor;

/// How long a result poll waits for a running task by default.
pub const DEFAULT_RESULT_WAIT: Duration = Duration::from_secs(30);

/// Everything a command needs: identity of this manager, the registry,
/// the task runner, and the external collaborators.
pub struct ManagerContext {
    pub region: String,
    pub host: String,
    pub registry: Registry,
    pub runner: TaskRunner,
    pub directory: Arc<dyn TeamDirectory>,
    pub supervisor: Arc<dyn Supervisor>,
    pub auth: AuthSettings,
    /// Placement candidates for deploys without explicit hosts.
    pub supervisor_hosts: Vec<String>,
    /// Bound on `<Verb>Result` polls.
    pub result_wait: Duration,
}

impl std::fmt::Debug for ManagerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagerContext")
            .field("region", &self.region)
            .field("host", &self.host)
            .field("auth", &self.auth)
            .field("supervisor_hosts", &self.supervisor_hosts)
            .field("result_wait", &self.result_wait)
            .finish_non_exhaustive()
    }
}

impl ManagerContext {
    pub fn new(
        region: impl Into<String>,
        host: impl Into<String>,
        registry: Registry,
        runner: TaskRunner,
        directory: Arc<dyn TeamDirectory>,
        supervisor: Arc<dyn Supervisor>,
    ) -> Self {
        Self {
            region: region.into(),
            host: host.into(),
            registry,
            runner,
            directory,
            supervisor,
            auth: AuthSettings::default(),
            supervisor_hosts: Vec::new(),
            result_wait: DEFAULT_RESULT_WAIT,
        }
    }

    pub fn with_auth(mut self, auth: AuthSettings) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_supervisor_hosts(mut self, hosts: Vec<String>) -> Self {
        self.supervisor_hosts = hosts;
        self
    }

    pub fn with_result_wait(mut self, wait: Duration) -> Self {
        self.result_wait = wait;
        self
    }

    pub fn tracker(&self) -> &TaskTracker {
        self.runner.tracker()
    }

    pub fn gate(&self) -> &MaintenanceGate {
        self.runner.gate()
    }
}
