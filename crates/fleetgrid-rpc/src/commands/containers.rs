//! Container queries and the supervisor maintenance pass-through.

use async_trait::async_trait;
use fleetgrid_tasks::{Task, TaskResult};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::{Verb, require, verb};
use crate::auth::AuthArg;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerArg {
    pub auth: AuthArg,
    pub container_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ListContainersArg {
    pub auth: AuthArg,
    pub app: String,
    pub sha: String,
    pub env: String,
}

impl ListContainersArg {
    fn is_unfiltered(&self) -> bool {
        self.app.is_empty() && self.sha.is_empty() && self.env.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ListShasArg {
    pub auth: AuthArg,
    pub app: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerMaintenanceArg {
    pub auth: AuthArg,
    pub container_id: String,
    pub maintenance: bool,
}

verb!(GetContainer(ContainerArg));

#[async_trait]
impl Verb for GetContainer {
    fn description(&self) -> String {
        format!("[{}] {}", self.arg.auth.user, self.arg.container_id)
    }

    fn validate(&self) -> TaskResult<()> {
        require("container id", &self.arg.container_id)
    }

    async fn authorize(&self) -> TaskResult<()> {
        self.ctx.simple_authorize(&self.arg.auth).await
    }

    async fn execute(&self, _task: &Task) -> TaskResult<Value> {
        let instance = self
            .ctx
            .registry
            .get_instance(&self.arg.container_id)
            .await?;
        let mut container = self
            .ctx
            .supervisor
            .get(&instance.host, &self.arg.container_id)
            .await?;
        container.host = instance.host;
        Ok(json!({ "container": container }))
    }
}

verb!(
    /// Containers of one (app, sha, env), or every container the caller
    /// may see when no filter is given.
    ListContainers(ListContainersArg)
);

#[async_trait]
impl Verb for ListContainers {
    fn description(&self) -> String {
        let a = &self.arg;
        format!("[{}] {} @ {} in {}", a.auth.user, a.app, a.sha, a.env)
    }

    fn validate(&self) -> TaskResult<()> {
        if self.arg.is_unfiltered() {
            return Ok(());
        }
        require("app", &self.arg.app)?;
        require("sha", &self.arg.sha)?;
        require("env", &self.arg.env)
    }

    async fn authorize(&self) -> TaskResult<()> {
        if self.arg.is_unfiltered() {
            return self.ctx.simple_authorize(&self.arg.auth).await;
        }
        self.ctx.authorize_app(&self.arg.auth, &self.arg.app).await
    }

    async fn execute(&self, _task: &Task) -> TaskResult<Value> {
        let a = &self.arg;
        let registry = &self.ctx.registry;
        if !a.is_unfiltered() {
            let ids = registry.list_instances(&a.app, &a.sha, &a.env).await?;
            return Ok(json!({ "container_ids": ids }));
        }

        let mut ids = registry.list_all_instances().await?;
        if !self.ctx.is_super_user(&a.auth).await {
            let allowed = self.ctx.allowed_apps(&a.auth).await?;
            ids.retain(|id| {
                fleetgrid_model::parse_instance_id(id)
                    .is_some_and(|(app, _, _)| allowed.contains(app))
            });
        }
        Ok(json!({ "container_ids": ids }))
    }
}

verb!(ListShas(ListShasArg));

#[async_trait]
impl Verb for ListShas {
    fn description(&self) -> String {
        format!("[{}] {}", self.arg.auth.user, self.arg.app)
    }

    fn validate(&self) -> TaskResult<()> {
        require("app", &self.arg.app)
    }

    async fn authorize(&self) -> TaskResult<()> {
        self.ctx.authorize_app(&self.arg.auth, &self.arg.app).await
    }

    async fn execute(&self, _task: &Task) -> TaskResult<Value> {
        let shas = self.ctx.registry.list_shas(&self.arg.app).await?;
        Ok(json!({ "shas": shas }))
    }
}

verb!(
    /// Toggle a container's maintenance flag on its supervisor.
    ContainerMaintenance(ContainerMaintenanceArg)
);

#[async_trait]
impl Verb for ContainerMaintenance {
    fn description(&self) -> String {
        format!(
            "[{}] {} : {}",
            self.arg.auth.user, self.arg.container_id, self.arg.maintenance
        )
    }

    fn validate(&self) -> TaskResult<()> {
        require("container id", &self.arg.container_id)
    }

    async fn authorize(&self) -> TaskResult<()> {
        let instance = self
            .ctx
            .registry
            .get_instance(&self.arg.container_id)
            .await?;
        self.ctx.authorize_app(&self.arg.auth, &instance.app).await
    }

    async fn execute(&self, _task: &Task) -> TaskResult<Value> {
        let instance = self
            .ctx
            .registry
            .get_instance(&self.arg.container_id)
            .await?;
        let status = self
            .ctx
            .supervisor
            .container_maintenance(&instance.host, &self.arg.container_id, self.arg.maintenance)
            .await?;
        Ok(json!({ "status": status }))
    }
}
