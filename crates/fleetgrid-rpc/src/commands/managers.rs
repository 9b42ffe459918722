//! Manager introspection and role administration.

use async_trait::async_trait;
use fleetgrid_tasks::{Task, TaskResult};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::{Verb, require, to_value, verb};
use crate::auth::AuthArg;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthOnlyArg {
    pub auth: AuthArg,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoleArg {
    pub auth: AuthArg,
    pub region: String,
    pub host: String,
    pub role: String,
    /// Permission type, e.g. `read` or `write`.
    pub rtype: String,
}

verb!(
    /// Whether no other task is running. Anyone may ask, even during
    /// maintenance.
    Idle(AuthOnlyArg)
);

#[async_trait]
impl Verb for Idle {
    fn description(&self) -> String {
        "Idle?".into()
    }

    fn allow_during_maintenance(&self) -> bool {
        true
    }

    async fn authorize(&self) -> TaskResult<()> {
        Ok(())
    }

    async fn execute(&self, task: &Task) -> TaskResult<Value> {
        let idle = self.ctx.tracker().is_idle(Some(task.id()));
        Ok(json!({ "idle": idle }))
    }
}

verb!(ListManagers(AuthOnlyArg));

#[async_trait]
impl Verb for ListManagers {
    fn description(&self) -> String {
        format!("[{}] ListManagers", self.arg.auth.user)
    }

    async fn authorize(&self) -> TaskResult<()> {
        self.ctx.simple_authorize(&self.arg.auth).await
    }

    async fn execute(&self, _task: &Task) -> TaskResult<Value> {
        let managers = self.ctx.registry.list_managers().await?;
        Ok(json!({ "managers": managers }))
    }
}

impl RoleArg {
    fn validate(&self) -> TaskResult<()> {
        require("region", &self.region)?;
        require("host", &self.host)?;
        require("role", &self.role)?;
        require("role type", &self.rtype)
    }

    fn describe(&self) -> String {
        format!(
            "[{}] {}:{} on {}/{}",
            self.auth.user, self.rtype, self.role, self.region, self.host
        )
    }
}

verb!(GrantRole(RoleArg));

#[async_trait]
impl Verb for GrantRole {
    fn description(&self) -> String {
        self.arg.describe()
    }

    fn validate(&self) -> TaskResult<()> {
        self.arg.validate()
    }

    async fn authorize(&self) -> TaskResult<()> {
        self.ctx.authorize_super_user(&self.arg.auth).await
    }

    async fn execute(&self, _task: &Task) -> TaskResult<Value> {
        let a = &self.arg;
        let record = self
            .ctx
            .registry
            .set_manager_role(&a.region, &a.host, &a.role, &a.rtype, true)
            .await?;
        to_value(record)
    }
}

verb!(RevokeRole(RoleArg));

#[async_trait]
impl Verb for RevokeRole {
    fn description(&self) -> String {
        self.arg.describe()
    }

    fn validate(&self) -> TaskResult<()> {
        self.arg.validate()
    }

    async fn authorize(&self) -> TaskResult<()> {
        self.ctx.authorize_super_user(&self.arg.auth).await
    }

    async fn execute(&self, _task: &Task) -> TaskResult<Value> {
        let a = &self.arg;
        let record = self
            .ctx
            .registry
            .set_manager_role(&a.region, &a.host, &a.role, &a.rtype, false)
            .await?;
        to_value(record)
    }
}
