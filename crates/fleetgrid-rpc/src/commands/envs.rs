//! Environments and their dependency values.

use std::collections::BTreeMap;

use async_trait::async_trait;
use fleetgrid_tasks::{Task, TaskResult};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::{Verb, require, verb};
use crate::auth::AuthArg;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateEnvArg {
    pub auth: AuthArg,
    pub name: String,
    pub parent: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvArg {
    pub auth: AuthArg,
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ListEnvsArg {
    pub auth: AuthArg,
    pub app: String,
    pub sha: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvDepArg {
    pub auth: AuthArg,
    pub env: String,
    pub name: String,
    pub value: String,
    /// Store the value sealed.
    pub encrypt: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeleteEnvDepArg {
    pub auth: AuthArg,
    pub env: String,
    pub name: String,
}

verb!(UpdateEnv(UpdateEnvArg));

#[async_trait]
impl Verb for UpdateEnv {
    fn description(&self) -> String {
        format!(
            "[{}] {} parent={}",
            self.arg.auth.user,
            self.arg.name,
            self.arg.parent.as_deref().unwrap_or("-")
        )
    }

    fn validate(&self) -> TaskResult<()> {
        require("env name", &self.arg.name)
    }

    async fn authorize(&self) -> TaskResult<()> {
        self.ctx.check_role("envs", "write").await?;
        self.ctx.authorize_super_user(&self.arg.auth).await
    }

    async fn execute(&self, _task: &Task) -> TaskResult<Value> {
        let parent = self.arg.parent.as_deref().filter(|p| !p.is_empty());
        let env = self.ctx.registry.update_env(&self.arg.name, parent).await?;
        Ok(redacted(&env))
    }
}

verb!(DeleteEnv(EnvArg));

#[async_trait]
impl Verb for DeleteEnv {
    fn description(&self) -> String {
        format!("[{}] {}", self.arg.auth.user, self.arg.name)
    }

    fn validate(&self) -> TaskResult<()> {
        require("env name", &self.arg.name)
    }

    async fn authorize(&self) -> TaskResult<()> {
        self.ctx.check_role("envs", "write").await?;
        self.ctx.authorize_super_user(&self.arg.auth).await
    }

    async fn execute(&self, _task: &Task) -> TaskResult<Value> {
        self.ctx.registry.delete_env(&self.arg.name).await?;
        Ok(json!({ "name": self.arg.name }))
    }
}

verb!(GetEnv(EnvArg));

#[async_trait]
impl Verb for GetEnv {
    fn description(&self) -> String {
        format!("[{}] {}", self.arg.auth.user, self.arg.name)
    }

    fn validate(&self) -> TaskResult<()> {
        require("env name", &self.arg.name)
    }

    async fn authorize(&self) -> TaskResult<()> {
        self.ctx.simple_authorize(&self.arg.auth).await
    }

    async fn execute(&self, _task: &Task) -> TaskResult<Value> {
        Ok(redacted(&self.ctx.registry.get_env(&self.arg.name).await?))
    }
}

/// Sealed dependency values never leave the manager.
fn redacted(env: &fleetgrid_model::Env) -> Value {
    let deps: BTreeMap<&str, Value> = env
        .deps
        .iter()
        .map(|(name, dep)| {
            let value = if dep.encrypted {
                json!({ "encrypted": true })
            } else {
                json!({ "value": dep.value, "encrypted": false })
            };
            (name.as_str(), value)
        })
        .collect();
    json!({ "name": env.name, "parent": env.parent, "deps": deps })
}

verb!(
    /// All envs, or the envs `app` at `sha` is deployed in.
    ListEnvs(ListEnvsArg)
);

#[async_trait]
impl Verb for ListEnvs {
    fn description(&self) -> String {
        if self.arg.app.is_empty() || self.arg.sha.is_empty() {
            format!("[{}] All", self.arg.auth.user)
        } else {
            format!("[{}] {} @ {}", self.arg.auth.user, self.arg.app, self.arg.sha)
        }
    }

    async fn authorize(&self) -> TaskResult<()> {
        if self.arg.app.is_empty() {
            return self.ctx.simple_authorize(&self.arg.auth).await;
        }
        self.ctx.authorize_app(&self.arg.auth, &self.arg.app).await
    }

    async fn execute(&self, _task: &Task) -> TaskResult<Value> {
        let registry = &self.ctx.registry;
        let envs = if self.arg.app.is_empty() || self.arg.sha.is_empty() {
            registry.list_envs().await?
        } else {
            registry.list_app_envs(&self.arg.app, &self.arg.sha).await?
        };
        Ok(json!({ "envs": envs }))
    }
}

verb!(SetEnvDep(EnvDepArg));

#[async_trait]
impl Verb for SetEnvDep {
    fn description(&self) -> String {
        format!(
            "[{}] {} in {} encrypted={}",
            self.arg.auth.user, self.arg.name, self.arg.env, self.arg.encrypt
        )
    }

    fn validate(&self) -> TaskResult<()> {
        require("env", &self.arg.env)?;
        require("dependency name", &self.arg.name)?;
        require("value", &self.arg.value)
    }

    async fn authorize(&self) -> TaskResult<()> {
        self.ctx.check_role("envs", "write").await?;
        self.ctx.authorize_super_user(&self.arg.auth).await
    }

    async fn execute(&self, _task: &Task) -> TaskResult<Value> {
        let a = &self.arg;
        let env = self
            .ctx
            .registry
            .set_env_dep(&a.env, &a.name, &a.value, a.encrypt)
            .await?;
        Ok(redacted(&env))
    }
}

verb!(DeleteEnvDep(DeleteEnvDepArg));

#[async_trait]
impl Verb for DeleteEnvDep {
    fn description(&self) -> String {
        format!("[{}] {} in {}", self.arg.auth.user, self.arg.name, self.arg.env)
    }

    fn validate(&self) -> TaskResult<()> {
        require("env", &self.arg.env)?;
        require("dependency name", &self.arg.name)
    }

    async fn authorize(&self) -> TaskResult<()> {
        self.ctx.check_role("envs", "write").await?;
        self.ctx.authorize_super_user(&self.arg.auth).await
    }

    async fn execute(&self, _task: &Task) -> TaskResult<Value> {
        let env = self
            .ctx
            .registry
            .delete_env_dep(&self.arg.env, &self.arg.name)
            .await?;
        Ok(redacted(&env))
    }
}
