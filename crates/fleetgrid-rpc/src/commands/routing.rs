//! Router ports, pools, and the router registry.

use async_trait::async_trait;
use fleetgrid_model::{RouterRecord, Scope};
use fleetgrid_tasks::{Task, TaskError, TaskResult};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::{Verb, require, to_value, verb};
use crate::auth::AuthArg;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReserveRouterPortArg {
    pub auth: AuthArg,
    pub app: String,
    pub env: String,
    pub internal: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopeArg {
    pub auth: AuthArg,
    pub internal: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolArg {
    pub auth: AuthArg,
    pub internal: bool,
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolMembersArg {
    pub auth: AuthArg,
    pub container_ids: Vec<String>,
}

impl PoolMembersArg {
    fn validate(&self) -> TaskResult<()> {
        if self.container_ids.is_empty() {
            return Err(TaskError::missing("container id"));
        }
        for id in &self.container_ids {
            require("container id", id)?;
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("[{}] {}", self.auth.user, self.container_ids.join(","))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterArg {
    pub auth: AuthArg,
    pub internal: bool,
    pub zone: String,
    pub host: String,
    /// Only read by `RegisterRouter`.
    pub ip: String,
}

impl RouterArg {
    fn scope(&self) -> Scope {
        Scope::from_internal(self.internal)
    }

    fn validate(&self) -> TaskResult<()> {
        require("zone", &self.zone)?;
        require("host", &self.host)
    }

    fn describe(&self) -> String {
        format!(
            "[{}] {} router {}/{}",
            self.auth.user,
            self.scope(),
            self.zone,
            self.host
        )
    }
}

verb!(
    /// Idempotently reserve the router port of an (app, env).
    ReserveRouterPort(ReserveRouterPortArg)
);

#[async_trait]
impl Verb for ReserveRouterPort {
    fn description(&self) -> String {
        let a = &self.arg;
        format!(
            "[{}] {} in {} ({})",
            a.auth.user,
            a.app,
            a.env,
            Scope::from_internal(a.internal)
        )
    }

    fn validate(&self) -> TaskResult<()> {
        require("app", &self.arg.app)?;
        require("env", &self.arg.env)
    }

    async fn authorize(&self) -> TaskResult<()> {
        self.ctx.check_role("routers", "write").await?;
        self.ctx.authorize_app(&self.arg.auth, &self.arg.app).await
    }

    async fn execute(&self, _task: &Task) -> TaskResult<Value> {
        let a = &self.arg;
        let reservation = self
            .ctx
            .registry
            .reserve_router_port(Scope::from_internal(a.internal), &a.app, &a.env)
            .await?;
        to_value(reservation)
    }
}

verb!(ListRouterPorts(ScopeArg));

#[async_trait]
impl Verb for ListRouterPorts {
    fn description(&self) -> String {
        format!(
            "[{}] {}",
            self.arg.auth.user,
            Scope::from_internal(self.arg.internal)
        )
    }

    async fn authorize(&self) -> TaskResult<()> {
        self.ctx.simple_authorize(&self.arg.auth).await
    }

    async fn execute(&self, _task: &Task) -> TaskResult<Value> {
        let ports = self
            .ctx
            .registry
            .list_router_ports(Scope::from_internal(self.arg.internal))
            .await?;
        Ok(json!({ "ports": ports }))
    }
}

verb!(ListPools(ScopeArg));

#[async_trait]
impl Verb for ListPools {
    fn description(&self) -> String {
        format!(
            "[{}] {}",
            self.arg.auth.user,
            Scope::from_internal(self.arg.internal)
        )
    }

    async fn authorize(&self) -> TaskResult<()> {
        self.ctx.simple_authorize(&self.arg.auth).await
    }

    async fn execute(&self, _task: &Task) -> TaskResult<Value> {
        let pools = self
            .ctx
            .registry
            .list_pools(Scope::from_internal(self.arg.internal))
            .await?;
        Ok(json!({ "pools": pools }))
    }
}

verb!(GetPool(PoolArg));

#[async_trait]
impl Verb for GetPool {
    fn description(&self) -> String {
        format!("[{}] {}", self.arg.auth.user, self.arg.name)
    }

    fn validate(&self) -> TaskResult<()> {
        require("pool name", &self.arg.name)
    }

    async fn authorize(&self) -> TaskResult<()> {
        self.ctx.simple_authorize(&self.arg.auth).await
    }

    async fn execute(&self, _task: &Task) -> TaskResult<Value> {
        let pool = self
            .ctx
            .registry
            .get_pool(Scope::from_internal(self.arg.internal), &self.arg.name)
            .await?;
        to_value(pool)
    }
}

verb!(
    /// Put running containers behind their pools.
    AddToPool(PoolMembersArg)
);

#[async_trait]
impl Verb for AddToPool {
    fn description(&self) -> String {
        self.arg.describe()
    }

    fn validate(&self) -> TaskResult<()> {
        self.arg.validate()
    }

    async fn authorize(&self) -> TaskResult<()> {
        self.ctx.check_role("routers", "write").await?;
        self.ctx.authorize_super_user(&self.arg.auth).await
    }

    async fn execute(&self, _task: &Task) -> TaskResult<Value> {
        self.ctx
            .registry
            .add_to_pool(&self.arg.container_ids)
            .await?;
        Ok(json!({ "container_ids": self.arg.container_ids }))
    }
}

verb!(
    /// Take containers out of their pools; emptied pools are removed.
    DeleteFromPool(PoolMembersArg)
);

#[async_trait]
impl Verb for DeleteFromPool {
    fn description(&self) -> String {
        self.arg.describe()
    }

    fn validate(&self) -> TaskResult<()> {
        self.arg.validate()
    }

    async fn authorize(&self) -> TaskResult<()> {
        self.ctx.check_role("routers", "write").await?;
        self.ctx.authorize_super_user(&self.arg.auth).await
    }

    async fn execute(&self, _task: &Task) -> TaskResult<Value> {
        self.ctx
            .registry
            .delete_from_pool(&self.arg.container_ids)
            .await?;
        Ok(json!({ "container_ids": self.arg.container_ids }))
    }
}

verb!(RegisterRouter(RouterArg));

#[async_trait]
impl Verb for RegisterRouter {
    fn description(&self) -> String {
        format!("{} at {}", self.arg.describe(), self.arg.ip)
    }

    fn validate(&self) -> TaskResult<()> {
        self.arg.validate()?;
        require("ip", &self.arg.ip)
    }

    async fn authorize(&self) -> TaskResult<()> {
        self.ctx.check_role("routers", "write").await?;
        self.ctx.authorize_super_user(&self.arg.auth).await
    }

    async fn execute(&self, _task: &Task) -> TaskResult<Value> {
        let a = &self.arg;
        let router = RouterRecord::new(a.scope(), &a.zone, &a.host, &a.ip);
        self.ctx.registry.save_router(&router).await?;
        to_value(router)
    }
}

verb!(UnregisterRouter(RouterArg));

#[async_trait]
impl Verb for UnregisterRouter {
    fn description(&self) -> String {
        self.arg.describe()
    }

    fn validate(&self) -> TaskResult<()> {
        self.arg.validate()
    }

    async fn authorize(&self) -> TaskResult<()> {
        self.ctx.check_role("routers", "write").await?;
        self.ctx.authorize_super_user(&self.arg.auth).await
    }

    async fn execute(&self, _task: &Task) -> TaskResult<Value> {
        let a = &self.arg;
        if !self
            .ctx
            .registry
            .delete_router(a.scope(), &a.zone, &a.host)
            .await?
        {
            return Err(TaskError::NotFound(format!(
                "router {}/{}/{} not found",
                a.scope(),
                a.zone,
                a.host
            )));
        }
        Ok(json!({ "zone": a.zone, "host": a.host }))
    }
}

verb!(GetRouter(RouterArg));

#[async_trait]
impl Verb for GetRouter {
    fn description(&self) -> String {
        self.arg.describe()
    }

    fn validate(&self) -> TaskResult<()> {
        self.arg.validate()
    }

    async fn authorize(&self) -> TaskResult<()> {
        self.ctx.simple_authorize(&self.arg.auth).await
    }

    async fn execute(&self, _task: &Task) -> TaskResult<Value> {
        let a = &self.arg;
        to_value(
            self.ctx
                .registry
                .get_router(a.scope(), &a.zone, &a.host)
                .await?,
        )
    }
}

verb!(ListRouters(ScopeArg));

#[async_trait]
impl Verb for ListRouters {
    fn description(&self) -> String {
        format!(
            "[{}] {}",
            self.arg.auth.user,
            Scope::from_internal(self.arg.internal)
        )
    }

    async fn authorize(&self) -> TaskResult<()> {
        self.ctx.simple_authorize(&self.arg.auth).await
    }

    async fn execute(&self, _task: &Task) -> TaskResult<Value> {
        let routers = self
            .ctx
            .registry
            .list_routers(Scope::from_internal(self.arg.internal))
            .await?;
        Ok(json!({ "routers": routers }))
    }
}
