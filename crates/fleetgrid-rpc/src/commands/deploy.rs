//! Deploy and teardown, both run in the background.
//!
//! A deploy records one instance per chosen host, starts it on that host's
//! supervisor, adds the new members to their pool, and routes the
//! (app, env) port to the sha through the trie. A teardown reverses the
//! per-container steps; the router port stays with the (app, env).

use std::collections::BTreeMap;

use async_trait::async_trait;
use fleetgrid_model::parse_instance_id;
use fleetgrid_tasks::{Task, TaskError, TaskResult};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::warn;

use super::{Verb, require, verb};
use crate::auth::AuthArg;
use crate::supervisor::DeployRequest;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployArg {
    pub auth: AuthArg,
    pub app: String,
    pub sha: String,
    pub env: String,
    /// Instances to start when `hosts` is empty.
    pub instances: u32,
    pub cpu_shares: u32,
    /// MiB.
    pub memory_limit: u32,
    /// Explicit placement, one instance per entry.
    pub hosts: Vec<String>,
    /// Env dependencies to resolve and hand to the container.
    pub deps: Vec<String>,
}

impl Default for DeployArg {
    fn default() -> Self {
        Self {
            auth: AuthArg::default(),
            app: String::new(),
            sha: String::new(),
            env: String::new(),
            instances: 1,
            cpu_shares: 0,
            memory_limit: 0,
            hosts: Vec::new(),
            deps: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TeardownArg {
    pub auth: AuthArg,
    pub app: String,
    pub sha: String,
    pub env: String,
    pub container_id: String,
    /// Every container in the fleet. Super users only.
    pub all: bool,
}

verb!(Deploy(DeployArg));

impl Deploy {
    /// Hosts for each new instance: the explicit list, or the least loaded
    /// supervisors (ties broken by name), reused round-robin when more
    /// instances than hosts are requested.
    async fn place(&self) -> TaskResult<Vec<String>> {
        if !self.arg.hosts.is_empty() {
            return Ok(self.arg.hosts.clone());
        }
        if self.ctx.supervisor_hosts.is_empty() {
            return Err(TaskError::Validation(
                "no supervisor hosts configured; pass hosts explicitly".into(),
            ));
        }
        let counts = self.ctx.registry.instance_counts_by_host().await?;
        let mut candidates: Vec<(usize, &String)> = self
            .ctx
            .supervisor_hosts
            .iter()
            .map(|host| (counts.get(host).copied().unwrap_or(0), host))
            .collect();
        candidates.sort();
        Ok(candidates
            .iter()
            .cycle()
            .take(self.arg.instances as usize)
            .map(|(_, host)| (*host).clone())
            .collect())
    }
}

#[async_trait]
impl Verb for Deploy {
    fn description(&self) -> String {
        let a = &self.arg;
        format!(
            "[{}] {} @ {} in {} x{}",
            a.auth.user,
            a.app,
            a.sha,
            a.env,
            if a.hosts.is_empty() {
                a.instances as usize
            } else {
                a.hosts.len()
            }
        )
    }

    fn validate(&self) -> TaskResult<()> {
        require("app", &self.arg.app)?;
        require("sha", &self.arg.sha)?;
        require("env", &self.arg.env)?;
        if self.arg.hosts.is_empty() && self.arg.instances == 0 {
            return Err(TaskError::Validation(
                "please specify at least one instance".into(),
            ));
        }
        Ok(())
    }

    async fn authorize(&self) -> TaskResult<()> {
        self.ctx.check_role("deploys", "write").await?;
        self.ctx.authorize_app(&self.arg.auth, &self.arg.app).await
    }

    async fn execute(&self, task: &Task) -> TaskResult<Value> {
        let a = &self.arg;
        let registry = &self.ctx.registry;

        let app = registry.get_app(&a.app).await?;
        if app.unmanaged {
            return Err(TaskError::Validation(format!(
                "app {} is unmanaged and cannot be deployed",
                a.app
            )));
        }
        registry.get_env(&a.env).await?;
        let deps: BTreeMap<String, String> = registry.resolve_env_deps(&a.env, &a.deps).await?;
        let hosts = self.place().await?;
        task.log(format!("placing {} instance(s) on {}", hosts.len(), hosts.join(", ")));

        let request = DeployRequest {
            app: a.app.clone(),
            sha: a.sha.clone(),
            env: a.env.clone(),
            cpu_shares: a.cpu_shares,
            memory_limit: a.memory_limit,
            deps,
        };
        let mut deployed = Vec::with_capacity(hosts.len());
        for host in &hosts {
            let instance = registry
                .create_instance(&a.app, &a.sha, &a.env, host)
                .await?;
            task.log(format!("deploying {} to {host}", instance.id));
            let port = match self.ctx.supervisor.deploy(host, &instance.id, &request).await {
                Ok(port) => port,
                Err(e) => {
                    // The supervisor never started it.
                    registry.delete_instance(&instance.id).await?;
                    return Err(e.into());
                }
            };
            deployed.push(registry.set_instance_port(&instance.id, port).await?);
        }

        let ids: Vec<String> = deployed.iter().map(|i| i.id.clone()).collect();
        registry.add_to_pool(&ids).await?;
        let reservation = registry
            .reserve_router_port_and_update_trie(app.scope(), &a.app, &a.sha, &a.env)
            .await?;
        task.log(format!(
            "{} in {} routed through {} port {}",
            a.app,
            a.env,
            app.scope(),
            reservation.port
        ));
        Ok(json!({ "containers": deployed, "router_port": reservation.port }))
    }
}

verb!(Teardown(TeardownArg));

impl Teardown {
    async fn targets(&self) -> TaskResult<Vec<String>> {
        let a = &self.arg;
        let registry = &self.ctx.registry;
        if a.all {
            return Ok(registry.list_all_instances().await?);
        }
        if !a.container_id.is_empty() {
            registry.get_instance(&a.container_id).await?;
            return Ok(vec![a.container_id.clone()]);
        }
        Ok(registry
            .list_all_instances()
            .await?
            .into_iter()
            .filter(|id| {
                parse_instance_id(id).is_some_and(|(app, sha, env)| {
                    app == a.app
                        && (a.sha.is_empty() || sha == a.sha)
                        && (a.env.is_empty() || env == a.env)
                })
            })
            .collect())
    }
}

#[async_trait]
impl Verb for Teardown {
    fn description(&self) -> String {
        let a = &self.arg;
        if a.all {
            format!("[{}] all", a.auth.user)
        } else if !a.container_id.is_empty() {
            format!("[{}] {}", a.auth.user, a.container_id)
        } else {
            format!("[{}] {} @ {} in {}", a.auth.user, a.app, a.sha, a.env)
        }
    }

    fn validate(&self) -> TaskResult<()> {
        if self.arg.all || !self.arg.container_id.is_empty() {
            return Ok(());
        }
        require("app", &self.arg.app)
    }

    async fn authorize(&self) -> TaskResult<()> {
        self.ctx.check_role("deploys", "write").await?;
        let a = &self.arg;
        if a.all {
            return self.ctx.authorize_super_user(&a.auth).await;
        }
        if !a.container_id.is_empty() {
            let instance = self.ctx.registry.get_instance(&a.container_id).await?;
            return self.ctx.authorize_app(&a.auth, &instance.app).await;
        }
        self.ctx.authorize_app(&a.auth, &a.app).await
    }

    async fn execute(&self, task: &Task) -> TaskResult<Value> {
        let registry = &self.ctx.registry;
        let ids = self.targets().await?;
        task.log(format!("tearing down {} container(s)", ids.len()));
        registry.delete_from_pool(&ids).await?;

        let mut removed = Vec::with_capacity(ids.len());
        for id in ids {
            let instance = match registry.get_instance(&id).await {
                Ok(instance) => instance,
                Err(e) if e.is_not_found() => {
                    warn!(%id, "container already gone");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            self.ctx.supervisor.teardown(&instance.host, &id).await?;
            registry.delete_instance(&id).await?;
            task.log(format!("removed {id} from {}", instance.host));
            removed.push(id);
        }
        Ok(json!({ "container_ids": removed }))
    }
}
