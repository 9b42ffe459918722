//! Load-balancer pools mirrored from instance membership.
//!
//! One pool exists per (app, sha, env) with at least one member; removing
//! the last member deletes the pool. Each pool's read-modify-write runs
//! under `pool-<scope>-<name>`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{ModelError, ModelResult};
use crate::layout::{Scope, pool_name};
use crate::registry::Registry;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolHost {
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub healthz_every: String,
    pub healthz_timeout: String,
    pub request_timeout: String,
    pub status: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            healthz_every: "5s".into(),
            healthz_timeout: "5s".into(),
            request_timeout: "120s".into(),
            status: "OK".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool {
    pub name: String,
    pub internal: bool,
    /// `host:port` → backend.
    #[serde(default)]
    pub hosts: BTreeMap<String, PoolHost>,
    #[serde(default)]
    pub config: PoolConfig,
}

impl Pool {
    fn new(name: &str, scope: Scope) -> Self {
        Self {
            name: name.to_string(),
            internal: scope.is_internal(),
            hosts: BTreeMap::new(),
            config: PoolConfig::default(),
        }
    }
}

type PoolGroups = BTreeMap<(Scope, String), Vec<String>>;

impl Registry {
    /// Resolve instances to addresses grouped by (scope, pool name).
    /// `strict` turns unknown or portless instances into errors instead of
    /// skipping them.
    async fn group_by_pool(&self, ids: &[String], strict: bool) -> ModelResult<PoolGroups> {
        let mut groups = PoolGroups::new();
        for id in ids {
            let instance = match self.get_instance(id).await {
                Ok(instance) => instance,
                Err(e) if !strict && e.is_not_found() => {
                    warn!(%id, "instance gone, skipping pool update");
                    continue;
                }
                Err(e) => return Err(e),
            };
            let Some(address) = instance.address() else {
                if strict {
                    return Err(ModelError::Validation(format!(
                        "instance {id} has no port yet"
                    )));
                }
                continue;
            };
            let name = pool_name(&instance.app, &instance.sha, &instance.env);
            groups
                .entry((instance.scope(), name))
                .or_default()
                .push(address);
        }
        Ok(groups)
    }

    /// Add instances to their pools, creating pools with default config.
    pub async fn add_to_pool(&self, ids: &[String]) -> ModelResult<()> {
        for ((scope, name), addresses) in self.group_by_pool(ids, true).await? {
            let _guard = self.lock(&format!("pool-{scope}-{name}")).await?;
            let path = self.layout().pool(scope, &name);
            let mut pool = self
                .read_opt::<Pool>(&path)
                .await?
                .unwrap_or_else(|| Pool::new(&name, scope));
            for address in addresses {
                pool.hosts.insert(address.clone(), PoolHost { address });
            }
            self.store().set_json(&path, &pool, true).await?;
            debug!(%scope, pool = %name, hosts = pool.hosts.len(), "pool members added");
        }
        Ok(())
    }

    /// Remove instances from their pools, deleting pools left empty.
    pub async fn delete_from_pool(&self, ids: &[String]) -> ModelResult<()> {
        for ((scope, name), addresses) in self.group_by_pool(ids, false).await? {
            let _guard = self.lock(&format!("pool-{scope}-{name}")).await?;
            let path = self.layout().pool(scope, &name);
            let Some(mut pool) = self.read_opt::<Pool>(&path).await? else {
                continue;
            };
            for address in &addresses {
                pool.hosts.remove(address);
            }
            if pool.hosts.is_empty() {
                self.store().recursive_delete(&path).await?;
                info!(%scope, pool = %name, "pool emptied and removed");
            } else {
                self.store().set_json(&path, &pool, false).await?;
                debug!(%scope, pool = %name, hosts = pool.hosts.len(), "pool members removed");
            }
        }
        Ok(())
    }

    pub async fn get_pool(&self, scope: Scope, name: &str) -> ModelResult<Pool> {
        self.read("pool", name, &self.layout().pool(scope, name)).await
    }

    pub async fn list_pools(&self, scope: Scope) -> ModelResult<Vec<String>> {
        self.children_or_empty(&self.layout().pools(scope)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::AppSpec;
    use crate::instance::Instance;

    const SHA: &str = "1234567890";

    async fn registry(internal: bool) -> Registry {
        let registry = Registry::in_memory().await.unwrap();
        for name in ["app", "app2"] {
            registry
                .create_or_update_app(&AppSpec {
                    name: name.into(),
                    internal,
                    repo: "ssh://git@example.com/app".into(),
                    root: "/".into(),
                    email: "team@example.com".into(),
                    ..AppSpec::default()
                })
                .await
                .unwrap();
        }
        registry
    }

    async fn deploy(registry: &Registry, app: &str, sha: &str, host: &str, port: u16) -> Instance {
        let instance = registry
            .create_instance(app, sha, "env", host)
            .await
            .unwrap();
        registry
            .set_instance_port(&instance.id, port)
            .await
            .unwrap()
    }

    fn hosts(entries: &[&str]) -> BTreeMap<String, PoolHost> {
        entries
            .iter()
            .map(|a| (a.to_string(), PoolHost { address: a.to_string() }))
            .collect()
    }

    async fn pool_lifecycle(internal: bool) {
        let registry = registry(internal).await;
        let scope = Scope::from_internal(internal);
        let i1 = deploy(&registry, "app", SHA, "host-1", 1337).await;
        let i2 = deploy(&registry, "app", SHA, "host-2", 1338).await;
        registry
            .add_to_pool(&[i1.id.clone(), i2.id.clone()])
            .await
            .unwrap();

        let name = pool_name("app", SHA, "env");
        let pool = registry.get_pool(scope, &name).await.unwrap();
        assert_eq!(pool.name, name);
        assert!(!pool.config.healthz_every.is_empty());
        assert!(!pool.config.healthz_timeout.is_empty());
        assert!(!pool.config.request_timeout.is_empty());
        assert_eq!(pool.hosts, hosts(&["host-1:1337", "host-2:1338"]));

        let other = deploy(&registry, "app2", "sha1", "host-1", 1339).await;
        let i3 = deploy(&registry, "app", SHA, "host-3", 1340).await;
        registry.delete_from_pool(&[i2.id.clone()]).await.unwrap();
        registry.delete_instance(&i2.id).await.unwrap();
        registry
            .add_to_pool(&[other.id.clone(), i3.id.clone()])
            .await
            .unwrap();

        let pool = registry.get_pool(scope, &name).await.unwrap();
        assert_eq!(pool.hosts, hosts(&["host-1:1337", "host-3:1340"]));
        let pool2 = registry.get_pool(scope, "app2.sha1.env").await.unwrap();
        assert_eq!(pool2.hosts, hosts(&["host-1:1339"]));
        assert_eq!(
            registry.list_pools(scope).await.unwrap(),
            vec![name.clone(), "app2.sha1.env".to_string()]
        );

        registry
            .delete_from_pool(&[i1.id.clone(), other.id.clone(), i3.id.clone()])
            .await
            .unwrap();
        assert!(registry.get_pool(scope, &name).await.unwrap_err().is_not_found());
        assert!(registry.list_pools(scope).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn internal_pool_lifecycle() {
        pool_lifecycle(true).await;
    }

    #[tokio::test]
    async fn external_pool_lifecycle() {
        pool_lifecycle(false).await;
        let registry = registry(false).await;
        assert!(registry.list_pools(Scope::Internal).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn add_requires_known_instance_with_port() {
        let registry = registry(true).await;
        let err = registry
            .add_to_pool(&["app.x.env.00000000.0".to_string()])
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        let pending = registry.create_instance("app", SHA, "env", "h").await.unwrap();
        let err = registry.add_to_pool(&[pending.id]).await.unwrap_err();
        assert!(matches!(err, ModelError::Validation(_)));
    }

    #[tokio::test]
    async fn delete_skips_missing_instances() {
        let registry = registry(true).await;
        registry
            .delete_from_pool(&["app.x.env.00000000.0".to_string()])
            .await
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_adds_lose_nothing() {
        let registry = registry(true).await;
        let mut ids = Vec::new();
        for i in 0..12u16 {
            ids.push(deploy(&registry, "app", SHA, &format!("h{i}"), 2000 + i).await.id);
        }
        let mut handles = Vec::new();
        for id in ids {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry.add_to_pool(&[id]).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let pool = registry
            .get_pool(Scope::Internal, &pool_name("app", SHA, "env"))
            .await
            .unwrap();
        assert_eq!(pool.hosts.len(), 12);
    }
}
