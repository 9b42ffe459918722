//! Instance (container) records.
//!
//! IDs are `<app>.<sha>.<env>.<host-tag>.<index>`: the host tag is the first
//! eight hex characters of SHA-256(host), and the index is the lowest one
//! not yet taken, claimed with an atomic create.

use std::collections::{BTreeMap, BTreeSet};

use fleetgrid_coord::{CoordError, CreateMode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::error::{ModelError, ModelResult};
use crate::layout::{Scope, validate_name, validate_segment};
use crate::registry::{Registry, epoch_secs};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    /// Recorded, no port yet.
    #[default]
    Pending,
    Running,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub app: String,
    pub sha: String,
    pub env: String,
    pub host: String,
    pub internal: bool,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub status: InstanceStatus,
    pub created_at: u64,
}

impl Instance {
    pub fn scope(&self) -> Scope {
        Scope::from_internal(self.internal)
    }

    /// `host:port`, once a port is assigned.
    pub fn address(&self) -> Option<String> {
        self.port.map(|port| format!("{}:{port}", self.host))
    }
}

fn host_tag(host: &str) -> String {
    let digest = Sha256::digest(host.as_bytes());
    hex::encode(digest)[..8].to_string()
}

/// Split an instance ID into (app, sha, env).
pub fn parse_instance_id(id: &str) -> Option<(&str, &str, &str)> {
    let mut parts = id.split('.');
    let app = parts.next()?;
    let sha = parts.next()?;
    let env = parts.next()?;
    let _tag = parts.next()?;
    let _index = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    Some((app, sha, env))
}

impl Registry {
    /// Record a new instance of a registered app on `host`.
    pub async fn create_instance(
        &self,
        app: &str,
        sha: &str,
        env: &str,
        host: &str,
    ) -> ModelResult<Instance> {
        validate_name("sha", sha)?;
        validate_name("env", env)?;
        validate_segment("host", host)?;
        let registered = self.get_app(app).await?;
        let tag = host_tag(host);

        let mut index: u32 = 0;
        loop {
            let id = format!("{app}.{sha}.{env}.{tag}.{index}");
            let instance = Instance {
                id: id.clone(),
                app: app.to_string(),
                sha: sha.to_string(),
                env: env.to_string(),
                host: host.to_string(),
                internal: registered.internal,
                port: None,
                status: InstanceStatus::Pending,
                created_at: epoch_secs(),
            };
            let bytes = serde_json::to_vec(&instance)
                .map_err(|e| CoordError::Serialize(e.to_string()))?;
            match self
                .store()
                .create(&self.layout().instance(&id), &bytes, CreateMode::Persistent)
                .await
            {
                Ok(_) => {
                    info!(%id, host, "instance recorded");
                    return Ok(instance);
                }
                Err(CoordError::NodeExists(_)) => index += 1,
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub async fn get_instance(&self, id: &str) -> ModelResult<Instance> {
        if id.is_empty() || id.contains('/') {
            return Err(ModelError::Validation(format!("invalid container id {id:?}")));
        }
        self.read("container", id, &self.layout().instance(id)).await
    }

    /// Assign the instance's port and mark it running.
    pub async fn set_instance_port(&self, id: &str, port: u16) -> ModelResult<Instance> {
        let mut instance = self.get_instance(id).await?;
        instance.port = Some(port);
        instance.status = InstanceStatus::Running;
        self.store()
            .set_json(&self.layout().instance(id), &instance, false)
            .await?;
        Ok(instance)
    }

    /// Delete an instance record. Returns true if it existed.
    pub async fn delete_instance(&self, id: &str) -> ModelResult<bool> {
        let path = self.layout().instance(id);
        if !self.store().exists(&path).await? {
            return Ok(false);
        }
        self.store().recursive_delete(&path).await?;
        info!(%id, "instance deleted");
        Ok(true)
    }

    /// Sorted IDs of every instance.
    pub async fn list_all_instances(&self) -> ModelResult<Vec<String>> {
        self.children_or_empty(&self.layout().instances()).await
    }

    /// Sorted IDs of the instances of one (app, sha, env).
    pub async fn list_instances(&self, app: &str, sha: &str, env: &str) -> ModelResult<Vec<String>> {
        let prefix = format!("{app}.{sha}.{env}.");
        Ok(self
            .list_all_instances()
            .await?
            .into_iter()
            .filter(|id| id.starts_with(&prefix))
            .collect())
    }

    /// Shas of `app` with at least one instance.
    pub async fn list_shas(&self, app: &str) -> ModelResult<Vec<String>> {
        let shas: BTreeSet<String> = self
            .list_all_instances()
            .await?
            .iter()
            .filter_map(|id| parse_instance_id(id))
            .filter(|(a, _, _)| *a == app)
            .map(|(_, sha, _)| sha.to_string())
            .collect();
        Ok(shas.into_iter().collect())
    }

    /// Envs that `app` at `sha` has instances in.
    pub async fn list_app_envs(&self, app: &str, sha: &str) -> ModelResult<Vec<String>> {
        let envs: BTreeSet<String> = self
            .list_all_instances()
            .await?
            .iter()
            .filter_map(|id| parse_instance_id(id))
            .filter(|(a, s, _)| *a == app && *s == sha)
            .map(|(_, _, env)| env.to_string())
            .collect();
        Ok(envs.into_iter().collect())
    }

    /// Instance count per host, for placement.
    pub async fn instance_counts_by_host(&self) -> ModelResult<BTreeMap<String, usize>> {
        let mut counts = BTreeMap::new();
        for id in self.list_all_instances().await? {
            match self.get_instance(&id).await {
                Ok(instance) => *counts.entry(instance.host).or_insert(0) += 1,
                // Deleted between listing and reading.
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::AppSpec;

    async fn registry_with_app(name: &str, internal: bool) -> Registry {
        let registry = Registry::in_memory().await.unwrap();
        registry
            .create_or_update_app(&AppSpec {
                name: name.into(),
                internal,
                ..AppSpec::default()
            })
            .await
            .unwrap();
        registry
    }

    #[tokio::test]
    async fn ids_are_deterministic_and_indexed() {
        let registry = registry_with_app("web", true).await;
        let first = registry.create_instance("web", "abc123", "prod", "host-1").await.unwrap();
        let second = registry.create_instance("web", "abc123", "prod", "host-1").await.unwrap();
        let tag = host_tag("host-1");
        assert_eq!(first.id, format!("web.abc123.prod.{tag}.0"));
        assert_eq!(second.id, format!("web.abc123.prod.{tag}.1"));
        assert!(first.internal);
        assert_eq!(first.status, InstanceStatus::Pending);

        registry.delete_instance(&first.id).await.unwrap();
        let third = registry.create_instance("web", "abc123", "prod", "host-1").await.unwrap();
        assert_eq!(third.id, first.id);
    }

    #[tokio::test]
    async fn unregistered_app_is_rejected() {
        let registry = Registry::in_memory().await.unwrap();
        let err = registry
            .create_instance("ghost", "abc", "prod", "host-1")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn set_port_marks_running() {
        let registry = registry_with_app("web", false).await;
        let instance = registry.create_instance("web", "abc", "prod", "host-1").await.unwrap();
        let updated = registry.set_instance_port(&instance.id, 1337).await.unwrap();
        assert_eq!(updated.port, Some(1337));
        assert_eq!(updated.status, InstanceStatus::Running);
        assert_eq!(updated.address().as_deref(), Some("host-1:1337"));
        assert_eq!(updated.scope(), Scope::External);
    }

    #[tokio::test]
    async fn listings() {
        let registry = registry_with_app("web", true).await;
        registry.create_instance("web", "sha1", "prod", "h1").await.unwrap();
        registry.create_instance("web", "sha1", "dev", "h2").await.unwrap();
        registry.create_instance("web", "sha2", "prod", "h1").await.unwrap();

        assert_eq!(registry.list_all_instances().await.unwrap().len(), 3);
        assert_eq!(registry.list_instances("web", "sha1", "prod").await.unwrap().len(), 1);
        assert_eq!(registry.list_shas("web").await.unwrap(), vec!["sha1", "sha2"]);
        assert_eq!(registry.list_app_envs("web", "sha1").await.unwrap(), vec!["dev", "prod"]);
        let counts = registry.instance_counts_by_host().await.unwrap();
        assert_eq!(counts["h1"], 2);
        assert_eq!(counts["h2"], 1);
    }

    #[tokio::test]
    async fn delete_missing_is_false() {
        let registry = Registry::in_memory().await.unwrap();
        assert!(!registry.delete_instance("web.a.b.c.0").await.unwrap());
    }

    #[test]
    fn parse_ids() {
        assert_eq!(
            parse_instance_id("web.abc.prod.0a1b2c3d.4"),
            Some(("web", "abc", "prod"))
        );
        assert_eq!(parse_instance_id("web.abc"), None);
    }
}
