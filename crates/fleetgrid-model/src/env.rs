//! Environments: an optional parent plus dependency values, resolved
//! through the parent chain.
//!
//! Every env record write, and every decision that reads the parent graph,
//! happens under the single `envs` lock, so no cycle or dangling parent can
//! form between two managers.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{ModelError, ModelResult};
use crate::layout::{Scope, validate_name};
use crate::registry::Registry;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvDep {
    pub value: String,
    #[serde(default)]
    pub encrypted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Env {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default)]
    pub deps: BTreeMap<String, EnvDep>,
}

/// Lock over the env graph and every env record.
const ENVS_LOCK: &str = "envs";

impl Registry {
    pub async fn get_env(&self, name: &str) -> ModelResult<Env> {
        validate_name("env", name)?;
        self.read("env", name, &self.layout().env(name)).await
    }

    pub async fn list_envs(&self) -> ModelResult<Vec<String>> {
        self.children_or_empty(&self.layout().envs()).await
    }

    /// Create an env or change its parent. Existing deps are kept.
    pub async fn update_env(&self, name: &str, parent: Option<&str>) -> ModelResult<Env> {
        validate_name("env", name)?;
        if let Some(parent) = parent {
            validate_name("env", parent)?;
        }
        let _guard = self.lock(ENVS_LOCK).await?;
        if let Some(parent) = parent {
            self.check_parent(name, parent).await?;
        }
        let path = self.layout().env(name);
        let env = match self.read_opt::<Env>(&path).await? {
            Some(mut env) => {
                env.parent = parent.map(str::to_string);
                env
            }
            None => Env {
                name: name.to_string(),
                parent: parent.map(str::to_string),
                deps: BTreeMap::new(),
            },
        };
        self.store().set_json(&path, &env, true).await?;
        info!(env = name, parent = ?env.parent, "env saved");
        Ok(env)
    }

    /// The parent must exist and must not have `name` among its ancestors.
    /// Callers hold `envs`.
    async fn check_parent(&self, name: &str, parent: &str) -> ModelResult<()> {
        let mut seen = BTreeSet::new();
        let mut current = Some(parent.to_string());
        while let Some(candidate) = current {
            if candidate == name {
                return Err(ModelError::Validation(format!(
                    "env {name} cannot be its own ancestor"
                )));
            }
            if !seen.insert(candidate.clone()) {
                break;
            }
            current = self.get_env(&candidate).await?.parent;
        }
        Ok(())
    }

    /// Set one dependency value, sealing it first when `encrypt` is set.
    pub async fn set_env_dep(
        &self,
        env: &str,
        dep: &str,
        value: &str,
        encrypt: bool,
    ) -> ModelResult<Env> {
        validate_name("env", env)?;
        if dep.is_empty() {
            return Err(ModelError::Validation("dependency name is empty".into()));
        }
        let value = if encrypt {
            self.cipher().encrypt_str(value)?
        } else {
            value.to_string()
        };
        let _guard = self.lock(ENVS_LOCK).await?;
        let path = self.layout().env(env);
        let mut record: Env = self.read("env", env, &path).await?;
        record.deps.insert(
            dep.to_string(),
            EnvDep {
                value,
                encrypted: encrypt,
            },
        );
        self.store().set_json(&path, &record, false).await?;
        Ok(record)
    }

    pub async fn delete_env_dep(&self, env: &str, dep: &str) -> ModelResult<Env> {
        validate_name("env", env)?;
        let _guard = self.lock(ENVS_LOCK).await?;
        let path = self.layout().env(env);
        let mut record: Env = self.read("env", env, &path).await?;
        if record.deps.remove(dep).is_none() {
            return Err(ModelError::not_found("env dependency", dep));
        }
        self.store().set_json(&path, &record, false).await?;
        Ok(record)
    }

    /// Resolve dependency values for `env`, walking up the parent chain and
    /// decrypting sealed values. Fails on the first name no ancestor defines.
    pub async fn resolve_env_deps(
        &self,
        env: &str,
        names: &[String],
    ) -> ModelResult<BTreeMap<String, String>> {
        let mut chain = Vec::new();
        let mut seen = BTreeSet::new();
        let mut current = Some(env.to_string());
        while let Some(name) = current {
            if !seen.insert(name.clone()) {
                break;
            }
            let record = self.get_env(&name).await?;
            current = record.parent.clone();
            chain.push(record);
        }

        let mut resolved = BTreeMap::new();
        for name in names {
            let dep = chain
                .iter()
                .find_map(|record| record.deps.get(name))
                .ok_or_else(|| ModelError::not_found("env dependency", name.clone()))?;
            let value = if dep.encrypted {
                self.cipher().decrypt_str(&dep.value)?
            } else {
                dep.value.clone()
            };
            resolved.insert(name.clone(), value);
        }
        Ok(resolved)
    }

    /// Delete an env that no other env names as parent, then give back
    /// its router ports in both scopes.
    pub async fn delete_env(&self, name: &str) -> ModelResult<()> {
        {
            let _guard = self.lock(ENVS_LOCK).await?;
            self.get_env(name).await?;
            for other in self.list_envs().await? {
                if other == name {
                    continue;
                }
                if self.get_env(&other).await?.parent.as_deref() == Some(name) {
                    return Err(ModelError::Conflict(format!(
                        "env {name} is the parent of {other}"
                    )));
                }
            }
            self.store()
                .recursive_delete(&self.layout().env(name))
                .await?;
        }
        for scope in Scope::ALL {
            self.reclaim_router_ports_for_env(scope, name).await?;
        }
        info!(env = name, "env deleted");
        Ok(())
    }
}
