//! Router port allocation and the routing tries built on it.
//!
//! Every decision that reads the port table happens under the scope's
//! `router-ports-<scope>` lock. The `has`/`get`/`list` reads below take no
//! lock and are advisory.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{ModelError, ModelResult};
use crate::layout::{Scope, pool_name, trie_name, validate_name};
use crate::registry::Registry;

pub const DEFAULT_MIN_ROUTER_PORT: u16 = 49152;
pub const DEFAULT_MAX_ROUTER_PORT: u16 = 65535;

/// Inclusive port range handed out to (app, env) pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            min: DEFAULT_MIN_ROUTER_PORT,
            max: DEFAULT_MAX_ROUTER_PORT,
        }
    }
}

impl PortRange {
    pub fn new(min: u16, max: u16) -> ModelResult<Self> {
        if min > max {
            return Err(ModelError::Validation(format!(
                "router port range [{min}, {max}] is empty"
            )));
        }
        Ok(Self { min, max })
    }

    /// Number of ports in the range.
    pub fn capacity(&self) -> usize {
        usize::from(self.max - self.min) + 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct PortRecord {
    port: u16,
}

/// One (app, env) → port mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterPort {
    pub scope: Scope,
    pub app: String,
    pub env: String,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortReservation {
    pub port: u16,
    /// False when the pair already held this port.
    pub created: bool,
}

/// Routing rule sending matching traffic to one pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    pub sha: String,
    pub pool: String,
}

/// Ordered rules for one (app, env); routers walk them in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trie {
    pub name: String,
    pub internal: bool,
    #[serde(default)]
    pub rules: Vec<String>,
}

/// Listener port → trie.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    pub port: u16,
    pub trie: String,
    pub internal: bool,
}

impl Registry {
    fn router_ports_lock(scope: Scope) -> String {
        format!("router-ports-{scope}")
    }

    /// Reserve the port for (app, env) in `scope`, reusing an existing
    /// mapping or taking the lowest free port.
    pub async fn reserve_router_port(
        &self,
        scope: Scope,
        app: &str,
        env: &str,
    ) -> ModelResult<PortReservation> {
        validate_name("app", app)?;
        validate_name("env", env)?;
        let _guard = self.lock(&Self::router_ports_lock(scope)).await?;
        self.reserve_router_port_locked(scope, app, env).await
    }

    /// A new mapping needs the app to still be registered; `delete_app`
    /// removes the record before reclaiming under this same lock.
    async fn reserve_router_port_locked(
        &self,
        scope: Scope,
        app: &str,
        env: &str,
    ) -> ModelResult<PortReservation> {
        let path = self.layout().router_port(scope, app, env);
        if let Some(existing) = self.read_opt::<PortRecord>(&path).await? {
            debug!(%scope, app, env, port = existing.port, "router port already reserved");
            return Ok(PortReservation {
                port: existing.port,
                created: false,
            });
        }

        if !self.app_exists(app).await? {
            return Err(ModelError::not_found("app", app));
        }

        let range = self.port_range();
        let used: BTreeSet<u16> = self
            .scan_router_ports(scope)
            .await?
            .into_iter()
            .map(|mapping| mapping.port)
            .collect();
        let port = (range.min..=range.max)
            .find(|port| !used.contains(port))
            .ok_or(ModelError::CapacityExhausted {
                scope,
                min: range.min,
                max: range.max,
            })?;

        self.store()
            .set_json(&path, &PortRecord { port }, true)
            .await?;
        info!(%scope, app, env, port, "router port reserved");
        Ok(PortReservation {
            port,
            created: true,
        })
    }

    async fn scan_router_ports(&self, scope: Scope) -> ModelResult<Vec<RouterPort>> {
        let mut mappings = Vec::new();
        for app in self.children_or_empty(&self.layout().router_ports(scope)).await? {
            let envs = self
                .children_or_empty(&self.layout().router_ports_for(scope, &app))
                .await?;
            for env in envs {
                let path = self.layout().router_port(scope, &app, &env);
                if let Some(record) = self.read_opt::<PortRecord>(&path).await? {
                    mappings.push(RouterPort {
                        scope,
                        app: app.clone(),
                        env,
                        port: record.port,
                    });
                }
            }
        }
        Ok(mappings)
    }

    // ── Advisory reads ─────────────────────────────────────────────

    pub async fn has_router_port(&self, scope: Scope, app: &str, env: &str) -> ModelResult<bool> {
        Ok(self
            .store()
            .exists(&self.layout().router_port(scope, app, env))
            .await?)
    }

    pub async fn get_router_port(&self, scope: Scope, app: &str, env: &str) -> ModelResult<u16> {
        let record: PortRecord = self
            .read(
                "router port",
                &format!("{scope}/{app}/{env}"),
                &self.layout().router_port(scope, app, env),
            )
            .await?;
        Ok(record.port)
    }

    pub async fn list_router_ports(&self, scope: Scope) -> ModelResult<Vec<RouterPort>> {
        self.scan_router_ports(scope).await
    }

    // ── Reclaim ────────────────────────────────────────────────────

    /// Give back every port `app` holds in `scope`.
    pub async fn reclaim_router_ports_for_app(
        &self,
        scope: Scope,
        app: &str,
    ) -> ModelResult<Vec<RouterPort>> {
        self.reclaim_router_ports(scope, |mapping| mapping.app == app)
            .await
    }

    /// Give back every port held for `env` in `scope`.
    pub async fn reclaim_router_ports_for_env(
        &self,
        scope: Scope,
        env: &str,
    ) -> ModelResult<Vec<RouterPort>> {
        self.reclaim_router_ports(scope, |mapping| mapping.env == env)
            .await
    }

    async fn reclaim_router_ports<F>(&self, scope: Scope, matches: F) -> ModelResult<Vec<RouterPort>>
    where
        F: Fn(&RouterPort) -> bool,
    {
        let _guard = self.lock(&Self::router_ports_lock(scope)).await?;
        let reclaimed: Vec<RouterPort> = self
            .scan_router_ports(scope)
            .await?
            .into_iter()
            .filter(|mapping| matches(mapping))
            .collect();
        for mapping in &reclaimed {
            self.release_router_port_locked(mapping).await?;
        }
        if !reclaimed.is_empty() {
            info!(%scope, count = reclaimed.len(), "router ports reclaimed");
        }
        Ok(reclaimed)
    }

    async fn release_router_port_locked(&self, mapping: &RouterPort) -> ModelResult<()> {
        let layout = self.layout();
        let store = self.store();
        let scope = mapping.scope;
        store
            .recursive_delete(&layout.router_port(scope, &mapping.app, &mapping.env))
            .await?;
        let app_dir = layout.router_ports_for(scope, &mapping.app);
        if self.children_or_empty(&app_dir).await?.is_empty() {
            store.recursive_delete(&app_dir).await?;
        }

        let name = trie_name(&mapping.app, &mapping.env);
        if let Some(trie) = self.read_opt::<Trie>(&layout.trie(scope, &name)).await? {
            for rule in &trie.rules {
                store.recursive_delete(&layout.rule(scope, rule)).await?;
            }
            store.recursive_delete(&layout.trie(scope, &name)).await?;
        }
        store
            .recursive_delete(&layout.port_binding(scope, mapping.port))
            .await?;
        debug!(%scope, app = %mapping.app, env = %mapping.env, port = mapping.port, "router port released");
        Ok(())
    }

    // ── Tries ──────────────────────────────────────────────────────

    /// Reserve the (app, env) port and route `sha` through its trie.
    ///
    /// The first reservation creates the trie with one rule and binds the
    /// port to it; later shas append rules without moving the port.
    pub async fn reserve_router_port_and_update_trie(
        &self,
        scope: Scope,
        app: &str,
        sha: &str,
        env: &str,
    ) -> ModelResult<PortReservation> {
        validate_name("app", app)?;
        validate_name("sha", sha)?;
        validate_name("env", env)?;
        let _guard = self.lock(&Self::router_ports_lock(scope)).await?;
        let reservation = self.reserve_router_port_locked(scope, app, env).await?;

        let layout = self.layout();
        let store = self.store();
        let pool = pool_name(app, sha, env);
        let name = trie_name(app, env);
        let rule = Rule {
            name: pool.clone(),
            sha: sha.to_string(),
            pool: pool.clone(),
        };
        store
            .set_json(&layout.rule(scope, &rule.name), &rule, true)
            .await?;

        let trie_path = layout.trie(scope, &name);
        let existing = self.read_opt::<Trie>(&trie_path).await?;
        let mut trie = existing.unwrap_or_else(|| Trie {
            name: name.clone(),
            internal: scope.is_internal(),
            rules: Vec::new(),
        });
        if !trie.rules.contains(&rule.name) {
            trie.rules.push(rule.name.clone());
            store.set_json(&trie_path, &trie, true).await?;
        }

        let binding = PortBinding {
            port: reservation.port,
            trie: name,
            internal: scope.is_internal(),
        };
        store
            .set_json(&layout.port_binding(scope, binding.port), &binding, true)
            .await?;
        info!(%scope, app, sha, env, port = reservation.port, rules = trie.rules.len(), "trie updated");
        Ok(reservation)
    }

    pub async fn get_trie(&self, scope: Scope, name: &str) -> ModelResult<Trie> {
        self.read("trie", name, &self.layout().trie(scope, name))
            .await
    }

    pub async fn get_rule(&self, scope: Scope, name: &str) -> ModelResult<Rule> {
        self.read("rule", name, &self.layout().rule(scope, name))
            .await
    }

    pub async fn get_port_binding(&self, scope: Scope, port: u16) -> ModelResult<PortBinding> {
        self.read(
            "port binding",
            &port.to_string(),
            &self.layout().port_binding(scope, port),
        )
        .await
    }
}
