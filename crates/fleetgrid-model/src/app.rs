//! App registrations and depender data.
//!
//! An app's `internal` and `unmanaged` flags are fixed at registration;
//! changing either requires unregistering first. Depender data (the
//! values another app or env needs from this one) is encrypted at rest.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::crypto::Cipher;
use crate::error::{ModelError, ModelResult};
use crate::layout::{Scope, validate_name};
use crate::registry::Registry;

/// Registration input for [`Registry::create_or_update_app`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppSpec {
    pub name: String,
    /// Not deployed through the fleet; no router ports are ever owned.
    #[serde(default)]
    pub unmanaged: bool,
    #[serde(default)]
    pub internal: bool,
    #[serde(default)]
    pub repo: String,
    #[serde(default)]
    pub root: String,
    #[serde(default)]
    pub email: String,
}

/// Data an app exposes to dependers in one env.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DependerEnvData {
    /// Env name.
    pub name: String,
    /// Allowed ip → ports.
    #[serde(default)]
    pub security_group: BTreeMap<String, Vec<u16>>,
    /// Plaintext payload; `None` while sealed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_map: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub encrypted_data: String,
}

impl DependerEnvData {
    /// Move `data_map` into `encrypted_data`.
    pub fn seal(&mut self, cipher: &Cipher) -> ModelResult<()> {
        if let Some(map) = self.data_map.take() {
            let plain = serde_json::to_vec(&map).map_err(|e| ModelError::Crypto(e.to_string()))?;
            self.encrypted_data = cipher.encrypt(&plain)?;
        }
        Ok(())
    }

    /// Inverse of [`seal`](Self::seal).
    pub fn unseal(&mut self, cipher: &Cipher) -> ModelResult<()> {
        if !self.encrypted_data.is_empty() {
            let plain = cipher.decrypt(&self.encrypted_data)?;
            let map = serde_json::from_slice(&plain).map_err(|e| ModelError::Crypto(e.to_string()))?;
            self.data_map = Some(map);
            self.encrypted_data.clear();
        }
        Ok(())
    }
}

/// Data an app exposes to one depender app, per env.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DependerAppData {
    /// Depender app name.
    pub name: String,
    #[serde(default)]
    pub depender_env_data: BTreeMap<String, DependerEnvData>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct App {
    pub name: String,
    #[serde(default)]
    pub unmanaged: bool,
    #[serde(default)]
    pub internal: bool,
    #[serde(default)]
    pub repo: String,
    #[serde(default)]
    pub root: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub depender_env_data: BTreeMap<String, DependerEnvData>,
    #[serde(default)]
    pub depender_app_data: BTreeMap<String, DependerAppData>,
}

impl App {
    fn from_spec(spec: &AppSpec) -> Self {
        Self {
            name: spec.name.clone(),
            unmanaged: spec.unmanaged,
            internal: spec.internal,
            repo: spec.repo.clone(),
            root: spec.root.clone(),
            email: spec.email.clone(),
            depender_env_data: BTreeMap::new(),
            depender_app_data: BTreeMap::new(),
        }
    }

    pub fn scope(&self) -> Scope {
        Scope::from_internal(self.internal)
    }
}

impl Registry {
    pub async fn get_app(&self, name: &str) -> ModelResult<App> {
        validate_name("app", name)?;
        self.read("app", name, &self.layout().app(name)).await
    }

    pub async fn app_exists(&self, name: &str) -> ModelResult<bool> {
        validate_name("app", name)?;
        Ok(self.store().exists(&self.layout().app(name)).await?)
    }

    /// Sorted names of registered apps.
    pub async fn list_apps(&self) -> ModelResult<Vec<String>> {
        self.children_or_empty(&self.layout().apps()).await
    }

    /// Register an app, or update its repo/root/email if already registered.
    pub async fn create_or_update_app(&self, spec: &AppSpec) -> ModelResult<App> {
        validate_name("app", &spec.name)?;
        let _guard = self.lock(&format!("app-{}", spec.name)).await?;
        let path = self.layout().app(&spec.name);
        let app = match self.read_opt::<App>(&path).await? {
            Some(mut existing) => {
                if existing.internal != spec.internal {
                    return Err(ModelError::ImmutableField(
                        "apps may not change from internal to external (and vice versa). \
                         please unregister and reregister."
                            .into(),
                    ));
                }
                if existing.unmanaged != spec.unmanaged {
                    return Err(ModelError::ImmutableField(
                        "apps may not change from unmanaged to managed (and vice versa). \
                         please unregister and reregister."
                            .into(),
                    ));
                }
                existing.repo = spec.repo.clone();
                existing.root = spec.root.clone();
                existing.email = spec.email.clone();
                existing
            }
            None => App::from_spec(spec),
        };
        self.store().set_json(&path, &app, true).await?;
        info!(app = %app.name, internal = app.internal, unmanaged = app.unmanaged, "app saved");
        Ok(app)
    }

    /// Unregister an app, then give back its router ports. Deployed
    /// instances are left alone.
    ///
    /// The record goes first: once it is gone no new reservation can be
    /// made for the app, so the reclaim that follows sees every port it
    /// ever held.
    pub async fn delete_app(&self, name: &str) -> ModelResult<()> {
        let app = {
            let _guard = self.lock(&format!("app-{name}")).await?;
            let app = self.get_app(name).await?;
            self.store()
                .recursive_delete(&self.layout().app(name))
                .await?;
            app
        };
        if !app.unmanaged {
            self.reclaim_router_ports_for_app(app.scope(), name).await?;
        }
        info!(app = name, "app deleted");
        Ok(())
    }

    async fn update_app<F>(&self, name: &str, mutate: F) -> ModelResult<App>
    where
        F: FnOnce(&mut App) -> ModelResult<()>,
    {
        validate_name("app", name)?;
        let _guard = self.lock(&format!("app-{name}")).await?;
        let path = self.layout().app(name);
        let mut app: App = self.read("app", name, &path).await?;
        mutate(&mut app)?;
        self.store().set_json(&path, &app, false).await?;
        Ok(app)
    }

    async fn require_env(&self, env: &str) -> ModelResult<()> {
        validate_name("env", env)?;
        if !self.store().exists(&self.layout().env(env)).await? {
            return Err(ModelError::not_found("env", env));
        }
        Ok(())
    }

    // ── Depender env data ──────────────────────────────────────────

    pub async fn add_depender_env_data(
        &self,
        app: &str,
        mut data: DependerEnvData,
    ) -> ModelResult<App> {
        self.require_env(&data.name).await?;
        data.seal(self.cipher())?;
        self.update_app(app, move |record| {
            record.depender_env_data.insert(data.name.clone(), data);
            Ok(())
        })
        .await
    }

    pub async fn remove_depender_env_data(&self, app: &str, env: &str) -> ModelResult<App> {
        self.update_app(app, |record| {
            record.depender_env_data.remove(env);
            Ok(())
        })
        .await
    }

    pub async fn get_depender_env_data(
        &self,
        app: &str,
        env: &str,
        decrypt: bool,
    ) -> ModelResult<Option<DependerEnvData>> {
        let mut record = self.get_app(app).await?;
        let Some(mut data) = record.depender_env_data.remove(env) else {
            return Ok(None);
        };
        if decrypt {
            data.unseal(self.cipher())?;
        }
        Ok(Some(data))
    }

    // ── Depender app data ──────────────────────────────────────────

    pub async fn add_depender_app_data(
        &self,
        app: &str,
        mut data: DependerAppData,
    ) -> ModelResult<App> {
        if !self.app_exists(&data.name).await? {
            return Err(ModelError::not_found("app", data.name));
        }
        for env_data in data.depender_env_data.values_mut() {
            self.require_env(&env_data.name).await?;
            env_data.seal(self.cipher())?;
        }
        self.update_app(app, move |record| {
            record.depender_app_data.insert(data.name.clone(), data);
            Ok(())
        })
        .await
    }

    pub async fn remove_depender_app_data(&self, app: &str, depender: &str) -> ModelResult<App> {
        self.update_app(app, |record| {
            record.depender_app_data.remove(depender);
            Ok(())
        })
        .await
    }

    pub async fn get_depender_app_data(
        &self,
        app: &str,
        depender: &str,
        decrypt: bool,
    ) -> ModelResult<Option<DependerAppData>> {
        let mut record = self.get_app(app).await?;
        let Some(mut data) = record.depender_app_data.remove(depender) else {
            return Ok(None);
        };
        if decrypt {
            for env_data in data.depender_env_data.values_mut() {
                env_data.unseal(self.cipher())?;
            }
        }
        Ok(Some(data))
    }

    pub async fn add_depender_env_data_for_depender_app(
        &self,
        app: &str,
        depender: &str,
        mut data: DependerEnvData,
    ) -> ModelResult<App> {
        if !self.app_exists(depender).await? {
            return Err(ModelError::not_found("app", depender));
        }
        self.require_env(&data.name).await?;
        data.seal(self.cipher())?;
        self.update_app(app, move |record| {
            record
                .depender_app_data
                .entry(depender.to_string())
                .or_insert_with(|| DependerAppData {
                    name: depender.to_string(),
                    depender_env_data: BTreeMap::new(),
                })
                .depender_env_data
                .insert(data.name.clone(), data);
            Ok(())
        })
        .await
    }

    pub async fn remove_depender_env_data_for_depender_app(
        &self,
        app: &str,
        depender: &str,
        env: &str,
    ) -> ModelResult<App> {
        self.update_app(app, |record| {
            if let Some(data) = record.depender_app_data.get_mut(depender) {
                data.depender_env_data.remove(env);
            }
            Ok(())
        })
        .await
    }

    pub async fn get_depender_env_data_for_depender_app(
        &self,
        app: &str,
        depender: &str,
        env: &str,
        decrypt: bool,
    ) -> ModelResult<Option<DependerEnvData>> {
        let Some(mut data) = self.get_depender_app_data(app, depender, false).await? else {
            return Ok(None);
        };
        let Some(mut env_data) = data.depender_env_data.remove(env) else {
            return Ok(None);
        };
        if decrypt {
            env_data.unseal(self.cipher())?;
        }
        Ok(Some(env_data))
    }
}
