//! App registration and depender data.

use async_trait::async_trait;
use fleetgrid_model::{AppSpec, DependerAppData, DependerEnvData};
use fleetgrid_tasks::{Task, TaskError, TaskResult};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::managers::AuthOnlyArg;
use super::{Verb, require, to_value, verb};
use crate::auth::AuthArg;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegisterAppArg {
    pub auth: AuthArg,
    pub name: String,
    /// Deployed outside the fleet.
    pub unmanaged: bool,
    pub internal: bool,
    pub repo: String,
    pub root: String,
    pub email: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppArg {
    pub auth: AuthArg,
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DependerEnvDataArg {
    pub auth: AuthArg,
    pub app: String,
    pub depender_env_data: DependerEnvData,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoveDependerEnvDataArg {
    pub auth: AuthArg,
    pub app: String,
    pub env: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DependerAppDataArg {
    pub auth: AuthArg,
    pub app: String,
    pub depender_app_data: DependerAppData,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoveDependerAppDataArg {
    pub auth: AuthArg,
    pub app: String,
    pub depender: String,
}

verb!(RegisterApp(RegisterAppArg));

#[async_trait]
impl Verb for RegisterApp {
    fn description(&self) -> String {
        let a = &self.arg;
        format!(
            "[{}] {} unmanaged={} internal={} {} {} {}",
            a.auth.user, a.name, a.unmanaged, a.internal, a.repo, a.root, a.email
        )
    }

    fn validate(&self) -> TaskResult<()> {
        let a = &self.arg;
        require("name", &a.name)?;
        if !a.unmanaged {
            require("repo", &a.repo)?;
            require("root", &a.root)?;
        }
        require("email", &a.email)
    }

    async fn authorize(&self) -> TaskResult<()> {
        self.ctx.check_role("apps", "write").await?;
        self.ctx.simple_authorize(&self.arg.auth).await
    }

    async fn execute(&self, _task: &Task) -> TaskResult<Value> {
        let a = &self.arg;
        let app = self
            .ctx
            .registry
            .create_or_update_app(&AppSpec {
                name: a.name.clone(),
                unmanaged: a.unmanaged,
                internal: a.internal,
                repo: a.repo.clone(),
                root: a.root.clone(),
                email: a.email.clone(),
            })
            .await?;
        to_value(app)
    }
}

verb!(UnregisterApp(AppArg));

#[async_trait]
impl Verb for UnregisterApp {
    fn description(&self) -> String {
        format!("[{}] {}", self.arg.auth.user, self.arg.name)
    }

    fn validate(&self) -> TaskResult<()> {
        require("name", &self.arg.name)
    }

    async fn authorize(&self) -> TaskResult<()> {
        self.ctx.check_role("apps", "write").await?;
        self.ctx.authorize_app(&self.arg.auth, &self.arg.name).await
    }

    async fn execute(&self, _task: &Task) -> TaskResult<Value> {
        self.ctx.registry.delete_app(&self.arg.name).await?;
        Ok(json!({ "name": self.arg.name }))
    }
}

verb!(GetApp(AppArg));

#[async_trait]
impl Verb for GetApp {
    fn description(&self) -> String {
        format!("[{}] {}", self.arg.auth.user, self.arg.name)
    }

    fn validate(&self) -> TaskResult<()> {
        require("name", &self.arg.name)
    }

    async fn authorize(&self) -> TaskResult<()> {
        self.ctx.authorize_app(&self.arg.auth, &self.arg.name).await
    }

    async fn execute(&self, _task: &Task) -> TaskResult<Value> {
        to_value(self.ctx.registry.get_app(&self.arg.name).await?)
    }
}

verb!(
    /// Every app for super users, otherwise only the caller's allowed apps.
    ListApps(AuthOnlyArg)
);

#[async_trait]
impl Verb for ListApps {
    fn description(&self) -> String {
        format!("[{}] ListApps", self.arg.auth.user)
    }

    async fn authorize(&self) -> TaskResult<()> {
        self.ctx.simple_authorize(&self.arg.auth).await
    }

    async fn execute(&self, _task: &Task) -> TaskResult<Value> {
        let mut apps = self.ctx.registry.list_apps().await?;
        if !self.ctx.is_super_user(&self.arg.auth).await {
            let allowed = self.ctx.allowed_apps(&self.arg.auth).await?;
            apps.retain(|app| allowed.contains(app));
        }
        Ok(json!({ "apps": apps }))
    }
}

verb!(AddDependerEnvData(DependerEnvDataArg));

#[async_trait]
impl Verb for AddDependerEnvData {
    fn description(&self) -> String {
        format!(
            "[{}] {} for env {}",
            self.arg.auth.user, self.arg.app, self.arg.depender_env_data.name
        )
    }

    fn validate(&self) -> TaskResult<()> {
        require("app", &self.arg.app)?;
        require("env", &self.arg.depender_env_data.name)
    }

    async fn authorize(&self) -> TaskResult<()> {
        self.ctx.check_role("apps", "write").await?;
        self.ctx.authorize_app(&self.arg.auth, &self.arg.app).await
    }

    async fn execute(&self, _task: &Task) -> TaskResult<Value> {
        let app = self
            .ctx
            .registry
            .add_depender_env_data(&self.arg.app, self.arg.depender_env_data.clone())
            .await?;
        to_value(app)
    }
}

verb!(RemoveDependerEnvData(RemoveDependerEnvDataArg));

#[async_trait]
impl Verb for RemoveDependerEnvData {
    fn description(&self) -> String {
        format!("[{}] {} for env {}", self.arg.auth.user, self.arg.app, self.arg.env)
    }

    fn validate(&self) -> TaskResult<()> {
        require("app", &self.arg.app)?;
        require("env", &self.arg.env)
    }

    async fn authorize(&self) -> TaskResult<()> {
        self.ctx.check_role("apps", "write").await?;
        self.ctx.authorize_app(&self.arg.auth, &self.arg.app).await
    }

    async fn execute(&self, _task: &Task) -> TaskResult<Value> {
        let app = self
            .ctx
            .registry
            .remove_depender_env_data(&self.arg.app, &self.arg.env)
            .await?;
        to_value(app)
    }
}

verb!(AddDependerAppData(DependerAppDataArg));

#[async_trait]
impl Verb for AddDependerAppData {
    fn description(&self) -> String {
        format!(
            "[{}] {} for app {}",
            self.arg.auth.user, self.arg.app, self.arg.depender_app_data.name
        )
    }

    fn validate(&self) -> TaskResult<()> {
        require("app", &self.arg.app)?;
        require("depender app", &self.arg.depender_app_data.name)?;
        if self.arg.depender_app_data.name == self.arg.app {
            return Err(TaskError::Validation(
                "an app cannot be its own depender".into(),
            ));
        }
        Ok(())
    }

    async fn authorize(&self) -> TaskResult<()> {
        self.ctx.check_role("apps", "write").await?;
        self.ctx.authorize_app(&self.arg.auth, &self.arg.app).await
    }

    async fn execute(&self, _task: &Task) -> TaskResult<Value> {
        let app = self
            .ctx
            .registry
            .add_depender_app_data(&self.arg.app, self.arg.depender_app_data.clone())
            .await?;
        to_value(app)
    }
}

verb!(RemoveDependerAppData(RemoveDependerAppDataArg));

#[async_trait]
impl Verb for RemoveDependerAppData {
    fn description(&self) -> String {
        format!(
            "[{}] {} for app {}",
            self.arg.auth.user, self.arg.app, self.arg.depender
        )
    }

    fn validate(&self) -> TaskResult<()> {
        require("app", &self.arg.app)?;
        require("depender app", &self.arg.depender)
    }

    async fn authorize(&self) -> TaskResult<()> {
        self.ctx.check_role("apps", "write").await?;
        self.ctx.authorize_app(&self.arg.auth, &self.arg.app).await
    }

    async fn execute(&self, _task: &Task) -> TaskResult<Value> {
        let app = self
            .ctx
            .registry
            .remove_depender_app_data(&self.arg.app, &self.arg.depender)
            .await?;
        to_value(app)
    }
}
