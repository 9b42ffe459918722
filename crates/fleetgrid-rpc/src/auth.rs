//! Caller authentication and authorization.
//!
//! Identity comes from a [`TeamDirectory`]: a user is known when the
//! directory returns a team set for their credentials. Super users belong
//! to the configured super-user group; everyone else reaches the apps
//! their teams are allowed.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use fleetgrid_tasks::{TaskError, TaskResult};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::context::ManagerContext;

/// Credentials carried by every request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthArg {
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub secret: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSettings {
    /// Every check passes. Development only.
    pub skip_authorization: bool,
    pub super_user_group: String,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            skip_authorization: false,
            super_user_group: "fleet-admins".into(),
        }
    }
}

/// Read-only source of team membership.
#[async_trait]
pub trait TeamDirectory: Send + Sync {
    /// Teams of `user` if the credentials are valid, `None` otherwise.
    async fn lookup_teams(&self, user: &str, secret: &str) -> Option<BTreeSet<String>>;

    /// Teams of `user` without checking credentials; used when a super
    /// user asks about someone else.
    async fn teams_of(&self, user: &str) -> Option<BTreeSet<String>>;
}

#[derive(Debug, Clone)]
struct StaticUser {
    secret: String,
    teams: BTreeSet<String>,
}

/// Directory backed by a fixed user table.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    users: HashMap<String, StaticUser>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user<I, S>(mut self, name: &str, secret: &str, teams: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.users.insert(
            name.to_string(),
            StaticUser {
                secret: secret.to_string(),
                teams: teams.into_iter().map(Into::into).collect(),
            },
        );
        self
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

#[async_trait]
impl TeamDirectory for StaticDirectory {
    async fn lookup_teams(&self, user: &str, secret: &str) -> Option<BTreeSet<String>> {
        self.users
            .get(user)
            .filter(|entry| entry.secret == secret)
            .map(|entry| entry.teams.clone())
    }

    async fn teams_of(&self, user: &str) -> Option<BTreeSet<String>> {
        self.users.get(user).map(|entry| entry.teams.clone())
    }
}

fn denied(message: impl Into<String>) -> TaskError {
    TaskError::PermissionDenied(message.into())
}

impl ManagerContext {
    /// Teams of the caller; empty when the credentials are not recognised.
    pub async fn caller_teams(&self, auth: &AuthArg) -> BTreeSet<String> {
        self.directory
            .lookup_teams(&auth.user, &auth.secret)
            .await
            .unwrap_or_default()
    }

    /// The caller is a known user.
    pub async fn simple_authorize(&self, auth: &AuthArg) -> TaskResult<()> {
        if self.auth.skip_authorization {
            return Ok(());
        }
        match self.directory.lookup_teams(&auth.user, &auth.secret).await {
            Some(_) => Ok(()),
            None => Err(denied(format!(
                "Permission denied: unknown user {:?} or bad secret",
                auth.user
            ))),
        }
    }

    pub async fn is_super_user(&self, auth: &AuthArg) -> bool {
        if self.auth.skip_authorization {
            return true;
        }
        self.caller_teams(auth)
            .await
            .contains(&self.auth.super_user_group)
    }

    pub async fn authorize_super_user(&self, auth: &AuthArg) -> TaskResult<()> {
        if self.is_super_user(auth).await {
            return Ok(());
        }
        Err(denied(format!(
            "Permission denied: {} is not a member of {}",
            auth.user, self.auth.super_user_group
        )))
    }

    /// Apps allowed for any of `teams`.
    pub async fn apps_for_teams(&self, teams: &BTreeSet<String>) -> TaskResult<BTreeSet<String>> {
        let mut apps = BTreeSet::new();
        for team in teams {
            apps.extend(self.registry.get_team_apps(team).await?.apps);
        }
        Ok(apps)
    }

    /// Apps the caller may act on through team allow-lists.
    pub async fn allowed_apps(&self, auth: &AuthArg) -> TaskResult<BTreeSet<String>> {
        let teams = self.caller_teams(auth).await;
        self.apps_for_teams(&teams).await
    }

    /// Super users reach every app; others need the app on one of their
    /// teams' allow-lists.
    pub async fn authorize_app(&self, auth: &AuthArg, app: &str) -> TaskResult<()> {
        if self.is_super_user(auth).await {
            return Ok(());
        }
        self.simple_authorize(auth).await?;
        if self.allowed_apps(auth).await?.contains(app) {
            return Ok(());
        }
        Err(denied(format!(
            "Permission denied: {} may not access app {app}",
            auth.user
        )))
    }

    /// Teams no longer have admins; only super users administer a team.
    pub async fn authorize_team_admin(&self, auth: &AuthArg, team: &str) -> TaskResult<()> {
        if self.is_super_user(auth).await {
            return Ok(());
        }
        Err(denied(format!(
            "Permission denied: {} is not an admin of team {team}",
            auth.user
        )))
    }

    /// This manager must hold `role` with permission `rtype`. On failure
    /// the error lists the CNames of managers that do.
    pub async fn check_role(&self, role: &str, rtype: &str) -> TaskResult<()> {
        debug!(region = %self.region, host = %self.host, role, rtype, "checking manager role");
        let me = self.registry.get_manager(&self.region, &self.host).await?;
        if me.has_role(role, rtype) {
            return Ok(());
        }
        let mut holders = String::new();
        for (region, hosts) in self.registry.list_managers().await? {
            for host in hosts {
                let Ok(other) = self.registry.get_manager(&region, &host).await else {
                    continue;
                };
                if other.has_role(role, rtype) {
                    holders.push_str(&other.cname);
                    holders.push('\n');
                }
            }
        }
        Err(denied(format!(
            "This manager does not have the ability to {rtype} {role}. \
             Please try one of these:\n{holders}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use fleetgrid_model::Registry;
    use fleetgrid_tasks::{MaintenanceGate, TaskRunner, TaskTracker};

    use super::*;
    use crate::supervisor::{Container, DeployRequest, Supervisor, SupervisorError};

    struct Unreachable;

    #[async_trait]
    impl Supervisor for Unreachable {
        async fn get(&self, host: &str, _id: &str) -> Result<Container, SupervisorError> {
            Err(unreachable_host(host))
        }

        async fn container_maintenance(
            &self,
            host: &str,
            _id: &str,
            _maintenance: bool,
        ) -> Result<String, SupervisorError> {
            Err(unreachable_host(host))
        }

        async fn deploy(
            &self,
            host: &str,
            _id: &str,
            _request: &DeployRequest,
        ) -> Result<u16, SupervisorError> {
            Err(unreachable_host(host))
        }

        async fn teardown(&self, host: &str, _id: &str) -> Result<(), SupervisorError> {
            Err(unreachable_host(host))
        }
    }

    fn unreachable_host(host: &str) -> SupervisorError {
        SupervisorError::Transport {
            host: host.to_string(),
            reason: "unreachable".into(),
        }
    }

    async fn context(settings: AuthSettings) -> ManagerContext {
        let directory = StaticDirectory::new()
            .with_user("root", "s3cret", ["fleet-admins"])
            .with_user("alice", "pw", ["web-team"]);
        ManagerContext::new(
            "us-east-1",
            "mgr-1",
            Registry::in_memory().await.unwrap(),
            TaskRunner::new(TaskTracker::new(Duration::from_secs(60)), MaintenanceGate::new()),
            Arc::new(directory),
            Arc::new(Unreachable),
        )
        .with_auth(settings)
    }

    fn auth(user: &str, secret: &str) -> AuthArg {
        AuthArg {
            user: user.into(),
            secret: secret.into(),
        }
    }

    #[tokio::test]
    async fn static_directory_checks_secrets() {
        let directory = StaticDirectory::new().with_user("alice", "pw", ["a", "b"]);
        assert_eq!(directory.len(), 1);
        let teams = directory.lookup_teams("alice", "pw").await.unwrap();
        assert_eq!(teams.len(), 2);
        assert!(directory.lookup_teams("alice", "nope").await.is_none());
        assert!(directory.lookup_teams("bob", "pw").await.is_none());
        assert!(directory.teams_of("alice").await.is_some());
    }

    #[tokio::test]
    async fn super_users_reach_every_app() {
        let ctx = context(AuthSettings::default()).await;
        assert!(ctx.is_super_user(&auth("root", "s3cret")).await);
        assert!(!ctx.is_super_user(&auth("root", "wrong")).await);
        ctx.authorize_app(&auth("root", "s3cret"), "anything").await.unwrap();

        let err = ctx
            .authorize_app(&auth("alice", "pw"), "anything")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "permission_denied");
    }

    #[tokio::test]
    async fn allow_list_grants_access() {
        let ctx = context(AuthSettings::default()).await;
        ctx.registry
            .create_or_update_app(&fleetgrid_model::AppSpec {
                name: "web".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        ctx.registry.allow_app("web-team", "web").await.unwrap();
        ctx.authorize_app(&auth("alice", "pw"), "web").await.unwrap();
        assert_eq!(
            ctx.allowed_apps(&auth("alice", "pw")).await.unwrap(),
            BTreeSet::from(["web".to_string()])
        );
    }

    #[tokio::test]
    async fn skip_authorization_passes_everything() {
        let ctx = context(AuthSettings {
            skip_authorization: true,
            ..AuthSettings::default()
        })
        .await;
        let nobody = auth("nobody", "");
        ctx.simple_authorize(&nobody).await.unwrap();
        ctx.authorize_super_user(&nobody).await.unwrap();
        ctx.authorize_app(&nobody, "web").await.unwrap();
        ctx.authorize_team_admin(&nobody, "web-team").await.unwrap();
    }

    #[tokio::test]
    async fn check_role_needs_a_registered_manager() {
        let ctx = context(AuthSettings::default()).await;
        let err = ctx.check_role("apps", "write").await.unwrap_err();
        assert_eq!(err.kind(), "not_found");

        ctx.registry
            .register_manager("us-east-1", "mgr-1", "mgr-1.example")
            .await
            .unwrap();
        let err = ctx.check_role("apps", "write").await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "This manager does not have the ability to write apps. Please try one of these:\n"
        );

        ctx.registry
            .set_manager_role("us-east-1", "mgr-1", "apps", "write", true)
            .await
            .unwrap();
        ctx.check_role("apps", "write").await.unwrap();
    }
}
