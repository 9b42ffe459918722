//! Team allow-lists and permission queries.
//!
//! The team directory is read-only: verbs that would change team
//! membership, admins or emails authorize as usual and then fail with
//! `NotSupported`.

use std::collections::BTreeSet;

use async_trait::async_trait;
use fleetgrid_tasks::{Task, TaskError, TaskResult};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::managers::AuthOnlyArg;
use super::{Verb, require, to_value, verb};
use crate::auth::AuthArg;
use crate::context::ManagerContext;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TeamAppArg {
    pub auth: AuthArg,
    pub team: String,
    pub app: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TeamNameArg {
    pub auth: AuthArg,
    pub team: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UserQueryArg {
    pub auth: AuthArg,
    /// Whom to ask about; only super users may name someone else.
    pub user: String,
    pub app: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TeamArg {
    pub auth: AuthArg,
    pub team: String,
    pub user: String,
    pub email: String,
}

impl TeamArg {
    fn describe(&self) -> String {
        let subject = if self.email.is_empty() {
            &self.user
        } else {
            &self.email
        };
        format!("[{}] {} : {}", self.auth.user, subject, self.team)
    }
}

/// What a user may reach.
enum Access {
    All,
    Apps(BTreeSet<String>),
}

impl Access {
    fn allows(&self, app: &str) -> bool {
        match self {
            Self::All => true,
            Self::Apps(apps) => apps.contains(app),
        }
    }
}

/// Access of `user` as seen by the caller. Callers other than super users
/// always get their own answer.
async fn access_of(ctx: &ManagerContext, auth: &AuthArg, user: &str) -> TaskResult<Access> {
    let caller_is_super = ctx.is_super_user(auth).await;
    if user.is_empty() || user == auth.user || !caller_is_super {
        if caller_is_super {
            return Ok(Access::All);
        }
        return Ok(Access::Apps(ctx.allowed_apps(auth).await?));
    }
    let teams = ctx.directory.teams_of(user).await.unwrap_or_default();
    if teams.contains(&ctx.auth.super_user_group) {
        return Ok(Access::All);
    }
    Ok(Access::Apps(ctx.apps_for_teams(&teams).await?))
}

verb!(ListTeams(AuthOnlyArg));

#[async_trait]
impl Verb for ListTeams {
    fn description(&self) -> String {
        "ListTeams".into()
    }

    async fn authorize(&self) -> TaskResult<()> {
        self.ctx.simple_authorize(&self.arg.auth).await
    }

    async fn execute(&self, _task: &Task) -> TaskResult<Value> {
        let teams = self.ctx.caller_teams(&self.arg.auth).await;
        Ok(json!({ "teams": teams }))
    }
}

impl TeamAppArg {
    fn validate(&self) -> TaskResult<()> {
        require("team", &self.team)?;
        require("app", &self.app)
    }

    fn describe(&self) -> String {
        format!("[{}] {} : {}", self.auth.user, self.app, self.team)
    }

    /// Members of `team` and super users may edit its allow-list.
    async fn check_membership(&self, ctx: &ManagerContext, verb: &str) -> TaskResult<()> {
        if ctx.caller_teams(&self.auth).await.contains(&self.team)
            || ctx.is_super_user(&self.auth).await
        {
            return Ok(());
        }
        Err(TaskError::PermissionDenied(format!(
            "You do not have permission to {verb} apps for team {}",
            self.team
        )))
    }
}

verb!(AllowApp(TeamAppArg));

#[async_trait]
impl Verb for AllowApp {
    fn description(&self) -> String {
        self.arg.describe()
    }

    fn validate(&self) -> TaskResult<()> {
        self.arg.validate()
    }

    async fn authorize(&self) -> TaskResult<()> {
        self.arg.check_membership(&self.ctx, "allow").await
    }

    async fn execute(&self, _task: &Task) -> TaskResult<Value> {
        let record = self
            .ctx
            .registry
            .allow_app(&self.arg.team, &self.arg.app)
            .await?;
        to_value(record)
    }
}

verb!(DisallowApp(TeamAppArg));

#[async_trait]
impl Verb for DisallowApp {
    fn description(&self) -> String {
        self.arg.describe()
    }

    fn validate(&self) -> TaskResult<()> {
        self.arg.validate()
    }

    async fn authorize(&self) -> TaskResult<()> {
        self.arg.check_membership(&self.ctx, "disallow").await
    }

    async fn execute(&self, _task: &Task) -> TaskResult<Value> {
        let record = self
            .ctx
            .registry
            .disallow_app(&self.arg.team, &self.arg.app)
            .await?;
        to_value(record)
    }
}

verb!(ListTeamApps(TeamNameArg));

#[async_trait]
impl Verb for ListTeamApps {
    fn description(&self) -> String {
        format!("[{}] {}", self.arg.auth.user, self.arg.team)
    }

    fn validate(&self) -> TaskResult<()> {
        require("team", &self.arg.team)
    }

    async fn authorize(&self) -> TaskResult<()> {
        self.ctx.simple_authorize(&self.arg.auth).await
    }

    async fn execute(&self, _task: &Task) -> TaskResult<Value> {
        let record = self.ctx.registry.get_team_apps(&self.arg.team).await?;
        Ok(json!({ "apps": record.apps }))
    }
}

verb!(IsAppAllowed(UserQueryArg));

#[async_trait]
impl Verb for IsAppAllowed {
    fn description(&self) -> String {
        format!("[{}] {} : {}", self.arg.auth.user, self.arg.app, self.arg.user)
    }

    fn validate(&self) -> TaskResult<()> {
        require("app", &self.arg.app)
    }

    async fn authorize(&self) -> TaskResult<()> {
        Ok(())
    }

    async fn execute(&self, _task: &Task) -> TaskResult<Value> {
        let access = access_of(&self.ctx, &self.arg.auth, &self.arg.user).await?;
        Ok(json!({ "is_allowed": access.allows(&self.arg.app) }))
    }
}

verb!(ListAllowedApps(UserQueryArg));

#[async_trait]
impl Verb for ListAllowedApps {
    fn description(&self) -> String {
        format!("[{}] {}", self.arg.auth.user, self.arg.user)
    }

    async fn authorize(&self) -> TaskResult<()> {
        Ok(())
    }

    async fn execute(&self, _task: &Task) -> TaskResult<Value> {
        if self.ctx.auth.skip_authorization {
            return Ok(json!({ "apps": ["all"] }));
        }
        let apps: Vec<String> = match access_of(&self.ctx, &self.arg.auth, &self.arg.user).await? {
            Access::All => self.ctx.registry.list_apps().await?,
            Access::Apps(apps) => apps.into_iter().collect(),
        };
        Ok(json!({ "apps": apps }))
    }
}

verb!(IsSuperUser(UserQueryArg));

#[async_trait]
impl Verb for IsSuperUser {
    fn description(&self) -> String {
        format!("[{}] {}", self.arg.auth.user, self.arg.user)
    }

    async fn authorize(&self) -> TaskResult<()> {
        Ok(())
    }

    async fn execute(&self, task: &Task) -> TaskResult<Value> {
        let a = &self.arg;
        let caller_is_super = self.ctx.is_super_user(&a.auth).await;
        let is_super = if a.user.is_empty() || a.user == a.auth.user || !caller_is_super {
            caller_is_super
        } else {
            self.ctx
                .directory
                .teams_of(&a.user)
                .await
                .is_some_and(|teams| teams.contains(&self.ctx.auth.super_user_group))
        };
        task.log(format!("-> {is_super}"));
        Ok(json!({ "is_super_user": is_super }))
    }
}

verb!(
    /// Teams no longer have admins.
    IsTeamAdmin(TeamArg)
);

#[async_trait]
impl Verb for IsTeamAdmin {
    fn description(&self) -> String {
        self.arg.describe()
    }

    async fn authorize(&self) -> TaskResult<()> {
        Ok(())
    }

    async fn execute(&self, _task: &Task) -> TaskResult<Value> {
        Ok(json!({ "is_admin": false }))
    }
}

// ── Disabled directory writes ──────────────────────────────────

/// A team-directory write that authorizes, then always fails.
macro_rules! unsupported {
    ($name:ident, $message:literal, |$verb:ident| $authorize:expr) => {
        verb!($name(TeamArg));

        #[async_trait]
        impl Verb for $name {
            fn description(&self) -> String {
                self.arg.describe()
            }

            async fn authorize(&self) -> TaskResult<()> {
                self.ctx.check_role("permissions", "write").await?;
                let $verb = self;
                $authorize
            }

            async fn execute(&self, _task: &Task) -> TaskResult<Value> {
                Err(TaskError::NotSupported($message.into()))
            }
        }
    };
}

unsupported!(CreateTeam, "Team creation is no longer supported", |v| {
    v.ctx.simple_authorize(&v.arg.auth).await
});
unsupported!(DeleteTeam, "Team Delete is no longer supported", |v| {
    v.ctx.authorize_team_admin(&v.arg.auth, &v.arg.team).await
});
unsupported!(
    AddTeamEmail,
    "Team email modification is no longer supported",
    |v| v.ctx.authorize_team_admin(&v.arg.auth, &v.arg.team).await
);
unsupported!(
    RemoveTeamEmail,
    "Team email modification is no longer supported",
    |v| v.ctx.authorize_team_admin(&v.arg.auth, &v.arg.team).await
);
unsupported!(AddTeamAdmin, "Modify Team admin is no longer supported", |_v| {
    Err(TaskError::PermissionDenied("Permission denied".into()))
});
unsupported!(RemoveTeamAdmin, "Modify Team admin is no longer supported", |_v| {
    Err(TaskError::PermissionDenied("Permission denied".into()))
});
unsupported!(
    AddTeamMember,
    "Modify Team member is no longer supported",
    |v| v.ctx.authorize_team_admin(&v.arg.auth, &v.arg.team).await
);
unsupported!(
    RemoveTeamMember,
    "Modify Team member is no longer supported",
    |v| v.ctx.authorize_team_admin(&v.arg.auth, &v.arg.team).await
);
