//! Team → permitted apps allow-lists.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{ModelError, ModelResult};
use crate::layout::validate_segment;
use crate::registry::Registry;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamApps {
    pub team: String,
    #[serde(default)]
    pub apps: BTreeSet<String>,
}

impl Registry {
    /// A team with no record has an empty allow-list.
    pub async fn get_team_apps(&self, team: &str) -> ModelResult<TeamApps> {
        validate_segment("team", team)?;
        Ok(self
            .read_opt(&self.layout().team_apps(team))
            .await?
            .unwrap_or_else(|| TeamApps {
                team: team.to_string(),
                apps: BTreeSet::new(),
            }))
    }

    /// Teams with an allow-list record.
    pub async fn list_team_apps(&self) -> ModelResult<Vec<String>> {
        self.children_or_empty(&self.layout().team_apps_dir()).await
    }

    pub async fn allow_app(&self, team: &str, app: &str) -> ModelResult<TeamApps> {
        validate_segment("team", team)?;
        if !self.app_exists(app).await? {
            return Err(ModelError::not_found("app", app));
        }
        self.update_team_apps(team, |apps| {
            apps.insert(app.to_string());
        })
        .await
    }

    pub async fn disallow_app(&self, team: &str, app: &str) -> ModelResult<TeamApps> {
        validate_segment("team", team)?;
        self.update_team_apps(team, |apps| {
            apps.remove(app);
        })
        .await
    }

    async fn update_team_apps<F>(&self, team: &str, mutate: F) -> ModelResult<TeamApps>
    where
        F: FnOnce(&mut BTreeSet<String>),
    {
        let _guard = self.lock(&format!("team-apps-{team}")).await?;
        let mut record = self.get_team_apps(team).await?;
        mutate(&mut record.apps);
        self.store()
            .set_json(&self.layout().team_apps(team), &record, true)
            .await?;
        info!(team, apps = record.apps.len(), "team allow-list updated");
        Ok(record)
    }
}
