//! Manager registrations and their role grants.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ModelResult;
use crate::layout::validate_segment;
use crate::registry::Registry;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerRecord {
    pub region: String,
    pub host: String,
    #[serde(default)]
    pub cname: String,
    /// role → permission type → granted.
    #[serde(default)]
    pub roles: BTreeMap<String, BTreeMap<String, bool>>,
}

impl ManagerRecord {
    pub fn new(region: &str, host: &str, cname: &str) -> Self {
        Self {
            region: region.to_string(),
            host: host.to_string(),
            cname: if cname.is_empty() {
                host.to_string()
            } else {
                cname.to_string()
            },
            roles: BTreeMap::new(),
        }
    }

    pub fn has_role(&self, role: &str, rtype: &str) -> bool {
        self.roles
            .get(role)
            .and_then(|types| types.get(rtype))
            .copied()
            .unwrap_or(false)
    }

    pub fn grant(&mut self, role: &str, rtype: &str) {
        self.roles
            .entry(role.to_string())
            .or_default()
            .insert(rtype.to_string(), true);
    }

    pub fn revoke(&mut self, role: &str, rtype: &str) {
        if let Some(types) = self.roles.get_mut(role) {
            types.remove(rtype);
            if types.is_empty() {
                self.roles.remove(role);
            }
        }
    }
}

impl Registry {
    pub async fn get_manager(&self, region: &str, host: &str) -> ModelResult<ManagerRecord> {
        validate_segment("region", region)?;
        validate_segment("host", host)?;
        self.read(
            "manager",
            &format!("{region}/{host}"),
            &self.layout().manager(region, host),
        )
        .await
    }

    /// Register a manager unless it already is. Returns the stored record.
    pub async fn register_manager(
        &self,
        region: &str,
        host: &str,
        cname: &str,
    ) -> ModelResult<ManagerRecord> {
        validate_segment("region", region)?;
        validate_segment("host", host)?;
        let _guard = self.lock(&format!("manager-{region}-{host}")).await?;
        let path = self.layout().manager(region, host);
        if let Some(existing) = self.read_opt::<ManagerRecord>(&path).await? {
            info!(region, host, "manager already registered");
            return Ok(existing);
        }
        let record = ManagerRecord::new(region, host, cname);
        self.store().set_json(&path, &record, true).await?;
        info!(region, host, cname = %record.cname, "manager registered");
        Ok(record)
    }

    /// Grant or revoke one role on a registered manager.
    pub async fn set_manager_role(
        &self,
        region: &str,
        host: &str,
        role: &str,
        rtype: &str,
        granted: bool,
    ) -> ModelResult<ManagerRecord> {
        validate_segment("region", region)?;
        validate_segment("host", host)?;
        let _guard = self.lock(&format!("manager-{region}-{host}")).await?;
        let path = self.layout().manager(region, host);
        let mut record: ManagerRecord = self
            .read("manager", &format!("{region}/{host}"), &path)
            .await?;
        if granted {
            record.grant(role, rtype);
        } else {
            record.revoke(role, rtype);
        }
        self.store().set_json(&path, &record, false).await?;
        info!(region, host, role, rtype, granted, "manager role updated");
        Ok(record)
    }

    /// region → sorted hosts.
    pub async fn list_managers(&self) -> ModelResult<BTreeMap<String, Vec<String>>> {
        let mut managers = BTreeMap::new();
        for region in self.children_or_empty(&self.layout().managers()).await? {
            let hosts = self
                .children_or_empty(&self.layout().managers_in(&region))
                .await?;
            managers.insert(region, hosts);
        }
        Ok(managers)
    }

    /// Returns true if the manager was registered.
    pub async fn delete_manager(&self, region: &str, host: &str) -> ModelResult<bool> {
        validate_segment("region", region)?;
        validate_segment("host", host)?;
        let path = self.layout().manager(region, host);
        if !self.store().exists(&path).await? {
            return Ok(false);
        }
        self.store().recursive_delete(&path).await?;
        Ok(true)
    }
}
