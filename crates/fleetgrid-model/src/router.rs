//! Registry of router processes, per scope and zone.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ModelResult;
use crate::layout::{Scope, validate_segment};
use crate::registry::Registry;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterRecord {
    pub internal: bool,
    pub zone: String,
    pub host: String,
    /// Public address.
    pub ip: String,
    #[serde(default)]
    pub cname: String,
    /// DNS record IDs owned by this router.
    #[serde(default)]
    pub record_ids: Vec<String>,
}

impl RouterRecord {
    pub fn new(scope: Scope, zone: &str, host: &str, ip: &str) -> Self {
        Self {
            internal: scope.is_internal(),
            zone: zone.to_string(),
            host: host.to_string(),
            ip: ip.to_string(),
            cname: String::new(),
            record_ids: Vec::new(),
        }
    }

    pub fn scope(&self) -> Scope {
        Scope::from_internal(self.internal)
    }
}

impl Registry {
    pub async fn save_router(&self, router: &RouterRecord) -> ModelResult<()> {
        validate_segment("zone", &router.zone)?;
        validate_segment("host", &router.host)?;
        let path = self
            .layout()
            .router(router.scope(), &router.zone, &router.host);
        self.store().set_json(&path, router, true).await?;
        info!(scope = %router.scope(), zone = %router.zone, host = %router.host, "router saved");
        Ok(())
    }

    pub async fn get_router(&self, scope: Scope, zone: &str, host: &str) -> ModelResult<RouterRecord> {
        validate_segment("zone", zone)?;
        validate_segment("host", host)?;
        self.read(
            "router",
            &format!("{scope}/{zone}/{host}"),
            &self.layout().router(scope, zone, host),
        )
        .await
    }

    /// zone → sorted hosts.
    pub async fn list_routers(&self, scope: Scope) -> ModelResult<BTreeMap<String, Vec<String>>> {
        let mut routers = BTreeMap::new();
        for zone in self.children_or_empty(&self.layout().routers(scope)).await? {
            let hosts = self
                .children_or_empty(&self.layout().routers_in(scope, &zone))
                .await?;
            routers.insert(zone, hosts);
        }
        Ok(routers)
    }

    /// Returns true if the router was registered.
    pub async fn delete_router(&self, scope: Scope, zone: &str, host: &str) -> ModelResult<bool> {
        validate_segment("zone", zone)?;
        validate_segment("host", host)?;
        let path = self.layout().router(scope, zone, host);
        if !self.store().exists(&path).await? {
            return Ok(false);
        }
        self.store().delete(&path).await?;
        info!(%scope, zone, host, "router deleted");
        Ok(true)
    }
}
