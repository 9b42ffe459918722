//! Store layout and naming rules.
//!
//! Every record lives at a deterministic path under the configured root:
//!
//! ```text
//! <root>/apps/<app>
//! <root>/envs/<env>
//! <root>/instances/<app>.<sha>.<env>.<host-tag>.<index>
//! <root>/managers/<region>/<host>
//! <root>/routers/<scope>/<zone>/<host>
//! <root>/router-ports/<scope>/<app>/<env>
//! <root>/router/<scope>/{pools,rules,tries,ports}/<name>
//! <root>/team-apps/<team>
//! <root>/locks/<name>
//! ```
//!
//! App, sha and env names are restricted to letters, digits and `-`, which
//! keeps `.` free as the composite-name separator.

use std::fmt;
use std::sync::LazyLock;

use fleetgrid_coord::path;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{ModelError, ModelResult};

static NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^[A-Za-z0-9-]+$").expect("name regex is valid"));

/// Routing namespace for ports, pools, tries, and routers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Internal,
    External,
}

impl Scope {
    pub const ALL: [Scope; 2] = [Scope::Internal, Scope::External];

    pub fn from_internal(internal: bool) -> Self {
        if internal {
            Scope::Internal
        } else {
            Scope::External
        }
    }

    pub fn is_internal(self) -> bool {
        self == Scope::Internal
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Scope::Internal => "internal",
            Scope::External => "external",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reject app, sha, and env names outside `[A-Za-z0-9-]+`.
pub fn validate_name(kind: &str, value: &str) -> ModelResult<()> {
    if NAME_RE.is_match(value) {
        Ok(())
    } else if value.is_empty() {
        Err(ModelError::Validation(format!("{kind} is empty")))
    } else {
        Err(ModelError::Validation(format!(
            "{kind} {value:?} may only contain letters, numbers, and -"
        )))
    }
}

/// Reject free-form path segments (hosts, regions, zones, teams) that
/// would escape their directory.
pub fn validate_segment(kind: &str, value: &str) -> ModelResult<()> {
    if value.is_empty() {
        return Err(ModelError::Validation(format!("{kind} is empty")));
    }
    if value.contains('/') || value == "." || value == ".." {
        return Err(ModelError::Validation(format!(
            "{kind} {value:?} is not a valid name"
        )));
    }
    Ok(())
}

/// Pool name for one (app, sha, env) triple.
pub fn pool_name(app: &str, sha: &str, env: &str) -> String {
    format!("{app}.{sha}.{env}")
}

/// Trie name for one (app, env) pair.
pub fn trie_name(app: &str, env: &str) -> String {
    format!("{app}.{env}")
}

/// Path builder rooted at one store prefix.
#[derive(Debug, Clone)]
pub struct Layout {
    root: String,
}

impl Layout {
    pub fn new(root: impl Into<String>) -> ModelResult<Self> {
        let root = root.into();
        path::validate(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    fn under(&self, rel: &str) -> String {
        path::join(&self.root, rel)
    }

    // ── Apps / envs / instances ────────────────────────────────────

    pub fn apps(&self) -> String {
        self.under("apps")
    }

    pub fn app(&self, name: &str) -> String {
        self.under(&format!("apps/{name}"))
    }

    pub fn envs(&self) -> String {
        self.under("envs")
    }

    pub fn env(&self, name: &str) -> String {
        self.under(&format!("envs/{name}"))
    }

    pub fn instances(&self) -> String {
        self.under("instances")
    }

    pub fn instance(&self, id: &str) -> String {
        self.under(&format!("instances/{id}"))
    }

    // ── Managers / routers ─────────────────────────────────────────

    pub fn managers(&self) -> String {
        self.under("managers")
    }

    pub fn managers_in(&self, region: &str) -> String {
        self.under(&format!("managers/{region}"))
    }

    pub fn manager(&self, region: &str, host: &str) -> String {
        self.under(&format!("managers/{region}/{host}"))
    }

    pub fn routers(&self, scope: Scope) -> String {
        self.under(&format!("routers/{scope}"))
    }

    pub fn routers_in(&self, scope: Scope, zone: &str) -> String {
        self.under(&format!("routers/{scope}/{zone}"))
    }

    pub fn router(&self, scope: Scope, zone: &str, host: &str) -> String {
        self.under(&format!("routers/{scope}/{zone}/{host}"))
    }

    // ── Router ports ───────────────────────────────────────────────

    pub fn router_ports(&self, scope: Scope) -> String {
        self.under(&format!("router-ports/{scope}"))
    }

    pub fn router_ports_for(&self, scope: Scope, app: &str) -> String {
        self.under(&format!("router-ports/{scope}/{app}"))
    }

    pub fn router_port(&self, scope: Scope, app: &str, env: &str) -> String {
        self.under(&format!("router-ports/{scope}/{app}/{env}"))
    }

    // ── Routing config consumed by routers ─────────────────────────

    pub fn pools(&self, scope: Scope) -> String {
        self.under(&format!("router/{scope}/pools"))
    }

    pub fn pool(&self, scope: Scope, name: &str) -> String {
        self.under(&format!("router/{scope}/pools/{name}"))
    }

    pub fn rules(&self, scope: Scope) -> String {
        self.under(&format!("router/{scope}/rules"))
    }

    pub fn rule(&self, scope: Scope, name: &str) -> String {
        self.under(&format!("router/{scope}/rules/{name}"))
    }

    pub fn tries(&self, scope: Scope) -> String {
        self.under(&format!("router/{scope}/tries"))
    }

    pub fn trie(&self, scope: Scope, name: &str) -> String {
        self.under(&format!("router/{scope}/tries/{name}"))
    }

    pub fn port_bindings(&self, scope: Scope) -> String {
        self.under(&format!("router/{scope}/ports"))
    }

    pub fn port_binding(&self, scope: Scope, port: u16) -> String {
        self.under(&format!("router/{scope}/ports/{port}"))
    }

    // ── Teams / locks ──────────────────────────────────────────────

    pub fn team_apps_dir(&self) -> String {
        self.under("team-apps")
    }

    pub fn team_apps(&self, team: &str) -> String {
        self.under(&format!("team-apps/{team}"))
    }

    pub fn locks(&self) -> String {
        self.under("locks")
    }

    pub fn lock(&self, name: &str) -> String {
        self.under(&format!("locks/{name}"))
    }

    /// Directories that must exist before the manager serves requests.
    pub fn base_paths(&self) -> Vec<String> {
        let mut paths = vec![
            self.apps(),
            self.envs(),
            self.instances(),
            self.managers(),
            self.team_apps_dir(),
            self.locks(),
        ];
        for scope in Scope::ALL {
            paths.push(self.routers(scope));
            paths.push(self.router_ports(scope));
            paths.push(self.pools(scope));
            paths.push(self.rules(scope));
            paths.push(self.tries(scope));
            paths.push(self.port_bindings(scope));
        }
        paths
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_allow_letters_digits_dash() {
        assert!(validate_name("app", "hello-go").is_ok());
        assert!(validate_name("sha", "1234abcd").is_ok());
    }

    #[test]
    fn names_reject_separator_and_empty() {
        assert!(validate_name("app", "a.b").is_err());
        assert!(validate_name("env", "").is_err());
        assert!(validate_name("env", "pr/od").is_err());
        assert!(validate_name("env", "prod ").is_err());
    }

    #[test]
    fn name_pattern_is_compiled_once_and_shared() {
        let first = LazyLock::force(&NAME_RE) as *const Regex as usize;
        let seen: Vec<usize> = (0..4)
            .map(|_| {
                std::thread::spawn(|| {
                    for i in 0..1000 {
                        assert!(validate_name("app", &format!("app-{i}")).is_ok());
                        assert!(validate_name("app", &format!("app.{i}")).is_err());
                    }
                    LazyLock::force(&NAME_RE) as *const Regex as usize
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect();
        assert!(seen.iter().all(|addr| *addr == first));
    }

    #[test]
    fn segments_reject_slashes() {
        assert!(validate_segment("host", "host-1.example.com").is_ok());
        assert!(validate_segment("host", "a/b").is_err());
        assert!(validate_segment("team", "..").is_err());
    }

    #[test]
    fn composite_names() {
        assert_eq!(pool_name("app", "sha", "env"), "app.sha.env");
        assert_eq!(trie_name("app", "env"), "app.env");
    }

    #[test]
    fn layout_paths() {
        let layout = Layout::new("/fleetgrid").unwrap();
        assert_eq!(layout.app("web"), "/fleetgrid/apps/web");
        assert_eq!(
            layout.router_port(Scope::Internal, "web", "prod"),
            "/fleetgrid/router-ports/internal/web/prod"
        );
        assert_eq!(
            layout.pool(Scope::External, "web.abc.prod"),
            "/fleetgrid/router/external/pools/web.abc.prod"
        );
        assert_eq!(layout.lock("router-ports-internal"), "/fleetgrid/locks/router-ports-internal");
    }

    #[test]
    fn layout_rejects_relative_root() {
        assert!(Layout::new("fleetgrid").is_err());
    }
}
