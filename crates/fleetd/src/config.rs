//! fleetd.toml configuration.
//!
//! Every field has a default, so an empty file is a valid (development)
//! configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use fleetgrid_coord::RemoteStore;
use fleetgrid_model::{DEFAULT_ROOT, PortRange};
use fleetgrid_rpc::{AuthSettings, DEFAULT_SUPERVISOR_PORT, StaticDirectory};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UserConfig {
    pub name: String,
    pub secret: String,
    pub teams: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuthConfig {
    pub skip_authorization: bool,
    pub super_user_group: String,
    pub users: Vec<UserConfig>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        let settings = AuthSettings::default();
        Self {
            skip_authorization: settings.skip_authorization,
            super_user_group: settings.super_user_group,
            users: Vec::new(),
        }
    }
}

/// A role this manager grants itself at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoleGrant {
    pub role: String,
    pub rtype: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FleetdConfig {
    pub region: String,
    pub zone: String,
    pub host: String,
    /// Name other managers use to reach this one; defaults to `host`.
    pub cname: String,
    pub listen: String,
    pub data_dir: PathBuf,
    /// Coordination service of another manager, `http://host:port`. Empty
    /// means this manager owns the store file and serves it to the others.
    pub coord_url: String,
    /// Silence after which a remote manager's session is expired.
    pub session_timeout: String,
    pub coord_request_timeout: String,
    pub store_root: String,
    pub min_router_port: u16,
    pub max_router_port: u16,
    /// How long finished task results are kept.
    pub result_duration: String,
    pub maintenance_file: PathBuf,
    pub maintenance_check_interval: String,
    /// Bound on a `<Verb>Result` poll.
    pub result_wait: String,
    pub supervisor_port: u16,
    pub supervisor_timeout: String,
    pub supervisors: Vec<String>,
    pub encryption_secret: String,
    pub log_format: LogFormat,
    pub roles: Vec<RoleGrant>,
    pub auth: AuthConfig,
}

impl Default for FleetdConfig {
    fn default() -> Self {
        let ports = PortRange::default();
        Self {
            region: "dev".into(),
            zone: "dev".into(),
            host: "localhost".into(),
            cname: String::new(),
            listen: "0.0.0.0:1338".into(),
            data_dir: PathBuf::from("/var/lib/fleetgrid"),
            coord_url: String::new(),
            session_timeout: "30s".into(),
            coord_request_timeout: "10s".into(),
            store_root: DEFAULT_ROOT.into(),
            min_router_port: ports.min,
            max_router_port: ports.max,
            result_duration: "30m".into(),
            maintenance_file: PathBuf::from("/etc/fleetgrid/manager/maint"),
            maintenance_check_interval: "5s".into(),
            result_wait: "30s".into(),
            supervisor_port: DEFAULT_SUPERVISOR_PORT,
            supervisor_timeout: "30s".into(),
            supervisors: Vec::new(),
            encryption_secret: String::new(),
            log_format: LogFormat::Text,
            roles: Vec::new(),
            auth: AuthConfig::default(),
        }
    }
}

impl FleetdConfig {
    /// Read, parse and validate a config file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        for (field, value) in [
            ("region", &self.region),
            ("zone", &self.zone),
            ("host", &self.host),
        ] {
            if value.trim().is_empty() || value.contains('/') {
                bail!("{field} must be non-empty and contain no '/', got {value:?}");
            }
        }
        if self.listen.trim().is_empty() {
            bail!("listen must not be empty");
        }
        self.port_range()?;
        self.result_duration()?;
        self.maintenance_check_interval()?;
        self.result_wait()?;
        self.supervisor_timeout()?;
        self.session_timeout()?;
        self.coord_request_timeout()?;
        if !self.coord_url.is_empty() {
            RemoteStore::new(&self.coord_url).context("invalid coord_url")?;
        }
        for grant in &self.roles {
            if grant.role.is_empty() || grant.rtype.is_empty() {
                bail!("roles entries need both role and rtype");
            }
        }
        for user in &self.auth.users {
            if user.name.is_empty() {
                bail!("auth.users entries need a name");
            }
        }
        Ok(())
    }

    pub fn cname(&self) -> &str {
        if self.cname.is_empty() {
            &self.host
        } else {
            &self.cname
        }
    }

    pub fn port_range(&self) -> anyhow::Result<PortRange> {
        PortRange::new(self.min_router_port, self.max_router_port)
            .context("invalid router port range")
    }

    pub fn result_duration(&self) -> anyhow::Result<Duration> {
        duration_field("result_duration", &self.result_duration)
    }

    pub fn maintenance_check_interval(&self) -> anyhow::Result<Duration> {
        duration_field("maintenance_check_interval", &self.maintenance_check_interval)
    }

    pub fn result_wait(&self) -> anyhow::Result<Duration> {
        duration_field("result_wait", &self.result_wait)
    }

    pub fn supervisor_timeout(&self) -> anyhow::Result<Duration> {
        duration_field("supervisor_timeout", &self.supervisor_timeout)
    }

    pub fn session_timeout(&self) -> anyhow::Result<Duration> {
        duration_field("session_timeout", &self.session_timeout)
    }

    pub fn coord_request_timeout(&self) -> anyhow::Result<Duration> {
        duration_field("coord_request_timeout", &self.coord_request_timeout)
    }

    /// Whether this manager hosts the coordination store.
    pub fn owns_store(&self) -> bool {
        self.coord_url.is_empty()
    }

    pub fn auth_settings(&self) -> AuthSettings {
        AuthSettings {
            skip_authorization: self.auth.skip_authorization,
            super_user_group: self.auth.super_user_group.clone(),
        }
    }

    pub fn directory(&self) -> StaticDirectory {
        self.auth
            .users
            .iter()
            .fold(StaticDirectory::new(), |directory, user| {
                directory.with_user(&user.name, &user.secret, user.teams.iter().cloned())
            })
    }

    /// Copy with secrets blanked, for printing.
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        if !config.encryption_secret.is_empty() {
            config.encryption_secret = "<redacted>".into();
        }
        for user in &mut config.auth.users {
            user.secret = "<redacted>".into();
        }
        config
    }
}

fn duration_field(field: &str, value: &str) -> anyhow::Result<Duration> {
    match parse_duration(value) {
        Some(duration) => Ok(duration),
        None => bail!("{field}: cannot parse duration {value:?}"),
    }
}

/// Parse `"500ms"`, `"5s"`, `"2m"`, `"1h"`, or a plain number of seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else if let Some(hours) = s.strip_suffix('h') {
        hours.parse::<u64>().ok().map(|h| Duration::from_secs(h * 3600))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_file_gives_defaults() {
        let config: FleetdConfig = toml::from_str("").unwrap();
        config.validate().unwrap();
        assert_eq!(config, FleetdConfig::default());
        assert_eq!(config.listen, "0.0.0.0:1338");
        assert_eq!(config.port_range().unwrap(), PortRange::default());
        assert_eq!(config.result_duration().unwrap(), Duration::from_secs(1800));
        assert_eq!(config.cname(), "localhost");
        assert!(config.owns_store());
        assert_eq!(config.session_timeout().unwrap(), Duration::from_secs(30));
    }

    #[test]
    fn shared_store_settings() {
        let config: FleetdConfig = toml::from_str(
            r#"
            coord_url = "http://mgr-1.fleet.example:1338"
            session_timeout = "10s"
            coord_request_timeout = "2s"
            "#,
        )
        .unwrap();
        config.validate().unwrap();
        assert!(!config.owns_store());
        assert_eq!(config.session_timeout().unwrap(), Duration::from_secs(10));
        assert_eq!(config.coord_request_timeout().unwrap(), Duration::from_secs(2));

        let config = FleetdConfig {
            coord_url: "https://mgr-1:1338".into(),
            ..FleetdConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("coord_url"));
    }

    #[test]
    fn full_file_parses() {
        let config: FleetdConfig = toml::from_str(
            r#"
            region = "us-east-1"
            zone = "us-east-1a"
            host = "mgr-1"
            cname = "mgr-1.fleet.example"
            min_router_port = 40000
            max_router_port = 40100
            supervisors = ["sup-1", "sup-2"]
            log_format = "json"
            roles = [{ role = "apps", rtype = "write" }]

            [auth]
            super_user_group = "ops"

            [[auth.users]]
            name = "alice"
            secret = "pw"
            teams = ["web-team"]
            "#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.cname(), "mgr-1.fleet.example");
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.port_range().unwrap().min, 40000);
        assert_eq!(config.roles[0].rtype, "write");
        assert_eq!(config.auth_settings().super_user_group, "ops");
        assert_eq!(config.directory().len(), 1);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<FleetdConfig>("regoin = \"x\"").is_err());
    }

    #[test]
    fn validation_failures() {
        let config = FleetdConfig {
            min_router_port: 50000,
            max_router_port: 40000,
            ..FleetdConfig::default()
        };
        assert!(config.validate().is_err());

        let config = FleetdConfig {
            host: "a/b".into(),
            ..FleetdConfig::default()
        };
        assert!(config.validate().is_err());

        let config = FleetdConfig {
            result_wait: "soon".into(),
            ..FleetdConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("result_wait"));
    }

    #[test]
    fn load_reads_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "region = \"eu-west-1\"").unwrap();
        let config = FleetdConfig::load(file.path()).unwrap();
        assert_eq!(config.region, "eu-west-1");

        assert!(FleetdConfig::load(Path::new("/nonexistent/fleetd.toml")).is_err());
    }

    #[test]
    fn redaction_hides_secrets() {
        let mut config = FleetdConfig {
            encryption_secret: "hunter2".into(),
            ..FleetdConfig::default()
        };
        config.auth.users.push(UserConfig {
            name: "alice".into(),
            secret: "pw".into(),
            teams: vec![],
        });
        let redacted = config.redacted();
        assert_eq!(redacted.encryption_secret, "<redacted>");
        assert_eq!(redacted.auth.users[0].secret, "<redacted>");
    }

    #[test]
    fn durations() {
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("5s"), Some(Duration::from_secs(5)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("10"), Some(Duration::from_secs(10)));
        assert_eq!(parse_duration("ten"), None);
    }
}
