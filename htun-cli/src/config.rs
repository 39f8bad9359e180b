use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use htun::RegistryConfig;
use htun::server::{DEFAULT_BASE_PATH, ServerConfig};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::sys;

const USER_PATH: &str = "htun/config.toml";
const ENV_PREFIX: &str = "HTUN";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration")]
    Load(#[from] config::ConfigError),

    #[error("No {field} for profile '{profile}'; pass --{flag} or set it under [profile.{profile}]")]
    Missing {
        profile: String,
        field: &'static str,
        flag: &'static str,
    },
}

impl ConfigError {
    pub fn missing(profile: &str, field: &'static str, flag: &'static str) -> Self {
        ConfigError::Missing {
            profile: profile.to_owned(),
            field,
            flag,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerSection,
    profile: HashMap<String, ProfileConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub listen: SocketAddr,
    pub base_path: String,
    #[serde(deserialize_with = "duration::deserialize")]
    pub max_idle: Duration,
    #[serde(deserialize_with = "duration::deserialize")]
    pub eviction_interval: Duration,
    #[serde(deserialize_with = "duration::deserialize")]
    pub keepalive_interval: Duration,
    #[serde(deserialize_with = "duration::deserialize")]
    pub connect_timeout: Duration,
    pub event_log_capacity: usize,
    /// Username to argon2 PHC hash.
    pub users: HashMap<String, String>,
}

impl Default for ServerSection {
    fn default() -> Self {
        let server = ServerConfig::default();
        Self {
            listen: server.listen,
            base_path: DEFAULT_BASE_PATH.to_owned(),
            max_idle: server.registry.max_idle,
            eviction_interval: server.registry.eviction_interval,
            keepalive_interval: server.keepalive_interval,
            connect_timeout: server.connect_timeout,
            event_log_capacity: server.registry.event_log_capacity,
            users: HashMap::new(),
        }
    }
}

impl ServerSection {
    pub fn to_server_config(&self) -> ServerConfig {
        if self.max_idle < self.keepalive_interval * 2 {
            warn!(
                max_idle = %humantime::format_duration(self.max_idle),
                keepalive_interval = %humantime::format_duration(self.keepalive_interval),
                "max_idle should be well above keepalive_interval; idle tunnels may be evicted"
            );
        }

        ServerConfig {
            listen: self.listen,
            base_path: self.base_path.clone(),
            keepalive_interval: self.keepalive_interval,
            connect_timeout: self.connect_timeout,
            registry: RegistryConfig {
                max_idle: self.max_idle,
                eviction_interval: self.eviction_interval,
                event_log_capacity: self.event_log_capacity,
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProfileConfig {
    pub proxy_url: Option<String>,
    pub username: Option<String>,
    pub remote_host: Option<String>,
    pub remote_port: Option<u16>,
    pub local_port: Option<u16>,
    #[serde(deserialize_with = "duration::deserialize")]
    pub ping_interval: Duration,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            proxy_url: None,
            username: None,
            remote_host: None,
            remote_port: None,
            local_port: None,
            ping_interval: Duration::from_secs(30),
        }
    }
}

impl Config {
    pub fn user_path() -> Option<PathBuf> {
        sys::config_dir().map(|config_dir| config_dir.join(USER_PATH))
    }

    /// Defaults, then the config file (`path`, or the per-user one when it
    /// exists), then `HTUN__SECTION__KEY` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();

        match path {
            Some(path) => {
                debug!(path = %path.display(), "Loading configuration");
                builder = builder.add_source(config::File::from(path).required(true));
            }
            None => {
                if let Some(path) = Self::user_path() {
                    debug!(path = %path.display(), "Loading configuration if present");
                    builder = builder.add_source(config::File::from(path).required(false));
                }
            }
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    pub fn profile(&self, name: &str) -> Option<&ProfileConfig> {
        self.profile.get(name)
    }
}

mod duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;
        let s: String = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(|e| D::Error::custom(format!("invalid duration: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn load(toml: &str) -> Result<Config, ConfigError> {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(toml.as_bytes()).unwrap();
        Config::load(Some(file.path()))
    }

    #[test]
    fn defaults_apply_to_an_empty_file() {
        let config = load("").unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:9999".parse::<SocketAddr>().unwrap());
        assert_eq!(config.server.base_path, "/proxy");
        assert_eq!(config.server.max_idle, Duration::from_secs(300));
        assert_eq!(config.server.keepalive_interval, Duration::from_secs(30));
        assert!(config.server.users.is_empty());
        assert!(config.profile("default").is_none());
    }

    #[test]
    fn server_and_profiles_are_read() {
        let config = load(
            r#"
            [server]
            listen = "0.0.0.0:8080"
            base_path = "/"
            max_idle = "10m"
            keepalive_interval = "15s"

            [server.users]
            alice = "$argon2id$v=19$m=19456,t=2,p=1$c2FsdA$aGFzaA"

            [profile.db]
            proxy_url = "http://proxy.example:8080/"
            username = "alice"
            remote_host = "db.internal"
            remote_port = 5432
            ping_interval = "1m"
            "#,
        )
        .unwrap();

        let server = config.server.to_server_config();
        assert_eq!(server.listen.port(), 8080);
        assert_eq!(server.base_path, "/");
        assert_eq!(server.registry.max_idle, Duration::from_secs(600));
        assert_eq!(server.keepalive_interval, Duration::from_secs(15));
        assert_eq!(server.connect_timeout, Duration::from_secs(30));
        assert!(config.server.users.contains_key("alice"));

        let profile = config.profile("db").unwrap();
        assert_eq!(profile.remote_host.as_deref(), Some("db.internal"));
        assert_eq!(profile.remote_port, Some(5432));
        assert_eq!(profile.local_port, None);
        assert_eq!(profile.ping_interval, Duration::from_secs(60));
    }

    #[test]
    fn bad_duration_is_an_error() {
        assert!(load("[server]\nmax_idle = \"soon\"\n").is_err());
    }

    #[test]
    fn explicit_file_must_exist() {
        assert!(Config::load(Some(Path::new("/nonexistent/htun.toml"))).is_err());
    }
}
