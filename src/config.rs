//! Configuration management for sqlfleet.
//!
//! Handles loading configuration from a TOML file and environment variables.
//! The loaded values are passed explicitly to the resolver, binder and
//! executor; nothing reads configuration from global state.

use crate::batch::Impact;
use crate::db::DatabaseBackend;
use crate::error::{FleetError, Result};
use crate::instance::{Credential, InstanceSpec, SeparatorClassifier};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure for sqlfleet.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Scratch directory for temporary artifacts.
    #[serde(default)]
    pub scratch: ScratchConfig,

    /// Connection behavior.
    #[serde(default)]
    pub connection: ConnectionSettings,

    /// Query execution defaults.
    #[serde(default)]
    pub query: QuerySettings,

    /// Script download settings.
    #[serde(default)]
    pub download: DownloadSettings,

    /// Logging output.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Named instances.
    #[serde(default)]
    pub instances: HashMap<String, InstanceConfig>,
}

/// Scratch directory configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ScratchConfig {
    /// Directory for downloaded and generated scripts.
    pub dir: Option<PathBuf>,
}

impl ScratchConfig {
    /// Returns the scratch directory, defaulting to a folder in the OS temp dir.
    pub fn resolve_dir(&self) -> PathBuf {
        self.dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("sqlfleet"))
    }
}

/// Connection behavior settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSettings {
    /// Legacy mode: never reuse pooled connections across targets.
    #[serde(default)]
    pub legacy: bool,

    /// Application name reported to the server.
    #[serde(default = "default_application_name")]
    pub application_name: String,

    /// Connect timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Accept self-signed server certificates.
    #[serde(default = "default_true")]
    pub trust_server_certificate: bool,

    /// Characters that mark a login as a domain identity.
    #[serde(default = "default_domain_separators")]
    pub domain_separators: Vec<String>,
}

fn default_application_name() -> String {
    "sqlfleet".to_string()
}

fn default_connect_timeout() -> u64 {
    15
}

fn default_true() -> bool {
    true
}

fn default_domain_separators() -> Vec<String> {
    vec!["\\".to_string()]
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            legacy: false,
            application_name: default_application_name(),
            connect_timeout_secs: default_connect_timeout(),
            trust_server_certificate: true,
            domain_separators: default_domain_separators(),
        }
    }
}

impl ConnectionSettings {
    /// Builds the domain-identity classifier from the configured separators.
    pub fn credential_classifier(&self) -> SeparatorClassifier {
        SeparatorClassifier::new(self.domain_separators.iter().filter_map(|s| s.chars().next()))
    }

    /// Returns the connect timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Query execution defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuerySettings {
    /// Query timeout in seconds.
    #[serde(default = "default_query_timeout")]
    pub timeout_secs: u64,

    /// File extensions picked up when a directory is given as input.
    #[serde(default = "default_script_extensions")]
    pub script_extensions: Vec<String>,

    /// Actions at or above this impact ask for confirmation.
    #[serde(default)]
    pub confirm_threshold: Impact,
}

fn default_query_timeout() -> u64 {
    600
}

fn default_script_extensions() -> Vec<String> {
    vec!["sql".to_string()]
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_query_timeout(),
            script_extensions: default_script_extensions(),
            confirm_threshold: Impact::default(),
        }
    }
}

/// Script download settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadSettings {
    /// User for the retry with default credentials.
    pub user: Option<String>,

    /// Password for the retry with default credentials.
    pub password: Option<String>,

    /// Request timeout in seconds.
    #[serde(default = "default_download_timeout")]
    pub timeout_secs: u64,
}

fn default_download_timeout() -> u64 {
    60
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            user: None,
            password: None,
            timeout_secs: default_download_timeout(),
        }
    }
}

/// Logging output configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LoggingConfig {
    /// Write logs to this file instead of stderr.
    pub file: Option<PathBuf>,
}

/// A named instance from the config file.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct InstanceConfig {
    /// Database backend.
    #[serde(default)]
    pub backend: DatabaseBackend,

    /// Server host.
    pub host: String,

    /// Server port.
    pub port: Option<u16>,

    /// SQL Server named instance.
    pub instance_name: Option<String>,

    /// Database to connect to.
    pub database: Option<String>,

    /// Login name.
    pub user: Option<String>,

    /// Password (not recommended to store in config; use the keyring).
    pub password: Option<String>,

    /// Request read-only application intent.
    #[serde(default)]
    pub read_only: bool,
}

impl InstanceConfig {
    /// Converts the named instance to an instance specification.
    pub fn to_spec(&self) -> InstanceSpec {
        let mut spec = InstanceSpec::new(&self.host).with_backend(self.backend);
        spec.port = self.port;
        spec.instance_name = self.instance_name.clone();
        spec.database = self.database.clone();
        spec.read_only = self.read_only;
        spec.credential = self
            .user
            .as_ref()
            .map(|user| Credential::new(user, self.password.clone()));
        spec
    }
}

impl Config {
    /// Returns the default config file path for the current platform.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("sqlfleet")
            .join("config.toml")
    }

    /// Loads configuration from a TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| FleetError::config(format!("Failed to read config file: {e}")))?;

        Self::parse_toml(&content, path)
    }

    /// Parses configuration from a TOML string.
    fn parse_toml(content: &str, path: &Path) -> Result<Self> {
        toml::from_str(content).map_err(|e| {
            FleetError::config(format!(
                "Configuration error in {}:\n  {}",
                path.display(),
                e
            ))
        })
    }

    /// Applies environment variables (SQLFLEET_SCRATCH_DIR, SQLFLEET_HTTP_USER, ...)
    /// on top of file values.
    pub fn apply_env_defaults(&mut self) {
        if let Ok(dir) = std::env::var("SQLFLEET_SCRATCH_DIR") {
            self.scratch.dir = Some(PathBuf::from(dir));
        }
        if self.download.user.is_none() {
            self.download.user = std::env::var("SQLFLEET_HTTP_USER").ok();
        }
        if self.download.password.is_none() {
            self.download.password = std::env::var("SQLFLEET_HTTP_PASSWORD").ok();
        }
    }

    /// Resolves an instance argument: a configured name or an instance string.
    pub fn resolve_instance(&self, input: &str) -> Result<InstanceSpec> {
        match self.instances.get(input) {
            Some(named) => {
                if named.host.is_empty() {
                    return Err(FleetError::config(format!(
                        "Instance '{input}' has no host in the config file"
                    )));
                }
                Ok(named.to_spec())
            }
            None => InstanceSpec::parse(input),
        }
    }

    /// Returns the query timeout.
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query.timeout_secs)
    }
}
