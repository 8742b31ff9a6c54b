//! Layered configuration: built-in defaults, TOML file, `TETHER__*`
//! environment overrides.

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const APP_NAME: &str = "tether";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { host: "127.0.0.1".to_string(), port: 4180 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite file path; `:memory:`-style paths are for tests only.
    pub path: PathBuf,
    /// Pool size shared by actors, the workflow engine, and HTTP handlers.
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_data_dir().join("tether.db"),
            max_connections: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// `local` (in-process stub runner) or `http` (remote provisioner).
    pub backend: String,
    /// Base URL of the remote provisioner when `backend = "http"`.
    pub provisioner_url: String,
    pub image: String,
    pub command: String,
    pub port: u16,
    pub idle_timeout_ms: u64,
    pub start_timeout_secs: u64,
    pub health_polls: u32,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            backend: "local".to_string(),
            provisioner_url: "http://localhost:4190".to_string(),
            image: "tether-runner:latest".to_string(),
            command: "tether-runner serve".to_string(),
            port: 8420,
            idle_timeout_ms: 15 * 60 * 1000,
            start_timeout_secs: 60,
            health_polls: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AuthConfig {
    /// Identity assumed when requests carry no `x-tether-user` header.
    pub default_user: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Proposal expiry sweep cadence.
    pub proposal_sweep_interval_secs: u64,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self { proposal_sweep_interval_secs: 300 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub sandbox: SandboxConfig,
    pub auth: AuthConfig,
    pub workflow: WorkflowConfig,
}

impl AppConfig {
    /// Load configuration, layering file and environment over defaults.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        let path = explicit_path
            .map(Path::to_path_buf)
            .unwrap_or_else(default_config_path);
        if path.exists() {
            builder = builder.add_source(
                File::from(path.as_path()).format(FileFormat::Toml).required(true),
            );
        } else if explicit_path.is_some() {
            anyhow::bail!("config file not found: {}", path.display());
        }

        builder = builder.add_source(Environment::with_prefix("TETHER").separator("__"));

        let config = builder.build().context("building configuration")?;
        let app: AppConfig = config.try_deserialize().context("deserializing configuration")?;
        Ok(app)
    }

    /// Commented default file written by `tether init`.
    pub fn default_toml() -> String {
        let defaults = AppConfig::default();
        format!(
            r#"# Tether control plane configuration.

[server]
host = "{host}"
port = {port}

[database]
path = "{db}"
max_connections = {db_conns}

[sandbox]
# "local" runs an in-process stub runner; "http" drives a remote provisioner.
backend = "{backend}"
provisioner_url = "{provisioner}"
image = "{image}"
command = "{command}"
port = {sbx_port}
idle_timeout_ms = {idle}
start_timeout_secs = {start}
health_polls = {polls}

[auth]
# Identity assumed when requests carry no x-tether-user header.
# default_user = "dev"

[workflow]
proposal_sweep_interval_secs = {sweep}
"#,
            host = defaults.server.host,
            port = defaults.server.port,
            db = defaults.database.path.display(),
            db_conns = defaults.database.max_connections,
            backend = defaults.sandbox.backend,
            provisioner = defaults.sandbox.provisioner_url,
            image = defaults.sandbox.image,
            command = defaults.sandbox.command,
            sbx_port = defaults.sandbox.port,
            idle = defaults.sandbox.idle_timeout_ms,
            start = defaults.sandbox.start_timeout_secs,
            polls = defaults.sandbox.health_polls,
            sweep = defaults.workflow.proposal_sweep_interval_secs,
        )
    }
}

pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
        .join("config.toml")
}

pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}
