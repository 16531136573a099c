use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "SNUABAR_DATA_DIR";
pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_PORT_SCAN_ATTEMPTS: u16 = 100;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub paths: PathsConfig,
    pub upstream: UpstreamConfig,
    pub registry: RegistryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    /// `0` asks the server to discover a free port.
    pub port: u16,
    pub port_scan_attempts: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub workflows_dir: PathBuf,
    pub output_dir: PathBuf,
}

/// Where the execution host lives and where its working folders are mounted locally.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub client_id: String,
    pub output_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub input_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct RegistryConfig {
    pub release_failed_jobs: bool,
    pub lookback_days: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            port_scan_attempts: DEFAULT_PORT_SCAN_ATTEMPTS,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            workflows_dir: PathBuf::from("workflows"),
            output_dir: PathBuf::from("output"),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8188".to_string(),
            client_id: String::new(),
            output_dir: PathBuf::from("ComfyUI/output"),
            temp_dir: PathBuf::from("ComfyUI/temp"),
            input_dir: PathBuf::from("ComfyUI/input"),
        }
    }
}

impl UpstreamConfig {
    /// Folder on the shared filesystem backing an upstream output `type`.
    pub fn folder_for(&self, kind: &str) -> &Path {
        match kind {
            "temp" => &self.temp_dir,
            "input" => &self.input_dir,
            _ => &self.output_dir,
        }
    }

    /// Configured client id, or a fresh random one when left empty.
    pub fn client_id_or_random(&self) -> String {
        let configured = self.client_id.trim();
        if configured.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            configured.to_string()
        }
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Rebase every relative path in the config onto `base`.
    pub fn resolve_paths(&mut self, base: &Path) {
        self.paths.workflows_dir = resolve_relative_to(base, &self.paths.workflows_dir);
        self.paths.output_dir = resolve_relative_to(base, &self.paths.output_dir);
        self.upstream.output_dir = resolve_relative_to(base, &self.upstream.output_dir);
        self.upstream.temp_dir = resolve_relative_to(base, &self.upstream.temp_dir);
        self.upstream.input_dir = resolve_relative_to(base, &self.upstream.input_dir);
    }
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. SNUABAR_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Create the data directory and write a default config.toml if none exists.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        AppConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}

pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
