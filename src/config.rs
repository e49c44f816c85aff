//! Tunables for the preview session manager.
//!
//! Every field has a default, so an empty TOML document is a valid config:
//!
//! ```toml
//! api_base_url = "http://localhost:8000/api/v1"
//! dependency_dir = "node_modules"
//! package_cache_dir = ".npm-cache"
//!
//! [install]
//! program = "npm"
//! args = ["--no-audit", "--no-fund", "--prefer-offline"]
//! attempts = 2
//! incremental_threshold = 20
//!
//! [dev_server]
//! program = "npm"
//! args = ["run", "dev"]
//! ready_timeout_secs = 15
//!
//! [local]
//! root_dir = "/tmp/previews"
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PreviewConfig {
    /// Base URL of the project backend (bundle endpoint lives under it).
    pub api_base_url: String,
    /// Package-manager output directory; never deleted by file sync.
    pub dependency_dir: String,
    /// Package-manager cache, relative to the container root. Wiped when
    /// corruption is detected.
    pub package_cache_dir: String,
    pub install: InstallConfig,
    pub dev_server: DevServerConfig,
    pub local: LocalConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InstallConfig {
    pub program: String,
    /// Extra flags appended to every install command.
    pub args: Vec<String>,
    /// Total attempts when the install output shows cache corruption.
    pub attempts: u32,
    /// More missing packages than this triggers a full install.
    pub incremental_threshold: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DevServerConfig {
    pub program: String,
    pub args: Vec<String>,
    pub ready_timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    /// Parent directory for [`crate::runtime::local::LocalRuntime`]
    /// instances. Defaults to the platform cache dir.
    pub root_dir: Option<PathBuf>,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8000/api/v1".to_string(),
            dependency_dir: "node_modules".to_string(),
            package_cache_dir: ".npm-cache".to_string(),
            install: InstallConfig::default(),
            dev_server: DevServerConfig::default(),
            local: LocalConfig::default(),
        }
    }
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            program: "npm".to_string(),
            args: vec![
                "--no-audit".to_string(),
                "--no-fund".to_string(),
                "--prefer-offline".to_string(),
            ],
            attempts: 2,
            incremental_threshold: 20,
        }
    }
}

impl Default for DevServerConfig {
    fn default() -> Self {
        Self {
            program: "npm".to_string(),
            args: vec!["run".to_string(), "dev".to_string()],
            ready_timeout_secs: 15,
        }
    }
}

impl DevServerConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }
}

impl LocalConfig {
    /// Configured root, or `<cache dir>/sandbox-preview/instances`, or a temp dir.
    pub fn resolved_root(&self) -> PathBuf {
        if let Some(root) = &self.root_dir {
            return root.clone();
        }
        directories::ProjectDirs::from("", "", "sandbox-preview")
            .map(|dirs| dirs.cache_dir().join("instances"))
            .unwrap_or_else(|| std::env::temp_dir().join("sandbox-preview"))
    }
}

impl PreviewConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: PreviewConfig =
            toml::from_str(text).context("failed to parse preview config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        Self::from_toml_str(&text).with_context(|| format!("in {}", path.display()))
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.install.attempts >= 1, "install.attempts must be at least 1");
        anyhow::ensure!(
            !self.install.program.trim().is_empty(),
            "install.program must not be empty"
        );
        anyhow::ensure!(
            !self.dev_server.program.trim().is_empty(),
            "dev_server.program must not be empty"
        );
        anyhow::ensure!(
            self.dev_server.ready_timeout_secs > 0,
            "dev_server.ready_timeout_secs must be positive"
        );
        anyhow::ensure!(
            !self.dependency_dir.trim_matches('/').is_empty(),
            "dependency_dir must not be empty"
        );
        Ok(())
    }
}
