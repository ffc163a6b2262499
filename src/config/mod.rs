//! Configuration and credential storage

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

const DEFAULT_BASE_URL: &str = "https://api.shopchat.io";
const DEFAULT_PUSH_URL: &str = "wss://push.shopchat.io/live";

/// Application configuration
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// API endpoint override (defaults to the hosted service)
    pub base_url: Option<String>,
    /// Push endpoint override
    pub push_url: Option<String>,
    /// API token issued by the platform (issuance is external to this tool)
    pub api_token: Option<String>,
    /// Stable user id, used to tell own messages from the counterpart's
    pub user_id: Option<String>,
    /// Display name attached to optimistic sends
    pub user_name: Option<String>,
    /// Device id identifying this client on the push channel
    pub device_id: Option<String>,
}

impl Config {
    /// Get config directory path
    fn config_dir() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "shopchat-cli", "shopchat-cli")
            .context("Could not determine config directory")?;
        Ok(proj_dirs.config_dir().to_path_buf())
    }

    /// Get config file path
    fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from disk
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;

        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        toml::from_str(&content).context("Failed to parse config file")
    }

    /// Save configuration to disk
    pub fn save(&self) -> Result<()> {
        let dir = Self::config_dir()?;
        fs::create_dir_all(&dir).context("Failed to create config directory")?;

        let path = Self::config_path()?;
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(&path, content).context("Failed to write config file")?;

        // Set restrictive permissions on config file (contains the token)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(&path, perms).context("Failed to set config permissions")?;
        }

        Ok(())
    }

    /// API base URL, falling back to the hosted service.
    pub fn base_url(&self) -> String {
        self.base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
    }

    /// Push endpoint URL, falling back to the hosted service.
    pub fn push_url(&self) -> String {
        self.push_url
            .clone()
            .unwrap_or_else(|| DEFAULT_PUSH_URL.to_string())
    }

    /// Stable user id; required for unread/ownership bookkeeping.
    pub fn user_id(&self) -> Result<String> {
        self.user_id
            .clone()
            .context("No user id stored. Run 'shopchat-cli login' first.")
    }

    /// Display name for optimistic sends.
    pub fn user_name(&self) -> String {
        self.user_name.clone().unwrap_or_else(|| "Me".to_string())
    }

    /// Drop credentials while keeping endpoint overrides.
    pub fn clear_credentials(&mut self) {
        self.api_token = None;
        self.user_id = None;
        self.user_name = None;
        self.device_id = None;
    }
}
