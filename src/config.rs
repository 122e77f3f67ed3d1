//! Configuration management for riftcast Agent

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// League client discovery configuration
    #[serde(default)]
    pub lcu: LcuConfig,

    /// OBS WebSocket configuration
    #[serde(default)]
    pub obs: ObsConfig,

    /// Recording configuration
    #[serde(default)]
    pub recording: RecordingConfig,

    /// Path to config file (not serialized)
    #[serde(skip)]
    config_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LcuConfig {
    /// Executable names the credential monitor looks for
    #[serde(default = "default_process_names")]
    pub process_names: Vec<String>,

    /// Poll interval while the client is undiscovered (seconds)
    #[serde(default = "default_discovery_interval")]
    pub discovery_interval_secs: u64,

    /// Poll interval once the client has been discovered (seconds)
    #[serde(default = "default_rediscovery_interval")]
    pub rediscovery_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObsConfig {
    /// OBS WebSocket host
    #[serde(default = "default_obs_host")]
    pub host: String,

    /// OBS WebSocket port
    #[serde(default = "default_obs_port")]
    pub port: u16,

    /// OBS WebSocket password (optional)
    pub password: Option<String>,

    /// Whether to connect to OBS automatically on launch
    #[serde(default)]
    pub auto_connect: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingConfig {
    /// OBS profile selected for match recordings
    #[serde(default = "default_recording_profile")]
    pub profile: String,
}

// Default value functions
fn default_process_names() -> Vec<String> {
    vec![
        "LeagueClientUx.exe".to_string(),
        "LeagueClient.exe".to_string(),
    ]
}

fn default_discovery_interval() -> u64 {
    5
}

fn default_rediscovery_interval() -> u64 {
    30
}

fn default_obs_host() -> String {
    "localhost".to_string()
}

fn default_obs_port() -> u16 {
    4455
}

fn default_recording_profile() -> String {
    "League of Legends".to_string()
}

impl Default for LcuConfig {
    fn default() -> Self {
        Self {
            process_names: default_process_names(),
            discovery_interval_secs: default_discovery_interval(),
            rediscovery_interval_secs: default_rediscovery_interval(),
        }
    }
}

impl Default for ObsConfig {
    fn default() -> Self {
        Self {
            host: default_obs_host(),
            port: default_obs_port(),
            password: None,
            auto_connect: false,
        }
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            profile: default_recording_profile(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            lcu: LcuConfig::default(),
            obs: ObsConfig::default(),
            recording: RecordingConfig::default(),
            config_path: None,
        }
    }
}

impl Config {
    /// Load configuration from default location or create default
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

            let mut config: Config = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {:?}", config_path))?;

            config.config_path = Some(config_path);
            Ok(config)
        } else {
            // Create default config
            let mut config = Config::default();
            config.config_path = Some(config_path);
            config.save()?;
            Ok(config)
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let config_path = match self.config_path.clone() {
            Some(path) => path,
            None => Self::default_config_path()?,
        };

        // Ensure parent directory exists
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(&config_path, contents)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;

        Ok(())
    }

    /// Get the config file path
    pub fn config_path(&self) -> Result<PathBuf> {
        match self.config_path.clone() {
            Some(path) => Ok(path),
            None => Self::default_config_path(),
        }
    }

    /// Get default config path
    fn default_config_path() -> Result<PathBuf> {
        let proj_dirs = directories::ProjectDirs::from("dev", "riftcast", "agent")
            .context("Failed to determine config directory")?;

        Ok(proj_dirs.config_dir().join("config.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_both_client_executables() {
        let config = Config::default();
        assert_eq!(
            config.lcu.process_names,
            vec!["LeagueClientUx.exe", "LeagueClient.exe"]
        );
        assert_eq!(config.lcu.discovery_interval_secs, 5);
        assert_eq!(config.lcu.rediscovery_interval_secs, 30);
    }

    #[test]
    fn partial_config_fills_in_defaults() {
        let config: Config = toml::from_str(
            r#"
            [obs]
            host = "192.168.1.20"
            password = "secret"
            "#,
        )
        .unwrap();
        assert_eq!(config.obs.host, "192.168.1.20");
        assert_eq!(config.obs.port, 4455);
        assert_eq!(config.obs.password.as_deref(), Some("secret"));
        assert!(!config.obs.auto_connect);
        assert_eq!(config.recording.profile, "League of Legends");
    }
}
