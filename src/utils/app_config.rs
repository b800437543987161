/// Application configuration management
/// Stores settings in ~/.config/mc-orchestra/config.toml, overridable from the environment

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::utils::constants::*;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    /// Root holding `servers/` and `backups/`
    pub data_dir: PathBuf,
    pub network: String,
    pub image: String,
    /// Unix socket of the Docker daemon; local defaults when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docker_socket: Option<String>,
    pub workers: usize,
    pub game_port: u16,
    pub console_port: u16,
    pub console_timeout_secs: u64,
    /// Upper bound on a single console command round trip
    pub command_timeout_secs: u64,
    pub stop_timeout_secs: u64,
    pub delete_stop_timeout_secs: u64,
    /// Wait after `save-all flush` before archiving
    pub flush_delay_ms: u64,
    pub metrics_interval_secs: u64,
    pub metrics_capacity: usize,
    pub metrics_retention_secs: u64,
    pub log_level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            network: DEFAULT_NETWORK.to_string(),
            image: DEFAULT_IMAGE.to_string(),
            docker_socket: None,
            workers: DEFAULT_WORKERS,
            game_port: GAME_PORT,
            console_port: CONSOLE_PORT,
            console_timeout_secs: 10,
            command_timeout_secs: 10,
            stop_timeout_secs: 30,
            delete_stop_timeout_secs: 10,
            flush_delay_ms: 2000,
            metrics_interval_secs: DEFAULT_METRICS_INTERVAL_SECS,
            metrics_capacity: DEFAULT_METRICS_CAPACITY,
            metrics_retention_secs: DEFAULT_METRICS_RETENTION_SECS,
            log_level: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// Get config file path
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join("mc-orchestra");

        // Create directory if it doesn't exist
        fs::create_dir_all(&config_dir)
            .context("Failed to create config directory")?;

        Ok(config_dir.join("config.toml"))
    }

    /// Load configuration from `path` (or the default location), then apply environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_path()?,
        };

        let mut config = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            Self::parse(&contents)?
        } else {
            Self::default()
        };

        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        toml::from_str(contents).context("Failed to parse config file")
    }

    /// Apply `MC_DATA_DIR`, `MC_SERVER_NETWORK`, `DOCKER_SOCKET` and `LOG_LEVEL`
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("MC_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(network) = lookup("MC_SERVER_NETWORK") {
            self.network = network;
        }
        if let Some(socket) = lookup("DOCKER_SOCKET") {
            self.docker_socket = Some(socket);
        }
        if let Some(level) = lookup("LOG_LEVEL") {
            self.log_level = level;
        }
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        fs::write(path, self.to_toml()?)
            .context("Failed to write config file")?;

        Ok(())
    }

    pub fn servers_dir(&self) -> PathBuf {
        self.data_dir.join("servers")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.data_dir.join("backups")
    }

    pub fn registry_path(&self) -> PathBuf {
        self.data_dir.join("instances.toml")
    }

    pub fn console_timeout(&self) -> Duration {
        Duration::from_secs(self.console_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn flush_delay(&self) -> Duration {
        Duration::from_millis(self.flush_delay_ms)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_interval_secs)
    }

    pub fn metrics_retention(&self) -> Duration {
        Duration::from_secs(self.metrics_retention_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = AppConfig::parse("network = \"mc-test\"\nworkers = 2\n").unwrap();

        assert_eq!(config.network, "mc-test");
        assert_eq!(config.workers, 2);
        assert_eq!(config.console_port, CONSOLE_PORT);
        assert_eq!(config.metrics_capacity, 720);
        assert_eq!(config.flush_delay(), Duration::from_secs(2));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = AppConfig::default();
        config.apply_env(|key| match key {
            "MC_DATA_DIR" => Some("/srv/mc".to_string()),
            "MC_SERVER_NETWORK" => Some("mc-prod".to_string()),
            _ => None,
        });

        assert_eq!(config.servers_dir(), PathBuf::from("/srv/mc/servers"));
        assert_eq!(config.backups_dir(), PathBuf::from("/srv/mc/backups"));
        assert_eq!(config.network, "mc-prod");
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_load_and_save_round_trip() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "data_dir = \"/tmp/mc\"").unwrap();
        writeln!(file, "flush_delay_ms = 0").unwrap();

        let config = AppConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.flush_delay(), Duration::ZERO);

        config.save(file.path()).unwrap();
        let reloaded = AppConfig::parse(&fs::read_to_string(file.path()).unwrap()).unwrap();
        assert_eq!(reloaded.flush_delay_ms, 0);
        assert_eq!(reloaded.image, DEFAULT_IMAGE);
    }

    #[test]
    fn test_save_creates_parent_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("mc-orchestra/config.toml");

        AppConfig::default().save(&path).unwrap();
        let written = fs::read_to_string(&path).unwrap();
        assert_eq!(written, AppConfig::default().to_toml().unwrap());
        assert_eq!(AppConfig::parse(&written).unwrap(), AppConfig::default());
    }
}
