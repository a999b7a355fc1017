use crate::domain::models::DeviceAddress;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_false(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    std::env::temp_dir()
        .join("idasen-control-logs")
        .to_string_lossy()
        .into_owned()
}
fn default_prefix() -> String {
    "idasen-control".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
    #[serde(default = "default_pid_file_path")]
    pub pid_file_path: PathBuf,

    // Sitting time tracking
    #[serde(default = "default_stand_threshold")]
    pub stand_threshold: f64,
    #[serde(default = "default_sitting_break_time")]
    pub sitting_break_time: u64,

    // Desk
    #[serde(default)]
    pub desk_address: Option<DeviceAddress>,
    #[serde(default = "default_desk_max_position")]
    pub desk_max_position: f64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: f64,

    #[serde(default)]
    pub log: LogSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            pid_file_path: default_pid_file_path(),
            stand_threshold: default_stand_threshold(),
            sitting_break_time: default_sitting_break_time(),
            desk_address: None,
            desk_max_position: default_desk_max_position(),
            connect_timeout: default_connect_timeout(),
            log: LogSettings::default(),
        }
    }
}

impl Config {
    pub fn connect_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.connect_timeout).unwrap_or(Duration::from_secs(5))
    }

    pub fn sitting_break(&self) -> Duration {
        Duration::from_secs(self.sitting_break_time)
    }
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/tmp/idasen-control.sock")
}
fn default_pid_file_path() -> PathBuf {
    PathBuf::from("/tmp/idasen-control.pid")
}
fn default_stand_threshold() -> f64 {
    30.0
}
fn default_sitting_break_time() -> u64 {
    2 * 60
}
fn default_desk_max_position() -> f64 {
    58.0
}
fn default_connect_timeout() -> f64 {
    5.0
}

/// Loads and persists [`Config`] as JSON in the user's home directory.
pub struct ConfigService {
    config: Config,
    config_path: PathBuf,
}

impl ConfigService {
    pub fn new() -> anyhow::Result<Self> {
        let config_path = Self::get_config_path()?;
        Ok(Self::from_path(config_path))
    }

    /// Unreadable or malformed files fall back to defaults.
    pub fn from_path(config_path: PathBuf) -> Self {
        let config = match Self::load_from_file(&config_path) {
            Ok(config) => config,
            Err(e) => {
                tracing::debug!(path = %config_path.display(), "using default config: {}", e);
                Config::default()
            }
        };

        Self {
            config,
            config_path,
        }
    }

    fn get_config_path() -> anyhow::Result<PathBuf> {
        let mut path =
            dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Could not determine home directory"))?;
        path.push(".idasen-control.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Config> {
        let contents = fs::read_to_string(path)?;
        let config = serde_json::from_str(&contents)?;
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.config)?;
        fs::write(&self.config_path, json)?;
        Ok(())
    }

    pub fn get(&self) -> &Config {
        &self.config
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }

    pub fn set_desk_address(&mut self, address: DeviceAddress) -> anyhow::Result<()> {
        self.config.desk_address = Some(address);
        self.save()
    }
}
