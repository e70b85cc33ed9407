use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How often the log file rolls over
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    Minutely,
    Hourly,
    #[default]
    Daily,
    Never,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// `EnvFilter` directive, e.g. `info` or `beatxp_connect=debug`
    pub level: String,
    pub console_logging_enabled: bool,
    pub file_logging_enabled: bool,
    /// Relative paths are resolved under the settings directory
    pub log_dir: String,
    pub file_name_prefix: String,
    pub rotation: LogRotation,
    pub ansi_colors: bool,
    pub show_target: bool,
    pub show_file_line: bool,
    pub show_thread_ids: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            console_logging_enabled: true,
            file_logging_enabled: false,
            log_dir: "logs".to_string(),
            file_name_prefix: "beatxp_connect".to_string(),
            rotation: LogRotation::Daily,
            ansi_colors: true,
            show_target: true,
            show_file_line: false,
            show_thread_ids: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Scan Settings
    #[serde(default = "default_scan_timeout_ms")]
    pub scan_timeout_ms: u64,
    /// Only offer peripherals whose advertised name starts with this
    #[serde(default)]
    pub target_name_prefix: Option<String>,

    // Connection Settings
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
    /// Pause between a completed GATT operation and the next one
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,

    #[serde(default)]
    pub known_addresses: Vec<String>,
    #[serde(default)]
    pub last_connected_address: Option<String>,

    /// Use the in-process simulated band instead of the radio
    #[serde(default)]
    pub simulate: bool,

    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            scan_timeout_ms: default_scan_timeout_ms(),
            target_name_prefix: None,
            connect_timeout_ms: default_connect_timeout_ms(),
            operation_timeout_ms: default_operation_timeout_ms(),
            settle_delay_ms: default_settle_delay_ms(),
            known_addresses: Vec::new(),
            last_connected_address: None,
            simulate: false,
            log_settings: LogSettings::default(),
        }
    }
}

impl Settings {
    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

fn default_scan_timeout_ms() -> u64 {
    10_000
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_operation_timeout_ms() -> u64 {
    5_000
}
fn default_settle_delay_ms() -> u64 {
    500
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::load(settings_path))
    }

    /// Load from an explicit path, falling back to defaults
    pub fn load(settings_path: PathBuf) -> Self {
        let settings = match Self::load_from_file(&settings_path) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::debug!(
                    "Using default settings ({}): {}",
                    settings_path.display(),
                    e
                );
                Settings::default()
            }
        };

        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("BeatXPConnect");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    /// Remember a peripheral we connected to
    pub fn record_connection(&mut self, address: &str) -> anyhow::Result<()> {
        if !self.settings.known_addresses.iter().any(|a| a == address) {
            self.settings.known_addresses.push(address.to_string());
        }
        self.settings.last_connected_address = Some(address.to_string());
        self.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_settings_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "beatxp_settings_{}_{}",
            name,
            std::process::id()
        ));
        fs::create_dir_all(&dir).unwrap();
        dir.join("settings.json")
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let settings: Settings = serde_json::from_str(r#"{ "settle_delay_ms": 0 }"#).unwrap();
        assert_eq!(settings.settle_delay_ms, 0);
        assert_eq!(settings.scan_timeout(), Duration::from_secs(10));
        assert_eq!(settings.operation_timeout(), Duration::from_secs(5));
        assert_eq!(settings.log_settings.level, "info");
        assert!(settings.target_name_prefix.is_none());
    }

    #[test]
    fn test_log_settings_partial_override() {
        let settings: Settings = serde_json::from_str(
            r#"{ "log_settings": { "level": "debug", "rotation": "hourly" } }"#,
        )
        .unwrap();
        assert_eq!(settings.log_settings.level, "debug");
        assert_eq!(settings.log_settings.rotation, LogRotation::Hourly);
        assert!(settings.log_settings.console_logging_enabled);
        assert_eq!(settings.log_settings.file_name_prefix, "beatxp_connect");
    }

    #[test]
    fn test_load_falls_back_on_missing_or_corrupt_file() {
        let path = temp_settings_path("corrupt");
        let _ = fs::remove_file(&path);
        assert_eq!(SettingsService::load(path.clone()).get().settle_delay_ms, 500);

        fs::write(&path, "{ not json").unwrap();
        assert_eq!(SettingsService::load(path.clone()).get().scan_timeout_ms, 10_000);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_record_connection_persists() {
        let path = temp_settings_path("record");
        let _ = fs::remove_file(&path);

        let mut service = SettingsService::load(path.clone());
        service.record_connection("C4:7C:8D:6A:11:02").unwrap();
        service.record_connection("C4:7C:8D:6A:11:02").unwrap();

        let reloaded = SettingsService::load(path.clone());
        assert_eq!(reloaded.get().known_addresses.len(), 1);
        assert_eq!(
            reloaded.get().last_connected_address.as_deref(),
            Some("C4:7C:8D:6A:11:02")
        );
        let _ = fs::remove_file(&path);
    }
}
