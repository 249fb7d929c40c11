use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_true")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_true(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_target: default_true(),
            ansi_colors: default_true(),
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
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "vitalink".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// Timing knobs for the collection workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionSettings {
    /// Pause between the connected event and service discovery; the radio
    /// stack needs a moment before discovery succeeds reliably.
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    /// Bounded wait for each descriptor-write confirmation while arming
    /// notifications.
    #[serde(default = "default_arming_timeout_secs")]
    pub arming_timeout_secs: u64,
    /// Attempts made while waiting for a session's service list to populate.
    #[serde(default = "default_service_list_tries")]
    pub service_list_tries: u32,
    /// Pause between those attempts.
    #[serde(default = "default_service_list_poll_ms")]
    pub service_list_poll_ms: u64,
}

impl Default for CollectionSettings {
    fn default() -> Self {
        Self {
            settle_delay_ms: default_settle_delay_ms(),
            arming_timeout_secs: default_arming_timeout_secs(),
            service_list_tries: default_service_list_tries(),
            service_list_poll_ms: default_service_list_poll_ms(),
        }
    }
}

fn default_settle_delay_ms() -> u64 {
    1000
}
fn default_arming_timeout_secs() -> u64 {
    10
}
fn default_service_list_tries() -> u32 {
    15
}
fn default_service_list_poll_ms() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    /// Newline-separated name prefixes of weight scales to collect from.
    #[serde(default)]
    pub weight_device_names: String,
    /// Newline-separated name prefixes of glucose meters to collect from.
    #[serde(default)]
    pub glucose_device_names: String,

    #[serde(default)]
    pub collection: CollectionSettings,

    #[serde(default)]
    pub log_settings: LogSettings,
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::settings_path()?;
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();

        Ok(Self {
            settings,
            settings_path,
        })
    }

    fn settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("vitalink");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &PathBuf) -> anyhow::Result<Settings> {
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

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }
}
