use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
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
    #[serde(default = "default_true")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
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
            show_file_line: default_true(),
            show_thread_ids: default_false(),
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
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "target_link".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// BLE link and protocol settings. Durations are in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkSettings {
    #[serde(default = "default_service_uuid")]
    pub service_uuid: String,
    #[serde(default = "default_write_uuid")]
    pub write_char_uuid: String,
    #[serde(default = "default_notify_uuid")]
    pub notify_char_uuid: String,

    // Discovery
    #[serde(default)]
    pub auto_connect_name: Option<String>,
    #[serde(default = "default_true")]
    pub auto_detect: bool,
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
    #[serde(default)]
    pub last_connected_name: Option<String>,
    #[serde(default = "default_discovery_window_ms")]
    pub discovery_window_ms: u64,
    #[serde(default = "default_auto_detect_interval_ms")]
    pub auto_detect_interval_ms: u64,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    // Framing and writes
    #[serde(default = "default_frame_buffer_cap")]
    pub frame_buffer_cap: usize,
    #[serde(default = "default_write_chunk_size")]
    pub write_chunk_size: usize,
    #[serde(default = "default_write_chunk_delay_ms")]
    pub write_chunk_delay_ms: u64,

    // Image transfer
    #[serde(default = "default_image_chunk_size")]
    pub image_chunk_size: usize,
    #[serde(default = "default_master_poll_interval_ms")]
    pub master_poll_interval_ms: u64,
    #[serde(default = "default_master_resolve_timeout_ms")]
    pub master_resolve_timeout_ms: u64,
    #[serde(default = "default_ready_ack_timeout_ms")]
    pub ready_ack_timeout_ms: u64,
    #[serde(default = "default_ready_settle_ms")]
    pub ready_settle_ms: u64,
    #[serde(default = "default_start_settle_ms")]
    pub start_settle_ms: u64,
    #[serde(default = "default_chunk_pacing_ms")]
    pub chunk_pacing_ms: u64,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            service_uuid: default_service_uuid(),
            write_char_uuid: default_write_uuid(),
            notify_char_uuid: default_notify_uuid(),
            auto_connect_name: None,
            auto_detect: default_true(),
            auto_reconnect: default_true(),
            last_connected_name: None,
            discovery_window_ms: default_discovery_window_ms(),
            auto_detect_interval_ms: default_auto_detect_interval_ms(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            frame_buffer_cap: default_frame_buffer_cap(),
            write_chunk_size: default_write_chunk_size(),
            write_chunk_delay_ms: default_write_chunk_delay_ms(),
            image_chunk_size: default_image_chunk_size(),
            master_poll_interval_ms: default_master_poll_interval_ms(),
            master_resolve_timeout_ms: default_master_resolve_timeout_ms(),
            ready_ack_timeout_ms: default_ready_ack_timeout_ms(),
            ready_settle_ms: default_ready_settle_ms(),
            start_settle_ms: default_start_settle_ms(),
            chunk_pacing_ms: default_chunk_pacing_ms(),
        }
    }
}

fn default_service_uuid() -> String {
    "6e400001-b5a3-f393-e0a9-e50e24dcca9e".to_string()
}
fn default_write_uuid() -> String {
    "6e400002-b5a3-f393-e0a9-e50e24dcca9e".to_string()
}
fn default_notify_uuid() -> String {
    "6e400003-b5a3-f393-e0a9-e50e24dcca9e".to_string()
}
fn default_discovery_window_ms() -> u64 {
    3000
}
fn default_auto_detect_interval_ms() -> u64 {
    10_000
}
fn default_reconnect_delay_ms() -> u64 {
    2000
}
fn default_connect_timeout_ms() -> u64 {
    15_000
}
fn default_frame_buffer_cap() -> usize {
    10 * 1024
}
fn default_write_chunk_size() -> usize {
    100
}
fn default_write_chunk_delay_ms() -> u64 {
    100
}
fn default_image_chunk_size() -> usize {
    128
}
fn default_master_poll_interval_ms() -> u64 {
    100
}
fn default_master_resolve_timeout_ms() -> u64 {
    2000
}
fn default_ready_ack_timeout_ms() -> u64 {
    10_000
}
fn default_ready_settle_ms() -> u64 {
    200
}
fn default_start_settle_ms() -> u64 {
    500
}
fn default_chunk_pacing_ms() -> u64 {
    500
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub log_settings: LogSettings,
    #[serde(default)]
    pub link: LinkSettings,
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

    /// Load from an explicit path, falling back to defaults when the file is
    /// missing or unreadable.
    pub fn load(settings_path: PathBuf) -> Self {
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();
        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("TargetLink");
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

    pub fn remember_peripheral(&mut self, name: &str) -> anyhow::Result<()> {
        if self.settings.link.last_connected_name.as_deref() != Some(name) {
            self.settings.link.last_connected_name = Some(name.to_string());
            self.save()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_fills_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{"link": {"auto_connect_name": "Target-01"}}"#).unwrap();
        assert_eq!(settings.link.auto_connect_name.as_deref(), Some("Target-01"));
        assert_eq!(settings.link.write_chunk_size, 100);
        assert_eq!(settings.link.ready_ack_timeout_ms, 10_000);
        assert_eq!(settings.log_settings.level, "info");
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let path = std::env::temp_dir().join("target_link_missing_settings.json");
        let _ = fs::remove_file(&path);
        let service = SettingsService::load(path);
        assert!(service.get().link.auto_detect);
        assert_eq!(service.get().link.frame_buffer_cap, 10 * 1024);
    }
}
