use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    Minutely,
    Hourly,
    #[default]
    Daily,
    Never,
}

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
    #[serde(default)]
    pub rotation: LogRotation,
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
            rotation: LogRotation::default(),
        }
    }
}

/// Timing and matching parameters for the BLE core. All durations in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BleSettings {
    #[serde(default = "default_mtu")]
    pub mtu: u16,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_broad_scan_ms")]
    pub broad_scan_ms: u64,
    #[serde(default = "default_filtered_scan_ms")]
    pub filtered_scan_ms: u64,
    #[serde(default = "default_bond_timeout_ms")]
    pub bond_timeout_ms: u64,
    #[serde(default = "default_request_expiry_ms")]
    pub request_expiry_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_ladder_budget_ms")]
    pub ladder_budget_ms: u64,
    #[serde(default = "default_write_attempts")]
    pub write_attempts: u32,
    /// Substring identifying this device family in advertisement names
    #[serde(default = "default_name_keyword")]
    pub name_keyword: String,
}

impl Default for BleSettings {
    fn default() -> Self {
        Self {
            mtu: default_mtu(),
            connect_timeout_ms: default_connect_timeout_ms(),
            broad_scan_ms: default_broad_scan_ms(),
            filtered_scan_ms: default_filtered_scan_ms(),
            bond_timeout_ms: default_bond_timeout_ms(),
            request_expiry_ms: default_request_expiry_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            ladder_budget_ms: default_ladder_budget_ms(),
            write_attempts: default_write_attempts(),
            name_keyword: default_name_keyword(),
        }
    }
}

impl BleSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn broad_scan_window(&self) -> Duration {
        Duration::from_millis(self.broad_scan_ms)
    }

    pub fn filtered_scan_window(&self) -> Duration {
        Duration::from_millis(self.filtered_scan_ms)
    }

    pub fn bond_timeout(&self) -> Duration {
        Duration::from_millis(self.bond_timeout_ms)
    }

    pub fn request_expiry(&self) -> Duration {
        Duration::from_millis(self.request_expiry_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn ladder_budget(&self) -> Duration {
        Duration::from_millis(self.ladder_budget_ms)
    }
}

/// How a peripheral was recognised the last time it connected
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BondRecord {
    #[serde(default)]
    pub known_via_service: bool,
    #[serde(default)]
    pub known_via_manufacturer_data: bool,
}

/// Reconnection hints learned from earlier successful connections
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BondHints {
    #[serde(default)]
    pub records: HashMap<String, BondRecord>,
    #[serde(default)]
    pub last_successful_address: Option<String>,
    /// Manufacturer company ids seen on devices that connected successfully
    #[serde(default)]
    pub manufacturer_ids: Vec<u16>,
}

impl BondHints {
    pub fn is_known(&self, address: &str) -> bool {
        self.records
            .get(address)
            .map(|r| r.known_via_service || r.known_via_manufacturer_data)
            .unwrap_or(false)
    }

    pub fn record_success(
        &mut self,
        address: &str,
        via_service: bool,
        manufacturer_id: Option<u16>,
    ) {
        let record = self.records.entry(address.to_string()).or_default();
        record.known_via_service |= via_service;
        if let Some(id) = manufacturer_id {
            record.known_via_manufacturer_data = true;
            if !self.manufacturer_ids.contains(&id) {
                self.manufacturer_ids.push(id);
            }
        }
        self.last_successful_address = Some(address.to_string());
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub log_settings: LogSettings,
    #[serde(default)]
    pub ble: BleSettings,
    #[serde(default)]
    pub bond_hints: BondHints,
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
    "dual_display_link".to_string()
}
fn default_mtu() -> u16 {
    251
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_broad_scan_ms() -> u64 {
    7_000
}
fn default_filtered_scan_ms() -> u64 {
    8_000
}
fn default_bond_timeout_ms() -> u64 {
    20_000
}
fn default_request_expiry_ms() -> u64 {
    5_000
}
fn default_heartbeat_interval_ms() -> u64 {
    10_000
}
fn default_ladder_budget_ms() -> u64 {
    60_000
}
fn default_write_attempts() -> u32 {
    3
}
fn default_name_keyword() -> String {
    "G1".to_string()
}

/// A copy of the settings waiting to be written
#[derive(Debug)]
pub struct PendingSave {
    path: PathBuf,
    settings: Settings,
}

impl PendingSave {
    pub fn write(self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.path, json)?;
        Ok(())
    }
}

pub struct SettingsService {
    settings: Settings,
    /// `None` keeps everything in memory
    settings_path: Option<PathBuf>,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();

        Ok(Self {
            settings,
            settings_path: Some(settings_path),
        })
    }

    pub fn in_memory(settings: Settings) -> Self {
        Self {
            settings,
            settings_path: None,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("DualDisplayLink");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &PathBuf) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    /// Snapshot for writing without holding on to the service. `None` when
    /// nothing is persisted.
    pub fn pending_save(&self) -> Option<PendingSave> {
        let path = self.settings_path.clone()?;
        Some(PendingSave {
            path,
            settings: self.settings.clone(),
        })
    }

    pub fn save(&self) -> anyhow::Result<()> {
        match self.pending_save() {
            Some(pending) => pending.write(),
            None => Ok(()),
        }
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    /// Update the bond hints in memory; persist with [`Self::pending_save`]
    pub fn record_successful_connection(
        &mut self,
        address: &str,
        via_service: bool,
        manufacturer_id: Option<u16>,
    ) {
        self.settings
            .bond_hints
            .record_success(address, via_service, manufacturer_id);
    }
}
