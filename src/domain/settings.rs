use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

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
    #[serde(default = "default_false")]
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
            show_file_line: default_false(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

/// Which characteristic the keepalive task reads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeepaliveMode {
    /// Battery Level, falling back to the first readable characteristic
    Battery,
    /// First readable characteristic that is not the HID Control Point
    FirstReadable,
}

impl FromStr for KeepaliveMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "battery" => Ok(Self::Battery),
            "first-readable" | "read-report" | "vendor" => Ok(Self::FirstReadable),
            other => Err(format!("unknown keepalive mode: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OscQuerySettings {
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

impl Default for OscQuerySettings {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            bind_address: default_bind_address(),
            http_port: default_http_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Device selection
    #[serde(default = "default_device_address")]
    pub default_device_address: String,
    #[serde(default = "default_scan_timeout_secs")]
    pub scan_timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_discovery_timeout_secs")]
    pub discovery_timeout_secs: u64,

    // Advanced BLE Settings
    #[serde(default = "default_vendor_service_uuid")]
    pub vendor_service_uuid: String,
    #[serde(default = "default_vendor_notify_uuid")]
    pub vendor_notify_char_uuid: String,

    // Reconnection
    #[serde(default = "default_true")]
    pub reconnect: bool,
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: f64,
    #[serde(default)]
    pub setup_retries: u32,

    // Keepalive
    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: f64,
    #[serde(default = "default_keepalive_mode")]
    pub keepalive_mode: KeepaliveMode,
    #[serde(default = "default_battery_poll_interval_secs")]
    pub battery_poll_interval_secs: f64,

    // Debug Settings
    #[serde(default)]
    pub gatt_dump_file: Option<String>,
    #[serde(default = "default_false")]
    pub report_layout_logging: bool,
    #[serde(default = "default_false")]
    pub notify_verbose: bool,

    #[serde(default)]
    pub oscquery: OscQuerySettings,

    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_device_address: default_device_address(),
            scan_timeout_secs: default_scan_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            discovery_timeout_secs: default_discovery_timeout_secs(),
            vendor_service_uuid: default_vendor_service_uuid(),
            vendor_notify_char_uuid: default_vendor_notify_uuid(),
            reconnect: default_true(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
            setup_retries: 0,
            keepalive_interval_secs: default_keepalive_interval_secs(),
            keepalive_mode: default_keepalive_mode(),
            battery_poll_interval_secs: default_battery_poll_interval_secs(),
            gatt_dump_file: None,
            report_layout_logging: default_false(),
            notify_verbose: default_false(),
            oscquery: OscQuerySettings::default(),
            log_settings: LogSettings::default(),
        }
    }
}

impl Settings {
    /// Apply `RING_BLE_*` / `RING_OSCQUERY_*` overrides.
    ///
    /// `lookup` is `std::env::var` in production. Values that fail to parse
    /// are skipped and reported in the returned list, so they can be logged
    /// once the subscriber is installed.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Vec<String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut ignored = Vec::new();
        if let Some(v) = parse_var(&lookup, "RING_BLE_RECONNECT_DELAY", &mut ignored) {
            self.reconnect_delay_secs = v;
        }
        if let Some(v) = parse_var(&lookup, "RING_BLE_KEEPALIVE_INTERVAL", &mut ignored) {
            self.keepalive_interval_secs = v;
        }
        if let Some(v) = parse_var(&lookup, "RING_BLE_KEEPALIVE_MODE", &mut ignored) {
            self.keepalive_mode = v;
        }
        if let Some(v) = parse_var(&lookup, "RING_BLE_BATTERY_POLL_INTERVAL", &mut ignored) {
            self.battery_poll_interval_secs = v;
        }
        if let Some(path) = lookup("RING_BLE_GATT_DUMP_FILE") {
            if !path.is_empty() {
                self.gatt_dump_file = Some(path);
            }
        }
        if let Some(v) = lookup("RING_BLE_REPORT_LAYOUT") {
            self.report_layout_logging = is_truthy(&v);
        }
        if let Some(v) = lookup("RING_BLE_NOTIFY_VERBOSE") {
            self.notify_verbose = is_truthy(&v);
        }
        if let Some(v) = parse_var(&lookup, "RING_OSCQUERY_PORT", &mut ignored) {
            self.oscquery.http_port = v;
        }
        ignored
    }
}

impl Settings {
    pub fn reconnect_delay(&self) -> Duration {
        secs_to_duration(self.reconnect_delay_secs)
    }

    /// `None` when keepalive is disabled (interval of zero)
    pub fn keepalive_interval(&self) -> Option<Duration> {
        Some(secs_to_duration(self.keepalive_interval_secs)).filter(|d| !d.is_zero())
    }

    /// `None` when the battery poll is disabled
    pub fn battery_poll_interval(&self) -> Option<Duration> {
        Some(secs_to_duration(self.battery_poll_interval_secs)).filter(|d| !d.is_zero())
    }
}

/// Negative or non-finite values clamp to zero
fn secs_to_duration(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::ZERO)
}

fn parse_var<F, T>(lookup: &F, key: &str, ignored: &mut Vec<String>) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            ignored.push(format!("Ignoring {}={:?}: not a valid value", key, raw));
            None
        }
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "1" | "true" | "yes")
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
    "ring_bridge".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}
fn default_device_address() -> String {
    "B0:B3:53:EB:40:8D".to_string()
}
fn default_scan_timeout_secs() -> u64 {
    10
}
fn default_connect_timeout_secs() -> u64 {
    20
}
fn default_discovery_timeout_secs() -> u64 {
    15
}
fn default_vendor_service_uuid() -> String {
    "0000ae40-0000-1000-8000-00805f9b34fb".to_string()
}
fn default_vendor_notify_uuid() -> String {
    "0000ae42-0000-1000-8000-00805f9b34fb".to_string()
}
fn default_reconnect_delay_secs() -> f64 {
    3.0
}
fn default_keepalive_interval_secs() -> f64 {
    5.0
}
fn default_keepalive_mode() -> KeepaliveMode {
    KeepaliveMode::Battery
}
fn default_battery_poll_interval_secs() -> f64 {
    60.0
}
fn default_service_name() -> String {
    "RayNeo-X2-Ring".to_string()
}
fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}
fn default_http_port() -> u16 {
    9020
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
    load_error: Option<String>,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::with_path(settings_path))
    }

    /// Load from an explicit file, defaulting when it is missing or invalid
    pub fn with_path(settings_path: PathBuf) -> Self {
        let (settings, load_error) = match Self::load_from_file(&settings_path) {
            Ok(settings) => (settings, None),
            // A missing file is the normal first run
            Err(_) if !settings_path.exists() => (Settings::default(), None),
            Err(e) => (
                Settings::default(),
                Some(format!(
                    "Could not load {}: {}. Using defaults.",
                    settings_path.display(),
                    e
                )),
            ),
        };

        Self {
            settings,
            settings_path,
            load_error,
        }
    }

    /// Why the settings file was ignored, if it was
    pub fn load_error(&self) -> Option<&str> {
        self.load_error.as_deref()
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("RingBridge");
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.settings_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }
}
