//! Command line

use crate::domain::settings::{KeepaliveMode, Settings};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "ring-bridge", version)]
#[command(about = "Bridge a BLE ring's pointer telemetry to OSCQuery")]
pub struct Cli {
    /// Device address (AA:BB:CC:DD:EE:FF) or name substring; defaults to the configured address
    pub device: Option<String>,

    /// Seconds to wait before reconnecting
    #[arg(long, value_name = "SECS")]
    pub reconnect_delay: Option<f64>,

    /// Exit when the ring disconnects
    #[arg(long)]
    pub no_reconnect: bool,

    /// Single attempt: no reconnect and no setup retries
    #[arg(long)]
    pub once: bool,

    /// Seconds between keepalive reads (0 disables)
    #[arg(long, value_name = "SECS")]
    pub keepalive_interval: Option<f64>,

    /// battery | first-readable
    #[arg(long, value_name = "MODE")]
    pub keepalive_mode: Option<KeepaliveMode>,

    /// Seconds between battery level reads (0 disables)
    #[arg(long, value_name = "SECS")]
    pub battery_poll_interval: Option<f64>,

    /// Write the discovered GATT tree to FILE
    #[arg(long, value_name = "FILE")]
    pub gatt_dump: Option<String>,

    /// Log HID reports with byte indices
    #[arg(long)]
    pub report_layout: bool,

    /// Log every notification
    #[arg(long)]
    pub verbose: bool,

    /// OSCQuery HTTP/WebSocket port
    #[arg(long)]
    pub port: Option<u16>,

    /// Persist the merged settings before running
    #[arg(long)]
    pub save_settings: bool,
}

impl Cli {
    /// Command-line values take precedence over file and environment
    pub fn apply(&self, settings: &mut Settings) {
        if let Some(delay) = self.reconnect_delay {
            settings.reconnect_delay_secs = delay;
        }
        if self.no_reconnect {
            settings.reconnect = false;
        }
        if self.once {
            settings.reconnect = false;
            settings.setup_retries = 0;
        }
        if let Some(interval) = self.keepalive_interval {
            settings.keepalive_interval_secs = interval;
        }
        if let Some(mode) = self.keepalive_mode {
            settings.keepalive_mode = mode;
        }
        if let Some(interval) = self.battery_poll_interval {
            settings.battery_poll_interval_secs = interval;
        }
        if let Some(path) = &self.gatt_dump {
            settings.gatt_dump_file = Some(path.clone());
        }
        if self.report_layout {
            settings.report_layout_logging = true;
        }
        if self.verbose {
            settings.notify_verbose = true;
        }
        if let Some(port) = self.port {
            settings.oscquery.http_port = port;
        }
    }
}
