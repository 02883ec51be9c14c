//! Keepalive and battery reads
//!
//! Some ring firmware drops an idle link. Periodic reads keep it busy; on the
//! battery characteristic they double as a battery monitor. The battery poll
//! runs the same loop on its own, slower interval.

use crate::domain::models::{CharacteristicDescriptor, ServiceDescriptor};
use crate::domain::settings::KeepaliveMode;
use crate::infrastructure::bluetooth::protocol::{
    battery_percent, BATTERY_LEVEL_UUID, HID_CONTROL_POINT_UUID,
};
use crate::infrastructure::bluetooth::transport::GattLink;
use std::sync::atomic::{AtomicI16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

const UNKNOWN_LEVEL: i16 = -1;

/// Last battery level seen on one link.
///
/// Shared by the initial read, battery notifications, the keepalive and the
/// battery poll, so a level is only logged when it changes.
#[derive(Debug)]
pub struct BatteryState {
    last: AtomicI16,
}

impl BatteryState {
    pub fn new() -> Self {
        Self {
            last: AtomicI16::new(UNKNOWN_LEVEL),
        }
    }

    /// Record a raw Battery Level value
    pub fn record(&self, value: &[u8]) -> Option<u8> {
        let level = battery_percent(value)?;
        let previous = self.last.swap(i16::from(level), Ordering::Relaxed);
        if previous != i16::from(level) {
            info!("Battery: {}%", level);
        }
        Some(level)
    }

    pub fn level(&self) -> Option<u8> {
        u8::try_from(self.last.load(Ordering::Relaxed)).ok()
    }
}

impl Default for BatteryState {
    fn default() -> Self {
        Self::new()
    }
}

/// Pick the characteristic to read for `mode`
pub fn keepalive_target(
    services: &[ServiceDescriptor],
    mode: KeepaliveMode,
) -> Option<CharacteristicDescriptor> {
    let readable = || {
        services
            .iter()
            .flat_map(|s| s.characteristics.iter())
            .filter(|c| c.properties.read)
    };

    let battery = readable().find(|c| c.uuid == BATTERY_LEVEL_UUID);
    let first = readable().find(|c| c.uuid != HID_CONTROL_POINT_UUID);

    match mode {
        KeepaliveMode::Battery => battery.or(first),
        KeepaliveMode::FirstReadable => first,
    }
    .cloned()
}

/// Read `target` every `interval` until the handle is aborted.
///
/// Battery Level values go through `battery`; anything else is only counted.
pub fn spawn<L: GattLink + 'static>(
    name: &'static str,
    link: Arc<L>,
    target: CharacteristicDescriptor,
    interval: Duration,
    battery: Arc<BatteryState>,
) -> JoinHandle<()> {
    info!(
        "{}: reading {} every {:.1}s",
        name,
        target.uuid,
        interval.as_secs_f64()
    );
    tokio::spawn(run(name, link, target, interval, battery))
}

async fn run<L: GattLink>(
    name: &'static str,
    link: Arc<L>,
    target: CharacteristicDescriptor,
    interval: Duration,
    battery: Arc<BatteryState>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;
        match link.read(&target).await {
            Ok(value) if target.uuid == BATTERY_LEVEL_UUID => {
                if battery.record(&value).is_none() {
                    debug!("{}: empty battery level read", name);
                }
            }
            Ok(value) => debug!("{}: read {} bytes", name, value.len()),
            Err(e) => warn!("{} read failed: {}", name, e),
        }
    }
}
