//! BLE Connection Module
//!
//! One GATT session: connect, discover, subscribe, then stream decoded
//! samples into a [`TelemetrySink`] until cancelled or the link drops.
//!
//! A session is single-use. Reconnecting means building a new one.

use crate::domain::error::BridgeError;
use crate::domain::models::{
    CharacteristicDescriptor, DisconnectReason, NotificationPayload, PeripheralHandle,
    ServiceDescriptor, SessionState, TelemetrySample,
};
use crate::domain::settings::{KeepaliveMode, Settings};
use crate::infrastructure::bluetooth::keepalive::{self, BatteryState};
use crate::infrastructure::bluetooth::protocol::{
    self, ProtocolIds, ProtocolTag, BATTERY_LEVEL_UUID, BATTERY_SERVICE_UUID,
    HID_CONTROL_POINT_EXIT_SUSPEND, HID_CONTROL_POINT_UUID, HID_INFORMATION_UUID,
    HID_REPORT_MAP_UUID, HID_REPORT_UUID, HID_SERVICE_UUID,
};
use crate::infrastructure::bluetooth::transport::{BleTransport, GattLink, LinkEvent};
use crate::infrastructure::shutdown::Shutdown;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use std::future::Future;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Upper bound on releasing the link, so cancellation always finishes
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound on a single subscribe, read or write
const GATT_IO_TIMEOUT: Duration = Duration::from_secs(10);

/// Receives every decoded sample, in receive order.
///
/// Called inline on the delivery path; implementations must not block.
pub trait TelemetrySink: Send + Sync {
    fn publish(&self, sample: &TelemetrySample);
}

/// Configuration for one session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub ids: ProtocolIds,
    pub connect_timeout: Duration,
    pub discovery_timeout: Duration,
    pub io_timeout: Duration,
    /// `None` disables keepalive reads
    pub keepalive_interval: Option<Duration>,
    pub keepalive_mode: KeepaliveMode,
    pub battery_poll_interval: Option<Duration>,
    pub gatt_dump_file: Option<PathBuf>,
    pub report_layout_logging: bool,
    pub notify_verbose: bool,
}

impl SessionConfig {
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        Ok(Self {
            ids: ProtocolIds::from_settings(settings)?,
            connect_timeout: Duration::from_secs(settings.connect_timeout_secs),
            discovery_timeout: Duration::from_secs(settings.discovery_timeout_secs),
            io_timeout: GATT_IO_TIMEOUT,
            keepalive_interval: settings.keepalive_interval(),
            keepalive_mode: settings.keepalive_mode,
            battery_poll_interval: settings.battery_poll_interval(),
            gatt_dump_file: settings.gatt_dump_file.as_ref().map(PathBuf::from),
            report_layout_logging: settings.report_layout_logging,
            notify_verbose: settings.notify_verbose,
        })
    }
}

/// Pick the characteristic to stream from.
///
/// The vendor notify characteristic wins over the HID Report; either must be
/// notifiable and live in its own service.
pub fn select_data_characteristic(
    services: &[ServiceDescriptor],
    ids: &ProtocolIds,
) -> Result<(CharacteristicDescriptor, ProtocolTag), BridgeError> {
    let candidates = [
        (ids.vendor_service, ids.vendor_notify, ProtocolTag::VendorRing),
        (HID_SERVICE_UUID, HID_REPORT_UUID, ProtocolTag::HidReport),
    ];

    for (service_uuid, char_uuid, tag) in candidates {
        let found = services
            .iter()
            .filter(|s| s.uuid == service_uuid)
            .flat_map(|s| s.characteristics.iter())
            .find(|c| c.uuid == char_uuid && c.properties.is_notifiable());
        if let Some(characteristic) = found {
            return Ok((characteristic.clone(), tag));
        }
    }

    Err(BridgeError::ServiceNotFound(format!(
        "no notifiable characteristic in vendor service {} or HID service {}",
        ids.vendor_service, HID_SERVICE_UUID
    )))
}

fn find_characteristic(
    services: &[ServiceDescriptor],
    uuid: Uuid,
) -> Option<&CharacteristicDescriptor> {
    services
        .iter()
        .flat_map(|s| s.characteristics.iter())
        .find(|c| c.uuid == uuid)
}

/// Battery Level inside the Battery service
fn battery_level(services: &[ServiceDescriptor]) -> Option<&CharacteristicDescriptor> {
    services
        .iter()
        .filter(|s| s.uuid == BATTERY_SERVICE_UUID)
        .flat_map(|s| s.characteristics.iter())
        .find(|c| c.uuid == BATTERY_LEVEL_UUID)
}

/// Outcome of one link operation raced against cancellation and a deadline
enum Step<T> {
    Done(T),
    TimedOut,
    Cancelled,
}

async fn step<T>(shutdown: &mut Shutdown, limit: Duration, op: impl Future<Output = T>) -> Step<T> {
    tokio::select! {
        _ = shutdown.cancelled() => Step::Cancelled,
        result = tokio::time::timeout(limit, op) => match result {
            Ok(value) => Step::Done(value),
            Err(_) => Step::TimedOut,
        },
    }
}

/// Human-readable GATT tree
pub fn format_gatt_tree(device: &PeripheralHandle, services: &[ServiceDescriptor]) -> String {
    let mut out = format!("GATT database of {}\n", device);
    for service in services {
        let kind = if service.primary { "primary" } else { "secondary" };
        out.push_str(&format!("Service {} ({})\n", service.uuid, kind));
        for c in &service.characteristics {
            out.push_str(&format!("  Characteristic {} [{}]\n", c.uuid, c.properties));
            for d in &c.descriptors {
                out.push_str(&format!("    Descriptor {}\n", d));
            }
        }
    }
    out
}

async fn write_gatt_dump(path: &Path, device: &PeripheralHandle, services: &[ServiceDescriptor]) {
    match tokio::fs::write(path, format_gatt_tree(device, services)).await {
        Ok(()) => info!("GATT dump written to {}", path.display()),
        Err(e) => warn!("Failed to write GATT dump to {}: {}", path.display(), e),
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// `[index]=byte` pairs, for working out report layouts
fn indexed(bytes: &[u8]) -> String {
    bytes
        .iter()
        .enumerate()
        .map(|(i, b)| format!("[{}]={:02X}", i, b))
        .collect::<Vec<_>>()
        .join(" ")
}

pub struct GattSession {
    config: SessionConfig,
    state: SessionState,
    status: Arc<watch::Sender<SessionState>>,
    sequence: u64,
}

impl GattSession {
    /// State changes are published on `status`
    pub fn new(config: SessionConfig, status: Arc<watch::Sender<SessionState>>) -> Self {
        status.send_replace(SessionState::Idle);
        Self {
            config,
            state: SessionState::Idle,
            status,
            sequence: 0,
        }
    }

    fn transition(&mut self, next: SessionState) {
        if !self.state.can_transition_to(next) {
            warn!("Ignoring session transition {} -> {}", self.state, next);
            return;
        }
        debug!("Session: {} -> {}", self.state, next);
        self.state = next;
        self.status.send_replace(next);
    }

    /// Run the session to completion.
    ///
    /// Cancellation at any stage is `Ok(UserCancelled)`. Setup failures are
    /// errors; once streaming, the session ends with a reason.
    pub async fn run<T: BleTransport>(
        mut self,
        transport: &T,
        device: &PeripheralHandle,
        sink: &dyn TelemetrySink,
        shutdown: &mut Shutdown,
    ) -> Result<DisconnectReason, BridgeError> {
        self.transition(SessionState::Connecting);
        info!("Connecting to {}...", device);

        let connect_timeout = self.config.connect_timeout;
        let connected = match step(shutdown, connect_timeout, transport.connect(device)).await {
            Step::Done(Ok(link)) => Ok(Arc::new(link)),
            Step::Done(Err(e)) => Err(BridgeError::Connection(e.to_string())),
            Step::TimedOut => Err(BridgeError::Connection(format!(
                "timed out after {}s",
                connect_timeout.as_secs()
            ))),
            Step::Cancelled => {
                self.transition(SessionState::Disconnected(DisconnectReason::UserCancelled));
                return Ok(DisconnectReason::UserCancelled);
            }
        };

        let link = match connected {
            Ok(link) => link,
            Err(e) => {
                self.transition(SessionState::Disconnected(DisconnectReason::TransportError));
                return Err(e);
            }
        };
        info!("Connected to {}", device);

        let outcome = self.drive(&link, device, sink, shutdown).await;

        match tokio::time::timeout(DISCONNECT_TIMEOUT, link.disconnect()).await {
            Ok(Ok(())) => info!("Disconnected from {}", device),
            Ok(Err(e)) => warn!("Disconnect from {} failed: {}", device, e),
            Err(_) => warn!("Disconnect from {} timed out", device),
        }

        let reason = match &outcome {
            Ok(reason) => *reason,
            Err(_) => DisconnectReason::TransportError,
        };
        self.transition(SessionState::Disconnected(reason));
        outcome
    }

    async fn drive<L: GattLink + 'static>(
        &mut self,
        link: &Arc<L>,
        device: &PeripheralHandle,
        sink: &dyn TelemetrySink,
        shutdown: &mut Shutdown,
    ) -> Result<DisconnectReason, BridgeError> {
        self.transition(SessionState::Discovering);

        let discovery_timeout = self.config.discovery_timeout;
        let services = match step(shutdown, discovery_timeout, link.discover()).await {
            Step::Done(Ok(services)) => services,
            Step::Done(Err(e)) => return Err(BridgeError::ServiceNotFound(e.to_string())),
            Step::TimedOut => {
                return Err(BridgeError::ServiceNotFound(format!(
                    "discovery timed out after {}s",
                    discovery_timeout.as_secs()
                )))
            }
            Step::Cancelled => return Ok(DisconnectReason::UserCancelled),
        };

        for service in &services {
            debug!("Service {}", service.uuid);
            for c in &service.characteristics {
                debug!("  Characteristic {} [{}]", c.uuid, c.properties);
            }
        }
        if let Some(path) = &self.config.gatt_dump_file {
            write_gatt_dump(path, device, &services).await;
        }

        let (data, tag) = select_data_characteristic(&services, &self.config.ids)?;
        info!("Streaming from {:?} characteristic {}", tag, data.uuid);

        self.transition(SessionState::Subscribing);
        let io_timeout = self.config.io_timeout;
        let mut events = match step(shutdown, io_timeout, link.subscribe(&data)).await {
            Step::Done(Ok(events)) => events,
            Step::Done(Err(e)) => {
                return Err(BridgeError::Subscription(format!("{}: {}", data.uuid, e)))
            }
            Step::TimedOut => {
                return Err(BridgeError::Subscription(format!(
                    "{}: timed out after {}s",
                    data.uuid,
                    io_timeout.as_secs()
                )))
            }
            Step::Cancelled => return Ok(DisconnectReason::UserCancelled),
        };

        if tag == ProtocolTag::HidReport
            && prepare_hid(link.as_ref(), &services, io_timeout, shutdown)
                .await
                .is_break()
        {
            return Ok(DisconnectReason::UserCancelled);
        }

        self.transition(SessionState::Streaming);

        let battery = Arc::new(BatteryState::new());
        let battery_char = battery_level(&services);
        if let Some(c) = battery_char {
            if read_battery(link.as_ref(), c, &battery, io_timeout, shutdown)
                .await
                .is_break()
            {
                return Ok(DisconnectReason::UserCancelled);
            }
            match subscribe_battery(link.as_ref(), c, io_timeout, shutdown).await {
                ControlFlow::Continue(Some(updates)) => {
                    events = stream::select(events, updates).boxed();
                }
                ControlFlow::Continue(None) => {}
                ControlFlow::Break(()) => return Ok(DisconnectReason::UserCancelled),
            }
        }

        let mut tasks = Vec::new();
        if let Some(interval) = self.config.keepalive_interval {
            match keepalive::keepalive_target(&services, self.config.keepalive_mode) {
                Some(target) => tasks.push(keepalive::spawn(
                    "Keepalive",
                    link.clone(),
                    target,
                    interval,
                    battery.clone(),
                )),
                None => debug!("No readable characteristic for keepalive"),
            }
        }
        if let (Some(interval), Some(c)) = (
            self.config.battery_poll_interval,
            battery_char.filter(|c| c.properties.read),
        ) {
            tasks.push(keepalive::spawn(
                "Battery poll",
                link.clone(),
                c.clone(),
                interval,
                battery.clone(),
            ));
        }

        let reason = self.stream(&mut events, &battery, sink, shutdown).await;

        for task in tasks {
            task.abort();
        }
        Ok(reason)
    }

    async fn stream(
        &mut self,
        events: &mut BoxStream<'static, LinkEvent>,
        battery: &BatteryState,
        sink: &dyn TelemetrySink,
        shutdown: &mut Shutdown,
    ) -> DisconnectReason {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return DisconnectReason::UserCancelled,
                event = events.next() => match event {
                    Some(LinkEvent::Notification { characteristic, value })
                        if characteristic == BATTERY_LEVEL_UUID =>
                    {
                        battery.record(&value);
                    }
                    Some(LinkEvent::Notification { characteristic, value }) => {
                        self.sequence += 1;
                        let payload = NotificationPayload {
                            characteristic,
                            sequence: self.sequence,
                            bytes: value,
                        };
                        self.deliver(&payload, sink);
                    }
                    Some(LinkEvent::Disconnected) | None => {
                        warn!("Peer disconnected");
                        return DisconnectReason::PeerDisconnected;
                    }
                    Some(LinkEvent::Error(e)) => {
                        error!("Link error: {}", e);
                        return DisconnectReason::TransportError;
                    }
                },
            }
        }
    }

    fn deliver(&self, payload: &NotificationPayload, sink: &dyn TelemetrySink) {
        if self.config.report_layout_logging && payload.characteristic == HID_REPORT_UUID {
            info!(
                "Report #{} ({} bytes): {}",
                payload.sequence,
                payload.bytes.len(),
                indexed(&payload.bytes)
            );
        } else if self.config.notify_verbose {
            info!(
                "Notify {} #{}: {}",
                payload.characteristic,
                payload.sequence,
                hex(&payload.bytes)
            );
        } else {
            trace!(
                "Notify {} #{}: {}",
                payload.characteristic,
                payload.sequence,
                hex(&payload.bytes)
            );
        }

        match protocol::decode(payload, &self.config.ids) {
            Ok(sample) => sink.publish(&sample),
            Err(e) => debug!("Dropped payload #{}: {}", payload.sequence, e),
        }
    }
}

/// What a HOGP host does once reports are enabled: log the HID info and
/// report map, then take the device out of suspend.
///
/// Breaks on cancellation; failures and timeouts are only logged.
async fn prepare_hid<L: GattLink>(
    link: &L,
    services: &[ServiceDescriptor],
    limit: Duration,
    shutdown: &mut Shutdown,
) -> ControlFlow<()> {
    for (uuid, label) in [
        (HID_INFORMATION_UUID, "HID Information"),
        (HID_REPORT_MAP_UUID, "Report Map"),
    ] {
        let Some(c) = find_characteristic(services, uuid).filter(|c| c.properties.read) else {
            continue;
        };
        match step(shutdown, limit, link.read(c)).await {
            Step::Done(Ok(value)) => debug!("{} ({} bytes): {}", label, value.len(), hex(&value)),
            Step::Done(Err(e)) => debug!("Could not read {}: {}", label, e),
            Step::TimedOut => debug!("Reading {} timed out", label),
            Step::Cancelled => return ControlFlow::Break(()),
        }
    }

    let Some(control_point) = find_characteristic(services, HID_CONTROL_POINT_UUID)
        .filter(|c| c.properties.is_writable())
    else {
        return ControlFlow::Continue(());
    };
    let with_response = !control_point.properties.write_without_response;
    let write = link.write(control_point, HID_CONTROL_POINT_EXIT_SUSPEND, with_response);
    match step(shutdown, limit, write).await {
        Step::Done(Ok(())) => info!("HID Control Point: Exit Suspend"),
        Step::Done(Err(e)) => warn!("Failed to write HID Control Point: {}", e),
        Step::TimedOut => warn!("HID Control Point write timed out"),
        Step::Cancelled => return ControlFlow::Break(()),
    }
    ControlFlow::Continue(())
}

async fn read_battery<L: GattLink>(
    link: &L,
    c: &CharacteristicDescriptor,
    battery: &BatteryState,
    limit: Duration,
    shutdown: &mut Shutdown,
) -> ControlFlow<()> {
    if !c.properties.read {
        return ControlFlow::Continue(());
    }
    match step(shutdown, limit, link.read(c)).await {
        Step::Done(Ok(value)) => {
            if battery.record(&value).is_none() {
                debug!("Empty battery level read");
            }
        }
        Step::Done(Err(e)) => warn!("Failed to read battery level: {}", e),
        Step::TimedOut => warn!("Battery level read timed out"),
        Step::Cancelled => return ControlFlow::Break(()),
    }
    ControlFlow::Continue(())
}

/// Battery Level updates as they happen, when the ring offers them
async fn subscribe_battery<L: GattLink>(
    link: &L,
    c: &CharacteristicDescriptor,
    limit: Duration,
    shutdown: &mut Shutdown,
) -> ControlFlow<(), Option<BoxStream<'static, LinkEvent>>> {
    if !c.properties.is_notifiable() {
        return ControlFlow::Continue(None);
    }
    match step(shutdown, limit, link.subscribe(c)).await {
        Step::Done(Ok(updates)) => {
            debug!("Battery level notifications enabled");
            ControlFlow::Continue(Some(updates))
        }
        Step::Done(Err(e)) => {
            warn!("Could not enable battery notifications: {}", e);
            ControlFlow::Continue(None)
        }
        Step::TimedOut => {
            warn!("Enabling battery notifications timed out");
            ControlFlow::Continue(None)
        }
        Step::Cancelled => ControlFlow::Break(()),
    }
}
