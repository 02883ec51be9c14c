//! Scripted in-memory transport for tests

use crate::domain::error::TransportError;
use crate::domain::models::{
    CharacteristicDescriptor, CharacteristicProperties, PeripheralHandle, ServiceDescriptor,
};
use crate::infrastructure::bluetooth::protocol::{
    ProtocolIds, BATTERY_LEVEL_UUID, BATTERY_SERVICE_UUID, HID_CONTROL_POINT_UUID,
    HID_REPORT_UUID, HID_SERVICE_UUID,
};
use crate::infrastructure::bluetooth::transport::{BleTransport, GattLink, LinkEvent};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

pub fn device(address: &str, name: Option<&str>) -> PeripheralHandle {
    PeripheralHandle {
        id: format!("mock-{}", address),
        address: address.to_string(),
        name: name.map(str::to_string),
        rssi: Some(-60),
    }
}

pub fn characteristic(
    service_uuid: Uuid,
    uuid: Uuid,
    properties: CharacteristicProperties,
) -> CharacteristicDescriptor {
    CharacteristicDescriptor {
        uuid,
        service_uuid,
        properties,
        descriptors: Vec::new(),
    }
}

pub fn notify() -> CharacteristicProperties {
    CharacteristicProperties {
        notify: true,
        ..Default::default()
    }
}

pub fn readable() -> CharacteristicProperties {
    CharacteristicProperties {
        read: true,
        ..Default::default()
    }
}

pub fn writable() -> CharacteristicProperties {
    CharacteristicProperties {
        write: true,
        ..Default::default()
    }
}

pub fn service(uuid: Uuid, characteristics: Vec<CharacteristicDescriptor>) -> ServiceDescriptor {
    ServiceDescriptor {
        uuid,
        primary: true,
        characteristics,
    }
}

/// Vendor service with its notify characteristic, plus Battery
pub fn vendor_services(ids: &ProtocolIds) -> Vec<ServiceDescriptor> {
    vec![
        service(
            ids.vendor_service,
            vec![characteristic(ids.vendor_service, ids.vendor_notify, notify())],
        ),
        battery_service(),
    ]
}

/// HID service with Report and Control Point, plus Battery
pub fn hid_services() -> Vec<ServiceDescriptor> {
    vec![
        service(
            HID_SERVICE_UUID,
            vec![
                characteristic(HID_SERVICE_UUID, HID_REPORT_UUID, notify()),
                characteristic(HID_SERVICE_UUID, HID_CONTROL_POINT_UUID, writable()),
            ],
        ),
        battery_service(),
    ]
}

pub fn battery_service() -> ServiceDescriptor {
    service(
        BATTERY_SERVICE_UUID,
        vec![characteristic(
            BATTERY_SERVICE_UUID,
            BATTERY_LEVEL_UUID,
            readable(),
        )],
    )
}

/// Battery Level that can be read and notifies changes
pub fn notifying_battery_service() -> ServiceDescriptor {
    service(
        BATTERY_SERVICE_UUID,
        vec![characteristic(
            BATTERY_SERVICE_UUID,
            BATTERY_LEVEL_UUID,
            CharacteristicProperties {
                read: true,
                notify: true,
                ..Default::default()
            },
        )],
    )
}

#[derive(Default)]
struct LinkState {
    services: Vec<ServiceDescriptor>,
    subscribe_error: Option<String>,
    streams: VecDeque<mpsc::UnboundedReceiver<LinkEvent>>,
    reads: HashMap<Uuid, Vec<u8>>,
    reads_hang: bool,
    calls: Vec<String>,
    connected: bool,
}

#[derive(Clone, Default)]
pub struct MockLink {
    state: Arc<Mutex<LinkState>>,
}

impl MockLink {
    pub fn new(services: Vec<ServiceDescriptor>) -> Self {
        let link = Self::default();
        link.state.lock().unwrap().services = services;
        link
    }

    pub fn reject_subscribe(self, message: &str) -> Self {
        self.state.lock().unwrap().subscribe_error = Some(message.to_string());
        self
    }

    pub fn with_read(self, uuid: Uuid, value: &[u8]) -> Self {
        self.state.lock().unwrap().reads.insert(uuid, value.to_vec());
        self
    }

    /// Every read stays pending forever
    pub fn hang_reads(self) -> Self {
        self.state.lock().unwrap().reads_hang = true;
        self
    }

    /// Queue the event stream handed out by the next `subscribe`
    pub fn push_stream(&self) -> mpsc::UnboundedSender<LinkEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().unwrap().streams.push_back(rx);
        tx
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().unwrap().connected
    }

    fn record(&self, call: String) {
        self.state.lock().unwrap().calls.push(call);
    }
}

#[async_trait]
impl GattLink for MockLink {
    async fn discover(&self) -> Result<Vec<ServiceDescriptor>, TransportError> {
        self.record("discover".to_string());
        Ok(self.state.lock().unwrap().services.clone())
    }

    async fn subscribe(
        &self,
        characteristic: &CharacteristicDescriptor,
    ) -> Result<BoxStream<'static, LinkEvent>, TransportError> {
        self.record(format!("subscribe {}", characteristic.uuid));
        let mut state = self.state.lock().unwrap();
        if let Some(message) = &state.subscribe_error {
            return Err(TransportError::new(message.clone()));
        }
        Ok(match state.streams.pop_front() {
            Some(rx) => stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|event| (event, rx))
            })
            .boxed(),
            None => stream::pending().boxed(),
        })
    }

    async fn read(
        &self,
        characteristic: &CharacteristicDescriptor,
    ) -> Result<Vec<u8>, TransportError> {
        self.record(format!("read {}", characteristic.uuid));
        let hangs = self.state.lock().unwrap().reads_hang;
        if hangs {
            std::future::pending::<()>().await;
        }
        self.state
            .lock()
            .unwrap()
            .reads
            .get(&characteristic.uuid)
            .cloned()
            .ok_or_else(|| TransportError::new("read not permitted"))
    }

    async fn write(
        &self,
        characteristic: &CharacteristicDescriptor,
        value: &[u8],
        with_response: bool,
    ) -> Result<(), TransportError> {
        self.record(format!(
            "write {} {:02X?} {}",
            characteristic.uuid, value, with_response
        ));
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.record("disconnect".to_string());
        self.state.lock().unwrap().connected = false;
        Ok(())
    }
}

pub struct MockTransport {
    adverts: Vec<(Duration, PeripheralHandle)>,
    link: MockLink,
    connect_error: Option<String>,
    connect_hangs: bool,
    scan_hangs: bool,
    advertising_scans: Option<usize>,
    pub scans: AtomicUsize,
    pub connects: AtomicUsize,
    pub scan_stopped: AtomicBool,
}

impl MockTransport {
    pub fn new(link: MockLink) -> Self {
        Self {
            adverts: Vec::new(),
            link,
            connect_error: None,
            connect_hangs: false,
            scan_hangs: false,
            advertising_scans: None,
            scans: AtomicUsize::new(0),
            connects: AtomicUsize::new(0),
            scan_stopped: AtomicBool::new(false),
        }
    }

    /// Advertise `device` after `delay` (relative to the previous advert)
    pub fn advertise(mut self, delay: Duration, device: PeripheralHandle) -> Self {
        self.adverts.push((delay, device));
        self
    }

    pub fn refuse_connect(mut self, message: &str) -> Self {
        self.connect_error = Some(message.to_string());
        self
    }

    pub fn hang_on_connect(mut self) -> Self {
        self.connect_hangs = true;
        self
    }

    /// Starting a scan never returns
    pub fn hang_on_scan(mut self) -> Self {
        self.scan_hangs = true;
        self
    }

    /// Only the first `scans` scans see the adverts; later ones end empty
    pub fn advertise_for_scans(mut self, scans: usize) -> Self {
        self.advertising_scans = Some(scans);
        self
    }

    pub fn link(&self) -> &MockLink {
        &self.link
    }
}

#[async_trait]
impl BleTransport for MockTransport {
    type Link = MockLink;

    async fn scan(&self) -> Result<BoxStream<'static, PeripheralHandle>, TransportError> {
        let scan = self.scans.fetch_add(1, Ordering::SeqCst);
        self.scan_stopped.store(false, Ordering::SeqCst);
        if self.scan_hangs {
            std::future::pending::<()>().await;
        }
        if self.advertising_scans.is_some_and(|limit| scan >= limit) {
            return Ok(stream::empty().boxed());
        }
        let adverts = self.adverts.clone();
        Ok(stream::iter(adverts)
            .then(|(delay, device)| async move {
                tokio::time::sleep(delay).await;
                device
            })
            .chain(stream::pending())
            .boxed())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        self.scan_stopped.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn connect(&self, _peripheral: &PeripheralHandle) -> Result<MockLink, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.connect_hangs {
            std::future::pending::<()>().await;
        }
        if let Some(message) = &self.connect_error {
            return Err(TransportError::new(message.clone()));
        }
        self.link.record("connect".to_string());
        self.link.state.lock().unwrap().connected = true;
        Ok(self.link.clone())
    }
}
