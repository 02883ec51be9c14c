//! btleplug transport
//!
//! Maps btleplug's adapter/peripheral API onto the transport traits.

use crate::domain::error::TransportError;
use crate::domain::models::{
    CharacteristicDescriptor, CharacteristicProperties, PeripheralHandle, ServiceDescriptor,
};
use crate::infrastructure::bluetooth::transport::{BleTransport, GattLink, LinkEvent};
use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CentralState, CharPropFlags, Characteristic, Manager as _,
    Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::stream::{self, BoxStream, StreamExt};
use tracing::{debug, info};

/// Adapter events that end or break the link to one peripheral
fn link_event(event: CentralEvent, is_ours: impl Fn(&PeripheralId) -> bool) -> Option<LinkEvent> {
    match event {
        CentralEvent::DeviceDisconnected(id) if is_ours(&id) => Some(LinkEvent::Disconnected),
        CentralEvent::StateUpdate(CentralState::PoweredOff) => {
            Some(LinkEvent::Error("Bluetooth adapter powered off".to_string()))
        }
        _ => None,
    }
}

/// Transport over the first local Bluetooth adapter
pub struct BtleTransport {
    adapter: Adapter,
}

impl BtleTransport {
    pub async fn new() -> Result<Self, TransportError> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| TransportError::new("No Bluetooth adapter found"))?;

        if let Ok(info) = adapter.adapter_info().await {
            info!("Using Bluetooth adapter: {}", info);
        }

        Ok(Self { adapter })
    }
}

async fn handle_for(adapter: &Adapter, id: &PeripheralId) -> Option<PeripheralHandle> {
    let peripheral = adapter.peripheral(id).await.ok()?;
    let props = peripheral.properties().await.ok()??;
    Some(PeripheralHandle {
        id: peripheral.id().to_string(),
        address: props.address.to_string(),
        name: props.local_name,
        rssi: props.rssi,
    })
}

#[async_trait]
impl BleTransport for BtleTransport {
    type Link = BtleLink;

    async fn scan(&self) -> Result<BoxStream<'static, PeripheralHandle>, TransportError> {
        let events = self.adapter.events().await?;
        self.adapter.start_scan(ScanFilter::default()).await?;

        let adapter = self.adapter.clone();
        let discovered = events.filter_map(move |event| {
            let adapter = adapter.clone();
            async move {
                match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                        handle_for(&adapter, &id).await
                    }
                    _ => None,
                }
            }
        });

        Ok(discovered.boxed())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        self.adapter.stop_scan().await?;
        Ok(())
    }

    async fn connect(&self, handle: &PeripheralHandle) -> Result<BtleLink, TransportError> {
        let peripheral = self
            .adapter
            .peripherals()
            .await?
            .into_iter()
            .find(|p| p.id().to_string() == handle.id)
            .ok_or_else(|| {
                TransportError::new(format!("{} is no longer known to the adapter", handle))
            })?;

        peripheral.connect().await?;

        Ok(BtleLink {
            adapter: self.adapter.clone(),
            peripheral,
        })
    }
}

/// A connected peripheral
pub struct BtleLink {
    adapter: Adapter,
    peripheral: Peripheral,
}

impl BtleLink {
    fn find(&self, descriptor: &CharacteristicDescriptor) -> Result<Characteristic, TransportError> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == descriptor.uuid && c.service_uuid == descriptor.service_uuid)
            .ok_or_else(|| {
                TransportError::new(format!("Characteristic {} not found", descriptor.uuid))
            })
    }
}

fn properties_from(flags: CharPropFlags) -> CharacteristicProperties {
    CharacteristicProperties {
        read: flags.contains(CharPropFlags::READ),
        write: flags.contains(CharPropFlags::WRITE),
        write_without_response: flags.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
        notify: flags.contains(CharPropFlags::NOTIFY),
        indicate: flags.contains(CharPropFlags::INDICATE),
    }
}

#[async_trait]
impl GattLink for BtleLink {
    async fn discover(&self) -> Result<Vec<ServiceDescriptor>, TransportError> {
        self.peripheral.discover_services().await?;

        let services = self
            .peripheral
            .services()
            .into_iter()
            .map(|service| ServiceDescriptor {
                uuid: service.uuid,
                primary: service.primary,
                characteristics: service
                    .characteristics
                    .into_iter()
                    .map(|c| CharacteristicDescriptor {
                        uuid: c.uuid,
                        service_uuid: c.service_uuid,
                        properties: properties_from(c.properties),
                        descriptors: c.descriptors.into_iter().map(|d| d.uuid).collect(),
                    })
                    .collect(),
            })
            .collect::<Vec<_>>();

        debug!("btleplug reported {} services", services.len());
        Ok(services)
    }

    async fn subscribe(
        &self,
        descriptor: &CharacteristicDescriptor,
    ) -> Result<BoxStream<'static, LinkEvent>, TransportError> {
        let characteristic = self.find(descriptor)?;

        // Take both streams before subscribing so nothing is missed
        let notifications = self.peripheral.notifications().await?;
        let central_events = self.adapter.events().await?;
        self.peripheral.subscribe(&characteristic).await?;

        // The peripheral stream carries every subscribed characteristic
        let uuid = characteristic.uuid;
        let notifications = notifications
            .filter(move |n| futures::future::ready(n.uuid == uuid))
            .map(|n| LinkEvent::Notification {
                characteristic: n.uuid,
                value: n.value,
            });

        let peripheral_id = self.peripheral.id();
        let link_events = central_events.filter_map(move |event| {
            futures::future::ready(link_event(event, |id| *id == peripheral_id))
        });

        Ok(stream::select(notifications, link_events)
            .chain(stream::once(async { LinkEvent::Disconnected }))
            .boxed())
    }

    async fn read(&self, descriptor: &CharacteristicDescriptor) -> Result<Vec<u8>, TransportError> {
        let characteristic = self.find(descriptor)?;
        Ok(self.peripheral.read(&characteristic).await?)
    }

    async fn write(
        &self,
        descriptor: &CharacteristicDescriptor,
        value: &[u8],
        with_response: bool,
    ) -> Result<(), TransportError> {
        let characteristic = self.find(descriptor)?;
        let write_type = if with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        self.peripheral.write(&characteristic, value, write_type).await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.peripheral.disconnect().await?;
        Ok(())
    }
}
