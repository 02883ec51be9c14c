//! BLE transport capability
//!
//! The radio stack is an external collaborator. The session and selector only
//! talk to it through these traits; `btle` provides the real implementation.

use crate::domain::error::TransportError;
use crate::domain::models::{CharacteristicDescriptor, PeripheralHandle, ServiceDescriptor};
use async_trait::async_trait;
use futures::stream::BoxStream;
use uuid::Uuid;

/// Something that happened on a connected link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Notification { characteristic: Uuid, value: Vec<u8> },
    Disconnected,
    Error(String),
}

#[async_trait]
pub trait BleTransport: Send + Sync {
    type Link: GattLink + 'static;

    /// Start scanning; yields every advertisement as it is seen
    async fn scan(&self) -> Result<BoxStream<'static, PeripheralHandle>, TransportError>;

    async fn stop_scan(&self) -> Result<(), TransportError>;

    async fn connect(&self, peripheral: &PeripheralHandle) -> Result<Self::Link, TransportError>;
}

#[async_trait]
pub trait GattLink: Send + Sync {
    /// Enumerate services and characteristics
    async fn discover(&self) -> Result<Vec<ServiceDescriptor>, TransportError>;

    /// Enable notifications; returns once the peripheral acknowledged.
    ///
    /// The stream carries this characteristic's notifications plus link
    /// events, and ends after `Disconnected`.
    async fn subscribe(
        &self,
        characteristic: &CharacteristicDescriptor,
    ) -> Result<BoxStream<'static, LinkEvent>, TransportError>;

    async fn read(&self, characteristic: &CharacteristicDescriptor)
        -> Result<Vec<u8>, TransportError>;

    async fn write(
        &self,
        characteristic: &CharacteristicDescriptor,
        value: &[u8],
        with_response: bool,
    ) -> Result<(), TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;
}
