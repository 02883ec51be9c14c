use std::fmt;
use uuid::Uuid;

/// A peripheral seen while scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralHandle {
    /// Platform identifier used to reconnect to the same peripheral
    pub id: String,
    /// Bluetooth address (`AA:BB:CC:DD:EE:FF`)
    pub address: String,
    /// Advertised local name
    pub name: Option<String>,
    /// Signal strength in dBm
    pub rssi: Option<i16>,
}

impl fmt::Display for PeripheralHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({})", name, self.address),
            None => write!(f, "{}", self.address),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CharacteristicProperties {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
    pub indicate: bool,
}

impl CharacteristicProperties {
    /// Notify or indicate
    pub fn is_notifiable(&self) -> bool {
        self.notify || self.indicate
    }

    pub fn is_writable(&self) -> bool {
        self.write || self.write_without_response
    }
}

impl fmt::Display for CharacteristicProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flags = [
            (self.read, "read"),
            (self.write, "write"),
            (self.write_without_response, "write-without-response"),
            (self.notify, "notify"),
            (self.indicate, "indicate"),
        ];
        let names: Vec<&str> = flags
            .iter()
            .filter(|(set, _)| *set)
            .map(|(_, name)| *name)
            .collect();
        write!(f, "{}", names.join(","))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicDescriptor {
    pub uuid: Uuid,
    pub service_uuid: Uuid,
    pub properties: CharacteristicProperties,
    /// Descriptor UUIDs (CCCD etc.), only used for diagnostics
    pub descriptors: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub uuid: Uuid,
    pub primary: bool,
    pub characteristics: Vec<CharacteristicDescriptor>,
}

/// Raw bytes received on a subscribed characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationPayload {
    pub characteristic: Uuid,
    /// Receive order within the session, stamped by the session
    pub sequence: u64,
    pub bytes: Vec<u8>,
}

/// One decoded (X, Y, press) reading.
///
/// Only the decoder constructs these, and only from a frame it recognised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelemetrySample {
    pub x: i32,
    pub y: i32,
    pub press: bool,
    pub sequence: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    UserCancelled,
    PeerDisconnected,
    TransportError,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UserCancelled => write!(f, "cancelled by user"),
            Self::PeerDisconnected => write!(f, "peer disconnected"),
            Self::TransportError => write!(f, "transport error"),
        }
    }
}

/// GATT session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Discovering,
    Subscribing,
    Streaming,
    Disconnected(DisconnectReason),
}

impl SessionState {
    /// Legal edges of the session state machine.
    ///
    /// Any non-terminal state may drop to `Disconnected`; forward progress is
    /// strictly `Idle -> Connecting -> Discovering -> Subscribing -> Streaming`.
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Disconnected(_), _) => false,
            (_, Disconnected(_)) => true,
            (Idle, Connecting) => true,
            (Connecting, Discovering) => true,
            (Discovering, Subscribing) => true,
            (Subscribing, Streaming) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Connecting => write!(f, "connecting"),
            Self::Discovering => write!(f, "discovering"),
            Self::Subscribing => write!(f, "subscribing"),
            Self::Streaming => write!(f, "streaming"),
            Self::Disconnected(reason) => write!(f, "disconnected ({})", reason),
        }
    }
}
