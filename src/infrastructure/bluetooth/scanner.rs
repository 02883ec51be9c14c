//! BLE Scanner Module
//!
//! Resolves the ring to connect to from an address, a name, or the
//! configured default address.

use crate::domain::error::BridgeError;
use crate::domain::models::PeripheralHandle;
use crate::infrastructure::bluetooth::transport::BleTransport;
use crate::infrastructure::shutdown::Shutdown;
use futures::StreamExt;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What the user asked for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceQuery {
    /// Exact address match, ignoring case and `:`/`-` separators
    Address(String),
    /// Case-insensitive substring of the advertised name
    Name(String),
}

impl DeviceQuery {
    /// An absent or blank identifier falls back to `default_address`.
    pub fn resolve(identifier: Option<&str>, default_address: &str) -> Self {
        match identifier.map(str::trim).filter(|id| !id.is_empty()) {
            None => Self::Address(default_address.to_string()),
            Some(id) if looks_like_address(id) => Self::Address(id.to_string()),
            Some(id) => Self::Name(id.to_string()),
        }
    }

    pub fn matches(&self, device: &PeripheralHandle) -> bool {
        match self {
            Self::Address(address) => same_address(&device.address, address),
            Self::Name(needle) => device
                .name
                .as_deref()
                .map(|name| name.to_lowercase().contains(&needle.to_lowercase()))
                .unwrap_or(false),
        }
    }
}

impl fmt::Display for DeviceQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Address(address) => write!(f, "address {}", address),
            Self::Name(name) => write!(f, "name \"{}\"", name),
        }
    }
}

fn is_separator(c: char) -> bool {
    c == ':' || c == '-'
}

/// `AA:BB:CC:DD:EE:FF` (or `-` separated)
fn looks_like_address(id: &str) -> bool {
    let octets: Vec<&str> = id.split(is_separator).collect();
    octets.len() == 6
        && octets
            .iter()
            .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()))
}

/// btleplug formats addresses with `:`; users may type `-`
fn same_address(a: &str, b: &str) -> bool {
    a.len() == b.len()
        && a.chars().zip(b.chars()).all(|(x, y)| {
            x.eq_ignore_ascii_case(&y) || (is_separator(x) && is_separator(y))
        })
}

/// Upper bound on stopping the scan
const STOP_SCAN_TIMEOUT: Duration = Duration::from_secs(5);

/// Device Selector
///
/// The first advertisement that matches wins. Several rings whose names all
/// contain the query are not disambiguated.
pub struct DeviceSelector {
    default_address: String,
    timeout: Duration,
}

impl DeviceSelector {
    pub fn new(default_address: impl Into<String>, timeout: Duration) -> Self {
        Self {
            default_address: default_address.into(),
            timeout,
        }
    }

    pub async fn select<T: BleTransport>(
        &self,
        transport: &T,
        identifier: Option<&str>,
        shutdown: &mut Shutdown,
    ) -> Result<PeripheralHandle, BridgeError> {
        let query = DeviceQuery::resolve(identifier, &self.default_address);
        info!(
            "Scanning for {} ({}s timeout)...",
            query,
            self.timeout.as_secs()
        );

        // Starting the scan counts against the same deadline
        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);

        let started = tokio::select! {
            _ = shutdown.cancelled() => Err(BridgeError::Cancelled),
            _ = &mut deadline => Err(self.not_found(&query)),
            started = transport.scan() => started.map_err(BridgeError::from),
        };

        let outcome = match started {
            Ok(mut adverts) => loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break Err(BridgeError::Cancelled),
                    _ = &mut deadline => break Err(self.not_found(&query)),
                    advert = adverts.next() => match advert {
                        Some(device) if query.matches(&device) => break Ok(device),
                        Some(device) => debug!("Ignoring {} (rssi {:?})", device, device.rssi),
                        None => break Err(self.not_found(&query)),
                    },
                }
            },
            Err(e) => Err(e),
        };

        match tokio::time::timeout(STOP_SCAN_TIMEOUT, transport.stop_scan()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Failed to stop scan: {}", e),
            Err(_) => warn!("Stopping the scan timed out"),
        }

        if let Ok(device) = &outcome {
            info!("Found {}", device);
        }
        outcome
    }

    fn not_found(&self, query: &DeviceQuery) -> BridgeError {
        BridgeError::DeviceNotFound {
            target: query.to_string(),
            timeout_secs: self.timeout.as_secs(),
        }
    }
}
