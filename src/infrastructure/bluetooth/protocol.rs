//! Ring Protocol
//!
//! GATT identifiers for the ring and the decoder that turns notification
//! payloads into telemetry samples.

use crate::domain::error::DecodeError;
use crate::domain::models::{NotificationPayload, TelemetrySample};
use crate::domain::settings::Settings;
use anyhow::{Context, Result};
use uuid::Uuid;

/// HID over GATT service (0x1812)
pub const HID_SERVICE_UUID: Uuid = Uuid::from_u128(0x00001812_0000_1000_8000_00805f9b34fb);
/// HID Information (0x2A4A)
pub const HID_INFORMATION_UUID: Uuid = Uuid::from_u128(0x00002a4a_0000_1000_8000_00805f9b34fb);
/// HID Report Map (0x2A4B)
pub const HID_REPORT_MAP_UUID: Uuid = Uuid::from_u128(0x00002a4b_0000_1000_8000_00805f9b34fb);
/// HID Control Point (0x2A4C)
pub const HID_CONTROL_POINT_UUID: Uuid = Uuid::from_u128(0x00002a4c_0000_1000_8000_00805f9b34fb);
/// HID Report (0x2A4D) - Get/Set/Notify
pub const HID_REPORT_UUID: Uuid = Uuid::from_u128(0x00002a4d_0000_1000_8000_00805f9b34fb);

/// Battery Service (0x180F)
pub const BATTERY_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000180f_0000_1000_8000_00805f9b34fb);
/// Battery Level (0x2A19)
pub const BATTERY_LEVEL_UUID: Uuid = Uuid::from_u128(0x00002a19_0000_1000_8000_00805f9b34fb);

/// HID Control Point value written after subscribing
pub const HID_CONTROL_POINT_EXIT_SUSPEND: &[u8] = &[0x01];

/// Vendor ring frame: header, X (i16 LE), Y (i16 LE), press flags
pub const VENDOR_FRAME_LEN: usize = 6;

/// Boot protocol mouse report: buttons, X (i8), Y (i8), optional wheel
pub const BOOT_MOUSE_MIN_LEN: usize = 3;
pub const BOOT_MOUSE_MAX_LEN: usize = 4;

/// The ring's pointer report on the HID Report characteristic. Longer
/// reports (larger negotiated MTU) carry the same leading bytes.
pub const RING_REPORT_MIN_LEN: usize = 13;

/// Pointer bytes inside the ring report
const RING_REPORT_X: usize = 10;
const RING_REPORT_Y: usize = 11;
const RING_REPORT_PRESS: usize = 12;

/// Characteristic identifiers the decoder understands.
///
/// The vendor pair comes from settings because firmware variants differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolIds {
    pub vendor_service: Uuid,
    pub vendor_notify: Uuid,
}

impl ProtocolIds {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let vendor_service = Uuid::parse_str(&settings.vendor_service_uuid)
            .with_context(|| format!("Invalid vendor service UUID {}", settings.vendor_service_uuid))?;
        let vendor_notify = Uuid::parse_str(&settings.vendor_notify_char_uuid).with_context(|| {
            format!(
                "Invalid vendor notify characteristic UUID {}",
                settings.vendor_notify_char_uuid
            )
        })?;
        Ok(Self {
            vendor_service,
            vendor_notify,
        })
    }
}

impl Default for ProtocolIds {
    fn default() -> Self {
        Self {
            vendor_service: Uuid::from_u128(0x0000ae40_0000_1000_8000_00805f9b34fb),
            vendor_notify: Uuid::from_u128(0x0000ae42_0000_1000_8000_00805f9b34fb),
        }
    }
}

/// Frame layout, selected by the characteristic a payload arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolTag {
    VendorRing,
    HidReport,
}

impl ProtocolTag {
    pub fn for_characteristic(uuid: Uuid, ids: &ProtocolIds) -> Option<Self> {
        if uuid == ids.vendor_notify {
            Some(Self::VendorRing)
        } else if uuid == HID_REPORT_UUID {
            Some(Self::HidReport)
        } else {
            None
        }
    }
}

/// Decode one notification payload
///
/// # Vendor ring frame (6 bytes)
///
/// ```text
/// [0]     : Frame header
/// [1-2]   : X (i16 little-endian)
/// [3-4]   : Y (i16 little-endian)
/// [5]     : Press state, bit 0
/// ```
///
/// # HID Report
///
/// ```text
/// 3-4 bytes (boot mouse):
/// [0]     : Buttons, bit 0 = primary (press)
/// [1]     : X (i8)
/// [2]     : Y (i8)
/// [3]     : Wheel (ignored)
///
/// 13+ bytes (ring pointer report):
/// [0-9]   : Motion data (ignored)
/// [10]    : X (u8)
/// [11]    : Y (u8)
/// [12]    : Press (non-zero = pressed)
/// ```
pub fn decode(
    payload: &NotificationPayload,
    ids: &ProtocolIds,
) -> Result<TelemetrySample, DecodeError> {
    let unknown = || DecodeError::UnknownFormat {
        characteristic: payload.characteristic,
        len: payload.bytes.len(),
    };

    let tag = ProtocolTag::for_characteristic(payload.characteristic, ids).ok_or_else(unknown)?;
    let (x, y, press) = decode_frame(tag, &payload.bytes).ok_or_else(unknown)?;

    Ok(TelemetrySample {
        x,
        y,
        press,
        sequence: payload.sequence,
    })
}

/// Parse raw bytes for a known layout; `None` when the length is not one of its frame sizes
pub fn decode_frame(tag: ProtocolTag, bytes: &[u8]) -> Option<(i32, i32, bool)> {
    match tag {
        ProtocolTag::VendorRing => {
            if bytes.len() != VENDOR_FRAME_LEN {
                return None;
            }
            let x = i16::from_le_bytes([bytes[1], bytes[2]]) as i32;
            let y = i16::from_le_bytes([bytes[3], bytes[4]]) as i32;
            let press = (bytes[5] & 0x01) != 0;
            Some((x, y, press))
        }
        ProtocolTag::HidReport => match bytes.len() {
            BOOT_MOUSE_MIN_LEN..=BOOT_MOUSE_MAX_LEN => {
                let press = (bytes[0] & 0x01) != 0;
                let x = bytes[1] as i8 as i32;
                let y = bytes[2] as i8 as i32;
                Some((x, y, press))
            }
            RING_REPORT_MIN_LEN.. => {
                let x = bytes[RING_REPORT_X] as i32;
                let y = bytes[RING_REPORT_Y] as i32;
                let press = bytes[RING_REPORT_PRESS] != 0;
                Some((x, y, press))
            }
            _ => None,
        },
    }
}

/// Clamp a Battery Level read to a percentage
pub fn battery_percent(value: &[u8]) -> Option<u8> {
    value.first().map(|level| (*level).min(100))
}
