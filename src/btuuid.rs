//! Bluetooth identifiers and well-known assigned numbers

use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

/// This is the Bluetooth Base UUID. It is used with 16-bit and 32-bit UUIDs
/// [defined](https://www.bluetooth.com/specifications/assigned-numbers/) by the Bluetooth SIG.
pub const BLUETOOTH_BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805f9b34fb;

const BASE_MASK: u128 = (1 << 96) - 1;

/// Const function to create a 16-bit Bluetooth UUID
pub const fn bluetooth_uuid_from_u16(uuid: u16) -> Uuid {
    Uuid::from_u128(((uuid as u128) << 96) | BLUETOOTH_BASE_UUID)
}

/// Const function to create a 32-bit Bluetooth UUID
pub const fn bluetooth_uuid_from_u32(uuid: u32) -> Uuid {
    Uuid::from_u128(((uuid as u128) << 96) | BLUETOOTH_BASE_UUID)
}

/// Identifies a peripheral, service, characteristic or descriptor.
///
/// A `BluetoothId` always holds the full 128-bit form. The 16-bit and 32-bit short forms assigned by the Bluetooth
/// SIG are expanded into the [Bluetooth Base UUID][BLUETOOTH_BASE_UUID] on construction, so an identifier built from
/// `"180F"` compares and hashes equal to one built from `"0000180F-0000-1000-8000-00805F9B34FB"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize), serde(transparent))]
pub struct BluetoothId(Uuid);

impl BluetoothId {
    /// Creates an identifier from a full 128-bit UUID
    pub const fn new(uuid: Uuid) -> Self {
        BluetoothId(uuid)
    }

    /// Creates an identifier from a 16-bit Bluetooth UUID
    pub const fn from_u16(uuid: u16) -> Self {
        BluetoothId(bluetooth_uuid_from_u16(uuid))
    }

    /// Creates an identifier from a 32-bit Bluetooth UUID
    pub const fn from_u32(uuid: u32) -> Self {
        BluetoothId(bluetooth_uuid_from_u32(uuid))
    }

    /// Creates an identifier from a raw 128-bit value
    pub const fn from_u128(uuid: u128) -> Self {
        BluetoothId(Uuid::from_u128(uuid))
    }

    /// Creates a random (version 4) identifier
    pub fn random() -> Self {
        BluetoothId(Uuid::new_v4())
    }

    /// Creates an identifier from big-endian `bytes`.
    ///
    /// Returns `None` if `bytes.len()` is not one of 2, 4, or 16.
    pub fn from_bluetooth_bytes(bytes: &[u8]) -> Option<Self> {
        match bytes.len() {
            2 => Some(Self::from_u16(u16::from_be_bytes([bytes[0], bytes[1]]))),
            4 => Some(Self::from_u32(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))),
            16 => Uuid::from_slice(bytes).ok().map(BluetoothId),
            _ => None,
        }
    }

    /// The full 128-bit UUID
    pub const fn uuid(&self) -> Uuid {
        self.0
    }

    /// Returns `true` if self is a valid 16-bit Bluetooth UUID
    pub fn is_u16(&self) -> bool {
        self.try_to_u16().is_some()
    }

    /// Returns `true` if self is a valid 32-bit Bluetooth UUID
    pub fn is_u32(&self) -> bool {
        (self.0.as_u128() & BASE_MASK) == BLUETOOTH_BASE_UUID
    }

    /// Tries to convert self into a 16-bit Bluetooth UUID
    pub fn try_to_u16(&self) -> Option<u16> {
        self.try_to_u32().and_then(|x| x.try_into().ok())
    }

    /// Tries to convert self into a 32-bit Bluetooth UUID
    pub fn try_to_u32(&self) -> Option<u32> {
        self.is_u32().then(|| (self.0.as_u128() >> 96) as u32)
    }

    /// Returns the octets representing the identifier in its shortest form: 2 or 4 octets for 16- or 32-bit
    /// Bluetooth UUIDs, 16 octets otherwise.
    pub fn as_bluetooth_bytes(&self) -> Vec<u8> {
        if let Some(x) = self.try_to_u16() {
            x.to_be_bytes().to_vec()
        } else if let Some(x) = self.try_to_u32() {
            x.to_be_bytes().to_vec()
        } else {
            self.0.as_bytes().to_vec()
        }
    }
}

impl From<Uuid> for BluetoothId {
    fn from(uuid: Uuid) -> Self {
        BluetoothId(uuid)
    }
}

impl From<BluetoothId> for Uuid {
    fn from(id: BluetoothId) -> Self {
        id.0
    }
}

impl From<u16> for BluetoothId {
    fn from(uuid: u16) -> Self {
        BluetoothId::from_u16(uuid)
    }
}

impl From<u32> for BluetoothId {
    fn from(uuid: u32) -> Self {
        BluetoothId::from_u32(uuid)
    }
}

impl fmt::Display for BluetoothId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}", self.0.as_hyphenated())
    }
}

/// The string was not a valid Bluetooth identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidBluetoothId(String);

impl fmt::Display for InvalidBluetoothId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid Bluetooth identifier: {:?}", self.0)
    }
}

impl std::error::Error for InvalidBluetoothId {}

impl FromStr for BluetoothId {
    type Err = InvalidBluetoothId;

    /// Parses 4 hex digits as a 16-bit UUID, 8 hex digits as a 32-bit UUID, and anything else as a full UUID.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || InvalidBluetoothId(s.to_owned());
        let is_hex = s.bytes().all(|b| b.is_ascii_hexdigit());
        match s.len() {
            4 if is_hex => u16::from_str_radix(s, 16).map(Self::from_u16).map_err(|_| err()),
            8 if is_hex => u32::from_str_radix(s, 16).map(Self::from_u32).map_err(|_| err()),
            _ => Uuid::parse_str(s).map(BluetoothId).map_err(|_| err()),
        }
    }
}

/// Bluetooth GATT Service 16-bit UUIDs
#[allow(missing_docs)]
pub mod services {
    use super::BluetoothId;

    pub const GENERIC_ACCESS: BluetoothId = BluetoothId::from_u16(0x1800);
    pub const GENERIC_ATTRIBUTE: BluetoothId = BluetoothId::from_u16(0x1801);
    pub const IMMEDIATE_ALERT: BluetoothId = BluetoothId::from_u16(0x1802);
    pub const LINK_LOSS: BluetoothId = BluetoothId::from_u16(0x1803);
    pub const TX_POWER: BluetoothId = BluetoothId::from_u16(0x1804);
    pub const CURRENT_TIME: BluetoothId = BluetoothId::from_u16(0x1805);
    pub const GLUCOSE: BluetoothId = BluetoothId::from_u16(0x1808);
    pub const HEALTH_THERMOMETER: BluetoothId = BluetoothId::from_u16(0x1809);
    pub const DEVICE_INFORMATION: BluetoothId = BluetoothId::from_u16(0x180a);
    pub const HEART_RATE: BluetoothId = BluetoothId::from_u16(0x180d);
    pub const BATTERY: BluetoothId = BluetoothId::from_u16(0x180f);
    pub const BLOOD_PRESSURE: BluetoothId = BluetoothId::from_u16(0x1810);
    pub const HUMAN_INTERFACE_DEVICE: BluetoothId = BluetoothId::from_u16(0x1812);
    pub const CYCLING_SPEED_AND_CADENCE: BluetoothId = BluetoothId::from_u16(0x1816);
    pub const ENVIRONMENTAL_SENSING: BluetoothId = BluetoothId::from_u16(0x181a);
    pub const FITNESS_MACHINE: BluetoothId = BluetoothId::from_u16(0x1826);
}

/// Bluetooth GATT Characteristic 16-bit UUIDs
#[allow(missing_docs)]
pub mod characteristics {
    use super::BluetoothId;

    pub const DEVICE_NAME: BluetoothId = BluetoothId::from_u16(0x2a00);
    pub const APPEARANCE: BluetoothId = BluetoothId::from_u16(0x2a01);
    pub const SERVICE_CHANGED: BluetoothId = BluetoothId::from_u16(0x2a05);
    pub const ALERT_LEVEL: BluetoothId = BluetoothId::from_u16(0x2a06);
    pub const TX_POWER_LEVEL: BluetoothId = BluetoothId::from_u16(0x2a07);
    pub const BATTERY_LEVEL: BluetoothId = BluetoothId::from_u16(0x2a19);
    pub const SYSTEM_ID: BluetoothId = BluetoothId::from_u16(0x2a23);
    pub const MODEL_NUMBER_STRING: BluetoothId = BluetoothId::from_u16(0x2a24);
    pub const SERIAL_NUMBER_STRING: BluetoothId = BluetoothId::from_u16(0x2a25);
    pub const FIRMWARE_REVISION_STRING: BluetoothId = BluetoothId::from_u16(0x2a26);
    pub const HARDWARE_REVISION_STRING: BluetoothId = BluetoothId::from_u16(0x2a27);
    pub const SOFTWARE_REVISION_STRING: BluetoothId = BluetoothId::from_u16(0x2a28);
    pub const MANUFACTURER_NAME_STRING: BluetoothId = BluetoothId::from_u16(0x2a29);
    pub const CURRENT_TIME: BluetoothId = BluetoothId::from_u16(0x2a2b);
    pub const HEART_RATE_MEASUREMENT: BluetoothId = BluetoothId::from_u16(0x2a37);
    pub const BODY_SENSOR_LOCATION: BluetoothId = BluetoothId::from_u16(0x2a38);
    pub const TEMPERATURE: BluetoothId = BluetoothId::from_u16(0x2a6e);
    pub const HUMIDITY: BluetoothId = BluetoothId::from_u16(0x2a6f);
}

/// Bluetooth GATT Descriptor 16-bit UUIDs
#[allow(missing_docs)]
pub mod descriptors {
    use super::BluetoothId;

    pub const CHARACTERISTIC_EXTENDED_PROPERTIES: BluetoothId = BluetoothId::from_u16(0x2900);
    pub const CHARACTERISTIC_USER_DESCRIPTION: BluetoothId = BluetoothId::from_u16(0x2901);
    pub const CLIENT_CHARACTERISTIC_CONFIGURATION: BluetoothId = BluetoothId::from_u16(0x2902);
    pub const SERVER_CHARACTERISTIC_CONFIGURATION: BluetoothId = BluetoothId::from_u16(0x2903);
    pub const CHARACTERISTIC_PRESENTATION_FORMAT: BluetoothId = BluetoothId::from_u16(0x2904);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_and_long_forms_are_equal() {
        let short16: BluetoothId = "180F".parse().unwrap();
        let short32: BluetoothId = "0000180F".parse().unwrap();
        let long: BluetoothId = "0000180f-0000-1000-8000-00805f9b34fb".parse().unwrap();

        assert_eq!(short16, short32);
        assert_eq!(short32, long);
        assert_eq!(short16, services::BATTERY);
        assert_eq!(BluetoothId::from_u32(0x180f), BluetoothId::from_u16(0x180f));
        assert_eq!(short16.try_to_u16(), Some(0x180f));
    }

    #[test]
    fn display_is_upper_case_long_form() {
        assert_eq!(services::BATTERY.to_string(), "0000180F-0000-1000-8000-00805F9B34FB");
    }

    #[test]
    fn bytes_use_shortest_form() {
        assert_eq!(services::BATTERY.as_bluetooth_bytes(), vec![0x18, 0x0f]);
        assert_eq!(BluetoothId::from_bluetooth_bytes(&[0x18, 0x0f]), Some(services::BATTERY));
        assert_eq!(BluetoothId::from_bluetooth_bytes(&[0x18, 0x0f, 0x00]), None);

        let custom: BluetoothId = "47F474A1-DD88-4251-8CFA-58E1C4DA1565".parse().unwrap();
        assert!(!custom.is_u32());
        assert_eq!(BluetoothId::from_bluetooth_bytes(&custom.as_bluetooth_bytes()), Some(custom));
    }

    #[test]
    fn rejects_garbage() {
        assert!("18G0".parse::<BluetoothId>().is_err());
        assert!("not a uuid".parse::<BluetoothId>().is_err());
    }
}
