#![warn(missing_docs)]

//! Blueshift is a reactive [Bluetooth Low Energy] (BLE) library for [Rust] covering both the GAP Central / GATT
//! Client role and the GAP Peripheral / GATT Server role.
//!
//! The platform Bluetooth stack is reached through a radio backend ([`CentralBackend`] and [`PeripheralBackend`]).
//! The [`emulation`] module provides a deterministic in-process backend for tests and demos.
//!
//! [Rust]: https://www.rust-lang.org/
//! [Bluetooth Low Energy]: https://www.bluetooth.com/specifications/specs/
//!
//! # Usage
//!
//! ```rust,no_run
//!# use blueshift::{CentralManager, Manager};
//!# use blueshift::emulation::{EmulatedCentral, EmulatedCentralConfig};
//!# use futures_lite::StreamExt;
//!# #[tokio::main]
//!# async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!let manager = CentralManager::new(EmulatedCentral::new(EmulatedCentralConfig::default(), Vec::new()));
//!manager.request_authorization();
//!manager.ensure_ready(true).await?;
//!
//!let mut scan = manager.scan(&[]);
//!while let Some(peripheral) = scan.next().await {
//!    let peripheral = peripheral?;
//!    println!("{} ({:?}dBm)", peripheral.name(), peripheral.rssi());
//!}
//!#
//!#    Ok(())
//!# }
//! ```
//!
//! # Overview
//!
//! - Central role:
//!   - [Scanning][CentralManager::scan] for peripherals and receiving advertisements
//!   - Finding [connected peripherals][CentralManager::connected_peripherals] and
//!     [retrieving][CentralManager::peripheral] known ones
//!   - [Connecting][Peripheral::connect] and [disconnecting][Peripheral::disconnect]
//!   - Discovering [services][Peripheral::discover_services],
//!     [characteristics][Service::discover_characteristics] and
//!     [descriptors][Characteristic::discover_descriptors]
//!   - [Read][Characteristic::read], [write][Characteristic::write] and [notify][Characteristic::notify]
//!     operations on remote characteristics
//! - Peripheral role:
//!   - [Advertising][PeripheralManager::begin_advertising] locally authored [services][MutableService]
//!   - Answering remote reads and writes through [characteristic handlers][CharacteristicHandler]
//!   - Pushing [value updates][MutableCharacteristic::set_value] to subscribed centrals
//!
//! # Connection lifecycle
//!
//! Every manager serializes backend events and caller operations through a single lock. Peripherals, services and
//! characteristics are cheap handles into that state. When a peripheral disconnects, every in-flight operation on it
//! fails with [`ErrorKind::NotConnected`][error::ErrorKind::NotConnected] and its services are cleared; handles held
//! by callers stay valid but report the entity as invalidated.
//!
//! All multi-step operations are futures or streams that issue their backend request when first polled. Dropping one
//! performs the matching compensating action: dropping a scan stops the scan, dropping a pending connect disconnects,
//! and dropping an [`Advertising`] future stops advertising.
//!
//! # Feature flags
//!
//! The `serde` feature enables serializing identifiers, states and emulator configurations, and loading emulator
//! configurations from the environment.

pub mod backend;
pub mod btuuid;
pub mod emulation;
pub mod error;
pub mod gatt;

mod central;
mod characteristic;
mod descriptor;
mod gatt_tree;
mod mutable;
mod observable;
mod peripheral;
mod scan;
mod server;
mod service;
mod util;

use std::collections::HashMap;

pub use backend::{CentralBackend, PeripheralBackend};
pub use btuuid::BluetoothId;
pub use central::{CentralManager, CentralManagerOptions};
pub use characteristic::{Characteristic, NotificationStream};
pub use descriptor::Descriptor;
pub use error::Error;
pub use gatt::{GattRegistry, GattSpecification};
pub use mutable::{CharacteristicHandler, MutableCharacteristic, MutableService};
pub use observable::ValueStream;
pub use peripheral::{Peripheral, RssiStream};
pub use scan::ScanStream;
pub use server::{Advertising, PeripheralManager};
pub use service::Service;

/// Convenience alias for a result with [`Error`]
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Power state of the local Bluetooth radio as reported by a backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize), serde(rename_all = "camelCase"))]
pub enum ManagerState {
    /// The state has not been reported yet
    #[default]
    Unknown,
    /// The connection with the system service was momentarily lost
    Resetting,
    /// The platform does not support Bluetooth Low Energy
    Unsupported,
    /// The application is not authorized to use Bluetooth
    Unauthorized,
    /// Bluetooth is powered off
    PoweredOff,
    /// Bluetooth is powered on and available
    PoweredOn,
}

impl ManagerState {
    /// Returns `true` while the state may still settle on [`ManagerState::PoweredOn`].
    pub fn is_transient(self) -> bool {
        matches!(self, ManagerState::Unknown | ManagerState::Resetting)
    }
}

/// Whether the application may use Bluetooth.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize), serde(rename_all = "camelCase"))]
pub enum ManagerAuthorization {
    /// The user has not been asked yet
    #[default]
    NotDetermined,
    /// Bluetooth use is restricted on this device
    Restricted,
    /// The user denied Bluetooth use
    Denied,
    /// The application may always use Bluetooth
    AllowedAlways,
}

/// Connection state of a remote [`Peripheral`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum PeripheralState {
    #[allow(missing_docs)]
    #[default]
    Disconnected,
    #[allow(missing_docs)]
    Connecting,
    #[allow(missing_docs)]
    Connected,
    #[allow(missing_docs)]
    Disconnecting,
}

/// Operations shared by the central and peripheral managers.
pub trait Manager {
    /// The current authorization of the application.
    fn authorization(&self) -> ManagerAuthorization;

    /// The current power state of the radio.
    fn state(&self) -> ManagerState;

    /// Lazily initializes the backend, which may prompt the user for permission.
    ///
    /// Calling this more than once has no further effect.
    fn request_authorization(&self);

    /// A stream of authorization values, starting with the current one.
    fn authorization_updates(&self) -> ValueStream<ManagerAuthorization>;

    /// A stream of power states, starting with the current one.
    fn state_updates(&self) -> ValueStream<ManagerState>;

    /// Returns `true` if the application is allowed to use Bluetooth at all times.
    fn is_authorized(&self) -> bool {
        self.authorization() == ManagerAuthorization::AllowedAlways
    }
}

/// Options for [`Peripheral::connect_with`].
///
/// These map to the connection alert options of platforms that show system alerts for background connections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ConnectOptions {
    /// Alert the user when the peripheral connects while the application is suspended
    pub notify_on_connection: bool,
    /// Alert the user when the peripheral disconnects while the application is suspended
    pub notify_on_disconnection: bool,
    /// Alert the user for all connection events while the application is suspended
    pub notify_on_all_events: bool,
}

impl ConnectOptions {
    /// Raw transmutation from [`u8`].
    pub fn from_bits(bits: u8) -> Self {
        ConnectOptions {
            notify_on_connection: (bits & (1 << 0)) != 0,
            notify_on_disconnection: (bits & (1 << 1)) != 0,
            notify_on_all_events: (bits & (1 << 2)) != 0,
        }
    }

    /// Raw transmutation to [`u8`].
    pub fn to_bits(self) -> u8 {
        u8::from(self.notify_on_connection)
            | (u8::from(self.notify_on_disconnection) << 1)
            | (u8::from(self.notify_on_all_events) << 2)
    }
}

/// Data included in a Bluetooth advertisement or scan reponse.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdvertisementData {
    /// The (possibly shortened) local name of the device (CSS §A.1.2)
    pub local_name: Option<String>,
    /// Manufacturer specific data (CSS §A.1.4)
    pub manufacturer_data: Option<ManufacturerData>,
    /// Transmitted power level (CSS §A.1.5)
    pub tx_power_level: Option<i16>,
    /// Whether the advertising packet is connectable, if reported
    pub is_connectable: Option<bool>,
    /// Service associated data (CSS §A.1.11)
    pub service_data: HashMap<BluetoothId, Vec<u8>>,
    /// Advertised GATT service UUIDs (CSS §A.1.1)
    pub services: Vec<BluetoothId>,
    /// Services found in the overflow area of the advertisement
    pub overflow_services: Vec<BluetoothId>,
    /// Service solicitation UUIDs (CSS §A.1.10)
    pub solicited_services: Vec<BluetoothId>,
}

impl AdvertisementData {
    /// Folds a newer advertisement into this one.
    ///
    /// Fields present in `newer` replace the stored ones. Absent fields and empty collections keep the stored value.
    pub fn merge(&mut self, newer: AdvertisementData) {
        if newer.local_name.is_some() {
            self.local_name = newer.local_name;
        }
        if newer.manufacturer_data.is_some() {
            self.manufacturer_data = newer.manufacturer_data;
        }
        if newer.tx_power_level.is_some() {
            self.tx_power_level = newer.tx_power_level;
        }
        if newer.is_connectable.is_some() {
            self.is_connectable = newer.is_connectable;
        }
        if !newer.service_data.is_empty() {
            self.service_data = newer.service_data;
        }
        if !newer.services.is_empty() {
            self.services = newer.services;
        }
        if !newer.overflow_services.is_empty() {
            self.overflow_services = newer.overflow_services;
        }
        if !newer.solicited_services.is_empty() {
            self.solicited_services = newer.solicited_services;
        }
    }

    /// Returns `true` if any of `services` appears in the advertised service lists or service data.
    pub fn advertises_any(&self, services: &[BluetoothId]) -> bool {
        services.iter().any(|id| {
            self.services.contains(id) || self.overflow_services.contains(id) || self.service_data.contains_key(id)
        })
    }
}

/// Manufacturer specific data included in Bluetooth advertisements. See the Bluetooth Core Specification Supplement
/// §A.1.4 for details.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ManufacturerData {
    /// Company identifier (defined [here](https://www.bluetooth.com/specifications/assigned-numbers/company-identifiers/))
    pub company_id: u16,
    /// Manufacturer specific data
    pub data: Vec<u8>,
}

/// GATT characteristic properties as defined in the Bluetooth Core Specification, Vol 3, Part G, §3.3.1.1, plus the
/// encryption requirements some platforms report alongside them.
#[allow(missing_docs)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CharacteristicProperties {
    pub broadcast: bool,
    pub read: bool,
    pub write_without_response: bool,
    pub write: bool,
    pub notify: bool,
    pub indicate: bool,
    pub authenticated_signed_writes: bool,
    pub extended_properties: bool,
    pub notify_encryption_required: bool,
    pub indicate_encryption_required: bool,
}

impl CharacteristicProperties {
    /// Raw transmutation from [`u32`].
    pub fn from_bits(bits: u32) -> Self {
        CharacteristicProperties {
            broadcast: (bits & (1 << 0)) != 0,
            read: (bits & (1 << 1)) != 0,
            write_without_response: (bits & (1 << 2)) != 0,
            write: (bits & (1 << 3)) != 0,
            notify: (bits & (1 << 4)) != 0,
            indicate: (bits & (1 << 5)) != 0,
            authenticated_signed_writes: (bits & (1 << 6)) != 0,
            extended_properties: (bits & (1 << 7)) != 0,
            notify_encryption_required: (bits & (1 << 8)) != 0,
            indicate_encryption_required: (bits & (1 << 9)) != 0,
        }
    }

    /// Raw transmutation to [`u32`].
    pub fn to_bits(self) -> u32 {
        u32::from(self.broadcast)
            | (u32::from(self.read) << 1)
            | (u32::from(self.write_without_response) << 2)
            | (u32::from(self.write) << 3)
            | (u32::from(self.notify) << 4)
            | (u32::from(self.indicate) << 5)
            | (u32::from(self.authenticated_signed_writes) << 6)
            | (u32::from(self.extended_properties) << 7)
            | (u32::from(self.notify_encryption_required) << 8)
            | (u32::from(self.indicate_encryption_required) << 9)
    }

    /// The characteristic value may be read.
    pub fn can_read(self) -> bool {
        self.read
    }

    /// The characteristic value may be written in some way.
    pub fn can_write(self) -> bool {
        self.write || self.write_without_response || self.authenticated_signed_writes
    }

    /// The characteristic supports notifications or indications.
    pub fn allows_subscription(self) -> bool {
        self.notify || self.indicate
    }

    /// Some access to the characteristic requires an encrypted link.
    pub fn requires_encryption(self) -> bool {
        self.notify_encryption_required || self.indicate_encryption_required || self.authenticated_signed_writes
    }

    /// The value may change outside of direct writes.
    pub fn is_mutable(self) -> bool {
        self.broadcast || self.extended_properties
    }
}

/// Access permissions of a locally served attribute.
#[allow(missing_docs)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AttributePermissions {
    pub readable: bool,
    pub writeable: bool,
    pub read_encryption_required: bool,
    pub write_encryption_required: bool,
}

impl AttributePermissions {
    /// Raw transmutation from [`u8`].
    pub fn from_bits(bits: u8) -> Self {
        AttributePermissions {
            readable: (bits & (1 << 0)) != 0,
            writeable: (bits & (1 << 1)) != 0,
            read_encryption_required: (bits & (1 << 2)) != 0,
            write_encryption_required: (bits & (1 << 3)) != 0,
        }
    }

    /// Raw transmutation to [`u8`].
    pub fn to_bits(self) -> u8 {
        u8::from(self.readable)
            | (u8::from(self.writeable) << 1)
            | (u8::from(self.read_encryption_required) << 2)
            | (u8::from(self.write_encryption_required) << 3)
    }
}
