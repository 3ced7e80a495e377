//! The radio backend contract
//!
//! Managers drive a backend through the [`CentralBackend`] and [`PeripheralBackend`] traits. Requests are fire and
//! forget: the backend reports their completion, along with unsolicited radio activity, by sending a
//! [`CentralEvent`] or [`PeripheralEvent`] through the sink handed to it in `attach`.
//!
//! Managers never hold their internal lock while calling into a backend, so a backend may deliver events from inside a
//! request (synchronously) as well as from its own threads.

use std::sync::Weak;
use std::time::Duration;

use crate::central::CentralShared;
use crate::error::{AttError, BackendError};
use crate::server::ServerShared;
use crate::{
    AdvertisementData, BluetoothId, CentralManagerOptions, CharacteristicProperties, ConnectOptions,
    ManagerAuthorization, ManagerState, MutableService,
};

/// A remote peripheral as known to the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePeripheral {
    /// The stable identifier of the peripheral
    pub id: BluetoothId,
    /// The GAP name of the peripheral, if known
    pub name: Option<String>,
}

/// A service reported by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceInfo {
    #[allow(missing_docs)]
    pub id: BluetoothId,
    /// Whether this is a primary service
    pub primary: bool,
}

/// A characteristic reported by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacteristicInfo {
    #[allow(missing_docs)]
    pub id: BluetoothId,
    #[allow(missing_docs)]
    pub properties: CharacteristicProperties,
}

/// A descriptor reported by the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorInfo {
    #[allow(missing_docs)]
    pub id: BluetoothId,
    /// The cached value, if the backend has one
    pub value: Option<Vec<u8>>,
}

/// Locates a characteristic on a remote peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicPath {
    #[allow(missing_docs)]
    pub peripheral: BluetoothId,
    #[allow(missing_docs)]
    pub service: BluetoothId,
    #[allow(missing_docs)]
    pub characteristic: BluetoothId,
}

/// Events delivered by a [`CentralBackend`]
#[allow(missing_docs)]
#[derive(Debug, Clone)]
pub enum CentralEvent {
    StateChanged(ManagerState),
    AuthorizationChanged(ManagerAuthorization),
    /// An advertisement was received during a scan
    Discovered {
        peripheral: RemotePeripheral,
        advertisement: AdvertisementData,
        rssi: i16,
    },
    /// The backend stopped scanning on its own
    ScanStopped,
    Connected {
        peripheral: BluetoothId,
    },
    ConnectFailed {
        peripheral: BluetoothId,
        error: Option<BackendError>,
    },
    Disconnected {
        peripheral: BluetoothId,
        error: Option<BackendError>,
    },
    /// Service discovery completed. `services` is every service currently known on the peripheral.
    ServicesDiscovered {
        peripheral: BluetoothId,
        services: Vec<ServiceInfo>,
        error: Option<BackendError>,
    },
    /// The peripheral changed its GATT database. `services` is what remains.
    ServicesModified {
        peripheral: BluetoothId,
        services: Vec<ServiceInfo>,
    },
    /// Characteristic discovery completed. `characteristics` is every characteristic currently known on the service.
    CharacteristicsDiscovered {
        peripheral: BluetoothId,
        service: BluetoothId,
        characteristics: Vec<CharacteristicInfo>,
        error: Option<BackendError>,
    },
    /// A read completed or a notification arrived
    CharacteristicValueUpdated {
        path: CharacteristicPath,
        value: Option<Vec<u8>>,
        error: Option<BackendError>,
    },
    CharacteristicValueWritten {
        path: CharacteristicPath,
        error: Option<BackendError>,
    },
    NotificationStateChanged {
        path: CharacteristicPath,
        enabled: bool,
        error: Option<BackendError>,
    },
    DescriptorsDiscovered {
        path: CharacteristicPath,
        descriptors: Vec<DescriptorInfo>,
        error: Option<BackendError>,
    },
    DescriptorValueUpdated {
        path: CharacteristicPath,
        descriptor: BluetoothId,
        value: Option<Vec<u8>>,
        error: Option<BackendError>,
    },
    DescriptorValueWritten {
        path: CharacteristicPath,
        descriptor: BluetoothId,
        error: Option<BackendError>,
    },
    SignalStrengthRead {
        peripheral: BluetoothId,
        rssi: i16,
        error: Option<BackendError>,
    },
}

/// The sending half a [`CentralBackend`] uses to deliver [`CentralEvent`]s to its manager.
///
/// Sending after the manager has been dropped does nothing.
#[derive(Clone)]
pub struct CentralEventSink(pub(crate) Weak<CentralShared>);

impl CentralEventSink {
    /// Delivers `event` to the manager. Handling is complete when this returns.
    pub fn send(&self, event: CentralEvent) {
        if let Some(shared) = self.0.upgrade() {
            shared.handle_event(event);
        }
    }

    /// Returns `true` once the manager has been dropped.
    pub fn is_closed(&self) -> bool {
        self.0.strong_count() == 0
    }
}

impl std::fmt::Debug for CentralEventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CentralEventSink").field("closed", &self.is_closed()).finish()
    }
}

/// The central-role radio.
pub trait CentralBackend: Send + Sync + 'static {
    /// The power state at the time the manager is created
    fn state(&self) -> ManagerState;
    /// The authorization at the time the manager is created
    fn authorization(&self) -> ManagerAuthorization;
    /// Hands the backend the sink for its events. Called once, when the manager is created.
    fn attach(&self, events: CentralEventSink);
    /// Starts the radio, possibly prompting the user for permission. Called at most once per manager.
    fn initialize(&self, options: &CentralManagerOptions);

    /// Starts scanning for peripherals advertising any of `services` (all peripherals if empty)
    fn scan(&self, services: &[BluetoothId], allow_duplicates: bool);
    #[allow(missing_docs)]
    fn stop_scan(&self);
    /// Looks up peripherals the platform already knows by identifier
    fn retrieve_peripherals(&self, ids: &[BluetoothId]) -> Vec<RemotePeripheral>;
    /// Looks up peripherals connected to the system that expose any of `services`
    fn retrieve_connected_peripherals(&self, services: &[BluetoothId]) -> Vec<RemotePeripheral>;

    /// Connects to `peripheral`, optionally waiting `delay` before starting
    fn connect(&self, peripheral: &BluetoothId, options: ConnectOptions, delay: Option<Duration>);
    /// Cancels a pending or established connection
    fn cancel_connection(&self, peripheral: &BluetoothId);

    #[allow(missing_docs)]
    fn discover_services(&self, peripheral: &BluetoothId, services: &[BluetoothId]);
    #[allow(missing_docs)]
    fn discover_characteristics(&self, peripheral: &BluetoothId, service: &BluetoothId, characteristics: &[BluetoothId]);
    #[allow(missing_docs)]
    fn discover_descriptors(&self, path: &CharacteristicPath);

    #[allow(missing_docs)]
    fn read_value(&self, path: &CharacteristicPath);
    /// Writes `value`. A [`CentralEvent::CharacteristicValueWritten`] is expected only when `with_response` is set.
    fn write_value(&self, path: &CharacteristicPath, value: &[u8], with_response: bool);
    #[allow(missing_docs)]
    fn set_notify(&self, path: &CharacteristicPath, enabled: bool);
    #[allow(missing_docs)]
    fn read_descriptor(&self, path: &CharacteristicPath, descriptor: &BluetoothId);
    #[allow(missing_docs)]
    fn write_descriptor(&self, path: &CharacteristicPath, descriptor: &BluetoothId, value: &[u8]);
    #[allow(missing_docs)]
    fn read_signal_strength(&self, peripheral: &BluetoothId);
}

/// A read or write request from a remote central
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttRequest {
    /// Identifies the request when responding
    pub id: u64,
    /// The remote central
    pub central: BluetoothId,
    /// The local characteristic being accessed
    pub characteristic: BluetoothId,
    #[allow(missing_docs)]
    pub offset: usize,
    /// The value being written, for write requests
    pub value: Option<Vec<u8>>,
}

/// Events delivered by a [`PeripheralBackend`]
#[allow(missing_docs)]
#[derive(Debug, Clone)]
pub enum PeripheralEvent {
    StateChanged(ManagerState),
    AuthorizationChanged(ManagerAuthorization),
    AdvertisingStarted {
        error: Option<BackendError>,
    },
    ServicePublished {
        service: BluetoothId,
        error: Option<BackendError>,
    },
    CentralSubscribed {
        central: BluetoothId,
        characteristic: BluetoothId,
    },
    CentralUnsubscribed {
        central: BluetoothId,
        characteristic: BluetoothId,
    },
    ReadRequested(AttRequest),
    /// A batch of writes, to be answered one by one
    WriteRequested(Vec<AttRequest>),
}

/// The sending half a [`PeripheralBackend`] uses to deliver [`PeripheralEvent`]s to its manager.
#[derive(Clone)]
pub struct PeripheralEventSink(pub(crate) Weak<ServerShared>);

impl PeripheralEventSink {
    /// Delivers `event` to the manager. Handling is complete when this returns.
    pub fn send(&self, event: PeripheralEvent) {
        if let Some(shared) = self.0.upgrade() {
            shared.handle_event(event);
        }
    }

    /// Returns `true` once the manager has been dropped.
    pub fn is_closed(&self) -> bool {
        self.0.strong_count() == 0
    }
}

impl std::fmt::Debug for PeripheralEventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeripheralEventSink").field("closed", &self.is_closed()).finish()
    }
}

/// The peripheral-role radio.
pub trait PeripheralBackend: Send + Sync + 'static {
    /// The power state at the time the manager is created
    fn state(&self) -> ManagerState;
    /// The authorization at the time the manager is created
    fn authorization(&self) -> ManagerAuthorization;
    /// Hands the backend the sink for its events. Called once, when the manager is created.
    fn attach(&self, events: PeripheralEventSink);
    /// Starts the radio, possibly prompting the user for permission. Called at most once per manager.
    fn initialize(&self);

    /// Adds `service` to the local GATT database
    fn publish(&self, service: &MutableService);
    /// Removes every published service
    fn remove_all_services(&self);
    #[allow(missing_docs)]
    fn start_advertising(&self, data: &AdvertisementData);
    #[allow(missing_docs)]
    fn stop_advertising(&self);

    /// Answers a [`PeripheralEvent::ReadRequested`]
    fn respond_to_read(&self, request: u64, value: Option<&[u8]>, result: AttError);
    /// Answers one request of a [`PeripheralEvent::WriteRequested`] batch
    fn respond_to_write(&self, request: u64, result: AttError);
    /// Sends a notification or indication carrying `value` to each of `subscribers`
    fn update_value(&self, value: &[u8], characteristic: &BluetoothId, subscribers: &[BluetoothId]);
}
