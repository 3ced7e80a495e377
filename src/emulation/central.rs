use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use tracing::{debug, trace};

use super::device::{EmulatedCharacteristic, EmulatedPeripheral, EmulatedService};
use super::{EmulatedCentralConfig, ManagerEmulation};
use crate::backend::{
    CentralBackend, CentralEvent, CentralEventSink, CharacteristicInfo, CharacteristicPath, RemotePeripheral,
    ServiceInfo,
};
use crate::error::{BackendError, ErrorKind};
use crate::{
    BluetoothId, CentralManagerOptions, ConnectOptions, Error, ManagerAuthorization, ManagerState,
};

/// A request received by an [`EmulatedCentral`]
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioCall {
    Initialize,
    Scan(Vec<BluetoothId>),
    StopScan,
    Connect(BluetoothId),
    CancelConnection(BluetoothId),
    DiscoverServices(BluetoothId, Vec<BluetoothId>),
    DiscoverCharacteristics(BluetoothId, BluetoothId),
    DiscoverDescriptors(CharacteristicPath),
    ReadValue(CharacteristicPath),
    WriteValue {
        path: CharacteristicPath,
        value: Vec<u8>,
        with_response: bool,
    },
    SetNotify(CharacteristicPath, bool),
    ReadDescriptor(CharacteristicPath, BluetoothId),
    WriteDescriptor(CharacteristicPath, BluetoothId, Vec<u8>),
    ReadSignalStrength(BluetoothId),
}

/// An emulated central-role radio.
///
/// Requests are answered synchronously from the scripted peripherals, except scans with a non-zero emit rate and
/// delayed connections, which are answered from a background thread. A paced scan reports one peripheral per
/// interval and stops one interval after the last report. While [responding][Self::set_responding] is off
/// the answers are held back until [`EmulatedCentral::release_held`] is called.
///
/// Clones share the same radio, so a test keeps a clone to script the radio after handing one to a
/// [`CentralManager`][crate::CentralManager].
#[derive(Clone)]
pub struct EmulatedCentral(Arc<Mutex<CentralRadio>>);

struct CentralRadio {
    manager: ManagerEmulation,
    scan_interval: Duration,
    devices: Vec<Device>,
    sink: Option<CentralEventSink>,
    scan: Option<u64>,
    scan_filter: Vec<BluetoothId>,
    next_scan: u64,
    next_connect: u64,
    responding: bool,
    held: Vec<CentralEvent>,
    calls: Vec<RadioCall>,
}

struct Device {
    peripheral: EmulatedPeripheral,
    connected: bool,
    pending_connect: Option<u64>,
    known_services: Vec<BluetoothId>,
    known_characteristics: Vec<(BluetoothId, BluetoothId)>,
    notifying: Vec<(BluetoothId, BluetoothId)>,
}

impl Device {
    fn new(peripheral: EmulatedPeripheral) -> Self {
        Device {
            peripheral,
            connected: false,
            pending_connect: None,
            known_services: Vec::new(),
            known_characteristics: Vec::new(),
            notifying: Vec::new(),
        }
    }

    fn reset_link(&mut self) -> bool {
        let was_connected = std::mem::replace(&mut self.connected, false);
        self.pending_connect = None;
        self.known_services.clear();
        self.known_characteristics.clear();
        self.notifying.clear();
        was_connected
    }

    fn services(&self) -> Vec<ServiceInfo> {
        self.peripheral
            .services
            .iter()
            .filter(|x| self.known_services.contains(&x.id))
            .map(EmulatedService::info)
            .collect()
    }

    fn characteristics(&self, service: &EmulatedService) -> Vec<CharacteristicInfo> {
        service
            .characteristics
            .iter()
            .filter(|x| self.known_characteristics.contains(&(service.id, x.id)))
            .map(EmulatedCharacteristic::info)
            .collect()
    }
}

fn failure(kind: ErrorKind, message: &str) -> BackendError {
    Arc::new(Error::new(kind, None, message))
}

fn not_connected() -> BackendError {
    failure(ErrorKind::NotConnected, "peripheral is not connected")
}

fn discovered(peripheral: &EmulatedPeripheral) -> CentralEvent {
    CentralEvent::Discovered {
        peripheral: peripheral.remote(),
        advertisement: peripheral.advertisement.clone(),
        rssi: peripheral.rssi,
    }
}

fn deliver(sink: Option<CentralEventSink>, events: Vec<CentralEvent>) {
    let Some(sink) = sink else {
        return;
    };
    for event in events {
        sink.send(event);
    }
}

impl CentralRadio {
    fn device_mut(&mut self, id: &BluetoothId) -> Option<&mut Device> {
        self.devices.iter_mut().find(|x| x.peripheral.id == *id)
    }

    fn connected_mut(&mut self, id: &BluetoothId) -> Result<&mut Device, BackendError> {
        self.device_mut(id).filter(|x| x.connected).ok_or_else(not_connected)
    }

    fn characteristic_mut(&mut self, path: &CharacteristicPath) -> Result<&mut EmulatedCharacteristic, BackendError> {
        self.connected_mut(&path.peripheral)?
            .peripheral
            .characteristic_mut(&path.service, &path.characteristic)
            .ok_or_else(|| Arc::new(Error::from(ErrorKind::CharacteristicNotFound(path.characteristic))) as BackendError)
    }

    fn complete_connect(&mut self, id: BluetoothId) -> Vec<CentralEvent> {
        let error = match self.device_mut(&id) {
            None => failure(ErrorKind::NotConnected, "unknown peripheral"),
            Some(device) if !device.peripheral.connectable => {
                device.pending_connect = None;
                failure(ErrorKind::NotConnected, "peripheral is not connectable")
            }
            Some(device) => {
                device.connected = true;
                device.pending_connect = None;
                return vec![CentralEvent::Connected { peripheral: id }];
            }
        };
        vec![CentralEvent::ConnectFailed {
            peripheral: id,
            error: Some(error),
        }]
    }
}

impl EmulatedCentral {
    /// Creates a radio hosting `peripherals`.
    pub fn new(config: EmulatedCentralConfig, peripherals: Vec<EmulatedPeripheral>) -> Self {
        EmulatedCentral(Arc::new(Mutex::new(CentralRadio {
            manager: ManagerEmulation::new(&config.manager),
            scan_interval: config.scan_interval(),
            devices: peripherals.into_iter().map(Device::new).collect(),
            sink: None,
            scan: None,
            scan_filter: Vec::new(),
            next_scan: 0,
            next_connect: 0,
            responding: true,
            held: Vec::new(),
            calls: Vec::new(),
        })))
    }

    fn lock(&self) -> MutexGuard<'_, CentralRadio> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `f` under the radio lock and delivers the events it returns once the lock is released.
    fn run(&self, call: Option<RadioCall>, holdable: bool, f: impl FnOnce(&mut CentralRadio) -> Vec<CentralEvent>) {
        let (sink, events) = {
            let mut radio = self.lock();
            if let Some(call) = call {
                trace!(?call, "emulated central request");
                radio.calls.push(call);
            }
            let events = f(&mut radio);
            if holdable && !radio.responding {
                radio.held.extend(events);
                return;
            }
            (radio.sink.clone(), events)
        };
        deliver(sink, events);
    }

    fn respond(&self, call: RadioCall, f: impl FnOnce(&mut CentralRadio) -> Vec<CentralEvent>) {
        self.run(Some(call), true, f)
    }

    fn script(&self, f: impl FnOnce(&mut CentralRadio) -> Vec<CentralEvent>) {
        self.run(None, false, f)
    }

    /// Delivers one scan result if scan `generation` is still running.
    fn emit_scan(&self, generation: u64, event: CentralEvent) -> bool {
        // The strong handle is taken first and released last, so a manager dropped meanwhile is torn down after the
        // radio lock is released.
        let Some(shared) = self.lock().sink.as_ref().and_then(|x| x.0.upgrade()) else {
            return false;
        };
        let mut radio = self.lock();
        if radio.scan != Some(generation) {
            return false;
        }
        if matches!(event, CentralEvent::ScanStopped) {
            radio.scan = None;
        }
        shared.handle_event(event);
        true
    }

    /// Every request received so far, oldest first
    pub fn calls(&self) -> Vec<RadioCall> {
        self.lock().calls.clone()
    }

    /// Forgets the recorded requests.
    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Turns answers to requests on or off. Answers produced while off are held.
    pub fn set_responding(&self, responding: bool) {
        self.lock().responding = responding;
    }

    /// Delivers every held answer in order. Returns how many were delivered.
    pub fn release_held(&self) -> usize {
        let (sink, events) = {
            let mut radio = self.lock();
            (radio.sink.clone(), std::mem::take(&mut radio.held))
        };
        let count = events.len();
        deliver(sink, events);
        count
    }

    /// Returns `true` while a scan is running.
    pub fn is_scanning(&self) -> bool {
        self.lock().scan.is_some()
    }

    /// Returns `true` if `peripheral` is connected.
    pub fn is_connected(&self, peripheral: &BluetoothId) -> bool {
        self.lock().device_mut(peripheral).is_some_and(|x| x.connected)
    }

    /// Returns `true` if notifications are on for the characteristic at `path`.
    pub fn is_notifying(&self, path: &CharacteristicPath) -> bool {
        self.lock()
            .device_mut(&path.peripheral)
            .is_some_and(|x| x.notifying.contains(&(path.service, path.characteristic)))
    }

    /// Changes the radio state. Leaving the powered on state stops scanning and drops every connection.
    pub fn set_state(&self, state: ManagerState) {
        self.script(|radio| {
            radio.manager.state = state;
            let mut events = vec![CentralEvent::StateChanged(state)];
            if state != ManagerState::PoweredOn {
                radio.scan = None;
                for device in &mut radio.devices {
                    if device.reset_link() {
                        events.push(CentralEvent::Disconnected {
                            peripheral: device.peripheral.id,
                            error: Some(not_connected()),
                        });
                    }
                }
            }
            events
        });
    }

    /// Changes the authorization.
    pub fn set_authorization(&self, authorization: ManagerAuthorization) {
        self.script(|radio| {
            radio.manager.authorization = authorization;
            vec![CentralEvent::AuthorizationChanged(authorization)]
        });
    }

    /// Adds `peripheral` to the radio, or replaces the scripted device with the same identifier. If a scan for it is
    /// running, it is reported again.
    pub fn advertise(&self, peripheral: EmulatedPeripheral) {
        self.script(|radio| {
            let scanning = radio.scan.is_some()
                && (radio.scan_filter.is_empty() || peripheral.offers_any(&radio.scan_filter));
            let event = discovered(&peripheral);
            match radio.device_mut(&peripheral.id) {
                Some(device) => device.peripheral = peripheral,
                None => radio.devices.push(Device::new(peripheral)),
            }
            if scanning {
                vec![event]
            } else {
                Vec::new()
            }
        });
    }

    /// Drops the connection to `peripheral` as if the link was lost. Returns `false` if it was not connected.
    pub fn disconnect_peripheral(&self, peripheral: &BluetoothId, error: Option<BackendError>) -> bool {
        let mut was_connected = false;
        self.script(|radio| {
            was_connected = radio.device_mut(peripheral).is_some_and(Device::reset_link);
            if !was_connected {
                return Vec::new();
            }
            vec![CentralEvent::Disconnected {
                peripheral: *peripheral,
                error,
            }]
        });
        was_connected
    }

    /// Replaces the value of the characteristic at `path` and notifies it if notifications are on.
    ///
    /// Returns `false` if nothing was notified.
    pub fn notify_value(&self, path: &CharacteristicPath, value: Vec<u8>) -> bool {
        let mut notified = false;
        self.script(|radio| {
            let Some(device) = radio.device_mut(&path.peripheral) else {
                return Vec::new();
            };
            let notifying = device.connected && device.notifying.contains(&(path.service, path.characteristic));
            let Some(characteristic) = device.peripheral.characteristic_mut(&path.service, &path.characteristic) else {
                return Vec::new();
            };
            characteristic.value = Some(value.clone());
            if !notifying {
                return Vec::new();
            }
            notified = true;
            vec![CentralEvent::CharacteristicValueUpdated {
                path: *path,
                value: Some(value),
                error: None,
            }]
        });
        notified
    }

    /// Replaces the services of `peripheral`, reporting the change if it is connected.
    pub fn modify_services(&self, peripheral: &BluetoothId, services: Vec<EmulatedService>) {
        self.script(|radio| {
            let Some(device) = radio.device_mut(peripheral) else {
                return Vec::new();
            };
            device.peripheral.services = services;
            let hosted: Vec<BluetoothId> = device.peripheral.services.iter().map(|x| x.id).collect();
            device.known_services.retain(|x| hosted.contains(x));
            device.known_characteristics.retain(|(service, _)| hosted.contains(service));
            device.notifying.retain(|(service, _)| hosted.contains(service));
            if !device.connected {
                return Vec::new();
            }
            vec![CentralEvent::ServicesModified {
                peripheral: *peripheral,
                services: device.services(),
            }]
        });
    }

    /// Changes the signal strength reported for `peripheral`.
    pub fn set_rssi(&self, peripheral: &BluetoothId, rssi: i16) {
        if let Some(device) = self.lock().device_mut(peripheral) {
            device.peripheral.rssi = rssi;
        }
    }
}

impl CentralBackend for EmulatedCentral {
    fn state(&self) -> ManagerState {
        self.lock().manager.state
    }

    fn authorization(&self) -> ManagerAuthorization {
        self.lock().manager.authorization
    }

    fn attach(&self, events: CentralEventSink) {
        self.lock().sink = Some(events);
    }

    fn initialize(&self, options: &CentralManagerOptions) {
        debug!(?options, "initializing emulated central");
        self.run(Some(RadioCall::Initialize), false, |radio| {
            match radio.manager.request_authorization() {
                Some((authorization, state)) => vec![
                    CentralEvent::AuthorizationChanged(authorization),
                    CentralEvent::StateChanged(state),
                ],
                None => Vec::new(),
            }
        });
    }

    fn scan(&self, services: &[BluetoothId], _allow_duplicates: bool) {
        let (generation, interval, found) = {
            let mut radio = self.lock();
            radio.calls.push(RadioCall::Scan(services.to_vec()));
            radio.next_scan += 1;
            radio.scan = Some(radio.next_scan);
            radio.scan_filter = services.to_vec();
            let found: Vec<CentralEvent> = radio
                .devices
                .iter()
                .filter(|x| services.is_empty() || x.peripheral.offers_any(services))
                .map(|x| discovered(&x.peripheral))
                .collect();
            (radio.next_scan, radio.scan_interval, found)
        };
        debug!("emulated scan {} reports {} peripherals", generation, found.len());

        if interval.is_zero() {
            for event in found {
                self.emit_scan(generation, event);
            }
            self.emit_scan(generation, CentralEvent::ScanStopped);
            return;
        }

        let radio = self.clone();
        thread::spawn(move || {
            for event in found {
                thread::sleep(interval);
                if !radio.emit_scan(generation, event) {
                    return;
                }
            }
            thread::sleep(interval);
            radio.emit_scan(generation, CentralEvent::ScanStopped);
        });
    }

    fn stop_scan(&self) {
        let mut radio = self.lock();
        radio.calls.push(RadioCall::StopScan);
        radio.scan = None;
    }

    fn retrieve_peripherals(&self, ids: &[BluetoothId]) -> Vec<RemotePeripheral> {
        self.lock()
            .devices
            .iter()
            .filter(|x| ids.contains(&x.peripheral.id))
            .map(|x| x.peripheral.remote())
            .collect()
    }

    fn retrieve_connected_peripherals(&self, services: &[BluetoothId]) -> Vec<RemotePeripheral> {
        self.lock()
            .devices
            .iter()
            .filter(|x| x.peripheral.services.iter().any(|s| services.contains(&s.id)))
            .map(|x| x.peripheral.remote())
            .collect()
    }

    fn connect(&self, peripheral: &BluetoothId, options: ConnectOptions, delay: Option<Duration>) {
        let id = *peripheral;
        trace!(?options, "connect options");
        let Some(delay) = delay.filter(|x| !x.is_zero()) else {
            self.respond(RadioCall::Connect(id), |radio| radio.complete_connect(id));
            return;
        };

        let attempt = {
            let mut radio = self.lock();
            radio.calls.push(RadioCall::Connect(id));
            radio.next_connect += 1;
            let attempt = radio.next_connect;
            if let Some(device) = radio.device_mut(&id) {
                device.pending_connect = Some(attempt);
            }
            attempt
        };
        let radio = self.clone();
        thread::spawn(move || {
            thread::sleep(delay);
            radio.script(|radio| {
                let cancelled = radio
                    .device_mut(&id)
                    .is_some_and(|x| x.pending_connect != Some(attempt));
                if cancelled {
                    Vec::new()
                } else {
                    radio.complete_connect(id)
                }
            });
        });
    }

    fn cancel_connection(&self, peripheral: &BluetoothId) {
        self.run(Some(RadioCall::CancelConnection(*peripheral)), false, |radio| {
            // a cancelled attempt never completes
            radio
                .held
                .retain(|x| !matches!(x, CentralEvent::Connected { peripheral: held } if held == peripheral));
            if !radio.device_mut(peripheral).is_some_and(Device::reset_link) {
                return Vec::new();
            }
            vec![CentralEvent::Disconnected {
                peripheral: *peripheral,
                error: None,
            }]
        });
    }

    fn discover_services(&self, peripheral: &BluetoothId, services: &[BluetoothId]) {
        let id = *peripheral;
        self.respond(RadioCall::DiscoverServices(id, services.to_vec()), |radio| {
            let result = radio.connected_mut(&id).map(|device| {
                for service in &device.peripheral.services {
                    let wanted = services.is_empty() || services.contains(&service.id);
                    if wanted && !device.known_services.contains(&service.id) {
                        device.known_services.push(service.id);
                    }
                }
                device.services()
            });
            let (services, error) = match result {
                Ok(services) => (services, None),
                Err(err) => (Vec::new(), Some(err)),
            };
            vec![CentralEvent::ServicesDiscovered {
                peripheral: id,
                services,
                error,
            }]
        });
    }

    fn discover_characteristics(&self, peripheral: &BluetoothId, service: &BluetoothId, characteristics: &[BluetoothId]) {
        let (id, service_id) = (*peripheral, *service);
        self.respond(RadioCall::DiscoverCharacteristics(id, service_id), |radio| {
            let result = radio.connected_mut(&id).and_then(|device| {
                let service = device
                    .peripheral
                    .service(&service_id)
                    .filter(|_| device.known_services.contains(&service_id))
                    .ok_or_else(|| Arc::new(Error::from(ErrorKind::ServiceNotFound(service_id))) as BackendError)?;
                for characteristic in &service.characteristics {
                    let key = (service_id, characteristic.id);
                    let wanted = characteristics.is_empty() || characteristics.contains(&characteristic.id);
                    if wanted && !device.known_characteristics.contains(&key) {
                        device.known_characteristics.push(key);
                    }
                }
                Ok(device.characteristics(service))
            });
            let (characteristics, error) = match result {
                Ok(characteristics) => (characteristics, None),
                Err(err) => (Vec::new(), Some(err)),
            };
            vec![CentralEvent::CharacteristicsDiscovered {
                peripheral: id,
                service: service_id,
                characteristics,
                error,
            }]
        });
    }

    fn discover_descriptors(&self, path: &CharacteristicPath) {
        let path = *path;
        self.respond(RadioCall::DiscoverDescriptors(path), |radio| {
            let (descriptors, error) = match radio.characteristic_mut(&path) {
                Ok(characteristic) => (characteristic.descriptors.iter().map(|x| x.info()).collect(), None),
                Err(err) => (Vec::new(), Some(err)),
            };
            vec![CentralEvent::DescriptorsDiscovered {
                path,
                descriptors,
                error,
            }]
        });
    }

    fn read_value(&self, path: &CharacteristicPath) {
        let path = *path;
        self.respond(RadioCall::ReadValue(path), |radio| {
            let (value, error) = match radio.characteristic_mut(&path) {
                Ok(characteristic) => (Some(characteristic.value.clone().unwrap_or_default()), None),
                Err(err) => (None, Some(err)),
            };
            vec![CentralEvent::CharacteristicValueUpdated { path, value, error }]
        });
    }

    fn write_value(&self, path: &CharacteristicPath, value: &[u8], with_response: bool) {
        let path = *path;
        let call = RadioCall::WriteValue {
            path,
            value: value.to_vec(),
            with_response,
        };
        self.respond(call, |radio| {
            let error = radio
                .characteristic_mut(&path)
                .map(|characteristic| characteristic.value = Some(value.to_vec()))
                .err();
            if with_response {
                vec![CentralEvent::CharacteristicValueWritten { path, error }]
            } else {
                Vec::new()
            }
        });
    }

    fn set_notify(&self, path: &CharacteristicPath, enabled: bool) {
        let path = *path;
        self.respond(RadioCall::SetNotify(path, enabled), |radio| {
            let key = (path.service, path.characteristic);
            let error = radio.characteristic_mut(&path).err();
            if error.is_none() {
                if let Some(device) = radio.device_mut(&path.peripheral) {
                    device.notifying.retain(|x| *x != key);
                    if enabled {
                        device.notifying.push(key);
                    }
                }
            }
            vec![CentralEvent::NotificationStateChanged { path, enabled, error }]
        });
    }

    fn read_descriptor(&self, path: &CharacteristicPath, descriptor: &BluetoothId) {
        let (path, descriptor) = (*path, *descriptor);
        self.respond(RadioCall::ReadDescriptor(path, descriptor), |radio| {
            let result = radio.characteristic_mut(&path).and_then(|characteristic| {
                characteristic
                    .descriptor_mut(&descriptor)
                    .map(|x| x.value.clone().unwrap_or_default())
                    .ok_or_else(|| failure(ErrorKind::Undefined, "descriptor not found"))
            });
            let (value, error) = match result {
                Ok(value) => (Some(value), None),
                Err(err) => (None, Some(err)),
            };
            vec![CentralEvent::DescriptorValueUpdated {
                path,
                descriptor,
                value,
                error,
            }]
        });
    }

    fn write_descriptor(&self, path: &CharacteristicPath, descriptor: &BluetoothId, value: &[u8]) {
        let (path, descriptor) = (*path, *descriptor);
        self.respond(RadioCall::WriteDescriptor(path, descriptor, value.to_vec()), |radio| {
            let error = radio
                .characteristic_mut(&path)
                .and_then(|characteristic| {
                    characteristic
                        .descriptor_mut(&descriptor)
                        .map(|x| x.value = Some(value.to_vec()))
                        .ok_or_else(|| failure(ErrorKind::Undefined, "descriptor not found"))
                })
                .err();
            vec![CentralEvent::DescriptorValueWritten {
                path,
                descriptor,
                error,
            }]
        });
    }

    fn read_signal_strength(&self, peripheral: &BluetoothId) {
        let id = *peripheral;
        self.respond(RadioCall::ReadSignalStrength(id), |radio| {
            let (rssi, error) = match radio.connected_mut(&id) {
                Ok(device) => (device.peripheral.rssi, None),
                Err(err) => (0, Some(err)),
            };
            vec![CentralEvent::SignalStrengthRead {
                peripheral: id,
                rssi,
                error,
            }]
        });
    }
}

impl std::fmt::Debug for EmulatedCentral {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let radio = self.lock();
        f.debug_struct("EmulatedCentral")
            .field("state", &radio.manager.state)
            .field("authorization", &radio.manager.authorization)
            .field("peripherals", &radio.devices.len())
            .field("scanning", &radio.scan.is_some())
            .finish()
    }
}
