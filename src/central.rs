use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_channel::Sender;
use futures_lite::StreamExt;
use tracing::{debug, info, trace, warn};

use crate::backend::{CentralBackend, CentralEvent, CentralEventSink, CharacteristicPath, RemotePeripheral};
use crate::error::{BackendError, ErrorKind};
use crate::gatt_tree::PeripheralRecord;
use crate::observable::Observable;
use crate::{
    AdvertisementData, BluetoothId, Error, GattRegistry, Manager, ManagerAuthorization, ManagerState, Peripheral,
    PeripheralState, Result, ScanStream, ValueStream,
};

/// Options passed to the backend when a [`CentralManager`] is initialized
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CentralManagerOptions {
    /// Ask the system to warn the user if Bluetooth is powered off when the manager starts
    pub show_power_alert: bool,
    /// Identifier used by platforms that restore central managers across application launches
    pub restore_identifier: Option<String>,
}

/// The central role: scans for, retrieves and connects to remote peripherals.
///
/// `CentralManager` is a cheap handle; clones share the same state. Dropping the last clone stops any scan and
/// disconnects every tracked peripheral.
#[derive(Clone)]
pub struct CentralManager(pub(crate) Arc<CentralShared>);

pub(crate) struct CentralShared {
    pub(crate) backend: Arc<dyn CentralBackend>,
    pub(crate) registry: GattRegistry,
    options: CentralManagerOptions,
    core: Mutex<CentralCore>,
}

pub(crate) struct CentralCore {
    initialized: bool,
    pub(crate) state: Observable<ManagerState>,
    authorization: Observable<ManagerAuthorization>,
    scanning: Observable<bool>,
    peripherals: Vec<Peripheral>,
    /// Forgotten peripherals whose link is still up
    detached: Vec<Peripheral>,
    scan: Option<ScanSession>,
    next_scan: u64,
}

struct ScanSession {
    id: u64,
    sender: Sender<Result<Peripheral>>,
}

/// What starting a scan session displaced
pub(crate) struct ScanStart {
    pub(crate) session: u64,
    pub(crate) receiver: async_channel::Receiver<Result<Peripheral>>,
    pub(crate) replaced_scan: bool,
}

impl CentralManager {
    /// Creates a manager driving `backend` with the standard GATT registry and default options.
    pub fn new(backend: impl CentralBackend) -> Self {
        Self::with_options(backend, GattRegistry::new(), CentralManagerOptions::default())
    }

    /// Creates a manager driving `backend`.
    pub fn with_options(backend: impl CentralBackend, registry: GattRegistry, options: CentralManagerOptions) -> Self {
        let backend: Arc<dyn CentralBackend> = Arc::new(backend);
        let core = CentralCore {
            initialized: false,
            state: Observable::new(backend.state()),
            authorization: Observable::new(backend.authorization()),
            scanning: Observable::new(false),
            peripherals: Vec::new(),
            detached: Vec::new(),
            scan: None,
            next_scan: 0,
        };
        let shared = Arc::new(CentralShared {
            backend,
            registry,
            options,
            core: Mutex::new(core),
        });
        shared.backend.attach(CentralEventSink(Arc::downgrade(&shared)));
        CentralManager(shared)
    }

    /// The registry used to name services and characteristics
    pub fn registry(&self) -> &GattRegistry {
        &self.0.registry
    }

    /// Returns `true` while a scan is running.
    pub fn is_scanning(&self) -> bool {
        self.0.dispatch(|core| *core.scanning.get())
    }

    /// A stream of the scanning flag, starting with the current value.
    pub fn scanning_updates(&self) -> ValueStream<bool> {
        self.0.dispatch(|core| core.scanning.subscribe())
    }

    /// Every peripheral currently tracked, in discovery order.
    pub fn peripherals(&self) -> Vec<Peripheral> {
        self.0.dispatch(|core| core.peripherals.clone())
    }

    /// Scans for peripherals advertising any of `services`, or for all peripherals if `services` is empty.
    ///
    /// Nothing happens until the stream is first polled: an unpolled stream leaves any running scan and the tracked
    /// peripherals untouched. While the radio state is unknown or resetting the stream waits; any other state except
    /// powered on ends it with [`ErrorKind::NotPoweredOn`].
    ///
    /// Once started, the scan ends the previous scan stream without error and forgets every previously discovered
    /// peripheral. Forgotten handles are stale and cannot connect again, but a link that is already up keeps working
    /// until it goes down. Each newly seen peripheral is yielded once; repeated advertisements update it in place.
    ///
    /// Dropping the stream stops the scan.
    pub fn scan(&self, services: &[BluetoothId]) -> ScanStream {
        ScanStream::new(self.clone(), services.to_vec())
    }

    /// Stops the current scan. Its stream ends without error.
    pub fn stop_scan(&self) {
        let stopped = self.0.dispatch(|core| core.terminate_scan(None));
        if stopped {
            info!("scan stopped");
            self.0.backend.stop_scan();
        }
    }

    /// Finds a peripheral by identifier, asking the backend if it is not already tracked.
    pub fn peripheral(&self, id: &BluetoothId) -> Option<Peripheral> {
        if let Some(peripheral) = self.0.dispatch(|core| core.find(id)) {
            return Some(peripheral);
        }

        let remote = self.0.backend.retrieve_peripherals(std::slice::from_ref(id)).into_iter().next()?;
        if remote.id != *id {
            warn!("backend returned {} when asked for {}", remote.id, id);
            return None;
        }
        Some(self.0.dispatch(|core| core.track(&self.0, remote).0))
    }

    /// Peripherals the platform reports as connected that expose any of `services`.
    ///
    /// The peripherals are added to the tracked set without disturbing peripherals already in it.
    pub fn connected_peripherals(&self, services: &[BluetoothId]) -> Vec<Peripheral> {
        let remotes = self.0.backend.retrieve_connected_peripherals(services);
        self.0.dispatch(|core| {
            remotes
                .into_iter()
                .map(|remote| core.track(&self.0, remote).0)
                .collect()
        })
    }

    /// Waits until the radio is powered on.
    ///
    /// If `wait_for_powered_on` is false, or once the state settles on something other than powered on, fails with
    /// the error matching the current state.
    pub async fn ensure_ready(&self, wait_for_powered_on: bool) -> Result<()> {
        ensure_ready(self.state_updates(), wait_for_powered_on).await
    }
}

impl Manager for CentralManager {
    fn authorization(&self) -> ManagerAuthorization {
        self.0.dispatch(|core| *core.authorization.get())
    }

    fn state(&self) -> ManagerState {
        self.0.dispatch(|core| *core.state.get())
    }

    fn request_authorization(&self) {
        let first = self.0.dispatch(|core| !std::mem::replace(&mut core.initialized, true));
        if first {
            debug!("initializing central backend");
            self.0.backend.initialize(&self.0.options);
        }
    }

    fn authorization_updates(&self) -> ValueStream<ManagerAuthorization> {
        self.0.dispatch(|core| core.authorization.subscribe())
    }

    fn state_updates(&self) -> ValueStream<ManagerState> {
        self.0.dispatch(|core| core.state.subscribe())
    }
}

impl std::fmt::Debug for CentralManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("CentralManager").finish()
    }
}

/// Maps a settled manager state to the error an operation needing a powered-on radio reports.
pub(crate) fn state_error(state: ManagerState) -> Option<Error> {
    let kind = match state {
        ManagerState::PoweredOn => return None,
        ManagerState::Unknown | ManagerState::Resetting => ErrorKind::UnknownState,
        ManagerState::Unsupported => ErrorKind::NotSupported,
        ManagerState::Unauthorized => ErrorKind::NotAuthorized,
        ManagerState::PoweredOff => ErrorKind::NotPoweredOn,
    };
    Some(kind.into())
}

pub(crate) async fn ensure_ready(mut states: ValueStream<ManagerState>, wait_for_powered_on: bool) -> Result<()> {
    while let Some(state) = states.next().await {
        if state == ManagerState::PoweredOn {
            return Ok(());
        }
        if !wait_for_powered_on || !state.is_transient() {
            return Err(state_error(state).unwrap_or_else(|| ErrorKind::UnknownState.into()));
        }
    }
    Err(ErrorKind::UnknownState.into())
}

impl CentralShared {
    /// Runs `f` inside the manager's serialization domain.
    pub(crate) fn dispatch<R>(&self, f: impl FnOnce(&mut CentralCore) -> R) -> R {
        let mut core: MutexGuard<'_, CentralCore> = self.core.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut core)
    }

    pub(crate) fn begin_scan(self: &Arc<Self>) -> ScanStart {
        self.dispatch(|core| {
            let replaced_scan = core.terminate_scan(None);
            core.forget_peripherals();

            let (sender, receiver) = async_channel::unbounded();
            core.next_scan += 1;
            core.scan = Some(ScanSession {
                id: core.next_scan,
                sender,
            });
            core.scanning.set(true);
            ScanStart {
                session: core.next_scan,
                receiver,
                replaced_scan,
            }
        })
    }

    /// Ends scan `session` if it is still the active one. Returns `true` if the backend scan must be stopped.
    pub(crate) fn end_scan(&self, session: u64) -> bool {
        self.dispatch(|core| core.scan.as_ref().is_some_and(|x| x.id == session) && core.terminate_scan(None))
    }

    pub(crate) fn handle_event(self: &Arc<Self>, event: CentralEvent) {
        trace!(?event, "central event");
        match event {
            CentralEvent::StateChanged(state) => {
                info!("manager state changed to {:?}", state);
                self.dispatch(|core| {
                    core.state.set(state);
                    match state {
                        ManagerState::PoweredOff => {
                            core.terminate_scan(Some(Error::new(ErrorKind::NotConnected, None, "radio powered off")));
                        }
                        s if s == ManagerState::PoweredOn || s.is_transient() => {}
                        _ => {
                            core.terminate_scan(Some(ErrorKind::NotPoweredOn.into()));
                        }
                    }
                });
            }
            CentralEvent::AuthorizationChanged(authorization) => {
                info!("manager authorization changed to {:?}", authorization);
                self.dispatch(|core| core.authorization.set(authorization));
            }
            CentralEvent::Discovered {
                peripheral,
                advertisement,
                rssi,
            } => self.dispatch(|core| core.handle_discovery(self, peripheral, advertisement, rssi)),
            CentralEvent::ScanStopped => {
                debug!("backend stopped scanning");
                self.dispatch(|core| core.terminate_scan(None));
            }
            CentralEvent::Connected { peripheral } => {
                let known = self.with_record(&peripheral, |record| {
                    info!("connected to {}", peripheral);
                    record.handle_connected();
                });
                if known.is_none() {
                    warn!("connected to untracked peripheral {}, cancelling", peripheral);
                    self.backend.cancel_connection(&peripheral);
                }
            }
            CentralEvent::ConnectFailed { peripheral, error } => {
                warn!("failed to connect to {}: {:?}", peripheral, error);
                self.with_record(&peripheral, |record| record.handle_disconnected(link_lost(error, "connection failed")));
                self.dispatch(CentralCore::release_detached);
            }
            CentralEvent::Disconnected { peripheral, error } => {
                match &error {
                    Some(err) => warn!("{} disconnected: {}", peripheral, err),
                    None => info!("{} disconnected", peripheral),
                }
                self.with_record(&peripheral, |record| record.handle_disconnected(link_lost(error, "disconnected")));
                self.dispatch(CentralCore::release_detached);
            }
            CentralEvent::ServicesDiscovered {
                peripheral,
                services,
                error,
            } => {
                self.with_peripheral(&peripheral, |handle, record| match error {
                    Some(err) => {
                        record.discover_services.fail(Error::from_backend(err));
                    }
                    None => {
                        let services = record.apply_services(handle, services);
                        debug!("{} has {} services", handle.id(), services.len());
                        record.discover_services.resolve(Ok(services));
                    }
                });
            }
            CentralEvent::ServicesModified { peripheral, services } => {
                self.with_peripheral(&peripheral, |handle, record| {
                    debug!("{} modified its services", handle.id());
                    record.apply_services(handle, services);
                });
            }
            CentralEvent::CharacteristicsDiscovered {
                peripheral,
                service,
                characteristics,
                error,
            } => {
                self.with_peripheral(&peripheral, |handle, record| {
                    let Some(record) = record.service_mut(service) else {
                        return;
                    };
                    match error {
                        Some(err) => {
                            record.discover.fail(Error::from_backend(err));
                        }
                        None => {
                            let service = crate::Service::new(handle.clone(), service);
                            let characteristics = record.apply_characteristics(&service, characteristics);
                            record.discover.resolve(Ok(characteristics));
                        }
                    }
                });
            }
            CentralEvent::CharacteristicValueUpdated { path, value, error } => {
                self.with_characteristic(&path, |record| record.handle_value(value, error.map(Error::from_backend)));
            }
            CentralEvent::CharacteristicValueWritten { path, error } => {
                self.with_characteristic(&path, |record| {
                    record.write.resolve(backend_result(error));
                });
            }
            CentralEvent::NotificationStateChanged { path, enabled, error } => {
                self.with_characteristic(&path, |record| match error {
                    Some(err) => {
                        record.notify.fail(Error::from_backend(err));
                    }
                    None => {
                        record.notifying = enabled;
                        record.notify.resolve(Ok(enabled));
                    }
                });
            }
            CentralEvent::DescriptorsDiscovered {
                path,
                descriptors,
                error,
            } => {
                self.with_peripheral(&path.peripheral, |handle, record| {
                    let Some(record) = record.characteristic_at(&path) else {
                        return;
                    };
                    match error {
                        Some(err) => {
                            record.discover.fail(Error::from_backend(err));
                        }
                        None => {
                            let characteristic = crate::Characteristic::new(
                                crate::Service::new(handle.clone(), path.service),
                                path.characteristic,
                                record.properties,
                            );
                            let descriptors = record.apply_descriptors(&characteristic, descriptors);
                            record.discover.resolve(Ok(descriptors));
                        }
                    }
                });
            }
            CentralEvent::DescriptorValueUpdated {
                path,
                descriptor,
                value,
                error,
            } => {
                self.with_characteristic(&path, |record| {
                    let Some(record) = record.descriptor_mut(descriptor) else {
                        return;
                    };
                    if value.is_some() {
                        record.value = value.clone();
                    }
                    let result = match error {
                        Some(err) => Err(Error::from_backend(err)),
                        None => Ok(value.unwrap_or_default()),
                    };
                    record.read.resolve(result);
                });
            }
            CentralEvent::DescriptorValueWritten {
                path,
                descriptor,
                error,
            } => {
                self.with_characteristic(&path, |record| {
                    if let Some(record) = record.descriptor_mut(descriptor) {
                        record.write.resolve(backend_result(error));
                    }
                });
            }
            CentralEvent::SignalStrengthRead { peripheral, rssi, error } => {
                self.with_record(&peripheral, |record| match error {
                    Some(err) => {
                        if let Some((_, sender)) = &record.rssi_session {
                            let _ = sender.try_send(Err(Error::from_backend(err)));
                        }
                    }
                    None => record.record_rssi(rssi),
                });
            }
        }
    }

    fn with_peripheral<R>(&self, id: &BluetoothId, f: impl FnOnce(&Peripheral, &mut PeripheralRecord) -> R) -> Option<R> {
        self.dispatch(|core| {
            let peripheral = core.route(id)?;
            let mut record = peripheral.record();
            Some(f(&peripheral, &mut *record))
        })
    }

    fn with_record<R>(&self, id: &BluetoothId, f: impl FnOnce(&mut PeripheralRecord) -> R) -> Option<R> {
        self.with_peripheral(id, |_, record| f(record))
    }

    fn with_characteristic(&self, path: &CharacteristicPath, f: impl FnOnce(&mut crate::gatt_tree::CharacteristicRecord)) {
        self.with_record(&path.peripheral, |record| {
            if let Some(record) = record.characteristic_at(path) {
                f(record);
            }
        });
    }
}

impl Drop for CentralShared {
    fn drop(&mut self) {
        let core = self.core.get_mut().unwrap_or_else(PoisonError::into_inner);
        let scanning = core.terminate_scan(None);
        let linked: Vec<BluetoothId> = core
            .peripherals
            .drain(..)
            .chain(core.detached.drain(..))
            .filter(|x| x.record().disconnect())
            .map(|x| x.id())
            .collect();
        if scanning {
            self.backend.stop_scan();
        }
        for id in linked {
            self.backend.cancel_connection(&id);
        }
    }
}

impl CentralCore {
    pub(crate) fn find(&self, id: &BluetoothId) -> Option<Peripheral> {
        self.peripherals.iter().find(|x| x.id() == *id).cloned()
    }

    /// Returns the tracked peripheral for `remote`, creating it if needed. The flag is `true` for a new peripheral.
    fn track(&mut self, shared: &Arc<CentralShared>, remote: RemotePeripheral) -> (Peripheral, bool) {
        if let Some(peripheral) = self.find(&remote.id) {
            if remote.name.is_some() {
                peripheral.record().name = remote.name;
            }
            return (peripheral, false);
        }
        let peripheral = Peripheral::new(remote.id, remote.name, shared);
        self.peripherals.push(peripheral.clone());
        (peripheral, true)
    }

    fn handle_discovery(
        &mut self,
        shared: &Arc<CentralShared>,
        remote: RemotePeripheral,
        advertisement: AdvertisementData,
        rssi: i16,
    ) {
        if self.scan.is_none() {
            debug!("ignoring advertisement from {} received outside of a scan", remote.id);
            return;
        }

        let (peripheral, new) = self.track(shared, remote);
        {
            let mut record = peripheral.record();
            record.advertisement.merge(advertisement);
            record.record_rssi(rssi);
        }

        if new {
            debug!("discovered {}", peripheral.id());
            if let Some(scan) = &self.scan {
                let _ = scan.sender.try_send(Ok(peripheral));
            }
        }
    }

    /// Ends the active scan, failing its stream with `error` if given. Returns `false` if no scan was active.
    fn terminate_scan(&mut self, error: Option<Error>) -> bool {
        let Some(scan) = self.scan.take() else {
            return false;
        };
        if let Some(err) = error {
            warn!("scan terminated: {}", err);
            let _ = scan.sender.try_send(Err(err));
        }
        self.scanning.set(false);
        true
    }

    /// Drops every tracked peripheral, marking the handles stale. Links that are still up stay with their handles.
    fn forget_peripherals(&mut self) {
        self.release_detached();
        for peripheral in self.peripherals.drain(..) {
            let mut record = peripheral.record();
            record.stale = true;
            if record.state != PeripheralState::Disconnected {
                drop(record);
                self.detached.push(peripheral);
            }
        }
    }

    /// Forgets detached peripherals whose link has gone down.
    fn release_detached(&mut self) {
        self.detached.retain(|x| x.record().state != PeripheralState::Disconnected);
    }

    /// The peripheral that receives backend events for `id`. A tracked peripheral wins unless it is idle while a
    /// detached one still holds the link.
    fn route(&self, id: &BluetoothId) -> Option<Peripheral> {
        let tracked = self.find(id);
        if tracked
            .as_ref()
            .is_some_and(|x| x.record().state != PeripheralState::Disconnected)
        {
            return tracked;
        }
        self.detached.iter().find(|x| x.id() == *id).cloned().or(tracked)
    }
}

fn link_lost(cause: Option<BackendError>, message: &str) -> Error {
    Error::new(ErrorKind::NotConnected, cause, message)
}

fn backend_result(error: Option<BackendError>) -> Result<()> {
    match error {
        Some(err) => Err(Error::from_backend(err)),
        None => Ok(()),
    }
}
