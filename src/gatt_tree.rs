//! Per-peripheral GATT state owned by a central manager.
//!
//! Records live inside the peripheral's mutex and are only mutated while the manager lock is held. Handles given to
//! callers (`Service`, `Characteristic`, `Descriptor`) locate their record by identifier on every access.

use async_channel::Sender;

use crate::backend::{CharacteristicInfo, CharacteristicPath, DescriptorInfo, ServiceInfo};
use crate::error::ErrorKind;
use crate::observable::Observable;
use crate::util::Pending;
use crate::{
    AdvertisementData, BluetoothId, Characteristic, CharacteristicProperties, Descriptor, Error, Peripheral,
    PeripheralState, Result, Service,
};

/// Something the backend reports as a set, reconciled by identifier.
pub(crate) trait Reconcile {
    type Info;

    fn id(&self) -> BluetoothId;
    fn info_id(info: &Self::Info) -> BluetoothId;
    fn create(info: Self::Info) -> Self;
    fn refresh(&mut self, info: Self::Info);
    fn invalidate(&mut self);
}

/// Brings `owned` in line with `reported`: entries missing from `reported` are invalidated and removed, entries
/// present in both are refreshed in place, and new entries are appended in reported order.
pub(crate) fn reconcile<R: Reconcile>(owned: &mut Vec<R>, reported: Vec<R::Info>) {
    let reported_ids: Vec<BluetoothId> = reported.iter().map(R::info_id).collect();
    owned.retain_mut(|record| {
        let keep = reported_ids.contains(&record.id());
        if !keep {
            record.invalidate();
        }
        keep
    });

    for info in reported {
        let id = R::info_id(&info);
        match owned.iter_mut().find(|x| x.id() == id) {
            Some(record) => record.refresh(info),
            None => owned.push(R::create(info)),
        }
    }
}

pub(crate) struct PeripheralRecord {
    pub name: Option<String>,
    pub advertisement: AdvertisementData,
    pub rssi: Option<i16>,
    pub state: PeripheralState,
    pub connected: Observable<bool>,
    pub stale: bool,
    pub services: Vec<ServiceRecord>,
    pub connect: Pending<()>,
    pub discover_services: Pending<Vec<Service>>,
    pub rssi_session: Option<(u64, Sender<Result<i16>>)>,
    next_rssi_session: u64,
}

impl PeripheralRecord {
    pub fn new(name: Option<String>) -> Self {
        PeripheralRecord {
            name,
            advertisement: AdvertisementData::default(),
            rssi: None,
            state: PeripheralState::Disconnected,
            connected: Observable::new(false),
            stale: false,
            services: Vec::new(),
            connect: Pending::new(),
            discover_services: Pending::new(),
            rssi_session: None,
            next_rssi_session: 0,
        }
    }

    pub fn service_mut(&mut self, id: BluetoothId) -> Option<&mut ServiceRecord> {
        self.services.iter_mut().find(|x| x.id == id)
    }

    pub fn characteristic_mut(&mut self, service: BluetoothId, id: BluetoothId) -> Option<&mut CharacteristicRecord> {
        self.service_mut(service)?.characteristic_mut(id)
    }

    pub fn characteristic_at(&mut self, path: &CharacteristicPath) -> Option<&mut CharacteristicRecord> {
        self.characteristic_mut(path.service, path.characteristic)
    }

    pub fn record_rssi(&mut self, rssi: i16) {
        self.rssi = Some(rssi);
        if let Some((_, sender)) = &self.rssi_session {
            let _ = sender.try_send(Ok(rssi));
        }
    }

    /// Starts a new RSSI session, ending the previous one. Returns the session id and its receiving end.
    pub fn begin_rssi_session(&mut self) -> (u64, async_channel::Receiver<Result<i16>>) {
        let (sender, receiver) = async_channel::unbounded();
        if let Some(rssi) = self.rssi {
            let _ = sender.try_send(Ok(rssi));
        }
        self.next_rssi_session += 1;
        self.rssi_session = Some((self.next_rssi_session, sender));
        (self.next_rssi_session, receiver)
    }

    pub fn end_rssi_session(&mut self, session: u64) {
        if self.rssi_session.as_ref().is_some_and(|(id, _)| *id == session) {
            self.rssi_session = None;
        }
    }

    pub fn handle_connected(&mut self) {
        self.state = PeripheralState::Connected;
        self.connected.set(true);
        self.connect.resolve(Ok(()));
    }

    /// Fails every in-flight operation with `err`, clears the services and marks the peripheral disconnected.
    pub fn handle_disconnected(&mut self, err: Error) {
        self.connect.fail(err.clone());
        self.discover_services.fail(err.clone());
        for service in &mut self.services {
            service.handle_disconnect(&err);
        }
        self.services.clear();
        self.state = PeripheralState::Disconnected;
        self.connected.set(false);
    }

    /// Local half of a caller-requested disconnect. Returns `true` if the backend connection must be cancelled.
    pub fn disconnect(&mut self) -> bool {
        let previous = self.state;
        self.handle_disconnected(Error::new(ErrorKind::NotConnected, None, "disconnected"));
        match previous {
            PeripheralState::Disconnected => false,
            PeripheralState::Connecting => true,
            PeripheralState::Connected | PeripheralState::Disconnecting => {
                self.state = PeripheralState::Disconnecting;
                true
            }
        }
    }

    pub fn apply_services(&mut self, peripheral: &Peripheral, services: Vec<ServiceInfo>) -> Vec<Service> {
        reconcile(&mut self.services, services);
        self.services
            .iter()
            .map(|x| Service::new(peripheral.clone(), x.id))
            .collect()
    }
}

pub(crate) struct ServiceRecord {
    pub id: BluetoothId,
    pub primary: bool,
    pub characteristics: Vec<CharacteristicRecord>,
    pub discover: Pending<Vec<Characteristic>>,
}

impl ServiceRecord {
    pub fn characteristic_mut(&mut self, id: BluetoothId) -> Option<&mut CharacteristicRecord> {
        self.characteristics.iter_mut().find(|x| x.id == id)
    }

    fn handle_disconnect(&mut self, err: &Error) {
        self.discover.fail(err.clone());
        for characteristic in &mut self.characteristics {
            characteristic.handle_disconnect(err);
        }
    }

    pub fn apply_characteristics(&mut self, service: &Service, characteristics: Vec<CharacteristicInfo>) -> Vec<Characteristic> {
        reconcile(&mut self.characteristics, characteristics);
        self.characteristics
            .iter()
            .map(|x| Characteristic::new(service.clone(), x.id, x.properties))
            .collect()
    }
}

impl Reconcile for ServiceRecord {
    type Info = ServiceInfo;

    fn id(&self) -> BluetoothId {
        self.id
    }

    fn info_id(info: &ServiceInfo) -> BluetoothId {
        info.id
    }

    fn create(info: ServiceInfo) -> Self {
        ServiceRecord {
            id: info.id,
            primary: info.primary,
            characteristics: Vec::new(),
            discover: Pending::new(),
        }
    }

    fn refresh(&mut self, info: ServiceInfo) {
        self.primary = info.primary;
    }

    fn invalidate(&mut self) {
        self.discover.fail(ErrorKind::ServiceInvalidated(self.id).into());
        for characteristic in &mut self.characteristics {
            characteristic.invalidate();
        }
    }
}

pub(crate) struct CharacteristicRecord {
    pub id: BluetoothId,
    pub properties: CharacteristicProperties,
    pub value: Observable<Option<Vec<u8>>>,
    pub notifying: bool,
    /// Live `NotificationStream`s
    pub streams: usize,
    pub read: Pending<Vec<u8>>,
    pub write: Pending<()>,
    pub notify: Pending<bool>,
    pub descriptors: Vec<DescriptorRecord>,
    pub discover: Pending<Vec<Descriptor>>,
}

impl CharacteristicRecord {
    pub fn descriptor_mut(&mut self, id: BluetoothId) -> Option<&mut DescriptorRecord> {
        self.descriptors.iter_mut().find(|x| x.id == id)
    }

    fn fail_all(&mut self, err: &Error) {
        self.read.fail(err.clone());
        self.write.fail(err.clone());
        self.notify.fail(err.clone());
        self.discover.fail(err.clone());
        for descriptor in &mut self.descriptors {
            descriptor.read.fail(err.clone());
            descriptor.write.fail(err.clone());
        }
    }

    fn handle_disconnect(&mut self, err: &Error) {
        self.fail_all(err);
        self.notifying = false;
    }

    pub fn handle_value(&mut self, value: Option<Vec<u8>>, error: Option<Error>) {
        if let Some(value) = &value {
            self.value.publish(Some(value.clone()));
        }
        let result = match error {
            Some(err) => Err(err),
            None => Ok(value.unwrap_or_default()),
        };
        self.read.resolve(result);
    }

    pub fn apply_descriptors(&mut self, characteristic: &Characteristic, descriptors: Vec<DescriptorInfo>) -> Vec<Descriptor> {
        reconcile(&mut self.descriptors, descriptors);
        self.descriptors
            .iter()
            .map(|x| Descriptor::new(characteristic.clone(), x.id))
            .collect()
    }
}

impl Reconcile for CharacteristicRecord {
    type Info = CharacteristicInfo;

    fn id(&self) -> BluetoothId {
        self.id
    }

    fn info_id(info: &CharacteristicInfo) -> BluetoothId {
        info.id
    }

    fn create(info: CharacteristicInfo) -> Self {
        CharacteristicRecord {
            id: info.id,
            properties: info.properties,
            value: Observable::new(None),
            notifying: false,
            streams: 0,
            read: Pending::new(),
            write: Pending::new(),
            notify: Pending::new(),
            descriptors: Vec::new(),
            discover: Pending::new(),
        }
    }

    fn refresh(&mut self, info: CharacteristicInfo) {
        self.properties = info.properties;
    }

    fn invalidate(&mut self) {
        self.fail_all(&ErrorKind::CharacteristicInvalidated(self.id).into());
    }
}

pub(crate) struct DescriptorRecord {
    pub id: BluetoothId,
    pub value: Option<Vec<u8>>,
    pub read: Pending<Vec<u8>>,
    pub write: Pending<()>,
}

impl Reconcile for DescriptorRecord {
    type Info = DescriptorInfo;

    fn id(&self) -> BluetoothId {
        self.id
    }

    fn info_id(info: &DescriptorInfo) -> BluetoothId {
        info.id
    }

    fn create(info: DescriptorInfo) -> Self {
        DescriptorRecord {
            id: info.id,
            value: info.value,
            read: Pending::new(),
            write: Pending::new(),
        }
    }

    fn refresh(&mut self, info: DescriptorInfo) {
        if info.value.is_some() {
            self.value = info.value;
        }
    }

    fn invalidate(&mut self) {
        let err = Error::new(ErrorKind::Undefined, None, format!("descriptor {} has been invalidated", self.id));
        self.read.fail(err.clone());
        self.write.fail(err);
    }
}
