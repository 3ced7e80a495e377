use crate::error::ErrorKind;
use crate::{BluetoothId, Characteristic, Error, Peripheral, PeripheralState, Result};

/// A GATT service of a remote [`Peripheral`]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Service {
    peripheral: Peripheral,
    id: BluetoothId,
}

impl Service {
    pub(crate) fn new(peripheral: Peripheral, id: BluetoothId) -> Self {
        Service { peripheral, id }
    }

    /// The identifier of this service's type
    pub fn id(&self) -> BluetoothId {
        self.id
    }

    /// The peripheral this service belongs to
    pub fn peripheral(&self) -> &Peripheral {
        &self.peripheral
    }

    /// The common name from the GATT registry, or a generic name built from the identifier
    pub fn name(&self) -> String {
        self.peripheral.0.registry.service_name(&self.id)
    }

    /// Returns `true` if this is a primary service. Invalidated services report `false`.
    pub fn is_primary(&self) -> bool {
        self.peripheral
            .record()
            .service_mut(self.id)
            .is_some_and(|x| x.primary)
    }

    /// Returns `true` once the peripheral no longer reports this service, for example after a disconnect.
    pub fn is_invalidated(&self) -> bool {
        self.peripheral.record().service_mut(self.id).is_none()
    }

    /// The characteristics discovered so far
    pub fn characteristics(&self) -> Vec<Characteristic> {
        let mut record = self.peripheral.record();
        match record.service_mut(self.id) {
            Some(service) => service
                .characteristics
                .iter()
                .map(|x| Characteristic::new(self.clone(), x.id, x.properties))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Finds a discovered characteristic by identifier
    pub fn characteristic(&self, id: &BluetoothId) -> Result<Characteristic> {
        let mut record = self.peripheral.record();
        let service = record
            .service_mut(self.id)
            .ok_or(ErrorKind::ServiceInvalidated(self.id))?;
        service
            .characteristic_mut(*id)
            .map(|x| Characteristic::new(self.clone(), x.id, x.properties))
            .ok_or_else(|| ErrorKind::CharacteristicNotFound(*id).into())
    }

    /// Discovers the characteristics listed in `characteristics`, or all of them if `characteristics` is empty.
    ///
    /// Fails with [`ErrorKind::ServiceInvalidated`] if the peripheral no longer reports this service and with
    /// [`ErrorKind::NotConnected`] if the peripheral is not connected. Resolves to every characteristic now known on
    /// the service.
    pub async fn discover_characteristics(&self, characteristics: &[BluetoothId]) -> Result<Vec<Characteristic>> {
        let shared = self.peripheral.manager()?;
        let pending = shared.dispatch(|_| {
            let mut record = self.peripheral.record();
            let connected = record.state == PeripheralState::Connected;
            let service = record
                .service_mut(self.id)
                .ok_or(ErrorKind::ServiceInvalidated(self.id))?;
            if !connected {
                return Err(Error::from(ErrorKind::NotConnected));
            }
            Ok(service.discover.begin())
        })?;
        shared
            .backend
            .discover_characteristics(&self.peripheral.id(), &self.id, characteristics);
        pending.wait().await
    }
}
