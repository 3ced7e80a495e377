use crate::backend::{CharacteristicInfo, DescriptorInfo, RemotePeripheral, ServiceInfo};
use crate::{AdvertisementData, BluetoothId, CharacteristicProperties};

/// A scripted remote peripheral seen by an [`EmulatedCentral`][super::EmulatedCentral]
#[derive(Debug, Clone, PartialEq)]
pub struct EmulatedPeripheral {
    #[allow(missing_docs)]
    pub id: BluetoothId,
    /// The GAP name reported on discovery
    pub name: Option<String>,
    /// The payload reported with each discovery
    pub advertisement: AdvertisementData,
    /// Signal strength in dBm reported on discovery and when read
    pub rssi: i16,
    /// Connection attempts to a non-connectable peripheral fail
    pub connectable: bool,
    #[allow(missing_docs)]
    pub services: Vec<EmulatedService>,
}

impl EmulatedPeripheral {
    /// Creates a connectable peripheral with no services.
    pub fn new(id: BluetoothId) -> Self {
        EmulatedPeripheral {
            id,
            name: None,
            advertisement: AdvertisementData::default(),
            rssi: -60,
            connectable: true,
            services: Vec::new(),
        }
    }

    /// Creates a peripheral with a random identifier.
    pub fn random() -> Self {
        Self::new(BluetoothId::random())
    }

    #[allow(missing_docs)]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[allow(missing_docs)]
    pub fn with_advertisement(mut self, advertisement: AdvertisementData) -> Self {
        self.advertisement = advertisement;
        self
    }

    #[allow(missing_docs)]
    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = rssi;
        self
    }

    #[allow(missing_docs)]
    pub fn with_service(mut self, service: EmulatedService) -> Self {
        self.services.push(service);
        self
    }

    /// Makes connection attempts fail.
    pub fn not_connectable(mut self) -> Self {
        self.connectable = false;
        self
    }

    pub(crate) fn remote(&self) -> RemotePeripheral {
        RemotePeripheral {
            id: self.id,
            name: self.name.clone(),
        }
    }

    /// Returns `true` if any of `services` is advertised or hosted by this peripheral.
    pub(crate) fn offers_any(&self, services: &[BluetoothId]) -> bool {
        self.advertisement.advertises_any(services) || self.services.iter().any(|x| services.contains(&x.id))
    }

    pub(crate) fn service(&self, id: &BluetoothId) -> Option<&EmulatedService> {
        self.services.iter().find(|x| x.id == *id)
    }

    pub(crate) fn characteristic_mut(
        &mut self,
        service: &BluetoothId,
        id: &BluetoothId,
    ) -> Option<&mut EmulatedCharacteristic> {
        self.services
            .iter_mut()
            .find(|x| x.id == *service)?
            .characteristics
            .iter_mut()
            .find(|x| x.id == *id)
    }
}

/// A GATT service hosted by an [`EmulatedPeripheral`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmulatedService {
    #[allow(missing_docs)]
    pub id: BluetoothId,
    #[allow(missing_docs)]
    pub primary: bool,
    #[allow(missing_docs)]
    pub characteristics: Vec<EmulatedCharacteristic>,
}

impl EmulatedService {
    /// Creates a primary service with no characteristics.
    pub fn new(id: BluetoothId) -> Self {
        EmulatedService {
            id,
            primary: true,
            characteristics: Vec::new(),
        }
    }

    /// Marks the service as secondary.
    pub fn secondary(mut self) -> Self {
        self.primary = false;
        self
    }

    #[allow(missing_docs)]
    pub fn with_characteristic(mut self, characteristic: EmulatedCharacteristic) -> Self {
        self.characteristics.push(characteristic);
        self
    }

    pub(crate) fn info(&self) -> ServiceInfo {
        ServiceInfo {
            id: self.id,
            primary: self.primary,
        }
    }
}

/// A GATT characteristic hosted by an [`EmulatedService`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmulatedCharacteristic {
    #[allow(missing_docs)]
    pub id: BluetoothId,
    #[allow(missing_docs)]
    pub properties: CharacteristicProperties,
    /// The value returned by reads, replaced by writes
    pub value: Option<Vec<u8>>,
    #[allow(missing_docs)]
    pub descriptors: Vec<EmulatedDescriptor>,
}

impl EmulatedCharacteristic {
    /// Creates a characteristic with no value.
    pub fn new(id: BluetoothId, properties: CharacteristicProperties) -> Self {
        EmulatedCharacteristic {
            id,
            properties,
            value: None,
            descriptors: Vec::new(),
        }
    }

    #[allow(missing_docs)]
    pub fn with_value(mut self, value: impl Into<Vec<u8>>) -> Self {
        self.value = Some(value.into());
        self
    }

    #[allow(missing_docs)]
    pub fn with_descriptor(mut self, descriptor: EmulatedDescriptor) -> Self {
        self.descriptors.push(descriptor);
        self
    }

    pub(crate) fn info(&self) -> CharacteristicInfo {
        CharacteristicInfo {
            id: self.id,
            properties: self.properties,
        }
    }

    pub(crate) fn descriptor_mut(&mut self, id: &BluetoothId) -> Option<&mut EmulatedDescriptor> {
        self.descriptors.iter_mut().find(|x| x.id == *id)
    }
}

/// A GATT descriptor of an [`EmulatedCharacteristic`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmulatedDescriptor {
    #[allow(missing_docs)]
    pub id: BluetoothId,
    #[allow(missing_docs)]
    pub value: Option<Vec<u8>>,
}

impl EmulatedDescriptor {
    #[allow(missing_docs)]
    pub fn new(id: BluetoothId) -> Self {
        EmulatedDescriptor { id, value: None }
    }

    #[allow(missing_docs)]
    pub fn with_value(mut self, value: impl Into<Vec<u8>>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub(crate) fn info(&self) -> DescriptorInfo {
        DescriptorInfo {
            id: self.id,
            value: self.value.clone(),
        }
    }
}
