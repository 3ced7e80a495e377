use crate::gatt_tree::DescriptorRecord;
use crate::{BluetoothId, Characteristic, Error, Result};

use crate::error::ErrorKind;

/// A GATT descriptor of a remote characteristic
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Descriptor {
    characteristic: Characteristic,
    id: BluetoothId,
}

impl Descriptor {
    pub(crate) fn new(characteristic: Characteristic, id: BluetoothId) -> Self {
        Descriptor { characteristic, id }
    }

    /// The identifier of this descriptor's type
    pub fn id(&self) -> BluetoothId {
        self.id
    }

    /// The characteristic this descriptor belongs to
    pub fn characteristic(&self) -> &Characteristic {
        &self.characteristic
    }

    /// The cached value of this descriptor, if any
    pub fn value(&self) -> Option<Vec<u8>> {
        let path = self.characteristic.path();
        let mut record = self.characteristic.service().peripheral().record();
        record
            .characteristic_at(&path)?
            .descriptor_mut(self.id)?
            .value
            .clone()
    }

    fn begin<R>(&self, f: impl FnOnce(&mut DescriptorRecord) -> R) -> Result<(std::sync::Arc<crate::central::CentralShared>, R)> {
        let id = self.id;
        self.characteristic.with_record(|record| {
            record.descriptor_mut(id).map(f).ok_or_else(|| {
                Error::new(ErrorKind::Undefined, None, format!("descriptor {id} has been invalidated"))
            })
        })
    }

    /// Reads the value of this descriptor from the peripheral
    pub async fn read(&self) -> Result<Vec<u8>> {
        let (shared, pending) = self.begin(|record| record.read.begin())?;
        shared.backend.read_descriptor(&self.characteristic.path(), &self.id);
        pending.wait().await
    }

    /// Writes the value of this descriptor to the peripheral
    pub async fn write(&self, value: &[u8]) -> Result<()> {
        let (shared, pending) = self.begin(|record| record.write.begin())?;
        shared
            .backend
            .write_descriptor(&self.characteristic.path(), &self.id, value);
        pending.wait().await
    }
}
