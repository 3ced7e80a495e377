use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_core::Stream;
use tracing::debug;

use crate::backend::CharacteristicPath;
use crate::central::CentralShared;
use crate::error::ErrorKind;
use crate::gatt_tree::CharacteristicRecord;
use crate::{
    BluetoothId, CharacteristicProperties, Descriptor, Error, PeripheralState, Result, Service, ValueStream,
};

/// A GATT characteristic of a remote service
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Characteristic {
    service: Service,
    id: BluetoothId,
    properties: CharacteristicProperties,
}

impl Characteristic {
    pub(crate) fn new(service: Service, id: BluetoothId, properties: CharacteristicProperties) -> Self {
        Characteristic {
            service,
            id,
            properties,
        }
    }

    /// The identifier of this characteristic's type
    pub fn id(&self) -> BluetoothId {
        self.id
    }

    /// The service this characteristic belongs to
    pub fn service(&self) -> &Service {
        &self.service
    }

    /// The common name from the GATT registry, or a generic name built from the identifier
    pub fn name(&self) -> String {
        self.service.peripheral().0.registry.characteristic_name(&self.id)
    }

    pub(crate) fn path(&self) -> CharacteristicPath {
        CharacteristicPath {
            peripheral: self.service.peripheral().id(),
            service: self.service.id(),
            characteristic: self.id,
        }
    }

    fn inspect<R>(&self, f: impl FnOnce(&mut CharacteristicRecord) -> R) -> Option<R> {
        let mut record = self.service.peripheral().record();
        record.characteristic_mut(self.service.id(), self.id).map(f)
    }

    /// Runs `f` on the record inside the manager's serialization domain, after checking that the characteristic is
    /// still reported by its service and that the peripheral is connected.
    pub(crate) fn with_record<R>(
        &self,
        f: impl FnOnce(&mut CharacteristicRecord) -> Result<R>,
    ) -> Result<(Arc<CentralShared>, R)> {
        let shared = self.service.peripheral().manager()?;
        let value = shared.dispatch(|_| {
            let mut record = self.service.peripheral().record();
            let connected = record.state == PeripheralState::Connected;
            let characteristic = record
                .characteristic_mut(self.service.id(), self.id)
                .ok_or(ErrorKind::CharacteristicInvalidated(self.id))?;
            if !connected {
                return Err(Error::from(ErrorKind::NotConnected));
            }
            f(characteristic)
        })?;
        Ok((shared, value))
    }

    /// The properties of this characteristic.
    ///
    /// Characteristic properties indicate which operations (e.g. read, write, notify, etc) may be performed on this
    /// characteristic.
    pub fn properties(&self) -> CharacteristicProperties {
        self.inspect(|x| x.properties).unwrap_or(self.properties)
    }

    /// The most recent value read or notified, if any
    pub fn value(&self) -> Option<Vec<u8>> {
        self.inspect(|x| x.value.get().clone()).flatten()
    }

    /// Returns `true` while the peripheral sends notifications or indications for this characteristic
    pub fn is_notifying(&self) -> bool {
        self.inspect(|x| x.notifying).unwrap_or(false)
    }

    /// Returns `true` once the service no longer reports this characteristic
    pub fn is_invalidated(&self) -> bool {
        self.inspect(|_| ()).is_none()
    }

    /// A stream of this characteristic's value, starting with the current one.
    ///
    /// The stream ends when the characteristic is invalidated.
    pub fn values(&self) -> Result<ValueStream<Option<Vec<u8>>>> {
        self.inspect(|x| x.value.subscribe())
            .ok_or_else(|| ErrorKind::CharacteristicInvalidated(self.id).into())
    }

    /// Reads the value of this characteristic from the peripheral.
    ///
    /// Fails with [`ErrorKind::CharacteristicReadNotAvailable`] without contacting the peripheral if the
    /// characteristic is not readable. Starting another read before this one completes fails this one.
    pub async fn read(&self) -> Result<Vec<u8>> {
        if !self.properties().can_read() {
            return Err(ErrorKind::CharacteristicReadNotAvailable.into());
        }
        let (shared, pending) = self.with_record(|record| Ok(record.read.begin()))?;
        shared.backend.read_value(&self.path());
        pending.wait().await
    }

    /// Writes `value` and waits for the peripheral to acknowledge it.
    ///
    /// Fails with [`ErrorKind::CharacteristicWriteNotAvailable`] without contacting the peripheral if the
    /// characteristic is not writable.
    pub async fn write(&self, value: &[u8]) -> Result<()> {
        if !self.properties().can_write() {
            return Err(ErrorKind::CharacteristicWriteNotAvailable.into());
        }
        let (shared, pending) = self.with_record(|record| Ok(record.write.begin()))?;
        shared.backend.write_value(&self.path(), value, true);
        pending.wait().await
    }

    /// Writes `value` without requesting an acknowledgement.
    pub fn write_without_response(&self, value: &[u8]) -> Result<()> {
        if !self.properties().can_write() {
            return Err(ErrorKind::CharacteristicWriteNotAvailable.into());
        }
        let (shared, ()) = self.with_record(|_| Ok(()))?;
        shared.backend.write_value(&self.path(), value, false);
        Ok(())
    }

    /// Asks the peripheral to send notifications or indications for this characteristic.
    ///
    /// Resolves to the new notifying flag. Does nothing if notifications are already on.
    pub async fn subscribe_to_changes(&self) -> Result<bool> {
        self.set_notify(true).await
    }

    /// Asks the peripheral to stop notifications or indications for this characteristic.
    ///
    /// Resolves to the new notifying flag. Does nothing if notifications are already off.
    pub async fn unsubscribe_from_changes(&self) -> Result<bool> {
        self.set_notify(false).await
    }

    async fn set_notify(&self, enabled: bool) -> Result<bool> {
        if !self.properties().allows_subscription() {
            return Err(Error::new(
                ErrorKind::NotSupported,
                None,
                "characteristic does not support notifications or indications",
            ));
        }
        let (shared, pending) = self.with_record(|record| {
            Ok((record.notifying != enabled).then(|| record.notify.begin()))
        })?;
        let Some(pending) = pending else {
            return Ok(enabled);
        };
        shared.backend.set_notify(&self.path(), enabled);
        pending.wait().await
    }

    /// Enables notifications and returns a stream of the values sent by the peripheral.
    ///
    /// Dropping the last live stream of the characteristic turns notifications off again.
    pub async fn notify(&self) -> Result<NotificationStream> {
        let values = self
            .inspect(|x| x.value.changes())
            .ok_or(ErrorKind::CharacteristicInvalidated(self.id))?;
        self.subscribe_to_changes().await?;
        self.with_record(|record| {
            record.streams += 1;
            Ok(())
        })?;
        Ok(NotificationStream {
            characteristic: self.clone(),
            values,
        })
    }

    /// Discovers the descriptors of this characteristic
    pub async fn discover_descriptors(&self) -> Result<Vec<Descriptor>> {
        let (shared, pending) = self.with_record(|record| Ok(record.discover.begin()))?;
        shared.backend.discover_descriptors(&self.path());
        pending.wait().await
    }

    /// The descriptors discovered so far
    pub fn descriptors(&self) -> Vec<Descriptor> {
        self.inspect(|x| {
            x.descriptors
                .iter()
                .map(|d| Descriptor::new(self.clone(), d.id))
                .collect()
        })
        .unwrap_or_default()
    }
}

/// Values notified by a [`Characteristic`], returned by [`Characteristic::notify`]
pub struct NotificationStream {
    characteristic: Characteristic,
    values: ValueStream<Option<Vec<u8>>>,
}

impl Stream for NotificationStream {
    type Item = Vec<u8>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match Pin::new(&mut self.values).poll_next(cx) {
                Poll::Ready(Some(Some(value))) => return Poll::Ready(Some(value)),
                Poll::Ready(Some(None)) => continue,
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl Drop for NotificationStream {
    fn drop(&mut self) {
        let request = self.characteristic.with_record(|record| {
            record.streams = record.streams.saturating_sub(1);
            Ok(record.notifying && record.streams == 0)
        });
        if let Ok((shared, true)) = request {
            debug!("notification stream for {} dropped, unsubscribing", self.characteristic.id);
            shared.backend.set_notify(&self.characteristic.path(), false);
        }
    }
}

impl std::fmt::Debug for NotificationStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationStream")
            .field("characteristic", &self.characteristic.id)
            .finish()
    }
}
