use std::sync::{Arc, Mutex, PoisonError, Weak};

use tracing::trace;

use crate::error::ErrorKind;
use crate::observable::Observable;
use crate::server::ServerShared;
use crate::{AttributePermissions, BluetoothId, CharacteristicProperties, Error, GattRegistry, Result, ValueStream};

/// A locally served GATT service, published by a [`PeripheralManager`][crate::PeripheralManager].
#[derive(Debug, Clone)]
pub struct MutableService {
    id: BluetoothId,
    primary: bool,
    characteristics: Vec<MutableCharacteristic>,
}

impl MutableService {
    /// Creates a service with no characteristics.
    pub fn new(id: BluetoothId, primary: bool) -> Self {
        MutableService {
            id,
            primary,
            characteristics: Vec::new(),
        }
    }

    /// Adds `characteristic` to this service.
    pub fn with_characteristic(mut self, characteristic: MutableCharacteristic) -> Self {
        self.characteristics.push(characteristic);
        self
    }

    /// The identifier of this service's type
    pub fn id(&self) -> BluetoothId {
        self.id
    }

    /// Whether this is a primary service
    pub fn is_primary(&self) -> bool {
        self.primary
    }

    /// The characteristics of this service
    pub fn characteristics(&self) -> &[MutableCharacteristic] {
        &self.characteristics
    }

    /// The common name of this service in `registry`
    pub fn name(&self, registry: &GattRegistry) -> String {
        registry.service_name(&self.id)
    }
}

/// Intercepts remote reads and writes of a [`MutableCharacteristic`].
///
/// The provided methods serve the stored value, so an implementation only needs to override what it customizes.
/// Returning an error answers the remote request with
/// [`AttErrorCode::AttributeNotLong`][crate::error::AttErrorCode::AttributeNotLong].
pub trait CharacteristicHandler: Send + Sync + 'static {
    /// Produces the value returned to a remote read starting at `offset`.
    fn read(&self, characteristic: &MutableCharacteristic, offset: usize) -> Result<Vec<u8>> {
        characteristic.read_stored(offset)
    }

    /// Applies a remote write of `value` at `offset`.
    fn write(&self, characteristic: &MutableCharacteristic, value: &[u8], offset: usize) -> Result<()> {
        characteristic.write_stored(value, offset)
    }
}

/// A locally served GATT characteristic.
///
/// Clones share the same value. Updating the value with [`MutableCharacteristic::set_value`] notifies the remote
/// centrals subscribed to it while it is advertised.
#[derive(Clone)]
pub struct MutableCharacteristic(Arc<MutableInner>);

struct MutableInner {
    id: BluetoothId,
    properties: CharacteristicProperties,
    permissions: AttributePermissions,
    value: Mutex<Observable<Option<Vec<u8>>>>,
    handler: Option<Arc<dyn CharacteristicHandler>>,
    publisher: Mutex<Weak<ServerShared>>,
}

impl MutableCharacteristic {
    /// Creates a characteristic serving its stored value.
    pub fn new(id: BluetoothId, properties: CharacteristicProperties, permissions: AttributePermissions) -> Self {
        Self::build(id, properties, permissions, None)
    }

    /// Creates a characteristic whose remote reads and writes go through `handler`.
    pub fn with_handler(
        id: BluetoothId,
        properties: CharacteristicProperties,
        permissions: AttributePermissions,
        handler: impl CharacteristicHandler,
    ) -> Self {
        Self::build(id, properties, permissions, Some(Arc::new(handler)))
    }

    fn build(
        id: BluetoothId,
        properties: CharacteristicProperties,
        permissions: AttributePermissions,
        handler: Option<Arc<dyn CharacteristicHandler>>,
    ) -> Self {
        MutableCharacteristic(Arc::new(MutableInner {
            id,
            properties,
            permissions,
            value: Mutex::new(Observable::new(None)),
            handler,
            publisher: Mutex::new(Weak::new()),
        }))
    }

    /// The identifier of this characteristic's type
    pub fn id(&self) -> BluetoothId {
        self.0.id
    }

    #[allow(missing_docs)]
    pub fn properties(&self) -> CharacteristicProperties {
        self.0.properties
    }

    #[allow(missing_docs)]
    pub fn permissions(&self) -> AttributePermissions {
        self.0.permissions
    }

    /// The common name of this characteristic in `registry`
    pub fn name(&self, registry: &GattRegistry) -> String {
        registry.characteristic_name(&self.0.id)
    }

    fn with_value<R>(&self, f: impl FnOnce(&mut Observable<Option<Vec<u8>>>) -> R) -> R {
        f(&mut self.0.value.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// The stored value
    pub fn value(&self) -> Option<Vec<u8>> {
        self.with_value(|x| x.get().clone())
    }

    /// A stream of the stored value, starting with the current one
    pub fn values(&self) -> ValueStream<Option<Vec<u8>>> {
        self.with_value(|x| x.subscribe())
    }

    /// Replaces the stored value and sends it to every subscribed central.
    pub fn set_value(&self, value: Vec<u8>) {
        self.with_value(|x| x.publish(Some(value.clone())));
        let publisher = self.0.publisher.lock().unwrap_or_else(PoisonError::into_inner).upgrade();
        match publisher {
            Some(shared) => shared.publish_update(&self.0.id, &value),
            None => trace!("{} is not advertised, update stays local", self.0.id),
        }
    }

    /// Answers a remote read, through the handler if one was given.
    pub fn read(&self, offset: usize) -> Result<Vec<u8>> {
        match &self.0.handler {
            Some(handler) => handler.read(self, offset),
            None => self.read_stored(offset),
        }
    }

    /// Applies a remote write, through the handler if one was given.
    pub fn write(&self, value: &[u8], offset: usize) -> Result<()> {
        match &self.0.handler {
            Some(handler) => handler.write(self, value, offset),
            None => self.write_stored(value, offset),
        }
    }

    /// Reads the stored value from `offset` on. An absent value reads as empty.
    pub fn read_stored(&self, offset: usize) -> Result<Vec<u8>> {
        let value = self.value().unwrap_or_default();
        match value.get(offset..) {
            Some(tail) => Ok(tail.to_vec()),
            None => Err(past_end(offset, value.len())),
        }
    }

    /// Overwrites the stored value from `offset` on with `value`, dropping whatever followed.
    ///
    /// Subscribed centrals are not notified.
    pub fn write_stored(&self, value: &[u8], offset: usize) -> Result<()> {
        self.with_value(|stored| {
            let mut current = stored.get().clone().unwrap_or_default();
            if offset > current.len() {
                return Err(past_end(offset, current.len()));
            }
            current.truncate(offset);
            current.extend_from_slice(value);
            stored.publish(Some(current));
            Ok(())
        })
    }

    pub(crate) fn attach(&self, shared: Weak<ServerShared>) {
        *self.0.publisher.lock().unwrap_or_else(PoisonError::into_inner) = shared;
    }

    pub(crate) fn detach(&self) {
        self.attach(Weak::new());
    }
}

fn past_end(offset: usize, len: usize) -> Error {
    Error::new(
        ErrorKind::Undefined,
        None,
        format!("offset {offset} is past the end of the {len} byte value"),
    )
}

impl std::fmt::Debug for MutableCharacteristic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutableCharacteristic")
            .field("id", &self.0.id)
            .field("properties", &self.0.properties)
            .field("permissions", &self.0.permissions)
            .field("value", &self.value())
            .finish()
    }
}
