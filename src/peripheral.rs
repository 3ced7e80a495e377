use std::future::Future;
use std::hash::{Hash, Hasher};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use async_channel::Receiver;
use futures_core::Stream;
use futures_timer::Delay;
use tracing::{debug, info};

use crate::central::CentralShared;
use crate::error::ErrorKind;
use crate::gatt_tree::PeripheralRecord;
use crate::util::defer;
use crate::{
    AdvertisementData, BluetoothId, ConnectOptions, Error, GattRegistry, ManagerState, PeripheralState, Result,
    Service, ValueStream,
};

/// The interval between RSSI samples taken by [`Peripheral::rssi_updates`]
pub const DEFAULT_RSSI_INTERVAL: Duration = Duration::from_secs(5);

/// A remote peripheral seen by a [`CentralManager`][crate::CentralManager].
///
/// A `Peripheral` is a handle: clones refer to the same peripheral and stay valid when the manager forgets it, after
/// which operations on it fail with [`ErrorKind::NotConnected`].
#[derive(Clone)]
pub struct Peripheral(pub(crate) Arc<PeripheralInner>);

pub(crate) struct PeripheralInner {
    id: BluetoothId,
    manager: Weak<CentralShared>,
    pub(crate) registry: GattRegistry,
    record: Mutex<PeripheralRecord>,
}

impl PartialEq for Peripheral {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Peripheral {}

impl Hash for Peripheral {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.id.hash(state);
    }
}

impl std::fmt::Debug for Peripheral {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peripheral")
            .field("id", &self.0.id)
            .field("state", &self.state())
            .finish()
    }
}

impl std::fmt::Display for Peripheral {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl Peripheral {
    pub(crate) fn new(id: BluetoothId, name: Option<String>, manager: &Arc<CentralShared>) -> Self {
        Peripheral(Arc::new(PeripheralInner {
            id,
            manager: Arc::downgrade(manager),
            registry: manager.registry.clone(),
            record: Mutex::new(PeripheralRecord::new(name)),
        }))
    }

    pub(crate) fn record(&self) -> MutexGuard<'_, PeripheralRecord> {
        self.0.record.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn manager(&self) -> Result<Arc<CentralShared>> {
        self.0
            .manager
            .upgrade()
            .ok_or_else(|| Error::new(ErrorKind::NotConnected, None, "central manager dropped"))
    }

    /// The stable identifier of this peripheral
    pub fn id(&self) -> BluetoothId {
        self.0.id
    }

    /// The name of this peripheral.
    ///
    /// Falls back to the advertised local name and then to the identifier.
    pub fn name(&self) -> String {
        let record = self.record();
        record
            .name
            .clone()
            .or_else(|| record.advertisement.local_name.clone())
            .unwrap_or_else(|| self.0.id.to_string())
    }

    /// The advertisement data received so far, merged across advertisements
    pub fn advertisement(&self) -> AdvertisementData {
        self.record().advertisement.clone()
    }

    /// The most recent signal strength reading in dBm
    pub fn rssi(&self) -> Option<i16> {
        self.record().rssi
    }

    /// The current connection state
    pub fn state(&self) -> PeripheralState {
        self.record().state
    }

    /// Returns `true` if the peripheral is connected
    pub fn is_connected(&self) -> bool {
        *self.record().connected.get()
    }

    /// A stream of the connected flag, starting with the current value
    pub fn connection_updates(&self) -> ValueStream<bool> {
        self.record().connected.subscribe()
    }

    /// The services discovered so far
    pub fn services(&self) -> Vec<Service> {
        self.record()
            .services
            .iter()
            .map(|x| Service::new(self.clone(), x.id))
            .collect()
    }

    /// Connects with no delay, cancelling any connection attempt already in flight.
    pub async fn connect(&self) -> Result<()> {
        self.connect_with(Duration::ZERO, true, ConnectOptions::default()).await
    }

    /// Connects to this peripheral.
    ///
    /// Succeeds immediately if already connected. If a connection attempt is in flight and `cancel_pending` is set,
    /// or the peripheral is connecting anyway, the earlier attempt is cancelled first. The backend is asked to wait
    /// `delay` before connecting.
    ///
    /// Fails with [`ErrorKind::NotConnected`] if the backend reports a failure to connect or a disconnection first.
    /// Dropping the returned future before it completes disconnects.
    pub async fn connect_with(&self, delay: Duration, cancel_pending: bool, options: ConnectOptions) -> Result<()> {
        let shared = self.manager()?;
        let (connected, cancel_first) = shared.dispatch(|core| {
            if *core.state.get() != ManagerState::PoweredOn {
                return Err(Error::from(ErrorKind::NotPoweredOn));
            }
            let record = self.record();
            if record.stale {
                return Err(Error::new(ErrorKind::NotConnected, None, "peripheral is no longer tracked"));
            }
            let in_flight = record.state != PeripheralState::Disconnected;
            Ok((
                record.state == PeripheralState::Connected,
                in_flight && (cancel_pending || record.state == PeripheralState::Connecting),
            ))
        })?;

        if connected {
            return Ok(());
        }
        if cancel_first {
            debug!("cancelling pending connection to {}", self.id());
            self.disconnect();
        }

        let pending = shared.dispatch(|_| {
            let mut record = self.record();
            record.state = PeripheralState::Connecting;
            record.connect.begin()
        });
        let guard = defer(|| {
            debug!("connect to {} cancelled", self.id());
            self.disconnect();
        });

        info!("connecting to {}", self.id());
        shared
            .backend
            .connect(&self.id(), options, (!delay.is_zero()).then_some(delay));
        let result = pending.wait().await;
        guard.defuse();
        result
    }

    /// Disconnects from this peripheral.
    ///
    /// Every in-flight operation on the peripheral and its services, characteristics and descriptors fails with
    /// [`ErrorKind::NotConnected`], and the discovered services are cleared.
    pub fn disconnect(&self) {
        let Ok(shared) = self.manager() else {
            return;
        };
        let cancel = shared.dispatch(|_| self.record().disconnect());
        if cancel {
            info!("disconnecting from {}", self.id());
            shared.backend.cancel_connection(&self.id());
        }
    }

    /// Discovers the services listed in `services`, or all services if `services` is empty.
    ///
    /// Resolves to every service now known on the peripheral.
    pub async fn discover_services(&self, services: &[BluetoothId]) -> Result<Vec<Service>> {
        let shared = self.manager()?;
        let pending = shared.dispatch(|_| {
            let mut record = self.record();
            if record.state != PeripheralState::Connected {
                return Err(Error::from(ErrorKind::NotConnected));
            }
            Ok(record.discover_services.begin())
        })?;
        shared.backend.discover_services(&self.id(), services);
        pending.wait().await
    }

    /// Finds a discovered service by identifier
    pub fn service(&self, id: &BluetoothId) -> Result<Service> {
        self.record()
            .services
            .iter()
            .find(|x| x.id == *id)
            .map(|x| Service::new(self.clone(), x.id))
            .ok_or_else(|| ErrorKind::ServiceNotFound(*id).into())
    }

    /// Streams RSSI readings sampled every [`DEFAULT_RSSI_INTERVAL`]. See [`Peripheral::rssi_updates_every`].
    pub fn rssi_updates(&self) -> RssiStream {
        self.rssi_updates_every(DEFAULT_RSSI_INTERVAL)
    }

    /// Streams RSSI readings, starting with the most recent one, sampled every `interval` while connected.
    ///
    /// Only one RSSI stream is live per peripheral: starting a new one ends the previous stream.
    pub fn rssi_updates_every(&self, interval: Duration) -> RssiStream {
        let (session, receiver) = match self.manager() {
            Ok(shared) => shared.dispatch(|_| self.record().begin_rssi_session()),
            Err(_) => (0, async_channel::unbounded().1),
        };
        RssiStream {
            peripheral: self.clone(),
            session,
            receiver: Box::pin(receiver),
            delay: Delay::new(interval),
            interval,
        }
    }

    fn sample_rssi(&self) {
        let Ok(shared) = self.manager() else {
            return;
        };
        let connected = shared.dispatch(|_| self.record().state == PeripheralState::Connected);
        if connected {
            shared.backend.read_signal_strength(&self.id());
        }
    }
}

/// Signal strength readings of a [`Peripheral`], returned by [`Peripheral::rssi_updates`].
///
/// Dropping the stream stops sampling.
pub struct RssiStream {
    peripheral: Peripheral,
    session: u64,
    receiver: Pin<Box<Receiver<Result<i16>>>>,
    delay: Delay,
    interval: Duration,
}

impl Stream for RssiStream {
    type Item = Result<i16>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        loop {
            if let Poll::Ready(item) = this.receiver.as_mut().poll_next(cx) {
                return Poll::Ready(item);
            }
            match Pin::new(&mut this.delay).poll(cx) {
                Poll::Ready(()) => {
                    this.delay.reset(this.interval);
                    this.peripheral.sample_rssi();
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl Drop for RssiStream {
    fn drop(&mut self) {
        if let Ok(shared) = self.peripheral.manager() {
            shared.dispatch(|_| self.peripheral.record().end_rssi_session(self.session));
        }
    }
}

impl std::fmt::Debug for RssiStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RssiStream")
            .field("peripheral", &self.peripheral.id())
            .field("interval", &self.interval)
            .finish()
    }
}
