use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use futures_channel::oneshot;
use futures_core::Stream;
use tracing::{debug, info, trace, warn};

use crate::backend::{AttRequest, PeripheralBackend, PeripheralEvent, PeripheralEventSink};
use crate::central::ensure_ready;
use crate::error::{AttErrorCode, ErrorKind};
use crate::observable::Observable;
use crate::{
    AdvertisementData, BluetoothId, Error, GattRegistry, Manager, ManagerAuthorization, ManagerState,
    MutableCharacteristic, MutableService, Result, ValueStream,
};

/// The peripheral role: publishes local services and advertises them to remote centrals.
///
/// `PeripheralManager` is a cheap handle; clones share the same state.
#[derive(Clone)]
pub struct PeripheralManager(pub(crate) Arc<ServerShared>);

pub(crate) struct ServerShared {
    backend: Arc<dyn PeripheralBackend>,
    registry: GattRegistry,
    core: Mutex<ServerCore>,
}

struct ServerCore {
    initialized: bool,
    state: Observable<ManagerState>,
    authorization: Observable<ManagerAuthorization>,
    advertising: Observable<bool>,
    advertisement: AdvertisementData,
    services: Vec<MutableService>,
    advertised: Vec<AdvertisedCharacteristic>,
    session: Option<AdvertisingSession>,
    next_session: u64,
}

struct AdvertisedCharacteristic {
    characteristic: MutableCharacteristic,
    subscribers: Vec<BluetoothId>,
}

struct AdvertisingSession {
    id: u64,
    sender: oneshot::Sender<Result<()>>,
}

struct AdvertisingStart {
    session: u64,
    receiver: oneshot::Receiver<Result<()>>,
    replaced: bool,
    services: Vec<MutableService>,
    advertisement: AdvertisementData,
}

impl PeripheralManager {
    /// Creates a manager driving `backend` with the standard GATT registry.
    pub fn new(backend: impl PeripheralBackend) -> Self {
        Self::with_registry(backend, GattRegistry::new())
    }

    /// Creates a manager driving `backend`.
    pub fn with_registry(backend: impl PeripheralBackend, registry: GattRegistry) -> Self {
        let backend: Arc<dyn PeripheralBackend> = Arc::new(backend);
        let core = ServerCore {
            initialized: false,
            state: Observable::new(backend.state()),
            authorization: Observable::new(backend.authorization()),
            advertising: Observable::new(false),
            advertisement: AdvertisementData::default(),
            services: Vec::new(),
            advertised: Vec::new(),
            session: None,
            next_session: 0,
        };
        let shared = Arc::new(ServerShared {
            backend,
            registry,
            core: Mutex::new(core),
        });
        shared.backend.attach(PeripheralEventSink(Arc::downgrade(&shared)));
        PeripheralManager(shared)
    }

    /// The registry used to name services and characteristics
    pub fn registry(&self) -> &GattRegistry {
        &self.0.registry
    }

    /// Replaces the services published by the next call to [`PeripheralManager::begin_advertising`].
    pub fn set_services(&self, services: Vec<MutableService>) {
        self.0.dispatch(|core| core.services = services);
    }

    /// Adds a service published by the next call to [`PeripheralManager::begin_advertising`].
    pub fn add_service(&self, service: MutableService) {
        self.0.dispatch(|core| core.services.push(service));
    }

    /// The configured services
    pub fn services(&self) -> Vec<MutableService> {
        self.0.dispatch(|core| core.services.clone())
    }

    /// Replaces the payload advertised by the next call to [`PeripheralManager::begin_advertising`].
    pub fn set_advertisement_data(&self, data: AdvertisementData) {
        self.0.dispatch(|core| core.advertisement = data);
    }

    /// The configured advertisement payload
    pub fn advertisement_data(&self) -> AdvertisementData {
        self.0.dispatch(|core| core.advertisement.clone())
    }

    /// Returns `true` while advertising.
    pub fn is_advertising(&self) -> bool {
        self.0.dispatch(|core| *core.advertising.get())
    }

    /// A stream of the advertising flag, starting with the current value.
    pub fn advertising_updates(&self) -> ValueStream<bool> {
        self.0.dispatch(|core| core.advertising.subscribe())
    }

    /// The remote centrals subscribed to the advertised characteristic `characteristic`.
    pub fn subscribers(&self, characteristic: &BluetoothId) -> Vec<BluetoothId> {
        self.0.dispatch(|core| {
            core.find(characteristic)
                .map(|x| x.subscribers.clone())
                .unwrap_or_default()
        })
    }

    /// Publishes the configured services and advertises the configured payload.
    ///
    /// Advertising starts when the returned future is first polled, after the radio is powered on. Starting ends any
    /// earlier advertising session. The future stays pending while advertising and resolves to `Ok(())` once
    /// [`PeripheralManager::stop_advertising`] is called. It fails with [`ErrorKind::NotPoweredOn`] if the radio
    /// settles on a state other than powered on, with [`ErrorKind::NotConnected`] if the radio powers off while
    /// advertising, and with the backend error if advertising cannot start.
    ///
    /// Dropping the future stops advertising and removes the published services.
    pub fn begin_advertising(&self) -> Advertising {
        Advertising {
            manager: self.clone(),
            phase: Phase::Idle,
        }
    }

    /// Stops advertising. The pending [`Advertising`] future resolves successfully.
    pub fn stop_advertising(&self) {
        if self.0.dispatch(|core| core.terminate(Ok(()))) {
            info!("advertising stopped");
            self.0.stop_backend();
        }
    }

    /// Waits until the radio is powered on. See [`CentralManager::ensure_ready`][crate::CentralManager::ensure_ready].
    pub async fn ensure_ready(&self, wait_for_powered_on: bool) -> Result<()> {
        ensure_ready(self.state_updates(), wait_for_powered_on).await
    }
}

impl Manager for PeripheralManager {
    fn authorization(&self) -> ManagerAuthorization {
        self.0.dispatch(|core| *core.authorization.get())
    }

    fn state(&self) -> ManagerState {
        self.0.dispatch(|core| *core.state.get())
    }

    fn request_authorization(&self) {
        let first = self.0.dispatch(|core| !std::mem::replace(&mut core.initialized, true));
        if first {
            debug!("initializing peripheral backend");
            self.0.backend.initialize();
        }
    }

    fn authorization_updates(&self) -> ValueStream<ManagerAuthorization> {
        self.0.dispatch(|core| core.authorization.subscribe())
    }

    fn state_updates(&self) -> ValueStream<ManagerState> {
        self.0.dispatch(|core| core.state.subscribe())
    }
}

impl std::fmt::Debug for PeripheralManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PeripheralManager").finish()
    }
}

impl ServerShared {
    fn dispatch<R>(&self, f: impl FnOnce(&mut ServerCore) -> R) -> R {
        let mut core: MutexGuard<'_, ServerCore> = self.core.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut core)
    }

    fn begin_advertising(self: &Arc<Self>) -> AdvertisingStart {
        self.dispatch(|core| {
            let replaced = core.terminate(Ok(()));

            core.advertised = core
                .services
                .iter()
                .flat_map(|x| x.characteristics())
                .map(|characteristic| {
                    characteristic.attach(Arc::downgrade(self));
                    AdvertisedCharacteristic {
                        characteristic: characteristic.clone(),
                        subscribers: Vec::new(),
                    }
                })
                .collect();

            let (sender, receiver) = oneshot::channel();
            core.next_session += 1;
            core.session = Some(AdvertisingSession {
                id: core.next_session,
                sender,
            });
            core.advertising.set(true);
            AdvertisingStart {
                session: core.next_session,
                receiver,
                replaced,
                services: core.services.clone(),
                advertisement: core.advertisement.clone(),
            }
        })
    }

    /// Ends advertising `session` if it is still the active one. Returns `true` if the backend must be stopped.
    fn end_session(&self, session: u64) -> bool {
        self.dispatch(|core| core.session.as_ref().is_some_and(|x| x.id == session) && core.terminate(Ok(())))
    }

    /// Stops the backend advertising and clears its GATT database, unless the radio is already off.
    fn stop_backend(&self) {
        if self.dispatch(|core| *core.state.get() == ManagerState::PoweredOn) {
            self.backend.stop_advertising();
            self.backend.remove_all_services();
        }
    }

    /// Sends `value` to the centrals subscribed to `characteristic`.
    pub(crate) fn publish_update(&self, characteristic: &BluetoothId, value: &[u8]) {
        let subscribers = self.dispatch(|core| core.find(characteristic).map(|x| x.subscribers.clone()));
        match subscribers {
            Some(subscribers) if !subscribers.is_empty() => {
                trace!("updating {} on {} centrals", characteristic, subscribers.len());
                self.backend.update_value(value, characteristic, &subscribers);
            }
            _ => trace!("no subscribers for {}", characteristic),
        }
    }

    pub(crate) fn handle_event(self: &Arc<Self>, event: PeripheralEvent) {
        trace!(?event, "peripheral event");
        match event {
            PeripheralEvent::StateChanged(state) => {
                info!("manager state changed to {:?}", state);
                self.dispatch(|core| {
                    core.state.set(state);
                    match state {
                        ManagerState::PoweredOff => {
                            core.terminate(Err(Error::new(ErrorKind::NotConnected, None, "radio powered off")));
                        }
                        s if s == ManagerState::PoweredOn || s.is_transient() => {}
                        _ => {
                            core.terminate(Err(ErrorKind::NotPoweredOn.into()));
                        }
                    }
                });
            }
            PeripheralEvent::AuthorizationChanged(authorization) => {
                info!("manager authorization changed to {:?}", authorization);
                self.dispatch(|core| core.authorization.set(authorization));
            }
            PeripheralEvent::AdvertisingStarted { error: None } => info!("advertising started"),
            PeripheralEvent::AdvertisingStarted { error: Some(err) } => {
                let err = Error::from_backend(err);
                if self.dispatch(|core| core.terminate(Err(err))) {
                    self.stop_backend();
                }
            }
            PeripheralEvent::ServicePublished { service, error } => match error {
                Some(err) => warn!("failed to publish service {}: {}", self.registry.service_name(&service), err),
                None => info!("published service {}", self.registry.service_name(&service)),
            },
            PeripheralEvent::CentralSubscribed { central, characteristic } => self.dispatch(|core| {
                if let Some(entry) = core.find_mut(&characteristic) {
                    if !entry.subscribers.contains(&central) {
                        debug!("{} subscribed to {}", central, characteristic);
                        entry.subscribers.push(central);
                    }
                }
            }),
            PeripheralEvent::CentralUnsubscribed { central, characteristic } => self.dispatch(|core| {
                if let Some(entry) = core.find_mut(&characteristic) {
                    debug!("{} unsubscribed from {}", central, characteristic);
                    entry.subscribers.retain(|x| *x != central);
                }
            }),
            PeripheralEvent::ReadRequested(request) => self.answer_read(request),
            PeripheralEvent::WriteRequested(requests) => {
                for request in requests {
                    self.answer_write(request);
                }
            }
        }
    }

    fn advertised(&self, id: &BluetoothId) -> Option<MutableCharacteristic> {
        self.dispatch(|core| core.find(id).map(|x| x.characteristic.clone()))
    }

    fn answer_read(&self, request: AttRequest) {
        let Some(characteristic) = self.advertised(&request.characteristic) else {
            debug!("read of unknown characteristic {}", request.characteristic);
            self.backend
                .respond_to_read(request.id, None, AttErrorCode::AttributeNotFound.into());
            return;
        };
        match characteristic.read(request.offset) {
            Ok(value) => self
                .backend
                .respond_to_read(request.id, Some(&value), AttErrorCode::Success.into()),
            Err(err) => {
                debug!("read of {} failed: {}", request.characteristic, err);
                self.backend
                    .respond_to_read(request.id, None, AttErrorCode::AttributeNotLong.into());
            }
        }
    }

    fn answer_write(&self, request: AttRequest) {
        let Some(characteristic) = self.advertised(&request.characteristic) else {
            debug!("write of unknown characteristic {}", request.characteristic);
            self.backend
                .respond_to_write(request.id, AttErrorCode::AttributeNotFound.into());
            return;
        };
        let value = request.value.unwrap_or_default();
        let result = match characteristic.write(&value, request.offset) {
            Ok(()) => AttErrorCode::Success,
            Err(err) => {
                debug!("write of {} failed: {}", request.characteristic, err);
                AttErrorCode::AttributeNotLong
            }
        };
        self.backend.respond_to_write(request.id, result.into());
    }
}

impl ServerCore {
    fn find(&self, id: &BluetoothId) -> Option<&AdvertisedCharacteristic> {
        self.advertised.iter().find(|x| x.characteristic.id() == *id)
    }

    fn find_mut(&mut self, id: &BluetoothId) -> Option<&mut AdvertisedCharacteristic> {
        self.advertised.iter_mut().find(|x| x.characteristic.id() == *id)
    }

    /// Ends the active advertising session with `result`. Returns `false` if there was none.
    fn terminate(&mut self, result: Result<()>) -> bool {
        let Some(session) = self.session.take() else {
            return false;
        };
        if let Err(err) = &result {
            warn!("advertising terminated: {}", err);
        }
        let _ = session.sender.send(result);
        for entry in self.advertised.drain(..) {
            entry.characteristic.detach();
        }
        self.advertising.set(false);
        true
    }
}

/// An advertising session, returned by [`PeripheralManager::begin_advertising`].
#[must_use = "futures do nothing unless polled"]
pub struct Advertising {
    manager: PeripheralManager,
    phase: Phase,
}

enum Phase {
    Idle,
    WaitingForPower(ValueStream<ManagerState>),
    Active {
        session: u64,
        receiver: oneshot::Receiver<Result<()>>,
    },
    Done,
}

impl Advertising {
    fn start(&mut self) {
        let shared = &self.manager.0;
        let start = shared.begin_advertising();
        if start.replaced {
            shared.backend.stop_advertising();
            shared.backend.remove_all_services();
        }
        self.phase = Phase::Active {
            session: start.session,
            receiver: start.receiver,
        };
        for service in &start.services {
            debug!("publishing {}", service.name(&shared.registry));
            shared.backend.publish(service);
        }
        info!("starting to advertise {} services", start.services.len());
        shared.backend.start_advertising(&start.advertisement);
    }
}

impl Future for Advertising {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        loop {
            match &mut this.phase {
                Phase::Idle => this.phase = Phase::WaitingForPower(this.manager.state_updates()),
                Phase::WaitingForPower(states) => match Pin::new(states).poll_next(cx) {
                    Poll::Ready(Some(ManagerState::PoweredOn)) => this.start(),
                    Poll::Ready(Some(state)) if state.is_transient() => {
                        debug!("advertising waits while manager state is {:?}", state);
                    }
                    Poll::Ready(Some(state)) => {
                        debug!("cannot advertise while manager state is {:?}", state);
                        this.phase = Phase::Done;
                        return Poll::Ready(Err(ErrorKind::NotPoweredOn.into()));
                    }
                    Poll::Ready(None) => {
                        this.phase = Phase::Done;
                        return Poll::Ready(Err(ErrorKind::UnknownState.into()));
                    }
                    Poll::Pending => return Poll::Pending,
                },
                Phase::Active { receiver, .. } => {
                    let result = match Pin::new(receiver).poll(cx) {
                        Poll::Ready(Ok(result)) => result,
                        Poll::Ready(Err(oneshot::Canceled)) => Ok(()),
                        Poll::Pending => return Poll::Pending,
                    };
                    this.phase = Phase::Done;
                    return Poll::Ready(result);
                }
                Phase::Done => return Poll::Ready(Err(Error::new(ErrorKind::Undefined, None, "polled after completion"))),
            }
        }
    }
}

impl Drop for Advertising {
    fn drop(&mut self) {
        if let Phase::Active { session, .. } = self.phase {
            if self.manager.0.end_session(session) {
                debug!("advertising future dropped, stopping");
                self.manager.0.stop_backend();
            }
        }
    }
}

impl std::fmt::Debug for Advertising {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let phase = match self.phase {
            Phase::Idle => "idle",
            Phase::WaitingForPower(_) => "waiting for power",
            Phase::Active { .. } => "active",
            Phase::Done => "done",
        };
        f.debug_struct("Advertising").field("phase", &phase).finish()
    }
}
