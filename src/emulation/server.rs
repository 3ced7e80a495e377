use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, trace};

use super::{EmulatedManagerConfig, ManagerEmulation};
use crate::backend::{AttRequest, PeripheralBackend, PeripheralEvent, PeripheralEventSink};
use crate::error::{AttError, BackendError};
use crate::{AdvertisementData, BluetoothId, ManagerAuthorization, ManagerState, MutableService};

/// The answer a [`PeripheralManager`][crate::PeripheralManager] gave to a remote request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttResponse {
    /// The request being answered
    pub request: u64,
    /// The value returned by a read
    pub value: Option<Vec<u8>>,
    #[allow(missing_docs)]
    pub result: AttError,
}

/// A notification sent by a [`PeripheralManager`][crate::PeripheralManager]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueUpdate {
    #[allow(missing_docs)]
    pub characteristic: BluetoothId,
    #[allow(missing_docs)]
    pub value: Vec<u8>,
    /// The centrals the update was sent to
    pub subscribers: Vec<BluetoothId>,
}

/// An emulated peripheral-role radio.
///
/// It keeps what the manager published and advertised, and lets a test play the part of remote centrals: subscribing
/// to characteristics and sending read and write requests. Clones share the same radio.
#[derive(Clone)]
pub struct EmulatedPeripheralRadio(Arc<Mutex<PeripheralRadio>>);

struct PeripheralRadio {
    manager: ManagerEmulation,
    sink: Option<PeripheralEventSink>,
    services: Vec<MutableService>,
    advertising: Option<AdvertisementData>,
    advertising_failure: Option<BackendError>,
    next_request: u64,
    responses: Vec<AttResponse>,
    updates: Vec<ValueUpdate>,
}

impl EmulatedPeripheralRadio {
    #[allow(missing_docs)]
    pub fn new(config: EmulatedManagerConfig) -> Self {
        EmulatedPeripheralRadio(Arc::new(Mutex::new(PeripheralRadio {
            manager: ManagerEmulation::new(&config),
            sink: None,
            services: Vec::new(),
            advertising: None,
            advertising_failure: None,
            next_request: 0,
            responses: Vec::new(),
            updates: Vec::new(),
        })))
    }

    fn lock(&self) -> MutexGuard<'_, PeripheralRadio> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `f` under the radio lock and delivers the events it returns once the lock is released.
    fn script<R>(&self, f: impl FnOnce(&mut PeripheralRadio) -> (R, Vec<PeripheralEvent>)) -> R {
        let (sink, result, events) = {
            let mut radio = self.lock();
            let (result, events) = f(&mut radio);
            (radio.sink.clone(), result, events)
        };
        if let Some(sink) = sink {
            for event in events {
                sink.send(event);
            }
        }
        result
    }

    fn emit(&self, f: impl FnOnce(&mut PeripheralRadio) -> Vec<PeripheralEvent>) {
        self.script(|radio| ((), f(radio)))
    }

    fn answers(&self, ids: &[u64]) -> Vec<AttResponse> {
        self.lock()
            .responses
            .iter()
            .filter(|x| ids.contains(&x.request))
            .cloned()
            .collect()
    }

    /// Changes the radio state. Leaving the powered on state stops advertising and clears the published services.
    pub fn set_state(&self, state: ManagerState) {
        self.emit(|radio| {
            radio.manager.state = state;
            if state != ManagerState::PoweredOn {
                radio.advertising = None;
                radio.services.clear();
            }
            vec![PeripheralEvent::StateChanged(state)]
        });
    }

    /// Changes the authorization.
    pub fn set_authorization(&self, authorization: ManagerAuthorization) {
        self.emit(|radio| {
            radio.manager.authorization = authorization;
            vec![PeripheralEvent::AuthorizationChanged(authorization)]
        });
    }

    /// Makes the next attempt to start advertising fail with `error`.
    pub fn set_advertising_failure(&self, error: Option<BackendError>) {
        self.lock().advertising_failure = error;
    }

    /// Sends a read of `characteristic` from `central`. Returns the manager's answer.
    pub fn request_read(&self, central: BluetoothId, characteristic: BluetoothId, offset: usize) -> Option<AttResponse> {
        let id = self.script(|radio| {
            radio.next_request += 1;
            let request = AttRequest {
                id: radio.next_request,
                central,
                characteristic,
                offset,
                value: None,
            };
            (request.id, vec![PeripheralEvent::ReadRequested(request)])
        });
        self.answers(&[id]).pop()
    }

    /// Sends a single write of `value` to `characteristic` from `central`. Returns the manager's answer.
    pub fn request_write(
        &self,
        central: BluetoothId,
        characteristic: BluetoothId,
        offset: usize,
        value: Vec<u8>,
    ) -> Option<AttResponse> {
        self.request_writes(central, vec![(characteristic, offset, value)]).pop()
    }

    /// Sends a batch of `(characteristic, offset, value)` writes from `central`. Returns the manager's answers in
    /// order.
    pub fn request_writes(&self, central: BluetoothId, writes: Vec<(BluetoothId, usize, Vec<u8>)>) -> Vec<AttResponse> {
        let ids = self.script(|radio| {
            let requests: Vec<AttRequest> = writes
                .into_iter()
                .map(|(characteristic, offset, value)| {
                    radio.next_request += 1;
                    AttRequest {
                        id: radio.next_request,
                        central,
                        characteristic,
                        offset,
                        value: Some(value),
                    }
                })
                .collect();
            let ids: Vec<u64> = requests.iter().map(|x| x.id).collect();
            (ids, vec![PeripheralEvent::WriteRequested(requests)])
        });
        self.answers(&ids)
    }

    /// Subscribes `central` to notifications of `characteristic`.
    pub fn subscribe(&self, central: BluetoothId, characteristic: BluetoothId) {
        self.emit(|_| vec![PeripheralEvent::CentralSubscribed { central, characteristic }]);
    }

    /// Unsubscribes `central` from notifications of `characteristic`.
    pub fn unsubscribe(&self, central: BluetoothId, characteristic: BluetoothId) {
        self.emit(|_| vec![PeripheralEvent::CentralUnsubscribed { central, characteristic }]);
    }

    /// The services currently in the local GATT database
    pub fn published_services(&self) -> Vec<MutableService> {
        self.lock().services.clone()
    }

    /// The payload being advertised, if advertising
    pub fn advertised_data(&self) -> Option<AdvertisementData> {
        self.lock().advertising.clone()
    }

    #[allow(missing_docs)]
    pub fn is_advertising(&self) -> bool {
        self.lock().advertising.is_some()
    }

    /// Every notification sent so far, oldest first
    pub fn updates(&self) -> Vec<ValueUpdate> {
        self.lock().updates.clone()
    }

    /// Every answer to a remote request so far, oldest first
    pub fn responses(&self) -> Vec<AttResponse> {
        self.lock().responses.clone()
    }
}

impl PeripheralBackend for EmulatedPeripheralRadio {
    fn state(&self) -> ManagerState {
        self.lock().manager.state
    }

    fn authorization(&self) -> ManagerAuthorization {
        self.lock().manager.authorization
    }

    fn attach(&self, events: PeripheralEventSink) {
        self.lock().sink = Some(events);
    }

    fn initialize(&self) {
        debug!("initializing emulated peripheral radio");
        self.emit(|radio| match radio.manager.request_authorization() {
            Some((authorization, state)) => vec![
                PeripheralEvent::AuthorizationChanged(authorization),
                PeripheralEvent::StateChanged(state),
            ],
            None => Vec::new(),
        });
    }

    fn publish(&self, service: &MutableService) {
        self.emit(|radio| {
            radio.services.retain(|x| x.id() != service.id());
            radio.services.push(service.clone());
            vec![PeripheralEvent::ServicePublished {
                service: service.id(),
                error: None,
            }]
        });
    }

    fn remove_all_services(&self) {
        self.lock().services.clear();
    }

    fn start_advertising(&self, data: &AdvertisementData) {
        self.emit(|radio| {
            let error = radio.advertising_failure.take();
            if error.is_none() {
                radio.advertising = Some(data.clone());
            }
            vec![PeripheralEvent::AdvertisingStarted { error }]
        });
    }

    fn stop_advertising(&self) {
        self.lock().advertising = None;
    }

    fn respond_to_read(&self, request: u64, value: Option<&[u8]>, result: AttError) {
        trace!(request, %result, "read answered");
        self.lock().responses.push(AttResponse {
            request,
            value: value.map(<[u8]>::to_vec),
            result,
        });
    }

    fn respond_to_write(&self, request: u64, result: AttError) {
        trace!(request, %result, "write answered");
        self.lock().responses.push(AttResponse {
            request,
            value: None,
            result,
        });
    }

    fn update_value(&self, value: &[u8], characteristic: &BluetoothId, subscribers: &[BluetoothId]) {
        self.lock().updates.push(ValueUpdate {
            characteristic: *characteristic,
            value: value.to_vec(),
            subscribers: subscribers.to_vec(),
        });
    }
}

impl std::fmt::Debug for EmulatedPeripheralRadio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let radio = self.lock();
        f.debug_struct("EmulatedPeripheralRadio")
            .field("state", &radio.manager.state)
            .field("authorization", &radio.manager.authorization)
            .field("services", &radio.services.len())
            .field("advertising", &radio.advertising.is_some())
            .finish()
    }
}
