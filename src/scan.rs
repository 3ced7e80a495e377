use std::pin::Pin;
use std::task::{Context, Poll};

use async_channel::Receiver;
use futures_core::Stream;
use tracing::{debug, info};

use crate::error::ErrorKind;
use crate::{BluetoothId, CentralManager, Manager, ManagerState, Peripheral, Result, ValueStream};

/// A stream of newly discovered peripherals, returned by [`CentralManager::scan`].
///
/// The stream ends when the scan is stopped or replaced by a newer scan, and fails when the radio leaves the powered
/// on state. Dropping it stops the scan.
pub struct ScanStream {
    manager: CentralManager,
    services: Vec<BluetoothId>,
    phase: Phase,
}

enum Phase {
    Idle,
    WaitingForPower(ValueStream<ManagerState>),
    Scanning {
        session: u64,
        receiver: Pin<Box<Receiver<Result<Peripheral>>>>,
    },
    Finished,
}

impl ScanStream {
    pub(crate) fn new(manager: CentralManager, services: Vec<BluetoothId>) -> Self {
        ScanStream {
            manager,
            services,
            phase: Phase::Idle,
        }
    }

    fn start(&mut self) {
        let shared = &self.manager.0;
        let start = shared.begin_scan();
        if start.replaced_scan {
            shared.backend.stop_scan();
        }
        info!("starting scan for {:?}", self.services);
        self.phase = Phase::Scanning {
            session: start.session,
            receiver: Box::pin(start.receiver),
        };
        shared.backend.scan(&self.services, false);
    }
}

impl Stream for ScanStream {
    type Item = Result<Peripheral>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        loop {
            match &mut this.phase {
                Phase::Idle => this.phase = Phase::WaitingForPower(this.manager.state_updates()),
                Phase::WaitingForPower(states) => match Pin::new(states).poll_next(cx) {
                    Poll::Ready(Some(ManagerState::PoweredOn)) => this.start(),
                    Poll::Ready(Some(state)) if state.is_transient() => {
                        debug!("scan waiting while manager state is {:?}", state);
                    }
                    Poll::Ready(Some(state)) => {
                        debug!("cannot scan while manager state is {:?}", state);
                        this.phase = Phase::Finished;
                        return Poll::Ready(Some(Err(ErrorKind::NotPoweredOn.into())));
                    }
                    Poll::Ready(None) => {
                        this.phase = Phase::Finished;
                        return Poll::Ready(Some(Err(ErrorKind::UnknownState.into())));
                    }
                    Poll::Pending => return Poll::Pending,
                },
                Phase::Scanning { receiver, .. } => {
                    return match receiver.as_mut().poll_next(cx) {
                        Poll::Ready(None) => {
                            this.phase = Phase::Finished;
                            Poll::Ready(None)
                        }
                        other => other,
                    }
                }
                Phase::Finished => return Poll::Ready(None),
            }
        }
    }
}

impl Drop for ScanStream {
    fn drop(&mut self) {
        if let Phase::Scanning { session, .. } = self.phase {
            if self.manager.0.end_scan(session) {
                debug!("scan stream dropped, stopping scan");
                self.manager.0.backend.stop_scan();
            }
        }
    }
}

impl std::fmt::Debug for ScanStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanStream").field("services", &self.services).finish()
    }
}
