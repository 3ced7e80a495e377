use std::pin::Pin;
use std::task::{Context, Poll};

use async_broadcast::{InactiveReceiver, Receiver, Sender};
use futures_core::Stream;

const CAPACITY: usize = 32;

/// A value cell with a list of interested listeners.
///
/// Listeners created with [`Observable::subscribe`] receive the current value first and then every published value.
/// Slow listeners lose the oldest values once `CAPACITY` values are queued.
pub(crate) struct Observable<T: Clone> {
    value: T,
    sender: Sender<T>,
    // keeps the channel open while nobody is listening
    _inactive: InactiveReceiver<T>,
}

impl<T: Clone + Send + Sync + 'static> Observable<T> {
    pub fn new(value: T) -> Self {
        let (mut sender, receiver) = async_broadcast::broadcast(CAPACITY);
        sender.set_overflow(true);
        sender.set_await_active(false);
        Observable {
            value,
            sender,
            _inactive: receiver.deactivate(),
        }
    }

    pub fn get(&self) -> &T {
        &self.value
    }

    /// Publishes `value` to every listener, even if it equals the current one.
    pub fn publish(&mut self, value: T) {
        self.value = value.clone();
        let _ = self.sender.try_broadcast(value);
    }

    /// A stream yielding the current value and every later one.
    pub fn subscribe(&self) -> ValueStream<T> {
        ValueStream {
            current: Some(self.value.clone()),
            receiver: self.sender.new_receiver(),
        }
    }

    /// A stream yielding only values published after this call.
    pub fn changes(&self) -> ValueStream<T> {
        ValueStream {
            current: None,
            receiver: self.sender.new_receiver(),
        }
    }
}

impl<T: Clone + PartialEq + Send + Sync + 'static> Observable<T> {
    /// Replaces the value and notifies listeners. Returns `false` without notifying if nothing changed.
    pub fn set(&mut self, value: T) -> bool {
        if self.value == value {
            false
        } else {
            self.publish(value);
            true
        }
    }
}

impl<T: Clone + std::fmt::Debug> std::fmt::Debug for Observable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Observable").field(&self.value).finish()
    }
}

/// A stream of values of an observable field, starting with the value current at subscription time.
///
/// The stream ends when the owner of the field goes away (for example when a characteristic is invalidated).
pub struct ValueStream<T: Clone> {
    current: Option<T>,
    receiver: Receiver<T>,
}

impl<T: Clone> Unpin for ValueStream<T> {}

impl<T: Clone> Stream for ValueStream<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        if let Some(value) = self.current.take() {
            return Poll::Ready(Some(value));
        }
        Pin::new(&mut self.receiver).poll_next(cx)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let (lower, upper) = self.receiver.size_hint();
        let extra = usize::from(self.current.is_some());
        (lower + extra, upper.map(|x| x + extra))
    }
}

impl<T: Clone> std::fmt::Debug for ValueStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValueStream").finish_non_exhaustive()
    }
}
