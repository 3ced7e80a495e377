use futures_channel::oneshot;

use crate::error::ErrorKind;
use crate::{Error, Result};

/// Runs a closure when dropped unless defused.
pub struct ScopeGuard<F: FnOnce()> {
    dropfn: Option<F>,
}

impl<F: FnOnce()> ScopeGuard<F> {
    pub fn defuse(mut self) {
        self.dropfn = None;
    }
}

impl<F: FnOnce()> Drop for ScopeGuard<F> {
    fn drop(&mut self) {
        if let Some(dropfn) = self.dropfn.take() {
            dropfn();
        }
    }
}

pub fn defer<F: FnOnce()>(dropfn: F) -> ScopeGuard<F> {
    ScopeGuard { dropfn: Some(dropfn) }
}

/// Slot for the single outstanding backend request of one kind on one entity.
///
/// Starting a new request fails the previous caller, so only the most recent caller observes the backend's answer.
pub(crate) struct Pending<T> {
    sender: Option<oneshot::Sender<Result<T>>>,
}

impl<T> Pending<T> {
    pub fn new() -> Self {
        Pending { sender: None }
    }

    pub fn begin(&mut self) -> PendingResult<T> {
        if let Some(previous) = self.sender.take() {
            let _ = previous.send(Err(Error::new(
                ErrorKind::Undefined,
                None,
                "superseded by a newer request",
            )));
        }
        let (sender, receiver) = oneshot::channel();
        self.sender = Some(sender);
        PendingResult(receiver)
    }

    pub fn is_pending(&self) -> bool {
        self.sender.as_ref().is_some_and(|x| !x.is_canceled())
    }

    /// Hands `result` to the waiting caller. Returns `false` if nobody was waiting.
    pub fn resolve(&mut self, result: Result<T>) -> bool {
        match self.sender.take() {
            Some(sender) => sender.send(result).is_ok(),
            None => false,
        }
    }

    pub fn fail(&mut self, err: Error) -> bool {
        self.resolve(Err(err))
    }
}

impl<T> Default for Pending<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Pending<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pending").field("is_pending", &self.is_pending()).finish()
    }
}

pub(crate) struct PendingResult<T>(oneshot::Receiver<Result<T>>);

impl<T> PendingResult<T> {
    pub async fn wait(self) -> Result<T> {
        match self.0.await {
            Ok(result) => result,
            Err(oneshot::Canceled) => Err(Error::new(ErrorKind::NotConnected, None, "request abandoned")),
        }
    }
}
