use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use tokio::sync::oneshot;

use courier_core::{Envelope, RequestId};

use crate::error::{Error, Result};

pub(crate) type Reply = oneshot::Sender<Result<Envelope>>;

struct Waiter {
    reply: Reply,
    /// Client the request was addressed to; `None` for broker requests
    responder: Option<String>,
    /// Addressed to ourselves, so the request itself arrives before its reply
    loops_back: bool,
}

/// How an inbound data envelope carrying a pending id relates to the request
pub(crate) enum Correlation {
    /// Answer from the addressed client; the waiter has been removed
    Reply(Reply),
    /// A self-addressed request arriving back as inbound traffic
    Echo,
    /// Sent by a client other than the one addressed
    Foreign,
    /// Nothing pending under this id
    Unknown,
}

/// Outstanding requests awaiting a correlated reply.
///
/// Each entry is settled at most once: whichever of the reply, the timeout,
/// or the disconnect removes it first wins.
#[derive(Default)]
pub(crate) struct PendingRequests {
    inner: Mutex<HashMap<RequestId, Waiter>>,
}

impl PendingRequests {
    pub fn register(
        &self,
        id: RequestId,
        responder: Option<String>,
        loops_back: bool,
    ) -> oneshot::Receiver<Result<Envelope>> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(
            id,
            Waiter {
                reply: tx,
                responder,
                loops_back,
            },
        );
        rx
    }

    /// Classify a data envelope from `from` that carries `id`.
    ///
    /// A self-addressed request is echoed exactly once; whatever comes back
    /// from us after that is the reply.
    pub fn correlate(&self, id: &RequestId, from: Option<&str>) -> Correlation {
        let mut pending = self.lock();
        let Some(waiter) = pending.get_mut(id) else {
            return Correlation::Unknown;
        };

        if waiter.responder.as_deref().is_some_and(|responder| Some(responder) != from) {
            return Correlation::Foreign;
        }
        if waiter.loops_back {
            waiter.loops_back = false;
            return Correlation::Echo;
        }

        match pending.remove(id) {
            Some(waiter) => Correlation::Reply(waiter.reply),
            None => Correlation::Unknown,
        }
    }

    /// Settle a request; false if it already settled or never existed
    pub fn resolve(&self, id: &RequestId, outcome: Result<Envelope>) -> bool {
        match self.lock().remove(id) {
            Some(waiter) => {
                // The waiter may have given up already
                let _ = waiter.reply.send(outcome);
                true
            }
            None => false,
        }
    }

    pub fn cancel(&self, id: &RequestId) -> bool {
        self.lock().remove(id).is_some()
    }

    /// Reject everything outstanding
    pub fn fail_all(&self, reason: &str) -> usize {
        let drained: Vec<_> = self.lock().drain().collect();
        let count = drained.len();
        for (_, waiter) in drained {
            let _ = waiter.reply.send(Err(Error::Disconnected(reason.to_string())));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<RequestId, Waiter>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
