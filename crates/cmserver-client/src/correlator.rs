//! Cookie allocation and pending-request bookkeeping.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;
use tracing::{debug, warn};

use cmserver_protocol::Reply;

use crate::error::{ClientError, ClientResult, DrainReason};

/// Receiving end of one pending request.
pub type Completion = oneshot::Receiver<ClientResult<Reply>>;

type Resolver = oneshot::Sender<ClientResult<Reply>>;

#[derive(Debug, Default)]
struct Pending {
    requests: HashMap<String, Resolver>,
    closed: Option<DrainReason>,
}

/// Maps outstanding cookies to their completion handles.
///
/// Each entry is removed under the lock before it is resolved, so a cookie is
/// completed at most once. After [`drain_all`](Self::drain_all) no new request
/// can be registered.
#[derive(Debug, Default)]
pub struct RequestCorrelator {
    next_cookie: AtomicU64,
    pending: Mutex<Pending>,
}

impl RequestCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocates a fresh cookie and its completion handle.
    ///
    /// # Errors
    ///
    /// [`ClientError::ConnectionClosed`] once the correlator has been drained.
    pub fn register(&self) -> ClientResult<(String, Completion)> {
        let mut pending = self.lock();
        if let Some(reason) = &pending.closed {
            return Err(ClientError::closed(reason.clone()));
        }

        let cookie = (self.next_cookie.fetch_add(1, Ordering::Relaxed) + 1).to_string();
        let (tx, rx) = oneshot::channel();
        pending.requests.insert(cookie.clone(), tx);
        Ok((cookie, rx))
    }

    /// Resolves `cookie` with `reply`. Returns false if nothing was pending.
    pub fn complete(&self, cookie: &str, reply: Reply) -> bool {
        self.settle(cookie, Ok(reply))
    }

    /// Rejects `cookie` with `error`. Returns false if nothing was pending.
    pub fn fail(&self, cookie: &str, error: ClientError) -> bool {
        self.settle(cookie, Err(error))
    }

    fn settle(&self, cookie: &str, result: ClientResult<Reply>) -> bool {
        let Some(resolver) = self.lock().requests.remove(cookie) else {
            warn!(cookie = %cookie, "no pending request for cookie");
            return false;
        };

        if resolver.send(result).is_err() {
            debug!(cookie = %cookie, "caller stopped waiting for reply");
        }
        true
    }

    /// Returns true while `cookie` awaits its reply.
    pub fn is_pending(&self, cookie: &str) -> bool {
        self.lock().requests.contains_key(cookie)
    }

    /// Forgets `cookie` without resolving it, e.g. when the write failed.
    pub fn abandon(&self, cookie: &str) -> bool {
        self.lock().requests.remove(cookie).is_some()
    }

    /// Number of outstanding requests.
    pub fn len(&self) -> usize {
        self.lock().requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rejects every outstanding request and refuses new ones.
    ///
    /// Returns how many requests were rejected. Later calls keep the first
    /// reason.
    pub fn drain_all(&self, reason: DrainReason) -> usize {
        let drained: Vec<(String, Resolver)> = {
            let mut pending = self.lock();
            if pending.closed.is_none() {
                pending.closed = Some(reason.clone());
            }
            pending.requests.drain().collect()
        };

        let count = drained.len();
        for (cookie, resolver) in drained {
            debug!(cookie = %cookie, reason = %reason, "rejecting pending request");
            let _ = resolver.send(Err(ClientError::closed(reason.clone())));
        }
        count
    }
}
