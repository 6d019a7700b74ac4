//! Inbound Requests
//!
//! A [`Request`] is the server-side representation of one inbound call: the
//! frozen call arguments, the headers it arrived with, the endpoint it
//! targeted, and a one-shot completion slot that records whether and how the
//! request was answered.
//!
//! # Completion slot
//!
//! At most one response is ever sent per request. The slot starts unset and
//! transitions to done exactly once, either with a success or with the
//! transport failure that prevented delivery. Any number of tasks may wait on
//! the transition; every waiter observes the same final outcome. A transport
//! failure during [`Request::respond`] is stored in the slot rather than
//! returned to the handler, so a client that disconnects mid-handler cannot
//! crash the dispatch loop.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::codec;
use crate::error::IpcError;

/// Write half of the duplex connection a request arrived on.
///
/// Narrowed to a trait so request semantics are testable without sockets.
#[async_trait::async_trait]
pub(crate) trait ReplySink: Send + Sync {
    /// Send one text frame to the peer.
    async fn send_text(&self, text: String) -> Result<(), IpcError>;
}

/// Single-assignment completion slot with a poisoned state.
///
/// The slot is the request's core invariant: it transitions from unset to
/// done exactly once, and a stored failure is re-raised to every waiter.
pub(crate) struct ResponseCell {
    slot: Mutex<Option<Result<(), Arc<IpcError>>>>,
    notify: Notify,
}

impl ResponseCell {
    pub(crate) fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    /// Record the outcome. Returns false when the slot was already set.
    pub(crate) fn complete(&self, outcome: Result<(), Arc<IpcError>>) -> bool {
        {
            let mut slot = self.slot.lock();
            if slot.is_some() {
                return false;
            }
            *slot = Some(outcome);
        }
        self.notify.notify_waiters();
        true
    }

    pub(crate) fn is_done(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Wait for the slot to transition, then return the stored outcome.
    pub(crate) async fn wait(&self) -> Result<(), Arc<IpcError>> {
        loop {
            let notified = self.notify.notified();
            if let Some(outcome) = self.slot.lock().clone() {
                return outcome;
            }
            notified.await;
        }
    }
}

struct RequestInner {
    data: Map<String, Value>,
    headers: Map<String, Value>,
    endpoint: String,
    sink: Arc<dyn ReplySink>,
    /// Set by the first `respond` call before any I/O happens, so two
    /// concurrent calls cannot both write a frame.
    claimed: AtomicBool,
    done: ResponseCell,
}

/// One inbound call.
///
/// Cheap to clone; a handler may hand the request off and have it answered
/// elsewhere, with the original caller observing completion through
/// [`Request::wait_until_done`].
#[derive(Clone)]
pub struct Request {
    inner: Arc<RequestInner>,
}

impl Request {
    pub(crate) fn new(
        data: Map<String, Value>,
        endpoint: String,
        headers: Map<String, Value>,
        sink: Arc<dyn ReplySink>,
    ) -> Self {
        Self {
            inner: Arc::new(RequestInner {
                data,
                headers,
                endpoint,
                sink,
                claimed: AtomicBool::new(false),
                done: ResponseCell::new(),
            }),
        }
    }

    /// The endpoint this request pointed to.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    /// The headers the request provided.
    ///
    /// Present even when authorization failed upstream.
    #[must_use]
    pub fn headers(&self) -> &Map<String, Value> {
        &self.inner.headers
    }

    /// Look up one call argument. The data is materialized from the wire
    /// frame and frozen; absent keys yield `None`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.inner.data.get(key)
    }

    /// All the keys of the data the request provided.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.inner.data.keys().map(String::as_str)
    }

    /// All the values of the data the request provided.
    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.inner.data.values()
    }

    /// (key, value) pairs of the data the request provided.
    pub fn items(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.inner.data.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of call arguments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.data.len()
    }

    /// Whether the request carried no call arguments.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.data.is_empty()
    }

    /// Whether a response attempt (success or failure) has been recorded.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.inner.done.is_done()
    }

    /// Wait until this request is completed.
    ///
    /// Useful when a request is answered somewhere other than the handler it
    /// was dispatched to. If delivery of the response failed, the stored
    /// failure is returned to every waiter.
    pub async fn wait_until_done(&self) -> Result<(), Arc<IpcError>> {
        self.inner.done.wait().await
    }

    /// Send a JSON response to this request.
    ///
    /// Transport failures are captured into the completion slot and surface
    /// through [`Request::wait_until_done`], not through this call.
    ///
    /// # Errors
    ///
    /// Returns [`IpcError::AlreadyResponded`] when a response attempt was
    /// already made; at-most-once response is the request invariant.
    pub async fn respond<T: Serialize>(&self, data: &T) -> Result<(), IpcError> {
        if self
            .inner
            .claimed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(IpcError::AlreadyResponded);
        }

        let outcome = match codec::encode(data) {
            Ok(text) => {
                debug!(endpoint = %self.inner.endpoint, payload = %text, "IPC ->");
                self.inner.sink.send_text(text).await
            }
            Err(e) => Err(e),
        };

        if let Err(e) = outcome {
            warn!(
                endpoint = %self.inner.endpoint,
                error = %e,
                "Response delivery failed; storing failure for waiters"
            );
            self.inner.done.complete(Err(Arc::new(e)));
        } else {
            self.inner.done.complete(Ok(()));
        }
        Ok(())
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("endpoint", &self.inner.endpoint)
            .field("data", &self.inner.data)
            .field("done", &self.is_done())
            .finish()
    }
}
