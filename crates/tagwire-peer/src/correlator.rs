//! Matches inbound reply frames to outstanding requests.
//!
//! Requests are keyed by the message type their reply will carry
//! (`request type + 1`), so at most one request per reply type can be in
//! flight on a channel. A second request for a busy reply type is refused
//! with [`PeerError::RequestInFlight`] instead of displacing the first.
//!
//! Every pending request completes exactly once: with the reply frame, with
//! [`PeerError::Timeout`], or with [`PeerError::Disconnected`] when the
//! channel dies first.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use tagwire_frame::Frame;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{PeerError, Result};

/// Outstanding request table for one channel.
#[derive(Clone)]
pub struct RequestCorrelator {
    inner: Arc<CorrelatorInner>,
}

struct CorrelatorInner {
    pending: Mutex<HashMap<u32, PendingRequest>>,
    next_id: AtomicU64,
    timeout: Duration,
}

struct PendingRequest {
    id: u64,
    issued_at: Instant,
    completion: oneshot::Sender<Result<Frame>>,
    timer: AbortHandle,
}

impl PendingRequest {
    fn complete(self, outcome: Result<Frame>) {
        self.timer.abort();
        // The caller may have dropped its ReplyFuture; the outcome is then discarded.
        let _ = self.completion.send(outcome);
    }
}

impl RequestCorrelator {
    /// Create an empty correlator whose requests expire after `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(CorrelatorInner {
                pending: Mutex::new(HashMap::with_capacity(32)),
                next_id: AtomicU64::new(1),
                timeout,
            }),
        }
    }

    /// Register a request whose reply will carry `expected_type`.
    ///
    /// Returns the request id and a future resolving to the reply. A timeout
    /// watch is started on the current Tokio runtime.
    pub fn add_request(&self, expected_type: u32) -> Result<(u64, ReplyFuture)> {
        let mut pending = self.inner.lock();
        if pending.contains_key(&expected_type) {
            return Err(PeerError::RequestInFlight(expected_type));
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        let issued_at = Instant::now();
        let timer = tokio::spawn(watch_timeout(
            Arc::downgrade(&self.inner),
            expected_type,
            id,
            issued_at + self.inner.timeout,
        ))
        .abort_handle();

        pending.insert(
            expected_type,
            PendingRequest {
                id,
                issued_at,
                completion: tx,
                timer,
            },
        );
        debug!(id, expected_type, "request registered");

        Ok((
            id,
            ReplyFuture {
                expected_type,
                rx,
            },
        ))
    }

    /// Offer an inbound frame to the pending requests.
    ///
    /// Returns `None` when the frame completed a pending request (consumed),
    /// or gives the frame back when nothing was waiting for its type.
    pub fn filter_message(&self, frame: Frame) -> Option<Frame> {
        let matched = self.inner.lock().remove(&frame.msg_type);
        match matched {
            Some(request) => {
                debug!(
                    id = request.id,
                    msg_type = frame.msg_type,
                    elapsed = ?request.issued_at.elapsed(),
                    "reply matched"
                );
                request.complete(Ok(frame));
                None
            }
            None => Some(frame),
        }
    }

    /// Withdraw request `id` without completing it through the wire.
    ///
    /// Its future resolves with [`PeerError::Closed`]. Returns false when the
    /// request already completed.
    pub fn cancel(&self, expected_type: u32, id: u64) -> bool {
        let removed = {
            let mut pending = self.inner.lock();
            match pending.get(&expected_type) {
                Some(request) if request.id == id => pending.remove(&expected_type),
                _ => None,
            }
        };
        match removed {
            Some(request) => {
                request.complete(Err(PeerError::Closed));
                true
            }
            None => false,
        }
    }

    /// Complete every pending request with [`PeerError::Disconnected`].
    pub fn fail_all(&self, reason: &str) -> usize {
        let drained: Vec<PendingRequest> = {
            let mut pending = self.inner.lock();
            pending.drain().map(|(_, request)| request).collect()
        };
        let count = drained.len();
        for request in drained {
            request.complete(Err(PeerError::Disconnected(reason.to_string())));
        }
        if count > 0 {
            debug!(count, reason, "failed pending requests");
        }
        count
    }

    /// Number of requests awaiting a reply.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Returns true if no request is awaiting a reply.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The timeout applied to each request.
    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }
}

impl CorrelatorInner {
    fn lock(&self) -> MutexGuard<'_, HashMap<u32, PendingRequest>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn expire(&self, expected_type: u32, id: u64) {
        let expired = {
            let mut pending = self.lock();
            match pending.get(&expected_type) {
                Some(request) if request.id == id => pending.remove(&expected_type),
                _ => None,
            }
        };
        if let Some(request) = expired {
            warn!(id, expected_type, timeout = ?self.timeout, "request timed out");
            // Runs inside the timer task itself, so there is nothing to abort.
            let _ = request.completion.send(Err(PeerError::Timeout {
                msg_type: expected_type,
                after: self.timeout,
            }));
        }
    }
}

async fn watch_timeout(
    inner: Weak<CorrelatorInner>,
    expected_type: u32,
    id: u64,
    deadline: Instant,
) {
    tokio::time::sleep_until(deadline).await;
    if let Some(inner) = inner.upgrade() {
        inner.expire(expected_type, id);
    }
}

/// Resolves to the reply of one request.
#[must_use = "a reply future does nothing unless awaited"]
pub struct ReplyFuture {
    expected_type: u32,
    rx: oneshot::Receiver<Result<Frame>>,
}

impl ReplyFuture {
    /// The message type the reply will carry.
    pub fn expected_type(&self) -> u32 {
        self.expected_type
    }
}

impl Future for ReplyFuture {
    type Output = Result<Frame>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(PeerError::Disconnected(
                "request table dropped".to_string(),
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl std::fmt::Debug for ReplyFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplyFuture")
            .field("expected_type", &self.expected_type)
            .finish()
    }
}
