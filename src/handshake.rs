//! Add→announce handshake coordination.
//!
//! An add request spawns a client and then blocks, bounded by a timeout,
//! until that client announces itself. Pending waits are kept in a
//! registry keyed by the spawned executable's base name — the one token
//! the announcing client echoes back in its executable-name field — with
//! a FIFO of one-shot completion slots per key, so concurrent adds of
//! different executables can never cross-wire. Two concurrent adds of the
//! same executable resolve in FIFO order.
//!
//! Delivery uses `oneshot` channels, so the announce path never blocks:
//! when no add is waiting the notification is simply dropped while the
//! announcing client still receives its own reply.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{AppError, Result};

/// Payload delivered to a blocked add handler when its client announces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeReply {
    /// The server's own application name.
    pub server_name: String,
    /// The server's formatted capability string.
    pub capabilities: String,
}

type PendingQueue = VecDeque<(u64, oneshot::Sender<HandshakeReply>)>;

/// Registry of in-flight add→announce handshakes.
#[derive(Debug, Default)]
pub struct AnnounceCoordinator {
    pending: Mutex<HashMap<String, PendingQueue>>,
    next_id: AtomicU64,
}

impl AnnounceCoordinator {
    /// Create an empty coordinator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending handshake under `key` before spawning, so an
    /// early announce cannot slip past the waiter.
    #[must_use]
    pub fn register(&self, key: &str) -> PendingAnnounce<'_> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .entry(key.to_owned())
            .or_default()
            .push_back((id, tx));
        PendingAnnounce {
            coordinator: self,
            key: key.to_owned(),
            id,
            rx,
        }
    }

    /// Deliver `reply` to the oldest live waiter registered under `key`.
    ///
    /// Slots whose waiter already timed out are discarded along the way.
    /// Returns whether any waiter received the reply.
    pub fn complete(&self, key: &str, reply: &HandshakeReply) -> bool {
        let mut pending = self.pending.lock();
        let Some(queue) = pending.get_mut(key) else {
            return false;
        };
        while let Some((id, tx)) = queue.pop_front() {
            if tx.send(reply.clone()).is_ok() {
                if queue.is_empty() {
                    pending.remove(key);
                }
                debug!(key, id, "handshake completed");
                return true;
            }
        }
        pending.remove(key);
        false
    }

    /// Number of pending waits registered under `key`.
    #[must_use]
    pub fn pending_count(&self, key: &str) -> usize {
        self.pending.lock().get(key).map_or(0, VecDeque::len)
    }

    fn abandon(&self, key: &str, id: u64) {
        let mut pending = self.pending.lock();
        if let Some(queue) = pending.get_mut(key) {
            queue.retain(|(slot, _)| *slot != id);
            if queue.is_empty() {
                pending.remove(key);
            }
        }
    }
}

/// One in-flight handshake wait. Dropping it (or timing out) removes the
/// pending slot, so an expired add fails closed: a later announce for the
/// same key cannot resurrect it.
#[derive(Debug)]
pub struct PendingAnnounce<'a> {
    coordinator: &'a AnnounceCoordinator,
    key: String,
    id: u64,
    rx: oneshot::Receiver<HandshakeReply>,
}

impl PendingAnnounce<'_> {
    /// Block until the matching announce arrives, the monotonic deadline
    /// `bound` expires, or the supervisor cancels.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Timeout` when the bound elapses and
    /// `AppError::Cancelled` on shutdown.
    pub async fn wait(
        mut self,
        bound: Duration,
        cancel: &CancellationToken,
    ) -> Result<HandshakeReply> {
        tokio::select! {
            () = cancel.cancelled() => Err(AppError::Cancelled(
                "shutting down while awaiting announce".into(),
            )),
            waited = tokio::time::timeout(bound, &mut self.rx) => match waited {
                Ok(Ok(reply)) => Ok(reply),
                Ok(Err(_)) => Err(AppError::Cancelled(
                    "announce coordinator dropped the pending slot".into(),
                )),
                Err(_) => Err(AppError::Timeout(format!(
                    "no announce for {} within {}s",
                    self.key, bound.as_secs()
                ))),
            },
        }
    }
}

impl Drop for PendingAnnounce<'_> {
    fn drop(&mut self) {
        self.coordinator.abandon(&self.key, self.id);
    }
}

/// Correlation key for an executable path: its base name, which the
/// announcing client echoes back.
#[must_use]
pub fn executable_key(program: &str) -> String {
    Path::new(program).file_name().map_or_else(
        || program.to_owned(),
        |base| base.to_string_lossy().into_owned(),
    )
}
