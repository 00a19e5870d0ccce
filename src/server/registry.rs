//! Registry of connected clients.
//!
//! Holds every handshaken connection in insertion order, plus the
//! connections that have been accepted but have not finished their
//! handshake yet. Both lists live behind one mutex; iteration for sends
//! always works on a snapshot so connection threads can remove themselves
//! at any time.
//!
//! Client identifiers are not required to be unique. [`ClientRegistry::send_to`]
//! delivers to the first connection whose identifier matches.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;

use super::connection::ClientConn;
use super::framing;

#[derive(Debug, Default)]
struct Inner {
    /// Handshaken connections, in registration order.
    active: Vec<Arc<ClientConn>>,
    /// Accepted connections still waiting for their handshake.
    pending: Vec<Arc<ClientConn>>,
}

/// Thread-safe collection of client connections.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    inner: Mutex<Inner>,
}

impl ClientRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track a freshly accepted connection until its handshake completes.
    pub(crate) fn track_pending(&self, conn: Arc<ClientConn>) {
        self.lock().pending.push(conn);
    }

    /// Promote a pending connection to an active client.
    ///
    /// Returns `false` if the connection is not (or no longer) pending, or
    /// has already been closed; it is then never registered.
    pub fn add(&self, conn: &Arc<ClientConn>) -> bool {
        let mut inner = self.lock();
        let Some(position) = inner.pending.iter().position(|c| c.key() == conn.key()) else {
            return false;
        };
        let conn = inner.pending.remove(position);
        if conn.is_closed() {
            return false;
        }
        inner.active.push(conn);
        true
    }

    /// Remove a connection, whether active or pending.
    ///
    /// Idempotent: removing an absent connection is a no-op that returns
    /// `false`. Matching is by connection key, never by client identifier.
    pub fn remove(&self, conn: &ClientConn) -> bool {
        let key = conn.key();
        let mut inner = self.lock();
        let before = inner.active.len() + inner.pending.len();
        inner.active.retain(|c| c.key() != key);
        inner.pending.retain(|c| c.key() != key);
        before != inner.active.len() + inner.pending.len()
    }

    /// Number of active (handshaken) clients.
    pub fn len(&self) -> usize {
        self.lock().active.len()
    }

    /// Whether there are no active clients.
    pub fn is_empty(&self) -> bool {
        self.lock().active.is_empty()
    }

    /// Number of connections still in their handshake.
    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    /// Identifiers of active clients, in registration order.
    pub fn client_ids(&self) -> Vec<String> {
        self.lock()
            .active
            .iter()
            .filter_map(|c| c.client_id().map(str::to_owned))
            .collect()
    }

    /// Snapshot of active connections, in registration order.
    pub fn snapshot(&self) -> Vec<Arc<ClientConn>> {
        self.lock().active.clone()
    }

    /// Send `value` to every active client.
    ///
    /// The value is encoded once. A client whose send fails is torn down;
    /// delivery to the remaining clients continues. Returns the number of
    /// clients that accepted the write.
    pub fn broadcast<T: Serialize + ?Sized>(&self, value: &T) -> usize {
        let encoded = match framing::encode(value) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!("[Server] Not broadcasting: {e}");
                return 0;
            }
        };
        self.snapshot()
            .iter()
            .filter(|conn| conn.send_raw(&encoded))
            .count()
    }

    /// Send `value` to the first active client registered as `client_id`.
    ///
    /// Returns `false` if no client matches or the send failed.
    pub fn send_to<T: Serialize + ?Sized>(&self, client_id: &str, value: &T) -> bool {
        let target = self
            .lock()
            .active
            .iter()
            .find(|c| c.client_id() == Some(client_id))
            .cloned();
        match target {
            Some(conn) => conn.send(value),
            None => {
                log::debug!("[Server] No client registered as \"{client_id}\"");
                false
            }
        }
    }

    /// Close every connection, active and pending, and empty the registry.
    ///
    /// Returns how many connections this call tore down; one closed
    /// concurrently by its own thread is not counted.
    pub fn close_all(&self) -> usize {
        let drained: Vec<Arc<ClientConn>> = {
            let mut inner = self.lock();
            let mut all = std::mem::take(&mut inner.active);
            all.append(&mut inner.pending);
            all
        };
        drained.iter().filter(|conn| conn.close()).count()
    }
}
