//! Per-connection state for TCP clients.
//!
//! Each accepted socket gets a [`ClientConn`] and a dedicated thread that
//! runs the handshake and then the receive loop until the peer goes away
//! or the server shuts the socket down.
//!
//! The socket is held three times: the thread owns the read half, sends go
//! through a mutex-guarded writer, and a separate control handle lets
//! [`ClientConn::close`] shut the socket down without waiting for a writer
//! that may be blocked.

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};
use std::thread;

use serde::Serialize;
use serde_json::{json, Value};

use super::dispatch::Dispatcher;
use super::framing::{self, FrameError};
use super::registry::ClientRegistry;
use crate::constants::{HANDSHAKE_ID_KEY, MAX_BUFFERED_BYTES, RECV_CHUNK_SIZE};

/// Why a handshake did not produce a registered client.
#[derive(Debug)]
pub enum HandshakeError {
    /// The peer closed the socket (or the read failed) before sending anything.
    Disconnected,
    /// The first message could not be decoded.
    Frame(FrameError),
    /// Bytes arrived but no complete message was among them.
    Empty,
    /// The first message was valid JSON but not an object.
    NotAnObject,
    /// The handshake object had no non-empty string `id`.
    MissingId,
    /// The registry no longer tracks this connection (server stopping).
    Rejected,
}

impl std::fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Peer disconnected before handshake"),
            Self::Frame(e) => write!(f, "Malformed handshake: {e}"),
            Self::Empty => write!(f, "Handshake contained no complete message"),
            Self::NotAnObject => write!(f, "Handshake is not a JSON object"),
            Self::MissingId => write!(f, "Handshake has no \"{HANDSHAKE_ID_KEY}\" field"),
            Self::Rejected => write!(f, "Connection no longer accepted by the registry"),
        }
    }
}

impl std::error::Error for HandshakeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Frame(e) => Some(e),
            _ => None,
        }
    }
}

impl From<FrameError> for HandshakeError {
    fn from(e: FrameError) -> Self {
        Self::Frame(e)
    }
}

/// Server-side state for a single TCP client.
pub struct ClientConn {
    /// Process-unique key; the connection's identity in the registry.
    key: u64,
    /// Identifier supplied by the client during the handshake.
    client_id: OnceLock<String>,
    /// Remote address, if the OS reported one.
    peer_addr: Option<SocketAddr>,
    /// Serializes writes so each frame goes out whole.
    writer: Mutex<TcpStream>,
    /// Used only to shut the socket down.
    control: TcpStream,
    /// Set exactly once by [`close`](Self::close).
    closed: AtomicBool,
    /// Registry this connection removes itself from on close.
    registry: Weak<ClientRegistry>,
}

impl std::fmt::Debug for ClientConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConn")
            .field("key", &self.key)
            .field("client_id", &self.client_id.get())
            .field("peer_addr", &self.peer_addr)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl ClientConn {
    /// Wrap an accepted stream.
    ///
    /// Returns the connection together with the read half, which belongs to
    /// whichever thread runs the receive loop.
    pub(crate) fn new(
        stream: TcpStream,
        registry: &Arc<ClientRegistry>,
    ) -> std::io::Result<(Arc<Self>, TcpStream)> {
        if let Err(e) = stream.set_nodelay(true) {
            log::debug!("[Server] Could not disable Nagle: {e}");
        }
        let writer = stream.try_clone()?;
        let control = stream.try_clone()?;
        let conn = Arc::new(Self {
            key: next_key(),
            client_id: OnceLock::new(),
            peer_addr: stream.peer_addr().ok(),
            writer: Mutex::new(writer),
            control,
            closed: AtomicBool::new(false),
            registry: Arc::downgrade(registry),
        });
        Ok((conn, stream))
    }

    /// Wrap an accepted stream, track it as pending and start its thread.
    ///
    /// The thread performs the handshake, then runs the receive loop. The
    /// connection is closed when the thread exits, whatever the reason.
    pub(crate) fn spawn(
        stream: TcpStream,
        registry: &Arc<ClientRegistry>,
        dispatcher: Arc<Dispatcher>,
    ) -> std::io::Result<Arc<Self>> {
        let (conn, mut reader) = Self::new(stream, registry)?;
        registry.track_pending(Arc::clone(&conn));

        let thread_conn = Arc::clone(&conn);
        let spawned = thread::Builder::new()
            .name(format!("gulp-conn-{}", conn.key))
            .spawn(move || {
                let conn = scopeguard::guard(thread_conn, |conn| {
                    conn.close();
                });
                match conn.perform_handshake(&mut reader) {
                    Ok(backlog) => {
                        for message in &backlog {
                            dispatcher.dispatch(message);
                        }
                        conn.receive_loop(&mut reader, &dispatcher);
                    }
                    Err(e) => log::warn!("[Server] Handshake failed for {}: {e}", conn.label()),
                }
            });

        if let Err(e) = spawned {
            conn.close();
            return Err(e);
        }
        Ok(conn)
    }

    /// Process-unique connection key.
    pub fn key(&self) -> u64 {
        self.key
    }

    /// Identifier supplied during the handshake, once it has completed.
    pub fn client_id(&self) -> Option<&str> {
        self.client_id.get().map(String::as_str)
    }

    /// Remote address of the client.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Whether [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Record the client identifier. Only the first call has an effect.
    pub(crate) fn set_client_id(&self, id: &str) {
        let _ = self.client_id.set(id.to_owned());
    }

    /// Read the handshake and register with the owning registry.
    ///
    /// On success returns any further messages that arrived in the same
    /// read, so the caller can dispatch them before entering the loop.
    pub(crate) fn perform_handshake<R: Read>(
        self: &Arc<Self>,
        reader: &mut R,
    ) -> Result<Vec<Value>, HandshakeError> {
        let bytes = recv_message(reader);
        if bytes.is_empty() {
            return Err(HandshakeError::Disconnected);
        }

        let mut messages = framing::split(&bytes)?;
        if messages.is_empty() {
            return Err(HandshakeError::Empty);
        }
        let hello = messages.remove(0);
        let Some(object) = hello.as_object() else {
            return Err(HandshakeError::NotAnObject);
        };
        let id = object
            .get(HANDSHAKE_ID_KEY)
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or(HandshakeError::MissingId)?;

        self.set_client_id(id);
        let registry = self.registry.upgrade().ok_or(HandshakeError::Rejected)?;
        if !registry.add(self) {
            return Err(HandshakeError::Rejected);
        }
        log::info!(
            "[Server] \"{}\" connected - Total number connections: {}",
            id,
            registry.len()
        );

        self.send(&json!({ "handshake": "hello" }));
        Ok(messages)
    }

    /// Receive messages until the peer disconnects or the socket is shut down.
    ///
    /// Each decoded message is dispatched synchronously and in order. A
    /// receive cycle that fails to decode is logged and dropped; the
    /// connection stays up.
    pub(crate) fn receive_loop<R: Read>(&self, reader: &mut R, dispatcher: &Dispatcher) {
        while !self.is_closed() {
            let bytes = recv_message(reader);
            if bytes.is_empty() {
                break;
            }
            match framing::split(&bytes) {
                Ok(messages) => {
                    for message in &messages {
                        dispatcher.dispatch(message);
                    }
                }
                Err(e) => {
                    log::warn!("[Server] Dropping receive cycle from {}: {e}", self.label());
                }
            }
        }
    }

    /// Encode `value` and send it to this client.
    ///
    /// Fire-and-forget: returns `false` if the connection is closed or the
    /// write fails, in which case the connection is torn down.
    pub fn send<T: Serialize + ?Sized>(&self, value: &T) -> bool {
        match framing::encode(value) {
            Ok(bytes) => self.send_raw(&bytes),
            Err(e) => {
                log::error!("[Server] Not sending to {}: {e}", self.label());
                false
            }
        }
    }

    /// Send pre-encoded bytes (already sentinel-terminated) to this client.
    pub fn send_raw(&self, encoded: &[u8]) -> bool {
        if self.is_closed() {
            return false;
        }
        let result = {
            let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
            writer.write_all(encoded).and_then(|()| writer.flush())
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                log::warn!("[Server] Write error for {}: {e}", self.label());
                self.close();
                false
            }
        }
    }

    /// Tear the connection down.
    ///
    /// Idempotent: the first call shuts the socket down (unblocking the
    /// reader thread) and removes the connection from the registry; later
    /// calls do nothing. Returns `true` for the call that did the teardown.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }

        if let Err(e) = self.control.shutdown(Shutdown::Both) {
            if e.kind() != ErrorKind::NotConnected {
                log::debug!("[Server] Shutdown error for {}: {e}", self.label());
            }
        }

        let remaining = match self.registry.upgrade() {
            Some(registry) => {
                registry.remove(self);
                registry.len()
            }
            None => 0,
        };
        log::info!(
            "[Server] \"{}\" disconnected - Total number of connections {}",
            self.client_id().unwrap_or("Unknown"),
            remaining
        );
        true
    }

    /// Human-readable name for log lines.
    fn label(&self) -> String {
        match (self.client_id(), self.peer_addr) {
            (Some(id), _) => format!("\"{id}\""),
            (None, Some(addr)) => addr.to_string(),
            (None, None) => format!("connection #{}", self.key),
        }
    }
}

/// Read from `reader` until the accumulated bytes end with the sentinel.
///
/// Returns early with whatever has accumulated (possibly nothing) when a
/// read returns zero bytes. A read error, or a peer that exceeds
/// [`MAX_BUFFERED_BYTES`] without a sentinel, yields an empty buffer, which
/// callers treat as a disconnect.
pub(crate) fn recv_message<R: Read>(reader: &mut R) -> Vec<u8> {
    let mut accumulated = Vec::new();
    let mut chunk = [0u8; RECV_CHUNK_SIZE];

    while !framing::is_complete(&accumulated) {
        match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                accumulated.extend_from_slice(&chunk[..n]);
                if accumulated.len() > MAX_BUFFERED_BYTES {
                    log::error!(
                        "[Server] Peer sent {} bytes without a message terminator",
                        accumulated.len()
                    );
                    return Vec::new();
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                log::debug!("[Server] Receiving error: {e}");
                return Vec::new();
            }
        }
    }
    accumulated
}

/// Generate a process-unique connection key.
fn next_key() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}
