//! TCP listener and server lifecycle.
//!
//! [`Server`] binds a `TcpListener`, polls it for connections on its own
//! thread, and spawns a [`ClientConn`] thread for every accepted socket. It
//! owns the [`ClientRegistry`] and [`Dispatcher`] shared by those threads.
//!
//! ```text
//! stopped ──start()──► starting ──bound──► running ──stop()──► stopping ──► stopped
//! ```

use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use serde::Serialize;
use serde_json::Value;

use super::connection::ClientConn;
use super::dispatch::Dispatcher;
use super::registry::ClientRegistry;
use crate::constants::{ACCEPT_POLL_INTERVAL, ACCEPT_RETRY_DELAY};
use crate::settings::ServerAddr;

/// Lifecycle state of a [`Server`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Not listening. Initial and terminal state.
    Stopped,
    /// Binding the listener.
    Starting,
    /// Accepting connections.
    Running,
    /// Tearing down connections and releasing the port.
    Stopping,
}

impl ServerState {
    /// Whether a start request is valid in this state.
    pub fn can_start(self) -> bool {
        self == Self::Stopped
    }

    /// Whether a stop request is valid in this state.
    pub fn can_stop(self) -> bool {
        self == Self::Running
    }
}

/// Lifecycle misuse or startup failure.
#[derive(Debug)]
pub enum LifecycleError {
    /// `start` was called while the server was already running.
    AlreadyRunning,
    /// `stop` was called while the server was not running.
    NotRunning,
    /// The listener could not be bound.
    Bind {
        /// Address that was requested.
        addr: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// The accept thread could not be spawned.
    Spawn(std::io::Error),
}

impl std::fmt::Display for LifecycleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyRunning => write!(f, "Server is already running"),
            Self::NotRunning => write!(f, "Server is already shutdown"),
            Self::Bind { addr, source } => write!(f, "Failed to bind {addr}: {source}"),
            Self::Spawn(e) => write!(f, "Failed to spawn accept thread: {e}"),
        }
    }
}

impl std::error::Error for LifecycleError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Bind { source, .. } => Some(source),
            Self::Spawn(e) => Some(e),
            Self::AlreadyRunning | Self::NotRunning => None,
        }
    }
}

/// Resources of a running listener.
#[derive(Debug)]
struct Running {
    local_addr: SocketAddr,
    stop_flag: Arc<AtomicBool>,
    accept_handle: JoinHandle<()>,
}

/// Threaded TCP server exchanging newline-delimited JSON with clients.
///
/// Constructed explicitly and owned by whoever starts and stops it; all
/// methods take `&self` so it can be shared behind an `Arc`.
#[derive(Debug)]
pub struct Server {
    registry: Arc<ClientRegistry>,
    dispatcher: Arc<Dispatcher>,
    state: Mutex<ServerState>,
    /// Held for the whole of `start`/`stop` so lifecycle calls serialize.
    running: Mutex<Option<Running>>,
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    /// Create a stopped server with an empty registry and no handlers.
    pub fn new() -> Self {
        Self {
            registry: Arc::new(ClientRegistry::new()),
            dispatcher: Arc::new(Dispatcher::new()),
            state: Mutex::new(ServerState::Stopped),
            running: Mutex::new(None),
        }
    }

    fn running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ServerState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ServerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the server is accepting connections.
    pub fn is_running(&self) -> bool {
        self.state() == ServerState::Running
    }

    /// Address the listener is bound to, while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running().as_ref().map(|r| r.local_addr)
    }

    /// Registry of connected clients.
    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    /// Handler registry for inbound messages.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Install `handler` as the only receiver of inbound messages.
    ///
    /// See [`Dispatcher::set_handler`]: this replaces any previous handler.
    pub fn set_handler<F>(&self, handler: F)
    where
        F: Fn(&Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.dispatcher.set_handler(handler);
    }

    /// Send `value` to every connected client.
    pub fn broadcast<T: Serialize + ?Sized>(&self, value: &T) -> usize {
        self.registry.broadcast(value)
    }

    /// Send `value` to the first client registered as `client_id`.
    pub fn send_to<T: Serialize + ?Sized>(&self, client_id: &str, value: &T) -> bool {
        self.registry.send_to(client_id, value)
    }

    /// Bind `addr` and start accepting connections.
    ///
    /// Returns the bound address (useful with port 0).
    ///
    /// # Errors
    ///
    /// [`LifecycleError::AlreadyRunning`] if the server is running (nothing
    /// changes), [`LifecycleError::Bind`] if the address cannot be bound.
    pub fn start(&self, addr: &ServerAddr) -> Result<SocketAddr, LifecycleError> {
        let mut running = self.running();
        if running.is_some() {
            log::info!("[Server] Server is already running");
            return Err(LifecycleError::AlreadyRunning);
        }

        self.set_state(ServerState::Starting);
        let listener = match TcpListener::bind((addr.host.as_str(), addr.port)) {
            Ok(listener) => listener,
            Err(source) => {
                self.set_state(ServerState::Stopped);
                log::error!("[Server] Failed to bind {addr}: {source}");
                return Err(LifecycleError::Bind {
                    addr: addr.to_string(),
                    source,
                });
            }
        };
        let local_addr = match listener
            .set_nonblocking(true)
            .and_then(|()| listener.local_addr())
        {
            Ok(local_addr) => local_addr,
            Err(source) => {
                self.set_state(ServerState::Stopped);
                return Err(LifecycleError::Bind {
                    addr: addr.to_string(),
                    source,
                });
            }
        };

        let stop_flag = Arc::new(AtomicBool::new(false));
        let accept_handle = {
            let stop_flag = Arc::clone(&stop_flag);
            let registry = Arc::clone(&self.registry);
            let dispatcher = Arc::clone(&self.dispatcher);
            thread::Builder::new()
                .name("gulp-accept".to_string())
                .spawn(move || accept_loop(&listener, &stop_flag, &registry, &dispatcher))
        };
        let accept_handle = match accept_handle {
            Ok(handle) => handle,
            Err(e) => {
                self.set_state(ServerState::Stopped);
                return Err(LifecycleError::Spawn(e));
            }
        };

        *running = Some(Running {
            local_addr,
            stop_flag,
            accept_handle,
        });
        self.set_state(ServerState::Running);
        log::info!("[Server] Server started on {local_addr}");
        Ok(local_addr)
    }

    /// Stop accepting, disconnect every client and release the port.
    ///
    /// When this returns the listening socket is closed, so an immediate
    /// [`start`](Self::start) on the same address succeeds.
    ///
    /// # Errors
    ///
    /// [`LifecycleError::NotRunning`] if the server is not running.
    pub fn stop(&self) -> Result<(), LifecycleError> {
        let mut running = self.running();
        let Some(Running {
            local_addr,
            stop_flag,
            accept_handle,
        }) = running.take()
        else {
            log::info!("[Server] Server is already shutdown");
            return Err(LifecycleError::NotRunning);
        };

        self.set_state(ServerState::Stopping);
        stop_flag.store(true, Ordering::Release);

        // The listener lives on the accept thread; joining releases the port.
        if accept_handle.join().is_err() {
            log::error!("[Server] Accept thread panicked");
        }
        log::debug!("[Server] Listener on {local_addr} closed");

        self.registry.close_all();
        self.set_state(ServerState::Stopped);
        log::info!("[Server] Server stopped");
        Ok(())
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if self.running().is_some() {
            let _ = self.stop();
        }
    }
}

/// Accept loop; runs on the `gulp-accept` thread until `stop_flag` is set.
///
/// The listener is non-blocking and polled, so the loop notices the flag
/// within one [`ACCEPT_POLL_INTERVAL`] whether or not anyone connects.
fn accept_loop(
    listener: &TcpListener,
    stop_flag: &AtomicBool,
    registry: &Arc<ClientRegistry>,
    dispatcher: &Arc<Dispatcher>,
) {
    while !stop_flag.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, peer)) => {
                log::debug!("[Server] Accepted connection from {peer}");
                // Accepted sockets may inherit non-blocking mode on some platforms.
                if let Err(e) = stream.set_nonblocking(false) {
                    log::error!("[Server] Dropping connection from {peer}: {e}");
                    continue;
                }
                if let Err(e) = ClientConn::spawn(stream, registry, Arc::clone(dispatcher)) {
                    log::error!("[Server] Failed to start connection thread: {e}");
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL_INTERVAL),
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => {
                log::error!("[Server] Accept error: {e}");
                thread::sleep(ACCEPT_RETRY_DELAY);
            }
        }
    }
    log::debug!("[Server] Accept loop exited");
}
