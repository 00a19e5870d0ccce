//! Gulp Server - embeddable TCP message server.
//!
//! Lets external processes (build tools, watchers, scripts) push JSON
//! messages into a host application and receive messages back, over a
//! plain TCP socket with newline-delimited JSON framing.
//!
//! # Architecture
//!
//! - **Server** - listener lifecycle, accept thread, per-connection threads
//! - **ClientRegistry** - handshaken clients, broadcast and targeted sends
//! - **Dispatcher** - the host's handler for inbound messages
//! - **ServerHost** - start/stop entry points and command predicates
//!
//! # Modules
//!
//! - [`server`] - Listener, connections, registry, dispatch and framing
//! - [`host`] - Host lifecycle integration
//! - [`settings`] - Settings loading and validation

pub mod constants;
pub mod host;
pub mod server;
pub mod settings;

// Re-export commonly used types
pub use host::ServerHost;
pub use server::{ClientRegistry, Dispatcher, LifecycleError, Server, ServerState};
pub use settings::{ServerAddr, Settings, SettingsSource};
