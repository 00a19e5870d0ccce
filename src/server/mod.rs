//! Threaded TCP server speaking newline-delimited JSON.
//!
//! Clients connect, send a handshake object carrying their identifier, and
//! then exchange JSON messages with the embedding application. Every
//! connection gets its own thread with blocking I/O; shared state lives in
//! the [`ClientRegistry`] and the [`Dispatcher`].
//!
//! # Architecture
//!
//! ```text
//! Host application                      Remote clients
//! ┌──────────────────┐                 ┌──────────────┐
//! │ Server           │                 │ client "a"   │
//! │  TcpListener     │◄───────────────►│ TcpStream    │
//! │  accept thread   │  JSON + '\n'    └──────────────┘
//! │  ClientConn ×N   │                 ┌──────────────┐
//! │  ClientRegistry  │◄───────────────►│ client "b"   │
//! └────────┬─────────┘                 └──────────────┘
//!          │ Dispatcher::dispatch
//!          ▼
//!     host handler
//! ```
//!
//! # Wire Protocol
//!
//! Each message is one JSON value followed by `0x0A`. The first message on
//! a connection must be an object with a string `"id"`; the server answers
//! with `{"handshake":"hello"}`.
//!
//! See [`framing`] for the codec.

pub mod connection;
pub mod dispatch;
pub mod framing;
pub mod listener;
pub mod registry;

pub use connection::{ClientConn, HandshakeError};
pub use dispatch::{DispatchOutcome, Dispatcher, Handler};
pub use framing::FrameError;
pub use listener::{LifecycleError, Server, ServerState};
pub use registry::ClientRegistry;
