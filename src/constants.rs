//! Application-wide constants for gulp-server.
//!
//! This module centralizes the wire-protocol values, default settings and
//! timing knobs used by the server core and the host lifecycle.
//!
//! # Categories
//!
//! - **Wire**: Sentinel byte, read chunk size, buffer limit
//! - **Defaults**: Listening address and start delay
//! - **Timing**: Accept polling and back-off

use std::time::Duration;

// ============================================================================
// Wire
// ============================================================================

/// Byte that terminates every encoded message on the wire (line feed).
pub const SENTINEL: u8 = b'\n';

/// Size of each `read()` call while accumulating a message.
pub const RECV_CHUNK_SIZE: usize = 4096;

/// Upper bound on bytes accumulated for a single receive cycle.
///
/// A peer that streams this much without ever sending a sentinel is
/// treated as disconnected.
pub const MAX_BUFFERED_BYTES: usize = 16 * 1024 * 1024;

/// Key of the client identifier in the handshake object.
pub const HANDSHAKE_ID_KEY: &str = "id";

// ============================================================================
// Defaults
// ============================================================================

/// Default listening host (loopback only).
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default listening port.
pub const DEFAULT_PORT: u16 = 30048;

/// Default delay before the host starts the server after loading.
///
/// Gives the OS time to release the port held by a previous instance.
pub const DEFAULT_START_DELAY: Duration = Duration::from_millis(2000);

// ============================================================================
// Timing
// ============================================================================

/// Pause after a failed `accept()` before trying again.
pub const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// How often the accept loop polls the listener and its stop flag.
pub const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(20);
