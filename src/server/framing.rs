//! Wire protocol codec for the TCP server.
//!
//! Every message is a compact UTF-8 JSON value followed by a single
//! sentinel byte:
//!
//! ```text
//! {"id":"alpha"}\n{"x":1}\n
//! ```
//!
//! There is no length prefix. Standard JSON escaping guarantees a payload
//! never contains a raw `0x0A`, so splitting on the sentinel is enough to
//! recover message boundaries regardless of how reads were chunked.

use serde::Serialize;
use serde_json::Value;

pub use crate::constants::SENTINEL;

/// Errors produced while splitting or encoding frames.
#[derive(Debug)]
pub enum FrameError {
    /// A segment was not valid UTF-8.
    Utf8 {
        /// Zero-based position of the offending segment in the buffer.
        index: usize,
    },
    /// A segment was valid text but not valid JSON.
    Json {
        /// Zero-based position of the offending segment in the buffer.
        index: usize,
        /// Parser error.
        source: serde_json::Error,
    },
    /// An outbound value could not be serialized.
    Encode(serde_json::Error),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Utf8 { index } => write!(f, "Segment {index} is not valid UTF-8"),
            Self::Json { index, source } => write!(f, "Segment {index} is not valid JSON: {source}"),
            Self::Encode(e) => write!(f, "Failed to encode message: {e}"),
        }
    }
}

impl std::error::Error for FrameError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Json { source, .. } => Some(source),
            Self::Encode(e) => Some(e),
            Self::Utf8 { .. } => None,
        }
    }
}

/// Returns `true` when `buffer` ends with the sentinel byte.
pub fn is_complete(buffer: &[u8]) -> bool {
    buffer.last() == Some(&SENTINEL)
}

/// Split a raw buffer into decoded messages.
///
/// Only sentinel-terminated segments are decoded; bytes after the last
/// sentinel belong to a message that has not fully arrived and are ignored.
/// Empty segments (a trailing sentinel, blank lines) are skipped.
///
/// # Errors
///
/// The first segment that is not UTF-8 or not JSON aborts the whole call;
/// values decoded before it are discarded along with it.
pub fn split(buffer: &[u8]) -> Result<Vec<Value>, FrameError> {
    let terminated = match buffer.iter().rposition(|&b| b == SENTINEL) {
        Some(last) => &buffer[..last],
        None => return Ok(Vec::new()),
    };

    let mut messages = Vec::new();
    for (index, segment) in terminated.split(|&b| b == SENTINEL).enumerate() {
        if segment.is_empty() {
            continue;
        }
        let text = std::str::from_utf8(segment).map_err(|_| FrameError::Utf8 { index })?;
        let value = serde_json::from_str(text).map_err(|source| FrameError::Json { index, source })?;
        messages.push(value);
    }
    Ok(messages)
}

/// Encode a value into its wire form: compact JSON plus the sentinel.
///
/// # Errors
///
/// Returns [`FrameError::Encode`] if `value` cannot be serialized (e.g. a map
/// with non-string keys).
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, FrameError> {
    let mut buf = serde_json::to_vec(value).map_err(FrameError::Encode)?;
    buf.push(SENTINEL);
    Ok(buf)
}
