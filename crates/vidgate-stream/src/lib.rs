//! Range-aware streaming core for the vidgate gateway.
//!
//! This crate owns the byte-exact part of the system: negotiating a client's
//! `Range` header against a known object size, and driving bounded chunk reads
//! from a remote blob source in strictly ascending, contiguous order. Nothing
//! here persists beyond a single request; the quota catalog and the HTTP
//! surface live in the `vidgate-store` and `vidgate-daemon` crates.

mod fetch;
mod range;
pub mod source;

use thiserror::Error;

pub use fetch::{chunk_stream, Chunk};
pub use range::{negotiate_range, RangeWindow};
pub use source::{BlobMetadata, BlobSource, BlobStore};

/// Upper bound on a single blob read. The final chunk of a window is truncated
/// to exactly fill the remainder.
pub const DEFAULT_CHUNK_SIZE: u64 = 256 * 1024;

/// Content type served when a filename extension resolves to nothing.
pub const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

/// Errors surfaced by the streaming core.
#[derive(Debug, Error)]
pub enum StreamError {
    /// The raw `Range` header could not be negotiated against the object size.
    /// Unparseable start values are a hard error, never a silent full-object
    /// response.
    #[error("malformed range request: {0}")]
    MalformedRange(String),

    /// The blob store does not hold the requested key.
    #[error("object '{0}' not found in blob store")]
    NotFound(String),

    /// A bounded chunk read failed mid-window. The fetch loop never retries;
    /// callers must treat this as a hard abort once bytes have been sent.
    #[error("backend read failed for '{key}' at offset {offset}: {reason}")]
    BackendRead {
        key: String,
        offset: u64,
        reason: String,
    },

    /// The backend returned fewer bytes than the bounded read asked for.
    #[error("short read for '{key}' at offset {offset}: expected {expected} bytes, got {actual}")]
    ShortRead {
        key: String,
        offset: u64,
        expected: u64,
        actual: u64,
    },

    /// Metadata or existence lookups against the blob store failed.
    #[error("blob store error: {0}")]
    Backend(String),

    /// The remote store advertised `Accept-Ranges: none`.
    #[error("blob store does not support byte-range reads")]
    RangeNotSupported,
}

/// Identifies the object one streaming request serves.
///
/// Resolved once per request from the blob source and immutable afterwards;
/// dropped when the request ends.
#[derive(Debug, Clone)]
pub struct StreamTarget {
    pub key: String,
    pub total_size: u64,
    pub content_type: String,
}

impl StreamTarget {
    pub fn new(
        key: impl Into<String>,
        total_size: u64,
        content_type: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            total_size,
            content_type: content_type.into(),
        }
    }
}
