//! Client error taxonomy.
//!
//! The engine recovers locally from everything classified transient (retry,
//! reconnect); everything else is surfaced verbatim to the caller through the
//! operation's future or the subscription's drop callback.

use thiserror::Error;

use eventide_wire::WireError;

/// Errors surfaced by the protocol engine.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The connection was closed before the operation produced a result.
    #[error("connection closed")]
    ConnectionClosed,

    /// Establishing the socket took longer than the configured timeout.
    #[error("connection timeout after {timeout_ms}ms to {addr}")]
    ConnectionTimeout {
        /// Target address.
        addr: String,
        /// Configured timeout in milliseconds.
        timeout_ms: u64,
    },

    /// The operation queue is at capacity; the request was never admitted.
    #[error("operation queue full (limit {limit})")]
    QueueFull {
        /// Configured queue limit.
        limit: usize,
    },

    /// The operation kept timing out until its retry budget was spent.
    #[error("retries exhausted after {attempts} attempts")]
    RetriesExhausted {
        /// Total attempts made, initial send included.
        attempts: i32,
    },

    /// Cluster discovery failed on every attempt.
    #[error("cluster discovery failed after {attempts} attempts")]
    DiscoveryFailed {
        /// Attempts made before giving up.
        attempts: u32,
    },

    /// The server rejected the supplied credentials.
    #[error("not authenticated: {message}")]
    NotAuthenticated {
        /// Server-supplied detail.
        message: String,
    },

    /// The server refused access to the stream or operation.
    #[error("access denied: {message}")]
    AccessDenied {
        /// Server-supplied detail.
        message: String,
    },

    /// The stream's actual version did not match the expected version.
    ///
    /// Never retried by the engine; retrying would risk duplicate writes the
    /// caller must decide on.
    #[error("wrong expected version on stream {stream} (expected {expected})")]
    WrongExpectedVersion {
        /// Stream the append targeted.
        stream: String,
        /// Version the caller expected.
        expected: i64,
    },

    /// The target stream has been deleted.
    #[error("stream {stream} is deleted")]
    StreamDeleted {
        /// Deleted stream id.
        stream: String,
    },

    /// The server considered the write part of an invalid transaction.
    #[error("invalid transaction")]
    InvalidTransaction,

    /// The server rejected the request as malformed.
    #[error("bad request: {message}")]
    BadRequest {
        /// Server-supplied detail.
        message: String,
    },

    /// The server reported an unclassified failure.
    #[error("server error: {message}")]
    ServerError {
        /// Server-supplied detail.
        message: String,
    },

    /// A payload could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// TLS setup or handshake failed.
    #[error("TLS error: {reason}")]
    Tls {
        /// What failed.
        reason: String,
    },

    /// Wire-format violation on the inbound path.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// Underlying socket failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// Whether the engine may transparently retry after this error.
    ///
    /// Transient socket-level failures are retryable. Authentication,
    /// authorization, version conflicts, and format errors are not: the
    /// caller has to decide what they mean.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::ConnectionClosed
                | ClientError::ConnectionTimeout { .. }
                | ClientError::Io(_)
        )
    }
}

/// Convenience alias for engine results.
pub type Result<T> = std::result::Result<T, ClientError>;
