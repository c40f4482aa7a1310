//! Wire-level error types.

use thiserror::Error;

/// Errors raised while encoding, decoding, or reframing packages.
///
/// Every variant produced on the inbound path is fatal to the socket that
/// produced the bytes: the owning connection must be force-closed.
#[derive(Debug, Error)]
pub enum WireError {
    /// A declared package length exceeds the configured maximum.
    #[error("package too large: {size} bytes (max {max_size})")]
    PackageTooLarge {
        /// Declared content length in bytes.
        size: usize,
        /// Configured maximum content length in bytes.
        max_size: usize,
    },

    /// A package body is shorter than the mandatory header.
    #[error("truncated package: {size} bytes is below the {minimum}-byte minimum")]
    TruncatedPackage {
        /// Actual body length in bytes.
        size: usize,
        /// Minimum valid body length in bytes.
        minimum: usize,
    },

    /// The length prefix disagrees with the number of bytes in the frame.
    #[error("length mismatch: prefix declares {declared} bytes, frame carries {actual}")]
    LengthMismatch {
        /// Content length declared by the prefix.
        declared: usize,
        /// Content length actually present.
        actual: usize,
    },

    /// The authenticated flag is set but the credential fields overrun the package.
    #[error("corrupt credentials: {reason}")]
    CorruptCredentials {
        /// What made the credential fields unparseable.
        reason: &'static str,
    },

    /// A login or password exceeds the one-byte length field.
    #[error("credential too long: {field} is {len} bytes (max 255)")]
    CredentialTooLong {
        /// Which credential field overflowed.
        field: &'static str,
        /// Its length in bytes.
        len: usize,
    },

    /// The command opcode is not part of the protocol.
    #[error("unknown command opcode: 0x{0:02X}")]
    UnknownCommand(u8),
}

/// Convenience alias for wire-level results.
pub type Result<T> = std::result::Result<T, WireError>;
