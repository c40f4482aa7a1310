//! Package codec for the Eventide TCP protocol.
//!
//! A package is the unit of exchange on the wire. Layout, all integers
//! little-endian:
//!
//! ```text
//! [0..4)   u32  content length (everything after this field)
//! [4]      u8   command
//! [5]      u8   flags
//! [6..22)  [u8] correlation id, 16 raw bytes
//! if flags & AUTHENTICATED:
//!   [22]       u8   login length L
//!   [23..23+L) [u8] login
//!   [..]       u8   password length P, then P password bytes
//! [..]     [u8] data (remainder)
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use uuid::Uuid;

use crate::command::TcpCommand;
use crate::error::{Result, WireError};

/// Size of the mandatory body: command + flags + correlation id.
pub const MANDATORY_SIZE: usize = 18;

/// Size of the length prefix preceding every package body.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Longest login or password the one-byte length fields can carry.
pub const MAX_CREDENTIAL_LEN: usize = 255;

const FLAG_AUTHENTICATED: u8 = 0x01;
const FLAG_TRUSTED_WRITE: u8 = 0x02;

/// Per-package control flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TcpFlags {
    /// Package carries login/password credentials.
    pub authenticated: bool,
    /// Package is a trusted write (internal replication use).
    pub trusted_write: bool,
}

impl TcpFlags {
    /// Empty flag set (wire value 0x00).
    pub fn none() -> Self {
        Self::default()
    }

    /// Converts to the raw wire byte.
    pub fn as_u8(&self) -> u8 {
        let mut b = 0u8;
        if self.authenticated {
            b |= FLAG_AUTHENTICATED;
        }
        if self.trusted_write {
            b |= FLAG_TRUSTED_WRITE;
        }
        b
    }

    /// Parses the raw wire byte. Unknown bits are ignored.
    pub fn from_u8(b: u8) -> Self {
        Self {
            authenticated: (b & FLAG_AUTHENTICATED) != 0,
            trusted_write: (b & FLAG_TRUSTED_WRITE) != 0,
        }
    }
}

/// Login and password carried by an authenticated package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Account login.
    pub login: String,
    /// Account password.
    pub password: String,
}

impl Credentials {
    /// Creates a new credential pair.
    pub fn new(login: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            login: login.into(),
            password: password.into(),
        }
    }
}

/// A single protocol message, immutable once constructed.
///
/// The correlation id ties a response to its request; the scheduler matches
/// inbound packages to in-flight operations by this field alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    /// Command opcode.
    pub command: TcpCommand,
    /// Control flags. `authenticated` is kept consistent with `credentials`.
    pub flags: TcpFlags,
    /// 16-byte id tying a response to its request.
    pub correlation_id: Uuid,
    /// Optional login/password pair.
    pub credentials: Option<Credentials>,
    /// Command-specific payload bytes.
    pub data: Bytes,
}

impl Package {
    /// Creates an unauthenticated package.
    pub fn new(command: TcpCommand, correlation_id: Uuid, data: Bytes) -> Self {
        Self {
            command,
            flags: TcpFlags::none(),
            correlation_id,
            credentials: None,
            data,
        }
    }

    /// Creates an authenticated package carrying the given credentials.
    pub fn authenticated(
        command: TcpCommand,
        correlation_id: Uuid,
        data: Bytes,
        credentials: Credentials,
    ) -> Self {
        Self {
            command,
            flags: TcpFlags {
                authenticated: true,
                trusted_write: false,
            },
            correlation_id,
            credentials: Some(credentials),
            data,
        }
    }

    /// Attaches credentials when `credentials` is `Some`, otherwise leaves the
    /// package unauthenticated.
    pub fn with_credentials(self, credentials: Option<Credentials>) -> Self {
        match credentials {
            Some(c) => Package::authenticated(self.command, self.correlation_id, self.data, c),
            None => self,
        }
    }

    /// Encodes the package to its framed wire form, length prefix included.
    ///
    /// Credential lengths are validated before any bytes are produced.
    pub fn encode(&self) -> Result<Bytes> {
        let mut content_len = MANDATORY_SIZE + self.data.len();
        if let Some(c) = &self.credentials {
            if c.login.len() > MAX_CREDENTIAL_LEN {
                return Err(WireError::CredentialTooLong {
                    field: "login",
                    len: c.login.len(),
                });
            }
            if c.password.len() > MAX_CREDENTIAL_LEN {
                return Err(WireError::CredentialTooLong {
                    field: "password",
                    len: c.password.len(),
                });
            }
            content_len += 2 + c.login.len() + c.password.len();
        }

        let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + content_len);
        buf.put_u32_le(content_len as u32);
        buf.put_u8(self.command.as_u8());
        buf.put_u8(self.flags.as_u8());
        buf.put_slice(self.correlation_id.as_bytes());
        if let Some(c) = &self.credentials {
            buf.put_u8(c.login.len() as u8);
            buf.put_slice(c.login.as_bytes());
            buf.put_u8(c.password.len() as u8);
            buf.put_slice(c.password.as_bytes());
        }
        buf.put_slice(&self.data);
        Ok(buf.freeze())
    }

    /// Decodes a complete frame (length prefix included) into a package.
    ///
    /// Never allocates more than the declared content length for the body.
    pub fn decode(frame: &[u8]) -> Result<Package> {
        if frame.len() < LENGTH_PREFIX_SIZE {
            return Err(WireError::TruncatedPackage {
                size: frame.len(),
                minimum: LENGTH_PREFIX_SIZE,
            });
        }
        let declared =
            u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        let body = &frame[LENGTH_PREFIX_SIZE..];
        if declared != body.len() {
            return Err(WireError::LengthMismatch {
                declared,
                actual: body.len(),
            });
        }
        if body.len() < MANDATORY_SIZE {
            return Err(WireError::TruncatedPackage {
                size: body.len(),
                minimum: MANDATORY_SIZE,
            });
        }

        let command = TcpCommand::from_u8(body[0])?;
        let flags = TcpFlags::from_u8(body[1]);
        let mut correlation = [0u8; 16];
        correlation.copy_from_slice(&body[2..18]);
        let correlation_id = Uuid::from_bytes(correlation);

        let mut offset = MANDATORY_SIZE;
        let credentials = if flags.authenticated {
            let (creds, rest) = Self::decode_credentials(&body[offset..])?;
            offset = body.len() - rest;
            Some(creds)
        } else {
            None
        };

        let data = Bytes::copy_from_slice(&body[offset..]);
        Ok(Package {
            command,
            flags,
            correlation_id,
            credentials,
            data,
        })
    }

    /// Parses login/password fields, returning the credentials and the number
    /// of bytes remaining after them.
    fn decode_credentials(body: &[u8]) -> Result<(Credentials, usize)> {
        if body.is_empty() {
            return Err(WireError::CorruptCredentials {
                reason: "missing login length",
            });
        }
        let login_len = body[0] as usize;
        if body.len() < 1 + login_len + 1 {
            return Err(WireError::CorruptCredentials {
                reason: "login runs past end of package",
            });
        }
        let login = std::str::from_utf8(&body[1..1 + login_len])
            .map_err(|_| WireError::CorruptCredentials {
                reason: "login is not valid utf-8",
            })?
            .to_string();

        let password_len = body[1 + login_len] as usize;
        let password_start = 1 + login_len + 1;
        if body.len() < password_start + password_len {
            return Err(WireError::CorruptCredentials {
                reason: "password runs past end of package",
            });
        }
        let password = std::str::from_utf8(&body[password_start..password_start + password_len])
            .map_err(|_| WireError::CorruptCredentials {
                reason: "password is not valid utf-8",
            })?
            .to_string();

        let remaining = body.len() - (password_start + password_len);
        Ok((Credentials { login, password }, remaining))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn correlation() -> Uuid {
        Uuid::from_bytes([7u8; 16])
    }

    #[test]
    fn test_flags_roundtrip() {
        assert_eq!(TcpFlags::none().as_u8(), 0x00);
        let flags = TcpFlags {
            authenticated: true,
            trusted_write: true,
        };
        assert_eq!(flags.as_u8(), 0x03);
        assert_eq!(TcpFlags::from_u8(0x03), flags);
        assert_eq!(TcpFlags::from_u8(0x01).authenticated, true);
        assert_eq!(TcpFlags::from_u8(0x02).trusted_write, true);
        // unknown bits ignored
        assert_eq!(TcpFlags::from_u8(0xFC), TcpFlags::none());
    }

    #[test]
    fn test_encode_layout() {
        let package = Package::new(
            TcpCommand::Ping,
            correlation(),
            Bytes::from_static(b"ping"),
        );
        let encoded = package.encode().unwrap();
        assert_eq!(encoded.len(), 4 + 18 + 4);
        assert_eq!(
            u32::from_le_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]),
            22
        );
        assert_eq!(encoded[4], 0x03);
        assert_eq!(encoded[5], 0x00);
        assert_eq!(&encoded[6..22], &[7u8; 16]);
        assert_eq!(&encoded[22..], b"ping");
    }

    #[test]
    fn test_roundtrip_without_credentials() {
        let package = Package::new(
            TcpCommand::BadRequest,
            correlation(),
            Bytes::from_static(b"data"),
        );
        let decoded = Package::decode(&package.encode().unwrap()).unwrap();
        assert_eq!(decoded, package);
        assert!(decoded.credentials.is_none());
    }

    #[test]
    fn test_roundtrip_with_credentials() {
        let package = Package::authenticated(
            TcpCommand::WriteEvents,
            Uuid::new_v4(),
            Bytes::from_static(b"payload"),
            Credentials::new("admin", "changeit"),
        );
        let decoded = Package::decode(&package.encode().unwrap()).unwrap();
        assert_eq!(decoded, package);
        let creds = decoded.credentials.unwrap();
        assert_eq!(creds.login, "admin");
        assert_eq!(creds.password, "changeit");
    }

    #[test]
    fn test_roundtrip_empty_data_and_empty_password() {
        let package = Package::authenticated(
            TcpCommand::Authenticate,
            Uuid::new_v4(),
            Bytes::new(),
            Credentials::new("ops", ""),
        );
        let decoded = Package::decode(&package.encode().unwrap()).unwrap();
        assert_eq!(decoded, package);
    }

    #[test]
    fn test_login_too_long_fails_before_encoding() {
        let package = Package::authenticated(
            TcpCommand::WriteEvents,
            correlation(),
            Bytes::new(),
            Credentials::new("x".repeat(256), "pw"),
        );
        let err = package.encode().unwrap_err();
        assert!(matches!(
            err,
            WireError::CredentialTooLong {
                field: "login",
                len: 256
            }
        ));
    }

    #[test]
    fn test_password_too_long_fails_before_encoding() {
        let package = Package::authenticated(
            TcpCommand::WriteEvents,
            correlation(),
            Bytes::new(),
            Credentials::new("admin", "y".repeat(300)),
        );
        let err = package.encode().unwrap_err();
        assert!(matches!(
            err,
            WireError::CredentialTooLong {
                field: "password",
                len: 300
            }
        ));
    }

    #[test]
    fn test_password_of_exactly_255_bytes_is_valid() {
        let package = Package::authenticated(
            TcpCommand::WriteEvents,
            correlation(),
            Bytes::from_static(b"d"),
            Credentials::new("a".repeat(255), "b".repeat(255)),
        );
        let decoded = Package::decode(&package.encode().unwrap()).unwrap();
        assert_eq!(decoded.credentials.unwrap().password.len(), 255);
    }

    #[test]
    fn test_decode_below_mandatory_header() {
        // prefix declares 10 bytes, body carries 10, but 10 < 18
        let mut frame = vec![10, 0, 0, 0];
        frame.extend_from_slice(&[0u8; 10]);
        let err = Package::decode(&frame).unwrap_err();
        assert!(matches!(
            err,
            WireError::TruncatedPackage {
                size: 10,
                minimum: 18
            }
        ));
    }

    #[test]
    fn test_decode_length_mismatch() {
        let package = Package::new(TcpCommand::Ping, correlation(), Bytes::from_static(b"xy"));
        let mut encoded = package.encode().unwrap().to_vec();
        encoded[0] = encoded[0].wrapping_add(1);
        let err = Package::decode(&encoded).unwrap_err();
        assert!(matches!(err, WireError::LengthMismatch { .. }));
    }

    #[test]
    fn test_decode_credentials_running_past_package() {
        // authenticated flag set, login length larger than the remaining body
        let mut body = vec![TcpCommand::WriteEvents.as_u8(), 0x01];
        body.extend_from_slice(&[0u8; 16]);
        body.push(200); // login length far past the end
        body.extend_from_slice(b"abc");
        let mut frame = (body.len() as u32).to_le_bytes().to_vec();
        frame.extend_from_slice(&body);
        let err = Package::decode(&frame).unwrap_err();
        assert!(matches!(err, WireError::CorruptCredentials { .. }));
    }

    #[test]
    fn test_decode_missing_password_length() {
        let mut body = vec![TcpCommand::WriteEvents.as_u8(), 0x01];
        body.extend_from_slice(&[0u8; 16]);
        body.push(2);
        body.extend_from_slice(b"ab"); // login present, password length byte absent
        let mut frame = (body.len() as u32).to_le_bytes().to_vec();
        frame.extend_from_slice(&body);
        let err = Package::decode(&frame).unwrap_err();
        assert!(matches!(err, WireError::CorruptCredentials { .. }));
    }

    #[test]
    fn test_bad_request_concrete_scenario() {
        let c = Uuid::new_v4();
        let package = Package::new(TcpCommand::BadRequest, c, Bytes::from_static(b"data"));
        let decoded = Package::decode(&package.encode().unwrap()).unwrap();
        assert_eq!(decoded.command, TcpCommand::BadRequest);
        assert_eq!(decoded.flags, TcpFlags::none());
        assert_eq!(decoded.correlation_id, c);
        assert_eq!(&decoded.data[..], b"data");
        assert!(decoded.credentials.is_none());
    }
}
