//! Transport connection: one socket, serialized writes, framed reads.
//!
//! A connection owns exactly one TCP (optionally TLS) stream. Writes are
//! serialized onto the socket so packages never interleave; a reader task
//! feeds inbound bytes through the frame reassembler and package codec and
//! forwards every package to the scheduler's event channel. A decode or
//! framing error on the inbound path force-closes the connection, which
//! cascades into the scheduler's reconnect path.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};
use uuid::Uuid;

use eventide_wire::{FrameReassembler, Package};

use crate::error::{ClientError, Result};
use crate::node::NodeEndpoints;
use crate::settings::{ConnectionSettings, TlsSettings};

/// Events a transport reports to its owning scheduler.
pub(crate) enum TransportEvent {
    /// A connect attempt finished successfully.
    Connected {
        /// The established connection.
        connection: TransportConnection,
    },
    /// A connect attempt failed.
    ConnectFailed {
        /// Why.
        error: ClientError,
    },
    /// A complete package arrived.
    Package {
        /// Connection the package arrived on.
        connection_id: Uuid,
        /// The decoded package.
        package: Package,
    },
    /// The connection closed: clean EOF, socket error, or wire violation.
    Closed {
        /// Connection that closed.
        connection_id: Uuid,
        /// Cause, when the close was not a clean EOF.
        error: Option<ClientError>,
    },
}

type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;
type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;

/// One established socket plus its reader task.
pub(crate) struct TransportConnection {
    id: Uuid,
    peer: SocketAddr,
    write: Mutex<BoxedWrite>,
    reader: JoinHandle<()>,
}

impl std::fmt::Debug for TransportConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportConnection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

impl TransportConnection {
    /// Connects to the endpoint selected by discovery.
    ///
    /// The TLS endpoint is preferred when TLS is configured and the node
    /// offers one. Package and close events flow into `events` tagged with
    /// the new connection's id.
    pub(crate) async fn connect(
        endpoints: &NodeEndpoints,
        settings: &ConnectionSettings,
        events: UnboundedSender<TransportEvent>,
    ) -> Result<TransportConnection> {
        let (addr, use_tls) = match (&settings.tls, endpoints.secure_tcp_endpoint) {
            (Some(_), Some(secure)) => (secure, true),
            _ => (endpoints.tcp_endpoint, settings.tls.is_some()),
        };

        let stream = tokio::time::timeout(
            settings.connection_timeout,
            tokio::net::TcpStream::connect(addr),
        )
        .await
        .map_err(|_| ClientError::ConnectionTimeout {
            addr: addr.to_string(),
            timeout_ms: settings.connection_timeout.as_millis() as u64,
        })?
        .map_err(ClientError::Io)?;
        stream.set_nodelay(true).map_err(ClientError::Io)?;

        let (read, write): (BoxedRead, BoxedWrite) = if use_tls {
            let tls = settings.tls.as_ref().ok_or_else(|| ClientError::Tls {
                reason: "secure endpoint selected without TLS settings".to_string(),
            })?;
            let connector = build_tls_connector(tls)?;
            let server_name = resolve_server_name(tls, addr)?;
            let stream = connector
                .connect(server_name, stream)
                .await
                .map_err(|e| ClientError::Tls {
                    reason: format!("handshake with {addr} failed: {e}"),
                })?;
            let (r, w) = tokio::io::split(stream);
            (Box::new(r), Box::new(w))
        } else {
            let (r, w) = stream.into_split();
            (Box::new(r), Box::new(w))
        };

        let id = Uuid::new_v4();
        let reader = tokio::spawn(read_loop(
            id,
            read,
            events,
            settings.max_package_size,
        ));
        debug!(peer = %addr, connection_id = %id, tls = use_tls, "transport connected");

        Ok(TransportConnection {
            id,
            peer: addr,
            write: Mutex::new(write),
            reader,
        })
    }

    /// Writes one encoded package to the socket.
    ///
    /// The write half is locked for the whole package, so concurrent sends
    /// never interleave partial packages.
    pub(crate) async fn send(&self, package: &Package) -> Result<()> {
        let encoded = package.encode()?;
        let mut write = self.write.lock().await;
        write.write_all(&encoded).await.map_err(ClientError::Io)?;
        write.flush().await.map_err(ClientError::Io)?;
        Ok(())
    }

    /// Force-closes the socket and stops the reader task.
    pub(crate) async fn close(&self) {
        self.reader.abort();
        let mut write = self.write.lock().await;
        let _ = write.shutdown().await;
    }

    /// Id tagged onto every event from this connection.
    pub(crate) fn id(&self) -> Uuid {
        self.id
    }

    /// Remote endpoint of the socket.
    pub(crate) fn peer(&self) -> SocketAddr {
        self.peer
    }
}

/// Reads bytes, reassembles frames, decodes packages, forwards events.
async fn read_loop(
    connection_id: Uuid,
    mut read: BoxedRead,
    events: UnboundedSender<TransportEvent>,
    max_package_size: usize,
) {
    let mut reassembler = FrameReassembler::new(max_package_size);
    let mut buf = vec![0u8; 8192];
    loop {
        let n = match read.read(&mut buf).await {
            Ok(0) => {
                debug!(connection_id = %connection_id, "peer closed the connection");
                let _ = events.send(TransportEvent::Closed {
                    connection_id,
                    error: None,
                });
                return;
            }
            Ok(n) => n,
            Err(e) => {
                debug!(connection_id = %connection_id, error = %e, "socket read failed");
                let _ = events.send(TransportEvent::Closed {
                    connection_id,
                    error: Some(ClientError::Io(e)),
                });
                return;
            }
        };

        let mut frames: Vec<Bytes> = Vec::new();
        if let Err(e) = reassembler.process(&buf[..n], &mut |frame| frames.push(frame)) {
            warn!(connection_id = %connection_id, error = %e, "framing violation, closing connection");
            let _ = events.send(TransportEvent::Closed {
                connection_id,
                error: Some(ClientError::Wire(e)),
            });
            return;
        }

        for frame in frames {
            match Package::decode(&frame) {
                Ok(package) => {
                    let _ = events.send(TransportEvent::Package {
                        connection_id,
                        package,
                    });
                }
                Err(e) => {
                    warn!(connection_id = %connection_id, error = %e, "undecodable package, closing connection");
                    let _ = events.send(TransportEvent::Closed {
                        connection_id,
                        error: Some(ClientError::Wire(e)),
                    });
                    return;
                }
            }
        }
    }
}

fn build_tls_connector(tls: &TlsSettings) -> Result<TlsConnector> {
    let _ = rustls::crypto::ring::default_provider().install_default();
    let mut root_store = rustls::RootCertStore::empty();
    let mut reader = std::io::Cursor::new(&tls.ca_cert_pem);
    for cert in rustls_pemfile::certs(&mut reader) {
        let cert = cert.map_err(|e| ClientError::Tls {
            reason: format!("unreadable CA certificate: {e}"),
        })?;
        root_store.add(cert).map_err(|e| ClientError::Tls {
            reason: format!("failed to add CA certificate: {e}"),
        })?;
    }
    if root_store.is_empty() {
        return Err(ClientError::Tls {
            reason: "no CA certificates in TLS settings".to_string(),
        });
    }
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

fn resolve_server_name(tls: &TlsSettings, addr: SocketAddr) -> Result<ServerName<'static>> {
    match &tls.server_name {
        Some(name) => ServerName::try_from(name.clone()).map_err(|e| ClientError::Tls {
            reason: format!("invalid server name {name}: {e}"),
        }),
        None => Ok(ServerName::IpAddress(addr.ip().into())),
    }
}
