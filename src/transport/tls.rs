use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::net::TcpStream;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, ClientConnection, RootCertStore, StreamOwned};
use tracing::debug;

use super::stream::NodeStream;
use crate::error::{code, DriverError};

/// Builds the TLS layer used when a node accepts secure transport
#[derive(Clone)]
pub struct SecureSocketFactory {
    config: Arc<ClientConfig>,
    server_name: Option<String>,
}

impl SecureSocketFactory {
    /// Trust the bundled web PKI roots
    pub fn with_webpki_roots(server_name: Option<String>) -> Self {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        Self::with_roots(roots, server_name)
    }

    /// Trust only the certificates in a PEM file
    pub fn from_ca_file(path: &Path, server_name: Option<String>) -> Result<Self, DriverError> {
        let file = File::open(path).map_err(|e| {
            DriverError::config(
                code::ILLEGAL_CONFIG,
                format!("Failed to open CA file (path={}, reason={})", path.display(), e),
            )
        })?;
        let mut reader = BufReader::new(file);
        let certs = rustls_pemfile::certs(&mut reader)
            .collect::<Result<Vec<CertificateDer<'static>>, _>>()
            .map_err(|e| {
                DriverError::config(
                    code::ILLEGAL_CONFIG,
                    format!("Failed to read CA file (path={}, reason={})", path.display(), e),
                )
            })?;

        let mut roots = RootCertStore::empty();
        for cert in certs {
            roots.add(cert).map_err(|e| {
                DriverError::config(
                    code::ILLEGAL_CONFIG,
                    format!("Failed to add CA certificate (path={}, reason={})", path.display(), e),
                )
            })?;
        }
        Ok(Self::with_roots(roots, server_name))
    }

    fn with_roots(roots: RootCertStore, server_name: Option<String>) -> Self {
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Self {
            config: Arc::new(config),
            server_name,
        }
    }

    /// Wrap an already connected socket
    pub fn upgrade(&self, tcp: TcpStream) -> Result<NodeStream, DriverError> {
        let peer = tcp.peer_addr()?;
        let name = match &self.server_name {
            Some(name) => ServerName::try_from(name.clone()).map_err(|e| {
                DriverError::config(
                    code::ILLEGAL_CONFIG,
                    format!("Invalid TLS server name (name={}, reason={})", name, e),
                )
            })?,
            None => ServerName::from(peer.ip()),
        };

        let conn = ClientConnection::new(self.config.clone(), name).map_err(|e| {
            DriverError::connection(
                code::BAD_CONNECTION,
                format!("Failed to start TLS session (address={}, reason={})", peer, e),
            )
        })?;
        debug!(address = %peer, "Transport upgraded to TLS");
        Ok(NodeStream::Tls(Box::new(StreamOwned::new(conn, tcp))))
    }
}

impl fmt::Debug for SecureSocketFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureSocketFactory")
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}
