//! TLS front-end.
//!
//! In `Terminate` mode the listener peeks at the first byte of a connection
//! without consuming it. A TLS handshake record is accepted with the
//! configured certificate and the decrypted stream goes through detection
//! like any other connection. In `Passthrough` mode nothing happens here:
//! the `tls` protocol matches the ClientHello and the encrypted bytes are
//! bridged to a backend that terminates TLS itself.

use std::fmt;
use std::io;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use protogate_detect::tls::is_handshake_record;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;

/// How TLS connections are handled.
#[derive(Clone, Default)]
pub enum TlsMode {
    /// Bridge encrypted bytes to a backend, routing on SNI.
    #[default]
    Passthrough,
    /// Terminate TLS at the gateway and detect the inner protocol.
    Terminate(TlsAcceptor),
}

impl TlsMode {
    pub fn terminate(config: Arc<ServerConfig>) -> Self {
        TlsMode::Terminate(TlsAcceptor::from(config))
    }

    pub fn is_terminating(&self) -> bool {
        matches!(self, TlsMode::Terminate(_))
    }
}

impl fmt::Debug for TlsMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlsMode::Passthrough => f.write_str("Passthrough"),
            TlsMode::Terminate(_) => f.write_str("Terminate"),
        }
    }
}

/// Load a PEM certificate chain and private key.
pub async fn load_server_config(cert_path: &Path, key_path: &Path) -> Result<Arc<ServerConfig>> {
    let cert_pem = tokio::fs::read(cert_path)
        .await
        .with_context(|| format!("Failed to read TLS certificate {}", cert_path.display()))?;
    let key_pem = tokio::fs::read(key_path)
        .await
        .with_context(|| format!("Failed to read TLS key {}", key_path.display()))?;

    let certs = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Invalid PEM in {}", cert_path.display()))?;
    if certs.is_empty() {
        anyhow::bail!("No certificate found in {}", cert_path.display());
    }

    let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .with_context(|| format!("Invalid PEM in {}", key_path.display()))?
        .with_context(|| format!("No private key found in {}", key_path.display()))?;

    server_config(certs, key)
}

/// Build a server config from DER material.
pub fn server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<Arc<ServerConfig>> {
    let config = ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .context("TLS protocol versions unsupported by provider")?
    .with_no_client_auth()
    .with_single_cert(certs, key)
    .context("Certificate and key do not form a valid identity")?;
    Ok(Arc::new(config))
}

/// Does the connection open with a TLS handshake record?
///
/// The byte stays in the socket buffer. A peer that closes before sending
/// anything is reported as not TLS.
pub async fn starts_with_tls(stream: &TcpStream) -> io::Result<bool> {
    let mut first = [0u8; 1];
    let n = stream.peek(&mut first).await?;
    Ok(n == 1 && is_handshake_record(first[0]))
}
