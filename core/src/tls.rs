//! TLS support for the in-band upgrade negotiated by IDENTIFY.
//!
//! Certificates are loaded once at startup; each upgrading connection runs
//! the server handshake on its existing socket.

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use rustls_pemfile::certs;
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum TlsError {
    #[error("Failed to read certificate file: {0}")]
    CertificateRead(#[from] std::io::Error),

    #[error("Failed to parse certificate: {0}")]
    CertificateParse(String),

    #[error("Failed to parse private key: {0}")]
    PrivateKeyParse(String),

    #[error("TLS configuration error: {0}")]
    ConfigError(#[from] rustls::Error),

    #[error("No private keys found in key file")]
    NoPrivateKeys,

    #[error("No certificates found in certificate file")]
    NoCertificates,

    #[error("TLS handshake failed: {0}")]
    Handshake(String),
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TlsConfig {
    /// Path to the certificate chain (PEM)
    pub cert_path: String,
    /// Path to the private key (PEM; PKCS#8, PKCS#1 or SEC1)
    pub key_path: String,
}

impl TlsConfig {
    pub fn new<P: Into<String>>(cert_path: P, key_path: P) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
        }
    }
}

/// Server side of the TLS upgrade
#[derive(Clone)]
pub struct NodeTlsAcceptor {
    acceptor: TlsAcceptor,
    config: TlsConfig,
}

impl std::fmt::Debug for NodeTlsAcceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeTlsAcceptor")
            .field("config", &self.config)
            .finish()
    }
}

impl NodeTlsAcceptor {
    pub fn new(config: TlsConfig) -> Result<Self, TlsError> {
        info!(
            "Initializing TLS with cert: {}, key: {}",
            config.cert_path, config.key_path
        );

        let certs = load_certs(&config.cert_path)?;
        if certs.is_empty() {
            return Err(TlsError::NoCertificates);
        }
        let key = load_private_key(&config.key_path)?;

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let server_config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(certs, key)?;

        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(server_config)),
            config,
        })
    }

    /// Run the server handshake over an already accepted stream
    pub async fn accept<IO>(&self, stream: IO) -> Result<tokio_rustls::server::TlsStream<IO>, TlsError>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let stream = self
            .acceptor
            .accept(stream)
            .await
            .map_err(|e| TlsError::Handshake(e.to_string()))?;
        debug!("TLS handshake completed");
        Ok(stream)
    }

    pub fn config(&self) -> &TlsConfig {
        &self.config
    }
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let mut reader = BufReader::new(File::open(path)?);
    let certs: Vec<CertificateDer<'static>> = certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::CertificateParse(e.to_string()))?;
    info!("Loaded {} certificates from {}", certs.len(), path);
    Ok(certs)
}

fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>, TlsError> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TlsError::PrivateKeyParse(e.to_string()))?
        .ok_or(TlsError::NoPrivateKeys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_tls_config_creation() {
        let config = TlsConfig::new("cert.pem", "key.pem");
        assert_eq!(config.cert_path, "cert.pem");
        assert_eq!(config.key_path, "key.pem");
    }

    #[test]
    fn test_missing_certificate_file() {
        let err = NodeTlsAcceptor::new(TlsConfig::new("/nonexistent/c.pem", "/nonexistent/k.pem"))
            .unwrap_err();
        assert!(matches!(err, TlsError::CertificateRead(_)));
    }

    #[test]
    fn test_empty_pem_files() {
        let dir = tempdir().unwrap();
        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");
        std::fs::write(&cert_path, "").unwrap();
        std::fs::write(&key_path, "").unwrap();

        let err = NodeTlsAcceptor::new(TlsConfig::new(
            cert_path.to_string_lossy().to_string(),
            key_path.to_string_lossy().to_string(),
        ))
        .unwrap_err();
        assert!(matches!(err, TlsError::NoCertificates));

        assert!(matches!(
            load_private_key(&key_path.to_string_lossy()),
            Err(TlsError::NoPrivateKeys)
        ));
    }
}
