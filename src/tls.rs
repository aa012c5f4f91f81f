//! Loading of TLS material shared by outbound clients.
//!
//! The same CA certificate and keypair secure both the authentication
//! service client and, when enabled, the Docker daemon connection.

use std::path::PathBuf;

use tokio::fs;

use crate::config::Settings;

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("CA certificate path not configured")]
    MissingCaCert,

    #[error("client certificate path not configured")]
    MissingCert,

    #[error("private key path not configured")]
    MissingKey,

    #[error("CA certificate not found: {0}")]
    CaCertNotFound(PathBuf),

    #[error("client certificate not found: {0}")]
    CertNotFound(PathBuf),

    #[error("private key not found: {0}")]
    KeyNotFound(PathBuf),

    #[error("failed to read file: {0}")]
    Io(#[from] std::io::Error),
}

/// PEM-encoded TLS material loaded from the configured paths.
#[derive(Clone)]
pub struct TlsMaterial {
    pub ca_cert_path: PathBuf,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub ca_pem: Vec<u8>,
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
}

impl TlsMaterial {
    /// Load the CA certificate and client keypair named by the settings.
    pub async fn load(settings: &Settings) -> Result<Self, TlsError> {
        let ca_cert_path = settings.ca_cert.clone().ok_or(TlsError::MissingCaCert)?;
        let cert_path = settings.cert.clone().ok_or(TlsError::MissingCert)?;
        let key_path = settings.key.clone().ok_or(TlsError::MissingKey)?;

        if !ca_cert_path.exists() {
            return Err(TlsError::CaCertNotFound(ca_cert_path));
        }
        if !cert_path.exists() {
            return Err(TlsError::CertNotFound(cert_path));
        }
        if !key_path.exists() {
            return Err(TlsError::KeyNotFound(key_path));
        }

        let ca_pem = fs::read(&ca_cert_path).await?;
        let cert_pem = fs::read(&cert_path).await?;
        let key_pem = fs::read(&key_path).await?;

        Ok(TlsMaterial {
            ca_cert_path,
            cert_path,
            key_path,
            ca_pem,
            cert_pem,
            key_pem,
        })
    }

    /// Certificate and key concatenated into a single PEM bundle, the form
    /// client identity builders expect.
    pub fn identity_pem(&self) -> Vec<u8> {
        let mut bundle = self.cert_pem.clone();
        if !bundle.ends_with(b"\n") {
            bundle.push(b'\n');
        }
        bundle.extend_from_slice(&self.key_pem);
        bundle
    }
}
