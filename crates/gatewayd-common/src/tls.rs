//! TLS material loading for the inbound upgrade capability

use crate::config::TlsSettings;
use crate::error::{ErrorKind, GatewayError, Result};
use rcgen::{CertificateParams, DnType, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fs;
use std::path::Path;

/// Certificate chain and private key, ready to build a rustls server config
#[derive(Debug)]
pub struct TlsMaterial {
    /// Certificate chain in DER format
    pub cert_chain: Vec<CertificateDer<'static>>,
    /// Private key in DER format (stored as bytes for cloning)
    private_key_bytes: Vec<u8>,
}

impl TlsMaterial {
    /// Load TLS material according to the settings: PEM files when paths are
    /// given, a freshly generated self-signed certificate otherwise.
    pub fn from_settings(settings: &TlsSettings) -> Result<Self> {
        match (&settings.cert_path, &settings.key_path) {
            (Some(cert), Some(key)) => Self::from_pem_files(cert, key),
            _ if settings.auto_generate => {
                let (cert_pem, key_pem) = Self::generate_self_signed("localhost")?;
                Self::from_pem(cert_pem.as_bytes(), key_pem.as_bytes())
            }
            _ => Err(GatewayError::new(ErrorKind::FailedToStartServer)
                .with_message("TLS is enabled but no certificate is configured")),
        }
    }

    /// Load TLS material from PEM files
    pub fn from_pem_files(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<Self> {
        let cert_pem = fs::read(cert_path.as_ref()).map_err(|e| {
            GatewayError::new(ErrorKind::FailedToStartServer)
                .with_message(format!("failed to read certificate: {e}"))
                .wrap(e)
        })?;
        let key_pem = fs::read(key_path.as_ref()).map_err(|e| {
            GatewayError::new(ErrorKind::FailedToStartServer)
                .with_message(format!("failed to read private key: {e}"))
                .wrap(e)
        })?;
        Self::from_pem(&cert_pem, &key_pem)
    }

    /// Load TLS material from in-memory PEM data
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self> {
        let cert_chain = parse_pem_certs(cert_pem)?;
        let private_key = parse_pem_key(key_pem)?;

        let private_key_bytes = match &private_key {
            PrivateKeyDer::Pkcs1(key) => key.secret_pkcs1_der().to_vec(),
            PrivateKeyDer::Sec1(key) => key.secret_sec1_der().to_vec(),
            PrivateKeyDer::Pkcs8(key) => key.secret_pkcs8_der().to_vec(),
            _ => {
                return Err(GatewayError::new(ErrorKind::FailedToStartServer)
                    .with_message("unsupported private key format"))
            }
        };

        Ok(Self {
            cert_chain,
            private_key_bytes,
        })
    }

    /// Generate a self-signed certificate for development, returned as PEM
    pub fn generate_self_signed(common_name: &str) -> Result<(String, String)> {
        let mut params = CertificateParams::default();
        params
            .distinguished_name
            .push(DnType::CommonName, common_name);

        let key_pair = KeyPair::generate().map_err(|e| {
            GatewayError::new(ErrorKind::FailedToStartServer)
                .with_message(format!("failed to generate key pair: {e}"))
        })?;

        let cert = params.self_signed(&key_pair).map_err(|e| {
            GatewayError::new(ErrorKind::FailedToStartServer)
                .with_message(format!("failed to generate certificate: {e}"))
        })?;

        Ok((cert.pem(), key_pair.serialize_pem()))
    }

    /// The private key
    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        // Parsed from bytes validated at construction.
        PrivateKeyDer::try_from(self.private_key_bytes.clone())
            .expect("private key bytes were validated at TlsMaterial construction")
    }

    /// Build a rustls server config for accepting upgraded connections
    pub fn server_config(&self) -> Result<rustls::ServerConfig> {
        rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(self.cert_chain.clone(), self.private_key())
            .map_err(|e| {
                GatewayError::new(ErrorKind::FailedToStartServer)
                    .with_message(format!("failed to build TLS server config: {e}"))
                    .wrap(e)
            })
    }
}

impl Clone for TlsMaterial {
    fn clone(&self) -> Self {
        Self {
            cert_chain: self.cert_chain.clone(),
            private_key_bytes: self.private_key_bytes.clone(),
        }
    }
}

/// Parse PEM-encoded certificates
fn parse_pem_certs(pem_data: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = std::io::BufReader::new(pem_data);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| {
            GatewayError::new(ErrorKind::FailedToStartServer)
                .with_message(format!("failed to parse certificates: {e}"))
                .wrap(e)
        })?;
    if certs.is_empty() {
        return Err(GatewayError::new(ErrorKind::FailedToStartServer)
            .with_message("no certificate found in PEM data"));
    }
    Ok(certs)
}

/// Parse a PEM-encoded private key
fn parse_pem_key(pem_data: &[u8]) -> Result<PrivateKeyDer<'static>> {
    let mut reader = std::io::BufReader::new(pem_data);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| {
            GatewayError::new(ErrorKind::FailedToStartServer)
                .with_message(format!("failed to parse private key: {e}"))
                .wrap(e)
        })?
        .ok_or_else(|| {
            GatewayError::new(ErrorKind::FailedToStartServer)
                .with_message("no private key found in PEM data")
        })
}
