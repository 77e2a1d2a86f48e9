//! In-memory TLS material for database connections.
//!
//! Certificates and keys arrive as PEM text inside the plugin configuration;
//! they are never read from disk. Material is validated once at initialize
//! and turned into a rustls [`ClientConfig`] on demand.

use std::io::{BufReader, Cursor};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ClientConfig;

use crate::error::{Error, Result};

/// PEM-sourced TLS settings
#[derive(Clone)]
pub struct TlsMaterial {
    root_certs: Vec<CertificateDer<'static>>,
    client_chain: Option<Vec<CertificateDer<'static>>>,
    client_key: Option<Arc<PrivateKeyDer<'static>>>,
    /// Skip server certificate verification
    pub insecure_skip_verify: bool,
}

impl std::fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("root_certs", &self.root_certs.len())
            .field("client_chain", &self.client_chain.as_ref().map(Vec::len))
            .field("client_key", &self.client_key.as_ref().map(|_| "[REDACTED]"))
            .field("insecure_skip_verify", &self.insecure_skip_verify)
            .finish()
    }
}

impl TlsMaterial {
    /// Build from optional PEM inputs.
    ///
    /// Returns `Ok(None)` when nothing is configured. A certificate chain and
    /// key must be supplied together and must form a usable client identity.
    pub fn from_pem(
        root_ca: Option<&str>,
        cert_chain: Option<&str>,
        key: Option<&str>,
    ) -> Result<Option<Self>> {
        let root_ca = root_ca.filter(|s| !s.trim().is_empty());
        let cert_chain = cert_chain.filter(|s| !s.trim().is_empty());
        let key = key.filter(|s| !s.trim().is_empty());

        if root_ca.is_none() && cert_chain.is_none() && key.is_none() {
            return Ok(None);
        }

        let root_certs = match root_ca {
            Some(pem) => parse_pem_certificates(pem.as_bytes())?,
            None => Vec::new(),
        };

        let (client_chain, client_key) = match (cert_chain, key) {
            (Some(chain), Some(key)) => (
                Some(parse_pem_certificates(chain.as_bytes())?),
                Some(Arc::new(parse_pem_private_key(key.as_bytes())?)),
            ),
            (None, None) => (None, None),
            _ => {
                return Err(Error::config(
                    "TLS certificate chain and private key must be provided together",
                ))
            }
        };

        let material = Self {
            root_certs,
            client_chain,
            client_key,
            insecure_skip_verify: false,
        };
        // Reject mismatched or unsupported keys now rather than at first connect.
        material.client_config()?;
        Ok(Some(material))
    }

    /// Material that only disables verification
    pub fn insecure() -> Self {
        Self {
            root_certs: Vec::new(),
            client_chain: None,
            client_key: None,
            insecure_skip_verify: true,
        }
    }

    /// Whether a client identity is configured
    pub fn has_client_identity(&self) -> bool {
        self.client_chain.is_some()
    }

    /// Configured root certificates
    pub fn root_certs(&self) -> &[CertificateDer<'static>] {
        &self.root_certs
    }

    /// Build a rustls client configuration from this material
    pub fn client_config(&self) -> Result<ClientConfig> {
        let builder = ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::config(format!("invalid TLS protocol configuration: {e}")))?;

        let builder = if self.insecure_skip_verify {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoCertificateVerification))
        } else {
            builder.with_root_certificates(self.root_store()?)
        };

        match (&self.client_chain, &self.client_key) {
            (Some(chain), Some(key)) => builder
                .with_client_auth_cert(chain.clone(), key.clone_key())
                .map_err(|e| Error::config(format!("invalid TLS client certificate or key: {e}"))),
            _ => Ok(builder.with_no_client_auth()),
        }
    }

    fn root_store(&self) -> Result<rustls::RootCertStore> {
        let mut store = rustls::RootCertStore::empty();
        if self.root_certs.is_empty() {
            let native = rustls_native_certs::load_native_certs();
            for cert in native.certs {
                let _ = store.add(cert);
            }
            return Ok(store);
        }
        for cert in &self.root_certs {
            store
                .add(cert.clone())
                .map_err(|e| Error::config(format!("failed to add root CA certificate: {e}")))?;
        }
        Ok(store)
    }
}

/// Client configuration trusting the platform's native roots
pub fn default_client_config() -> Result<ClientConfig> {
    TlsMaterial {
        root_certs: Vec::new(),
        client_chain: None,
        client_key: None,
        insecure_skip_verify: false,
    }
    .client_config()
}

fn parse_pem_certificates(data: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(Cursor::new(data));
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::config(format!("failed to parse PEM certificate: {e}")))?;

    if certs.is_empty() {
        return Err(Error::config("no certificates found in PEM data"));
    }
    Ok(certs)
}

fn parse_pem_private_key(data: &[u8]) -> Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(Cursor::new(data));
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| Error::config(format!("failed to parse PEM private key: {e}")))?
        .ok_or_else(|| Error::config("no private key found in PEM data"))
}

/// Certificate verifier that accepts any server certificate
#[derive(Debug)]
struct NoCertificateVerification;

impl rustls::client::danger::ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
