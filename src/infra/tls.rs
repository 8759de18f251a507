//! TLS material for broker connections
//!
//! Certificates are read and parsed at config time so a bad path or a
//! malformed certificate stops startup instead of surfacing as a handshake
//! failure.

use crate::infra::error::TlsError;
use rumqttc::TlsConfiguration;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{CertificateError, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use rustls_pemfile::{certs, private_key};
use std::fs;
use std::sync::Arc;
use tracing::{debug, warn};

/// TLS keys as written in the broker section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsSettings {
    pub ca_cert: Option<String>,
    pub client_cert: Option<String>,
    pub client_key: Option<String>,
    /// Check the broker certificate against the configured host name
    pub verify_hostname: bool,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self { ca_cert: None, client_cert: None, client_key: None, verify_hostname: true }
    }
}

/// Parsed certificates turned into a ready rustls client configuration
#[derive(Clone)]
pub struct TlsMaterial {
    config: Arc<ClientConfig>,
    ca_certs: usize,
    client_auth: bool,
    verify_hostname: bool,
}

impl std::fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("ca_certs", &self.ca_certs)
            .field("client_auth", &self.client_auth)
            .field("verify_hostname", &self.verify_hostname)
            .finish()
    }
}

impl TlsMaterial {
    pub fn load(settings: &TlsSettings) -> Result<Self, TlsError> {
        let ca_path = settings.ca_cert.as_deref().filter(|p| !p.is_empty());
        let ca_path = ca_path.ok_or(TlsError::MissingCaCert)?;
        let mut roots = RootCertStore::empty();
        let ca_certs = read_certs(ca_path)?;
        for cert in &ca_certs {
            roots.add(cert.clone()).map_err(|e| cert_error(ca_path, e))?;
        }
        debug!(path = %ca_path, certs = ca_certs.len(), "tls_ca_loaded");

        let roots = Arc::new(roots);
        let builder = if settings.verify_hostname {
            ClientConfig::builder().with_root_certificates(Arc::clone(&roots))
        } else {
            warn!(path = %ca_path, "tls_hostname_verification_disabled");
            let inner = WebPkiServerVerifier::builder(Arc::clone(&roots))
                .build()
                .map_err(|e| TlsError::CertificateParse {
                    path: ca_path.to_string(),
                    reason: e.to_string(),
                })?;
            ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(SkipHostnameVerifier { inner }))
        };

        let client_cert = settings.client_cert.as_deref().filter(|p| !p.is_empty());
        let client_key = settings.client_key.as_deref().filter(|p| !p.is_empty());
        let config = match (client_cert, client_key) {
            (None, None) => builder.with_no_client_auth(),
            (Some(_), None) => return Err(TlsError::MissingClientKey),
            (None, Some(_)) => return Err(TlsError::MissingClientCert),
            (Some(cert_path), Some(key_path)) => {
                let chain = read_certs(cert_path)?;
                // Parse each certificate as X.509; the store is discarded
                let mut scratch = RootCertStore::empty();
                for cert in &chain {
                    scratch.add(cert.clone()).map_err(|e| cert_error(cert_path, e))?;
                }
                let key = read_private_key(key_path)?;
                let config = builder.with_client_auth_cert(chain, key).map_err(|e| {
                    TlsError::PrivateKeyParse { path: key_path.to_string(), reason: e.to_string() }
                })?;
                debug!(cert = %cert_path, key = %key_path, "tls_client_auth_loaded");
                config
            }
        };

        Ok(Self {
            config: Arc::new(config),
            ca_certs: ca_certs.len(),
            client_auth: client_cert.is_some(),
            verify_hostname: settings.verify_hostname,
        })
    }

    pub fn has_client_auth(&self) -> bool {
        self.client_auth
    }

    pub fn verifies_hostname(&self) -> bool {
        self.verify_hostname
    }

    /// rustls configuration for the MQTT transport
    pub fn to_configuration(&self) -> TlsConfiguration {
        TlsConfiguration::Rustls(Arc::clone(&self.config))
    }
}

fn read_file(path: &str) -> Result<Vec<u8>, TlsError> {
    fs::read(path).map_err(|source| TlsError::Read { path: path.to_string(), source })
}

fn cert_error(path: &str, e: rustls::Error) -> TlsError {
    TlsError::CertificateParse { path: path.to_string(), reason: e.to_string() }
}

fn read_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let pem = read_file(path)?;
    let mut reader = pem.as_slice();
    let parsed = certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::CertificateParse { path: path.to_string(), reason: e.to_string() })?;
    if parsed.is_empty() {
        return Err(TlsError::NoCertificates(path.to_string()));
    }
    Ok(parsed)
}

fn read_private_key(path: &str) -> Result<PrivateKeyDer<'static>, TlsError> {
    let pem = read_file(path)?;
    let mut reader = pem.as_slice();
    match private_key(&mut reader) {
        Ok(Some(key)) => Ok(key),
        Ok(None) => Err(TlsError::NoPrivateKey(path.to_string())),
        Err(e) => {
            Err(TlsError::PrivateKeyParse { path: path.to_string(), reason: e.to_string() })
        }
    }
}

/// Full chain verification that accepts a certificate issued for another name
#[derive(Debug)]
struct SkipHostnameVerifier {
    inner: Arc<WebPkiServerVerifier>,
}

impl ServerCertVerifier for SkipHostnameVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        match self.inner.verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now) {
            Err(rustls::Error::InvalidCertificate(CertificateError::NotValidForName)) => {
                Ok(ServerCertVerified::assertion())
            }
            other => other,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}
