//! TLS configuration for the stream transport
//!
//! Builds per-connection client crypto (trust-anchor file, or the dev-only
//! validation bypass) and listener-side server crypto from PEM credential
//! files, including password-protected PKCS#8 private keys.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tracing::warn;

use crate::config::{ConnectConfig, ListenConfig};
use crate::error::{Error, Result};

const ENCRYPTED_PKCS8_LABEL: &str = "ENCRYPTED PRIVATE KEY";

/// Transport parameters shared by both sides; idle timeout 0 disables the
/// timer.
pub(crate) fn transport_config(idle_timeout_ms: u64) -> Result<quinn::TransportConfig> {
    let mut transport = quinn::TransportConfig::default();
    if idle_timeout_ms > 0 {
        let timeout = quinn::IdleTimeout::try_from(Duration::from_millis(idle_timeout_ms))
            .map_err(|_| {
                Error::InvalidConfig(format!("idle timeout {idle_timeout_ms}ms out of range"))
            })?;
        transport.max_idle_timeout(Some(timeout));
    }
    Ok(transport)
}

// Several dependencies enable different rustls crypto backends; selecting
// the provider explicitly keeps the config builders unambiguous.
fn provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Client configuration for one outbound connection.
pub(crate) fn client_config(config: &ConnectConfig, idle_timeout_ms: u64) -> Result<quinn::ClientConfig> {
    let builder = rustls::ClientConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|err| Error::Credential(format!("client TLS setup failed: {err}")))?;
    let crypto = if config.allow_insecure {
        warn!(
            server = %config.server_name,
            "certificate validation disabled; development configuration only"
        );
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureServerVerifier))
            .with_no_client_auth()
    } else {
        let mut roots = rustls::RootCertStore::empty();
        if let Some(path) = &config.trust_anchor_file {
            for cert in load_certs(path)? {
                roots
                    .add(cert)
                    .map_err(|err| Error::Credential(format!("bad trust anchor: {err}")))?;
            }
        }
        builder.with_root_certificates(roots).with_no_client_auth()
    };

    let crypto = quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
        .map_err(|err| Error::Credential(format!("client TLS setup failed: {err}")))?;
    let mut client = quinn::ClientConfig::new(Arc::new(crypto));
    client.transport_config(Arc::new(transport_config(idle_timeout_ms)?));
    Ok(client)
}

/// Server configuration for a listener.
pub(crate) fn server_config(config: &ListenConfig) -> Result<quinn::ServerConfig> {
    let certs = load_certs(&config.cert_file)?;
    let key = load_private_key(&config.key_file, config.key_password.as_deref())?;

    let crypto = rustls::ServerConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|err| Error::Credential(format!("server TLS setup failed: {err}")))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|err| Error::Credential(format!("server certificate rejected: {err}")))?;
    let crypto = quinn::crypto::rustls::QuicServerConfig::try_from(crypto)
        .map_err(|err| Error::Credential(format!("server TLS setup failed: {err}")))?;

    let mut server = quinn::ServerConfig::with_crypto(Arc::new(crypto));
    let mut transport = transport_config(config.idle_timeout_ms)?;
    transport.max_concurrent_bidi_streams(quinn::VarInt::from_u32(1024));
    server.transport_config(Arc::new(transport));
    Ok(server)
}

pub(crate) fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let pem = fs::read(path)
        .map_err(|err| Error::Credential(format!("read {}: {err}", path.display())))?;
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<std::result::Result<_, _>>()
        .map_err(|err| Error::Credential(format!("parse {}: {err}", path.display())))?;
    if certs.is_empty() {
        return Err(Error::Credential(format!(
            "no certificates in {}",
            path.display()
        )));
    }
    Ok(certs)
}

pub(crate) fn load_private_key(
    path: &Path,
    password: Option<&str>,
) -> Result<PrivateKeyDer<'static>> {
    match password {
        None | Some("") => {
            let pem = fs::read(path)
                .map_err(|err| Error::Credential(format!("read {}: {err}", path.display())))?;
            rustls_pemfile::private_key(&mut pem.as_slice())
                .map_err(|err| Error::Credential(format!("parse {}: {err}", path.display())))?
                .ok_or_else(|| {
                    Error::Credential(format!("no private key in {}", path.display()))
                })
        }
        Some(password) => {
            let (label, document) = pkcs8::SecretDocument::read_pem_file(path)
                .map_err(|err| Error::Credential(format!("read {}: {err}", path.display())))?;
            if label != ENCRYPTED_PKCS8_LABEL {
                return Err(Error::Credential(format!(
                    "expected an encrypted PKCS#8 key in {}, found '{label}'",
                    path.display()
                )));
            }
            let encrypted = pkcs8::EncryptedPrivateKeyInfo::try_from(document.as_bytes())
                .map_err(|err| Error::Credential(format!("parse {}: {err}", path.display())))?;
            let decrypted = encrypted
                .decrypt(password)
                .map_err(|err| Error::Credential(format!("key decryption failed: {err}")))?;
            Ok(PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
                decrypted.as_bytes().to_vec(),
            )))
        }
    }
}

/// Accepts any server certificate. Development/test escape hatch,
/// reachable only through `ConnectConfig::allow_insecure`.
#[derive(Debug)]
struct InsecureServerVerifier;

impl rustls::client::danger::ServerCertVerifier for InsecureServerVerifier {
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
        vec![
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ED25519,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
        ]
    }
}
