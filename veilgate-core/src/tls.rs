//! rustls configuration for both ends of the tunnel.
//!
//! The server presents a standard certificate chain and optionally restricts
//! cipher suites; session tickets are on by default. The client honors SNI,
//! keeps a bounded in-memory resumption cache, and can pin a CA file or
//! disable verification entirely.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use tokio_rustls::rustls::{self, ClientConfig, ServerConfig, SupportedCipherSuite};

use crate::config::Config;
use crate::error::{Error, Result};

pub fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| Error::tls_with_source(format!("cannot open cert file {path}"), e))?;
    let mut reader = BufReader::new(file);
    let certs: Vec<_> = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::tls_with_source(format!("invalid cert file {path}"), e))?;
    if certs.is_empty() {
        return Err(Error::tls(format!("no certificate found in {path}")));
    }
    Ok(certs)
}

/// Loads the server private key. With a key password the file is expected to
/// hold an encrypted PKCS#8 blob; when decryption succeeds the decrypted key
/// is used.
pub fn load_private_key(path: &str, password: &str) -> Result<PrivateKeyDer<'static>> {
    if !password.is_empty() {
        return load_encrypted_key(path, password);
    }

    let file = File::open(path)
        .map_err(|e| Error::tls_with_source(format!("cannot open key file {path}"), e))?;
    let mut reader = BufReader::new(file);
    if let Some(key) = rustls_pemfile::pkcs8_private_keys(&mut reader)
        .next()
        .transpose()
        .map_err(|e| Error::tls_with_source(format!("invalid pkcs8 key in {path}"), e))?
    {
        return Ok(PrivateKeyDer::Pkcs8(key));
    }

    let file = File::open(path)
        .map_err(|e| Error::tls_with_source(format!("cannot open key file {path}"), e))?;
    let mut reader = BufReader::new(file);
    let key = rustls_pemfile::rsa_private_keys(&mut reader)
        .next()
        .ok_or_else(|| Error::tls(format!("no private key found in {path}")))?
        .map_err(|e| Error::tls_with_source(format!("invalid rsa key in {path}"), e))?;
    Ok(PrivateKeyDer::Pkcs1(key))
}

fn load_encrypted_key(path: &str, password: &str) -> Result<PrivateKeyDer<'static>> {
    use pkcs8::der::Decode;

    let (label, doc) = pkcs8::SecretDocument::read_pem_file(path)
        .map_err(|e| Error::tls_with_source(format!("cannot read key file {path}"), e))?;
    match label.as_str() {
        "ENCRYPTED PRIVATE KEY" => {
            let info = pkcs8::EncryptedPrivateKeyInfo::from_der(doc.as_bytes())
                .map_err(|e| Error::tls_with_source(format!("malformed encrypted key in {path}"), e))?;
            let decrypted = info
                .decrypt(password)
                .map_err(|e| Error::tls_with_source("failed to decrypt private key", e))?;
            Ok(PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
                decrypted.as_bytes().to_vec(),
            )))
        }
        // A key password against an unencrypted key is tolerated.
        "PRIVATE KEY" => Ok(PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
            doc.as_bytes().to_vec(),
        ))),
        other => Err(Error::tls(format!(
            "unsupported key type {other:?} in {path}"
        ))),
    }
}

/// Resolves the configured `:`-separated suite names against the provider's
/// suites. An unknown name makes the whole list ignored, with a warning.
fn select_cipher_suites(cipher: &str, cipher_tls13: &str) -> Option<Vec<SupportedCipherSuite>> {
    let joined = format!("{cipher}:{cipher_tls13}");
    let names: Vec<&str> = joined.split(':').filter(|s| !s.is_empty()).collect();
    if names.is_empty() {
        return None;
    }
    let provider = rustls::crypto::ring::default_provider();
    let mut picked = Vec::new();
    for name in &names {
        match provider
            .cipher_suites
            .iter()
            .find(|s| format!("{:?}", s.suite()) == *name)
        {
            Some(suite) => picked.push(*suite),
            None => {
                tracing::warn!(cipher = %name, "unknown cipher name, ignoring cipher list");
                return None;
            }
        }
    }
    Some(picked)
}

fn provider_with_suites(
    suites: Option<Vec<SupportedCipherSuite>>,
) -> Arc<rustls::crypto::CryptoProvider> {
    let mut provider = rustls::crypto::ring::default_provider();
    if let Some(suites) = suites {
        provider.cipher_suites = suites;
    }
    Arc::new(provider)
}

/// Builds the server-side TLS configuration: cert chain + key, optional
/// cipher restriction, session tickets per config.
pub fn make_server_config(cfg: &Config) -> Result<Arc<ServerConfig>> {
    let certs = load_certs(&cfg.tls.cert)?;
    let key = load_private_key(&cfg.tls.key, &cfg.tls.key_password)?;
    let suites = select_cipher_suites(&cfg.tls.cipher, &cfg.tls.cipher_tls13);

    let mut config = ServerConfig::builder_with_provider(provider_with_suites(suites))
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::tls_with_source("unusable cipher configuration", e))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::tls_with_source("invalid certificate or key", e))?;

    if cfg.tls.session_ticket {
        config.ticketer = rustls::crypto::ring::Ticketer::new()
            .map_err(|e| Error::tls_with_source("cannot create ticketer", e))?;
    } else {
        config.session_storage = Arc::new(rustls::server::NoServerSessionStorage {});
    }
    Ok(Arc::new(config))
}

/// Builds the client-side TLS configuration used by the tunnel dialer.
pub fn make_client_config(cfg: &Config) -> Result<Arc<ClientConfig>> {
    let mut roots = rustls::RootCertStore::empty();
    if cfg.tls.cert.is_empty() {
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    } else {
        for cert in load_certs(&cfg.tls.cert)? {
            roots
                .add(cert)
                .map_err(|e| Error::tls_with_source("invalid CA certificate", e))?;
        }
    }

    let suites = select_cipher_suites(&cfg.tls.cipher, &cfg.tls.cipher_tls13);
    let provider = provider_with_suites(suites);
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::tls_with_source("unusable cipher configuration", e))?;

    let mut config = if !cfg.tls.verify {
        tracing::warn!("certificate verification disabled");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(danger::NoVerify::new(provider)))
            .with_no_client_auth()
    } else if !cfg.tls.verify_hostname {
        tracing::warn!("certificate hostname verification disabled");
        let inner = rustls::client::WebPkiServerVerifier::builder_with_provider(
            Arc::new(roots),
            provider,
        )
        .build()
        .map_err(|e| Error::tls_with_source("cannot build certificate verifier", e))?;
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(danger::NoHostname::new(inner)))
            .with_no_client_auth()
    } else {
        builder
            .with_root_certificates(roots)
            .with_no_client_auth()
    };

    config.resumption = if cfg.tls.session_ticket {
        rustls::client::Resumption::in_memory_sessions(256)
    } else {
        rustls::client::Resumption::disabled()
    };
    Ok(Arc::new(config))
}

pub fn server_name(host: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(host.to_string())
        .map_err(|e| Error::tls_with_source(format!("invalid server name {host}"), e))
}

pub mod danger {
    use std::sync::Arc;

    use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
    use tokio_rustls::rustls::{
        self,
        client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
        client::WebPkiServerVerifier,
        crypto::CryptoProvider,
        DigitallySignedStruct, SignatureScheme,
    };

    /// Accepts any server certificate. Signatures are still checked so a
    /// plaintext man-in-the-middle cannot skip the handshake entirely.
    #[derive(Debug)]
    pub struct NoVerify {
        provider: Arc<CryptoProvider>,
    }

    impl NoVerify {
        pub fn new(provider: Arc<CryptoProvider>) -> Self {
            Self { provider }
        }
    }

    impl ServerCertVerifier for NoVerify {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> std::result::Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls12_signature(
                message,
                cert,
                dss,
                &self.provider.signature_verification_algorithms,
            )
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls13_signature(
                message,
                cert,
                dss,
                &self.provider.signature_verification_algorithms,
            )
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.provider
                .signature_verification_algorithms
                .supported_schemes()
        }
    }

    /// Full chain verification, but a certificate that fails only the
    /// hostname check is accepted.
    #[derive(Debug)]
    pub struct NoHostname {
        inner: Arc<WebPkiServerVerifier>,
    }

    impl NoHostname {
        pub fn new(inner: Arc<WebPkiServerVerifier>) -> Self {
            Self { inner }
        }
    }

    impl ServerCertVerifier for NoHostname {
        fn verify_server_cert(
            &self,
            end_entity: &CertificateDer<'_>,
            intermediates: &[CertificateDer<'_>],
            server_name: &ServerName<'_>,
            ocsp_response: &[u8],
            now: UnixTime,
        ) -> std::result::Result<ServerCertVerified, rustls::Error> {
            match self.inner.verify_server_cert(
                end_entity,
                intermediates,
                server_name,
                ocsp_response,
                now,
            ) {
                Err(rustls::Error::InvalidCertificate(
                    rustls::CertificateError::NotValidForName
                    | rustls::CertificateError::NotValidForNameContext { .. },
                )) => Ok(ServerCertVerified::assertion()),
                other => other,
            }
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
            self.inner.verify_tls12_signature(message, cert, dss)
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
            self.inner.verify_tls13_signature(message, cert, dss)
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.inner.supported_verify_schemes()
        }
    }
}
