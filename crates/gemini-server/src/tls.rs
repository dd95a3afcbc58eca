//! TLS session management.
//!
//! Listeners that accept client certificates use a verifier that lets any
//! certificate through the handshake (handshake signatures are still
//! checked). Whether the certificate grants management rights is decided
//! once, right after the handshake, and recorded in a [`ClientIdentity`].
//! A certificate that does not chain to the trust anchor therefore yields
//! an anonymous-but-identified client instead of a failed handshake.

use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::HandshakeSignatureValid;
use rustls::crypto::{self, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::WebPkiClientVerifier;
use rustls::{DigitallySignedStruct, DistinguishedName, RootCertStore, SignatureScheme};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use gemini_core::{ClientAuthMode, ConfigError, TlsConfig};

use crate::error::ServerError;

#[cfg(feature = "tokio-runtime")]
use crate::error::TimeoutKind;
#[cfg(feature = "tokio-runtime")]
use tokio::io::{AsyncRead, AsyncWrite};
#[cfg(feature = "tokio-runtime")]
use tokio_rustls::{server::TlsStream, TlsAcceptor};

// ============================================================================
// Client identity
// ============================================================================

/// What the server knows about the peer after the handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientIdentity {
    fingerprint: Option<String>,
    authorized: bool,
}

impl ClientIdentity {
    pub fn new(fingerprint: Option<String>, authorized: bool) -> Self {
        Self {
            fingerprint,
            authorized,
        }
    }

    /// No client certificate was presented.
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn has_certificate(&self) -> bool {
        self.fingerprint.is_some()
    }

    /// The certificate chains to the trust anchor or is explicitly listed.
    pub fn is_authorized(&self) -> bool {
        self.authorized && self.has_certificate()
    }

    /// Lowercase hex SHA-256 of the leaf certificate.
    pub fn fingerprint(&self) -> Option<&str> {
        self.fingerprint.as_deref()
    }
}

/// Lifecycle of a TLS session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsState {
    Idle,
    Handshaking,
    Authenticated,
    Anonymous,
    Streaming,
    Closed,
}

impl TlsState {
    /// State reached when the handshake completes.
    pub fn after_handshake(identity: &ClientIdentity) -> Self {
        if identity.is_authorized() {
            TlsState::Authenticated
        } else {
            TlsState::Anonymous
        }
    }
}

/// Lowercase hex SHA-256 of a DER certificate.
pub fn fingerprint(cert: &CertificateDer<'_>) -> String {
    hex::encode(Sha256::digest(cert.as_ref()))
}

fn normalize_fingerprint(text: &str) -> String {
    text.chars()
        .filter(|c| c.is_ascii_hexdigit())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

// ============================================================================
// Handshake verifier
// ============================================================================

/// Accepts any client certificate; authorization happens after the handshake.
#[derive(Debug)]
struct CapturingVerifier {
    provider: Arc<CryptoProvider>,
    mandatory: bool,
}

impl ClientCertVerifier for CapturingVerifier {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        self.mandatory
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        crypto::verify_tls12_signature(
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
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        crypto::verify_tls13_signature(
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

// ============================================================================
// Session manager
// ============================================================================

/// Holds certificate material and produces per-listener TLS configurations.
pub struct TlsSessionManager {
    provider: Arc<CryptoProvider>,
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    anchor: Option<Arc<dyn ClientCertVerifier>>,
    admin_fingerprints: Vec<String>,
}

impl TlsSessionManager {
    /// Load the certificate files named in the configuration.
    ///
    /// Failure here is fatal for the process.
    pub fn from_config(config: &TlsConfig) -> Result<Self, ServerError> {
        let chain = load_certs(&config.certificate)?;
        let key = load_key(&config.private_key)?;
        let anchors = match &config.trust_anchor {
            Some(path) => load_certs(path)?,
            None => Vec::new(),
        };
        Self::new(chain, key, anchors, &config.admin_fingerprints)
    }

    pub fn new(
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
        anchors: Vec<CertificateDer<'static>>,
        admin_fingerprints: &[String],
    ) -> Result<Self, ServerError> {
        let provider = Arc::new(crypto::ring::default_provider());

        let anchor = if anchors.is_empty() {
            None
        } else {
            let mut roots = RootCertStore::empty();
            for cert in anchors {
                roots
                    .add(cert)
                    .map_err(|e| ServerError::Tls(format!("invalid trust anchor: {}", e)))?;
            }
            let verifier = WebPkiClientVerifier::builder_with_provider(
                Arc::new(roots),
                provider.clone(),
            )
            .build()
            .map_err(|e| ServerError::Tls(format!("invalid trust anchor: {}", e)))?;
            Some(verifier)
        };

        let manager = Self {
            provider,
            chain,
            key,
            anchor,
            admin_fingerprints: admin_fingerprints
                .iter()
                .map(|f| normalize_fingerprint(f))
                .collect(),
        };
        // Surface key/certificate mismatches at startup
        manager.server_config(ClientAuthMode::None)?;
        info!(
            "TLS ready ({} certificate(s) in chain, trust anchor: {}, {} pinned fingerprint(s))",
            manager.chain.len(),
            manager.anchor.is_some(),
            manager.admin_fingerprints.len()
        );
        Ok(manager)
    }

    /// rustls configuration for a listener.
    pub fn server_config(
        &self,
        client_auth: ClientAuthMode,
    ) -> Result<Arc<rustls::ServerConfig>, ServerError> {
        let builder = rustls::ServerConfig::builder_with_provider(self.provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| ServerError::Tls(e.to_string()))?;

        let builder = match client_auth {
            ClientAuthMode::None => builder.with_no_client_auth(),
            mode => builder.with_client_cert_verifier(Arc::new(CapturingVerifier {
                provider: self.provider.clone(),
                mandatory: mode == ClientAuthMode::Required,
            })),
        };

        let config = builder
            .with_single_cert(self.chain.clone(), self.key.clone_key())
            .map_err(|e| ServerError::Tls(format!("unusable server certificate: {}", e)))?;
        Ok(Arc::new(config))
    }

    /// Decide what a presented certificate chain is allowed to do.
    pub fn identify(&self, peer: Option<&[CertificateDer<'_>]>) -> ClientIdentity {
        let Some((leaf, intermediates)) = peer.and_then(|chain| chain.split_first()) else {
            return ClientIdentity::anonymous();
        };
        let fingerprint = fingerprint(leaf);

        let pinned = self.admin_fingerprints.iter().any(|f| *f == fingerprint);
        let chained = self.anchor.as_ref().is_some_and(|anchor| {
            match anchor.verify_client_cert(leaf, intermediates, UnixTime::now()) {
                Ok(_) => true,
                Err(e) => {
                    debug!("Client certificate {} not trusted: {}", fingerprint, e);
                    false
                }
            }
        });

        ClientIdentity::new(Some(fingerprint), pinned || chained)
    }

    #[cfg(feature = "tokio-runtime")]
    pub fn acceptor(&self, client_auth: ClientAuthMode) -> Result<TlsAcceptor, ServerError> {
        Ok(TlsAcceptor::from(self.server_config(client_auth)?))
    }

    /// Run the server side of the handshake and derive the client identity.
    #[cfg(feature = "tokio-runtime")]
    pub async fn handshake<IO>(
        &self,
        acceptor: &TlsAcceptor,
        io: IO,
        deadline: tokio::time::Instant,
    ) -> Result<(TlsStream<IO>, ClientIdentity), ServerError>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let stream = match tokio::time::timeout_at(deadline, acceptor.accept(io)).await {
            Err(_) => return Err(ServerError::Timeout(TimeoutKind::Handshake)),
            Ok(Err(e)) => return Err(ServerError::Tls(e.to_string())),
            Ok(Ok(stream)) => stream,
        };
        let identity = self.identify(stream.get_ref().1.peer_certificates());
        Ok((stream, identity))
    }
}

// ============================================================================
// Certificate loading
// ============================================================================

fn read_file(path: &Path) -> Result<Vec<u8>, ServerError> {
    std::fs::read(path).map_err(|source| {
        ServerError::Config(ConfigError::Read {
            path: path.display().to_string(),
            source,
        })
    })
}

fn is_pem(bytes: &[u8]) -> bool {
    bytes.windows(11).any(|w| w == b"-----BEGIN ")
}

/// Load a certificate chain from a PEM or DER file.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ServerError> {
    let bytes = read_file(path)?;
    if !is_pem(&bytes) {
        return Ok(vec![CertificateDer::from(bytes)]);
    }
    let certs = rustls_pemfile::certs(&mut bytes.as_slice()).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(ServerError::Tls(format!(
            "no certificates in {}",
            path.display()
        )));
    }
    Ok(certs)
}

/// Load a private key from a PEM file or a DER PKCS#8 file.
pub fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, ServerError> {
    let bytes = read_file(path)?;
    if !is_pem(&bytes) {
        return Ok(PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(bytes)));
    }
    rustls_pemfile::private_key(&mut bytes.as_slice())?
        .ok_or_else(|| ServerError::Tls(format!("no private key in {}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const STRANGER_FINGERPRINT: &str =
        "11d95299678b0a512683d279bc1938e661ac40904e59d482c949d606c0db8873";

    fn fixture(name: &str) -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("tests/fixtures")
            .join(name)
    }

    fn manager(fingerprints: &[String]) -> TlsSessionManager {
        TlsSessionManager::new(
            load_certs(&fixture("server.pem")).unwrap(),
            load_key(&fixture("server.key")).unwrap(),
            load_certs(&fixture("ca.pem")).unwrap(),
            fingerprints,
        )
        .unwrap()
    }

    #[test]
    fn test_identify() {
        let manager = manager(&[]);
        let admin = load_certs(&fixture("admin.pem")).unwrap();
        let stranger = load_certs(&fixture("stranger.pem")).unwrap();

        let anonymous = manager.identify(None);
        assert!(!anonymous.has_certificate());
        assert_eq!(TlsState::after_handshake(&anonymous), TlsState::Anonymous);

        let identity = manager.identify(Some(admin.as_slice()));
        assert!(identity.is_authorized());
        assert_eq!(TlsState::after_handshake(&identity), TlsState::Authenticated);

        let identity = manager.identify(Some(stranger.as_slice()));
        assert!(identity.has_certificate());
        assert!(!identity.is_authorized());
        assert_eq!(identity.fingerprint(), Some(STRANGER_FINGERPRINT));
    }

    #[test]
    fn test_pinned_fingerprint() {
        let pinned = STRANGER_FINGERPRINT.to_uppercase();
        let manager = manager(&[pinned]);
        let stranger = load_certs(&fixture("stranger.pem")).unwrap();
        assert!(manager.identify(Some(stranger.as_slice())).is_authorized());
    }

    #[test]
    fn test_der_material() {
        let chain = load_certs(&fixture("server.der")).unwrap();
        let key = load_key(&fixture("server.key.der")).unwrap();
        assert_eq!(chain.len(), 1);
        assert_eq!(chain, load_certs(&fixture("server.pem")).unwrap());
        assert!(TlsSessionManager::new(chain, key, Vec::new(), &[]).is_ok());
    }

    #[test]
    fn test_missing_material_is_config_error() {
        let config = TlsConfig {
            certificate: fixture("absent.pem"),
            ..TlsConfig::default()
        };
        assert!(matches!(
            TlsSessionManager::from_config(&config),
            Err(ServerError::Config(ConfigError::Read { .. }))
        ));
    }
}
