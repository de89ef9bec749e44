use crate::error::Result;
use crate::options::TlsOptions;

#[cfg(feature = "rustls-tls")]
use std::sync::Arc;

#[cfg(feature = "rustls-tls")]
use rustls::{
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::ring as ring_provider,
    pki_types::{CertificateDer, ServerName, UnixTime},
    ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
};
#[cfg(feature = "rustls-tls")]
use tokio::net::TcpStream;
#[cfg(feature = "rustls-tls")]
use tokio_rustls::TlsConnector;

/// Configuration required to use TLS. Creating this is expensive (it builds the certificate
/// store), so it should be created once per client and shared.
#[derive(Clone)]
pub(crate) struct TlsConfig {
    #[cfg(feature = "rustls-tls")]
    connector: TlsConnector,
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConfig").finish()
    }
}

impl TlsConfig {
    /// Create a `TlsConfig` from the given options.
    #[cfg(feature = "rustls-tls")]
    pub(crate) fn new(options: &TlsOptions) -> Result<TlsConfig> {
        let verifier_config = make_rustls_config(options)?;
        Ok(TlsConfig {
            connector: TlsConnector::from(Arc::new(verifier_config)),
        })
    }

    #[cfg(not(feature = "rustls-tls"))]
    pub(crate) fn new(_options: &TlsOptions) -> Result<TlsConfig> {
        Err(crate::error::ErrorKind::InvalidTlsConfig {
            message: "TLS was requested, but no TLS feature (rustls-tls) is enabled".to_string(),
        }
        .into())
    }
}

/// Perform the TLS handshake over an established TCP stream.
#[cfg(feature = "rustls-tls")]
pub(crate) async fn tls_connect(
    host: &str,
    tcp_stream: TcpStream,
    cfg: &TlsConfig,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let name = ServerName::try_from(host.to_string()).map_err(|e| {
        crate::error::ErrorKind::InvalidTlsConfig {
            message: format!("invalid hostname for TLS: {}: {}", host, e),
        }
    })?;

    let session = cfg
        .connector
        .connect(name, tcp_stream)
        .await
        .map_err(|e| crate::error::ErrorKind::Tls {
            message: e.to_string(),
        })?;

    Ok(session)
}

#[cfg(feature = "rustls-tls")]
fn make_rustls_config(options: &TlsOptions) -> Result<ClientConfig> {
    let mut root_store = RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    // CA material is handed to the core pre-parsed (DER); PEM handling belongs to the URI/config
    // collaborator.
    if let Some(ref ca_certs) = options.ca_certificates {
        for der in ca_certs {
            root_store
                .add(CertificateDer::from(der.clone()))
                .map_err(|e| crate::error::ErrorKind::InvalidTlsConfig {
                    message: format!("invalid CA certificate: {}", e),
                })?;
        }
    }

    let mut config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    if options.allow_invalid_certificates == Some(true) {
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoCertVerifier {}));
    }

    Ok(config)
}

/// A certificate verifier that accepts anything, used for `tlsAllowInvalidCertificates`.
#[cfg(feature = "rustls-tls")]
#[derive(Debug)]
struct NoCertVerifier {}

#[cfg(feature = "rustls-tls")]
impl ServerCertVerifier for NoCertVerifier {
    fn verify_server_cert(
        &self,
        _: &CertificateDer,
        _: &[CertificateDer],
        _: &ServerName,
        _: &[u8],
        _: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _: &[u8],
        _: &CertificateDer,
        _: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _: &[u8],
        _: &CertificateDer,
        _: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        ring_provider::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
