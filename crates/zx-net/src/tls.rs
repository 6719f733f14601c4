//! TLS configuration for tcp transports.
//!
//! Peers authenticate each other with the challenge-response exchange, so by
//! default clients accept any server certificate. [`TlsConfig::with_roots`]
//! makes them verify it against a given CA instead.

use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::crypto::{self, CryptoProvider};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use tokio_rustls::rustls::{
    self, ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme,
};
use tokio_rustls::{TlsAcceptor, TlsConnector, client, server};

use zx_core::{ZxError, ZxResult};

fn tls_err(e: impl std::fmt::Display) -> ZxError {
    ZxError::other(format!("tls: {e}"))
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(crypto::ring::default_provider())
}

/// Client and (optionally) server TLS settings.
#[derive(Clone)]
pub struct TlsConfig {
    client: Arc<ClientConfig>,
    server: Option<Arc<ServerConfig>>,
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConfig")
            .field("server", &self.server.is_some())
            .finish()
    }
}

impl TlsConfig {
    /// Client-only settings accepting any server certificate.
    pub fn client_only() -> ZxResult<Self> {
        Ok(Self {
            client: Arc::new(insecure_client()?),
            server: None,
        })
    }

    /// Server certificate chain and key, both PEM.
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> ZxResult<Self> {
        let certs = rustls_pemfile::certs(&mut BufReader::new(cert_pem))
            .collect::<Result<Vec<CertificateDer<'static>>, _>>()
            .map_err(tls_err)?;
        if certs.is_empty() {
            return Err(tls_err("no certificates found"));
        }
        let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut BufReader::new(key_pem))
            .map_err(tls_err)?
            .ok_or_else(|| tls_err("no private key found"))?;
        let server = ServerConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()
            .map_err(tls_err)?
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(tls_err)?;
        Ok(Self {
            client: Arc::new(insecure_client()?),
            server: Some(Arc::new(server)),
        })
    }

    /// Load `cert` and `key` PEM files.
    pub fn load(cert: &Path, key: &Path) -> ZxResult<Self> {
        let cert_pem = std::fs::read(cert).map_err(|e| ZxError::from_io(&cert.display().to_string(), e))?;
        let key_pem = std::fs::read(key).map_err(|e| ZxError::from_io(&key.display().to_string(), e))?;
        Self::from_pem(&cert_pem, &key_pem)
    }

    /// Verify servers against the PEM certificates in `ca_pem`.
    pub fn with_roots(mut self, ca_pem: &[u8]) -> ZxResult<Self> {
        let mut roots = RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut BufReader::new(ca_pem)) {
            roots.add(cert.map_err(tls_err)?).map_err(tls_err)?;
        }
        let client = ClientConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()
            .map_err(tls_err)?
            .with_root_certificates(roots)
            .with_no_client_auth();
        self.client = Arc::new(client);
        Ok(self)
    }

    pub fn can_serve(&self) -> bool {
        self.server.is_some()
    }

    pub async fn connect(&self, host: &str, s: TcpStream) -> ZxResult<client::TlsStream<TcpStream>> {
        let name = ServerName::try_from(host.to_string()).map_err(tls_err)?;
        TlsConnector::from(self.client.clone())
            .connect(name, s)
            .await
            .map_err(tls_err)
    }

    pub async fn accept(&self, s: TcpStream) -> ZxResult<server::TlsStream<TcpStream>> {
        let cfg = self
            .server
            .clone()
            .ok_or_else(|| tls_err("no server certificate"))?;
        TlsAcceptor::from(cfg).accept(s).await.map_err(tls_err)
    }
}

fn insecure_client() -> ZxResult<ClientConfig> {
    let provider = provider();
    Ok(ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(tls_err)?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AnyServer(provider)))
        .with_no_client_auth())
}

/// Accepts every server certificate but still checks handshake signatures.
#[derive(Debug)]
struct AnyServer(Arc<CryptoProvider>);

impl ServerCertVerifier for AnyServer {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        crypto::verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        crypto::verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
