//! Memory-BIO TLS client channel
//!
//! The control channel tunnels TLS records through reliable control
//! packets, so the TLS engine never touches a socket: ciphertext goes in
//! and out as byte buffers, plaintext flows once the handshake completes.
//! "No bytes now" is `Ok(None)`, never an error.
//!
//! [`RustlsChannel`] implements the surface over `rustls` with in-memory
//! certificates. Chain validation runs against the configured CA with the
//! hostname check relaxed (OpenVPN peers are pinned by CA, not by name).
//! On handshake completion the peer certificate must carry the
//! server-authentication Extended Key Usage.

pub mod mock;

use std::io::{Cursor, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{
    CertificateError, ClientConfig, ClientConnection, DigitallySignedStruct, RootCertStore,
    SignatureScheme,
};
use thiserror::Error;

use crate::config::SessionConfig;

/// Server name used when the configuration provides none; the verifier
/// does not check names, but rustls requires one for SNI
const DEFAULT_SERVER_NAME: &str = "ruvpn-remote";

/// Errors surfaced by a TLS channel
#[derive(Debug, Clone, Error)]
pub enum TlsError {
    /// Context/configuration construction failed
    #[error("TLS setup error: {0}")]
    Setup(String),

    /// The handshake or record layer failed
    #[error("TLS error: {0}")]
    Handshake(String),

    /// The peer certificate was rejected by chain verification
    #[error("peer certificate verification failed")]
    PeerVerification,

    /// The peer certificate lacks the server-authentication EKU
    #[error("peer certificate lacks TLS Web Server Authentication")]
    ServerEku,
}

/// Byte-level TLS channel consumed by the session engine
pub trait TlsChannel: Send {
    /// Create the context and kick the handshake
    fn start(&mut self) -> Result<(), TlsError>;

    /// Feed raw TLS record bytes received from the peer
    fn put_cipher_text(&mut self, data: &[u8]) -> Result<(), TlsError>;

    /// Drain TLS records the engine wants to transmit
    fn pull_cipher_text(&mut self) -> Result<Option<Vec<u8>>, TlsError>;

    /// Write application plaintext (valid once the handshake completed)
    fn put_plain_text(&mut self, data: &[u8]) -> Result<(), TlsError>;

    /// Read decrypted application plaintext
    fn pull_plain_text(&mut self) -> Result<Option<Vec<u8>>, TlsError>;

    /// Whether the handshake (including peer verification) completed
    fn is_connected(&self) -> bool;
}

/// Constructor for per-key TLS channels; each negotiation gets a fresh one
pub type TlsFactory =
    Box<dyn Fn(&SessionConfig) -> Result<Box<dyn TlsChannel>, TlsError> + Send + Sync>;

/// The production factory backed by [`RustlsChannel`]
pub fn rustls_factory() -> TlsFactory {
    Box::new(|config| Ok(Box::new(RustlsChannel::new(config)?)))
}

/// `rustls`-backed memory-BIO channel
pub struct RustlsChannel {
    client_config: Arc<ClientConfig>,
    server_name: ServerName<'static>,
    conn: Option<ClientConnection>,
    /// Set by the verifier when it rejects the peer chain
    peer_rejected: Arc<AtomicBool>,
    /// EKU verified after the handshake finished
    eku_verified: bool,
}

impl RustlsChannel {
    /// Build the channel from the session configuration.
    ///
    /// Certificates stay in memory for their whole lifetime; no PEM cache
    /// directory is involved.
    pub fn new(config: &SessionConfig) -> Result<Self, TlsError> {
        let peer_rejected = Arc::new(AtomicBool::new(false));
        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let mut roots = RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut config.ca.as_bytes()) {
            let cert = cert.map_err(|e| TlsError::Setup(format!("invalid CA PEM: {}", e)))?;
            roots
                .add(cert)
                .map_err(|e| TlsError::Setup(format!("unusable CA certificate: {}", e)))?;
        }
        if roots.is_empty() {
            return Err(TlsError::Setup("no CA certificates found".to_string()));
        }

        let webpki = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider.clone())
            .build()
            .map_err(|e| TlsError::Setup(e.to_string()))?;
        let verifier = Arc::new(CaVerifier {
            inner: webpki,
            rejected: peer_rejected.clone(),
        });

        let builder = ClientConfig::builder_with_provider(provider)
            .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])
            .map_err(|e| TlsError::Setup(e.to_string()))?
            .dangerous()
            .with_custom_certificate_verifier(verifier);

        let client_config = match (&config.client_certificate, &config.client_key) {
            (Some(certificate), Some(key)) => {
                let certs: Vec<CertificateDer<'static>> =
                    rustls_pemfile::certs(&mut certificate.as_bytes())
                        .collect::<Result<_, _>>()
                        .map_err(|e| {
                            TlsError::Setup(format!("invalid client certificate PEM: {}", e))
                        })?;
                let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key.as_bytes())
                    .map_err(|e| TlsError::Setup(format!("invalid client key PEM: {}", e)))?
                    .ok_or_else(|| TlsError::Setup("no private key in PEM".to_string()))?;
                builder
                    .with_client_auth_cert(certs, key)
                    .map_err(|e| TlsError::Setup(e.to_string()))?
            }
            _ => builder.with_no_client_auth(),
        };

        let name = config
            .tls_server_name
            .clone()
            .unwrap_or_else(|| DEFAULT_SERVER_NAME.to_string());
        let server_name = ServerName::try_from(name)
            .map_err(|e| TlsError::Setup(format!("invalid server name: {}", e)))?;

        Ok(Self {
            client_config: Arc::new(client_config),
            server_name,
            conn: None,
            peer_rejected,
            eku_verified: false,
        })
    }

    fn conn_mut(&mut self) -> Result<&mut ClientConnection, TlsError> {
        self.conn
            .as_mut()
            .ok_or_else(|| TlsError::Handshake("channel not started".to_string()))
    }

    fn map_process_error(&self, error: rustls::Error) -> TlsError {
        if self.peer_rejected.load(Ordering::SeqCst)
            || matches!(error, rustls::Error::InvalidCertificate(_))
        {
            TlsError::PeerVerification
        } else {
            TlsError::Handshake(error.to_string())
        }
    }

    /// Once the handshake finishes, require the serverAuth EKU on the
    /// peer certificate.
    fn verify_eku_if_ready(&mut self) -> Result<(), TlsError> {
        let Some(conn) = self.conn.as_ref() else {
            return Ok(());
        };
        if self.eku_verified || conn.is_handshaking() {
            return Ok(());
        }
        let end_entity = conn
            .peer_certificates()
            .and_then(|certs| certs.first())
            .ok_or_else(|| TlsError::Handshake("no peer certificate".to_string()))?;

        use x509_parser::prelude::*;
        let (_, parsed) = X509Certificate::from_der(end_entity.as_ref())
            .map_err(|_| TlsError::Handshake("unparseable peer certificate".to_string()))?;
        let has_server_auth = matches!(
            parsed.extended_key_usage(),
            Ok(Some(eku)) if eku.value.server_auth || eku.value.any
        );
        if !has_server_auth {
            return Err(TlsError::ServerEku);
        }
        self.eku_verified = true;
        Ok(())
    }
}

impl TlsChannel for RustlsChannel {
    fn start(&mut self) -> Result<(), TlsError> {
        let conn = ClientConnection::new(self.client_config.clone(), self.server_name.clone())
            .map_err(|e| TlsError::Setup(e.to_string()))?;
        self.conn = Some(conn);
        self.eku_verified = false;
        Ok(())
    }

    fn put_cipher_text(&mut self, data: &[u8]) -> Result<(), TlsError> {
        let mut cursor = Cursor::new(data);
        loop {
            let conn = self.conn_mut()?;
            match conn.read_tls(&mut cursor) {
                Ok(0) => break,
                Ok(_) => {
                    let result = conn.process_new_packets();
                    if let Err(error) = result {
                        return Err(self.map_process_error(error));
                    }
                }
                Err(e) => return Err(TlsError::Handshake(e.to_string())),
            }
        }
        self.verify_eku_if_ready()
    }

    fn pull_cipher_text(&mut self) -> Result<Option<Vec<u8>>, TlsError> {
        let conn = self.conn_mut()?;
        if !conn.wants_write() {
            return Ok(None);
        }
        let mut out = Vec::new();
        while conn.wants_write() {
            conn.write_tls(&mut out)
                .map_err(|e| TlsError::Handshake(e.to_string()))?;
        }
        Ok(Some(out))
    }

    fn put_plain_text(&mut self, data: &[u8]) -> Result<(), TlsError> {
        self.conn_mut()?
            .writer()
            .write_all(data)
            .map_err(|e| TlsError::Handshake(e.to_string()))
    }

    fn pull_plain_text(&mut self) -> Result<Option<Vec<u8>>, TlsError> {
        let conn = self.conn_mut()?;
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            match conn.reader().read(&mut buf) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(TlsError::Handshake(e.to_string())),
            }
        }
        Ok((!out.is_empty()).then_some(out))
    }

    fn is_connected(&self) -> bool {
        self.eku_verified
            && self
                .conn
                .as_ref()
                .is_some_and(|conn| !conn.is_handshaking())
    }
}

/// Chain verification against the configured CA with the hostname check
/// relaxed. Rejections are recorded for error classification.
#[derive(Debug)]
struct CaVerifier {
    inner: Arc<WebPkiServerVerifier>,
    rejected: Arc<AtomicBool>,
}

impl ServerCertVerifier for CaVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        match self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        ) {
            Ok(verified) => Ok(verified),
            // OpenVPN peers are addressed by IP and pinned by CA; the
            // certificate subject is not required to match
            Err(rustls::Error::InvalidCertificate(CertificateError::NotValidForName)) => {
                Ok(ServerCertVerified::assertion())
            }
            Err(rustls::Error::InvalidCertificate(
                CertificateError::NotValidForNameContext { .. },
            )) => Ok(ServerCertVerified::assertion()),
            Err(error) => {
                self.rejected.store(true, Ordering::SeqCst);
                Err(error)
            }
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
